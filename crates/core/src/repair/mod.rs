//! Repair engine: finds torrents whose content went dead upstream and
//! re-creates them on the provider.

mod engine;
mod history;
mod types;

pub use engine::{RepairEngine, RepairStatus};
pub use history::{RepairHistory, DEFAULT_HISTORY_CAPACITY};
pub use types::{
    repair_channel, RepairError, RepairReason, RepairRequest, RepairRequests, RepairState,
    RepairTask, RepairTrigger,
};
