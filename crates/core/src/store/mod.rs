//! Torrent store: the in-memory record of every known torrent, its
//! persistence to disk and its reconciliation against providers.

mod memory;
mod persist;
mod reconcile;
mod sync;
mod types;

pub use memory::{StoreSnapshot, TorrentStore, UpsertOutcome};
pub use persist::{load, save, PersistWriter, DEFAULT_PERSIST_DEBOUNCE};
pub use reconcile::ReconcileReport;
pub use sync::{SyncReport, TorrentSync};
pub use types::{StoreError, Torrent, TorrentFile, TorrentStatus, TorrentSummary};
