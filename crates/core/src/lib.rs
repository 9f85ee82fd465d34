pub mod config;
pub mod content;
pub mod engine;
pub mod links;
pub mod metrics;
pub mod provider;
pub mod repair;
pub mod schedule;
pub mod store;
pub mod testing;
pub mod vfs;

pub use config::{
    load_config, load_config_from_str, load_or_create, validate_config, AuthStore, Config,
    ConfigError, EngineSettings, SanitizedConfig, SharedConfig,
};
pub use content::{ByteRange, ContentSource, ContentStream, HttpContentSource};
pub use engine::{Engine, EngineError, EngineStatus};
pub use links::{CachedLink, LinkCache, LinkCacheStats, LinkKey, LinkRefresher};
pub use provider::{
    Budget, DebridClient, DebridError, Provider, ProviderLease, ProviderPool, ProviderStatus,
    RealDebridClient,
};
pub use repair::{
    RepairEngine, RepairError, RepairReason, RepairRequest, RepairState, RepairStatus, RepairTask,
};
pub use store::{Torrent, TorrentFile, TorrentStatus, TorrentStore, TorrentSummary};
pub use vfs::{DirEntry, DirListing, FileStream, VfsError, VirtualFs};
