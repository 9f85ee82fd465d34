//! Download link cache and its refresh scheduler.

mod cache;
mod refresher;
mod types;

pub use cache::{LinkCache, LinkCacheStats};
pub use refresher::{LinkRefresher, RefreshReport};
pub use types::{CachedLink, LinkKey};
