//! Debrid providers: the client trait, per-provider rate budgets and the
//! pool that picks which provider serves a call.

mod keys;
mod pool;
mod rate_limit;
mod realdebrid;
mod types;

pub use keys::{DownloadKeys, KEY_BENCH_DURATION};
pub use pool::{Provider, ProviderLease, ProviderPool, ProviderStatus};
pub use rate_limit::{BudgetLimiter, Budgets, RateLimitStatus, TokenBucket};
pub use realdebrid::{RealDebridClient, DEFAULT_API_URL};
pub use types::{Budget, DebridClient, DebridError};
