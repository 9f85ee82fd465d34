//! Token bucket rate limiting for provider budgets.

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use super::types::Budget;
use crate::config::RateSpec;

/// Rate limit status for one budget.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub budget: Budget,
    /// `None` when the budget is unlimited.
    pub limit: Option<String>,
    pub tokens_available: f64,
    pub next_available_in_ms: Option<u64>,
}

/// Token bucket for a single budget.
///
/// Tokens are added at a constant rate and consumed per request. The bucket
/// starts full, so a burst up to the capacity is allowed immediately.
pub struct TokenBucket {
    /// Max tokens (= requests per window).
    capacity: f64,
    /// Current available tokens.
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last refill time.
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(spec: RateSpec) -> Self {
        let capacity = spec.count as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: spec.per_second(),
            last_refill: Instant::now(),
        }
    }

    /// Try to take a token.
    ///
    /// Returns `Err(wait)` with the time until one is available.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.wait_for_token())
        }
    }

    pub fn tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn wait_for_token(&self) -> Duration {
        let tokens_needed = 1.0 - self.tokens;
        Duration::from_secs_f64(tokens_needed / self.refill_rate)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// One budget's limiter. An absent spec means unlimited.
pub struct BudgetLimiter {
    budget: Budget,
    spec: Option<RateSpec>,
    bucket: Option<Mutex<TokenBucket>>,
}

impl BudgetLimiter {
    pub fn new(budget: Budget, spec: Option<RateSpec>) -> Self {
        Self {
            budget,
            spec,
            bucket: spec.map(|s| Mutex::new(TokenBucket::new(s))),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Wait for a token, giving up after `timeout`.
    ///
    /// Gives up early when the next token would only arrive after the
    /// deadline. Returns `false` on timeout.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        let Some(bucket) = &self.bucket else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        loop {
            let wait = match bucket.lock().await.try_acquire() {
                Ok(()) => return true,
                Err(wait) => wait,
            };
            if Instant::now() + wait > deadline {
                return false;
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token only if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        match &self.bucket {
            Some(bucket) => bucket.lock().await.try_acquire().is_ok(),
            None => true,
        }
    }

    /// Whether a token is available right now, without taking it.
    pub async fn has_capacity(&self) -> bool {
        match &self.bucket {
            Some(bucket) => bucket.lock().await.tokens() >= 1.0,
            None => true,
        }
    }

    pub async fn status(&self) -> RateLimitStatus {
        match &self.bucket {
            Some(bucket) => {
                let mut bucket = bucket.lock().await;
                let tokens = bucket.tokens();
                RateLimitStatus {
                    budget: self.budget,
                    limit: self.spec.map(|s| s.to_string()),
                    tokens_available: tokens,
                    next_available_in_ms: if tokens >= 1.0 {
                        None
                    } else {
                        Some(bucket.wait_for_token().as_millis() as u64)
                    },
                }
            }
            None => RateLimitStatus {
                budget: self.budget,
                limit: None,
                tokens_available: f64::INFINITY,
                next_available_in_ms: None,
            },
        }
    }
}

/// The three independent budgets of one provider.
pub struct Budgets {
    general: BudgetLimiter,
    download: BudgetLimiter,
    repair: BudgetLimiter,
}

impl Budgets {
    pub fn new(
        general: Option<RateSpec>,
        download: Option<RateSpec>,
        repair: Option<RateSpec>,
    ) -> Self {
        Self {
            general: BudgetLimiter::new(Budget::General, general),
            download: BudgetLimiter::new(Budget::Download, download),
            repair: BudgetLimiter::new(Budget::Repair, repair),
        }
    }

    pub fn get(&self, budget: Budget) -> &BudgetLimiter {
        match budget {
            Budget::General => &self.general,
            Budget::Download => &self.download,
            Budget::Repair => &self.repair,
        }
    }

    pub async fn status(&self) -> Vec<RateLimitStatus> {
        vec![
            self.general.status().await,
            self.download.status().await,
            self.repair.status().await,
        ]
    }
}
