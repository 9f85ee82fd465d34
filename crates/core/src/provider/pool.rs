//! Provider pool: configured providers, their budgets and slot accounting.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::keys::{DownloadKeys, KEY_BENCH_DURATION};
use super::rate_limit::{Budgets, RateLimitStatus};
use super::types::{Budget, DebridClient, DebridError};
use crate::config::ProviderSettings;
use crate::metrics;

/// Sentinel for "slot count not known yet".
const SLOTS_UNKNOWN: usize = usize::MAX;

/// Running counters for one provider.
#[derive(Default)]
struct Telemetry {
    successes: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time view of a provider for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub successes: u64,
    pub failures: u64,
    pub in_flight: usize,
    pub available_slots: Option<usize>,
    pub minimum_free_slot: usize,
    pub download_keys_usable: usize,
    pub download_keys_total: usize,
    pub last_error: Option<String>,
    pub budgets: Vec<RateLimitStatus>,
}

/// A configured provider: its client, budgets, keys and telemetry.
pub struct Provider {
    settings: ProviderSettings,
    client: Arc<dyn DebridClient>,
    budgets: Budgets,
    keys: DownloadKeys,
    available_slots: AtomicUsize,
    telemetry: Telemetry,
}

impl Provider {
    pub fn new(settings: ProviderSettings, client: Arc<dyn DebridClient>) -> Self {
        let budgets = Budgets::new(
            settings.rate_limit,
            settings.download_rate_limit,
            settings.repair_rate_limit,
        );
        let keys = DownloadKeys::new(&settings.download_keys);
        Self {
            settings,
            client,
            budgets,
            keys,
            available_slots: AtomicUsize::new(SLOTS_UNKNOWN),
            telemetry: Telemetry::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn client(&self) -> &Arc<dyn DebridClient> {
        &self.client
    }

    /// Take one token from `budget`, waiting at most `timeout`.
    pub async fn acquire(&self, budget: Budget, timeout: Duration) -> Result<(), DebridError> {
        if self.budgets.get(budget).acquire(timeout).await {
            return Ok(());
        }
        metrics::RATE_LIMIT_TIMEOUTS
            .with_label_values(&[self.name(), budget.as_str()])
            .inc();
        debug!("Rate limit timeout for {} ({} budget)", self.name(), budget);
        Err(DebridError::RateLimited {
            provider: self.name().to_string(),
            budget,
        })
    }

    /// Take one token from `budget` without waiting.
    pub async fn try_acquire(&self, budget: Budget) -> Result<(), DebridError> {
        if self.budgets.get(budget).try_acquire().await {
            Ok(())
        } else {
            Err(DebridError::RateLimited {
                provider: self.name().to_string(),
                budget,
            })
        }
    }

    /// Run an upstream call under `budget`, recording its outcome.
    pub async fn call<T, F, Fut>(
        &self,
        budget: Budget,
        timeout: Duration,
        op: F,
    ) -> Result<T, DebridError>
    where
        F: FnOnce(Arc<dyn DebridClient>) -> Fut,
        Fut: Future<Output = Result<T, DebridError>>,
    {
        self.acquire(budget, timeout).await?;
        let result = op(Arc::clone(&self.client)).await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        result
    }

    pub fn record_success(&self) {
        self.telemetry.successes.fetch_add(1, Ordering::Relaxed);
        metrics::PROVIDER_CALLS
            .with_label_values(&[self.name(), "success"])
            .inc();
    }

    pub fn record_failure(&self, error: &DebridError) {
        self.telemetry.failures.fetch_add(1, Ordering::Relaxed);
        metrics::PROVIDER_CALLS
            .with_label_values(&[self.name(), "failure"])
            .inc();
        if let Ok(mut last) = self.telemetry.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    /// Next usable download key.
    pub fn next_download_key(&self) -> Result<String, DebridError> {
        self.keys.next_key().ok_or_else(|| {
            DebridError::TrafficExceeded(format!(
                "all download keys for {} are exhausted",
                self.name()
            ))
        })
    }

    /// Bench a key whose traffic quota is spent.
    pub fn bench_key(&self, key: &str) {
        warn!("Download key for {} exhausted its traffic, benching", self.name());
        self.keys.bench(key, KEY_BENCH_DURATION);
        metrics::KEYS_BENCHED.with_label_values(&[self.name()]).inc();
    }

    pub fn available_slots(&self) -> Option<usize> {
        match self.available_slots.load(Ordering::Acquire) {
            SLOTS_UNKNOWN => None,
            n => Some(n),
        }
    }

    pub fn set_available_slots(&self, slots: usize) {
        self.available_slots
            .store(slots.min(SLOTS_UNKNOWN - 1), Ordering::Release);
        metrics::PROVIDER_SLOTS
            .with_label_values(&[self.name()])
            .set(slots as i64);
    }

    pub fn in_flight(&self) -> usize {
        self.telemetry.in_flight.load(Ordering::Acquire)
    }

    /// Free slots left once in-flight selections are counted.
    fn free_slots(&self) -> Option<usize> {
        self.available_slots()
            .map(|slots| slots.saturating_sub(self.in_flight()))
    }

    /// Reserve a slot if doing so keeps at least `minimum_free_slot` free.
    ///
    /// Providers whose slot count is still unknown are always eligible.
    fn try_reserve(&self) -> bool {
        let minimum = self.settings.minimum_free_slot;
        loop {
            let in_flight = self.telemetry.in_flight.load(Ordering::Acquire);
            if let Some(slots) = self.available_slots() {
                let free = slots.saturating_sub(in_flight);
                if free < minimum + 1 {
                    return false;
                }
            }
            if self
                .telemetry
                .in_flight
                .compare_exchange(in_flight, in_flight + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self) {
        self.telemetry.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub async fn status(&self) -> ProviderStatus {
        let (usable, total) = self.keys.counts();
        ProviderStatus {
            name: self.name().to_string(),
            successes: self.telemetry.successes.load(Ordering::Relaxed),
            failures: self.telemetry.failures.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            available_slots: self.available_slots(),
            minimum_free_slot: self.settings.minimum_free_slot,
            download_keys_usable: usable,
            download_keys_total: total,
            last_error: self
                .telemetry
                .last_error
                .lock()
                .ok()
                .and_then(|last| last.clone()),
            budgets: self.budgets.status().await,
        }
    }
}

/// A reserved slot on a provider, released when dropped.
pub struct ProviderLease {
    provider: Arc<Provider>,
}

impl ProviderLease {
    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }
}

impl std::fmt::Debug for ProviderLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderLease")
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl Deref for ProviderLease {
    type Target = Provider;

    fn deref(&self) -> &Provider {
        &self.provider
    }
}

impl Drop for ProviderLease {
    fn drop(&mut self) {
        self.provider.release();
    }
}

/// All configured providers, in configuration order.
pub struct ProviderPool {
    providers: Vec<Arc<Provider>>,
}

impl ProviderPool {
    /// Pair each provider's settings with its client, matched by name.
    pub fn new(
        settings: &[ProviderSettings],
        clients: Vec<Arc<dyn DebridClient>>,
    ) -> Result<Self, DebridError> {
        let mut by_name: HashMap<String, Arc<dyn DebridClient>> = clients
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();

        let mut providers = Vec::with_capacity(settings.len());
        for s in settings {
            let client = by_name
                .remove(&s.name)
                .ok_or_else(|| DebridError::UnknownProvider(s.name.clone()))?;
            providers.push(Arc::new(Provider::new(s.clone(), client)));
        }

        if let Some(extra) = by_name.into_keys().next() {
            return Err(DebridError::UnknownProvider(extra));
        }

        Ok(Self { providers })
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Result<Arc<Provider>, DebridError> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| DebridError::UnknownProvider(name.to_string()))
    }

    /// Providers whose torrents are exposed through the filesystem.
    pub fn webdav_providers(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.iter().filter(|p| p.settings().use_webdav)
    }

    /// Pick a provider with spare capacity and reserve a slot on it.
    ///
    /// Prefers providers with a token left in `budget`, then the most free
    /// slots; ties keep configuration order.
    pub async fn select_provider(&self, budget: Budget) -> Result<ProviderLease, DebridError> {
        let mut candidates = Vec::with_capacity(self.providers.len());
        for (order, provider) in self.providers.iter().enumerate() {
            let has_token = provider.budgets.get(budget).has_capacity().await;
            let free = provider.free_slots().unwrap_or(SLOTS_UNKNOWN);
            candidates.push((has_token, free, order, provider));
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        for (_, _, _, provider) in candidates {
            if provider.try_reserve() {
                debug!("Selected provider {} for {} call", provider.name(), budget);
                return Ok(ProviderLease {
                    provider: Arc::clone(provider),
                });
            }
        }
        Err(DebridError::NoProviderAvailable)
    }

    /// Ask `provider` for its free slot count and record it.
    pub async fn refresh_slots(
        &self,
        provider: &Provider,
        timeout: Duration,
    ) -> Result<usize, DebridError> {
        let slots = provider
            .call(Budget::General, timeout, |client| async move {
                client.available_slots().await
            })
            .await?;
        provider.set_available_slots(slots);
        Ok(slots)
    }

    pub async fn status(&self) -> Vec<ProviderStatus> {
        let mut statuses = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            statuses.push(provider.status().await);
        }
        statuses
    }
}
