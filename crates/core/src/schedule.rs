//! Background loop plumbing shared by the refreshers, the torrent sync and
//! the repair scanner.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::provider::DebridError;

/// Attempts made by scheduled upstream calls.
pub const RETRY_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles on every further attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Spawn a loop that runs `tick` every `interval` until shutdown.
///
/// The next sleep starts only after a tick finishes, so a slow tick delays
/// the following one instead of stacking.
pub fn spawn_periodic<F, Fut>(
    name: String,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        info!("{} loop started (every {:?})", name, interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("{} loop received shutdown signal", name);
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    tick().await;
                }
            }
        }
        info!("{} loop stopped", name);
    })
}

/// Guards a job against running twice at once.
#[derive(Debug, Default)]
pub struct RunGuard {
    busy: AtomicBool,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if a run is already in progress.
    pub fn try_claim(&self) -> Option<RunClaim<'_>> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(RunClaim { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

pub struct RunClaim<'a> {
    guard: &'a RunGuard,
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// Retry `op` on retryable errors with exponential backoff.
pub async fn retry_with_backoff<T, F, Fut>(what: &str, mut op: F) -> Result<T, DebridError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DebridError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < RETRY_ATTEMPTS => {
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    what, attempt, RETRY_ATTEMPTS, e, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                debug!("{} failed after {} attempts: {}", what, attempt, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn test_run_guard_skips_overlap() {
        let guard = RunGuard::new();
        let claim = guard.try_claim().unwrap();
        assert!(guard.is_busy());
        assert!(guard.try_claim().is_none());
        drop(claim);
        assert!(guard.try_claim().is_some());
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(DebridError::Timeout)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DebridError::TorrentNotFound("x".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_periodic_stops_on_shutdown() {
        let ticks = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic(
            "test".to_string(),
            Duration::from_millis(10),
            shutdown_rx,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}
