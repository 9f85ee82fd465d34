//! Download key rotation.
//!
//! A provider may carry several download keys. Links are minted with the
//! next usable key in round-robin order; a key whose traffic quota is spent
//! is benched for a cooldown and skipped until it expires.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a key stays benched after the provider reports its traffic
/// exhausted.
pub const KEY_BENCH_DURATION: Duration = Duration::from_secs(60 * 60);

struct KeyState {
    key: String,
    benched_until: Option<Instant>,
}

struct KeyRing {
    keys: Vec<KeyState>,
    next: usize,
}

pub struct DownloadKeys {
    ring: Mutex<KeyRing>,
}

impl DownloadKeys {
    pub fn new(keys: &[String]) -> Self {
        Self {
            ring: Mutex::new(KeyRing {
                keys: keys
                    .iter()
                    .map(|k| KeyState {
                        key: k.clone(),
                        benched_until: None,
                    })
                    .collect(),
                next: 0,
            }),
        }
    }

    /// Next key not currently benched, or `None` if all are.
    pub fn next_key(&self) -> Option<String> {
        let mut ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let len = ring.keys.len();
        for offset in 0..len {
            let index = (ring.next + offset) % len;
            let state = &mut ring.keys[index];
            if let Some(until) = state.benched_until {
                if until > now {
                    continue;
                }
                state.benched_until = None;
            }
            let key = state.key.clone();
            ring.next = (index + 1) % len;
            return Some(key);
        }
        None
    }

    /// Bench `key` for `duration`.
    pub fn bench(&self, key: &str, duration: Duration) {
        let mut ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let until = Instant::now() + duration;
        for state in ring.keys.iter_mut().filter(|s| s.key == key) {
            state.benched_until = Some(until);
        }
    }

    /// (usable, total)
    pub fn counts(&self) -> (usize, usize) {
        let ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let usable = ring
            .keys
            .iter()
            .filter(|s| s.benched_until.map_or(true, |until| until <= now))
            .count();
        (usable, ring.keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> DownloadKeys {
        DownloadKeys::new(&names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_round_robin() {
        let keys = keys(&["a", "b", "c"]);
        assert_eq!(keys.next_key().as_deref(), Some("a"));
        assert_eq!(keys.next_key().as_deref(), Some("b"));
        assert_eq!(keys.next_key().as_deref(), Some("c"));
        assert_eq!(keys.next_key().as_deref(), Some("a"));
    }

    #[test]
    fn test_benched_key_is_skipped() {
        let keys = keys(&["a", "b"]);
        keys.bench("a", KEY_BENCH_DURATION);
        assert_eq!(keys.next_key().as_deref(), Some("b"));
        assert_eq!(keys.next_key().as_deref(), Some("b"));
        assert_eq!(keys.counts(), (1, 2));
    }

    #[test]
    fn test_all_benched_yields_none() {
        let keys = keys(&["a"]);
        keys.bench("a", KEY_BENCH_DURATION);
        assert!(keys.next_key().is_none());
        assert!(DownloadKeys::new(&[]).next_key().is_none());
    }

    #[test]
    fn test_bench_expires() {
        let keys = keys(&["a"]);
        keys.bench("a", Duration::ZERO);
        assert_eq!(keys.next_key().as_deref(), Some("a"));
    }
}
