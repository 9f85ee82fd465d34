//! Reconciling one provider's upstream torrent list into the store.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::memory::{merge, TorrentStore};
use super::types::Torrent;
use crate::metrics;

/// What a reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub provider: String,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// (torrent id, path) of files dropped or changed inside updated torrents.
    pub removed_files: Vec<(String, String)>,
    pub unchanged: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

impl TorrentStore {
    /// Make the store's view of `provider` match `upstream`.
    ///
    /// Only torrents owned by `provider` are touched. Every change lands in
    /// one snapshot swap; a run that finds nothing to do publishes nothing.
    pub fn reconcile(&self, provider: &str, upstream: Vec<Torrent>) -> ReconcileReport {
        let report = self.mutate(|torrents| {
            let mut report = ReconcileReport {
                provider: provider.to_string(),
                ..Default::default()
            };

            let upstream_ids: HashSet<String> = upstream.iter().map(|t| t.id.clone()).collect();

            for mut torrent in upstream {
                torrent.provider = provider.to_string();
                match torrents.get(&torrent.id) {
                    None => {
                        report.added.push(torrent.id.clone());
                        torrents.insert(torrent.id.clone(), Arc::new(torrent));
                    }
                    Some(stored) if stored.provider != provider => {
                        warn!(
                            "Torrent id {} from {} is already held by {}, ignoring",
                            torrent.id, provider, stored.provider
                        );
                    }
                    Some(stored) => match merge(stored, torrent) {
                        Some((merged, stale)) => {
                            report.removed_files.extend(
                                stale.into_iter().map(|path| (merged.id.clone(), path)),
                            );
                            report.updated.push(merged.id.clone());
                            torrents.insert(merged.id.clone(), Arc::new(merged));
                        }
                        None => report.unchanged += 1,
                    },
                }
            }

            let gone: Vec<String> = torrents
                .values()
                .filter(|t| t.provider == provider && !upstream_ids.contains(&t.id))
                .map(|t| t.id.clone())
                .collect();
            for id in gone {
                torrents.remove(&id);
                report.removed.push(id);
            }

            let changed = !report.is_noop();
            (report, changed)
        });

        for (kind, count) in [
            ("added", report.added.len()),
            ("updated", report.updated.len()),
            ("removed", report.removed.len()),
        ] {
            if count > 0 {
                metrics::RECONCILE_CHANGES
                    .with_label_values(&[provider, kind])
                    .inc_by(count as u64);
            }
        }
        report
    }
}
