//! Types for repair operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::config::RepairStrategy;

/// Errors surfaced by the repair engine's public API.
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("Repair is disabled")]
    Disabled,

    #[error("Torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("Repair queue is full")]
    QueueFull,

    #[error("Repair engine is not running")]
    NotRunning,
}

/// Why a repair was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairReason {
    /// Periodic scan.
    Scheduled,
    /// A read or mint found this file broken.
    BrokenLink { path: String },
    /// Newly added torrent arrived in a failed state.
    Ingest,
    /// Requested through the API.
    Manual,
}

impl RepairReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairReason::Scheduled => "scheduled",
            RepairReason::BrokenLink { .. } => "broken_link",
            RepairReason::Ingest => "ingest",
            RepairReason::Manual => "manual",
        }
    }
}

/// A request to check one torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub torrent_id: String,
    pub reason: RepairReason,
}

/// Repair task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RepairState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairState::Pending => "pending",
            RepairState::Running => "running",
            RepairState::Succeeded => "succeeded",
            RepairState::Failed => "failed",
            RepairState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RepairState::Succeeded | RepairState::Failed | RepairState::Skipped
        )
    }
}

/// One repair task and, once finished, its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairTask {
    pub id: Uuid,
    pub torrent_id: String,
    #[serde(default)]
    pub torrent_name: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    pub strategy: RepairStrategy,
    pub reason: RepairReason,
    pub state: RepairState,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Paths found broken.
    #[serde(default)]
    pub broken_files: Vec<String>,
    /// Whether a reinsert was issued.
    #[serde(default)]
    pub reinserted: bool,
    /// Id of the torrent after a reinsert, when it changed.
    #[serde(default)]
    pub new_torrent_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RepairTask {
    pub fn new(request: RepairRequest, strategy: RepairStrategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            torrent_id: request.torrent_id,
            torrent_name: None,
            provider: None,
            strategy,
            reason: request.reason,
            state: RepairState::Pending,
            requested_at: Utc::now(),
            finished_at: None,
            broken_files: Vec::new(),
            reinserted: false,
            new_torrent_id: None,
            message: None,
        }
    }

    pub(crate) fn finish(&mut self, state: RepairState, message: impl Into<String>) {
        self.state = state;
        self.message = Some(message.into());
        self.finished_at = Some(Utc::now());
    }
}

/// Sending half of the repair request channel.
///
/// Cloned into every component that can spot a broken torrent. Sends never
/// block; a full queue drops the request with a warning.
#[derive(Debug, Clone)]
pub struct RepairTrigger {
    tx: mpsc::Sender<RepairRequest>,
}

impl RepairTrigger {
    /// Queue a request. Returns false if it was dropped.
    pub fn send(&self, torrent_id: &str, reason: RepairReason) -> bool {
        let request = RepairRequest {
            torrent_id: torrent_id.to_string(),
            reason,
        };
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(
                    "Repair queue full, dropping {} request for {}",
                    request.reason.as_str(),
                    request.torrent_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                warn!(
                    "Repair engine gone, dropping request for {}",
                    request.torrent_id
                );
                false
            }
        }
    }
}

/// Receiving half of the repair request channel, consumed by the engine.
#[derive(Debug)]
pub struct RepairRequests {
    rx: mpsc::Receiver<RepairRequest>,
}

impl RepairRequests {
    pub async fn recv(&mut self) -> Option<RepairRequest> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RepairRequest> {
        self.rx.try_recv().ok()
    }
}

/// Create the repair request channel.
pub fn repair_channel(capacity: usize) -> (RepairTrigger, RepairRequests) {
    let (tx, rx) = mpsc::channel(capacity);
    (RepairTrigger { tx }, RepairRequests { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_terminal() {
        assert!(!RepairState::Pending.is_terminal());
        assert!(!RepairState::Running.is_terminal());
        assert!(RepairState::Succeeded.is_terminal());
        assert!(RepairState::Skipped.is_terminal());
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&RepairReason::BrokenLink {
            path: "a.mkv".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"broken_link","path":"a.mkv"}"#);
    }

    #[test]
    fn test_trigger_drops_when_full() {
        let (trigger, mut requests) = repair_channel(1);
        assert!(trigger.send("T1", RepairReason::Manual));
        assert!(!trigger.send("T2", RepairReason::Manual));

        let request = requests.try_recv().unwrap();
        assert_eq!(request.torrent_id, "T1");
        assert!(requests.try_recv().is_none());
    }

    #[test]
    fn test_trigger_closed_channel() {
        let (trigger, requests) = repair_channel(4);
        drop(requests);
        assert!(!trigger.send("T1", RepairReason::Scheduled));
    }

    #[test]
    fn test_task_finish_sets_outcome() {
        let mut task = RepairTask::new(
            RepairRequest {
                torrent_id: "T1".to_string(),
                reason: RepairReason::Manual,
            },
            RepairStrategy::PerFile,
        );
        assert_eq!(task.state, RepairState::Pending);
        task.finish(RepairState::Skipped, "excluded");
        assert_eq!(task.state, RepairState::Skipped);
        assert!(task.finished_at.is_some());
        assert_eq!(task.message.as_deref(), Some("excluded"));
    }
}
