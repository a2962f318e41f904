//! Filing events
//!
//! Advisory notifications for logging and telemetry collaborators. Nothing in
//! the control flow depends on an event being received.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted by the providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilingEvent {
    FileCreated {
        path: String,
        provider: &'static str,
    },
    FileUpdated {
        path: String,
        provider: &'static str,
    },
    FileDeleted {
        path: String,
        provider: &'static str,
    },
    FileLocked {
        path: String,
        user_id: String,
        reason: String,
    },
    FileUnlocked {
        path: String,
        user_id: String,
    },
    /// Mirroring a lock change to the remote failed; the local lock stands.
    RemoteLockFailed {
        path: String,
        error: String,
    },
    FilePushed {
        path: String,
        remote_timestamp: String,
    },
    FilePulled {
        path: String,
        remote_timestamp: String,
    },
    /// The remote has nothing for a path that was pulled.
    FileNotOnRemote {
        path: String,
    },
    SyncConflict {
        path: String,
    },
    SyncError {
        path: String,
        error: String,
    },
    SyncCompleted {
        synced: usize,
        skipped: usize,
        failed: usize,
    },
    CommitQueued {
        commit_id: String,
        files: Vec<String>,
        user_id: String,
    },
    CommitCompleted {
        commit_id: String,
        sha: String,
        message: String,
    },
    CommitCancelled {
        commit_id: String,
        user_id: String,
    },
    /// A failed commit went back into the queue.
    CommitRequeued {
        commit_id: String,
        previous_id: String,
        error: String,
    },
    GitFetched {
        branch: String,
        ahead: usize,
        behind: usize,
    },
    GitPulled {
        branch: String,
        head: String,
    },
    GitPushed {
        branch: String,
    },
    /// Latest-wins reset to the remote tip.
    GitConflictsResolved {
        branch: String,
        head: String,
        /// Queued files whose working-tree content the reset may have replaced
        affected_pending_files: Vec<String>,
    },
}

/// Broadcast bus for `FilingEvent`s.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<FilingEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FilingEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: FilingEvent) {
        trace!(?event, "filing event");
        // Ignore errors when there are no active subscribers
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(FilingEvent::SyncConflict {
            path: "a.txt".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.emit(FilingEvent::GitPushed {
            branch: "main".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            FilingEvent::GitPushed {
                branch: "main".into()
            }
        );
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(FilingEvent::SyncConflict {
            path: "x".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "sync_conflict");
        assert_eq!(json["path"], "x");
    }
}
