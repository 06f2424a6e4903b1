//! Session event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, UIs, audit trails) can follow a session
//! without the pipeline depending on them.

use serde::{Deserialize, Serialize};

/// Events emitted while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    SessionStarted {
        session_id: String,
        phase: String,
    },
    SessionSaved {
        session_id: String,
        passed_tasks: usize,
        abandoned_tasks: usize,
        invocations: usize,
        duration_ms: u64,
    },
    SessionFailed {
        session_id: String,
        last_stage: Option<String>,
        error: String,
    },
    SessionCancelled {
        session_id: String,
        last_stage: Option<String>,
    },
    StageStarted {
        session_id: String,
        stage: String,
        invocation: usize,
    },
    StageCompleted {
        session_id: String,
        stage: String,
        fields: Vec<String>,
        duration_ms: u64,
    },
    StageFailed {
        session_id: String,
        stage: String,
        error: String,
    },
    RouteSelected {
        session_id: String,
        phase: String,
        next: String,
    },
    AttemptFailed {
        session_id: String,
        task: usize,
        attempt: usize,
        kind: String,
    },
    TaskAdvanced {
        session_id: String,
        task: usize,
        status: String,
    },
    CheckpointSaved {
        session_id: String,
        task: usize,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::StageStarted {
            session_id: "calc_1".into(),
            stage: "plan".into(),
            invocation: 1,
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::StageStarted {
                session_id,
                stage,
                invocation,
            } => {
                assert_eq!(session_id, "calc_1");
                assert_eq!(stage, "plan");
                assert_eq!(invocation, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(PipelineEvent::CheckpointSaved {
            session_id: "s".into(),
            task: 0,
        });

        let json1 = serde_json::to_string(&rx1.recv().await.unwrap()).unwrap();
        let json2 = serde_json::to_string(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(PipelineEvent::SessionFailed {
            session_id: "oops".into(),
            last_stage: Some("save".into()),
            error: "disk full".into(),
        });
    }
}
