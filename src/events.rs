//! Telemetry events emitted by the core.
//!
//! The state machine, lease manager, claim store, and dispatcher each hold
//! an optional sender and publish after the fact; they know nothing about
//! subscribers. Sinks (log shippers, dashboards) live outside the core.

use crate::phase::{TaskPhase, TransitionKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events produced by the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A task moved between phases.
    PhaseTransition {
        task_id: String,
        from: TaskPhase,
        to: TaskPhase,
        kind: TransitionKind,
    },
    /// A task backtracked to an earlier phase for rework. The wire tag is
    /// plural; sinks aggregate these as a rework counter.
    #[serde(rename = "phase_backtracks")]
    PhaseBacktrack {
        task_id: String,
        from: TaskPhase,
        to: TaskPhase,
    },
    /// A lease acquisition gave up: the resource is held by a live holder.
    LeaseDenied { resource_key: String },
    /// A stale claim was taken over by a new agent.
    ClaimStaleReclaimed {
        task_id: String,
        previous_agent: String,
        new_agent: String,
    },
    /// The dispatcher demoted running items to stay under the worker cap.
    WorkerCapEnforced {
        released_count: usize,
        task_ids: Vec<String>,
    },
}

/// Sender half used by core components. Cloneable; `None` disables emission.
pub type EventSender = mpsc::Sender<CoreEvent>;

/// Create an event channel with the given buffer size.
pub fn channel(buffer: usize) -> (EventSender, mpsc::Receiver<CoreEvent>) {
    mpsc::channel(buffer)
}

/// Best-effort emit: a full or closed channel never fails core operations.
pub async fn emit(tx: &Option<EventSender>, event: CoreEvent) {
    if let Some(tx) = tx {
        tx.send(event).await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_snake_case_tags() {
        let event = CoreEvent::PhaseTransition {
            task_id: "T1".into(),
            from: TaskPhase::Implement,
            to: TaskPhase::Verify,
            kind: TransitionKind::Forward,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"phase_transition\""));
        assert!(json.contains("\"implement\""));

        let event = CoreEvent::WorkerCapEnforced {
            released_count: 2,
            task_ids: vec!["T1".into(), "T2".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("worker_cap_enforced"));
    }

    #[test]
    fn test_backtrack_event_uses_plural_tag() {
        let event = CoreEvent::PhaseBacktrack {
            task_id: "T1".into(),
            from: TaskPhase::Verify,
            to: TaskPhase::Plan,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"phase_backtracks\""));
    }

    #[tokio::test]
    async fn test_emit_is_best_effort() {
        // No channel configured: must be a no-op.
        emit(&None, CoreEvent::LeaseDenied {
            resource_key: "k".into(),
        })
        .await;

        // Closed receiver: send error is swallowed.
        let (tx, rx) = channel(1);
        drop(rx);
        emit(&Some(tx), CoreEvent::LeaseDenied {
            resource_key: "k".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut rx) = channel(8);
        let tx = Some(tx);
        emit(&tx, CoreEvent::LeaseDenied {
            resource_key: "a".into(),
        })
        .await;
        emit(&tx, CoreEvent::LeaseDenied {
            resource_key: "b".into(),
        })
        .await;

        match rx.recv().await.unwrap() {
            CoreEvent::LeaseDenied { resource_key } => assert_eq!(resource_key, "a"),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            CoreEvent::LeaseDenied { resource_key } => assert_eq!(resource_key, "b"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
