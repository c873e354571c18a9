//! Persisted record types shared by the store, dispatcher, and coordinator.

use crate::phase::{CoarseStatus, TaskPhase};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Current time as epoch milliseconds. All persisted timestamps use this.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A unit of work walked through the phase lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    /// Leaf phase the task currently sits in.
    pub current_phase: TaskPhase,
    /// True when the task has been cancelled or is waiting on a dependency;
    /// overlays the derived coarse status with `Blocked`.
    #[serde(default)]
    pub blocked: bool,
    /// Ids of tasks that must reach MONITOR before this one is dispatched.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Numeric priority hint; higher is more important. Lane classification
    /// may override it (see the dispatcher).
    #[serde(default)]
    pub priority: i64,
    /// Worker currently assigned, if any.
    #[serde(default)]
    pub assigned_worker: Option<String>,
    /// Free-form metadata (e.g. `required_capability`).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Task {
    /// Create a new task at the start of the lifecycle.
    pub fn new(id: &str, title: &str) -> Self {
        let now = now_ms();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            current_phase: TaskPhase::Strategize,
            blocked: false,
            dependencies: BTreeSet::new(),
            priority: 0,
            assigned_worker: None,
            metadata: BTreeMap::new(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Coarse legacy status: the static phase mapping, with the blocked
    /// overlay taking precedence.
    pub fn coarse_status(&self) -> CoarseStatus {
        if self.blocked {
            CoarseStatus::Blocked
        } else {
            self.current_phase.coarse_status()
        }
    }
}

/// A registered worker process driving an AI coding agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    /// Capability tags the worker advertises (e.g. "rust", "frontend").
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_tasks: usize,
    /// Task ids currently assigned to this worker.
    #[serde(default)]
    pub active_tasks: BTreeSet<String>,
    pub last_heartbeat_ms: i64,
    pub registered_at_ms: i64,
}

impl Worker {
    pub fn new(id: &str, capabilities: BTreeSet<String>, max_concurrent_tasks: usize) -> Self {
        let now = now_ms();
        Self {
            id: id.to_string(),
            capabilities,
            max_concurrent_tasks,
            active_tasks: BTreeSet::new(),
            last_heartbeat_ms: now,
            registered_at_ms: now,
        }
    }

    /// Whether the worker can take on another task.
    pub fn has_capacity(&self) -> bool {
        self.active_tasks.len() < self.max_concurrent_tasks
    }
}

/// Short-lived mutual-exclusion token over a resource key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_key: String,
    pub holder_id: String,
    pub acquired_at_ms: i64,
    pub ttl_ms: i64,
}

impl Lease {
    /// A lease older than its own TTL is stale and may be reclaimed.
    pub fn is_stale(&self, now: i64) -> bool {
        now.saturating_sub(self.acquired_at_ms) > self.ttl_ms
    }
}

/// Long-lived marker of which agent owns a task end-to-end.
///
/// Distinct from a [`Lease`]: the claim says "this worker is executing this
/// task", the lease says "this worker may mutate this phase right now". A
/// superseded worker that lost its claim may still be mid-write, so the
/// lease is checked independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClaim {
    pub task_id: String,
    pub agent_id: String,
    pub claimed_at_ms: i64,
    /// How long the agent expects the task to take end-to-end.
    pub expected_completion_ms: i64,
}

impl TaskClaim {
    /// A claim is stale once its age exceeds twice the expected completion
    /// time, at which point another agent may take it over.
    pub fn is_stale(&self, now: i64) -> bool {
        now.saturating_sub(self.claimed_at_ms) > 2 * self.expected_completion_ms
    }
}

/// Priority lane a queued task is dispatched through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueLane {
    /// Interactive / blocking work; never starved
    Urgent,
    /// Default lane
    #[default]
    Normal,
    /// Long batch work
    Background,
}

impl QueueLane {
    /// Lanes in strict dispatch-priority order.
    pub const PRIORITY_ORDER: [QueueLane; 3] =
        [QueueLane::Urgent, QueueLane::Normal, QueueLane::Background];
}

impl std::fmt::Display for QueueLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueLane::Urgent => write!(f, "urgent"),
            QueueLane::Normal => write!(f, "normal"),
            QueueLane::Background => write!(f, "background"),
        }
    }
}

impl std::str::FromStr for QueueLane {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(QueueLane::Urgent),
            "normal" => Ok(QueueLane::Normal),
            "background" => Ok(QueueLane::Background),
            other => Err(anyhow::anyhow!("unknown queue lane: {}", other)),
        }
    }
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Cancelled,
}

impl std::fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueItemStatus::Queued => write!(f, "queued"),
            QueueItemStatus::Running => write!(f, "running"),
            QueueItemStatus::Completed => write!(f, "completed"),
            QueueItemStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for QueueItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueItemStatus::Queued),
            "running" => Ok(QueueItemStatus::Running),
            "completed" => Ok(QueueItemStatus::Completed),
            "cancelled" => Ok(QueueItemStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown queue item status: {}", other)),
        }
    }
}

/// Where a queue item's lane assignment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrioritySource {
    /// Caller asked for this lane and the classifier agreed
    Explicit,
    /// The classifier chose (or overrode) the lane
    Classifier,
}

impl std::fmt::Display for PrioritySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrioritySource::Explicit => write!(f, "explicit"),
            PrioritySource::Classifier => write!(f, "classifier"),
        }
    }
}

impl std::str::FromStr for PrioritySource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(PrioritySource::Explicit),
            "classifier" => Ok(PrioritySource::Classifier),
            other => Err(anyhow::anyhow!("unknown priority source: {}", other)),
        }
    }
}

/// A task's position in the dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub task_id: String,
    pub lane: QueueLane,
    pub status: QueueItemStatus,
    pub priority_source: PrioritySource,
    pub enqueued_at_ms: i64,
    #[serde(default)]
    pub started_at_ms: Option<i64>,
    #[serde(default)]
    pub completed_at_ms: Option<i64>,
    /// Wall-clock duration reported on completion.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// Completion notes or cancellation reason.
    #[serde(default)]
    pub notes: Option<String>,
}

impl QueueItem {
    pub fn new(task_id: &str, lane: QueueLane, priority_source: PrioritySource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            lane,
            status: QueueItemStatus::Queued,
            priority_source,
            enqueued_at_ms: now_ms(),
            started_at_ms: None,
            completed_at_ms: None,
            duration_ms: None,
            notes: None,
        }
    }

    /// How long the item has been waiting, or 0 once it has started.
    pub fn queued_age_ms(&self, now: i64) -> i64 {
        match self.started_at_ms {
            Some(_) => 0,
            None => now.saturating_sub(self.enqueued_at_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_starts_pending_at_strategize() {
        let task = Task::new("T1", "Build the parser");
        assert_eq!(task.current_phase, TaskPhase::Strategize);
        assert_eq!(task.coarse_status(), CoarseStatus::Pending);
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_blocked_overlay_wins_over_phase_mapping() {
        let mut task = Task::new("T1", "x");
        task.current_phase = TaskPhase::Implement;
        task.blocked = true;
        assert_eq!(task.coarse_status(), CoarseStatus::Blocked);
        task.blocked = false;
        assert_eq!(task.coarse_status(), CoarseStatus::InProgress);
    }

    #[test]
    fn test_lease_staleness_uses_own_ttl() {
        let lease = Lease {
            resource_key: "task/T1/implement".into(),
            holder_id: "W1".into(),
            acquired_at_ms: 1_000,
            ttl_ms: 1_000,
        };
        assert!(!lease.is_stale(1_900));
        assert!(!lease.is_stale(2_000)); // exactly at TTL is not yet stale
        assert!(lease.is_stale(2_001));
    }

    #[test]
    fn test_claim_staleness_is_twice_expected_completion() {
        let claim = TaskClaim {
            task_id: "T1".into(),
            agent_id: "A1".into(),
            claimed_at_ms: 0,
            expected_completion_ms: 10_000,
        };
        assert!(!claim.is_stale(15_000));
        assert!(!claim.is_stale(20_000));
        assert!(claim.is_stale(20_001));
    }

    #[test]
    fn test_worker_capacity() {
        let mut worker = Worker::new("W1", BTreeSet::new(), 2);
        assert!(worker.has_capacity());
        worker.active_tasks.insert("T1".into());
        worker.active_tasks.insert("T2".into());
        assert!(!worker.has_capacity());
    }

    #[test]
    fn test_lane_priority_order() {
        assert_eq!(
            QueueLane::PRIORITY_ORDER,
            [QueueLane::Urgent, QueueLane::Normal, QueueLane::Background]
        );
    }

    #[test]
    fn test_queue_item_defaults() {
        let item = QueueItem::new("T1", QueueLane::Normal, PrioritySource::Classifier);
        assert_eq!(item.status, QueueItemStatus::Queued);
        assert!(item.started_at_ms.is_none());
        assert_eq!(item.id.len(), 36); // uuid v4
    }

    #[test]
    fn test_queued_age_zero_once_started() {
        let mut item = QueueItem::new("T1", QueueLane::Urgent, PrioritySource::Explicit);
        item.enqueued_at_ms = 1_000;
        assert_eq!(item.queued_age_ms(7_000), 6_000);
        item.started_at_ms = Some(2_000);
        assert_eq!(item.queued_age_ms(7_000), 0);
    }

    #[test]
    fn test_enum_columns_roundtrip_via_str() {
        use std::str::FromStr;
        for lane in QueueLane::PRIORITY_ORDER {
            assert_eq!(QueueLane::from_str(&lane.to_string()).unwrap(), lane);
        }
        for status in [
            QueueItemStatus::Queued,
            QueueItemStatus::Running,
            QueueItemStatus::Completed,
            QueueItemStatus::Cancelled,
        ] {
            assert_eq!(
                QueueItemStatus::from_str(&status.to_string()).unwrap(),
                status
            );
        }
    }
}
