//! Three-lane priority queue dispatcher.
//!
//! Lanes are strictly prioritized (urgent > normal > background) with the
//! guarantee that interactive work is never starved by batch work. Per-lane
//! running limits and the global worker cap are derived from live
//! `queue_items` rows on every call, so independent dispatcher processes
//! sharing one database enforce the same limits without in-process
//! semaphores.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::claim::ClaimStore;
use crate::db::DbHandle;
use crate::errors::DispatchError;
use crate::events::{CoreEvent, EventSender, emit};
use crate::lease::LeaseManager;
use crate::models::{PrioritySource, QueueItem, QueueItemStatus, QueueLane, now_ms};

/// Estimated duration above which a task is classified background.
pub const BACKGROUND_DURATION_THRESHOLD_MS: i64 = 60_000;

/// Queued age past which an urgent item counts as a starvation violation.
pub const URGENT_WAIT_THRESHOLD_MS: i64 = 5_000;

/// Dispatcher limits. All counts are of `running` items.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub urgent_limit: usize,
    pub normal_limit: usize,
    pub background_limit: usize,
    /// Global cap on running items across all lanes.
    pub max_workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            urgent_limit: 2,
            normal_limit: 4,
            background_limit: 2,
            max_workers: 4,
        }
    }
}

impl DispatcherConfig {
    pub fn limit_for(&self, lane: QueueLane) -> usize {
        match lane {
            QueueLane::Urgent => self.urgent_limit,
            QueueLane::Normal => self.normal_limit,
            QueueLane::Background => self.background_limit,
        }
    }
}

/// Enqueue request. Classification inputs ride along with the task id.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub task_id: String,
    /// Lane the caller asked for, if any.
    pub lane: Option<QueueLane>,
    /// Interactive / user-blocking work.
    pub interactive: bool,
    /// Important but not user-blocking.
    pub critical: bool,
    pub estimated_duration_ms: Option<i64>,
}

impl DispatchRequest {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            ..Default::default()
        }
    }
}

/// Result of a worker-cap pass.
#[derive(Debug, Clone, Default)]
pub struct CapEnforcement {
    pub enforced: bool,
    /// How many running items were demoted back to queued.
    pub released: usize,
    pub released_task_ids: Vec<String>,
}

/// Advisory report from `verify_interactive_priority`.
#[derive(Debug, Clone)]
pub struct InteractiveReport {
    pub urgent_running: usize,
    pub urgent_limit: usize,
    /// Urgent lane is at its limit while urgent work still waits.
    pub saturated: bool,
    /// Urgent items queued longer than [`URGENT_WAIT_THRESHOLD_MS`].
    pub overdue: Vec<QueueItem>,
}

impl InteractiveReport {
    pub fn ok(&self) -> bool {
        !self.saturated && self.overdue.is_empty()
    }
}

/// The dispatcher. Cheap to construct; all state lives in the store.
pub struct PriorityDispatcher {
    db: DbHandle,
    leases: Arc<LeaseManager>,
    claims: Arc<ClaimStore>,
    config: DispatcherConfig,
    events: Option<EventSender>,
}

impl PriorityDispatcher {
    pub fn new(
        db: DbHandle,
        leases: Arc<LeaseManager>,
        claims: Arc<ClaimStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            db,
            leases,
            claims,
            config,
            events: None,
        }
    }

    /// Set the event channel for cap-enforcement telemetry.
    pub fn with_event_channel(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Classify a request into a lane. First match wins: interactive beats
    /// everything (including a conflicting explicit lane, which is logged,
    /// never silently dropped), then critical, then the duration threshold.
    fn classify(&self, req: &DispatchRequest) -> (QueueLane, PrioritySource) {
        if req.interactive {
            return match req.lane {
                Some(lane) if lane != QueueLane::Urgent => {
                    warn!(
                        task_id = req.task_id.as_str(),
                        requested = %lane,
                        "interactive task overrides explicit lane; dispatching urgent"
                    );
                    (QueueLane::Urgent, PrioritySource::Classifier)
                }
                Some(_) => (QueueLane::Urgent, PrioritySource::Explicit),
                None => (QueueLane::Urgent, PrioritySource::Classifier),
            };
        }
        if let Some(lane) = req.lane {
            return (lane, PrioritySource::Explicit);
        }
        if req.critical {
            return (QueueLane::Normal, PrioritySource::Classifier);
        }
        if req.estimated_duration_ms.unwrap_or(0) > BACKGROUND_DURATION_THRESHOLD_MS {
            return (QueueLane::Background, PrioritySource::Classifier);
        }
        (QueueLane::Normal, PrioritySource::Classifier)
    }

    /// Classify and enqueue a task. Returns the persisted queue item.
    pub async fn dispatch_task(&self, req: DispatchRequest) -> Result<QueueItem> {
        let (lane, source) = self.classify(&req);
        let item = QueueItem::new(&req.task_id, lane, source);
        let stored = item.clone();
        self.db
            .call(move |store| {
                store.insert_queue_item(&stored)?;
                // Re-dispatching a cancelled task lifts its blocked overlay.
                if store.get_task(&stored.task_id)?.is_some() {
                    store.set_task_blocked(&stored.task_id, false)?;
                }
                Ok(())
            })
            .await?;
        Ok(item)
    }

    /// Select up to `max_tasks` queued items eligible to start right now.
    ///
    /// Runs the worker-cap pass first, then drains urgent fully before
    /// normal before background. Each lane contributes at most its
    /// remaining headroom, oldest-enqueued-first. Returned items are still
    /// `queued`; callers start them with [`start_task`](Self::start_task).
    pub async fn get_next_batch(&self, max_tasks: usize) -> Result<Vec<QueueItem>> {
        self.enforce_worker_cap(self.config.max_workers).await?;

        let queued = self
            .db
            .call(move |store| store.list_queue_items(Some(QueueItemStatus::Queued)))
            .await?;
        let total_running = self.db.call(move |store| store.count_running()).await?;
        let mut global_headroom = self
            .config
            .max_workers
            .saturating_sub(total_running)
            .min(max_tasks);

        let mut batch = Vec::new();
        for lane in QueueLane::PRIORITY_ORDER {
            if global_headroom == 0 {
                break;
            }
            let running = self
                .db
                .call(move |store| store.count_running_in_lane(lane))
                .await?;
            let mut headroom = self.config.limit_for(lane).saturating_sub(running);

            // list_queue_items returns oldest-enqueued-first already.
            for item in queued.iter().filter(|i| i.lane == lane) {
                if headroom == 0 || global_headroom == 0 {
                    break;
                }
                batch.push(item.clone());
                headroom -= 1;
                global_headroom -= 1;
            }
        }
        Ok(batch)
    }

    /// Demote running items back to queued until the global running total is
    /// within `max_workers`, oldest-started-first.
    pub async fn enforce_worker_cap(&self, max_workers: usize) -> Result<CapEnforcement> {
        let mut running = self
            .db
            .call(move |store| store.list_queue_items(Some(QueueItemStatus::Running)))
            .await?;
        if running.len() <= max_workers {
            return Ok(CapEnforcement::default());
        }

        running.sort_by_key(|i| i.started_at_ms.unwrap_or(0));
        let excess = running.len() - max_workers;
        let mut released_task_ids = Vec::with_capacity(excess);
        for item in running.into_iter().take(excess) {
            let mut demoted = item;
            demoted.status = QueueItemStatus::Queued;
            demoted.started_at_ms = None;
            released_task_ids.push(demoted.task_id.clone());
            self.db
                .call(move |store| store.update_queue_item(&demoted))
                .await?;
        }

        warn!(
            released = excess,
            task_ids = ?released_task_ids,
            "worker cap exceeded; demoted running items back to queued"
        );
        emit(
            &self.events,
            CoreEvent::WorkerCapEnforced {
                released_count: excess,
                task_ids: released_task_ids.clone(),
            },
        )
        .await;
        Ok(CapEnforcement {
            enforced: true,
            released: excess,
            released_task_ids,
        })
    }

    /// Mark a task's queued item running.
    pub async fn start_task(&self, task_id: &str) -> Result<QueueItem, DispatchError> {
        let mut item = self.open_item(task_id).await?;
        if item.status != QueueItemStatus::Queued {
            return Err(DispatchError::InvalidItemStatus {
                task_id: task_id.to_string(),
                status: item.status.to_string(),
                expected: QueueItemStatus::Queued.to_string(),
            });
        }
        item.status = QueueItemStatus::Running;
        item.started_at_ms = Some(now_ms());
        self.persist(&item).await?;
        Ok(item)
    }

    /// Mark a task's running item completed, recording duration and notes.
    /// When `duration_ms` is absent it is derived from the start timestamp.
    pub async fn complete_task(
        &self,
        task_id: &str,
        duration_ms: Option<i64>,
        notes: Option<String>,
    ) -> Result<QueueItem, DispatchError> {
        let mut item = self.open_item(task_id).await?;
        if item.status != QueueItemStatus::Running {
            return Err(DispatchError::InvalidItemStatus {
                task_id: task_id.to_string(),
                status: item.status.to_string(),
                expected: QueueItemStatus::Running.to_string(),
            });
        }
        let now = now_ms();
        item.status = QueueItemStatus::Completed;
        item.completed_at_ms = Some(now);
        item.duration_ms =
            duration_ms.or_else(|| item.started_at_ms.map(|s| now.saturating_sub(s)));
        item.notes = notes;
        self.persist(&item).await?;
        Ok(item)
    }

    /// Cancel a task's open queue item and release any lease or claim it
    /// holds. Cooperative: an in-flight worker notices at its next
    /// checkpoint; nothing is pre-empted.
    pub async fn cancel_task(
        &self,
        task_id: &str,
        reason: &str,
    ) -> Result<QueueItem, DispatchError> {
        let mut item = self.open_item(task_id).await?;
        item.status = QueueItemStatus::Cancelled;
        item.completed_at_ms = Some(now_ms());
        item.notes = Some(reason.to_string());
        self.persist(&item).await?;

        // Cancelled tasks surface as blocked in the coarse status until
        // something re-dispatches them. The task row may already be gone if
        // another process pruned it.
        let tid = task_id.to_string();
        self.db
            .call(move |store| {
                if store.get_task(&tid)?.is_some() {
                    store.set_task_blocked(&tid, true)?;
                }
                Ok(())
            })
            .await?;

        self.leases.release_all_for_task(task_id).await?;
        if let Some(owner) = self.claims.get_owner(task_id).await? {
            self.claims.release(task_id, &owner).await?;
        }
        Ok(item)
    }

    /// Advisory starvation check on the urgent lane.
    pub async fn verify_interactive_priority(&self) -> Result<InteractiveReport> {
        let urgent_running = self
            .db
            .call(|store| store.count_running_in_lane(QueueLane::Urgent))
            .await?;
        let queued = self
            .db
            .call(|store| store.list_queue_items(Some(QueueItemStatus::Queued)))
            .await?;
        let now = now_ms();

        let waiting: Vec<&QueueItem> = queued.iter().filter(|i| i.lane == QueueLane::Urgent).collect();
        let saturated = urgent_running >= self.config.urgent_limit && !waiting.is_empty();
        let overdue: Vec<QueueItem> = waiting
            .into_iter()
            .filter(|i| i.queued_age_ms(now) > URGENT_WAIT_THRESHOLD_MS)
            .cloned()
            .collect();

        Ok(InteractiveReport {
            urgent_running,
            urgent_limit: self.config.urgent_limit,
            saturated,
            overdue,
        })
    }

    async fn open_item(&self, task_id: &str) -> Result<QueueItem, DispatchError> {
        let tid = task_id.to_string();
        self.db
            .call(move |store| store.get_open_queue_item(&tid))
            .await?
            .ok_or_else(|| DispatchError::ItemNotFound(task_id.to_string()))
    }

    async fn persist(&self, item: &QueueItem) -> Result<()> {
        let item = item.clone();
        self.db
            .call(move |store| store.update_queue_item(&item))
            .await
    }
}
