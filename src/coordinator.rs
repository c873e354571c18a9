//! Worker coordinator: registration, heartbeats, assignment handout, and
//! the liveness sweep.
//!
//! The coordinator glues the dispatcher, claim store, and lease manager
//! together. It never runs task business logic itself; a claimed task is
//! handed to an external [`WorkerExecutor`] and the outcome comes back
//! through the completion API.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::claim::ClaimStore;
use crate::db::DbHandle;
use crate::dispatch::PriorityDispatcher;
use crate::errors::DispatchError;
use crate::lease::LeaseManager;
use crate::models::{QueueItem, QueueItemStatus, Task, Worker, now_ms};

/// Task metadata key naming a capability the assigned worker must have.
pub const REQUIRED_CAPABILITY_KEY: &str = "required_capability";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A worker silent for longer than this is presumed dead.
    pub liveness_timeout_ms: i64,
    /// How often the liveness sweep runs.
    pub liveness_interval_ms: u64,
    /// Claim horizon used when a task carries no duration estimate.
    pub default_expected_completion_ms: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 60_000,
            liveness_interval_ms: 10_000,
            default_expected_completion_ms: 600_000,
        }
    }
}

/// Outcome reported by an external executor.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub success: bool,
    pub artifacts: Vec<String>,
    pub error: Option<String>,
}

/// External task runner. The coordinator hands over a claimed task and
/// waits for the result; everything the executor does is outside the
/// core's synchronization scope.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<TaskResult>;
}

/// A claimed, started unit of work handed to a worker.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub task: Task,
    pub queue_item: QueueItem,
}

/// Read-only snapshot for status tooling.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusReport {
    pub workers: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
}

pub struct Coordinator {
    db: DbHandle,
    dispatcher: Arc<PriorityDispatcher>,
    claims: Arc<ClaimStore>,
    leases: Arc<LeaseManager>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        db: DbHandle,
        dispatcher: Arc<PriorityDispatcher>,
        claims: Arc<ClaimStore>,
        leases: Arc<LeaseManager>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            claims,
            leases,
            config,
        }
    }

    // =========================================================================
    // Worker registry
    // =========================================================================

    pub async fn register_worker(
        &self,
        id: &str,
        capabilities: BTreeSet<String>,
        max_concurrent_tasks: usize,
    ) -> Result<Worker> {
        let worker = Worker::new(id, capabilities, max_concurrent_tasks);
        let stored = worker.clone();
        self.db
            .call(move |store| store.upsert_worker(&stored))
            .await?;
        info!(worker_id = id, "worker registered");
        Ok(worker)
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let id = worker_id.to_string();
        self.db
            .call(move |store| store.touch_worker_heartbeat(&id, now_ms()))
            .await
    }

    /// Remove a worker, cancelling anything still assigned to it.
    pub async fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        let id = worker_id.to_string();
        let worker = self.db.call(move |store| store.get_worker(&id)).await?;
        if let Some(worker) = worker {
            for task_id in &worker.active_tasks {
                self.drop_assignment(task_id, "worker deregistered").await?;
            }
        }
        let id = worker_id.to_string();
        self.db.call(move |store| store.remove_worker(&id)).await
    }

    // =========================================================================
    // Assignment handout
    // =========================================================================

    /// Pick the next eligible task for a worker: dispatch order, then
    /// capability match, then dependency readiness, then a claim attempt.
    /// A lost claim race just moves on to the next candidate.
    pub async fn next_assignment(&self, worker_id: &str) -> Result<Option<Assignment>> {
        let wid = worker_id.to_string();
        let mut worker = self
            .db
            .call(move |store| store.get_worker(&wid))
            .await?
            .ok_or_else(|| anyhow::anyhow!("worker {} not registered", worker_id))?;
        if !worker.has_capacity() {
            return Ok(None);
        }

        let batch = self.dispatcher.get_next_batch(worker.max_concurrent_tasks).await?;
        for candidate in batch {
            let tid = candidate.task_id.clone();
            let task = match self.db.call(move |store| store.get_task(&tid)).await? {
                Some(task) => task,
                None => {
                    warn!(task_id = candidate.task_id.as_str(), "queued task has no record; skipping");
                    continue;
                }
            };
            if !self.worker_can_run(&worker, &task) {
                continue;
            }
            if !self.dependencies_done(&task).await? {
                debug!(task_id = task.id.as_str(), "dependencies not terminal yet");
                if !task.blocked {
                    let tid = task.id.clone();
                    self.db
                        .call(move |store| store.set_task_blocked(&tid, true))
                        .await?;
                }
                continue;
            }
            if !self
                .claims
                .claim(&task.id, worker_id, self.config.default_expected_completion_ms)
                .await?
            {
                debug!(task_id = task.id.as_str(), "claim lost to another worker");
                continue;
            }

            let queue_item = match self.dispatcher.start_task(&task.id).await {
                Ok(item) => item,
                Err(e) => {
                    // Another dispatcher raced us past the claim; give the
                    // claim back and keep looking.
                    warn!(task_id = task.id.as_str(), error = %e, "start failed after claim");
                    self.claims.release(&task.id, worker_id).await?;
                    continue;
                }
            };

            let tid = task.id.clone();
            let wid = worker_id.to_string();
            self.db
                .call(move |store| {
                    store.set_assigned_worker(&tid, Some(wid.as_str()))?;
                    store.set_task_blocked(&tid, false)
                })
                .await?;
            worker.active_tasks.insert(task.id.clone());
            let stored = worker.clone();
            self.db
                .call(move |store| store.upsert_worker(&stored))
                .await?;

            info!(worker_id, task_id = task.id.as_str(), "assignment handed out");
            return Ok(Some(Assignment { task, queue_item }));
        }
        Ok(None)
    }

    /// Take the next assignment, run it through the executor, and report
    /// the outcome. Returns `None` when no work is eligible.
    pub async fn run_next(
        &self,
        worker_id: &str,
        executor: &dyn WorkerExecutor,
    ) -> Result<Option<TaskResult>> {
        let assignment = match self.next_assignment(worker_id).await? {
            Some(a) => a,
            None => return Ok(None),
        };
        let started = now_ms();
        let result = match executor.execute(&assignment.task).await {
            Ok(result) => result,
            Err(e) => TaskResult {
                success: false,
                artifacts: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        self.complete_assignment(
            worker_id,
            &assignment.task.id,
            &result,
            Some(now_ms().saturating_sub(started)),
        )
        .await?;
        Ok(Some(result))
    }

    /// Report an assignment finished, releasing the claim, any leases, and
    /// the worker-side bookkeeping. Failed runs still complete the queue
    /// item; retrying is a new dispatch.
    pub async fn complete_assignment(
        &self,
        worker_id: &str,
        task_id: &str,
        result: &TaskResult,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        let notes = if result.success {
            (!result.artifacts.is_empty()).then(|| result.artifacts.join(", "))
        } else {
            Some(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "failed without detail".to_string()),
            )
        };
        match self.dispatcher.complete_task(task_id, duration_ms, notes).await {
            Ok(_) => {}
            // Cancelled out from under the worker; nothing left to complete.
            Err(DispatchError::ItemNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.claims.release(task_id, worker_id).await?;
        self.leases.release_all_for_task(task_id).await?;
        self.clear_worker_side(worker_id, task_id).await?;
        info!(worker_id, task_id, success = result.success, "assignment completed");
        Ok(())
    }

    /// Cancel an assignment cooperatively.
    pub async fn cancel_assignment(
        &self,
        worker_id: &str,
        task_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.drop_assignment(task_id, reason).await?;
        self.clear_worker_side(worker_id, task_id).await
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Spawn the periodic liveness sweep. The returned handle shuts the
    /// task down cooperatively.
    pub fn spawn_liveness_sweep(self: &Arc<Self>) -> LivenessHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);
        let interval = std::time::Duration::from_millis(coordinator.config.liveness_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.sweep_dead_workers().await {
                            warn!(error = %e, "liveness sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("liveness sweep shutting down");
                            break;
                        }
                    }
                }
            }
        });
        LivenessHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// One sweep pass: workers silent past the liveness timeout get their
    /// running items cancelled, claims released, and registry row removed.
    pub async fn sweep_dead_workers(&self) -> Result<Vec<String>> {
        let now = now_ms();
        let workers = self.db.call(|store| store.list_workers()).await?;
        let mut removed = Vec::new();
        for worker in workers {
            if now.saturating_sub(worker.last_heartbeat_ms) <= self.config.liveness_timeout_ms {
                continue;
            }
            warn!(
                worker_id = worker.id.as_str(),
                silent_ms = now - worker.last_heartbeat_ms,
                "worker missed liveness deadline; reclaiming its work"
            );
            for task_id in &worker.active_tasks {
                self.drop_assignment(task_id, "worker missed liveness deadline")
                    .await?;
            }
            let id = worker.id.clone();
            self.db.call(move |store| store.remove_worker(&id)).await?;
            removed.push(worker.id);
        }
        Ok(removed)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn get_status(&self) -> Result<StatusReport> {
        let workers = self.db.call(|store| store.list_workers()).await?.len();
        let active_tasks = self.db.call(|store| store.count_running()).await?;
        let queued_tasks = self
            .db
            .call(|store| store.list_queue_items(Some(QueueItemStatus::Queued)))
            .await?
            .len();
        Ok(StatusReport {
            workers,
            active_tasks,
            queued_tasks,
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn worker_can_run(&self, worker: &Worker, task: &Task) -> bool {
        match task.metadata.get(REQUIRED_CAPABILITY_KEY) {
            Some(cap) => worker.capabilities.contains(cap),
            None => true,
        }
    }

    /// Every dependency must exist and sit at the terminal phase.
    async fn dependencies_done(&self, task: &Task) -> Result<bool> {
        for dep_id in &task.dependencies {
            let id = dep_id.clone();
            let dep = self.db.call(move |store| store.get_task(&id)).await?;
            match dep {
                Some(dep) if dep.current_phase.is_terminal() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Cancel a task's queue item (releasing lease and claim with it) and
    /// clear the task-side assignment. Tolerates already-closed items.
    async fn drop_assignment(&self, task_id: &str, reason: &str) -> Result<()> {
        match self.dispatcher.cancel_task(task_id, reason).await {
            Ok(_) => {}
            Err(DispatchError::ItemNotFound(_)) => {
                // No open item, but a crashed worker may still hold resources.
                self.leases.release_all_for_task(task_id).await?;
                if let Some(owner) = self.claims.get_owner(task_id).await? {
                    self.claims.release(task_id, &owner).await?;
                }
            }
            Err(e) => return Err(e.into()),
        }
        let tid = task_id.to_string();
        self.db
            .call(move |store| store.set_assigned_worker(&tid, None))
            .await
            .ok(); // task may have been deleted; assignment cleanup is best-effort
        Ok(())
    }

    async fn clear_worker_side(&self, worker_id: &str, task_id: &str) -> Result<()> {
        let wid = worker_id.to_string();
        let worker = self.db.call(move |store| store.get_worker(&wid)).await?;
        if let Some(mut worker) = worker {
            worker.active_tasks.remove(task_id);
            self.db
                .call(move |store| store.upsert_worker(&worker))
                .await?;
        }
        let tid = task_id.to_string();
        self.db
            .call(move |store| store.set_assigned_worker(&tid, None))
            .await
            .ok();
        Ok(())
    }
}

/// Cooperative shutdown handle for the liveness sweep task.
pub struct LivenessHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LivenessHandle {
    pub async fn shutdown(self) {
        self.shutdown.send(true).ok();
        self.handle.await.ok();
    }
}
