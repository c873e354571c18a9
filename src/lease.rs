//! Cross-process lease manager.
//!
//! Mutual exclusion over an arbitrary resource key, safe across independent
//! worker processes: acquisition is an atomic `INSERT ... ON CONFLICT DO
//! NOTHING` against the shared store, never an in-process mutex. A lease
//! older than its own TTL is stale and may be reclaimed by anyone; release
//! and renew are holder-checked and idempotent.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};
use tracing::{debug, warn};

use crate::backoff::{BackoffConfig, backoff_sleep};
use crate::db::{DbHandle, Store};
use crate::events::{CoreEvent, EventSender, emit};
use crate::models::{Lease, now_ms};
use crate::phase::TaskPhase;

/// Default lease TTL: 5 minutes.
pub const DEFAULT_TTL_MS: i64 = 300_000;
/// Default overall acquisition timeout: 30 seconds.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

/// Lease resource key for a task/phase pair. Both the state machine and the
/// cancellation path build keys through this so they always agree.
pub fn phase_resource_key(task_id: &str, phase: TaskPhase) -> String {
    format!("task/{}/{}", task_id, phase)
}

/// Timing knobs for lease acquisition.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// TTL stamped on newly acquired leases.
    pub ttl_ms: i64,
    /// Overall budget for one blocking `acquire` call.
    pub acquire_timeout_ms: u64,
    /// Retry backoff (base ~100 ms, jittered).
    pub backoff: BackoffConfig,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_TTL_MS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            backoff: BackoffConfig::default(),
        }
    }
}

/// What a single atomic acquisition attempt observed.
#[derive(Debug, PartialEq)]
enum AttemptOutcome {
    /// We hold the lease now.
    Acquired,
    /// Held by a live holder; caller may back off and retry.
    Held,
    /// A stale lease was deleted; retry immediately.
    ReclaimedStale { previous_holder: String },
}

pub struct LeaseManager {
    db: DbHandle,
    config: LeaseConfig,
    events: Option<EventSender>,
}

impl LeaseManager {
    pub fn new(db: DbHandle, config: LeaseConfig) -> Self {
        Self {
            db,
            config,
            events: None,
        }
    }

    /// Set the event channel for telemetry.
    pub fn with_event_channel(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Acquire the lease on `key` for `holder_id`, blocking with jittered
    /// backoff up to the configured timeout. Returns false if the resource
    /// stayed held by a live holder for the whole window.
    pub async fn acquire(&self, key: &str, holder_id: &str) -> Result<bool> {
        self.acquire_with_ttl(key, holder_id, self.config.ttl_ms).await
    }

    /// `acquire` with an explicit TTL (long phases can ask for more).
    pub async fn acquire_with_ttl(&self, key: &str, holder_id: &str, ttl_ms: i64) -> Result<bool> {
        let deadline =
            std::time::Instant::now() + std::time::Duration::from_millis(self.config.acquire_timeout_ms);
        let mut attempt: u32 = 0;

        loop {
            match self.try_acquire(key, holder_id, ttl_ms).await? {
                AttemptOutcome::Acquired => return Ok(true),
                AttemptOutcome::ReclaimedStale { previous_holder } => {
                    warn!(
                        resource_key = key,
                        previous_holder = previous_holder.as_str(),
                        "reclaimed stale lease"
                    );
                    // Deleted a dead holder's lease; retry without waiting.
                    continue;
                }
                AttemptOutcome::Held => {
                    if std::time::Instant::now() >= deadline {
                        emit(
                            &self.events,
                            CoreEvent::LeaseDenied {
                                resource_key: key.to_string(),
                            },
                        )
                        .await;
                        debug!(resource_key = key, "lease acquisition timed out");
                        return Ok(false);
                    }
                    backoff_sleep(attempt, &self.config.backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One non-blocking acquisition attempt.
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl_ms: i64) -> Result<AttemptOutcome> {
        let key = key.to_string();
        let holder = holder_id.to_string();
        self.db
            .call(move |store| store.lease_try_acquire(&key, &holder, ttl_ms))
            .await
    }

    /// Release the lease, but only if `holder_id` still holds it.
    /// Idempotent: releasing an absent or foreign lease is a no-op.
    pub async fn release(&self, key: &str, holder_id: &str) -> Result<()> {
        let key = key.to_string();
        let holder = holder_id.to_string();
        self.db
            .call(move |store| store.lease_release(&key, &holder))
            .await
    }

    /// Extend a held lease's TTL window by restamping its acquisition time.
    /// Returns false if `holder_id` no longer holds the lease.
    pub async fn renew(&self, key: &str, holder_id: &str) -> Result<bool> {
        let key = key.to_string();
        let holder = holder_id.to_string();
        self.db
            .call(move |store| store.lease_renew(&key, &holder))
            .await
    }

    /// Current lease on a key, if any.
    pub async fn get(&self, key: &str) -> Result<Option<Lease>> {
        let key = key.to_string();
        self.db.call(move |store| store.lease_get(&key)).await
    }

    /// Drop every lease whose key falls under a task's namespace. Used by
    /// the cancellation path.
    pub async fn release_all_for_task(&self, task_id: &str) -> Result<usize> {
        let prefix = format!("task/{}/", task_id);
        self.db
            .call(move |store| store.lease_release_prefix(&prefix))
            .await
    }
}

impl Store {
    fn lease_try_acquire(&self, key: &str, holder_id: &str, ttl_ms: i64) -> Result<AttemptOutcome> {
        let now = now_ms();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO leases (resource_key, holder_id, acquired_at_ms, ttl_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(resource_key) DO NOTHING",
                params![key, holder_id, now, ttl_ms],
            )
            .context("Failed to insert lease")?;
        if inserted == 1 {
            return Ok(AttemptOutcome::Acquired);
        }

        let existing = self.lease_get(key)?;
        let Some(existing) = existing else {
            // Released between our insert and read; next attempt wins.
            return Ok(AttemptOutcome::Held);
        };

        if !existing.is_stale(now) {
            return Ok(AttemptOutcome::Held);
        }

        // Compare-and-delete on the exact row we observed, so a lease that
        // was renewed or re-acquired in the meantime is left alone.
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM leases
                 WHERE resource_key = ?1 AND holder_id = ?2 AND acquired_at_ms = ?3",
                params![key, existing.holder_id, existing.acquired_at_ms],
            )
            .context("Failed to delete stale lease")?;

        if deleted == 1 {
            Ok(AttemptOutcome::ReclaimedStale {
                previous_holder: existing.holder_id,
            })
        } else {
            Ok(AttemptOutcome::Held)
        }
    }

    fn lease_release(&self, key: &str, holder_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM leases WHERE resource_key = ?1 AND holder_id = ?2",
                params![key, holder_id],
            )
            .context("Failed to release lease")?;
        Ok(())
    }

    fn lease_renew(&self, key: &str, holder_id: &str) -> Result<bool> {
        let updated = self
            .conn()
            .execute(
                "UPDATE leases SET acquired_at_ms = ?1
                 WHERE resource_key = ?2 AND holder_id = ?3",
                params![now_ms(), key, holder_id],
            )
            .context("Failed to renew lease")?;
        Ok(updated == 1)
    }

    fn lease_get(&self, key: &str) -> Result<Option<Lease>> {
        self.conn()
            .query_row(
                "SELECT resource_key, holder_id, acquired_at_ms, ttl_ms
                 FROM leases WHERE resource_key = ?1",
                params![key],
                |row| {
                    Ok(Lease {
                        resource_key: row.get(0)?,
                        holder_id: row.get(1)?,
                        acquired_at_ms: row.get(2)?,
                        ttl_ms: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query lease")
    }

    fn lease_release_prefix(&self, prefix: &str) -> Result<usize> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM leases WHERE resource_key LIKE ?1 ESCAPE '\\'",
                params![pattern],
            )
            .context("Failed to release task leases")?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LeaseManager {
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        LeaseManager::new(db, LeaseConfig::default())
    }

    fn fast_manager(acquire_timeout_ms: u64) -> LeaseManager {
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        LeaseManager::new(
            db,
            LeaseConfig {
                ttl_ms: 1_000,
                acquire_timeout_ms,
                backoff: BackoffConfig {
                    base_ms: 5,
                    max_ms: 20,
                    ..BackoffConfig::default()
                },
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_free_lease() {
        let mgr = manager();
        assert!(mgr.acquire("task/T1/implement", "W1").await.unwrap());
        let lease = mgr.get("task/T1/implement").await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "W1");
        assert_eq!(lease.ttl_ms, DEFAULT_TTL_MS);
    }

    #[tokio::test]
    async fn test_second_holder_denied_until_release() {
        let mgr = fast_manager(50);
        assert!(mgr.acquire("k", "W1").await.unwrap());
        // W2 must time out while W1 is live.
        assert!(!mgr.acquire("k", "W2").await.unwrap());

        mgr.release("k", "W1").await.unwrap();
        assert!(mgr.acquire("k", "W2").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_yield_single_winner() {
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        let mgr = std::sync::Arc::new(LeaseManager::new(
            db,
            LeaseConfig {
                acquire_timeout_ms: 50,
                backoff: BackoffConfig {
                    base_ms: 5,
                    max_ms: 10,
                    ..BackoffConfig::default()
                },
                ..LeaseConfig::default()
            },
        ));

        let mut handles = Vec::new();
        for i in 0..8 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                mgr.acquire("k", &format!("W{}", i)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimed() {
        let mgr = fast_manager(500);
        // Plant a lease that expired long ago.
        {
            let db = mgr.db.lock_sync().unwrap();
            db.conn()
                .execute(
                    "INSERT INTO leases (resource_key, holder_id, acquired_at_ms, ttl_ms)
                     VALUES ('k', 'W1', ?1, 1000)",
                    params![now_ms() - 2_500],
                )
                .unwrap();
        }

        assert!(mgr.acquire("k", "W2").await.unwrap());
        let lease = mgr.get("k").await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "W2");
    }

    #[tokio::test]
    async fn test_young_lease_is_not_reclaimed() {
        let mgr = fast_manager(50);
        assert!(mgr.acquire("k", "W1").await.unwrap());
        // W1's lease is fresh (ttl 1000 ms); W2 cannot take it.
        assert!(!mgr.acquire("k", "W2").await.unwrap());
    }

    #[tokio::test]
    async fn test_denied_acquire_emits_lease_denied() {
        let (tx, mut rx) = crate::events::channel(4);
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        let mgr = LeaseManager::new(
            db,
            LeaseConfig {
                acquire_timeout_ms: 30,
                backoff: BackoffConfig {
                    base_ms: 5,
                    max_ms: 10,
                    ..BackoffConfig::default()
                },
                ..LeaseConfig::default()
            },
        )
        .with_event_channel(tx);

        assert!(mgr.acquire("k", "W1").await.unwrap());
        assert!(!mgr.acquire("k", "W2").await.unwrap());

        match rx.recv().await.unwrap() {
            CoreEvent::LeaseDenied { resource_key } => assert_eq!(resource_key, "k"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_is_holder_checked_and_idempotent() {
        let mgr = manager();
        assert!(mgr.acquire("k", "W1").await.unwrap());

        // Foreign release is a no-op.
        mgr.release("k", "W2").await.unwrap();
        assert_eq!(mgr.get("k").await.unwrap().unwrap().holder_id, "W1");

        // Matching release removes; a second release is harmless.
        mgr.release("k", "W1").await.unwrap();
        mgr.release("k", "W1").await.unwrap();
        assert!(mgr.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_extends_only_for_holder() {
        let mgr = manager();
        assert!(mgr.acquire("k", "W1").await.unwrap());
        let before = mgr.get("k").await.unwrap().unwrap().acquired_at_ms;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(mgr.renew("k", "W1").await.unwrap());
        let after = mgr.get("k").await.unwrap().unwrap().acquired_at_ms;
        assert!(after >= before);

        assert!(!mgr.renew("k", "W2").await.unwrap());
        assert!(!mgr.renew("missing", "W1").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_all_for_task_only_hits_that_namespace() {
        let mgr = manager();
        assert!(mgr.acquire(&phase_resource_key("T1", TaskPhase::Implement), "W1").await.unwrap());
        assert!(mgr.acquire(&phase_resource_key("T1", TaskPhase::Verify), "W1").await.unwrap());
        assert!(mgr.acquire(&phase_resource_key("T2", TaskPhase::Implement), "W2").await.unwrap());

        let released = mgr.release_all_for_task("T1").await.unwrap();
        assert_eq!(released, 2);
        assert!(
            mgr.get(&phase_resource_key("T2", TaskPhase::Implement))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_phase_resource_key_format() {
        assert_eq!(
            phase_resource_key("T1", TaskPhase::GateDesign),
            "task/T1/gate_design"
        );
    }
}
