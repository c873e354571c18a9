//! Task claim store: which agent owns a task end-to-end.
//!
//! A claim is the long-lived counterpart of a lease. Claiming is a single
//! non-blocking atomic attempt; callers that lose simply ask the dispatcher
//! for a different task. A claim whose age exceeds twice its declared
//! expected completion time is stale and may be taken over, with the
//! displaced owner logged and announced.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};
use tracing::warn;

use crate::db::{DbHandle, Store};
use crate::events::{CoreEvent, EventSender, emit};
use crate::models::{TaskClaim, now_ms};

/// What an atomic claim attempt did.
#[derive(Debug, PartialEq)]
enum ClaimAttempt {
    Claimed,
    /// Existing claim was stale; we took it over.
    TookOverStale { previous_agent: String },
    /// Held by a live agent.
    Conflict,
}

pub struct ClaimStore {
    db: DbHandle,
    events: Option<EventSender>,
}

impl ClaimStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db, events: None }
    }

    /// Set the event channel for telemetry.
    pub fn with_event_channel(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    /// Try to claim a task for an agent. One atomic attempt, never blocks.
    ///
    /// Returns true when the agent now owns the task: either it was
    /// unclaimed, or the previous claim had gone stale
    /// (age > 2 x expected_completion_ms) and was taken over. Returns false
    /// on conflict with a live claim; the caller selects a different task.
    pub async fn claim(
        &self,
        task_id: &str,
        agent_id: &str,
        expected_completion_ms: i64,
    ) -> Result<bool> {
        let tid = task_id.to_string();
        let aid = agent_id.to_string();
        let attempt = self
            .db
            .call(move |store| store.claim_try(&tid, &aid, expected_completion_ms))
            .await?;

        match attempt {
            ClaimAttempt::Claimed => Ok(true),
            ClaimAttempt::TookOverStale { previous_agent } => {
                warn!(
                    task_id,
                    previous_agent = previous_agent.as_str(),
                    new_agent = agent_id,
                    "took over stale claim"
                );
                emit(
                    &self.events,
                    CoreEvent::ClaimStaleReclaimed {
                        task_id: task_id.to_string(),
                        previous_agent,
                        new_agent: agent_id.to_string(),
                    },
                )
                .await;
                Ok(true)
            }
            ClaimAttempt::Conflict => Ok(false),
        }
    }

    /// Release a claim, but only if `agent_id` still owns it. Idempotent.
    pub async fn release(&self, task_id: &str, agent_id: &str) -> Result<()> {
        let tid = task_id.to_string();
        let aid = agent_id.to_string();
        self.db
            .call(move |store| store.claim_release(&tid, &aid))
            .await
    }

    /// Current owner of a task, if claimed.
    pub async fn get_owner(&self, task_id: &str) -> Result<Option<String>> {
        let tid = task_id.to_string();
        Ok(self
            .db
            .call(move |store| store.claim_get(&tid))
            .await?
            .map(|c| c.agent_id))
    }

    /// Full claim record, if any.
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskClaim>> {
        let tid = task_id.to_string();
        self.db.call(move |store| store.claim_get(&tid)).await
    }
}

impl Store {
    fn claim_try(
        &self,
        task_id: &str,
        agent_id: &str,
        expected_completion_ms: i64,
    ) -> Result<ClaimAttempt> {
        let now = now_ms();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO task_claims (task_id, agent_id, claimed_at_ms, expected_completion_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id) DO NOTHING",
                params![task_id, agent_id, now, expected_completion_ms],
            )
            .context("Failed to insert claim")?;
        if inserted == 1 {
            return Ok(ClaimAttempt::Claimed);
        }

        let Some(existing) = self.claim_get(task_id)? else {
            // Released between insert and read; treat as conflict, the
            // caller's next attempt will win.
            return Ok(ClaimAttempt::Conflict);
        };

        if !existing.is_stale(now) {
            return Ok(ClaimAttempt::Conflict);
        }

        // Stale takeover: compare-and-swap on the exact row we observed so
        // two takeover attempts cannot both succeed.
        let updated = self
            .conn()
            .execute(
                "UPDATE task_claims
                 SET agent_id = ?1, claimed_at_ms = ?2, expected_completion_ms = ?3
                 WHERE task_id = ?4 AND agent_id = ?5 AND claimed_at_ms = ?6",
                params![
                    agent_id,
                    now,
                    expected_completion_ms,
                    task_id,
                    existing.agent_id,
                    existing.claimed_at_ms,
                ],
            )
            .context("Failed to take over stale claim")?;

        if updated == 1 {
            Ok(ClaimAttempt::TookOverStale {
                previous_agent: existing.agent_id,
            })
        } else {
            Ok(ClaimAttempt::Conflict)
        }
    }

    fn claim_release(&self, task_id: &str, agent_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM task_claims WHERE task_id = ?1 AND agent_id = ?2",
                params![task_id, agent_id],
            )
            .context("Failed to release claim")?;
        Ok(())
    }

    fn claim_get(&self, task_id: &str) -> Result<Option<TaskClaim>> {
        self.conn()
            .query_row(
                "SELECT task_id, agent_id, claimed_at_ms, expected_completion_ms
                 FROM task_claims WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok(TaskClaim {
                        task_id: row.get(0)?,
                        agent_id: row.get(1)?,
                        claimed_at_ms: row.get(2)?,
                        expected_completion_ms: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query claim")
    }
}
