//! Tamper-evident phase ledger.
//!
//! Every phase transition is appended to a per-task hash chain:
//! `this_hash = SHA-256(prev_hash || canonical(payload))`. The API surface
//! has no update or delete; mutating any historical row breaks verification
//! from that sequence number onward. Backtrack entries stay queryable so
//! downstream phases can compute rework-loop counts.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::db::Store;
use crate::models::now_ms;
use crate::phase::{TaskPhase, TransitionKind};

/// Genesis predecessor for the first entry of every task's chain.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One link in a task's transition chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseLedgerEntry {
    pub task_id: String,
    pub seq: i64,
    pub timestamp_ms: i64,
    pub prev_hash: String,
    pub this_hash: String,
    pub phase_from: TaskPhase,
    pub phase_to: TaskPhase,
    pub transition_type: TransitionKind,
    /// References to the evidence artifacts that satisfied the gate.
    pub evidence: Vec<String>,
    pub actor: String,
}

/// The hashed portion of an entry. Field order is the canonical encoding;
/// do not reorder without a chain migration.
#[derive(Debug, Serialize)]
struct LedgerPayload<'a> {
    task_id: &'a str,
    seq: i64,
    timestamp_ms: i64,
    phase_from: TaskPhase,
    phase_to: TaskPhase,
    transition_type: TransitionKind,
    evidence: &'a [String],
    actor: &'a str,
}

/// Result of a chain verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// Sequence number of the first broken link, when invalid.
    pub broken_at: Option<i64>,
}

impl ChainVerification {
    fn ok() -> Self {
        Self {
            valid: true,
            broken_at: None,
        }
    }

    fn broken(seq: i64) -> Self {
        Self {
            valid: false,
            broken_at: Some(seq),
        }
    }
}

/// Compute the chain hash for an entry.
fn chain_hash(prev_hash: &str, payload: &LedgerPayload<'_>) -> Result<String> {
    let canonical = serde_json::to_string(payload).context("Failed to encode ledger payload")?;
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

impl Store {
    /// Append a transition and move the task's phase in one transaction.
    ///
    /// The ledger entry and the `current_phase` update land together or not
    /// at all: a failure after the append (a task row deleted under us, a
    /// crash mid-write) rolls the entry back instead of leaving the chain
    /// one step ahead of the task.
    pub fn record_transition(
        &self,
        task_id: &str,
        phase_from: TaskPhase,
        phase_to: TaskPhase,
        transition_type: TransitionKind,
        evidence: &[String],
        actor: &str,
    ) -> Result<PhaseLedgerEntry> {
        // Use unchecked_transaction so both updates are atomic.
        let tx = self.conn().unchecked_transaction()?;
        let entry =
            self.ledger_append(task_id, phase_from, phase_to, transition_type, evidence, actor)?;
        self.update_task_phase(task_id, phase_to)?;
        tx.commit().context("Failed to commit phase transition")?;
        Ok(entry)
    }

    /// Append a transition to a task's chain and return the new entry.
    ///
    /// Sequence number and prev_hash are derived from the current chain
    /// head; concurrent appenders cannot fork the chain because the
    /// `(task_id, seq)` primary key rejects the loser's insert.
    pub fn ledger_append(
        &self,
        task_id: &str,
        phase_from: TaskPhase,
        phase_to: TaskPhase,
        transition_type: TransitionKind,
        evidence: &[String],
        actor: &str,
    ) -> Result<PhaseLedgerEntry> {
        let head: Option<(i64, String)> = self
            .conn()
            .query_row(
                "SELECT seq, this_hash FROM phase_ledger
                 WHERE task_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read chain head")?;

        let (seq, prev_hash) = match head {
            Some((last_seq, last_hash)) => (last_seq + 1, last_hash),
            None => (0, GENESIS_HASH.to_string()),
        };

        let timestamp_ms = now_ms();
        let payload = LedgerPayload {
            task_id,
            seq,
            timestamp_ms,
            phase_from,
            phase_to,
            transition_type,
            evidence,
            actor,
        };
        let this_hash = chain_hash(&prev_hash, &payload)?;

        self.conn()
            .execute(
                "INSERT INTO phase_ledger
                 (task_id, seq, timestamp_ms, prev_hash, this_hash,
                  phase_from, phase_to, transition_type, evidence, actor)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task_id,
                    seq,
                    timestamp_ms,
                    prev_hash,
                    this_hash,
                    phase_from.to_string(),
                    phase_to.to_string(),
                    transition_type.to_string(),
                    serde_json::to_string(evidence)?,
                    actor,
                ],
            )
            .context("Failed to append ledger entry")?;

        Ok(PhaseLedgerEntry {
            task_id: task_id.to_string(),
            seq,
            timestamp_ms,
            prev_hash,
            this_hash,
            phase_from,
            phase_to,
            transition_type,
            evidence: evidence.to_vec(),
            actor: actor.to_string(),
        })
    }

    /// All entries for a task in sequence order.
    pub fn ledger_entries(&self, task_id: &str) -> Result<Vec<PhaseLedgerEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT task_id, seq, timestamp_ms, prev_hash, this_hash,
                    phase_from, phase_to, transition_type, evidence, actor
             FROM phase_ledger WHERE task_id = ?1 ORDER BY seq",
        )?;
        let entries = stmt
            .query_map(params![task_id], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read ledger entries")?;
        Ok(entries)
    }

    /// Entries strictly after `seq`, in order. Used by gate contexts to
    /// scope evidence to the stretch after the latest backtrack.
    pub fn ledger_entries_since(&self, task_id: &str, seq: i64) -> Result<Vec<PhaseLedgerEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT task_id, seq, timestamp_ms, prev_hash, this_hash,
                    phase_from, phase_to, transition_type, evidence, actor
             FROM phase_ledger WHERE task_id = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let entries = stmt
            .query_map(params![task_id, seq], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read ledger entries")?;
        Ok(entries)
    }

    /// Sequence number of the task's most recent backtrack entry, if any.
    pub fn ledger_last_backtrack_seq(&self, task_id: &str) -> Result<Option<i64>> {
        self.conn()
            .query_row(
                "SELECT seq FROM phase_ledger
                 WHERE task_id = ?1 AND transition_type = 'backtrack'
                 ORDER BY seq DESC LIMIT 1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read last backtrack")
    }

    /// How many rework loops (backtrack entries) a task has been through.
    pub fn ledger_rework_count(&self, task_id: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM phase_ledger
             WHERE task_id = ?1 AND transition_type = 'backtrack'",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Recompute every hash and linkage in a task's chain.
    ///
    /// An empty chain is valid. The first entry must link to the genesis
    /// hash and sequence numbers must be contiguous from zero; any mismatch
    /// reports the sequence where the chain breaks.
    pub fn ledger_verify_chain(&self, task_id: &str) -> Result<ChainVerification> {
        let entries = self.ledger_entries(task_id)?;
        let mut expected_prev = GENESIS_HASH.to_string();

        for (i, entry) in entries.iter().enumerate() {
            if entry.seq != i as i64 || entry.prev_hash != expected_prev {
                return Ok(ChainVerification::broken(entry.seq));
            }
            let payload = LedgerPayload {
                task_id: &entry.task_id,
                seq: entry.seq,
                timestamp_ms: entry.timestamp_ms,
                phase_from: entry.phase_from,
                phase_to: entry.phase_to,
                transition_type: entry.transition_type,
                evidence: &entry.evidence,
                actor: &entry.actor,
            };
            let recomputed = chain_hash(&entry.prev_hash, &payload)?;
            if recomputed != entry.this_hash {
                return Ok(ChainVerification::broken(entry.seq));
            }
            expected_prev = entry.this_hash.clone();
        }

        Ok(ChainVerification::ok())
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhaseLedgerEntry> {
    let from_str: String = row.get(5)?;
    let to_str: String = row.get(6)?;
    let kind_str: String = row.get(7)?;
    let evidence_json: String = row.get(8)?;
    Ok(PhaseLedgerEntry {
        task_id: row.get(0)?,
        seq: row.get(1)?,
        timestamp_ms: row.get(2)?,
        prev_hash: row.get(3)?,
        this_hash: row.get(4)?,
        phase_from: TaskPhase::from_str(&from_str).map_err(crate::db::invalid_column(5))?,
        phase_to: TaskPhase::from_str(&to_str).map_err(crate::db::invalid_column(6))?,
        transition_type: TransitionKind::from_str(&kind_str)
            .map_err(crate::db::invalid_column(7))?,
        evidence: serde_json::from_str(&evidence_json).map_err(crate::db::invalid_column(8))?,
        actor: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;
    use crate::phase::TaskPhase;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn walk(store: &Store, task_id: &str, steps: usize) -> Vec<PhaseLedgerEntry> {
        let phases = crate::phase::ALL_PHASES;
        (0..steps)
            .map(|i| {
                store
                    .ledger_append(
                        task_id,
                        phases[i],
                        phases[i + 1],
                        TransitionKind::Forward,
                        &[format!("artifact-{}", i)],
                        "W1",
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_append_links_from_genesis() {
        let store = store();
        let entries = walk(&store, "T1", 3);

        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].this_hash);
        assert_eq!(entries[2].prev_hash, entries[1].this_hash);
        assert_eq!(entries[0].this_hash.len(), 64);
    }

    #[test]
    fn test_chains_are_per_task() {
        let store = store();
        walk(&store, "T1", 2);
        walk(&store, "T2", 1);

        assert_eq!(store.ledger_entries("T1").unwrap().len(), 2);
        let t2 = store.ledger_entries("T2").unwrap();
        assert_eq!(t2.len(), 1);
        assert_eq!(t2[0].seq, 0);
        assert_eq!(t2[0].prev_hash, GENESIS_HASH);
    }

    #[test]
    fn test_verify_intact_chain() {
        let store = store();
        walk(&store, "T1", 5);
        let verification = store.ledger_verify_chain("T1").unwrap();
        assert!(verification.valid);
        assert!(verification.broken_at.is_none());
    }

    #[test]
    fn test_verify_empty_chain_is_valid() {
        let store = store();
        assert!(store.ledger_verify_chain("T1").unwrap().valid);
    }

    #[test]
    fn test_mutated_payload_breaks_chain_at_that_index() {
        let store = store();
        walk(&store, "T1", 5);

        // Tamper with entry seq=2 behind the API's back.
        store
            .conn()
            .execute(
                "UPDATE phase_ledger SET actor = 'intruder' WHERE task_id = 'T1' AND seq = 2",
                [],
            )
            .unwrap();

        let verification = store.ledger_verify_chain("T1").unwrap();
        assert!(!verification.valid);
        assert_eq!(verification.broken_at, Some(2));
    }

    #[test]
    fn test_mutated_hash_breaks_chain() {
        let store = store();
        walk(&store, "T1", 3);

        // Rewriting a stored hash breaks either that link or the next one's
        // prev linkage; both must be detected at the mutated index.
        store
            .conn()
            .execute(
                "UPDATE phase_ledger SET this_hash = 'beef' WHERE task_id = 'T1' AND seq = 1",
                [],
            )
            .unwrap();

        let verification = store.ledger_verify_chain("T1").unwrap();
        assert!(!verification.valid);
        assert_eq!(verification.broken_at, Some(1));
    }

    #[test]
    fn test_deleted_entry_breaks_chain() {
        let store = store();
        walk(&store, "T1", 4);
        store
            .conn()
            .execute(
                "DELETE FROM phase_ledger WHERE task_id = 'T1' AND seq = 1",
                [],
            )
            .unwrap();

        let verification = store.ledger_verify_chain("T1").unwrap();
        assert!(!verification.valid);
        assert_eq!(verification.broken_at, Some(2));
    }

    #[test]
    fn test_backtracks_remain_queryable() {
        let store = store();
        walk(&store, "T1", 6); // ends at VERIFY
        store
            .ledger_append(
                "T1",
                TaskPhase::Verify,
                TaskPhase::Plan,
                TransitionKind::Backtrack,
                &[],
                "W1",
            )
            .unwrap();

        assert_eq!(store.ledger_rework_count("T1").unwrap(), 1);
        assert_eq!(store.ledger_last_backtrack_seq("T1").unwrap(), Some(6));
        assert_eq!(store.ledger_rework_count("T2").unwrap(), 0);
        assert!(store.ledger_last_backtrack_seq("T2").unwrap().is_none());
    }

    #[test]
    fn test_entries_since_scopes_to_later_stretch() {
        let store = store();
        walk(&store, "T1", 4);
        let since = store.ledger_entries_since("T1", 1).unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].seq, 2);
    }

    #[test]
    fn test_chain_still_valid_after_backtrack_entries() {
        let store = store();
        walk(&store, "T1", 6);
        store
            .ledger_append(
                "T1",
                TaskPhase::Verify,
                TaskPhase::Spec,
                TransitionKind::Backtrack,
                &[],
                "W1",
            )
            .unwrap();
        store
            .ledger_append(
                "T1",
                TaskPhase::Spec,
                TaskPhase::Plan,
                TransitionKind::Forward,
                &["fresh-plan".into()],
                "W1",
            )
            .unwrap();
        assert!(store.ledger_verify_chain("T1").unwrap().valid);
    }

    #[test]
    fn test_record_transition_moves_phase_with_the_entry() {
        let store = store();
        store.insert_task(&Task::new("T1", "wire codec")).unwrap();

        let entry = store
            .record_transition(
                "T1",
                TaskPhase::Strategize,
                TaskPhase::Spec,
                TransitionKind::Forward,
                &[],
                "W1",
            )
            .unwrap();

        assert_eq!(entry.seq, 0);
        let task = store.get_task("T1").unwrap().unwrap();
        assert_eq!(task.current_phase, TaskPhase::Spec);
    }

    #[test]
    fn test_record_transition_rolls_back_entry_when_task_row_is_gone() {
        let store = store();
        store.insert_task(&Task::new("T1", "wire codec")).unwrap();
        store
            .record_transition(
                "T1",
                TaskPhase::Strategize,
                TaskPhase::Spec,
                TransitionKind::Forward,
                &[],
                "W1",
            )
            .unwrap();

        // Another process pruned the task between the append and the update.
        store
            .conn()
            .execute("DELETE FROM tasks WHERE id = 'T1'", [])
            .unwrap();

        let result = store.record_transition(
            "T1",
            TaskPhase::Spec,
            TaskPhase::Plan,
            TransitionKind::Forward,
            &[],
            "W1",
        );
        assert!(result.is_err());

        // The failed transition left no orphan entry behind.
        assert_eq!(store.ledger_entries("T1").unwrap().len(), 1);
        assert!(store.ledger_verify_chain("T1").unwrap().valid);
    }
}
