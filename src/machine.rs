//! Phase state machine: the only writer of task phases and the ledger.
//!
//! `advance_phase` is the single entry point for moving a task through the
//! lifecycle. Every call validates the transition graph, takes the
//! `(task, target_phase)` lease, runs the current phase's evidence gates
//! fail-closed, and appends to the hash chain before touching the task row.
//! The machine publishes an event after each successful transition and
//! knows nothing about subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::db::DbHandle;
use crate::errors::TransitionError;
use crate::events::{CoreEvent, EventSender, emit};
use crate::ledger::PhaseLedgerEntry;
use crate::lease::{LeaseManager, phase_resource_key};
use crate::phase::{TaskPhase, TransitionKind};

/// Context handed to evidence gate validators.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub task_id: String,
    /// The phase whose exit criteria are being checked.
    pub phase: TaskPhase,
    /// Ledger sequence of the task's most recent backtrack, if any.
    /// Evidence recorded at or before this sequence predates the rework
    /// loop and must not be trusted; validators only accept artifacts
    /// produced after it.
    pub fresh_after_seq: Option<i64>,
}

/// Verdict from a single evidence gate.
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub pass: bool,
    /// Artifacts the gate expected but did not find.
    pub missing: Vec<String>,
    /// Human-readable diagnostics.
    pub details: Vec<String>,
    /// References to the artifacts that satisfied the gate; recorded in the
    /// ledger entry on success.
    pub evidence: Vec<String>,
}

impl GateOutcome {
    pub fn pass(evidence: Vec<String>) -> Self {
        Self {
            pass: true,
            evidence,
            ..Default::default()
        }
    }

    pub fn fail(missing: Vec<String>, details: Vec<String>) -> Self {
        Self {
            pass: false,
            missing,
            details,
            ..Default::default()
        }
    }
}

/// A quality-gate check consumed by the machine. The content of checks is
/// external; the machine only cares about the verdict.
#[async_trait]
pub trait EvidenceGate: Send + Sync {
    async fn validate(&self, ctx: &GateContext) -> anyhow::Result<GateOutcome>;
}

/// The phase state machine.
pub struct PhaseMachine {
    db: DbHandle,
    leases: Arc<LeaseManager>,
    gates: HashMap<TaskPhase, Vec<Arc<dyn EvidenceGate>>>,
    events: Option<EventSender>,
}

impl PhaseMachine {
    pub fn new(db: DbHandle, leases: Arc<LeaseManager>) -> Self {
        Self {
            db,
            leases,
            gates: HashMap::new(),
            events: None,
        }
    }

    /// Set the event channel for transition events.
    pub fn with_event_channel(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    /// Register an evidence gate for a phase. Multiple gates on one phase
    /// must all pass. Phases with no registered gate pass vacuously.
    pub fn register_gate(&mut self, phase: TaskPhase, gate: Arc<dyn EvidenceGate>) {
        self.gates.entry(phase).or_default().push(gate);
    }

    /// Move a task to `target`, enforcing the transition graph, the
    /// `(task, target)` lease, and the current phase's evidence gates.
    ///
    /// On success the ledger entry is appended and the task row updated
    /// before the lease is released. Every error path leaves the task and
    /// ledger exactly as they were.
    pub async fn advance_phase(
        &self,
        task_id: &str,
        target: TaskPhase,
        actor: &str,
    ) -> Result<PhaseLedgerEntry, TransitionError> {
        // Pre-flight legality check so an illegal request costs nothing,
        // not even a lease round-trip.
        let current = self.load_phase(task_id).await?;
        if current.transition_to(target).is_none() {
            return Err(TransitionError::IllegalTransition {
                from: current,
                to: target,
            });
        }

        let lease_key = phase_resource_key(task_id, target);
        let acquired = self
            .leases
            .acquire(&lease_key, actor)
            .await
            .map_err(TransitionError::Other)?;
        if !acquired {
            return Err(TransitionError::LeaseUnavailable {
                resource_key: lease_key,
            });
        }

        // Everything past the lease must release it, success or not.
        let result = self.advance_locked(task_id, target, actor).await;
        if let Err(e) = self.leases.release(&lease_key, actor).await {
            warn!(resource_key = lease_key.as_str(), error = %e, "lease release failed");
        }

        let entry = result?;
        info!(
            task_id,
            from = %entry.phase_from,
            to = %entry.phase_to,
            kind = %entry.transition_type,
            actor,
            "phase transition"
        );
        emit(
            &self.events,
            CoreEvent::PhaseTransition {
                task_id: task_id.to_string(),
                from: entry.phase_from,
                to: entry.phase_to,
                kind: entry.transition_type,
            },
        )
        .await;
        if entry.transition_type == TransitionKind::Backtrack {
            emit(
                &self.events,
                CoreEvent::PhaseBacktrack {
                    task_id: task_id.to_string(),
                    from: entry.phase_from,
                    to: entry.phase_to,
                },
            )
            .await;
        }
        Ok(entry)
    }

    /// The part of `advance_phase` that runs while holding the lease.
    async fn advance_locked(
        &self,
        task_id: &str,
        target: TaskPhase,
        actor: &str,
    ) -> Result<PhaseLedgerEntry, TransitionError> {
        // Re-read under the lease: another process may have moved the task
        // between pre-flight and acquisition.
        let current = self.load_phase(task_id).await?;
        let kind = current
            .transition_to(target)
            .ok_or(TransitionError::IllegalTransition {
                from: current,
                to: target,
            })?;

        // Refuse to extend a broken chain. History is never rewritten.
        let tid = task_id.to_string();
        let verification = self
            .db
            .call(move |store| store.ledger_verify_chain(&tid))
            .await
            .map_err(TransitionError::Other)?;
        if !verification.valid {
            return Err(TransitionError::LedgerCorruption {
                task_id: task_id.to_string(),
                broken_at: verification.broken_at.unwrap_or(0),
            });
        }

        // Forward steps must pass the current phase's gates. Backtracks are
        // corrective and ungated; the toll is paid re-walking forward.
        let evidence = match kind {
            TransitionKind::Forward => self.run_gates(task_id, current).await?,
            TransitionKind::Backtrack => Vec::new(),
        };

        let tid = task_id.to_string();
        let actor = actor.to_string();
        self.db
            .call(move |store| {
                store.record_transition(&tid, current, target, kind, &evidence, &actor)
            })
            .await
            .map_err(TransitionError::Other)
    }

    /// Run every gate registered for `phase`, fail-closed.
    ///
    /// A gate returning an error counts as a failing gate: the machine
    /// cannot distinguish "validator broke" from "evidence absent" and must
    /// not wave the task through on a fault.
    async fn run_gates(
        &self,
        task_id: &str,
        phase: TaskPhase,
    ) -> Result<Vec<String>, TransitionError> {
        let gates = match self.gates.get(&phase) {
            Some(gates) => gates,
            None => return Ok(Vec::new()),
        };

        let tid = task_id.to_string();
        let fresh_after_seq = self
            .db
            .call(move |store| store.ledger_last_backtrack_seq(&tid))
            .await
            .map_err(TransitionError::Other)?;

        let ctx = GateContext {
            task_id: task_id.to_string(),
            phase,
            fresh_after_seq,
        };

        let mut evidence = Vec::new();
        for gate in gates {
            let outcome = match gate.validate(&ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(task_id, phase = %phase, error = %e, "evidence gate errored; failing closed");
                    return Err(TransitionError::EvidenceGateFailure {
                        phase,
                        missing: Vec::new(),
                        details: vec![format!("validator error: {}", e)],
                    });
                }
            };
            if !outcome.pass {
                return Err(TransitionError::EvidenceGateFailure {
                    phase,
                    missing: outcome.missing,
                    details: outcome.details,
                });
            }
            evidence.extend(outcome.evidence);
        }
        Ok(evidence)
    }

    async fn load_phase(&self, task_id: &str) -> Result<TaskPhase, TransitionError> {
        let tid = task_id.to_string();
        let task = self
            .db
            .call(move |store| store.get_task(&tid))
            .await
            .map_err(TransitionError::Other)?
            .ok_or_else(|| TransitionError::TaskNotFound(task_id.to_string()))?;
        Ok(task.current_phase)
    }
}
