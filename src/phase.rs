//! Phase lifecycle definition for the conductor core.
//!
//! This module provides:
//! - `TaskPhase` — the ten fixed lifecycle phases every task walks through
//! - The transition graph: forward steps plus corrective backtracks
//! - `CoarseStatus` — the legacy four-state overlay, derived by a static
//!   mapping table rather than string matching

use serde::{Deserialize, Serialize};

/// The ten fixed lifecycle phases, in walk order.
///
/// Forward movement is strictly `phase[i] -> phase[i+1]`. Corrective
/// backtracks are allowed only from the late phases (VERIFY onward) to any
/// strictly earlier phase; a task that backtracks must re-earn every gate on
/// its way forward again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Frame the problem and pick an approach
    Strategize,
    /// Write the specification
    Spec,
    /// Break the spec into an ordered plan
    Plan,
    /// Deep-dive the risky parts before committing
    Think,
    /// Design gate: the plan is reviewed before any code is written
    GateDesign,
    /// Build it
    Implement,
    /// Run the checks that prove it works
    Verify,
    /// Human / critic review
    Review,
    /// Open the pull request
    Pr,
    /// Watch it in the wild
    Monitor,
}

/// All phases in walk order. Index in this slice is the phase's ordinal.
pub const ALL_PHASES: [TaskPhase; 10] = [
    TaskPhase::Strategize,
    TaskPhase::Spec,
    TaskPhase::Plan,
    TaskPhase::Think,
    TaskPhase::GateDesign,
    TaskPhase::Implement,
    TaskPhase::Verify,
    TaskPhase::Review,
    TaskPhase::Pr,
    TaskPhase::Monitor,
];

/// How a legal transition moves through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// One step forward, gated on the current phase's evidence
    Forward,
    /// Corrective rework: a late phase returning to an earlier one
    Backtrack,
}

/// Coarse legacy status overlay on the fine-grained phases.
///
/// External tools still speak the old four-state vocabulary. The mapping is
/// a fixed table over `TaskPhase` (see [`TaskPhase::coarse_status`]), with
/// `Blocked` and `Done` applied as overlays by the task record itself when a
/// task is cancelled/blocked or has left MONITOR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoarseStatus {
    #[default]
    Pending,
    InProgress,
    Blocked,
    Done,
}

impl TaskPhase {
    /// Ordinal position in the walk order (STRATEGIZE = 0 .. MONITOR = 9).
    pub fn index(&self) -> usize {
        match self {
            TaskPhase::Strategize => 0,
            TaskPhase::Spec => 1,
            TaskPhase::Plan => 2,
            TaskPhase::Think => 3,
            TaskPhase::GateDesign => 4,
            TaskPhase::Implement => 5,
            TaskPhase::Verify => 6,
            TaskPhase::Review => 7,
            TaskPhase::Pr => 8,
            TaskPhase::Monitor => 9,
        }
    }

    /// The single legal forward successor, if any.
    pub fn next(&self) -> Option<TaskPhase> {
        ALL_PHASES.get(self.index() + 1).copied()
    }

    /// Whether this phase may initiate a backtrack.
    ///
    /// Only the late phases, where defects are actually discovered, are
    /// allowed to send a task backward.
    pub fn can_backtrack(&self) -> bool {
        matches!(
            self,
            TaskPhase::Verify | TaskPhase::Review | TaskPhase::Pr | TaskPhase::Monitor
        )
    }

    /// Whether this is the terminal phase of the lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Monitor)
    }

    /// Classify the transition `self -> target`.
    ///
    /// Returns `None` for illegal transitions: skips, self-loops, and
    /// backward moves from phases that may not backtrack.
    pub fn transition_to(&self, target: TaskPhase) -> Option<TransitionKind> {
        let from = self.index();
        let to = target.index();
        if to == from + 1 {
            Some(TransitionKind::Forward)
        } else if to < from && self.can_backtrack() {
            Some(TransitionKind::Backtrack)
        } else {
            None
        }
    }

    /// Static phase -> coarse status mapping table.
    ///
    /// STRATEGIZE maps to `Pending` (nothing has been decided yet), MONITOR
    /// to `Done` (the work has shipped), everything between to `InProgress`.
    /// `Blocked` never derives from a phase — it is an overlay the task
    /// record applies when it is cancelled or waiting on a dependency.
    pub fn coarse_status(&self) -> CoarseStatus {
        match self {
            TaskPhase::Strategize => CoarseStatus::Pending,
            TaskPhase::Spec
            | TaskPhase::Plan
            | TaskPhase::Think
            | TaskPhase::GateDesign
            | TaskPhase::Implement
            | TaskPhase::Verify
            | TaskPhase::Review
            | TaskPhase::Pr => CoarseStatus::InProgress,
            TaskPhase::Monitor => CoarseStatus::Done,
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPhase::Strategize => "strategize",
            TaskPhase::Spec => "spec",
            TaskPhase::Plan => "plan",
            TaskPhase::Think => "think",
            TaskPhase::GateDesign => "gate_design",
            TaskPhase::Implement => "implement",
            TaskPhase::Verify => "verify",
            TaskPhase::Review => "review",
            TaskPhase::Pr => "pr",
            TaskPhase::Monitor => "monitor",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strategize" => Ok(TaskPhase::Strategize),
            "spec" => Ok(TaskPhase::Spec),
            "plan" => Ok(TaskPhase::Plan),
            "think" => Ok(TaskPhase::Think),
            "gate_design" => Ok(TaskPhase::GateDesign),
            "implement" => Ok(TaskPhase::Implement),
            "verify" => Ok(TaskPhase::Verify),
            "review" => Ok(TaskPhase::Review),
            "pr" => Ok(TaskPhase::Pr),
            "monitor" => Ok(TaskPhase::Monitor),
            other => Err(anyhow::anyhow!("unknown phase: {}", other)),
        }
    }
}

impl std::fmt::Display for CoarseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoarseStatus::Pending => "pending",
            CoarseStatus::InProgress => "in_progress",
            CoarseStatus::Blocked => "blocked",
            CoarseStatus::Done => "done",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CoarseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CoarseStatus::Pending),
            "in_progress" => Ok(CoarseStatus::InProgress),
            "blocked" => Ok(CoarseStatus::Blocked),
            "done" => Ok(CoarseStatus::Done),
            other => Err(anyhow::anyhow!("unknown coarse status: {}", other)),
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::Forward => write!(f, "forward"),
            TransitionKind::Backtrack => write!(f, "backtrack"),
        }
    }
}

impl std::str::FromStr for TransitionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(TransitionKind::Forward),
            "backtrack" => Ok(TransitionKind::Backtrack),
            other => Err(anyhow::anyhow!("unknown transition kind: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // =========================================
    // Walk order and successors
    // =========================================

    #[test]
    fn test_walk_order_is_fixed() {
        assert_eq!(ALL_PHASES.len(), 10);
        assert_eq!(ALL_PHASES[0], TaskPhase::Strategize);
        assert_eq!(ALL_PHASES[9], TaskPhase::Monitor);
        for (i, phase) in ALL_PHASES.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }

    #[test]
    fn test_next_follows_walk_order() {
        assert_eq!(TaskPhase::Strategize.next(), Some(TaskPhase::Spec));
        assert_eq!(TaskPhase::GateDesign.next(), Some(TaskPhase::Implement));
        assert_eq!(TaskPhase::Pr.next(), Some(TaskPhase::Monitor));
        assert_eq!(TaskPhase::Monitor.next(), None);
    }

    #[test]
    fn test_monitor_is_only_terminal() {
        for phase in ALL_PHASES {
            assert_eq!(phase.is_terminal(), phase == TaskPhase::Monitor);
        }
    }

    // =========================================
    // Transition legality
    // =========================================

    #[test]
    fn test_forward_step_is_legal() {
        assert_eq!(
            TaskPhase::Implement.transition_to(TaskPhase::Verify),
            Some(TransitionKind::Forward)
        );
    }

    #[test]
    fn test_forward_skip_is_illegal() {
        assert_eq!(TaskPhase::Spec.transition_to(TaskPhase::Implement), None);
        assert_eq!(TaskPhase::Strategize.transition_to(TaskPhase::Monitor), None);
    }

    #[test]
    fn test_self_loop_is_illegal() {
        for phase in ALL_PHASES {
            assert_eq!(phase.transition_to(phase), None);
        }
    }

    #[test]
    fn test_backtrack_only_from_late_phases() {
        // VERIFY, REVIEW, PR, MONITOR may go back to any earlier phase.
        assert_eq!(
            TaskPhase::Verify.transition_to(TaskPhase::Plan),
            Some(TransitionKind::Backtrack)
        );
        assert_eq!(
            TaskPhase::Monitor.transition_to(TaskPhase::Strategize),
            Some(TransitionKind::Backtrack)
        );
        // Early phases may not.
        assert_eq!(TaskPhase::Implement.transition_to(TaskPhase::Plan), None);
        assert_eq!(TaskPhase::Spec.transition_to(TaskPhase::Strategize), None);
    }

    #[test]
    fn test_exhaustive_legality_matrix() {
        // Every (from, to) pair must be exactly one of: forward step,
        // late-phase backtrack, or illegal.
        for from in ALL_PHASES {
            for to in ALL_PHASES {
                let got = from.transition_to(to);
                let expected = if to.index() == from.index() + 1 {
                    Some(TransitionKind::Forward)
                } else if to.index() < from.index() && from.can_backtrack() {
                    Some(TransitionKind::Backtrack)
                } else {
                    None
                };
                assert_eq!(got, expected, "transition {} -> {}", from, to);
            }
        }
    }

    // =========================================
    // Coarse status mapping
    // =========================================

    #[test]
    fn test_coarse_mapping_table() {
        assert_eq!(TaskPhase::Strategize.coarse_status(), CoarseStatus::Pending);
        assert_eq!(TaskPhase::Implement.coarse_status(), CoarseStatus::InProgress);
        assert_eq!(TaskPhase::Pr.coarse_status(), CoarseStatus::InProgress);
        assert_eq!(TaskPhase::Monitor.coarse_status(), CoarseStatus::Done);
    }

    #[test]
    fn test_blocked_never_derives_from_a_phase() {
        for phase in ALL_PHASES {
            assert_ne!(phase.coarse_status(), CoarseStatus::Blocked);
        }
    }

    // =========================================
    // Serialization round-trips
    // =========================================

    #[test]
    fn test_phase_display_from_str_roundtrip() {
        for phase in ALL_PHASES {
            let parsed = TaskPhase::from_str(&phase.to_string()).unwrap();
            assert_eq!(parsed, phase);
        }
        assert!(TaskPhase::from_str("deploy").is_err());
    }

    #[test]
    fn test_phase_serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskPhase::GateDesign).unwrap();
        assert_eq!(json, "\"gate_design\"");
        let parsed: TaskPhase = serde_json::from_str("\"monitor\"").unwrap();
        assert_eq!(parsed, TaskPhase::Monitor);
    }

    #[test]
    fn test_transition_kind_roundtrip() {
        assert_eq!(TransitionKind::Backtrack.to_string(), "backtrack");
        assert_eq!(
            TransitionKind::from_str("forward").unwrap(),
            TransitionKind::Forward
        );
        assert!(TransitionKind::from_str("sideways").is_err());
    }
}
