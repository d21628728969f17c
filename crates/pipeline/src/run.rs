//! Run state machine, per-stage execution results and run reports.
//!
//! ```text
//! PENDING ──start──▶ RUNNING(s0) ──advance──▶ RUNNING(s1) ── … ──complete──▶ COMPLETED
//!                         │                        │
//!                         └────────fail────────────┴──────────▶ FAILED(stage, kind)
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Artifact, ArtifactName, ErrorKind, RunId, StageId, TokenUsage};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Externally visible status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created and seeded; no stage has started.
    Pending,
    /// The named stage is executing.
    Running {
        /// Stage in flight.
        stage: StageId,
    },
    /// A stage exhausted its budgets (or the run was cancelled before it).
    Failed {
        /// First failing stage.
        stage: StageId,
        /// Terminal error kind.
        kind: ErrorKind,
    },
    /// Every stage succeeded.
    Completed,
}

impl RunStatus {
    /// Returns `true` for `FAILED` and `COMPLETED`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Failed { .. } | RunStatus::Completed)
    }

    /// Upper-case label (`PENDING`, `RUNNING`, `FAILED`, `COMPLETED`).
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running { .. } => "RUNNING",
            RunStatus::Failed { .. } => "FAILED",
            RunStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running { stage } => write!(f, "RUNNING({stage})"),
            RunStatus::Failed { stage, kind } => write!(f, "FAILED({stage}: {kind})"),
            other => f.write_str(other.label()),
        }
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// An attempted transition that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid run transition from {from} via {attempted}")]
pub struct TransitionError {
    /// Status at the time of the attempt.
    pub from: RunStatus,
    /// Name of the attempted transition.
    pub attempted: &'static str,
}

/// The state machine of one run.
///
/// Tracks which stages have succeeded so a `FAILED` run can report exactly
/// which part of its artifact set is trustworthy.
#[derive(Debug, Clone)]
pub struct RunState {
    run_id: RunId,
    status: RunStatus,
    succeeded: Vec<StageId>,
}

impl RunState {
    /// A new run in `PENDING`.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            succeeded: Vec::new(),
        }
    }

    /// The run this state belongs to.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Current status.
    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Stages that completed successfully, in execution order.
    pub fn succeeded(&self) -> &[StageId] {
        &self.succeeded
    }

    /// `PENDING → RUNNING(stage)`.
    pub fn start(&mut self, stage: StageId) -> Result<(), TransitionError> {
        match self.status {
            RunStatus::Pending => {
                self.status = RunStatus::Running { stage };
                Ok(())
            }
            _ => Err(self.reject("start")),
        }
    }

    /// `RUNNING(i) → RUNNING(next)` after stage i committed its artifacts.
    pub fn advance(&mut self, next: StageId) -> Result<(), TransitionError> {
        let finished = self.take_running("advance")?;
        self.succeeded.push(finished);
        self.status = RunStatus::Running { stage: next };
        Ok(())
    }

    /// `RUNNING(last) → COMPLETED`.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        let finished = self.take_running("complete")?;
        self.succeeded.push(finished);
        self.status = RunStatus::Completed;
        Ok(())
    }

    /// `RUNNING(i) → FAILED(i, kind)`.
    pub fn fail(&mut self, kind: ErrorKind) -> Result<(), TransitionError> {
        let stage = self.take_running("fail")?;
        self.status = RunStatus::Failed { stage, kind };
        Ok(())
    }

    /// `PENDING → FAILED(stage, Cancelled)` for a run cancelled before its
    /// first stage; running runs use [`RunState::fail`].
    pub fn cancel_before(&mut self, stage: StageId) -> Result<(), TransitionError> {
        match self.status {
            RunStatus::Pending => {
                self.status = RunStatus::Failed {
                    stage,
                    kind: ErrorKind::Cancelled,
                };
                Ok(())
            }
            _ => Err(self.reject("cancel")),
        }
    }

    fn take_running(&self, attempted: &'static str) -> Result<StageId, TransitionError> {
        match &self.status {
            RunStatus::Running { stage } => Ok(stage.clone()),
            _ => Err(self.reject(attempted)),
        }
    }

    fn reject(&self, attempted: &'static str) -> TransitionError {
        TransitionError {
            from: self.status.clone(),
            attempted,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Terminal classification.
    pub kind: ErrorKind,
    /// Detail of the last error (kept for logs; not part of the run status).
    pub message: String,
}

/// Outcome of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// All declared artifacts were produced and validated.
    Succeeded,
    /// The stage gave up.
    Failed(StageFailure),
}

/// Per-stage execution record, kept by the orchestrator for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The stage executed.
    pub stage: StageId,
    /// Success or failure detail.
    pub outcome: StageOutcome,
    /// Total backend invocations, retries and repairs included.
    pub attempts: u32,
    /// Repair rounds triggered by validation or tool failures.
    pub repairs: u32,
    /// Wall-clock time spent in the stage.
    pub latency: Duration,
    /// Tokens consumed across all attempts.
    pub usage: TokenUsage,
    /// Artifacts produced (empty on failure).
    pub artifacts: Vec<Artifact>,
}

impl ExecutionResult {
    /// Returns `true` if the stage succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StageOutcome::Succeeded)
    }

    /// The failure detail, if the stage failed.
    pub fn failure(&self) -> Option<&StageFailure> {
        match &self.outcome {
            StageOutcome::Failed(failure) => Some(failure),
            StageOutcome::Succeeded => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Final (or current) view of a run returned by the run trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// The run.
    pub run_id: RunId,
    /// Terminal status.
    pub status: RunStatus,
    /// Stages that succeeded, in execution order.
    pub succeeded: Vec<StageId>,
    /// One record per executed stage.
    pub results: Vec<ExecutionResult>,
    /// Artifacts committed by successful stages.
    pub artifacts: BTreeMap<ArtifactName, Artifact>,
}

impl RunReport {
    /// First failing stage and its error kind, for `FAILED` runs.
    pub fn failure(&self) -> Option<(&StageId, ErrorKind)> {
        match &self.status {
            RunStatus::Failed { stage, kind } => Some((stage, *kind)),
            _ => None,
        }
    }

    /// Text of a committed artifact.
    pub fn artifact_text(&self, name: &str) -> Option<String> {
        let name = ArtifactName::new(name)?;
        self.artifacts
            .get(&name)
            .map(|a| a.content.as_text().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> StageId {
        StageId::new(s).unwrap()
    }

    #[test]
    fn happy_path_records_succeeded_stages() {
        let mut state = RunState::new(RunId::new("r").unwrap());
        state.start(id("spec")).unwrap();
        state.advance(id("code")).unwrap();
        state.complete().unwrap();

        assert_eq!(state.status(), &RunStatus::Completed);
        assert_eq!(state.succeeded(), &[id("spec"), id("code")]);
    }

    #[test]
    fn failure_keeps_prior_successes() {
        let mut state = RunState::new(RunId::new("r").unwrap());
        state.start(id("spec")).unwrap();
        state.advance(id("code")).unwrap();
        state.fail(ErrorKind::Backend).unwrap();

        assert_eq!(
            state.status(),
            &RunStatus::Failed {
                stage: id("code"),
                kind: ErrorKind::Backend
            }
        );
        assert_eq!(state.succeeded(), &[id("spec")]);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut state = RunState::new(RunId::new("r").unwrap());
        assert!(state.advance(id("x")).is_err());
        assert!(state.complete().is_err());

        state.start(id("spec")).unwrap();
        state.complete().unwrap();
        let err = state.start(id("again")).unwrap_err();
        assert_eq!(err.from, RunStatus::Completed);
        assert!(state.fail(ErrorKind::Tool).is_err());
    }

    #[test]
    fn cancellation_before_first_stage() {
        let mut state = RunState::new(RunId::new("r").unwrap());
        state.cancel_before(id("spec")).unwrap();
        assert_eq!(state.status().label(), "FAILED");
        assert!(state.status().is_terminal());
    }

    #[test]
    fn status_serializes_with_upper_case_tag() {
        let json = serde_json::to_value(RunStatus::Running { stage: id("code") }).unwrap();
        assert_eq!(json["status"], "RUNNING");
        assert_eq!(json["stage"], "code");
        assert_eq!(RunStatus::Pending.to_string(), "PENDING");
    }
}
