//! Top-level error and retry-policy types for the pipeline domain.
//!
//! [`ConfigurationError`] covers conditions detected before a run starts; a run
//! never begins with an invalid configuration. Component-level errors (backend
//! failures, tool failures, memory and artifact storage failures) are defined in
//! their respective modules.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].
//!
//! [`ErrorKind`] is the only error information that crosses the run boundary:
//! a failed run reports the first failing stage and its terminal kind, never a
//! raw backend message chain.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ArtifactName, BackendId, RunId, StageId};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by backend error types to let the stage executor decide whether to
/// re-invoke an operation.
///
/// - `Retryable` errors: timeouts, rate-limit responses, 5xx responses,
///   transport failures.
/// - `NonRetryable` errors: authentication failures, rejected requests,
///   malformed responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Terminal error classification
// ---------------------------------------------------------------------------

/// Terminal error kind of a failed stage, as reported to run-trigger callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Stage configuration could not be resolved.
    Configuration,
    /// The backend kept failing (timeout, rate limit, transport, server error).
    Backend,
    /// Model output never matched the declared artifact shapes.
    Validation,
    /// The bound tool kept rejecting the model's output.
    Tool,
    /// Produced artifacts could not be committed to the artifact sink.
    Storage,
    /// The run was cancelled at a stage boundary.
    Cancelled,
    /// The orchestrator loop hit an invalid run-state transition.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Backend => "backend",
            ErrorKind::Validation => "validation",
            ErrorKind::Tool => "tool",
            ErrorKind::Storage => "storage",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// The pipeline configuration cannot be executed.
///
/// Always produced before the first backend call of a run; a run that fails
/// with a configuration error has no side effects.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ConfigurationError {
    /// The pipeline declares no stages.
    #[error("Pipeline declares no stages")]
    EmptyPipeline,

    /// Two stages share an identifier.
    #[error("Stage '{stage}' is declared more than once")]
    DuplicateStage {
        /// The repeated identifier.
        stage: StageId,
    },

    /// Two stages declare the same output artifact.
    #[error("Artifact '{artifact}' is produced by both '{first}' and '{second}'")]
    DuplicateArtifact {
        /// The contested artifact name.
        artifact: ArtifactName,
        /// Stage declared first.
        first: StageId,
        /// Stage declared second.
        second: StageId,
    },

    /// A stage names a dependency that is not declared.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The dependent stage.
        stage: StageId,
        /// The missing dependency.
        dependency: String,
    },

    /// The stage graph contains a cycle.
    #[error("Stage graph contains a cycle through: {stages}")]
    CycleDetected {
        /// Comma-separated identifiers of the stages left unordered.
        stages: String,
    },

    /// A declared input can be satisfied neither by the run context nor by memory.
    #[error("Stage '{stage}' input '{input}' is not produced upstream and not available in memory")]
    UnsatisfiedInput {
        /// The stage that cannot start.
        stage: StageId,
        /// The missing input key.
        input: ArtifactName,
    },

    /// A stage has no model binding and no override.
    #[error("Stage '{stage}' has no bound backend")]
    UnboundStage {
        /// The unbound stage.
        stage: StageId,
    },

    /// A stage binds a backend id that is not configured.
    #[error("Stage '{stage}' binds unknown backend '{backend}'")]
    UnknownBackend {
        /// The stage holding the binding.
        stage: StageId,
        /// The unresolved backend id.
        backend: BackendId,
    },

    /// A stage binds a tool that is not available in this process.
    #[error("Stage '{stage}' binds tool '{tool}' but no such tool is installed")]
    ToolUnavailable {
        /// The stage holding the binding.
        stage: StageId,
        /// Tool label.
        tool: String,
    },

    /// Any other invalid value (parse failures, out-of-range settings).
    #[error("Configuration error: {message}")]
    Invalid {
        /// Description of the configuration problem.
        message: String,
    },
}

impl ConfigurationError {
    /// Convenience constructor for [`ConfigurationError::Invalid`].
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigurationError::Invalid {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// Model output does not match the stage's declared artifact shapes.
///
/// The message is fed back to the model as corrective context on the next
/// repair attempt, so it is phrased as an instruction target.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Output validation failed{}: {reason}", artifact_suffix(.artifact))]
pub struct ValidationError {
    /// The artifact whose content was rejected, when attributable.
    pub artifact: Option<ArtifactName>,
    /// What was wrong with the output.
    pub reason: String,
}

fn artifact_suffix(artifact: &Option<ArtifactName>) -> String {
    artifact
        .as_ref()
        .map(|a| format!(" for '{a}'"))
        .unwrap_or_default()
}

impl ValidationError {
    /// Creates a validation error attributed to one artifact.
    pub fn for_artifact(artifact: &ArtifactName, reason: impl Into<String>) -> Self {
        Self {
            artifact: Some(artifact.clone()),
            reason: reason.into(),
        }
    }

    /// Creates a validation error concerning the response as a whole.
    pub fn whole_response(reason: impl Into<String>) -> Self {
        Self {
            artifact: None,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run-level errors
// ---------------------------------------------------------------------------

/// Errors that prevent a run from starting.
///
/// Stage failures are not errors at this level; they are reported in the
/// [`crate::RunReport`] with status [`crate::RunStatus::Failed`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Preflight validation rejected the run before any backend call.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A run with the same identifier has already been started.
    #[error("Run '{run_id}' already exists")]
    DuplicateRun {
        /// The reused identifier.
        run_id: RunId,
    },

    /// The run state machine rejected a transition. Indicates a bug in the
    /// orchestrator loop, not a stage failure.
    #[error(transparent)]
    Transition(#[from] crate::TransitionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_reports_retryability() {
        assert!(RetryPolicy::Retryable { after: None }.is_retryable());
        assert!(!RetryPolicy::NonRetryable.is_retryable());
    }

    #[test]
    fn unsatisfied_input_names_stage_and_key() {
        let err = ConfigurationError::UnsatisfiedInput {
            stage: StageId::new("code").unwrap(),
            input: ArtifactName::new("requirements").unwrap(),
        };
        let message = err.to_string();
        assert!(message.contains("'code'"));
        assert!(message.contains("'requirements'"));
    }

    #[test]
    fn validation_error_mentions_artifact_when_known() {
        let name = ArtifactName::new("report").unwrap();
        let err = ValidationError::for_artifact(&name, "expected JSON");
        assert_eq!(
            err.to_string(),
            "Output validation failed for 'report': expected JSON"
        );
        let err = ValidationError::whole_response("empty response");
        assert_eq!(err.to_string(), "Output validation failed: empty response");
    }

    #[test]
    fn orchestrator_error_wraps_configuration_error() {
        let err: OrchestratorError = ConfigurationError::EmptyPipeline.into();
        assert!(matches!(
            err,
            OrchestratorError::Configuration(ConfigurationError::EmptyPipeline)
        ));
    }

    #[test]
    fn error_kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Validation).unwrap();
        assert_eq!(json, "\"validation\"");
        assert_eq!(ErrorKind::Cancelled.to_string(), "cancelled");
    }
}
