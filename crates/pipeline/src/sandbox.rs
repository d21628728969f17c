//! Sandboxed code-execution port.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A file placed in the sandbox working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFile {
    /// File name relative to the working directory.
    pub name: String,
    /// File contents.
    pub content: String,
}

/// Candidate code plus the command expected to exercise it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Language of the code (selects the container image).
    pub language: String,
    /// Files written before the invocation runs.
    pub files: Vec<SandboxFile>,
    /// Shell command run in the working directory.
    pub invocation: String,
    /// Wall-clock ceiling.
    pub timeout: Duration,
}

/// What the invocation printed and how it exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOutcome {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Exit status; `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl SandboxOutcome {
    /// Returns `true` for a zero exit status.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// The tool itself failed (as opposed to the code under test failing).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ToolError {
    /// The invocation exceeded its ceiling and was killed.
    #[error("Sandbox execution timed out after {after:?}")]
    Timeout {
        /// The elapsed ceiling.
        after: Duration,
    },

    /// The sandbox could not be started (missing runtime, bad image, …).
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    /// Preparing the working directory or collecting output failed.
    #[error("Sandbox I/O error: {0}")]
    Io(String),
}

/// Executes candidate code in isolation.
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    /// Writes the files, runs the invocation and reports its outcome.
    ///
    /// A non-zero exit is an `Ok` outcome; `Err` means the sandbox itself failed.
    async fn execute(&self, request: &SandboxRequest) -> Result<SandboxOutcome, ToolError>;
}
