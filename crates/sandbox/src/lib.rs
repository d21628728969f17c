//! Stagecraft code sandbox adapter.
//!
//! Implements [`pipeline::CodeSandbox`]. Each execution gets a fresh temporary
//! working directory holding the candidate files; the invocation runs either
//! inside a throwaway Docker container with networking disabled, or as a local
//! shell process for development machines without Docker.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Process management, container flags and timeouts live
//! here. The stage executor sees only [`pipeline::CodeSandbox`] and decides
//! what a failed run means for the stage.

use std::path::{Component, Path};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{
    CodeSandbox, ConfigurationError, SandboxFile, SandboxOutcome, SandboxRequest, SandboxSection,
    ToolError,
};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Working directory inside the container.
const CONTAINER_WORKDIR: &str = "/work";

/// Memory limit applied when none is configured.
pub const DEFAULT_MEMORY_LIMIT: &str = "512m";

/// Where the invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxMode {
    /// `docker run --rm --network none` with a memory limit.
    Docker {
        /// Image used for every language; per-language default when `None`.
        image: Option<String>,
        /// Value passed to `--memory`.
        memory_limit: String,
    },
    /// A plain `sh -c` in the working directory. No isolation.
    Local,
}

/// Runs candidate code in a temporary directory.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    mode: SandboxMode,
}

impl ProcessSandbox {
    /// Creates a sandbox in the given mode.
    pub fn new(mode: SandboxMode) -> Self {
        Self { mode }
    }

    /// Builds the sandbox from the `[sandbox]` configuration section.
    pub fn from_section(section: &SandboxSection) -> Result<Self, ConfigurationError> {
        let mode = match section.mode.as_str() {
            "docker" => SandboxMode::Docker {
                image: section.image.clone(),
                memory_limit: section
                    .memory_limit
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MEMORY_LIMIT.to_string()),
            },
            "local" => SandboxMode::Local,
            other => {
                return Err(ConfigurationError::invalid(format!(
                    "unknown sandbox mode '{other}'"
                )))
            }
        };
        Ok(Self::new(mode))
    }

    /// The configured mode.
    pub fn mode(&self) -> &SandboxMode {
        &self.mode
    }

    /// Checks that the sandbox runtime can be started.
    pub async fn is_available(&self) -> bool {
        match self.mode {
            SandboxMode::Local => true,
            SandboxMode::Docker { .. } => Command::new("docker")
                .arg("info")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false),
        }
    }
}

/// Default container image for a language.
pub fn default_image(language: &str) -> &'static str {
    match language.to_ascii_lowercase().as_str() {
        "python" | "py" => "python:3.12-slim",
        "rust" | "rs" => "rust:1-slim",
        "javascript" | "js" | "typescript" | "ts" | "node" => "node:20-slim",
        "go" => "golang:1.22",
        _ => "debian:stable-slim",
    }
}

/// Arguments passed to `docker` for one execution.
fn docker_args(
    container: &str,
    workdir: &Path,
    image: &str,
    memory_limit: &str,
    invocation: &str,
) -> Vec<String> {
    vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        container.into(),
        "--network".into(),
        "none".into(),
        "--memory".into(),
        memory_limit.into(),
        "--volume".into(),
        format!("{}:{CONTAINER_WORKDIR}", workdir.display()),
        "--workdir".into(),
        CONTAINER_WORKDIR.into(),
        image.into(),
        "sh".into(),
        "-c".into(),
        invocation.into(),
    ]
}

/// Rejects file names that would land outside the working directory.
fn check_file_name(file: &SandboxFile) -> Result<(), ToolError> {
    let path = Path::new(&file.name);
    let safe = !file.name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(ToolError::Io(format!(
            "refusing to write '{}' outside the sandbox",
            file.name
        )))
    }
}

async fn write_files(dir: &Path, files: &[SandboxFile]) -> Result<(), ToolError> {
    for file in files {
        check_file_name(file)?;
        let path = dir.join(&file.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Io(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, &file.content)
            .await
            .map_err(|e| ToolError::Io(format!("{}: {e}", path.display())))?;
    }
    Ok(())
}

#[async_trait]
impl CodeSandbox for ProcessSandbox {
    #[instrument(skip_all, fields(language = %request.language, files = request.files.len()))]
    async fn execute(&self, request: &SandboxRequest) -> Result<SandboxOutcome, ToolError> {
        let workdir = tempfile::Builder::new()
            .prefix("stagecraft-sandbox-")
            .tempdir()
            .map_err(|e| ToolError::Io(e.to_string()))?;
        write_files(workdir.path(), &request.files).await?;

        let container = format!("stagecraft-{}", uuid::Uuid::new_v4());
        let mut command = match &self.mode {
            SandboxMode::Docker {
                image,
                memory_limit,
            } => {
                let image = image
                    .as_deref()
                    .unwrap_or_else(|| default_image(&request.language));
                let mut cmd = Command::new("docker");
                cmd.args(docker_args(
                    &container,
                    workdir.path(),
                    image,
                    memory_limit,
                    &request.invocation,
                ));
                cmd
            }
            SandboxMode::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c")
                    .arg(&request.invocation)
                    .current_dir(workdir.path());
                cmd
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(invocation = %request.invocation, "starting sandbox process");
        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ToolError::Unavailable(format!("sandbox runtime not found: {e}"))
            }
            _ => ToolError::Unavailable(e.to_string()),
        })?;

        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ToolError::Io(e.to_string()))?,
            Err(_) => {
                // Dropping the child kills the docker client but not the container.
                if matches!(self.mode, SandboxMode::Docker { .. }) {
                    stop_container(&container).await;
                }
                warn!(timeout = ?request.timeout, "sandbox execution timed out");
                return Err(ToolError::Timeout {
                    after: request.timeout,
                });
            }
        };

        let outcome = SandboxOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };
        info!(
            exit_code = ?outcome.exit_code,
            stdout_len = outcome.stdout.len(),
            stderr_len = outcome.stderr.len(),
            "sandbox execution completed"
        );
        Ok(outcome)
    }
}

async fn stop_container(container: &str) {
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        Command::new("docker")
            .args(["kill", container])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await;
    if !matches!(result, Ok(Ok(status)) if status.success()) {
        warn!(container, "could not kill timed-out container");
    }
}
