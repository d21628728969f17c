//! Stage executor: one stage, one bounded retry/repair state machine.
//!
//! ```text
//! assemble prompt ─▶ backend call (retried inside the gateway)
//!        ▲                 │
//!        │                 ▼
//!   correction ◀── validate shapes ─▶ run tools ─▶ Succeeded
//!   (repairs < max)        │               │
//!                          └── exhausted ──┴──▶ Failed(validation | tool)
//! ```
//!
//! The executor has no side effects beyond backend calls and tool runs.
//! Persisting artifacts and memory is the orchestrator's job; every outcome,
//! including failure, is returned as an [`ExecutionResult`].

use std::sync::Arc;
use std::time::Instant;

use pipeline::{
    Artifact, ArtifactName, ArtifactShape, BackendConfig, CodeSandbox, ErrorKind, ExecutionResult,
    LlmRequest, SandboxBinding, SandboxFile, SandboxRequest, StageDefinition, StageFailure,
    StageOutcome, ToolBinding, ToolError, TokenUsage, DEFAULT_MAX_CONTEXT_CHARS,
};
use tracing::{debug, info, instrument, warn};

use crate::gateway::{GatewayError, LlmGateway};
use crate::output::parse_outputs;
use crate::prompt::{assemble, Correction, InputContext};

/// Longest tail of sandbox stdout/stderr fed back to the model.
const MAX_TOOL_OUTPUT_CHARS: usize = 2_000;

/// Why a produced output was not accepted.
enum Rejection {
    /// Repairable: fed back to the model.
    Repairable { kind: ErrorKind, problem: String },
    /// Not repairable: the stage fails immediately.
    Fatal { kind: ErrorKind, message: String },
}

/// Runs single stages.
#[derive(Clone)]
pub struct StageExecutor {
    gateway: Arc<LlmGateway>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
    max_context_chars: usize,
}

impl StageExecutor {
    /// Creates an executor without a sandbox.
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self {
            gateway,
            sandbox: None,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }

    /// Installs the sandbox used by stages that bind one.
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Sets the prompt size ceiling in characters.
    #[must_use]
    pub fn with_max_context_chars(mut self, max_chars: usize) -> Self {
        self.max_context_chars = max_chars;
        self
    }

    /// Returns `true` if a sandbox is installed.
    pub fn has_sandbox(&self) -> bool {
        self.sandbox.is_some()
    }

    /// The gateway used for backend calls.
    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    /// Executes `stage` against `backend` with the given input context.
    #[instrument(skip_all, fields(run_id = %input.run_id, stage = %stage.id, backend = %backend.backend.id))]
    pub async fn execute(
        &self,
        stage: &StageDefinition,
        backend: &BackendConfig,
        input: &InputContext,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut attempts = 0;
        let mut repairs = 0;
        let mut usage = TokenUsage::default();
        let mut correction: Option<Correction> = None;

        let outcome = loop {
            let prompt = assemble(stage, input, correction.as_ref(), self.max_context_chars);
            if prompt.dropped_memory > 0 || prompt.truncated_inputs > 0 {
                debug!(
                    dropped_memory = prompt.dropped_memory,
                    truncated_inputs = prompt.truncated_inputs,
                    "prompt trimmed to fit the context window"
                );
            }
            let request = LlmRequest {
                stage: stage.id.clone(),
                system: prompt.system,
                prompt: prompt.user,
                params: backend.params.clone(),
            };

            let response = match self.gateway.complete(backend, &request).await {
                Ok(ok) => {
                    attempts += ok.attempts;
                    ok.response
                }
                Err(failure) => {
                    attempts += failure.attempts;
                    let kind = match failure.error {
                        GatewayError::Unrouted(_) => ErrorKind::Configuration,
                        GatewayError::Backend(_) => ErrorKind::Backend,
                    };
                    break Err(StageFailure {
                        kind,
                        message: failure.to_string(),
                    });
                }
            };
            usage += response.usage;

            let rejection = match parse_outputs(stage, &response.content) {
                Err(invalid) => Rejection::Repairable {
                    kind: ErrorKind::Validation,
                    problem: invalid.to_string(),
                },
                Ok(artifacts) => match self.run_tools(stage, &artifacts, input).await {
                    Ok(()) => break Ok(artifacts),
                    Err(rejection) => rejection,
                },
            };

            match rejection {
                Rejection::Fatal { kind, message } => break Err(StageFailure { kind, message }),
                Rejection::Repairable { kind, problem } => {
                    if repairs >= stage.max_repairs {
                        warn!(repairs, kind = %kind, "repair budget exhausted");
                        break Err(StageFailure {
                            kind,
                            message: problem,
                        });
                    }
                    repairs += 1;
                    info!(repair = repairs, kind = %kind, "output rejected, requesting repair");
                    correction = Some(Correction {
                        problem,
                        previous_response: response.content,
                    });
                }
            }
        };

        let latency = started.elapsed();
        match outcome {
            Ok(artifacts) => {
                info!(attempts, repairs, ?latency, "stage succeeded");
                ExecutionResult {
                    stage: stage.id.clone(),
                    outcome: StageOutcome::Succeeded,
                    attempts,
                    repairs,
                    latency,
                    usage,
                    artifacts,
                }
            }
            Err(failure) => {
                warn!(attempts, repairs, kind = %failure.kind, error = %failure.message, "stage failed");
                ExecutionResult {
                    stage: stage.id.clone(),
                    outcome: StageOutcome::Failed(failure),
                    attempts,
                    repairs,
                    latency,
                    usage,
                    artifacts: Vec::new(),
                }
            }
        }
    }

    async fn run_tools(
        &self,
        stage: &StageDefinition,
        artifacts: &[Artifact],
        input: &InputContext,
    ) -> Result<(), Rejection> {
        for tool in &stage.tools {
            match tool {
                ToolBinding::Sandbox(binding) => {
                    self.run_sandbox(stage, binding, artifacts, input).await?
                }
            }
        }
        Ok(())
    }

    async fn run_sandbox(
        &self,
        stage: &StageDefinition,
        binding: &SandboxBinding,
        artifacts: &[Artifact],
        input: &InputContext,
    ) -> Result<(), Rejection> {
        let Some(sandbox) = &self.sandbox else {
            return Err(Rejection::Fatal {
                kind: ErrorKind::Tool,
                message: "stage binds the sandbox but none is installed".into(),
            });
        };

        let request = SandboxRequest {
            language: binding.language.clone(),
            files: sandbox_files(stage, binding, artifacts, input),
            invocation: binding.invocation.clone(),
            timeout: binding.timeout,
        };
        match sandbox.execute(&request).await {
            Ok(outcome) if outcome.succeeded() => {
                debug!("sandbox run passed");
                Ok(())
            }
            Ok(outcome) => Err(Rejection::Repairable {
                kind: ErrorKind::Tool,
                problem: format!(
                    "Running `{}` failed with exit status {}.\nstdout:\n{}\nstderr:\n{}",
                    binding.invocation,
                    outcome
                        .exit_code
                        .map_or_else(|| "none (killed)".to_string(), |c| c.to_string()),
                    tail(&outcome.stdout, MAX_TOOL_OUTPUT_CHARS),
                    tail(&outcome.stderr, MAX_TOOL_OUTPUT_CHARS),
                ),
            }),
            Err(ToolError::Timeout { after }) => Err(Rejection::Repairable {
                kind: ErrorKind::Tool,
                problem: format!(
                    "Running `{}` did not finish within {}s; the code may loop or block.",
                    binding.invocation,
                    after.as_secs()
                ),
            }),
            Err(error) => Err(Rejection::Fatal {
                kind: ErrorKind::Tool,
                message: error.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("gateway", &self.gateway)
            .field("sandbox", &self.sandbox.is_some())
            .field("max_context_chars", &self.max_context_chars)
            .finish()
    }
}

/// Files placed in the sandbox: the stage's code outputs plus code inputs.
///
/// A stage whose outputs are not code-shaped contributes all of its outputs.
fn sandbox_files(
    stage: &StageDefinition,
    binding: &SandboxBinding,
    artifacts: &[Artifact],
    input: &InputContext,
) -> Vec<SandboxFile> {
    let is_code = |name: &ArtifactName| {
        stage
            .outputs
            .iter()
            .any(|o| &o.name == name && matches!(o.shape, ArtifactShape::Code { .. }))
    };
    let any_code = artifacts.iter().any(|a| is_code(&a.name));

    let mut files: Vec<SandboxFile> = input
        .inputs
        .iter()
        .filter(|i| matches!(i.shape, Some(ArtifactShape::Code { .. })))
        .map(|i| SandboxFile {
            name: file_name(&i.name, &binding.language),
            content: i.content.clone(),
        })
        .collect();
    files.extend(
        artifacts
            .iter()
            .filter(|a| !any_code || is_code(&a.name))
            .map(|a| SandboxFile {
                name: file_name(&a.name, &binding.language),
                content: a.content.as_text().into_owned(),
            }),
    );
    files
}

/// Artifact name as a file name, adding the language's extension when the
/// name has none.
pub fn file_name(name: &ArtifactName, language: &str) -> String {
    let name = name.as_str();
    if name.contains('.') {
        return name.to_string();
    }
    let extension = match language.to_ascii_lowercase().as_str() {
        "python" | "py" => "py",
        "rust" | "rs" => "rs",
        "javascript" | "js" | "node" => "js",
        "typescript" | "ts" => "ts",
        "go" => "go",
        "shell" | "sh" | "bash" => "sh",
        _ => return name.to_string(),
    };
    format!("{name}.{extension}")
}

fn tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().skip(total - max_chars).collect();
    format!("[... {} earlier characters omitted]\n{kept}", total - max_chars)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::prompt::{InputSource, ResolvedInput};
    use async_trait::async_trait;
    use llm::StubProvider;
    use pipeline::{
        BackendDefinition, BackendId, BackendKind, LlmError, ModelParameters, OutputSpec,
        RetrySettings, RunId, SandboxOutcome, StageId,
    };

    struct ScriptedSandbox {
        outcomes: Mutex<VecDeque<Result<SandboxOutcome, ToolError>>>,
        requests: Mutex<Vec<SandboxRequest>>,
    }

    impl ScriptedSandbox {
        fn new(outcomes: Vec<Result<SandboxOutcome, ToolError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CodeSandbox for ScriptedSandbox {
        async fn execute(&self, request: &SandboxRequest) -> Result<SandboxOutcome, ToolError> {
            self.requests.lock().unwrap().push(request.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(exit(0, "")))
        }
    }

    fn exit(code: i32, stderr: &str) -> SandboxOutcome {
        SandboxOutcome {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }

    fn backend() -> BackendConfig {
        let backend = BackendDefinition::new(BackendId::new("stub").unwrap(), BackendKind::Stub)
            .with_retry(RetrySettings {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                multiplier: 1.0,
            });
        BackendConfig {
            params: ModelParameters::new(backend.id.clone(), "stub"),
            backend,
        }
    }

    fn executor(stub: Arc<StubProvider>) -> StageExecutor {
        let gateway = LlmGateway::new().with_backend(&backend().backend, stub);
        StageExecutor::new(Arc::new(gateway))
    }

    fn code_stage() -> StageDefinition {
        StageDefinition::new(StageId::new("code").unwrap(), "Write the module.")
            .with_output(OutputSpec::code(ArtifactName::new("module").unwrap(), "python"))
            .with_max_repairs(2)
    }

    fn sandboxed(stage: StageDefinition) -> StageDefinition {
        stage.with_tool(ToolBinding::Sandbox(SandboxBinding {
            language: "python".into(),
            invocation: "python -c 'import module'".into(),
            timeout: Duration::from_secs(5),
        }))
    }

    fn input() -> InputContext {
        InputContext {
            run_id: RunId::new("r1").unwrap(),
            inputs: vec![ResolvedInput {
                name: ArtifactName::new("design.md").unwrap(),
                content: "D".into(),
                shape: Some(ArtifactShape::Text),
                source: InputSource::RunContext,
            }],
            memory: Vec::new(),
        }
    }

    #[tokio::test]
    async fn successful_stage_returns_artifacts() {
        let stub = Arc::new(StubProvider::fixed("M"));
        let result = executor(stub.clone())
            .execute(&code_stage(), &backend(), &input())
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.repairs, 0);
        assert_eq!(result.artifacts[0].content.as_text(), "M");
        assert!(stub.requests()[0].prompt.contains("## Input: design.md"));
    }

    #[tokio::test]
    async fn validation_failure_is_repaired_with_feedback() {
        let stub = Arc::new(StubProvider::scripted(vec![
            Ok("```python\n```".into()),
            Ok("```python\nx = 1\n```".into()),
        ]));
        let result = executor(stub.clone())
            .execute(&code_stage(), &backend(), &input())
            .await;

        assert!(result.is_success());
        assert_eq!(result.repairs, 1);
        assert_eq!(result.attempts, 2);
        let repair_prompt = &stub.requests()[1].prompt;
        assert!(repair_prompt.contains("## Correction"));
        assert!(repair_prompt.contains("code is empty"));
    }

    #[tokio::test]
    async fn exhausted_repairs_fail_with_validation() {
        let stub = Arc::new(StubProvider::fixed("   "));
        let result = executor(stub.clone())
            .execute(&code_stage(), &backend(), &input())
            .await;

        assert_eq!(result.failure().unwrap().kind, ErrorKind::Validation);
        assert_eq!(result.repairs, 2);
        assert_eq!(stub.calls(), 3);
        assert!(result.artifacts.is_empty());
    }

    #[tokio::test]
    async fn failing_tool_run_is_fed_back() {
        let stub = Arc::new(StubProvider::scripted(vec![
            Ok("broken(".into()),
            Ok("fixed = True".into()),
        ]));
        let sandbox = ScriptedSandbox::new(vec![Ok(exit(1, "SyntaxError: bad input"))]);
        let result = executor(stub.clone())
            .with_sandbox(sandbox.clone())
            .execute(&sandboxed(code_stage()), &backend(), &input())
            .await;

        assert!(result.is_success());
        assert_eq!(result.repairs, 1);
        assert!(stub.requests()[1].prompt.contains("SyntaxError: bad input"));

        let requests = sandbox.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].files[0].name, "module.py");
        assert_eq!(requests[1].files[0].content, "fixed = True");
    }

    #[tokio::test]
    async fn sandbox_timeouts_are_repairable() {
        let stub = Arc::new(StubProvider::fixed("while True: pass"));
        let sandbox = ScriptedSandbox::new(vec![
            Err(ToolError::Timeout {
                after: Duration::from_secs(5),
            });
            3
        ]);
        let result = executor(stub)
            .with_sandbox(sandbox)
            .execute(&sandboxed(code_stage()), &backend(), &input())
            .await;

        let failure = result.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Tool);
        assert!(failure.message.contains("did not finish"));
        assert_eq!(result.repairs, 2);
    }

    #[tokio::test]
    async fn unavailable_sandbox_fails_without_repair() {
        let stub = Arc::new(StubProvider::fixed("x = 1"));
        let sandbox = ScriptedSandbox::new(vec![Err(ToolError::Unavailable("no docker".into()))]);
        let result = executor(stub.clone())
            .with_sandbox(sandbox)
            .execute(&sandboxed(code_stage()), &backend(), &input())
            .await;

        assert_eq!(result.failure().unwrap().kind, ErrorKind::Tool);
        assert_eq!(result.repairs, 0);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn backend_failure_reports_attempts() {
        let stub = Arc::new(StubProvider::scripted(vec![Err(LlmError::Transport(
            "connection reset".into(),
        ))]));
        let result = executor(stub)
            .execute(&code_stage(), &backend(), &input())
            .await;

        assert_eq!(result.failure().unwrap().kind, ErrorKind::Backend);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.repairs, 0);
    }

    #[test]
    fn file_names_gain_language_extension() {
        let module = ArtifactName::new("module").unwrap();
        assert_eq!(file_name(&module, "python"), "module.py");
        let app = ArtifactName::new("app.py").unwrap();
        assert_eq!(file_name(&app, "python"), "app.py");
        assert_eq!(file_name(&module, "cobol"), "module");
    }

    #[test]
    fn code_inputs_join_the_sandbox() {
        let stage = sandboxed(
            StageDefinition::new(StageId::new("test").unwrap(), "Write tests.").with_output(
                OutputSpec::code(ArtifactName::new("test_module.py").unwrap(), "python"),
            ),
        );
        let mut ctx = input();
        ctx.inputs.push(ResolvedInput {
            name: ArtifactName::new("module").unwrap(),
            content: "M".into(),
            shape: Some(ArtifactShape::Code {
                language: Some("python".into()),
            }),
            source: InputSource::RunContext,
        });
        let artifacts = vec![Artifact::new(
            ArtifactName::new("test_module.py").unwrap(),
            stage.id.clone(),
            "import module",
        )];

        let binding = stage.sandbox().unwrap().clone();
        let names: Vec<String> = sandbox_files(&stage, &binding, &artifacts, &ctx)
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["module.py", "test_module.py"]);
    }
}
