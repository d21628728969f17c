//! Declarative pipeline configuration (`.stagecraft/pipeline.toml`).
//!
//! The raw `*Section` types mirror the TOML layout and are deserialized with
//! `serde`. [`PipelineConfig::build`] validates them into domain types. Parsing
//! happens once at process start; nothing here performs I/O.
//!
//! ```toml
//! [pipeline]
//! name = "engineering-team"
//!
//! [[backends]]
//! id = "claude"
//! kind = "anthropic"
//! api_key_env = "ANTHROPIC_API_KEY"
//!
//! [[stages]]
//! id = "requirements"
//! instructions = "Validate and structure the request."
//! inputs = ["request"]
//! outputs = [{ name = "requirements.md", shape = "text" }]
//! model = { backend = "claude", model = "claude-sonnet-4-5", max_tokens = 4096 }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    ArtifactName, ArtifactShape, BackendDefinition, BackendId, BackendKind, ConfigurationError,
    MemoryPolicy, ModelParameters, OutputSpec, PipelineGraph, PipelineName, RateLimit,
    RetrySettings, SandboxBinding, StageDefinition, StageId, ToolBinding, DEFAULT_MAX_REPAIRS,
    DEFAULT_RECALL_K, DEFAULT_SANDBOX_TIMEOUT,
};

/// Default ceiling on the assembled prompt size, in characters.
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 60_000;

/// Default completion token ceiling when a stage does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

// ---------------------------------------------------------------------------
// Raw TOML layout
// ---------------------------------------------------------------------------

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline-wide settings.
    #[serde(default)]
    pub pipeline: PipelineSection,
    /// Sandbox runtime settings.
    #[serde(default)]
    pub sandbox: SandboxSection,
    /// Configured backends.
    #[serde(default)]
    pub backends: Vec<BackendSection>,
    /// Stages, in declaration order.
    #[serde(default)]
    pub stages: Vec<StageSection>,
}

/// `[pipeline]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSection {
    /// Pipeline name.
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    /// Ceiling on the assembled prompt size.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Directory holding per-run artifact directories.
    pub artifact_root: Option<String>,
    /// File holding long-term and entity memory.
    pub memory_file: Option<String>,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            artifact_root: None,
            memory_file: None,
        }
    }
}

/// `[sandbox]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxSection {
    /// `"docker"` or `"local"`.
    #[serde(default = "default_sandbox_mode")]
    pub mode: String,
    /// Container image for Docker mode.
    pub image: Option<String>,
    /// Container memory limit for Docker mode (e.g. `"512m"`).
    pub memory_limit: Option<String>,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            mode: default_sandbox_mode(),
            image: None,
            memory_limit: None,
        }
    }
}

/// `[[backends]]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    /// Identifier stages bind to.
    pub id: String,
    /// Backend kind.
    pub kind: BackendKind,
    /// Base URL override.
    pub endpoint: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Per-call timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Retries after the first attempt.
    pub max_retries: Option<u32>,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: Option<u64>,
    /// Ceiling on any retry delay, in milliseconds.
    pub max_backoff_ms: Option<u64>,
    /// Shared request-start limit.
    pub requests_per_minute: Option<u32>,
    /// Shared in-flight request limit.
    pub max_concurrent: Option<usize>,
    /// Fixed completion for `kind = "stub"`.
    pub response: Option<String>,
}

/// `[[stages]]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StageSection {
    /// Stage identifier.
    pub id: String,
    /// System prompt for the stage.
    #[serde(default)]
    pub instructions: String,
    /// Declared input keys.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Explicit ordering dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputSection>,
    /// Model binding.
    pub model: Option<ModelSection>,
    /// Tool bindings.
    #[serde(default)]
    pub tools: Vec<ToolSection>,
    /// Repair attempts after validation or tool failures.
    pub max_repairs: Option<u32>,
    /// Memory publication policy.
    #[serde(default)]
    pub memory: MemoryPolicy,
    /// Memory records recalled into the prompt.
    pub recall: Option<usize>,
}

/// `[[stages.outputs]]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    /// Artifact name.
    pub name: String,
    /// `"text"`, `"code"` or `"json"`.
    #[serde(default = "default_shape")]
    pub shape: String,
    /// Language for code outputs.
    pub language: Option<String>,
}

/// `[stages.model]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSection {
    /// Backend id.
    pub backend: String,
    /// Model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Completion token ceiling.
    pub max_tokens: Option<u32>,
}

/// `[[stages.tools]]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ToolSection {
    /// Sandboxed execution of the stage's code outputs.
    Sandbox {
        /// Language of the code under test.
        language: String,
        /// Command to run.
        invocation: String,
        /// Execution ceiling in seconds.
        timeout_secs: Option<u64>,
    },
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

fn default_max_context_chars() -> usize {
    DEFAULT_MAX_CONTEXT_CHARS
}

fn default_sandbox_mode() -> String {
    "docker".to_string()
}

fn default_shape() -> String {
    "text".to_string()
}

// ---------------------------------------------------------------------------
// Validated result
// ---------------------------------------------------------------------------

/// Pipeline-wide settings after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Ceiling on the assembled prompt size.
    pub max_context_chars: usize,
    /// Directory holding per-run artifact directories.
    pub artifact_root: Option<String>,
    /// File holding long-term and entity memory.
    pub memory_file: Option<String>,
}

/// A configuration that passed structural validation.
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    /// The ordered stage graph.
    pub graph: PipelineGraph,
    /// Configured backends.
    pub backends: Vec<BackendDefinition>,
    /// Pipeline-wide settings.
    pub settings: PipelineSettings,
    /// Raw sandbox settings for the sandbox adapter.
    pub sandbox: SandboxSection,
}

impl PipelineConfig {
    /// Parses TOML text.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::Invalid`] carrying the parser message.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(text).map_err(|e| ConfigurationError::invalid(e.to_string()))
    }

    /// Validates the raw sections into domain types.
    pub fn build(self) -> Result<LoadedPipeline, ConfigurationError> {
        if self.pipeline.max_context_chars == 0 {
            return Err(ConfigurationError::invalid(
                "pipeline.max_context_chars must be positive",
            ));
        }
        let name = PipelineName::new(self.pipeline.name)
            .ok_or_else(|| ConfigurationError::invalid("pipeline.name must not be empty"))?;

        let mut backends = Vec::with_capacity(self.backends.len());
        for section in self.backends {
            let backend = build_backend(section)?;
            if backends
                .iter()
                .any(|b: &BackendDefinition| b.id == backend.id)
            {
                return Err(ConfigurationError::invalid(format!(
                    "backend '{}' is declared more than once",
                    backend.id
                )));
            }
            backends.push(backend);
        }

        if !matches!(self.sandbox.mode.as_str(), "docker" | "local") {
            return Err(ConfigurationError::invalid(format!(
                "sandbox.mode must be \"docker\" or \"local\", got \"{}\"",
                self.sandbox.mode
            )));
        }

        let stages = self
            .stages
            .into_iter()
            .map(build_stage)
            .collect::<Result<Vec<_>, _>>()?;
        let graph = PipelineGraph::new(name, stages)?;
        tracing::debug!(
            pipeline = %graph.name(),
            stages = graph.stages().len(),
            backends = backends.len(),
            "pipeline configuration validated"
        );

        Ok(LoadedPipeline {
            graph,
            backends,
            settings: PipelineSettings {
                max_context_chars: self.pipeline.max_context_chars,
                artifact_root: self.pipeline.artifact_root,
                memory_file: self.pipeline.memory_file,
            },
            sandbox: self.sandbox,
        })
    }
}

fn build_backend(section: BackendSection) -> Result<BackendDefinition, ConfigurationError> {
    let id = BackendId::new(section.id)
        .ok_or_else(|| ConfigurationError::invalid("backend id must not be empty"))?;
    if section.kind == BackendKind::Stub && section.response.is_none() {
        return Err(ConfigurationError::invalid(format!(
            "stub backend '{id}' needs a `response`"
        )));
    }

    let defaults = RetrySettings::default();
    let retry = RetrySettings {
        max_retries: section.max_retries.unwrap_or(defaults.max_retries),
        initial_backoff: section
            .initial_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_backoff),
        max_backoff: section
            .max_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_backoff),
        multiplier: defaults.multiplier,
    };
    if section.requests_per_minute == Some(0) || section.max_concurrent == Some(0) {
        return Err(ConfigurationError::invalid(format!(
            "backend '{id}' rate limits must be positive"
        )));
    }

    let mut backend = BackendDefinition::new(id, section.kind)
        .with_retry(retry)
        .with_rate_limit(RateLimit {
            requests_per_minute: section.requests_per_minute,
            max_concurrent: section.max_concurrent,
        });
    if let Some(secs) = section.timeout_secs {
        backend = backend.with_timeout(Duration::from_secs(secs));
    }
    backend.endpoint = section.endpoint;
    backend.api_key_env = section.api_key_env;
    backend.stub_response = section.response;
    Ok(backend)
}

fn build_stage(section: StageSection) -> Result<StageDefinition, ConfigurationError> {
    let id = StageId::new(section.id)
        .ok_or_else(|| ConfigurationError::invalid("stage id must not be empty"))?;

    let artifact = |raw: String, what: &str| {
        ArtifactName::new(raw.clone()).ok_or_else(|| {
            ConfigurationError::invalid(format!("stage '{id}' has invalid {what} name '{raw}'"))
        })
    };

    let mut stage = StageDefinition::new(id.clone(), section.instructions)
        .with_max_repairs(section.max_repairs.unwrap_or(DEFAULT_MAX_REPAIRS))
        .with_memory(section.memory)
        .with_recall(section.recall.unwrap_or(DEFAULT_RECALL_K));

    for input in section.inputs {
        stage = stage.with_input(artifact(input, "input")?);
    }
    for dep in section.depends_on {
        let dep = StageId::new(dep).ok_or_else(|| {
            ConfigurationError::invalid(format!("stage '{id}' has an empty dependency"))
        })?;
        stage = stage.with_dependency(dep);
    }
    for output in section.outputs {
        let name = artifact(output.name, "output")?;
        let shape = match output.shape.as_str() {
            "text" => ArtifactShape::Text,
            "code" => ArtifactShape::Code {
                language: output.language,
            },
            "json" => ArtifactShape::Json,
            other => {
                return Err(ConfigurationError::invalid(format!(
                    "stage '{id}' output '{name}' has unknown shape '{other}'"
                )))
            }
        };
        stage = stage.with_output(OutputSpec { name, shape });
    }
    if stage.outputs.is_empty() {
        return Err(ConfigurationError::invalid(format!(
            "stage '{id}' declares no outputs"
        )));
    }
    if let Some(model) = section.model {
        let backend = BackendId::new(model.backend).ok_or_else(|| {
            ConfigurationError::invalid(format!("stage '{id}' binds an empty backend id"))
        })?;
        stage = stage.with_model(ModelParameters {
            backend,
            model: model.model,
            temperature: model.temperature,
            max_tokens: model.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
    }
    for tool in section.tools {
        match tool {
            ToolSection::Sandbox {
                language,
                invocation,
                timeout_secs,
            } => {
                stage = stage.with_tool(ToolBinding::Sandbox(SandboxBinding {
                    language,
                    invocation,
                    timeout: timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_SANDBOX_TIMEOUT),
                }));
            }
        }
    }
    Ok(stage)
}
