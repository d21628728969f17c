//! Composition root: turns configuration into a ready orchestrator.
//!
//! This is the only place where concrete adapters (HTTP backends, the process
//! sandbox, file-backed stores) are chosen and injected into the orchestration
//! layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use nodes::{engineering_team, LlmGateway, Orchestrator, StageExecutor};
use pipeline::{
    ArtifactSink, BackendDefinition, BackendId, BackendKind, LoadedPipeline, MemoryStore,
    ModelRouter, PipelineConfig, PipelineSettings, SandboxSection, DEFAULT_MAX_CONTEXT_CHARS,
};
use sandbox::ProcessSandbox;
use storage::{FileMemoryStore, FsArtifactSink};
use tracing::{info, warn};

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = ".stagecraft/pipeline.toml";

/// Artifact root used when the configuration names none.
pub const DEFAULT_ARTIFACT_ROOT: &str = ".stagecraft/artifacts";

/// Memory snapshot used when the configuration names none.
pub const DEFAULT_MEMORY_FILE: &str = ".stagecraft/memory.json";

/// Backend of the built-in pipeline.
pub const BUILTIN_BACKEND: &str = "anthropic";

/// Model of the built-in pipeline unless overridden.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Where the pipeline definition came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineSource {
    /// A configuration file.
    File(PathBuf),
    /// The built-in engineering-team pipeline.
    BuiltIn,
}

impl std::fmt::Display for PipelineSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineSource::File(path) => write!(f, "{}", path.display()),
            PipelineSource::BuiltIn => f.write_str("built-in engineering team"),
        }
    }
}

/// Loads `config`, falling back to the built-in pipeline when the file does
/// not exist.
pub fn load_pipeline(config: &Path, model: &str) -> anyhow::Result<(LoadedPipeline, PipelineSource)> {
    if !config.exists() {
        info!(path = %config.display(), "no pipeline configuration, using the built-in pipeline");
        return Ok((builtin_pipeline(model)?, PipelineSource::BuiltIn));
    }

    let text = std::fs::read_to_string(config)
        .with_context(|| format!("failed to read {}", config.display()))?;
    let loaded = PipelineConfig::from_toml_str(&text)
        .and_then(PipelineConfig::build)
        .with_context(|| format!("invalid pipeline configuration in {}", config.display()))?;
    Ok((loaded, PipelineSource::File(config.to_path_buf())))
}

/// The built-in engineering-team pipeline on an Anthropic backend.
pub fn builtin_pipeline(model: &str) -> anyhow::Result<LoadedPipeline> {
    let backend_id =
        BackendId::new(BUILTIN_BACKEND).context("built-in backend id must not be empty")?;
    let graph = engineering_team(backend_id.clone(), model)?;
    Ok(LoadedPipeline {
        graph,
        backends: vec![BackendDefinition::new(backend_id, BackendKind::Anthropic)],
        settings: PipelineSettings {
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            artifact_root: None,
            memory_file: None,
        },
        sandbox: SandboxSection::default(),
    })
}

/// Artifact sink for the configured root.
pub fn artifact_sink(settings: &PipelineSettings) -> Arc<FsArtifactSink> {
    let root = settings
        .artifact_root
        .as_deref()
        .unwrap_or(DEFAULT_ARTIFACT_ROOT);
    Arc::new(FsArtifactSink::new(root))
}

/// Everything a run needs.
pub struct Stack {
    /// The wired orchestrator.
    pub orchestrator: Orchestrator,
    /// The sink the orchestrator writes to.
    pub sink: Arc<dyn ArtifactSink>,
}

/// Builds providers, the sandbox and the stores, and wires the orchestrator.
///
/// # Errors
///
/// Fails when a backend lacks credentials, the sandbox section is invalid, or
/// the memory snapshot cannot be opened.
pub async fn build_stack(loaded: LoadedPipeline) -> anyhow::Result<Stack> {
    let mut gateway = LlmGateway::new();
    for backend in &loaded.backends {
        let provider = llm::build_provider(backend)
            .with_context(|| format!("cannot configure backend '{}'", backend.id))?;
        gateway.register(backend, provider);
    }

    let mut executor = StageExecutor::new(Arc::new(gateway))
        .with_max_context_chars(loaded.settings.max_context_chars);

    if loaded.graph.stages().iter().any(|s| s.sandbox().is_some()) {
        let sandbox = ProcessSandbox::from_section(&loaded.sandbox)?;
        if sandbox.is_available().await {
            executor = executor.with_sandbox(Arc::new(sandbox));
        } else {
            warn!(mode = ?sandbox.mode(), "sandbox runtime is not available");
        }
    }

    let memory_file = loaded
        .settings
        .memory_file
        .as_deref()
        .unwrap_or(DEFAULT_MEMORY_FILE);
    let memory: Arc<dyn MemoryStore> = Arc::new(
        FileMemoryStore::open(memory_file)
            .await
            .with_context(|| format!("cannot open memory file {memory_file}"))?,
    );
    let sink: Arc<dyn ArtifactSink> = artifact_sink(&loaded.settings);

    let router = ModelRouter::for_graph(&loaded.graph, loaded.backends.iter().cloned());
    let orchestrator = Orchestrator::new(loaded.graph, router, executor, memory, sink.clone());
    Ok(Stack { orchestrator, sink })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_falls_back_to_the_builtin_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (loaded, source) =
            load_pipeline(&dir.path().join("pipeline.toml"), "some-model").unwrap();

        assert_eq!(source, PipelineSource::BuiltIn);
        assert_eq!(loaded.graph.stages().len(), 7);
        assert_eq!(loaded.backends[0].kind, BackendKind::Anthropic);
        assert_eq!(
            loaded.graph.stages()[0].model.as_ref().unwrap().model,
            "some-model"
        );
    }

    #[test]
    fn invalid_config_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "[[stages]]\nid = \"a\"\n").unwrap();

        let err = load_pipeline(&path, DEFAULT_MODEL).unwrap_err();

        assert!(format!("{err:#}").contains("pipeline.toml"));
    }

    #[tokio::test]
    async fn stub_configuration_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let config = format!(
            r#"
[pipeline]
name = "demo"
artifact_root = "{root}"
memory_file = "{memory}"

[[backends]]
id = "local"
kind = "stub"
response = "done"

[[stages]]
id = "spec"
instructions = "Write requirements."
inputs = ["request"]
model = {{ backend = "local", model = "stub" }}
outputs = [{{ name = "requirements.md" }}]
memory = {{ long_term = true }}
"#,
            root = dir.path().join("artifacts").display(),
            memory = dir.path().join("memory.json").display(),
        );
        std::fs::write(&path, config).unwrap();

        let (loaded, _) = load_pipeline(&path, DEFAULT_MODEL).unwrap();
        let stack = build_stack(loaded).await.unwrap();
        let run_id = pipeline::RunId::new("cli-run").unwrap();
        let report = stack.orchestrator.run(run_id.clone(), "a ledger").await.unwrap();

        assert_eq!(report.status, pipeline::RunStatus::Completed);
        let stored = stack.sink.list(&run_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(dir.path().join("memory.json").exists());
    }
}
