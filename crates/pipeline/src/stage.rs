//! Stage definitions and the validated stage graph.
//!
//! A [`StageDefinition`] is immutable once loaded. [`PipelineGraph`] checks the
//! structural rules that do not depend on memory (unique stages, unique
//! artifact producers, known dependencies, no cycles) and fixes the execution
//! order. Input satisfiability against memory is checked per run by the
//! orchestrator because memory contents change between runs.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ArtifactName, ArtifactShape, BackendId, ConfigurationError, PipelineName, StageId};

/// Name under which the run's requirements text is seeded into the run context.
pub const REQUEST_KEY: &str = "request";

/// Default number of repair attempts after a validation or tool failure.
pub const DEFAULT_MAX_REPAIRS: u32 = 2;

/// Default number of memory records injected into a stage's prompt.
pub const DEFAULT_RECALL_K: usize = 5;

/// Default ceiling for one sandbox execution.
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(500);

// ---------------------------------------------------------------------------
// Stage parts
// ---------------------------------------------------------------------------

/// One declared output of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Artifact name written by the stage.
    pub name: ArtifactName,
    /// Shape the model output must have.
    pub shape: ArtifactShape,
}

impl OutputSpec {
    /// A text-shaped output.
    pub fn text(name: ArtifactName) -> Self {
        Self {
            name,
            shape: ArtifactShape::Text,
        }
    }

    /// A code-shaped output in the given language.
    pub fn code(name: ArtifactName, language: impl Into<String>) -> Self {
        Self {
            name,
            shape: ArtifactShape::Code {
                language: Some(language.into()),
            },
        }
    }

    /// A JSON-shaped output.
    pub fn json(name: ArtifactName) -> Self {
        Self {
            name,
            shape: ArtifactShape::Json,
        }
    }
}

/// Model binding of a stage: which backend and with which parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Configured backend the stage is routed to.
    pub backend: BackendId,
    /// Model name passed to the backend.
    pub model: String,
    /// Sampling temperature; backend default when `None`.
    pub temperature: Option<f32>,
    /// Completion token ceiling.
    pub max_tokens: u32,
}

impl ModelParameters {
    /// Parameters with the backend's default temperature and token ceiling.
    pub fn new(backend: BackendId, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            temperature: None,
            max_tokens: crate::DEFAULT_MAX_TOKENS,
        }
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Sandboxed execution of the stage's generated code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxBinding {
    /// Language of the code under test (e.g. `"python"`).
    pub language: String,
    /// Command run inside the sandbox working directory (e.g. `"python -m pytest -q"`).
    pub invocation: String,
    /// Wall-clock ceiling for one execution.
    pub timeout: Duration,
}

/// Tools a stage may use. Adding a tool kind is a code change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolBinding {
    /// Validate generated code by executing it in the sandbox.
    Sandbox(SandboxBinding),
}

impl ToolBinding {
    /// Short label used in logs and configuration errors.
    pub fn label(&self) -> &'static str {
        match self {
            ToolBinding::Sandbox(_) => "sandbox",
        }
    }
}

/// Which shared memory tiers a stage publishes its artifacts into.
///
/// Every stage mirrors its artifacts into short-term memory; the global tiers
/// are opt-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPolicy {
    /// Record artifacts in long-term memory for future runs.
    pub long_term: bool,
    /// Extract named entities from code artifacts into entity memory.
    pub entity: bool,
}

// ---------------------------------------------------------------------------
// StageDefinition
// ---------------------------------------------------------------------------

/// Static description of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique identifier within the pipeline.
    pub id: StageId,
    /// Role and task description sent to the model as the system prompt.
    pub instructions: String,
    /// Declared input keys, in prompt order.
    pub inputs: Vec<ArtifactName>,
    /// Explicit ordering dependencies beyond those implied by inputs.
    pub depends_on: Vec<StageId>,
    /// Artifacts the stage must produce. It may write no others.
    pub outputs: Vec<OutputSpec>,
    /// Model binding; `None` means the router must supply an override.
    pub model: Option<ModelParameters>,
    /// Tools invoked on the model output.
    pub tools: Vec<ToolBinding>,
    /// Repair attempts allowed after validation or tool failures.
    pub max_repairs: u32,
    /// Global memory tiers the stage publishes into.
    pub memory: MemoryPolicy,
    /// Number of memory records injected into the prompt; `0` disables recall.
    pub recall_k: usize,
}

impl StageDefinition {
    /// Creates a stage with no inputs, outputs, tools or binding.
    pub fn new(id: StageId, instructions: impl Into<String>) -> Self {
        Self {
            id,
            instructions: instructions.into(),
            inputs: Vec::new(),
            depends_on: Vec::new(),
            outputs: Vec::new(),
            model: None,
            tools: Vec::new(),
            max_repairs: DEFAULT_MAX_REPAIRS,
            memory: MemoryPolicy::default(),
            recall_k: DEFAULT_RECALL_K,
        }
    }

    /// Adds a declared input.
    #[must_use]
    pub fn with_input(mut self, input: ArtifactName) -> Self {
        self.inputs.push(input);
        self
    }

    /// Adds an explicit ordering dependency.
    #[must_use]
    pub fn with_dependency(mut self, stage: StageId) -> Self {
        self.depends_on.push(stage);
        self
    }

    /// Adds a declared output.
    #[must_use]
    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    /// Binds the stage to a backend.
    #[must_use]
    pub fn with_model(mut self, model: ModelParameters) -> Self {
        self.model = Some(model);
        self
    }

    /// Adds a tool binding.
    #[must_use]
    pub fn with_tool(mut self, tool: ToolBinding) -> Self {
        self.tools.push(tool);
        self
    }

    /// Sets the repair budget.
    #[must_use]
    pub fn with_max_repairs(mut self, repairs: u32) -> Self {
        self.max_repairs = repairs;
        self
    }

    /// Sets the memory publication policy.
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryPolicy) -> Self {
        self.memory = memory;
        self
    }

    /// Sets how many memory records are recalled into the prompt.
    #[must_use]
    pub fn with_recall(mut self, k: usize) -> Self {
        self.recall_k = k;
        self
    }

    /// Returns `true` if `name` is one of the stage's declared outputs.
    pub fn declares_output(&self, name: &ArtifactName) -> bool {
        self.outputs.iter().any(|o| &o.name == name)
    }

    /// The sandbox binding, if the stage has one.
    pub fn sandbox(&self) -> Option<&SandboxBinding> {
        self.tools.iter().find_map(|tool| match tool {
            ToolBinding::Sandbox(binding) => Some(binding),
        })
    }
}

// ---------------------------------------------------------------------------
// PipelineGraph
// ---------------------------------------------------------------------------

/// A structurally valid set of stages in execution order.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: PipelineName,
    stages: Vec<StageDefinition>,
    producers: HashMap<ArtifactName, StageId>,
}

impl PipelineGraph {
    /// Validates `stages` and orders them topologically.
    ///
    /// Dependencies come from `depends_on` and from inputs produced by another
    /// stage. Among stages whose dependencies are met, declaration order is kept,
    /// so a linear configuration runs exactly as written.
    pub fn new(
        name: PipelineName,
        stages: Vec<StageDefinition>,
    ) -> Result<Self, ConfigurationError> {
        if stages.is_empty() {
            return Err(ConfigurationError::EmptyPipeline);
        }

        let mut index: HashMap<StageId, usize> = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.id.clone(), i).is_some() {
                return Err(ConfigurationError::DuplicateStage {
                    stage: stage.id.clone(),
                });
            }
        }

        let mut producers: HashMap<ArtifactName, StageId> = HashMap::new();
        for stage in &stages {
            for output in &stage.outputs {
                if output.name.as_str() == REQUEST_KEY {
                    return Err(ConfigurationError::invalid(format!(
                        "stage '{}' may not produce the reserved artifact '{REQUEST_KEY}'",
                        stage.id
                    )));
                }
                if let Some(first) = producers.insert(output.name.clone(), stage.id.clone()) {
                    return Err(ConfigurationError::DuplicateArtifact {
                        artifact: output.name.clone(),
                        first,
                        second: stage.id.clone(),
                    });
                }
            }
        }

        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let j = *index
                    .get(dep)
                    .ok_or_else(|| ConfigurationError::UnknownDependency {
                        stage: stage.id.clone(),
                        dependency: dep.to_string(),
                    })?;
                deps[i].insert(j);
            }
            for input in &stage.inputs {
                if let Some(producer) = producers.get(input) {
                    deps[i].insert(index[producer]);
                }
            }
            if deps[i].contains(&i) {
                return Err(ConfigurationError::CycleDetected {
                    stages: stage.id.to_string(),
                });
            }
        }

        // Kahn's algorithm, always picking the earliest-declared ready stage.
        let mut placed = vec![false; stages.len()];
        let mut order = Vec::with_capacity(stages.len());
        while order.len() < stages.len() {
            let next = (0..stages.len())
                .find(|&i| !placed[i] && deps[i].iter().all(|&d| placed[d]));
            match next {
                Some(i) => {
                    placed[i] = true;
                    order.push(i);
                }
                None => {
                    let stuck: Vec<String> = (0..stages.len())
                        .filter(|&i| !placed[i])
                        .map(|i| stages[i].id.to_string())
                        .collect();
                    return Err(ConfigurationError::CycleDetected {
                        stages: stuck.join(", "),
                    });
                }
            }
        }

        let mut slots: Vec<Option<StageDefinition>> = stages.into_iter().map(Some).collect();
        let ordered = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();

        Ok(Self {
            name,
            stages: ordered,
            producers,
        })
    }

    /// The pipeline's name.
    pub fn name(&self) -> &PipelineName {
        &self.name
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Looks up a stage by identifier.
    pub fn stage(&self, id: &StageId) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| &s.id == id)
    }

    /// The stage that declares `artifact` as an output, if any.
    pub fn producer_of(&self, artifact: &ArtifactName) -> Option<&StageId> {
        self.producers.get(artifact)
    }

    /// Position of a stage in execution order.
    pub fn position(&self, id: &StageId) -> Option<usize> {
        self.stages.iter().position(|s| &s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ArtifactName {
        ArtifactName::new(s).unwrap()
    }

    fn stage(id: &str) -> StageDefinition {
        StageDefinition::new(StageId::new(id).unwrap(), format!("do {id}"))
    }

    fn ids(graph: &PipelineGraph) -> Vec<&str> {
        graph.stages().iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn linear_pipeline_keeps_declaration_order() {
        let graph = PipelineGraph::new(
            PipelineName::new("p").unwrap(),
            vec![
                stage("spec").with_output(OutputSpec::text(name("requirements"))),
                stage("code")
                    .with_input(name("requirements"))
                    .with_output(OutputSpec::text(name("module"))),
                stage("review")
                    .with_input(name("module"))
                    .with_output(OutputSpec::text(name("review"))),
            ],
        )
        .unwrap();
        assert_eq!(ids(&graph), vec!["spec", "code", "review"]);
        assert_eq!(graph.producer_of(&name("module")).unwrap().as_str(), "code");
    }

    #[test]
    fn inputs_imply_dependencies_regardless_of_declaration_order() {
        let graph = PipelineGraph::new(
            PipelineName::new("p").unwrap(),
            vec![
                stage("review")
                    .with_input(name("module"))
                    .with_output(OutputSpec::text(name("review"))),
                stage("code").with_output(OutputSpec::text(name("module"))),
            ],
        )
        .unwrap();
        assert_eq!(ids(&graph), vec!["code", "review"]);
    }

    #[test]
    fn explicit_dependencies_are_honoured() {
        let graph = PipelineGraph::new(
            PipelineName::new("p").unwrap(),
            vec![
                stage("docs").with_dependency(StageId::new("tests").unwrap()),
                stage("tests"),
            ],
        )
        .unwrap();
        assert_eq!(ids(&graph), vec!["tests", "docs"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let err = PipelineGraph::new(
            PipelineName::new("p").unwrap(),
            vec![
                stage("a")
                    .with_input(name("b_out"))
                    .with_output(OutputSpec::text(name("a_out"))),
                stage("b")
                    .with_input(name("a_out"))
                    .with_output(OutputSpec::text(name("b_out"))),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::CycleDetected { .. }));
    }

    #[test]
    fn duplicate_producers_are_rejected() {
        let err = PipelineGraph::new(
            PipelineName::new("p").unwrap(),
            vec![
                stage("a").with_output(OutputSpec::text(name("x"))),
                stage("b").with_output(OutputSpec::text(name("x"))),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateArtifact { .. }));
    }

    #[test]
    fn duplicate_stage_ids_and_unknown_dependencies_are_rejected() {
        let dup = PipelineGraph::new(
            PipelineName::new("p").unwrap(),
            vec![stage("a"), stage("a")],
        )
        .unwrap_err();
        assert!(matches!(dup, ConfigurationError::DuplicateStage { .. }));

        let unknown = PipelineGraph::new(
            PipelineName::new("p").unwrap(),
            vec![stage("a").with_dependency(StageId::new("ghost").unwrap())],
        )
        .unwrap_err();
        assert!(matches!(unknown, ConfigurationError::UnknownDependency { .. }));
    }

    #[test]
    fn empty_pipeline_and_reserved_outputs_are_rejected() {
        let empty = PipelineGraph::new(PipelineName::new("p").unwrap(), vec![]).unwrap_err();
        assert_eq!(empty, ConfigurationError::EmptyPipeline);

        let reserved = PipelineGraph::new(
            PipelineName::new("p").unwrap(),
            vec![stage("a").with_output(OutputSpec::text(name(REQUEST_KEY)))],
        )
        .unwrap_err();
        assert!(matches!(reserved, ConfigurationError::Invalid { .. }));
    }
}
