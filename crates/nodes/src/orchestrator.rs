//! Pipeline orchestrator: drives one run through the ordered stage graph.
//!
//! Per run:
//!
//! 1. **Preflight.** Every stage resolves to a registered backend, every bound
//!    tool is installed, and every declared input is either the request, an
//!    upstream artifact, or an exact-key record in long-term or entity memory.
//!    Any violation is a [`ConfigurationError`] and no backend is called.
//! 2. **Stages.** For each stage in topological order: check cancellation,
//!    build the input context, execute, then commit. Commit order is sink first
//!    (authoritative), then the run context, then memory. The next stage starts
//!    only after the commit.
//! 3. **Teardown.** Short-term memory of the run is released whatever the
//!    outcome.
//!
//! The orchestrator is shared by concurrent runs (`&self` everywhere). Runs
//! never share a [`RunContext`] or short-term memory. Status is kept for every
//! in-flight run and for the most recent finished ones (see
//! [`Orchestrator::with_run_history`]).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use pipeline::{
    Artifact, ArtifactName, ArtifactShape, ArtifactSink, BackendConfig, ConfigurationError,
    ErrorKind, ExecutionResult, MemoryKey, MemoryRecord, MemoryScope, MemoryStore, MemoryValue,
    ModelRouter, OrchestratorError, PipelineGraph, RunContext, RunId, RunReport, RunState,
    RunStatus, StageDefinition, StageFailure, StageId, StageOutcome, ToolBinding, REQUEST_KEY,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::entities::extract_entities;
use crate::executor::StageExecutor;
use crate::prompt::{InputContext, InputSource, ResolvedInput};

/// Longest prefix of the request text used as a memory recall query.
const MAX_QUERY_CHARS: usize = 2_000;

/// Number of finished runs whose status is retained by default.
pub const DEFAULT_RUN_HISTORY: usize = 1_024;

/// A stage ready to run: its definition and resolved backend.
struct PlannedStage {
    stage: StageDefinition,
    backend: BackendConfig,
}

/// Output of a successful preflight.
struct RunPlan {
    stages: Vec<PlannedStage>,
    /// Inputs satisfied from global memory, by input name.
    global_inputs: HashMap<ArtifactName, (InputSource, MemoryRecord)>,
}

// ---------------------------------------------------------------------------
// Run registry
// ---------------------------------------------------------------------------

/// Status of in-flight runs plus a bounded history of finished ones.
///
/// Finished runs are evicted oldest first once more than `history` of them
/// are held. In-flight runs are never evicted.
#[derive(Debug)]
struct RunRegistry {
    statuses: HashMap<RunId, RunStatus>,
    finished: VecDeque<RunId>,
    history: usize,
}

impl RunRegistry {
    fn new(history: usize) -> Self {
        Self {
            statuses: HashMap::new(),
            finished: VecDeque::new(),
            history: history.max(1),
        }
    }

    /// Registers `run_id` as `PENDING`. Returns `false` if the id is still held.
    fn admit(&mut self, run_id: &RunId) -> bool {
        if self.statuses.contains_key(run_id) {
            return false;
        }
        self.statuses.insert(run_id.clone(), RunStatus::Pending);
        true
    }

    fn get(&self, run_id: &RunId) -> Option<&RunStatus> {
        self.statuses.get(run_id)
    }

    fn update(&mut self, run_id: &RunId, status: RunStatus) {
        self.statuses.insert(run_id.clone(), status);
    }

    /// Records a terminal status and evicts the oldest finished runs over the
    /// history limit.
    fn finish(&mut self, run_id: &RunId, status: RunStatus) {
        self.statuses.insert(run_id.clone(), status);
        if !self.finished.contains(run_id) {
            self.finished.push_back(run_id.clone());
        }
        while self.finished.len() > self.history {
            if let Some(evicted) = self.finished.pop_front() {
                self.statuses.remove(&evicted);
            }
        }
    }

    /// Marks a run that stopped without a report as `FAILED` with kind
    /// `internal`, at the stage in flight or else at `fallback`.
    fn abort(&mut self, run_id: &RunId, fallback: Option<StageId>) -> Option<RunStatus> {
        let stage = match self.statuses.get(run_id) {
            Some(RunStatus::Running { stage }) => Some(stage.clone()),
            _ => fallback,
        };
        let Some(stage) = stage else {
            self.forget(run_id);
            return None;
        };
        let status = RunStatus::Failed {
            stage,
            kind: ErrorKind::Internal,
        };
        self.finish(run_id, status.clone());
        Some(status)
    }

    fn forget(&mut self, run_id: &RunId) {
        self.statuses.remove(run_id);
        self.finished.retain(|id| id != run_id);
    }

    fn snapshot(&self) -> Vec<(RunId, RunStatus)> {
        let mut runs: Vec<_> = self
            .statuses
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect();
        runs.sort_by(|a, b| a.0.cmp(&b.0));
        runs
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Sequences stages, commits artifacts and maintains memory.
pub struct Orchestrator {
    graph: Arc<PipelineGraph>,
    router: ModelRouter,
    executor: StageExecutor,
    memory: Arc<dyn MemoryStore>,
    sink: Arc<dyn ArtifactSink>,
    runs: RwLock<RunRegistry>,
}

impl Orchestrator {
    /// Creates an orchestrator for `graph`.
    pub fn new(
        graph: PipelineGraph,
        router: ModelRouter,
        executor: StageExecutor,
        memory: Arc<dyn MemoryStore>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            router,
            executor,
            memory,
            sink,
            runs: RwLock::new(RunRegistry::new(DEFAULT_RUN_HISTORY)),
        }
    }

    /// Keeps the status of at most `limit` finished runs (minimum 1). Older
    /// finished runs are forgotten, and their ids may then be started again.
    #[must_use]
    pub fn with_run_history(mut self, limit: usize) -> Self {
        self.runs = RwLock::new(RunRegistry::new(limit));
        self
    }

    /// The stage graph this orchestrator runs.
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Current status of an in-flight or recently finished run.
    pub async fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.runs.read().await.get(run_id).cloned()
    }

    /// Every in-flight and retained finished run with its status, by id.
    pub async fn runs(&self) -> Vec<(RunId, RunStatus)> {
        self.runs.read().await.snapshot()
    }

    /// Checks routing and tool availability without touching memory.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for stage in self.graph.stages() {
            self.plan_stage(stage)?;
        }
        Ok(())
    }

    /// Runs the pipeline for `requirements` to a terminal state.
    pub async fn run(
        &self,
        run_id: RunId,
        requirements: impl Into<String>,
    ) -> Result<RunReport, OrchestratorError> {
        self.run_with_cancel(run_id, requirements, CancellationToken::new())
            .await
    }

    /// Like [`Orchestrator::run`], stopping at the next stage boundary once
    /// `cancel` fires. A cancelled run ends `FAILED` with kind `cancelled` at the
    /// first stage that did not start.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::DuplicateRun`] if `run_id` is in flight or among
    ///   the retained finished runs.
    /// - [`OrchestratorError::Configuration`] if preflight fails; nothing is
    ///   executed or written in that case.
    /// - [`OrchestratorError::Transition`] if the stage loop reaches an invalid
    ///   state; the run is recorded `FAILED` with kind `internal`.
    #[instrument(skip_all, fields(run_id = %run_id, pipeline = %self.graph.name()))]
    pub async fn run_with_cancel(
        &self,
        run_id: RunId,
        requirements: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let requirements = requirements.into();
        if !self.runs.write().await.admit(&run_id) {
            return Err(OrchestratorError::DuplicateRun { run_id });
        }

        let plan = match self.preflight().await {
            Ok(plan) => plan,
            Err(e) => {
                self.runs.write().await.forget(&run_id);
                warn!(error = %e, "preflight rejected the run");
                return Err(e.into());
            }
        };

        info!(stages = plan.stages.len(), "run started");
        let first_stage = plan.stages.first().map(|p| p.stage.id.clone());
        let result = self.drive(&run_id, &requirements, plan, &cancel).await;

        if let Err(e) = self.memory.clear_short_term(&run_id).await {
            warn!(error = %e, "failed to release short-term memory");
        }

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                let status = self.runs.write().await.abort(&run_id, first_stage);
                warn!(error = %e, status = ?status, "run aborted");
                return Err(e);
            }
        };
        self.runs.write().await.finish(&run_id, report.status.clone());
        info!(status = %report.status, succeeded = report.succeeded.len(), "run finished");
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Preflight
    // -----------------------------------------------------------------------

    fn plan_stage(&self, stage: &StageDefinition) -> Result<PlannedStage, ConfigurationError> {
        let backend = self.router.resolve(&stage.id)?;
        if !self.executor.gateway().serves(&backend.backend.id) {
            return Err(ConfigurationError::UnknownBackend {
                stage: stage.id.clone(),
                backend: backend.backend.id.clone(),
            });
        }
        for tool in &stage.tools {
            let available = match tool {
                ToolBinding::Sandbox(_) => self.executor.has_sandbox(),
            };
            if !available {
                return Err(ConfigurationError::ToolUnavailable {
                    stage: stage.id.clone(),
                    tool: tool.label().to_string(),
                });
            }
        }
        Ok(PlannedStage {
            stage: stage.clone(),
            backend,
        })
    }

    async fn preflight(&self) -> Result<RunPlan, ConfigurationError> {
        let mut stages = Vec::with_capacity(self.graph.stages().len());
        let mut global_inputs = HashMap::new();

        for stage in self.graph.stages() {
            let planned = self.plan_stage(stage)?;
            for input in &stage.inputs {
                if input.as_str() == REQUEST_KEY
                    || self.graph.producer_of(input).is_some()
                    || global_inputs.contains_key(input)
                {
                    continue;
                }
                match self.recall_global(input).await {
                    Some(found) => {
                        debug!(stage = %stage.id, input = %input, "input satisfied from memory");
                        global_inputs.insert(input.clone(), found);
                    }
                    None => {
                        return Err(ConfigurationError::UnsatisfiedInput {
                            stage: stage.id.clone(),
                            input: input.clone(),
                        })
                    }
                }
            }
            stages.push(planned);
        }

        Ok(RunPlan {
            stages,
            global_inputs,
        })
    }

    async fn recall_global(&self, input: &ArtifactName) -> Option<(InputSource, MemoryRecord)> {
        let key = MemoryKey::new(input.as_str())?;
        let tiers = [
            (MemoryScope::LongTerm, InputSource::LongTermMemory),
            (MemoryScope::Entity, InputSource::EntityMemory),
        ];
        for (scope, source) in tiers {
            match self.memory.recall(&scope, &key).await {
                Ok(Some(record)) => return Some((source, record)),
                Ok(None) => {}
                Err(e) => warn!(tier = scope.label(), key = %key, error = %e, "memory recall failed"),
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Stage loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        run_id: &RunId,
        requirements: &str,
        plan: RunPlan,
        cancel: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let mut state = RunState::new(run_id.clone());
        let mut context = RunContext::new(run_id.clone());
        let mut results: Vec<ExecutionResult> = Vec::with_capacity(plan.stages.len());

        self.seed_request(&mut context, requirements).await;

        for (index, planned) in plan.stages.iter().enumerate() {
            let stage = &planned.stage;
            if index == 0 {
                if cancel.is_cancelled() {
                    state.cancel_before(stage.id.clone())?;
                    break;
                }
                state.start(stage.id.clone())?;
            } else {
                state.advance(stage.id.clone())?;
                if cancel.is_cancelled() {
                    info!(stage = %stage.id, "run cancelled at stage boundary");
                    state.fail(ErrorKind::Cancelled)?;
                    break;
                }
            }
            self.set_status(run_id, state.status().clone()).await;

            let input = self
                .build_input(run_id, stage, &context, requirements, &plan)
                .await;
            let mut result = self
                .executor
                .execute(stage, &planned.backend, &input)
                .await;

            if let Some(failure) = result.failure() {
                let kind = failure.kind;
                results.push(result);
                state.fail(kind)?;
                break;
            }

            match self.commit(run_id, stage, &mut context, &result.artifacts).await {
                Ok(committed) => {
                    result.artifacts = committed;
                    results.push(result);
                }
                Err(failure) => {
                    warn!(stage = %stage.id, error = %failure.message, "commit failed");
                    result.outcome = StageOutcome::Failed(failure);
                    result.artifacts.clear();
                    results.push(result);
                    state.fail(ErrorKind::Storage)?;
                    break;
                }
            }
        }

        if matches!(state.status(), RunStatus::Running { .. }) {
            state.complete()?;
        }

        let artifacts = context
            .artifacts()
            .filter(|a| a.name.as_str() != REQUEST_KEY)
            .map(|a| (a.name.clone(), a.clone()))
            .collect();
        Ok(RunReport {
            run_id: run_id.clone(),
            status: state.status().clone(),
            succeeded: state.succeeded().to_vec(),
            results,
            artifacts,
        })
    }

    async fn seed_request(&self, context: &mut RunContext, requirements: &str) {
        let (Some(name), Some(stage)) = (ArtifactName::new(REQUEST_KEY), StageId::new(REQUEST_KEY))
        else {
            return;
        };
        let request = Artifact::new(name, stage, requirements);
        if let Err(e) = context.insert(request) {
            warn!(error = %e, "request already seeded");
        }
        self.remember(
            &MemoryScope::ShortTerm(context.run_id().clone()),
            REQUEST_KEY,
            MemoryValue::tagged(requirements, [REQUEST_KEY]),
        )
        .await;
    }

    async fn build_input(
        &self,
        run_id: &RunId,
        stage: &StageDefinition,
        context: &RunContext,
        requirements: &str,
        plan: &RunPlan,
    ) -> InputContext {
        let mut inputs = Vec::with_capacity(stage.inputs.len());
        for name in &stage.inputs {
            if let Some(artifact) = context.get(name) {
                let source = if name.as_str() == REQUEST_KEY {
                    InputSource::Request
                } else {
                    InputSource::RunContext
                };
                inputs.push(ResolvedInput {
                    name: name.clone(),
                    content: artifact.content.as_text().into_owned(),
                    shape: self.output_shape(name),
                    source,
                });
            } else if let Some((source, record)) = plan.global_inputs.get(name) {
                inputs.push(ResolvedInput {
                    name: name.clone(),
                    content: record.value.clone(),
                    shape: None,
                    source: *source,
                });
            }
        }

        let memory = if stage.recall_k == 0 {
            Vec::new()
        } else {
            self.recall_slices(run_id, stage, requirements).await
        };

        InputContext {
            run_id: run_id.clone(),
            inputs,
            memory,
        }
    }

    fn output_shape(&self, name: &ArtifactName) -> Option<ArtifactShape> {
        let producer = self.graph.producer_of(name)?;
        self.graph
            .stage(producer)?
            .outputs
            .iter()
            .find(|o| &o.name == name)
            .map(|o| o.shape.clone())
    }

    /// Top-`k` records per tier. Short-term records already passed as
    /// declared inputs are skipped.
    async fn recall_slices(
        &self,
        run_id: &RunId,
        stage: &StageDefinition,
        requirements: &str,
    ) -> Vec<MemoryRecord> {
        let request_excerpt: String = requirements.chars().take(MAX_QUERY_CHARS).collect();
        let query = format!("{} {}", stage.instructions, request_excerpt);
        let tiers = [
            MemoryScope::ShortTerm(run_id.clone()),
            MemoryScope::LongTerm,
            MemoryScope::Entity,
        ];

        let mut slices = Vec::new();
        for scope in tiers {
            match self
                .memory
                .recall_relevant(&scope, &query, stage.recall_k)
                .await
            {
                Ok(records) => slices.extend(records.into_iter().filter(|r| {
                    scope.is_global() || !stage.inputs.iter().any(|i| i.as_str() == r.key.as_str())
                })),
                Err(e) => warn!(tier = scope.label(), error = %e, "memory recall failed"),
            }
        }
        slices
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Writes artifacts to the sink, then the run context, then memory.
    /// Returns the artifacts as stored (with sink-assigned versions).
    async fn commit(
        &self,
        run_id: &RunId,
        stage: &StageDefinition,
        context: &mut RunContext,
        artifacts: &[Artifact],
    ) -> Result<Vec<Artifact>, StageFailure> {
        let mut stored = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if !stage.declares_output(&artifact.name) {
                return Err(StageFailure {
                    kind: ErrorKind::Validation,
                    message: format!("stage wrote undeclared artifact '{}'", artifact.name),
                });
            }
            let location = match self.sink.write(run_id, artifact).await {
                Ok(location) => location,
                Err(e) => return Err(partial_commit_failure(&e.to_string(), &stored)),
            };
            debug!(artifact = %artifact.name, version = location.version, uri = %location.uri, "artifact committed");
            stored.push(artifact.clone().with_version(location.version));
        }

        for artifact in &stored {
            context.insert(artifact.clone()).map_err(|e| StageFailure {
                kind: ErrorKind::Storage,
                message: e.to_string(),
            })?;
        }

        for artifact in &stored {
            self.mirror(run_id, stage, artifact).await;
        }
        Ok(stored)
    }

    /// Publishes an artifact into the memory tiers the stage's policy selects.
    /// Failures are logged; the sink stays authoritative.
    async fn mirror(&self, run_id: &RunId, stage: &StageDefinition, artifact: &Artifact) {
        let text = artifact.content.as_text();
        let tags = [stage.id.as_str(), "artifact"];

        self.remember(
            &MemoryScope::ShortTerm(run_id.clone()),
            artifact.name.as_str(),
            MemoryValue::tagged(&*text, tags),
        )
        .await;

        if stage.memory.long_term {
            self.remember(
                &MemoryScope::LongTerm,
                artifact.name.as_str(),
                MemoryValue::tagged(&*text, [stage.id.as_str(), self.graph.name().as_str()]),
            )
            .await;
        }

        let is_code = stage
            .outputs
            .iter()
            .any(|o| o.name == artifact.name && matches!(o.shape, ArtifactShape::Code { .. }));
        if stage.memory.entity && is_code {
            for entity in extract_entities(&text) {
                let value = serde_json::json!({
                    "kind": entity.kind,
                    "stage": stage.id,
                    "artifact": artifact.name,
                    "run": run_id,
                });
                self.remember(
                    &MemoryScope::Entity,
                    &entity.name,
                    MemoryValue::tagged(value.to_string(), [entity.kind.label(), stage.id.as_str()]),
                )
                .await;
            }
        }
    }

    async fn remember(&self, scope: &MemoryScope, key: &str, value: MemoryValue) {
        let Some(key) = MemoryKey::new(key) else {
            return;
        };
        if let Err(e) = self.memory.remember(scope, &key, value).await {
            warn!(tier = scope.label(), key = %key, error = %e, "memory write failed");
        }
    }

    async fn set_status(&self, run_id: &RunId, status: RunStatus) {
        self.runs.write().await.update(run_id, status);
    }
}

/// Storage failure of a commit. Outputs of the stage already versioned in the
/// sink are named, since they are not part of the run report.
fn partial_commit_failure(error: &str, stored: &[Artifact]) -> StageFailure {
    if stored.is_empty() {
        return StageFailure {
            kind: ErrorKind::Storage,
            message: error.to_string(),
        };
    }
    let orphaned: Vec<String> = stored
        .iter()
        .map(|a| format!("{} v{}", a.name, a.version))
        .collect();
    warn!(orphaned = %orphaned.join(", "), "commit stopped after storing some outputs");
    StageFailure {
        kind: ErrorKind::Storage,
        message: format!("{error}; already stored in the sink: {}", orphaned.join(", ")),
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", self.graph.name())
            .field("stages", &self.graph.stages().len())
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str) -> RunId {
        RunId::new(id).unwrap()
    }

    fn stage(id: &str) -> StageId {
        StageId::new(id).unwrap()
    }

    #[test]
    fn finished_runs_beyond_the_history_are_evicted() {
        let mut registry = RunRegistry::new(2);
        for id in ["a", "b", "c"] {
            assert!(registry.admit(&run(id)));
            registry.finish(&run(id), RunStatus::Completed);
        }

        assert!(registry.get(&run("a")).is_none());
        assert_eq!(registry.get(&run("c")), Some(&RunStatus::Completed));
        assert_eq!(registry.snapshot().len(), 2);
        assert!(registry.admit(&run("a")));
    }

    #[test]
    fn in_flight_runs_are_never_evicted() {
        let mut registry = RunRegistry::new(1);
        assert!(registry.admit(&run("live")));
        registry.update(&run("live"), RunStatus::Running { stage: stage("code") });
        for id in ["a", "b", "c"] {
            registry.admit(&run(id));
            registry.finish(&run(id), RunStatus::Completed);
        }

        assert_eq!(
            registry.get(&run("live")),
            Some(&RunStatus::Running { stage: stage("code") })
        );
        assert!(!registry.admit(&run("live")));
    }

    #[test]
    fn aborted_runs_fail_at_the_stage_in_flight() {
        let mut registry = RunRegistry::new(4);
        registry.admit(&run("r"));
        registry.update(&run("r"), RunStatus::Running { stage: stage("review") });

        let status = registry.abort(&run("r"), Some(stage("spec")));

        let expected = RunStatus::Failed {
            stage: stage("review"),
            kind: ErrorKind::Internal,
        };
        assert_eq!(status.as_ref(), Some(&expected));
        assert_eq!(registry.get(&run("r")), Some(&expected));
    }

    #[test]
    fn runs_aborted_before_any_stage_fail_at_the_first_stage() {
        let mut registry = RunRegistry::new(4);
        registry.admit(&run("r"));

        registry.abort(&run("r"), Some(stage("spec")));

        assert_eq!(
            registry.get(&run("r")),
            Some(&RunStatus::Failed {
                stage: stage("spec"),
                kind: ErrorKind::Internal,
            })
        );
    }

    #[test]
    fn partial_commit_failures_name_the_stored_outputs() {
        let stored = vec![Artifact::new(
            ArtifactName::new("review.md").unwrap(),
            stage("review"),
            "fine",
        )
        .with_version(2)];

        let failure = partial_commit_failure("disk full", &stored);

        assert_eq!(failure.kind, ErrorKind::Storage);
        assert_eq!(failure.message, "disk full; already stored in the sink: review.md v2");
        assert_eq!(partial_commit_failure("disk full", &[]).message, "disk full");
    }
}
