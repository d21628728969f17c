//! Built-in "engineering team" pipeline.
//!
//! Seven stages in series: requirements analysis, design, backend code, a
//! demo UI, code review, tests and documentation. Both code stages that can be
//! checked in isolation (the backend module and its tests) are validated in the
//! sandbox. The review feeds the test stage so tests focus on reported risks.
//!
//! Used by the CLI when no pipeline configuration file exists.

use pipeline::{
    ArtifactName, BackendId, ConfigurationError, MemoryPolicy, ModelParameters, OutputSpec,
    PipelineGraph, PipelineName, SandboxBinding, StageDefinition, StageId, ToolBinding,
    DEFAULT_SANDBOX_TIMEOUT, REQUEST_KEY,
};

/// Name of the built-in pipeline.
pub const ENGINEERING_TEAM: &str = "engineering-team";

/// Repair budget of the sandbox-validated stages.
pub const CODE_STAGE_REPAIRS: u32 = 3;

const LANGUAGE: &str = "python";

const REQUIREMENTS_ANALYST: &str = "You are a business analyst. Validate the requirements \
before any design starts: restate them as numbered, testable statements, flag \
contradictions and ambiguities, list edge cases, and call out complexity risks. \
Answer in Markdown.";

const ENGINEERING_LEAD: &str = "You are an engineering lead. Produce a detailed technical \
design for a single self-contained Python module that satisfies the validated requirements: \
classes, functions with signatures, data structures and error handling. Answer in Markdown.";

const BACKEND_ENGINEER: &str = "You are a Python engineer. Implement the design as one \
self-contained Python module with no third-party dependencies. Answer with the code only, \
in a single fenced python block.";

const FRONTEND_ENGINEER: &str = "You are a Gradio expert. Write a minimal Gradio app in \
app.py that demonstrates the backend module by importing it with `import module`. Keep the \
UI simple. Answer with the code only, in a single fenced python block.";

const CODE_REVIEWER: &str = "You are a senior code reviewer. Review the backend module \
against the requirements and the design for correctness, security, code quality and \
performance. List findings by severity with concrete fixes. Answer in Markdown.";

const TEST_ENGINEER: &str = "You are a QA engineer. Write comprehensive unittest tests for \
the backend module, importing it with `import module`. Prioritize the risks raised in the \
code review. Answer with the code only, in a single fenced python block.";

const DOC_WRITER: &str = "You are a technical writer. Write a README for the project: \
overview, API reference for the backend module, and a quickstart showing how to run the \
demo app. Answer in Markdown.";

/// Builds the built-in pipeline with every stage bound to `model` on `backend`.
pub fn engineering_team(
    backend: BackendId,
    model: impl Into<String>,
) -> Result<PipelineGraph, ConfigurationError> {
    let params = ModelParameters::new(backend, model);
    let shared = MemoryPolicy {
        long_term: true,
        entity: false,
    };
    let code = MemoryPolicy {
        long_term: true,
        entity: true,
    };

    let requirements = artifact("requirements.md")?;
    let design = artifact("design.md")?;
    let module = artifact("module")?;
    let app = artifact("app")?;
    let review = artifact("review.md")?;
    let tests = artifact("tests")?;
    let readme = artifact("README.md")?;

    let stages = vec![
        StageDefinition::new(stage("requirements_analysis")?, REQUIREMENTS_ANALYST)
            .with_input(artifact(REQUEST_KEY)?)
            .with_output(OutputSpec::text(requirements.clone()))
            .with_model(params.clone())
            .with_memory(shared),
        StageDefinition::new(stage("design")?, ENGINEERING_LEAD)
            .with_input(artifact(REQUEST_KEY)?)
            .with_input(requirements.clone())
            .with_output(OutputSpec::text(design.clone()))
            .with_model(params.clone())
            .with_memory(shared),
        StageDefinition::new(stage("backend")?, BACKEND_ENGINEER)
            .with_input(design.clone())
            .with_input(requirements.clone())
            .with_output(OutputSpec::code(module.clone(), LANGUAGE))
            .with_model(params.clone())
            .with_tool(sandbox("python -c 'import module'"))
            .with_max_repairs(CODE_STAGE_REPAIRS)
            .with_memory(code),
        StageDefinition::new(stage("frontend")?, FRONTEND_ENGINEER)
            .with_input(design.clone())
            .with_input(module.clone())
            .with_output(OutputSpec::code(app.clone(), LANGUAGE))
            .with_model(params.clone())
            .with_memory(code),
        StageDefinition::new(stage("code_review")?, CODE_REVIEWER)
            .with_input(requirements.clone())
            .with_input(design.clone())
            .with_input(module.clone())
            .with_output(OutputSpec::text(review.clone()))
            .with_model(params.clone())
            .with_memory(shared),
        StageDefinition::new(stage("testing")?, TEST_ENGINEER)
            .with_input(module.clone())
            .with_input(review)
            .with_output(OutputSpec::code(tests, LANGUAGE))
            .with_model(params.clone())
            .with_tool(sandbox("python -m unittest -v tests"))
            .with_max_repairs(CODE_STAGE_REPAIRS)
            .with_memory(code),
        StageDefinition::new(stage("documentation")?, DOC_WRITER)
            .with_input(requirements)
            .with_input(design)
            .with_input(module)
            .with_input(app)
            .with_output(OutputSpec::text(readme))
            .with_model(params)
            .with_memory(shared),
    ];

    let name = PipelineName::new(ENGINEERING_TEAM)
        .ok_or_else(|| ConfigurationError::invalid("empty pipeline name"))?;
    PipelineGraph::new(name, stages)
}

fn stage(id: &str) -> Result<StageId, ConfigurationError> {
    StageId::new(id).ok_or_else(|| ConfigurationError::invalid(format!("invalid stage id '{id}'")))
}

fn artifact(name: &str) -> Result<ArtifactName, ConfigurationError> {
    ArtifactName::new(name)
        .ok_or_else(|| ConfigurationError::invalid(format!("invalid artifact name '{name}'")))
}

fn sandbox(invocation: &str) -> ToolBinding {
    ToolBinding::Sandbox(SandboxBinding {
        language: LANGUAGE.to_string(),
        invocation: invocation.to_string(),
        timeout: DEFAULT_SANDBOX_TIMEOUT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> PipelineGraph {
        engineering_team(BackendId::new("anthropic").unwrap(), "claude-sonnet-4-5").unwrap()
    }

    fn ids(graph: &PipelineGraph) -> Vec<&str> {
        graph.stages().iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn seven_stages_run_in_series() {
        let graph = graph();
        assert_eq!(graph.name().as_str(), ENGINEERING_TEAM);
        assert_eq!(
            ids(&graph),
            vec![
                "requirements_analysis",
                "design",
                "backend",
                "frontend",
                "code_review",
                "testing",
                "documentation",
            ]
        );
    }

    #[test]
    fn code_stages_are_sandboxed() {
        let graph = graph();
        let sandboxed: Vec<&str> = graph
            .stages()
            .iter()
            .filter(|s| s.sandbox().is_some())
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(sandboxed, vec!["backend", "testing"]);

        for stage in graph.stages().iter().filter(|s| s.sandbox().is_some()) {
            let binding = stage.sandbox().unwrap();
            assert_eq!(binding.timeout, DEFAULT_SANDBOX_TIMEOUT);
            assert_eq!(stage.max_repairs, CODE_STAGE_REPAIRS);
            assert!(stage.memory.entity);
        }
    }

    #[test]
    fn tests_read_the_review() {
        let graph = graph();
        let review = ArtifactName::new("review.md").unwrap();
        let testing = graph.stage(&StageId::new("testing").unwrap()).unwrap();
        assert!(testing.inputs.contains(&review));
        assert_eq!(
            graph.producer_of(&review).map(StageId::as_str),
            Some("code_review")
        );
    }

    #[test]
    fn every_stage_is_bound_to_the_backend() {
        let graph = graph();
        for stage in graph.stages() {
            let model = stage.model.as_ref().unwrap();
            assert_eq!(model.backend.as_str(), "anthropic");
            assert_eq!(model.model, "claude-sonnet-4-5");
            assert!(stage.memory.long_term);
        }
    }

    #[test]
    fn only_the_first_two_stages_read_the_request() {
        let graph = graph();
        let readers: Vec<&str> = graph
            .stages()
            .iter()
            .filter(|s| s.inputs.iter().any(|i| i.as_str() == REQUEST_KEY))
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(readers, vec!["requirements_analysis", "design"]);
    }
}
