//! Subcommand handlers.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Args, Subcommand};
use nodes::CancellationToken;
use pipeline::{ArtifactName, ArtifactSink, ModelRouter, RunId, RunReport, RunStatus, StageOutcome};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::wiring::{artifact_sink, build_stack, load_pipeline};

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline on a requirements statement
    Run(RunArgs),
    /// Check the configuration, credentials and tool availability
    Validate,
    /// List stages in execution order
    Stages,
    /// Print stored artifacts of a run
    Show(ShowArgs),
}

/// Arguments of `stagecraft run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// File holding the requirements; `-` reads standard input
    #[arg(long, short, required_unless_present = "text", conflicts_with = "text")]
    pub requirements: Option<PathBuf>,

    /// Requirements given inline
    #[arg(long)]
    pub text: Option<String>,

    /// Identifier of the run; generated when omitted
    #[arg(long)]
    pub run_id: Option<String>,

    /// Print the run report as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

/// Arguments of `stagecraft show`.
#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Run whose artifacts to show
    #[arg(long)]
    pub run_id: String,

    /// Artifact to print; lists the run's artifacts when omitted
    #[arg(long)]
    pub artifact: Option<String>,

    /// Version to print instead of the latest
    #[arg(long, requires = "artifact")]
    pub version: Option<u32>,
}

/// Options shared by every command.
pub struct Globals<'a> {
    /// Pipeline configuration path.
    pub config: &'a Path,
    /// Model of the built-in pipeline.
    pub model: &'a str,
}

/// Runs one subcommand.
pub async fn dispatch(command: Command, globals: Globals<'_>) -> anyhow::Result<ExitCode> {
    match command {
        Command::Run(args) => run(args, globals).await,
        Command::Validate => validate(globals).await,
        Command::Stages => stages(globals),
        Command::Show(args) => show(args, globals).await,
    }
}

async fn run(args: RunArgs, globals: Globals<'_>) -> anyhow::Result<ExitCode> {
    let requirements = read_requirements(&args).await?;
    let run_id = match args.run_id {
        Some(id) => RunId::new(id.as_str())
            .with_context(|| format!("invalid run id '{id}': must be a single path segment"))?,
        None => RunId::generate(),
    };

    let (loaded, source) = load_pipeline(globals.config, globals.model)?;
    info!(source = %source, pipeline = %loaded.graph.name(), "pipeline loaded");
    let stack = build_stack(loaded).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current stage");
            interrupt.cancel();
        }
    });

    let report = stack
        .orchestrator
        .run_with_cancel(run_id, requirements, cancel)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report, stack.sink.as_ref()).await?;
    }

    Ok(match report.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn read_requirements(args: &RunArgs) -> anyhow::Result<String> {
    let text = match (&args.text, &args.requirements) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) if path.as_os_str() == "-" => {
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("failed to read requirements from stdin")?;
            buffer
        }
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("either --requirements or --text is required"),
    };
    if text.trim().is_empty() {
        bail!("the requirements are empty");
    }
    Ok(text)
}

async fn print_summary(report: &RunReport, sink: &dyn ArtifactSink) -> anyhow::Result<()> {
    println!("run {}: {}", report.run_id, report.status);
    for result in &report.results {
        let outcome = match &result.outcome {
            StageOutcome::Succeeded => "ok".to_string(),
            StageOutcome::Failed(failure) => format!("failed ({}): {}", failure.kind, failure.message),
        };
        println!(
            "  {:<24} {outcome}  attempts={} repairs={} {}ms tokens={}",
            result.stage.as_str(),
            result.attempts,
            result.repairs,
            result.latency.as_millis(),
            result.usage.total().as_u64(),
        );
    }

    let stored = sink.list(&report.run_id).await?;
    if !stored.is_empty() {
        println!("artifacts:");
        for location in stored {
            println!("  {} v{}  {}", location.name, location.version, location.uri);
        }
    }
    Ok(())
}

async fn validate(globals: Globals<'_>) -> anyhow::Result<ExitCode> {
    let (loaded, source) = load_pipeline(globals.config, globals.model)?;
    let name = loaded.graph.name().clone();
    let count = loaded.graph.stages().len();
    let stack = build_stack(loaded).await?;
    stack.orchestrator.validate()?;
    println!("pipeline '{name}' from {source} is valid: {count} stages");
    Ok(ExitCode::SUCCESS)
}

fn stages(globals: Globals<'_>) -> anyhow::Result<ExitCode> {
    let (loaded, source) = load_pipeline(globals.config, globals.model)?;
    let router = ModelRouter::for_graph(&loaded.graph, loaded.backends.iter().cloned());
    println!("pipeline '{}' ({source})", loaded.graph.name());

    for (position, stage) in loaded.graph.stages().iter().enumerate() {
        let binding = match router.resolve(&stage.id) {
            Ok(config) => format!("{}/{}", config.backend.id, config.params.model),
            Err(e) => format!("unresolved: {e}"),
        };
        let inputs: Vec<&str> = stage.inputs.iter().map(ArtifactName::as_str).collect();
        let outputs: Vec<&str> = stage.outputs.iter().map(|o| o.name.as_str()).collect();
        let tools: Vec<&str> = stage.tools.iter().map(|t| t.label()).collect();
        println!(
            "{:>2}. {:<24} [{binding}] {} -> {}{}",
            position + 1,
            stage.id.as_str(),
            if inputs.is_empty() { "-".to_string() } else { inputs.join(", ") },
            outputs.join(", "),
            if tools.is_empty() { String::new() } else { format!("  tools: {}", tools.join(", ")) },
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn show(args: ShowArgs, globals: Globals<'_>) -> anyhow::Result<ExitCode> {
    let (loaded, _) = load_pipeline(globals.config, globals.model)?;
    let sink = artifact_sink(&loaded.settings);
    let run_id = RunId::new(args.run_id.as_str()).with_context(|| {
        format!("invalid run id '{}': must be a single path segment", args.run_id)
    })?;

    let Some(artifact) = args.artifact else {
        let stored = sink.list(&run_id).await?;
        if stored.is_empty() {
            bail!("no artifacts stored for run '{run_id}'");
        }
        for location in stored {
            println!("{} v{}  {}", location.name, location.version, location.uri);
        }
        return Ok(ExitCode::SUCCESS);
    };

    let name = ArtifactName::new(artifact.as_str())
        .with_context(|| format!("invalid artifact name '{artifact}'"))?;
    let stored = match args.version {
        Some(version) => sink.read_version(&run_id, &name, version).await?,
        None => sink.read(&run_id, &name).await?,
    };
    print!("{}", stored.content.as_text());
    if !stored.content.as_text().ends_with('\n') {
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(text: Option<&str>, requirements: Option<PathBuf>) -> RunArgs {
        RunArgs {
            requirements,
            text: text.map(str::to_string),
            run_id: None,
            json: false,
        }
    }

    #[tokio::test]
    async fn inline_text_is_used_verbatim() {
        let text = read_requirements(&args(Some("Build a ledger"), None))
            .await
            .unwrap();
        assert_eq!(text, "Build a ledger");
    }

    #[tokio::test]
    async fn requirements_are_read_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.md");
        std::fs::write(&path, "# Ledger\nTrack balances.\n").unwrap();

        let text = read_requirements(&args(None, Some(path))).await.unwrap();

        assert!(text.contains("Track balances."));
    }

    #[tokio::test]
    async fn blank_requirements_are_rejected() {
        let err = read_requirements(&args(Some("  \n"), None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn missing_file_is_reported_with_its_path() {
        let err = read_requirements(&args(None, Some(PathBuf::from("/nonexistent/req.md"))))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/req.md"));
    }
}
