//! Stagecraft CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Wire observability.** Install `tracing-subscriber` (text or JSON) and,
//!    when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, an OpenTelemetry OTLP exporter.
//! 2. **Load configuration.** Read `.stagecraft/pipeline.toml` (or `--config`);
//!    without a file, use the built-in engineering-team pipeline.
//! 3. **Construct infrastructure.** Build LLM providers, the process sandbox,
//!    the file-backed memory store and artifact sink, and inject them into the
//!    orchestrator.
//! 4. **Dispatch the command.** `run`, `validate`, `stages` or `show`.
//!
//! `run` exits non-zero when the run ends `FAILED`. Ctrl-C stops the run at the
//! next stage boundary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

mod commands;
mod observability;
mod wiring;

use commands::{Command, Globals};
use observability::LogFormat;

/// Multi-stage LLM pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "stagecraft")]
#[command(version, about)]
struct Cli {
    /// Pipeline configuration file
    #[arg(long, global = true, default_value = wiring::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Model used by the built-in pipeline
    #[arg(long, global = true, env = "STAGECRAFT_MODEL", default_value = wiring::DEFAULT_MODEL)]
    model: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = match observability::init(cli.log_format) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let globals = Globals {
        config: &cli.config,
        model: &cli.model,
    };
    let result = commands::dispatch(cli.command, globals).await;
    telemetry.shutdown();

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_requires_requirements() {
        assert!(Cli::try_parse_from(["stagecraft", "run"]).is_err());
        assert!(Cli::try_parse_from(["stagecraft", "run", "--text", "x", "--requirements", "r.md"]).is_err());
    }

    #[test]
    fn global_options_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "stagecraft",
            "run",
            "--text",
            "Build a ledger",
            "--config",
            "custom.toml",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Run(args) => assert_eq!(args.text.as_deref(), Some("Build a ledger")),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn show_version_requires_an_artifact() {
        assert!(Cli::try_parse_from(["stagecraft", "show", "--run-id", "r", "--version", "2"]).is_err());
        assert!(Cli::try_parse_from([
            "stagecraft", "show", "--run-id", "r", "--artifact", "design.md", "--version", "2"
        ])
        .is_ok());
    }
}
