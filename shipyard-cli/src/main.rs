//! Shipyard CLI
//!
//! Inspect and steer deployment workflows: list what is building or rolling
//! out, trigger a commit by hand, cancel or roll back, and tail build logs.

mod commands;
mod config;
mod id_resolver;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

const EXAMPLES: &str = "\
Examples:
  shipyard workflow list --status deploying
  shipyard workflow get 3f2a
  shipyard trigger 6c1e0b7a-1d4f-4b8e-9a53-2f9d7c0e4a11 --commit 0d1a26e --branch main
  shipyard workflow rollback 3f2a
  shipyard events --subject 'deployment.>' --limit 20
  shipyard logs 9b7c4d2e-55aa-4f0e-8d1b-6a3e2c1f0b9d";

#[derive(Parser)]
#[command(name = "shipyard", version)]
#[command(
    about = "Operate the Shipyard deployment orchestrator",
    long_about = "Operate the Shipyard deployment orchestrator.\n\n\
                  Every push to a tracked branch becomes a workflow that builds the commit \
                  in CI and rolls the result out through GitOps. This tool queries and \
                  controls those workflows over the orchestrator's HTTP API. Workflow ids \
                  may be shortened to any unique prefix.",
    after_help = EXAMPLES
)]
struct Cli {
    /// Base URL of the orchestrator API
    #[arg(
        long,
        global = true,
        env = "SHIPYARD_ORCHESTRATOR_URL",
        default_value = "http://localhost:8080"
    )]
    orchestrator_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        orchestrator_url,
        command,
    } = Cli::parse();

    handle_command(command, &Config { orchestrator_url }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_orchestrator_url_after_subcommand() {
        let cli = Cli::try_parse_from([
            "shipyard",
            "workflow",
            "list",
            "--orchestrator-url",
            "http://shipyard.internal:9000",
        ])
        .unwrap();
        assert_eq!(cli.orchestrator_url, "http://shipyard.internal:9000");
        assert!(matches!(cli.command, Commands::Workflow { .. }));
    }

    #[test]
    fn test_trigger_requires_commit() {
        let service = "6c1e0b7a-1d4f-4b8e-9a53-2f9d7c0e4a11";
        assert!(Cli::try_parse_from(["shipyard", "trigger", service]).is_err());
        assert!(Cli::try_parse_from(["shipyard", "trigger", service, "--commit", "0d1a26e"]).is_ok());
    }
}
