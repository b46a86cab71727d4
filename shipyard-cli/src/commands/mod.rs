//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod events;
mod trigger;
mod workflow;

pub use workflow::WorkflowCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Workflow inspection and operator actions
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Build and deploy a service at a commit
    Trigger {
        /// Service ID
        service_id: String,

        /// Commit SHA to build
        #[arg(long)]
        commit: String,

        /// Branch (defaults to the service's tracked branch)
        #[arg(long)]
        branch: Option<String>,
    },
    /// Show retained bus events
    Events {
        /// Subject pattern, e.g. `build.>` or `deployment.*.billing-api`
        #[arg(long)]
        subject: Option<String>,

        /// Maximum number of events
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Stream a build's CI log
    Logs {
        /// Build ID
        build_id: String,
    },
}

/// Route a command to its handler
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Workflow { command } => workflow::handle_workflow_command(command, config).await,
        Commands::Trigger {
            service_id,
            commit,
            branch,
        } => trigger::trigger_service(config, &service_id, commit, branch).await,
        Commands::Events { subject, limit } => events::list_events(config, subject, limit).await,
        Commands::Logs { build_id } => events::stream_logs(config, &build_id).await,
    }
}
