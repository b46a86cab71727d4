//! Workflow command handlers
//!
//! Listing, inspecting, canceling and rolling back workflows.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::*;
use shipyard_client::OrchestratorClient;
use shipyard_core::domain::workflow::{Workflow, WorkflowStatus};
use shipyard_core::dto::workflow::{WorkflowDetails, WorkflowQuery};
use uuid::Uuid;

use crate::config::Config;
use crate::id_resolver::resolve_workflow_id;

/// Workflow subcommands
#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// List workflows, newest first
    List {
        /// Only workflows of this service
        #[arg(long)]
        service: Option<Uuid>,

        /// Only workflows in this status
        #[arg(long, value_parser = parse_status)]
        status: Option<WorkflowStatus>,

        /// Maximum number of workflows
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Get workflow details with its build and deployment
    Get {
        /// Workflow ID or unambiguous prefix
        id: String,
    },
    /// Cancel a pending or building workflow
    Cancel {
        /// Workflow ID or unambiguous prefix
        id: String,
    },
    /// Roll a succeeded workflow's service back to its previous release
    Rollback {
        /// Workflow ID or unambiguous prefix
        id: String,
    },
}

pub async fn handle_workflow_command(command: WorkflowCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        WorkflowCommands::List {
            service,
            status,
            limit,
        } => list_workflows(&client, service, status, limit).await,
        WorkflowCommands::Get { id } => get_workflow(&client, &id).await,
        WorkflowCommands::Cancel { id } => cancel_workflow(&client, &id).await,
        WorkflowCommands::Rollback { id } => rollback_workflow(&client, &id).await,
    }
}

fn parse_status(s: &str) -> Result<WorkflowStatus, String> {
    WorkflowStatus::parse(s).ok_or_else(|| {
        let valid: Vec<&str> = WorkflowStatus::ALL.iter().map(|s| s.as_str()).collect();
        format!("expected one of: {}", valid.join(", "))
    })
}

async fn list_workflows(
    client: &OrchestratorClient,
    service_id: Option<Uuid>,
    status: Option<WorkflowStatus>,
    limit: usize,
) -> Result<()> {
    let workflows = client
        .list_workflows(&WorkflowQuery {
            service_id,
            status,
            limit: Some(limit),
        })
        .await?;

    if workflows.is_empty() {
        println!("{}", "No workflows found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} workflow(s):", workflows.len()).bold()
        );
        println!();
        for workflow in &workflows {
            print_workflow_summary(workflow);
        }
    }

    Ok(())
}

async fn get_workflow(client: &OrchestratorClient, id: &str) -> Result<()> {
    let id = resolve_workflow_id(client, id).await?;
    let details = client.get_workflow(id).await?;

    print_workflow_details(&details);
    Ok(())
}

async fn cancel_workflow(client: &OrchestratorClient, id: &str) -> Result<()> {
    let id = resolve_workflow_id(client, id).await?;
    let workflow = client.cancel_workflow(id).await?;

    println!("{}", "✓ Workflow canceled".green());
    println!();
    print_workflow_summary(&workflow);
    Ok(())
}

async fn rollback_workflow(client: &OrchestratorClient, id: &str) -> Result<()> {
    let id = resolve_workflow_id(client, id).await?;
    let workflow = client.rollback_workflow(id).await?;

    println!("{}", "✓ Service rolled back".green());
    println!();
    print_workflow_summary(&workflow);
    Ok(())
}

pub fn print_workflow_summary(workflow: &Workflow) {
    println!(
        "  {} Workflow {}",
        "▸".cyan(),
        workflow.id.to_string().dimmed()
    );
    println!("    Service: {}", workflow.service_id.to_string().dimmed());
    println!("    Status:  {}", colorize_status(workflow.status));
    println!(
        "    Commit:  {} ({})",
        short_sha(&workflow.trigger.commit_sha),
        workflow.trigger.branch
    );
    println!("    Created: {}", timestamp(workflow.created_at).dimmed());
    if let Some(error) = &workflow.error {
        println!("    Error:   {}", error.red());
    }
    println!();
}

fn print_workflow_details(details: &WorkflowDetails) {
    let workflow = &details.workflow;

    println!("{}", "Workflow Details:".bold());
    println!("  ID:        {}", workflow.id.to_string().cyan());
    println!("  Service:   {}", workflow.service_id.to_string().dimmed());
    println!("  Status:    {}", colorize_status(workflow.status));
    println!("  Trigger:   {}", workflow.trigger.kind);
    if let Some(provider) = &workflow.trigger.provider {
        println!("  Provider:  {}", provider);
    }
    if let Some(delivery) = &workflow.trigger.delivery_id {
        println!("  Delivery:  {}", delivery.dimmed());
    }
    println!("  Commit:    {}", workflow.trigger.commit_sha);
    println!("  Branch:    {}", workflow.trigger.branch);
    println!("  Created:   {}", timestamp(workflow.created_at));
    println!("  Updated:   {}", timestamp(workflow.updated_at));

    if workflow.status.is_terminal() {
        let duration = workflow.updated_at.signed_duration_since(workflow.created_at);
        println!("  Duration:  {}s", duration.num_seconds());
    }

    if let Some(error) = &workflow.error {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }

    if let Some(build) = &details.build {
        println!("\n{}", "Build:".bold());
        println!("  ID:        {}", build.id.to_string().cyan());
        println!("  Status:    {}", build.status);
        if let Some(external) = &build.external_id {
            println!("  CI ID:     {}", external.dimmed());
        }
        if let Some(artifact) = &build.artifact {
            println!("  Artifact:  {}", artifact);
        }
        if let (Some(started), Some(finished)) = (build.started_at, build.finished_at) {
            let duration = finished.signed_duration_since(started);
            println!("  Duration:  {}s", duration.num_seconds());
        }
        if let Some(error) = &build.error {
            println!("  Error:     {}", error.red());
        }
    }

    if let Some(deployment) = &details.deployment {
        println!("\n{}", "Deployment:".bold());
        println!("  ID:        {}", deployment.id.to_string().cyan());
        println!("  Status:    {}", deployment.status);
        println!("  Version:   {}", deployment.version);
        if let Some(revision) = &deployment.revision {
            println!("  Revision:  {}", revision.dimmed());
        }
        if let Some(error) = &deployment.error {
            println!("  Error:     {}", error.red());
        }
    }
}

fn colorize_status(status: WorkflowStatus) -> ColoredString {
    let s = status.as_str();
    match status {
        WorkflowStatus::Pending => s.yellow(),
        WorkflowStatus::Building | WorkflowStatus::Deploying => s.cyan(),
        WorkflowStatus::Succeeded => s.green(),
        WorkflowStatus::Failed => s.red(),
        WorkflowStatus::RolledBack => s.magenta(),
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
