//! Manual trigger command

use anyhow::{Context, Result};
use colored::*;
use shipyard_core::dto::workflow::TriggerService;
use uuid::Uuid;

use super::workflow::print_workflow_summary;
use crate::config::Config;

pub async fn trigger_service(
    config: &Config,
    service_id: &str,
    commit: String,
    branch: Option<String>,
) -> Result<()> {
    let service_id = Uuid::parse_str(service_id)
        .with_context(|| format!("Invalid service ID '{}'", service_id))?;
    let client = config.client();

    let outcome = client
        .trigger_service(
            service_id,
            &TriggerService {
                commit_sha: commit,
                branch,
            },
        )
        .await?;

    if outcome.coalesced {
        println!(
            "{}",
            "✓ Commit already has an active workflow".yellow()
        );
    } else {
        println!("{}", "✓ Workflow started".green());
    }
    println!();
    print_workflow_summary(&outcome.workflow);

    Ok(())
}
