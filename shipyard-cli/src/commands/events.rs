//! Event history and build log commands

use anyhow::{Context, Result};
use colored::*;
use shipyard_core::domain::event::EventRecord;
use shipyard_core::dto::workflow::EventQuery;
use std::io::Write;
use uuid::Uuid;

use crate::config::Config;

pub async fn list_events(config: &Config, subject: Option<String>, limit: usize) -> Result<()> {
    let client = config.client();
    let records = client
        .list_events(&EventQuery {
            subject,
            limit: Some(limit),
            ..Default::default()
        })
        .await?;

    if records.is_empty() {
        println!("{}", "No events found.".yellow());
        return Ok(());
    }

    for record in &records {
        print_event(record);
    }
    Ok(())
}

pub async fn stream_logs(config: &Config, build_id: &str) -> Result<()> {
    let build_id =
        Uuid::parse_str(build_id).with_context(|| format!("Invalid build ID '{}'", build_id))?;
    let client = config.client();

    println!("{}", format!("Logs for build {}:", build_id).bold());
    println!("{}", "─".repeat(80).dimmed());

    let mut stdout = std::io::stdout();
    client
        .stream_build_logs(build_id, |chunk| {
            let _ = stdout.write_all(chunk.as_bytes());
            let _ = stdout.flush();
        })
        .await?;

    println!("{}", "─".repeat(80).dimmed());
    Ok(())
}

fn print_event(record: &EventRecord) {
    let event = &record.event;
    let event_type = if event.event_type.ends_with(".failed") {
        event.event_type.red()
    } else if event.event_type.ends_with(".succeeded") {
        event.event_type.green()
    } else {
        event.event_type.cyan()
    };

    println!(
        "{} {} {} {}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
        event_type,
        record.subject,
        format!("({})", event.source).dimmed()
    );
    if let Some(correlation) = event.correlation_id {
        println!("    Workflow: {}", correlation.to_string().dimmed());
    }
    if let Some(error) = event.payload.get("error").and_then(|v| v.as_str()) {
        println!("    Error:    {}", error.red());
    }
}
