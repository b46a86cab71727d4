//! Workflow id resolution
//!
//! Operators can pass a short, unambiguous prefix of a workflow id instead of
//! the full UUID. Prefixes are matched against the most recent workflows.

use anyhow::{Context, Result, anyhow};
use shipyard_client::OrchestratorClient;
use shipyard_core::dto::workflow::WorkflowQuery;
use uuid::Uuid;

/// How many recent workflows a prefix is matched against
const RESOLVE_WINDOW: usize = 500;

/// Identifier that can be either a full UUID or a prefix of one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdOrPrefix {
    Full(Uuid),
    Prefix(String),
}

impl IdOrPrefix {
    pub fn parse(input: &str) -> Self {
        match Uuid::parse_str(input) {
            Ok(uuid) => IdOrPrefix::Full(uuid),
            Err(_) => IdOrPrefix::Prefix(input.trim().to_lowercase()),
        }
    }
}

/// Resolve a workflow id or prefix to a full UUID
///
/// # Errors
/// Fails when the prefix matches no workflow, matches several, or the
/// workflow listing cannot be fetched.
pub async fn resolve_workflow_id(client: &OrchestratorClient, input: &str) -> Result<Uuid> {
    let prefix = match IdOrPrefix::parse(input) {
        IdOrPrefix::Full(uuid) => return Ok(uuid),
        IdOrPrefix::Prefix(prefix) => prefix,
    };

    let workflows = client
        .list_workflows(&WorkflowQuery {
            limit: Some(RESOLVE_WINDOW),
            ..Default::default()
        })
        .await
        .context("Failed to fetch workflows for ID resolution")?;

    match_prefix(workflows.iter().map(|w| w.id), &prefix)
}

/// Pick the single id starting with `prefix`
pub fn match_prefix(ids: impl IntoIterator<Item = Uuid>, prefix: &str) -> Result<Uuid> {
    if prefix.is_empty() {
        return Err(anyhow!("Workflow ID must not be empty"));
    }

    let matches: Vec<Uuid> = ids
        .into_iter()
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!(
            "No workflow found with ID starting with '{}'",
            prefix
        )),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple workflows: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    #[test]
    fn test_parse_full_and_prefix() {
        let full = "3f2b8c1e-0000-4000-8000-000000000001";
        assert_eq!(IdOrPrefix::parse(full), IdOrPrefix::Full(id(full)));
        assert_eq!(
            IdOrPrefix::parse(" 3F2B "),
            IdOrPrefix::Prefix("3f2b".to_string())
        );
    }

    #[test]
    fn test_match_prefix() {
        let a = id("3f2b8c1e-0000-4000-8000-000000000001");
        let b = id("3f2b9d00-0000-4000-8000-000000000002");
        let c = id("a0000000-0000-4000-8000-000000000003");

        assert_eq!(match_prefix([a, b, c], "3f2b8").unwrap(), a);
        assert_eq!(match_prefix([a, b, c], "a").unwrap(), c);

        let err = match_prefix([a, b, c], "3f2b").unwrap_err().to_string();
        assert!(err.contains("Ambiguous"));
        assert!(err.contains(&a.to_string()) && err.contains(&b.to_string()));

        assert!(match_prefix([a, b, c], "ff").is_err());
        assert!(match_prefix([a], "").is_err());
    }
}
