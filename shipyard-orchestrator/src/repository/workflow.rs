//! Workflow Repository
//!
//! Updates are guarded by the row's `version` column so concurrent writers
//! (webhook consumers, the reconciler, sweepers on other instances) never
//! overwrite each other's transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::domain::build::Build;
use shipyard_core::domain::workflow::{Trigger, TriggerKind, Workflow, WorkflowStatus};
use shipyard_core::dto::workflow::WorkflowQuery;
use sqlx::PgPool;
use uuid::Uuid;

use super::{DEFAULT_LIST_LIMIT, RepoResult, RepositoryError, WorkflowRepository};

pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, service_id, trigger_kind, provider, delivery_id, commit_sha, branch, build_id,
           deployment_id, status, error, version, created_at, updated_at, last_activity_at
    FROM workflows
"#;

fn status_list(statuses: &[WorkflowStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn create_with_build(&self, workflow: &Workflow, build: &Build) -> RepoResult<()> {
        let mut tx = self.pool.begin().await?;

        super::build::insert(&mut tx, build).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflows (id, service_id, trigger_kind, provider, delivery_id, commit_sha,
                                   branch, build_id, deployment_id, status, error, version,
                                   created_at, updated_at, last_activity_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.service_id)
        .bind(kind_to_string(workflow.trigger.kind))
        .bind(&workflow.trigger.provider)
        .bind(&workflow.trigger.delivery_id)
        .bind(&workflow.trigger.commit_sha)
        .bind(&workflow.trigger.branch)
        .bind(workflow.build_id)
        .bind(workflow.deployment_id)
        .bind(workflow.status.as_str())
        .bind(&workflow.error)
        .bind(workflow.version)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .bind(workflow.last_activity_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(())
            }
            // Dropping the transaction rolls the build insert back
            Err(e) if super::is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "active workflow exists for service {} at {}",
                workflow.service_id, workflow.trigger.commit_sha
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Workflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_active(
        &self,
        service_id: Uuid,
        commit_sha: &str,
    ) -> RepoResult<Option<Workflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "{} WHERE service_id = $1 AND commit_sha = $2 AND status = ANY($3)",
            SELECT_COLUMNS
        ))
        .bind(service_id)
        .bind(commit_sha)
        .bind(status_list(&WorkflowStatus::ACTIVE))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_by_build(&self, build_id: Uuid) -> RepoResult<Option<Workflow>> {
        let row =
            sqlx::query_as::<_, WorkflowRow>(&format!("{} WHERE build_id = $1", SELECT_COLUMNS))
                .bind(build_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn list(&self, query: &WorkflowQuery) -> RepoResult<Vec<Workflow>> {
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64;

        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "{} WHERE ($1::uuid IS NULL OR service_id = $1) \
             AND ($2::varchar IS NULL OR status = $2) \
             ORDER BY created_at DESC LIMIT $3",
            SELECT_COLUMNS
        ))
        .bind(query.service_id)
        .bind(query.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn list_by_status(&self, statuses: &[WorkflowStatus]) -> RepoResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "{} WHERE status = ANY($1) ORDER BY last_activity_at ASC",
            SELECT_COLUMNS
        ))
        .bind(status_list(statuses))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn find_stale(&self, inactive_since: DateTime<Utc>) -> RepoResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "{} WHERE status = ANY($1) AND last_activity_at < $2 ORDER BY last_activity_at ASC",
            SELECT_COLUMNS
        ))
        .bind(status_list(&WorkflowStatus::ACTIVE))
        .bind(inactive_since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn update(&self, workflow: &mut Workflow) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET deployment_id = $1, status = $2, error = $3, updated_at = $4,
                last_activity_at = $5, version = version + 1
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(workflow.deployment_id)
        .bind(workflow.status.as_str())
        .bind(&workflow.error)
        .bind(workflow.updated_at)
        .bind(workflow.last_activity_at)
        .bind(workflow.id)
        .bind(workflow.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        workflow.version += 1;
        Ok(true)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
        let terminal: Vec<WorkflowStatus> = WorkflowStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();

        let result =
            sqlx::query("DELETE FROM workflows WHERE status = ANY($1) AND updated_at < $2")
                .bind(status_list(&terminal))
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn kind_to_string(kind: TriggerKind) -> &'static str {
    match kind {
        TriggerKind::Webhook => "webhook",
        TriggerKind::Manual => "manual",
    }
}

fn string_to_kind(s: &str) -> TriggerKind {
    match s {
        "webhook" => TriggerKind::Webhook,
        _ => TriggerKind::Manual,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    service_id: Uuid,
    trigger_kind: String,
    provider: Option<String>,
    delivery_id: Option<String>,
    commit_sha: String,
    branch: String,
    build_id: Uuid,
    deployment_id: Option<Uuid>,
    status: String,
    error: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl From<WorkflowRow> for Workflow {
    fn from(row: WorkflowRow) -> Self {
        // Unknown statuses come from a newer schema; keep them out of the
        // active set so the reconciler leaves them alone.
        let status = WorkflowStatus::parse(&row.status).unwrap_or(WorkflowStatus::Failed);

        Workflow {
            id: row.id,
            service_id: row.service_id,
            trigger: Trigger {
                kind: string_to_kind(&row.trigger_kind),
                provider: row.provider,
                delivery_id: row.delivery_id,
                commit_sha: row.commit_sha,
                branch: row.branch,
            },
            build_id: row.build_id,
            deployment_id: row.deployment_id,
            status,
            error: row.error,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_activity_at: row.last_activity_at,
        }
    }
}
