//! Build Repository
//!
//! Builds are inserted together with their workflow (see
//! `WorkflowRepository::create_with_build`); this module reads and updates them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::domain::build::{Build, BuildStatus};
use sqlx::PgPool;
use uuid::Uuid;

use super::{BuildRepository, RepoResult, RepositoryError};

pub struct PgBuildRepository {
    pool: PgPool,
}

impl PgBuildRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildRepository for PgBuildRepository {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            SELECT id, service_id, status, commit_sha, external_id, artifact, error,
                   created_at, started_at, finished_at
            FROM builds
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn update(&self, build: &Build) -> RepoResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET status = $1, external_id = $2, artifact = $3, error = $4,
                started_at = $5, finished_at = $6
            WHERE id = $7 AND status NOT IN ('succeeded', 'failed', 'canceled')
            "#,
        )
        .bind(status_to_string(build.status))
        .bind(&build.external_id)
        .bind(&build.artifact)
        .bind(&build.error)
        .bind(build.started_at)
        .bind(build.finished_at)
        .bind(build.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Either missing or already finished
        match self.find_by_id(build.id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound {
                entity: "build",
                id: build.id,
            }),
        }
    }
}

/// Insert a build inside an open transaction
pub(super) async fn insert(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    build: &Build,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO builds (id, service_id, status, commit_sha, external_id, artifact, error,
                            created_at, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(build.id)
    .bind(build.service_id)
    .bind(status_to_string(build.status))
    .bind(&build.commit_sha)
    .bind(&build.external_id)
    .bind(&build.artifact)
    .bind(&build.error)
    .bind(build.created_at)
    .bind(build.started_at)
    .bind(build.finished_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: BuildStatus) -> &'static str {
    match status {
        BuildStatus::Queued => "queued",
        BuildStatus::Running => "running",
        BuildStatus::Succeeded => "succeeded",
        BuildStatus::Failed => "failed",
        BuildStatus::Canceled => "canceled",
    }
}

fn string_to_status(s: &str) -> BuildStatus {
    match s {
        "running" => BuildStatus::Running,
        "succeeded" => BuildStatus::Succeeded,
        "failed" => BuildStatus::Failed,
        "canceled" => BuildStatus::Canceled,
        _ => BuildStatus::Queued,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: Uuid,
    service_id: Uuid,
    status: String,
    commit_sha: String,
    external_id: Option<String>,
    artifact: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<BuildRow> for Build {
    fn from(row: BuildRow) -> Self {
        Build {
            id: row.id,
            service_id: row.service_id,
            status: string_to_status(&row.status),
            commit_sha: row.commit_sha,
            external_id: row.external_id,
            artifact: row.artifact,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        }
    }
}
