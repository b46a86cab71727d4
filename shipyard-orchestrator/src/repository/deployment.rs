//! Deployment Repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::domain::deployment::{Deployment, DeploymentStatus};
use sqlx::PgPool;
use uuid::Uuid;

use super::{DeploymentRepository, RepoResult, RepositoryError};

pub struct PgDeploymentRepository {
    pool: PgPool,
}

impl PgDeploymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, service_id, build_id, status, external_id, revision, version, replicas,
           error, created_at, finished_at
    FROM deployments
"#;

#[async_trait]
impl DeploymentRepository for PgDeploymentRepository {
    async fn create(&self, deployment: &Deployment) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deployments (id, service_id, build_id, status, external_id, revision,
                                     version, replicas, error, created_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(deployment.id)
        .bind(deployment.service_id)
        .bind(deployment.build_id)
        .bind(status_to_string(deployment.status))
        .bind(&deployment.external_id)
        .bind(&deployment.revision)
        .bind(&deployment.version)
        .bind(deployment.replicas)
        .bind(&deployment.error)
        .bind(deployment.created_at)
        .bind(deployment.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Deployment>> {
        let row =
            sqlx::query_as::<_, DeploymentRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn update(&self, deployment: &Deployment) -> RepoResult<bool> {
        // Mirrors DeploymentStatus::accepts
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1, external_id = $2, revision = $3, error = $4, finished_at = $5
            WHERE id = $6
              AND (status IN ('pending', 'in_progress')
                   OR (status = 'succeeded' AND $1 = 'rolled_back'))
            "#,
        )
        .bind(status_to_string(deployment.status))
        .bind(&deployment.external_id)
        .bind(&deployment.revision)
        .bind(&deployment.error)
        .bind(deployment.finished_at)
        .bind(deployment.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        match self.find_by_id(deployment.id).await? {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound {
                entity: "deployment",
                id: deployment.id,
            }),
        }
    }

    async fn find_previous_succeeded(
        &self,
        service_id: Uuid,
        before: DateTime<Utc>,
    ) -> RepoResult<Option<Deployment>> {
        let row = sqlx::query_as::<_, DeploymentRow>(&format!(
            "{} WHERE service_id = $1 AND status = 'succeeded' AND created_at < $2 \
             ORDER BY created_at DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(service_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: DeploymentStatus) -> &'static str {
    match status {
        DeploymentStatus::Pending => "pending",
        DeploymentStatus::InProgress => "in_progress",
        DeploymentStatus::Succeeded => "succeeded",
        DeploymentStatus::Failed => "failed",
        DeploymentStatus::RolledBack => "rolled_back",
    }
}

fn string_to_status(s: &str) -> DeploymentStatus {
    match s {
        "in_progress" => DeploymentStatus::InProgress,
        "succeeded" => DeploymentStatus::Succeeded,
        "failed" => DeploymentStatus::Failed,
        "rolled_back" => DeploymentStatus::RolledBack,
        _ => DeploymentStatus::Pending,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: Uuid,
    service_id: Uuid,
    build_id: Uuid,
    status: String,
    external_id: Option<String>,
    revision: Option<String>,
    version: String,
    replicas: i32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<DeploymentRow> for Deployment {
    fn from(row: DeploymentRow) -> Self {
        Deployment {
            id: row.id,
            service_id: row.service_id,
            build_id: row.build_id,
            status: string_to_status(&row.status),
            external_id: row.external_id,
            revision: row.revision,
            version: row.version,
            replicas: row.replicas,
            error: row.error,
            created_at: row.created_at,
            finished_at: row.finished_at,
        }
    }
}
