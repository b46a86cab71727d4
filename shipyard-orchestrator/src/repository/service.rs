//! Service Repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::domain::service::{BuildKind, BuildSource, Service, ServiceStatus};
use sqlx::PgPool;
use uuid::Uuid;

use super::{RepoResult, ServiceRepository};

pub struct PgServiceRepository {
    pool: PgPool,
}

impl PgServiceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, project_id, name, slug, repository_url, branch, build_kind, status,
           current_build_id, current_deployment_id, current_version, created_at, updated_at
    FROM services
"#;

#[async_trait]
impl ServiceRepository for PgServiceRepository {
    async fn create(&self, service: &Service) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO services (id, project_id, name, slug, repository_url, branch, build_kind,
                                  status, current_build_id, current_deployment_id, current_version,
                                  created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(service.id)
        .bind(service.project_id)
        .bind(&service.name)
        .bind(&service.slug)
        .bind(&service.source.repository_url)
        .bind(&service.source.branch)
        .bind(kind_to_string(service.source.kind))
        .bind(status_to_string(service.status))
        .bind(service.current_build_id)
        .bind(service.current_deployment_id)
        .bind(&service.current_version)
        .bind(service.created_at)
        .bind(service.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Service>> {
        let row = sqlx::query_as::<_, ServiceRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_tracking(&self, repository_url: &str, branch: &str) -> RepoResult<Vec<Service>> {
        // URL spellings vary (ssh vs https, .git suffix), so narrow by branch
        // in SQL and compare normalised URLs here.
        let rows = sqlx::query_as::<_, ServiceRow>(&format!("{} WHERE branch = $1", SELECT_COLUMNS))
            .bind(branch)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(Service::from)
            .filter(|s| s.source.tracks(repository_url, branch))
            .collect())
    }

    async fn update(&self, service: &Service) -> RepoResult<()> {
        sqlx::query(
            r#"
            UPDATE services
            SET status = $1, current_build_id = $2, current_deployment_id = $3,
                current_version = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(status_to_string(service.status))
        .bind(service.current_build_id)
        .bind(service.current_deployment_id)
        .bind(&service.current_version)
        .bind(service.updated_at)
        .bind(service.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: ServiceStatus) -> &'static str {
    match status {
        ServiceStatus::Pending => "pending",
        ServiceStatus::Building => "building",
        ServiceStatus::Deploying => "deploying",
        ServiceStatus::Running => "running",
        ServiceStatus::Failed => "failed",
        ServiceStatus::Stopped => "stopped",
    }
}

fn string_to_status(s: &str) -> ServiceStatus {
    match s {
        "building" => ServiceStatus::Building,
        "deploying" => ServiceStatus::Deploying,
        "running" => ServiceStatus::Running,
        "failed" => ServiceStatus::Failed,
        "stopped" => ServiceStatus::Stopped,
        _ => ServiceStatus::Pending,
    }
}

fn kind_to_string(kind: BuildKind) -> &'static str {
    match kind {
        BuildKind::Auto => "auto",
        BuildKind::Dockerfile => "dockerfile",
        BuildKind::Buildpack => "buildpack",
        BuildKind::Static => "static",
    }
}

fn string_to_kind(s: &str) -> BuildKind {
    match s {
        "dockerfile" => BuildKind::Dockerfile,
        "buildpack" => BuildKind::Buildpack,
        "static" => BuildKind::Static,
        _ => BuildKind::Auto,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    project_id: Uuid,
    name: String,
    slug: String,
    repository_url: String,
    branch: String,
    build_kind: String,
    status: String,
    current_build_id: Option<Uuid>,
    current_deployment_id: Option<Uuid>,
    current_version: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ServiceRow> for Service {
    fn from(row: ServiceRow) -> Self {
        Service {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            slug: row.slug,
            source: BuildSource {
                repository_url: row.repository_url,
                branch: row.branch,
                kind: string_to_kind(&row.build_kind),
            },
            status: string_to_status(&row.status),
            current_build_id: row.current_build_id,
            current_deployment_id: row.current_deployment_id,
            current_version: row.current_version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
