use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Services are created by the API collaborator; the orchestrator mutates
    // status and the current build/version pointers only.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            name VARCHAR(255) NOT NULL,
            slug VARCHAR(255) NOT NULL,
            repository_url TEXT NOT NULL,
            branch VARCHAR(255) NOT NULL,
            build_kind VARCHAR(50) NOT NULL,
            status VARCHAR(50) NOT NULL,
            current_build_id UUID,
            current_deployment_id UUID,
            current_version VARCHAR(255),
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id UUID PRIMARY KEY,
            service_id UUID NOT NULL REFERENCES services(id) ON DELETE CASCADE,
            status VARCHAR(50) NOT NULL,
            commit_sha VARCHAR(64) NOT NULL,
            external_id VARCHAR(255),
            artifact TEXT,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
            id UUID PRIMARY KEY,
            service_id UUID NOT NULL REFERENCES services(id) ON DELETE CASCADE,
            build_id UUID NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
            status VARCHAR(50) NOT NULL,
            external_id VARCHAR(255),
            revision VARCHAR(255),
            version VARCHAR(255) NOT NULL,
            replicas INTEGER NOT NULL DEFAULT 1,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id UUID PRIMARY KEY,
            service_id UUID NOT NULL REFERENCES services(id) ON DELETE CASCADE,
            trigger_kind VARCHAR(20) NOT NULL,
            provider VARCHAR(50),
            delivery_id VARCHAR(255),
            commit_sha VARCHAR(64) NOT NULL,
            branch VARCHAR(255) NOT NULL,
            build_id UUID NOT NULL REFERENCES builds(id),
            deployment_id UUID REFERENCES deployments(id),
            status VARCHAR(20) NOT NULL,
            error TEXT,
            version BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            last_activity_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one in-flight workflow per (service, commit)
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_workflows_active_key
        ON workflows(service_id, commit_sha)
        WHERE status IN ('pending', 'building', 'deploying')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status, last_activity_at)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_build_id ON workflows(build_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflows_created_at ON workflows(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_service_id ON builds(service_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deployments_service_status ON deployments(service_id, status, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_services_branch ON services(branch)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
