use anyhow::Context;
use shipyard_providers::{
    GitHubProvider, GitLabProvider, GitProvider, GiteaProvider, ProviderConfig, ProviderRegistry,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod gateway;
pub mod ports;
pub mod repository;
pub mod service;

#[cfg(test)]
mod testing;

use bus::{EventBus, EventBusConfig, InMemoryEventBus};
use config::{Config, StorageBackend};
use gateway::{DeliveryDedup, WebhookGateway};
use ports::argocd::ArgoCdClient;
use ports::http_ci::HttpCiClient;
use ports::retry::RetryPolicy;
use ports::{CiPort, GitOpsPort, UnconfiguredCi, UnconfiguredGitOps};
use repository::Repositories;
use service::{Orchestrator, Reconciler, Sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shipyard_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Shipyard Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let repos = match config.storage {
        StorageBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(&config.database_url)
                .await
                .context("Failed to create database pool")?;

            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database ready");

            Repositories::postgres(pool)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; state is lost on restart");
            Repositories::in_memory()
        }
    };

    let bus = Arc::new(InMemoryEventBus::new(EventBusConfig {
        history_capacity: config.event_history_capacity,
        ..Default::default()
    }));
    let dyn_bus: Arc<dyn EventBus> = bus.clone();

    let orchestrator = Arc::new(Orchestrator::new(
        repos,
        dyn_bus.clone(),
        ci_port(&config),
        gitops_port(&config),
        RetryPolicy {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            call_timeout: config.port_call_timeout,
        },
        config.deploy_namespace.clone(),
    ));

    service::subscriber::register(&dyn_bus, orchestrator.clone(), config.event_workers)
        .await
        .context("Failed to subscribe orchestrator to the event bus")?;

    let dedup = Arc::new(DeliveryDedup::new(config.delivery_dedup_ttl));
    let gateway = Arc::new(WebhookGateway::new(
        Arc::new(provider_registry(&config)),
        webhook_secrets(&config),
        dedup.clone(),
        dyn_bus.clone(),
    ));

    // Background workers
    let (shutdown, _) = broadcast::channel(1);
    let reconciler = tokio::spawn(
        Reconciler::new(orchestrator.clone(), config.reconcile_interval).run(shutdown.subscribe()),
    );
    let sweeper = tokio::spawn(
        Sweeper::new(
            orchestrator.clone(),
            dedup,
            config.workflow_stale_after,
            config.workflow_retention,
        )
        .run(config.sweep_interval, shutdown.subscribe()),
    );

    // Build router with all API endpoints
    let app = api::create_router(api::AppState {
        orchestrator,
        gateway,
        bus: dyn_bus,
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!(
        "Shutting down; waiting up to {:?} for in-flight work",
        config.shutdown_grace
    );
    let _ = shutdown.send(());

    let workers = async {
        let _ = reconciler.await;
        let _ = sweeper.await;
    };
    if tokio::time::timeout(config.shutdown_grace, workers).await.is_err() {
        tracing::warn!("Background workers did not stop within the grace period");
    }
    bus.shutdown(config.shutdown_grace).await;

    tracing::info!("Shipyard Orchestrator stopped");
    Ok(())
}

fn ci_port(config: &Config) -> Arc<dyn CiPort> {
    match &config.ci_base_url {
        Some(url) => {
            tracing::info!("CI backend: {}", url);
            Arc::new(HttpCiClient::new(url.clone(), config.ci_token.clone()))
        }
        None => {
            tracing::warn!("CI_BASE_URL not set; builds will fail");
            Arc::new(UnconfiguredCi)
        }
    }
}

fn gitops_port(config: &Config) -> Arc<dyn GitOpsPort> {
    match &config.argocd_url {
        Some(url) => {
            tracing::info!("Argo CD backend: {} (project {})", url, config.argocd_project);
            Arc::new(ArgoCdClient::new(
                url.clone(),
                config.argocd_token.clone().unwrap_or_default(),
                config.argocd_project.clone(),
            ))
        }
        None => {
            tracing::warn!("ARGOCD_URL not set; deployments will fail");
            Arc::new(UnconfiguredGitOps)
        }
    }
}

fn provider_registry(config: &Config) -> ProviderRegistry {
    let settings = |id: &str| {
        let s = config.providers.get(id).cloned().unwrap_or_default();
        ProviderConfig {
            client_id: s.client_id,
            client_secret: s.client_secret,
            redirect_url: s.redirect_url,
            api_url: s.api_url,
            web_url: s.web_url,
        }
    };

    let providers: [Arc<dyn GitProvider>; 3] = [
        Arc::new(GitHubProvider::new(settings("github"))),
        Arc::new(GitLabProvider::new(settings("gitlab"))),
        Arc::new(GiteaProvider::new(settings("gitea"))),
    ];

    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider);
    }
    tracing::info!("Webhook providers: {}", registry.ids().join(", "));
    registry
}

fn webhook_secrets(config: &Config) -> HashMap<String, String> {
    let secrets: HashMap<String, String> = config::KNOWN_PROVIDERS
        .iter()
        .filter_map(|id| {
            config
                .webhook_secret(id)
                .map(|secret| (id.to_string(), secret.to_string()))
        })
        .collect();

    for id in config::KNOWN_PROVIDERS {
        if !secrets.contains_key(id) {
            tracing::warn!("No webhook secret for {}; its deliveries will be rejected", id);
        }
    }
    secrets
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
