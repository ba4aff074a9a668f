use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agent_dispatch::backend::{ApiBackend, BackendConfig, CliBackend, ExecutionBackend, StubBackend};
use agent_dispatch::config::{ApiBackendConfig, CliBackendConfig, WorkerConfig};
use agent_dispatch::jobs::{
    ChannelBroadcaster, InMemoryJobQueue, InMemoryJobStore, JobOrchestrator, OrchestratorConfig,
};
use agent_dispatch::registry::BackendRegistry;
use agent_dispatch::resilience::CircuitBreakerConfig;

/// How often expired approval waits are swept.
const APPROVAL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::from_env()?;
    let _log_guard = init_tracing(&config)?;

    eprintln!("Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", config.name);
    eprintln!("   Concurrency: {}", config.worker_concurrency);

    // ── Backends ────────────────────────────────────────────────────────
    let registry = Arc::new(BackendRegistry::with_health_ttl(config.health_ttl));

    if let Some(cli) = CliBackendConfig::from_env()? {
        let max_concurrent = cli.max_concurrent;
        register(
            &registry,
            Arc::new(CliBackend::new("cli")),
            BackendConfig::Cli(cli),
            max_concurrent,
        )
        .await;
    }

    let api = ApiBackendConfig::from_env()?;
    if api.api_key.is_some() {
        let max_concurrent = api.max_concurrent;
        register(
            &registry,
            Arc::new(ApiBackend::new("api")),
            BackendConfig::Api(api),
            max_concurrent,
        )
        .await;
    }

    if std::env::var("AGENT_DISPATCH_STUB").is_ok() || registry.ids().await.is_empty() {
        tracing::warn!("No real backend configured, registering the stub backend");
        register(
            &registry,
            Arc::new(StubBackend::new("stub")),
            BackendConfig::Stub,
            4,
        )
        .await;
    }

    let ids = registry.ids().await;
    if ids.len() > 1 {
        registry.configure_router(None).await?;
    }
    eprintln!("   Backends: {}", ids.join(", "));

    for report in registry.health_reports().await {
        tracing::info!(
            backend = %report.backend_id,
            status = ?report.status,
            reason = ?report.reason,
            "Initial health"
        );
    }

    // ── Jobs ────────────────────────────────────────────────────────────
    let store = Arc::new(InMemoryJobStore::new());
    let (queue, jobs) = InMemoryJobQueue::channel();
    let orchestrator = Arc::new(JobOrchestrator::new(
        Arc::clone(&registry),
        store.clone(),
        Arc::new(queue),
        Arc::new(ChannelBroadcaster::new()),
        OrchestratorConfig::from(&config),
    ));

    let sweeper = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(APPROVAL_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let expired = store.expire_approvals(chrono::Utc::now()).await;
                if expired > 0 {
                    tracing::info!(count = expired, "Expired approval waits");
                }
            }
        })
    };

    eprintln!("   Press Ctrl-C to stop.\n");
    orchestrator
        .run(jobs, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await;

    sweeper.abort();
    registry.stop_all().await;
    tracing::info!("Worker stopped");
    Ok(())
}

/// Register a backend, logging instead of aborting when it fails to start.
async fn register(
    registry: &BackendRegistry,
    backend: Arc<dyn ExecutionBackend>,
    config: BackendConfig,
    max_concurrent: usize,
) {
    let id = backend.id().to_string();
    if let Err(e) = registry
        .register(backend, &config, max_concurrent, CircuitBreakerConfig::default())
        .await
    {
        tracing::error!(backend = %id, "Backend not registered: {}", e);
    }
}

/// Stderr logging, plus a daily-rolling file when a log directory is configured.
fn init_tracing(
    config: &WorkerConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, std::io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "agent-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}
