//! planed - database cluster control plane daemon
//!
//! Hosts the orchestration engine for one site and runs the backup Job
//! reconciliation controller against that site's orchestrator.

use anyhow::Result;
use plane_lib::{
    catalog::{Catalog, MemoryCatalog},
    engine::{Engine, StoreBackupCallback},
    health::{components, HealthRegistry},
    jobs::JobController,
    observability::{PlaneMetrics, StructuredLogger},
    orchestrator::{MemoryOrchestrator, Orchestrator, Orchestrators},
    store::MemoryStore,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod k8s;
mod seed;
mod watch;

use config::Backend;

const PLANED_VERSION: &str = env!("CARGO_PKG_VERSION");
const JOB_EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting planed");

    let config = config::DaemonConfig::load()?;
    info!(
        site = %config.site_id,
        backend = config.backend.as_str(),
        namespace = %config.engine.namespace,
        "Daemon configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::ENGINE).await;
    health_registry.register(components::STORE).await;
    health_registry.register(components::ORCHESTRATOR).await;

    let metrics = PlaneMetrics::new();
    let logger = StructuredLogger::new(&config.site_id);
    logger.log_startup(PLANED_VERSION, config.backend.as_str());

    let catalog = Arc::new(MemoryCatalog::new());
    if let Some(path) = &config.catalog_seed {
        seed::load_into(&catalog, path)?;
    }
    let store = Arc::new(MemoryStore::new());
    health_registry.set_healthy(components::STORE).await;

    let shutdown = CancellationToken::new();

    // Only the kube backend has a job event source to reconcile from
    let (orchestrator, job_events) = match config.backend {
        Backend::Kube => {
            let client = kube::Client::try_default().await?;
            let (events_tx, events_rx) = mpsc::channel(JOB_EVENT_BUFFER);
            tokio::spawn(watch::run(
                client.clone(),
                config.engine.namespace.clone(),
                events_tx,
                shutdown.clone(),
            ));
            let orchestrator: Arc<dyn Orchestrator> = Arc::new(k8s::KubeOrchestrator::new(
                client,
                config.engine.namespace.clone(),
            ));
            (orchestrator, Some(events_rx))
        }
        Backend::Memory => {
            warn!("Using the in-memory orchestrator, no workloads will run");
            let orchestrator: Arc<dyn Orchestrator> =
                Arc::new(MemoryOrchestrator::new(config.engine.namespace.clone()));
            (orchestrator, None)
        }
    };
    health_registry.set_healthy(components::ORCHESTRATOR).await;

    let orchestrators = Orchestrators::new();
    orchestrators.register(config.site_id.clone(), orchestrator.clone());

    let engine = Engine::new(
        config.engine.clone(),
        Catalog::from_shared(catalog),
        store.clone(),
        orchestrators,
        logger.clone(),
    );
    health_registry.set_healthy(components::ENGINE).await;

    let controller_handle = match job_events {
        Some(events_rx) => {
            let controller = JobController::new(
                &config.jobs,
                orchestrator,
                Arc::new(StoreBackupCallback::new(store)),
                metrics.clone(),
                logger.clone(),
            )
            .with_health(health_registry.clone());
            let shutdown = shutdown.clone();
            health_registry.register(components::JOB_CONTROLLER).await;
            Some(tokio::spawn(async move {
                controller.run(events_rx, shutdown).await
            }))
        }
        None => {
            info!("No job event source, job controller not started");
            None
        }
    };

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        engine,
    ));

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    health_registry.set_ready(false).await;
    shutdown.cancel();
    if let Some(handle) = controller_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Job controller ended abnormally");
        }
    }
    api_handle.abort();

    Ok(())
}
