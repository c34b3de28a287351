use agentbox_billing::{BillingClient, HttpBillingClient, InMemoryLedger};
use agentbox_manager::{
    ContainerRuntime, DockerRuntime, InstanceRegistry, LeaseManager, ManagerConfig,
    MemoryRegistry, MemoryRuntime, ObjectSnapshotStore,
};
use agentbox_server::{create_app, AppState, RuntimeKind, ServerConfig};
use color_eyre::eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const BILLING_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).wrap_err("failed to load .env");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,agentbox=debug")),
        )
        .init();

    let server = ServerConfig::from_env()?;
    let config = match &server.config_path {
        Some(path) => ManagerConfig::load(path)
            .await
            .wrap_err_with(|| format!("failed to load {}", path.display()))?,
        None => {
            warn!("AGENTBOX_CONFIG not set, using defaults with an empty catalog");
            ManagerConfig::default()
        }
    };

    let registry: Arc<dyn InstanceRegistry> = match &server.state_file {
        Some(path) => Arc::new(MemoryRegistry::persistent(path).await?),
        None => Arc::new(MemoryRegistry::new()),
    };

    let runtime: Arc<dyn ContainerRuntime> = match server.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::connect_local()?),
        RuntimeKind::Memory => {
            warn!("Using the in-process runtime; sandboxes are simulated");
            Arc::new(MemoryRuntime::new())
        }
    };

    let snapshots = Arc::new(ObjectSnapshotStore::from_url(&server.snapshot_url)?);

    let billing: Arc<dyn BillingClient> = match &server.billing_url {
        Some(url) => Arc::new(HttpBillingClient::new(url.clone(), BILLING_TIMEOUT)?),
        None => {
            warn!("AGENTBOX_BILLING_URL not set, using an empty in-process ledger");
            Arc::new(InMemoryLedger::new())
        }
    };

    let manager = Arc::new(LeaseManager::new(config, registry, runtime, snapshots, billing));
    let background = manager.spawn_background();

    let app = create_app(AppState::new(manager));
    let addr = server.addr();
    info!("agentbox listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    background.shutdown();
    Ok(())
}
