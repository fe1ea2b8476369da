use rlm::{
    api::{router, AppState},
    auth::HeaderPrincipalResolver,
    config::ServerConfig,
    service::LeaseService,
    store,
    sweep::Housekeeper,
    time::{Clock, SystemClock},
    Result,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env()?;
    info!("RLM lease server starting...");
    info!("Bind address: {}", config.bind_addr);

    match &config.database {
        Some(path) => info!("Lease table: {}", path.display()),
        None => warn!("RLM_DATABASE not set; leases live in process memory only"),
    }
    let store = store::open(config.database.as_deref())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let housekeeper = config.sweep_interval.map(|interval| {
        info!("Housekeeping sweep every {:?}", interval);
        Housekeeper::spawn(store.clone(), clock.clone(), interval)
    });

    let state = AppState::new(
        LeaseService::new(store, clock),
        Arc::new(HeaderPrincipalResolver::default()),
        config.access_policy()?,
    );
    let app = router(state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("RLM lease server listening on {}", config.bind_addr);
    info!("API endpoints:");
    info!("  POST /locks/acquire       - Acquire or renew a lease");
    info!("  POST /locks/release       - Release own lease (JSON or form)");
    info!("  GET  /locks/status        - Lease status for the caller");
    info!("  GET  /locks/debug         - Lease history (admin)");
    info!("  POST /locks/force-release - Force release");
    info!("  GET  /health              - Liveness");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(housekeeper) = housekeeper {
        housekeeper.stop().await;
    }
    info!("RLM lease server stopped");
    Ok(())
}
