mod config;
mod dispatch;
mod fetch;
mod patterns;
mod preload;
mod retry;
mod runtime;
mod store;
mod web;

use tracing::{error, info};

use crate::config::Config;
use crate::runtime::WorkerRuntime;
use crate::web::gateway::GatewayServer;
use crate::web::server::ControlServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maneki_cache=info".into()),
        )
        .init();

    info!("🐱 maneki-cache v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load config (defaults apply when the file is absent)
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "maneki-cache.toml".to_string());

    let config = Config::load_or_default(&config_path)?;
    info!("Config loaded from {}", config_path);

    let runtime = WorkerRuntime::new(config)?;
    info!(
        "📦 Cache registry active at version v{}",
        runtime.registry.version()
    );

    // Warm the offline page and critical resources, best effort
    runtime.startup_warm().await;

    // Start the idle preload loop
    let idle_runtime = runtime.clone();
    tokio::spawn(async move {
        idle_runtime.run_idle_loop().await;
    });

    // Start the background sync loop (dormant until registered)
    let sync_runtime = runtime.clone();
    tokio::spawn(async move {
        sync_runtime.run_sync_loop().await;
    });

    // Start the control channel + dashboard
    let control_runtime = runtime.clone();
    tokio::spawn(async move {
        let control = ControlServer::new(control_runtime);
        if let Err(e) = control.run().await {
            error!("Control server error: {}", e);
        }
    });

    // Main gateway loop
    let gateway = GatewayServer::new(runtime);
    gateway.run().await
}
