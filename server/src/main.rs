use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use blockforge_server::blocks::lifecycle::LifecycleController;
use blockforge_server::blocks::retention;
use blockforge_server::config::{generate_config_template, Config};
use blockforge_server::routes;
use blockforge_server::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let env_filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("blockforge_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter())
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter())
            .init();
    }

    tracing::info!(
        "Blockforge server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let lifecycle_config = config.lifecycle();

    // Stage roots under the data directory
    let lifecycle = Arc::new(LifecycleController::new(&config.data_dir));
    lifecycle.init()?;
    tracing::info!("Block store initialized at {}", config.data_dir);

    // Finish promotions interrupted by a previous crash
    if lifecycle_config.reconcile_on_startup {
        let report = lifecycle.reconcile()?;
        tracing::info!(
            "Startup reconciliation: swept {} scratch dirs, resolved {} duplicated blocks",
            report.swept_scratch,
            report.duplicates_resolved
        );
    }

    if let Some(mesh) = config.mesh_generator() {
        tracing::info!(
            "Mesh generator enabled: {} {}",
            mesh.command,
            mesh.script_path.display()
        );
    }

    // Retention reaper runs for the lifetime of the process
    retention::spawn_reaper(
        lifecycle.clone(),
        lifecycle_config.reap_interval(),
        lifecycle_config.artifact_lifetime_secs,
    );
    tracing::info!(
        "Retention reaper: lifetime {}s, interval {}s",
        lifecycle_config.artifact_lifetime_secs,
        lifecycle_config.reap_interval().as_secs()
    );

    let app_state = AppState::from_config(&config, lifecycle);
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
