use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drumsheet_api::config::ServerConfig;
use drumsheet_api::router::build_app_router;
use drumsheet_api::state::AppState;
use drumsheet_pipeline::orchestrator::{Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "drumsheet_api=debug,drumsheet_pipeline=debug,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let orchestrator_config = OrchestratorConfig::from_env();
    std::fs::create_dir_all(&orchestrator_config.jobs_root)
        .expect("failed to create the jobs directory");
    tracing::info!(
        host = %config.host,
        port = config.port,
        jobs_root = %orchestrator_config.jobs_root.display(),
        parallelism = orchestrator_config.parallelism,
        "loaded server configuration"
    );

    // --- Capability probe + orchestrator ---
    let orchestrator = Orchestrator::bootstrap(orchestrator_config).await;

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        config: Arc::new(config.clone()),
    };
    let app = build_app_router(state, &config);

    // --- Serve ---
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .expect("failed to bind the listen address");
    tracing::info!(addr = %config.bind_addr(), "drumsheet capture API listening");
    axum::serve(listener, app)
        .await
        .expect("server terminated unexpectedly");
}
