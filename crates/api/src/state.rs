use std::sync::Arc;

use drumsheet_pipeline::orchestrator::Orchestrator;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via
/// `State<AppState>`. Cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<ServerConfig>,
}
