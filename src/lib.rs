pub mod api;
pub mod chromium;
pub mod config;
pub mod devtools;
pub mod error;
pub mod idle;
pub mod recording;

use std::sync::Arc;

use config::ServerConfig;
use devtools::UpstreamManager;
use idle::IdleController;
use recording::{RecorderFactory, Registry};

/// Shared application state passed to every handler and background task.
pub struct AppContext {
    pub config: ServerConfig,
    pub registry: Arc<Registry>,
    pub factory: RecorderFactory,
    pub upstream: Arc<UpstreamManager>,
    pub idle: Arc<IdleController>,
    pub started_at: std::time::Instant,
}
