// HTTP API surface.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{chromium, idle, recording, AppContext};

/// Extension zips can be large; the axum default body cap is far too small.
const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/recording/start", post(recording::handlers::start_recording))
        .route("/recording/stop", post(recording::handlers::stop_recording))
        .route(
            "/recording/download",
            get(recording::handlers::download_recording),
        )
        .route("/recording/list", get(recording::handlers::list_recordings))
        .route(
            "/chromium/extensions",
            post(chromium::handlers::upload_extensions),
        )
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(ctx.idle.clone(), idle::middleware))
        .with_state(ctx)
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
    }))
}
