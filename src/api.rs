use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use reqwest::Url;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{config::RelayConfig, relay::Relay};

#[derive(Clone)]
pub struct AppState {
    relay: Arc<Relay>,
}

impl AppState {
    pub fn new(relay: Relay) -> Self {
        Self { relay: Arc::new(relay) }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/workflow/status/{run_id}/stream", get(stream_run_status))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `{base}/workflow/status/{run_id}/stream`, with `run_id` escaped as a single
/// path segment. Shared by the relay (upstream side) and the tracker.
pub fn status_stream_url(base: &Url, run_id: &str) -> Url {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().extend(["workflow", "status", run_id, "stream"]);
    }
    url
}

pub async fn serve(config: RelayConfig) -> Result<()> {
    let bind = config.bind.clone();
    let relay = Relay::new(config)?;
    let app = router(AppState::new(relay));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("runstream relay listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// The token is cancelled when this handler's future or the streamed body is
/// dropped, which is how hyper reports a client that went away.
async fn stream_run_status(State(st): State<AppState>, Path(run_id): Path<String>) -> Response {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    match st.relay.open(&run_id, cancel).await {
        Ok(stream) => stream.cancel_on_drop(guard).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
}

async fn health() -> Json<HealthResp> {
    Json(HealthResp { status: "healthy" })
}
