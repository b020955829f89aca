use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use pwrmgmt_common::ControlState;
use tokio::{net::TcpListener, sync::Mutex};
use tracing::info;

pub fn router(state: Arc<Mutex<ControlState>>) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .with_state(state)
}

/// Serves the read-only status endpoint until the task is dropped.
pub async fn serve(state: Arc<Mutex<ControlState>>, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server at {addr}"))?;

    info!("status listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn handle_get_status(State(state): State<Arc<Mutex<ControlState>>>) -> impl IntoResponse {
    let status = state.lock().await.status();
    Json(status)
}
