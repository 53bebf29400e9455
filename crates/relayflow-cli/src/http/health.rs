//! Health endpoint served while the stage executor runs.
//!
//! GET / and GET /health both answer 200 with a small JSON body, so a
//! platform health check can target either.

use anyhow::Context;
use axum::Json;
use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Build the health router.
pub fn build_router() -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "relayflow-worker",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Bind the health listener on `0.0.0.0:{port}`.
///
/// Separate from `serve_on` so a worker can fail at startup when the port is
/// taken instead of running without a health endpoint.
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind health endpoint on {addr}"))?;
    tracing::info!(%addr, "health endpoint listening");
    Ok(listener)
}

/// Serve the health router on `listener` until `cancel` fires.
pub async fn serve_on(listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
    axum::serve(listener, build_router())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
