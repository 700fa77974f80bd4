//! HTTP adapter onto the source registry and the job manager.
//!
//! Thin by design: handlers translate between JSON and the core's calls and
//! own no state of their own.

mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use axum::routing::post;
use pubdatahub_core::JobManager;
use pubdatahub_core::SourceRegistry;
use tokio::net::TcpListener;
use tracing::info;

/// Everything the handlers need, shared behind one `Arc`.
pub struct AppContext {
    pub registry: SourceRegistry,
    pub manager: JobManager,
    /// Root for per-source databases, used when a download request targets a
    /// source that has not been initialized yet.
    pub storage_root: PathBuf,
}

pub fn router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/sources", get(handlers::list_sources))
        .route("/api/sources/{name}/data", get(handlers::source_data))
        .route("/api/jobs", get(handlers::list_jobs))
        .route("/api/jobs/download", post(handlers::create_download_job))
        .route("/api/jobs/{id}/pause", post(handlers::pause_job))
        .route("/api/jobs/{id}/resume", post(handlers::resume_job))
        .route("/api/jobs/{id}/cancel", post(handlers::cancel_job))
        .with_state(context)
}

/// Bind and serve until the process ends. Returns the bound address via the
/// callback so callers binding port 0 can learn the real port.
pub async fn serve(
    addr: SocketAddr,
    context: Arc<AppContext>,
    on_bound: impl FnOnce(SocketAddr),
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!("http api listening on http://{bound}");
    on_bound(bound);
    axum::serve(listener, router(context)).await
}
