//! HTTP server for the relay gateway (axum + SSE).
//!
//! Routes: `/api/chat` (SSE stream or 429 with queue headers), `/api/user`,
//! `/api/conversations...`, `/api/metrics`, `/api/tool-system/status`,
//! `/api/admin/lru-status/trigger`.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`],
//! [`serve_with_services`].

mod app;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use relay::Services;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use app::{router, AppState};

const DEFAULT_ADDR: &str = "127.0.0.1:3000";
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Serves an already-built service graph on an existing listener. Used by
/// tests (bind to 127.0.0.1:0, swap in a mock LLM, then pass the listener).
pub async fn serve_with_services(
    listener: TcpListener,
    services: Arc<Services>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("relay listening on http://{}", addr);

    let cancel = CancellationToken::new();
    let maintenance = {
        let services = Arc::clone(&services);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            services.run_maintenance(MAINTENANCE_INTERVAL, cancel).await;
        })
    };

    let app = router(AppState { services });
    let result = axum::serve(listener, app).await;
    cancel.cancel();
    let _ = maintenance.await;
    result?;
    Ok(())
}

/// Loads config, builds services, and serves on `addr`
/// (default 127.0.0.1:3000).
pub async fn run_serve(
    addr: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Err(e) = config::load_and_apply("relay", None) {
        tracing::warn!("config load: {}", e);
    }
    let settings = config::Settings::from_env();
    let services = Arc::new(Services::build(&settings).await?);
    let addr = addr.unwrap_or(if settings.addr.is_empty() {
        DEFAULT_ADDR
    } else {
        settings.addr.as_str()
    });
    let listener = TcpListener::bind(addr).await?;
    serve_with_services(listener, services).await
}

/// Serves on an existing listener, building services from the environment.
pub async fn run_serve_on_listener(
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = config::Settings::from_env();
    let services = Arc::new(Services::build(&settings).await?);
    serve_with_services(listener, services).await
}
