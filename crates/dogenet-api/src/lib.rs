//! # dogenet-api
//!
//! REST admin interface for the DogeNet node:
//! - `GET /stats` — store and peer counts
//! - `GET /nodes` — crawled Core nodes and known overlay nodes
//! - `POST /peers` — suggest an overlay peer to connect to

mod error;
mod handlers;
mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use dogenet_proto::Address;

/// Default admin API port.
pub const DEFAULT_API_PORT: u16 = 8085;

/// Build the admin router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stats", get(handlers::get_stats))
        .route("/nodes", get(handlers::get_nodes))
        .route("/peers", post(handlers::add_peer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the admin API on `bind` until the token fires.
pub async fn serve(bind: Address, state: AppState, cancel: CancellationToken) {
    let listener = match tokio::net::TcpListener::bind(bind.to_socket_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %bind, error = %e, "cannot bind admin api");
            return;
        }
    };
    info!(addr = %bind, "admin api listening");
    let app = build_router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        warn!(error = %e, "admin api terminated");
    }
}
