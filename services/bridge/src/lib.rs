pub mod http;
pub mod metrics;
pub mod outbound;
pub mod registry;
pub mod session;
pub mod state;
pub mod supervisor;

pub use state::AppState;

use axum::{routing::get, Router};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(session::ws_handler))
        .route("/devices", get(http::admin::list_devices))
        .route("/streams", get(http::admin::list_streams))
        .route("/health", get(http::admin::health))
        .route("/metrics", get(http::admin::metrics))
        .with_state(state)
}
