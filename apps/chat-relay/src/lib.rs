pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod handlers;
pub mod history;
pub mod janitor;
pub mod registry;
pub mod relay;
pub mod session;
pub mod storage;
pub mod store;
pub mod store_redis;
pub mod telemetry;
pub mod websocket;

pub use config::{Config, Keyspace};
pub use error::{RelayError, StoreError};
pub use event::{ChatEvent, ClientEvent, EventBody, EventIds};
pub use handlers::AppState;
pub use relay::Relay;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Routes served by a relay process.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
