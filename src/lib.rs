//! Location-anchored ephemeral chat.
//!
//! Messages are tagged with the geohash cell they were posted from. Each
//! client listens to the 3x3 block of cells around it, rebuilds who is
//! nearby from movement markers in that window, and goes dormant after a
//! period without activity. Entries older than the TTL are swept from the
//! shared log whenever someone signs in.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod handlers;
pub mod models;
pub mod prefs;
pub mod repositories;
pub mod services;

pub use config::Config;
pub use error::AppError;
pub use handlers::http::AppState;
pub use services::{ProximityService, SessionService};

use axum::routing::get;
use handlers::http;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the API router (ws, cells, health). Used by main and by integration tests.
pub fn create_app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(handlers::ws_handler))
        .route("/api/cells", get(http::cells))
        .route("/health", get(http::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
