pub mod appresult;
pub mod config;
pub mod room;

use std::sync::Arc;

use axum::{Router, extract::FromRef, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
pub use config::Config;
pub use room::Room;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub room: Room,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            room: Room::new(config.relay_limits(), config.max_connections),
            config: Arc::new(config),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(room::router())
        .with_state(state)
        // the drawing client is served from its own origin
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
