pub mod health;
pub mod notifications;

use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

use crate::state::AppState;

/// Build the complete API router with all routes. Request bodies larger than
/// `body_limit` bytes are refused with 413.
pub fn create_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .merge(health::router())
        .merge(notifications::router())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}
