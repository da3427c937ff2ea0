//! Shared application state for the Axum API server.

use herald_engine::service::NotificationService;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub service: NotificationService,
}

impl AppState {
    pub fn new(service: NotificationService) -> Self {
        Self { service }
    }
}
