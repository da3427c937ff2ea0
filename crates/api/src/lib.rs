//! HTTP API for scheduling, inspecting and cancelling notifications.

pub mod routes;
pub mod state;
pub mod validation;
