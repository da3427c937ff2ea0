//! Notification status coordination: the store and cache seams, the
//! publisher seam, and the service that reconciles them.

pub mod cache;
pub mod memory;
pub mod publisher;
pub mod service;
pub mod store;
