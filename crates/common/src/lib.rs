//! Shared configuration, error types, domain model and connection helpers.

pub mod amqp;
pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
