use async_trait::async_trait;

use herald_common::error::AppError;
use herald_common::types::Notification;

/// Schedules a stored notification for delayed delivery.
///
/// Implementations must only return `Ok` once the message is durably enqueued;
/// the caller reconciles the stored status on `Err`.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn schedule(&self, notification: &Notification) -> Result<(), AppError>;
}
