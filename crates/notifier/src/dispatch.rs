//! Per-message delivery protocol.
//!
//! Every consumed message is resolved to exactly one [`Disposition`]. The
//! steps short-circuit in this order:
//!
//! 1. no sender for the channel → reject, no requeue
//! 2. undecodable payload → reject, no requeue
//! 3. status lookup fails → reject with requeue (unknown id: no requeue)
//! 4. status already terminal → ack without sending
//! 5. send fails → retry escalation
//! 6. send succeeds → persist `sent`, ack

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use herald_common::config::DeliveryConfig;
use herald_common::error::{AppError, ErrorKind};
use herald_common::types::{Channel, NotificationMessage, NotificationStatus, UpdateNotification};
use herald_engine::service::StatusCoordinator;

use crate::delivery::{Disposition, InboundMessage};
use crate::retry::{RetryPublisher, WriteRetry, backoff_delay};
use crate::sender::SenderRegistry;

/// Retry budget and status-write policy used by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub status_write: WriteRetry,
}

impl From<&DeliveryConfig> for DispatchPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            status_write: WriteRetry::default(),
        }
    }
}

pub struct Dispatcher {
    senders: SenderRegistry,
    coordinator: Arc<dyn StatusCoordinator>,
    retry_publisher: Arc<dyn RetryPublisher>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        senders: SenderRegistry,
        coordinator: Arc<dyn StatusCoordinator>,
        retry_publisher: Arc<dyn RetryPublisher>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            senders,
            coordinator,
            retry_publisher,
            policy,
        }
    }

    /// Decide how `msg`, consumed from a queue of `channel`, is settled.
    pub async fn handle(&self, channel: Channel, msg: &dyn InboundMessage) -> Disposition {
        let Some(sender) = self.senders.get(channel) else {
            tracing::error!(channel = %channel, "No sender registered for channel, dropping message");
            return Disposition::Reject { requeue: false };
        };

        let payload: NotificationMessage = match serde_json::from_slice(msg.body()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Malformed notification payload, dropping message");
                return Disposition::Reject { requeue: false };
            }
        };
        let id = payload.id;

        let status = match self.coordinator.get_notification_status(id).await {
            Ok(status) => status,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::error!(notification_id = id, "Notification no longer exists, dropping message");
                return Disposition::Reject { requeue: false };
            }
            Err(e) => {
                tracing::warn!(notification_id = id, error = %e, "Status lookup failed, requeueing");
                return Disposition::Reject { requeue: true };
            }
        };

        if status.is_terminal() {
            if status == NotificationStatus::Cancelled {
                tracing::info!(notification_id = id, "Notification cancelled, skipping delivery");
            } else {
                tracing::info!(notification_id = id, status = %status, "Notification already settled, skipping redelivery");
            }
            return Disposition::Ack;
        }

        if let Err(e) = sender.send(&payload.recipient, &payload.message).await {
            tracing::warn!(notification_id = id, channel = %channel, error = %e, "Delivery failed");
            return self.escalate(channel, msg, id).await;
        }

        let update = UpdateNotification::sent(id, Utc::now());
        if let Err(e) = self.persist(&update).await {
            tracing::error!(
                notification_id = id,
                error = %e,
                "Notification delivered but sent status was not recorded"
            );
        } else {
            tracing::info!(notification_id = id, channel = %channel, "Notification delivered");
        }

        Disposition::Ack
    }

    async fn escalate(&self, channel: Channel, msg: &dyn InboundMessage, id: i64) -> Disposition {
        let retry_count = msg.retry_count();

        if retry_count >= self.policy.max_retries {
            if let Err(e) = self.persist(&UpdateNotification::failed(id)).await {
                tracing::error!(notification_id = id, error = %e, "Failed status was not recorded");
            }
            tracing::error!(
                notification_id = id,
                retry_count,
                "Notification failed after exhausting retries"
            );
            return Disposition::Ack;
        }

        let delay = backoff_delay(self.policy.base_delay, retry_count);
        match self
            .retry_publisher
            .republish(channel, msg.body(), retry_count + 1, delay)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    notification_id = id,
                    retry_count = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Notification scheduled for retry"
                );
                Disposition::Ack
            }
            Err(e) => {
                tracing::error!(notification_id = id, error = %e, "Retry republish failed, requeueing");
                Disposition::Reject { requeue: true }
            }
        }
    }

    async fn persist(&self, update: &UpdateNotification) -> Result<(), AppError> {
        self.policy
            .status_write
            .run(|| self.coordinator.update_notification(update))
            .await
    }
}
