//! Notification service: creation and status coordination.
//!
//! Status reads go through the Redis cache and fall back to Postgres. Every
//! status write, from the HTTP layer or a delivery worker, re-checks the
//! stored status first so a cancelled notification is never re-marked.

use std::sync::Arc;

use async_trait::async_trait;

use herald_common::error::AppError;
use herald_common::types::{
    NewNotification, Notification, NotificationStatus, UpdateNotification,
};

use crate::cache::{StatusCache, status_key};
use crate::publisher::NotificationPublisher;
use crate::store::StatusStore;

/// The subset of the service the delivery workers depend on.
#[async_trait]
pub trait StatusCoordinator: Send + Sync {
    async fn get_notification_status(&self, id: i64) -> Result<NotificationStatus, AppError>;

    async fn update_notification(&self, update: &UpdateNotification) -> Result<(), AppError>;
}

/// Service layer for notification creation and status coordination.
#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn StatusStore>,
    cache: Arc<dyn StatusCache>,
    publisher: Arc<dyn NotificationPublisher>,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn StatusStore>,
        cache: Arc<dyn StatusCache>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
        }
    }

    /// Store a new notification and schedule it for delivery.
    ///
    /// If scheduling fails the stored row is rolled to `failed` so that no
    /// `scheduled` row is left without a message in flight. The caller gets an
    /// error either way; it names the rollback failure too if that happened.
    pub async fn create_notification(&self, new: NewNotification) -> Result<i64, AppError> {
        let id = self.store.insert(&new).await?;
        let notification = Notification::from_new(id, new);

        // Primed before publishing: a zero-delay message may be delivered and
        // marked sent before `schedule` returns.
        self.cache_status(id, NotificationStatus::Scheduled).await;

        if let Err(publish_err) = self.publisher.schedule(&notification).await {
            tracing::error!(
                notification_id = id,
                error = %publish_err,
                "Failed to schedule notification, marking it failed"
            );

            return Err(
                match self.update_notification(&UpdateNotification::failed(id)).await {
                    Ok(()) => AppError::Publish(format!(
                        "notification {} could not be scheduled and was marked failed: {}",
                        id, publish_err
                    )),
                    Err(rollback_err) => {
                        tracing::error!(
                            notification_id = id,
                            error = %rollback_err,
                            "Rollback to failed status did not persist"
                        );
                        AppError::Publish(format!(
                            "notification {} could not be scheduled ({}) and marking it failed also failed ({})",
                            id, publish_err, rollback_err
                        ))
                    }
                },
            );
        }

        tracing::info!(
            notification_id = id,
            channel = %notification.channel,
            scheduled_at = %notification.scheduled_at,
            "Notification scheduled"
        );

        Ok(id)
    }

    /// Current status of a notification.
    ///
    /// The cache is consulted first; a miss, a cache error or a value that is
    /// not a known status all fall back to the store. The store's answer is
    /// written back only if the key is still empty, so a status written by a
    /// concurrent update is never replaced by this older read.
    pub async fn get_notification_status(&self, id: i64) -> Result<NotificationStatus, AppError> {
        let key = status_key(id);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match raw.parse::<NotificationStatus>() {
                Ok(status) => return Ok(status),
                Err(e) => {
                    tracing::warn!(notification_id = id, error = %e, "Ignoring unrecognized cached status");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(notification_id = id, error = %e, "Status cache read failed, using store");
            }
        }

        let status = self.store.get_status(id).await?;
        match self.cache.set_if_absent(&key, status.as_str()).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(notification_id = id, status = %status, "Cache already repopulated, keeping it");
            }
            Err(e) => {
                tracing::warn!(notification_id = id, status = %status, error = %e, "Status cache write failed");
            }
        }
        Ok(status)
    }

    /// Apply a status change.
    ///
    /// The current status is re-read from the store (not the cache) on every
    /// call. Terminal statuses are final: any change away from `sent`,
    /// `cancelled` or `failed` fails with `AlreadyTerminal`, and re-applying
    /// the status a notification already has is a no-op. The store repeats the
    /// check in the write itself, so a terminal status recorded between the
    /// re-read and the write still wins.
    pub async fn update_notification(&self, update: &UpdateNotification) -> Result<(), AppError> {
        let current = self.store.get_status(update.id).await?;

        if current == update.status && current.is_terminal() {
            tracing::debug!(
                notification_id = update.id,
                status = %current,
                "Status already applied"
            );
            self.cache_status(update.id, current).await;
            return Ok(());
        }

        if !current.can_transition_to(update.status) {
            tracing::info!(
                notification_id = update.id,
                current = %current,
                requested = %update.status,
                "Refusing status change of terminal notification"
            );
            return Err(AppError::AlreadyTerminal {
                id: update.id,
                status: current,
            });
        }

        self.store
            .update_status(update.id, update.status, update.sent_at)
            .await?;
        self.cache_status(update.id, update.status).await;

        tracing::info!(
            notification_id = update.id,
            status = %update.status,
            "Notification status updated"
        );

        Ok(())
    }

    /// Best-effort cache write; failures are logged, never returned.
    async fn cache_status(&self, id: i64, status: NotificationStatus) {
        if let Err(e) = self.cache.set(&status_key(id), status.as_str()).await {
            tracing::warn!(notification_id = id, status = %status, error = %e, "Status cache write failed");
        }
    }
}

#[async_trait]
impl StatusCoordinator for NotificationService {
    async fn get_notification_status(&self, id: i64) -> Result<NotificationStatus, AppError> {
        NotificationService::get_notification_status(self, id).await
    }

    async fn update_notification(&self, update: &UpdateNotification) -> Result<(), AppError> {
        NotificationService::update_notification(self, update).await
    }
}
