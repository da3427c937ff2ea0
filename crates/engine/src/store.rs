//! Durable notification status store.
//!
//! The store is the single source of truth for `status` and `sent_at`. Every
//! write runs in its own transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{NewNotification, NotificationStatus};

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Current status, or `AppError::NotFound`.
    async fn get_status(&self, id: i64) -> Result<NotificationStatus, AppError>;

    /// Insert a new `scheduled` notification and return the assigned id.
    async fn insert(&self, notification: &NewNotification) -> Result<i64, AppError>;

    /// Set the status (and optionally `sent_at`) of an existing notification.
    ///
    /// Fails with `AlreadyTerminal` if the row already holds a different
    /// terminal status.
    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError>;
}

/// PostgreSQL-backed status store.
#[derive(Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn parse_status(id: i64, raw: &str) -> Result<NotificationStatus, AppError> {
        raw.parse().map_err(|e| {
            AppError::Internal(format!("Notification {} has a corrupt status: {}", id, e))
        })
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn get_status(&self, id: i64) -> Result<NotificationStatus, AppError> {
        let raw: String = sqlx::query_scalar("SELECT status FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

        Self::parse_status(id, &raw)
    }

    async fn insert(&self, notification: &NewNotification) -> Result<i64, AppError> {
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO notifications (channel, recipient, message, created_at, scheduled_at, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(notification.channel.to_string())
        .bind(&notification.recipient)
        .bind(&notification.message)
        .bind(notification.created_at)
        .bind(notification.scheduled_at)
        .bind(NotificationStatus::Scheduled.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(notification_id = id, channel = %notification.channel, "Notification stored");
        Ok(id)
    }

    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        // Only a scheduled row moves; a terminal row accepts its own status.
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, sent_at = COALESCE($2, sent_at)
            WHERE id = $3
              AND (status = 'scheduled' OR status = $1)
            "#,
        )
        .bind(status.as_str())
        .bind(sent_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM notifications WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;

            return Err(match current {
                None => AppError::NotFound(format!("Notification {} not found", id)),
                Some(raw) => AppError::AlreadyTerminal {
                    id,
                    status: Self::parse_status(id, &raw)?,
                },
            });
        }

        tx.commit().await?;
        Ok(())
    }
}
