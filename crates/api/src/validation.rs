//! Request DTOs and their validation.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use herald_common::error::AppError;
use herald_common::types::{Channel, MAX_BROKER_DELAY, NewNotification, NotificationStatus};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

/// Allowed length of a Telegram `@username`, including the `@`.
const TELEGRAM_USERNAME_LEN: std::ops::RangeInclusive<usize> = 5..=32;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNotificationRequest {
    pub channel: Channel,
    pub recipient: String,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateNotificationResponse {
    pub notification_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationStatusResponse {
    pub notification_status: NotificationStatus,
}

fn is_valid_email(recipient: &str) -> bool {
    EMAIL_RE.is_match(recipient)
}

fn is_valid_telegram(recipient: &str) -> bool {
    if recipient.starts_with('@') {
        return TELEGRAM_USERNAME_LEN.contains(&recipient.len());
    }
    recipient.parse::<i64>().is_ok()
}

impl CreateNotificationRequest {
    /// Validate against `now` and build the notification to store.
    pub fn into_new(self, now: DateTime<Utc>) -> Result<NewNotification, AppError> {
        if self.recipient.trim().is_empty() {
            return Err(AppError::Validation("recipient cannot be empty".to_string()));
        }

        let valid_recipient = match self.channel {
            Channel::Email => is_valid_email(&self.recipient),
            Channel::Telegram => is_valid_telegram(&self.recipient),
        };
        if !valid_recipient {
            return Err(AppError::Validation(format!(
                "invalid {} recipient '{}'",
                self.channel, self.recipient
            )));
        }

        if self.message.trim().is_empty() {
            return Err(AppError::Validation("message cannot be empty".to_string()));
        }

        if self.scheduled_at < now {
            return Err(AppError::Validation(
                "scheduled_at cannot be in the past".to_string(),
            ));
        }

        let too_far = (self.scheduled_at - now)
            .to_std()
            .is_ok_and(|delay| delay > MAX_BROKER_DELAY);
        if too_far {
            return Err(AppError::Validation(format!(
                "scheduled_at cannot be more than {} days ahead",
                MAX_BROKER_DELAY.as_secs() / 86_400
            )));
        }

        Ok(NewNotification {
            channel: self.channel,
            recipient: self.recipient,
            message: self.message,
            created_at: now,
            scheduled_at: self.scheduled_at,
        })
    }
}

/// Parse a notification id path segment; ids are positive.
pub fn parse_id(raw: &str) -> Result<i64, AppError> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(AppError::Validation(format!(
            "invalid notification id '{}'",
            raw
        ))),
    }
}
