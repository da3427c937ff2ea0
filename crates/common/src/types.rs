use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest delay the broker's delayed exchange honours (`x-delay` is read as
/// an unsigned 32-bit millisecond count, about 49.7 days).
pub const MAX_BROKER_DELAY: std::time::Duration = std::time::Duration::from_millis(u32::MAX as u64);

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Telegram,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Telegram];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Telegram => write!(f, "telegram"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "telegram" => Ok(Channel::Telegram),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Notification lifecycle status.
///
/// `Scheduled` is the only non-terminal state. Once a notification is `Sent`,
/// `Cancelled` or `Failed` no other status may replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Scheduled,
    Sent,
    Cancelled,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Scheduled => "scheduled",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Cancelled => "cancelled",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NotificationStatus::Scheduled)
    }

    /// Whether a notification currently in `self` may be moved to `next`.
    ///
    /// Re-writing the same terminal status is allowed so that redelivered
    /// outcomes stay idempotent.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        match self {
            NotificationStatus::Scheduled => true,
            terminal => *terminal == next,
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(NotificationStatus::Scheduled),
            "sent" => Ok(NotificationStatus::Sent),
            "cancelled" => Ok(NotificationStatus::Cancelled),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("unknown notification status '{}'", other)),
        }
    }
}

/// A notification request that has not been stored yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub channel: Channel,
    pub recipient: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

/// A stored notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub channel: Channel,
    pub recipient: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
}

impl Notification {
    /// Materialize a stored notification from the request and the id the store assigned.
    pub fn from_new(id: i64, new: NewNotification) -> Self {
        Self {
            id,
            channel: new.channel,
            recipient: new.recipient,
            message: new.message,
            created_at: new.created_at,
            scheduled_at: new.scheduled_at,
            sent_at: None,
            status: NotificationStatus::Scheduled,
        }
    }

    /// Delay between creation and the requested delivery time, never negative.
    pub fn initial_delay(&self) -> std::time::Duration {
        (self.scheduled_at - self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn to_message(&self) -> NotificationMessage {
        NotificationMessage {
            id: self.id,
            recipient: self.recipient.clone(),
            message: self.message.clone(),
        }
    }
}

/// Queue payload: just enough to dispatch without touching the store.
///
/// Carries no status; consumers always re-resolve the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: i64,
    pub recipient: String,
    pub message: String,
}

/// A status change for an existing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotification {
    pub id: i64,
    pub status: NotificationStatus,
    pub sent_at: Option<DateTime<Utc>>,
}

impl UpdateNotification {
    pub fn sent(id: i64, at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: NotificationStatus::Sent,
            sent_at: Some(at),
        }
    }

    pub fn failed(id: i64) -> Self {
        Self {
            id,
            status: NotificationStatus::Failed,
            sent_at: None,
        }
    }

    pub fn cancelled(id: i64) -> Self {
        Self {
            id,
            status: NotificationStatus::Cancelled,
            sent_at: None,
        }
    }
}
