//! Broker-agnostic view of a consumed message.
//!
//! Workers only see [`InboundMessage`] and [`DeliverySource`]; the AMQP
//! implementations live in [`crate::amqp`].

use async_trait::async_trait;

use herald_common::error::AppError;

/// Header carrying the number of retry escalations already performed.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Header carrying the broker-side delay in milliseconds.
pub const DELAY_HEADER: &str = "x-delay";

/// How a consumed message is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// One consumed message awaiting settlement.
#[async_trait]
pub trait InboundMessage: Send + Sync {
    fn body(&self) -> &[u8];

    /// Escalations already performed; absent or malformed metadata reads as 0.
    fn retry_count(&self) -> u32;

    async fn settle(&self, disposition: Disposition) -> Result<(), AppError>;
}

/// A stream of messages from one queue, shared by the workers of one pool.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Next message, or `None` once the stream is closed.
    async fn next(&self) -> Option<Box<dyn InboundMessage>>;
}
