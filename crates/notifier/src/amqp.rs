//! RabbitMQ plumbing: topology, publishing and consumption.
//!
//! Both exchanges are `x-delayed-message` exchanges (delayed-message plugin)
//! routing like `direct` exchanges. Every queue is bound with a routing key
//! equal to its name.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel as AmqpChannel, Consumer, ExchangeKind};
use tokio::sync::Mutex;

use herald_common::config::BrokerConfig;
use herald_common::error::AppError;
use herald_common::types::{Channel, MAX_BROKER_DELAY, Notification};
use herald_engine::publisher::NotificationPublisher;

use crate::delivery::{
    DELAY_HEADER, DeliverySource, Disposition, InboundMessage, RETRY_COUNT_HEADER,
};
use crate::retry::RetryPublisher;

const DELAYED_EXCHANGE_KIND: &str = "x-delayed-message";
const PERSISTENT: u8 = 2;

/// Open a channel with publisher confirms enabled.
pub async fn open_channel(connection: &lapin::Connection) -> Result<AmqpChannel, AppError> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

/// Declare both delayed exchanges and all four durable queues. Idempotent.
pub async fn declare_topology(channel: &AmqpChannel, broker: &BrokerConfig) -> Result<(), AppError> {
    for exchange in [&broker.exchange, &broker.retry_exchange] {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-delayed-type"),
            AMQPValue::LongString(LongString::from("direct")),
        );
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Custom(DELAYED_EXCHANGE_KIND.to_string()),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                arguments,
            )
            .await?;
    }

    for notification_channel in Channel::ALL {
        let bindings = [
            (&broker.exchange, broker.queue(notification_channel)),
            (&broker.retry_exchange, broker.retry_queue(notification_channel)),
        ];
        for (exchange, queue) in bindings {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue,
                    exchange,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            tracing::debug!(queue, exchange = %exchange, "Queue declared and bound");
        }
    }

    tracing::info!(
        exchange = %broker.exchange,
        retry_exchange = %broker.retry_exchange,
        "Broker topology declared"
    );
    Ok(())
}

/// Delay in milliseconds as carried by `x-delay`, clamped to what the
/// delayed exchange honours.
fn delay_millis(delay: Duration) -> i64 {
    i64::try_from(delay.min(MAX_BROKER_DELAY).as_millis()).unwrap_or(i64::MAX)
}

/// Read `x-retry-count` from message headers.
///
/// Only integer values are accepted; absent, negative or non-integer values
/// read as 0.
pub fn retry_count_from_headers(headers: Option<&FieldTable>) -> u32 {
    let Some(value) = headers.and_then(|h| {
        h.inner()
            .iter()
            .find(|(key, _)| key.as_str() == RETRY_COUNT_HEADER)
            .map(|(_, value)| value)
    }) else {
        return 0;
    };

    let count: Option<i64> = match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    };

    match count.and_then(|c| u32::try_from(c).ok()) {
        Some(count) => count,
        None => {
            tracing::warn!(value = ?value, "Ignoring malformed retry count header");
            0
        }
    }
}

/// Publishes to the delayed exchanges over a confirm-mode channel.
#[derive(Clone)]
pub struct AmqpPublisher {
    channel: AmqpChannel,
    broker: BrokerConfig,
}

impl AmqpPublisher {
    pub fn new(channel: AmqpChannel, broker: BrokerConfig) -> Self {
        Self { channel, broker }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: FieldTable,
    ) -> Result<(), AppError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers);

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(AppError::Publish(format!(
                "broker refused message for '{}'",
                routing_key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationPublisher for AmqpPublisher {
    async fn schedule(&self, notification: &Notification) -> Result<(), AppError> {
        let body = serde_json::to_vec(&notification.to_message())?;
        let delay = notification.initial_delay();

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(DELAY_HEADER),
            AMQPValue::LongLongInt(delay_millis(delay)),
        );

        let queue = self.broker.queue(notification.channel);
        self.publish(&self.broker.exchange, queue, &body, headers)
            .await?;

        tracing::debug!(
            notification_id = notification.id,
            queue,
            delay_ms = delay_millis(delay),
            "Notification published"
        );
        Ok(())
    }
}

#[async_trait]
impl RetryPublisher for AmqpPublisher {
    async fn republish(
        &self,
        channel: Channel,
        body: &[u8],
        retry_count: u32,
        delay: Duration,
    ) -> Result<(), AppError> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(RETRY_COUNT_HEADER),
            AMQPValue::LongLongInt(i64::from(retry_count)),
        );
        headers.insert(
            ShortString::from(DELAY_HEADER),
            AMQPValue::LongLongInt(delay_millis(delay)),
        );

        self.publish(
            &self.broker.retry_exchange,
            self.broker.retry_queue(channel),
            body,
            headers,
        )
        .await
    }
}

/// A delivery consumed from RabbitMQ.
pub struct AmqpMessage {
    delivery: Delivery,
}

#[async_trait]
impl InboundMessage for AmqpMessage {
    fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    fn retry_count(&self) -> u32 {
        retry_count_from_headers(self.delivery.properties.headers().as_ref())
    }

    async fn settle(&self, disposition: Disposition) -> Result<(), AppError> {
        match disposition {
            Disposition::Ack => {
                self.delivery
                    .acker
                    .ack(BasicAckOptions { multiple: false })
                    .await?
            }
            Disposition::Reject { requeue } => {
                self.delivery
                    .acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue,
                    })
                    .await?
            }
        }
        Ok(())
    }
}

/// One consumer shared by the workers of a pool.
pub struct AmqpSource {
    queue: String,
    consumer: Mutex<Consumer>,
}

impl AmqpSource {
    /// Start consuming `queue` with a prefetch of `prefetch` unacked messages.
    pub async fn consume(
        channel: &AmqpChannel,
        queue: &str,
        prefetch: u16,
    ) -> Result<Self, AppError> {
        channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await?;
        let consumer = channel
            .basic_consume(
                queue,
                &format!("herald.{}", queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue, prefetch, "Consumer started");
        Ok(Self {
            queue: queue.to_string(),
            consumer: Mutex::new(consumer),
        })
    }
}

#[async_trait]
impl DeliverySource for AmqpSource {
    async fn next(&self) -> Option<Box<dyn InboundMessage>> {
        let mut consumer = self.consumer.lock().await;
        match consumer.next().await? {
            Ok(delivery) => Some(Box::new(AmqpMessage { delivery })),
            Err(e) => {
                tracing::error!(queue = %self.queue, error = %e, "Consumer stream failed");
                None
            }
        }
    }
}
