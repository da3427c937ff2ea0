use std::time::Duration;

use lapin::{Connection, ConnectionProperties};

/// Connect to RabbitMQ, making up to `retries` attempts with a fixed pause.
/// The last failure is returned as a bootstrap error.
pub async fn connect_with_retry(
    url: &str,
    retries: u32,
    pause: Duration,
) -> anyhow::Result<Connection> {
    let attempts = retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match Connection::connect(url, ConnectionProperties::default()).await {
            Ok(connection) => {
                tracing::info!(attempt, "Connected to RabbitMQ");
                return Ok(connection);
            }
            Err(e) if attempt < attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "RabbitMQ connection failed, retrying"
                );
                tokio::time::sleep(pause).await;
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to connect to RabbitMQ after {} attempts: {}",
                    attempts,
                    e
                ));
            }
        }
    }
}
