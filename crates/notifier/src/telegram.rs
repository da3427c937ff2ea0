//! Telegram Bot API sender and `/start` responder.
//!
//! Messages go out via `POST /bot<token>/sendMessage`. The updates listener
//! long-polls `getUpdates` and answers `/start` with the caller's chat id, which
//! is the recipient value clients pass to `POST /notify`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use herald_common::config::TelegramConfig;
use herald_common::error::AppError;

use crate::sender::Sender;

const API_BASE: &str = "https://api.telegram.org";

/// Pause after a failed `getUpdates` call before polling again.
const POLL_ERROR_PAUSE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct TelegramSender {
    client: Client,
    base_url: String,
    poll_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// `chat_id` parameter for a recipient: numeric ids as numbers, `@username` as-is.
fn chat_id(recipient: &str) -> Result<Value, AppError> {
    if let Ok(id) = recipient.parse::<i64>() {
        return Ok(json!(id));
    }
    if recipient.starts_with('@') && recipient.len() > 1 {
        return Ok(json!(recipient));
    }
    Err(AppError::Delivery(format!(
        "invalid telegram chat id '{}'",
        recipient
    )))
}

fn start_reply(chat_id: i64) -> String {
    format!(
        "Hello! Your chat id is {}. Use it as the recipient when scheduling notifications.",
        chat_id
    )
}

impl TelegramSender {
    pub fn new(config: &TelegramConfig) -> Self {
        Self::with_api_base(config, API_BASE)
    }

    fn with_api_base(config: &TelegramConfig, api_base: &str) -> Self {
        // `getUpdates` overrides this per request with the long-poll timeout
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: format!("{}/bot{}", api_base, config.bot_token),
            poll_timeout_secs: config.poll_timeout_secs,
        }
    }

    async fn send_message(&self, chat_id: Value, text: &str) -> Result<(), AppError> {
        let response = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| AppError::Delivery(format!("Telegram request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(AppError::Delivery(format!(
            "Telegram sendMessage failed: {} - {}",
            status, body
        )))
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, AppError> {
        let response = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout_secs.to_string()),
                ("allowed_updates", r#"["message"]"#.to_string()),
            ])
            .timeout(Duration::from_secs(self.poll_timeout_secs + 10))
            .send()
            .await
            .map_err(|e| AppError::Delivery(format!("Telegram getUpdates failed: {}", e)))?;

        let body: ApiResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|e| AppError::Delivery(format!("Telegram getUpdates response: {}", e)))?;

        if !body.ok {
            return Err(AppError::Delivery(format!(
                "Telegram getUpdates rejected: {}",
                body.description.unwrap_or_default()
            )));
        }
        Ok(body.result.unwrap_or_default())
    }

    /// Answer `/start` messages until `cancel` fires.
    pub async fn listen_updates(self, cancel: CancellationToken) {
        tracing::info!("Telegram updates listener started");
        let mut offset = 0;

        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                updates = self.get_updates(offset) => updates,
            };

            let updates = match updates {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!(error = %e, "Polling Telegram updates failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_PAUSE) => continue,
                    }
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);

                let Some(message) = update.message else {
                    continue;
                };
                if message.text.as_deref().map(str::trim) != Some("/start") {
                    continue;
                }

                let chat = message.chat.id;
                if let Err(e) = self.send_message(json!(chat), &start_reply(chat)).await {
                    tracing::error!(chat_id = chat, error = %e, "Failed to answer /start");
                }
            }
        }

        tracing::info!("Telegram updates listener stopped");
    }
}

#[async_trait]
impl Sender for TelegramSender {
    async fn send(&self, recipient: &str, message: &str) -> Result<(), AppError> {
        self.send_message(chat_id(recipient)?, message).await?;
        tracing::debug!(recipient, "Telegram message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_chat_id_is_sent_as_number() {
        assert_eq!(chat_id("123456").unwrap(), json!(123456));
        assert_eq!(chat_id("-100200300").unwrap(), json!(-100200300));
    }

    #[test]
    fn test_username_is_sent_as_string() {
        assert_eq!(chat_id("@herald_news").unwrap(), json!("@herald_news"));
    }

    #[test]
    fn test_invalid_chat_id() {
        assert!(chat_id("someone").is_err());
        assert!(chat_id("@").is_err());
    }

    #[test]
    fn test_start_reply_mentions_chat_id() {
        assert!(start_reply(987).contains("987"));
    }

    #[tokio::test]
    async fn test_send_times_out_on_unresponsive_api() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = TelegramConfig {
            bot_token: "token".to_string(),
            poll_timeout_secs: 30,
            request_timeout_secs: 1,
        };
        let sender = TelegramSender::with_api_base(&config, &format!("http://{}", addr));

        let result = tokio::time::timeout(Duration::from_secs(10), sender.send("123", "hi"))
            .await
            .expect("send should give up on its own");

        assert!(matches!(result, Err(AppError::Delivery(_))));
        server.abort();
    }

    #[test]
    fn test_updates_deserialize() {
        let raw = r#"{"ok":true,"result":[{"update_id":10,"message":{"message_id":1,"chat":{"id":55,"type":"private"},"text":"/start"}}]}"#;
        let body: ApiResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let updates = body.result.unwrap();
        assert_eq!(updates[0].update_id, 10);
        let message = updates[0].message.as_ref().unwrap();
        assert_eq!(message.chat.id, 55);
        assert_eq!(message.text.as_deref(), Some("/start"));
    }
}
