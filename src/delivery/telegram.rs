//! Telegram Bot API sink.
//!
//! Messages go to one chat. An item's category selects the message it
//! replies to (the forum thread), so each feed lands in its own thread.
//! A 429 answer becomes [`HandlerError::RateLimited`] with the wait the API
//! asked for.

use crate::{
    FerryworkError, Result,
    config::TelegramConfig,
    delivery::{DeliveryReceipt, DeliverySink, render_text},
    error::HandlerError,
    payload::DeliveryItem,
};
use async_trait::async_trait;
use reqwest::{StatusCode, header::RETRY_AFTER};
use serde::Deserialize;
use serde_json::json;
use std::{collections::BTreeMap, time::Duration};
use tracing::debug;

/// Used when a 429 carries neither `retry_after` nor `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
    first_name: String,
    username: Option<String>,
}

pub struct TelegramSink {
    client: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: String,
    thread_ids: BTreeMap<String, i64>,
}

impl TelegramSink {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_base: "https://api.telegram.org".to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
            thread_ids: BTreeMap::new(),
        })
    }

    pub fn from_config(config: &TelegramConfig) -> Result<Self> {
        if !config.is_configured() {
            return Err(FerryworkError::Config(
                "telegram.token and telegram.chat_id are required".to_string(),
            ));
        }
        Ok(Self::new(config.token.clone(), config.chat_id.clone())?
            .with_api_base(config.api_base.clone())
            .with_thread_ids(config.thread_ids.clone()))
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_thread_ids(mut self, thread_ids: BTreeMap<String, i64>) -> Self {
        self.thread_ids = thread_ids;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn send_message(
        &self,
        text: &str,
        reply_to: Option<i64>,
    ) -> std::result::Result<DeliveryReceipt, HandlerError> {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        if let Some(message_id) = reply_to {
            body["reply_parameters"] = json!({ "message_id": message_id });
        }

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            // The URL carries the bot token.
            .map_err(|e| HandlerError::failed(format!("telegram request failed: {}", e.without_url())))?;

        let status = response.status();
        let header_retry = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let parsed = response.json::<ApiResponse<SentMessage>>().await.ok();

        let throttled = status == StatusCode::TOO_MANY_REQUESTS
            || parsed.as_ref().and_then(|r| r.error_code) == Some(429);
        if throttled {
            let retry_after = parsed
                .as_ref()
                .and_then(|r| r.parameters.as_ref())
                .and_then(|p| p.retry_after)
                .or(header_retry)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Err(HandlerError::rate_limited(retry_after));
        }

        match parsed {
            Some(ApiResponse {
                ok: true,
                result: Some(sent),
                ..
            }) => {
                debug!("Sent telegram message {}", sent.message_id);
                Ok(DeliveryReceipt {
                    sink: "telegram".to_string(),
                    message_id: Some(sent.message_id),
                })
            }
            Some(response) => Err(HandlerError::failed(format!(
                "telegram rejected message ({}): {}",
                response.error_code.map_or_else(|| status.as_u16(), |code| code),
                response.description.unwrap_or_else(|| "no description".to_string())
            ))),
            None => Err(HandlerError::failed(format!(
                "telegram answered {} with an unreadable body",
                status
            ))),
        }
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    /// `getMe`. Fails when the token is rejected.
    async fn check(&self) -> Result<String> {
        let response = self
            .client
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(|e| FerryworkError::Connection {
                message: format!("telegram unreachable: {}", e.without_url()),
            })?;
        let status = response.status();
        let parsed: ApiResponse<BotUser> = response.json().await.map_err(|e| FerryworkError::Connection {
            message: format!("telegram answered {}: {}", status, e.without_url()),
        })?;

        match parsed {
            ApiResponse {
                ok: true,
                result: Some(bot),
                ..
            } => Ok(match bot.username {
                Some(username) => format!("@{} ({})", username, bot.id),
                None => format!("{} ({})", bot.first_name, bot.id),
            }),
            other => Err(FerryworkError::Config(format!(
                "telegram rejected the bot token: {}",
                other.description.unwrap_or_else(|| status.to_string())
            ))),
        }
    }

    async fn deliver(&self, item: &DeliveryItem) -> std::result::Result<DeliveryReceipt, HandlerError> {
        let reply_to = self.thread_ids.get(&item.category).copied();
        self.send_message(&render_text(item), reply_to).await
    }

    async fn alert(
        &self,
        item: &DeliveryItem,
        matched: &[String],
    ) -> std::result::Result<DeliveryReceipt, HandlerError> {
        let text = format!("{}\n\nFiltered: {}", render_text(item), matched.join(", "));
        self.send_message(&text, None).await
    }
}
