//! Gauguin Telegram Adapter
//!
//! Bot API wire types and a thin reqwest client: file download, replies,
//! polls, webhook registration, long polling and discussion lookups

pub mod types;

pub use types::*;

use regex::Regex;
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ALLOWED_UPDATES: [&str; 3] = ["message", "channel_post", "edited_channel_post"];

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram {method} HTTP {status}: {description}")]
    Http {
        method: String,
        status: u16,
        description: String,
    },
    #[error("telegram {method} returned ok=false: {description}")]
    Api { method: String, description: String },
    #[error("telegram {method} request failed: {message}")]
    Transport { method: String, message: String },
    #[error("telegram {method} decode failed: {message}")]
    Decode { method: String, message: String },
    #[error("telegram {method} is not supported by this Bot API server")]
    Unsupported { method: String },
}

impl TelegramError {
    pub fn is_reply_target_missing(&self) -> bool {
        match self {
            TelegramError::Http { description, .. } | TelegramError::Api { description, .. } => {
                description
                    .to_ascii_lowercase()
                    .contains("message to be replied not found")
            }
            _ => false,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, TelegramError::Unsupported { .. })
    }
}

/// Replaces `bot<id>:<secret>` fragments so Bot API URLs can be logged safely.
pub fn redact_token(text: &str) -> String {
    static TOKEN_RE: OnceLock<Option<Regex>> = OnceLock::new();
    match TOKEN_RE.get_or_init(|| Regex::new(r"bot\d+:[A-Za-z0-9_-]+").ok()) {
        Some(re) => re.replace_all(text, "bot<redacted>").into_owned(),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PollRequest {
    pub chat_id: i64,
    pub question: String,
    pub options: Vec<String>,
    pub reply_to_message_id: Option<i64>,
    pub open_period: Option<u32>,
}

impl PollRequest {
    fn payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "chat_id": self.chat_id,
            "question": self.question,
            "options": self.options,
            "is_anonymous": true,
            "allows_multiple_answers": false,
            "type": "regular",
        });
        if let Some(reply_to) = self.reply_to_message_id {
            payload["reply_to_message_id"] = serde_json::json!(reply_to);
            payload["allow_sending_without_reply"] = serde_json::json!(true);
        }
        if let Some(open_period) = self.open_period {
            payload["open_period"] = serde_json::json!(open_period);
        }
        payload
    }
}

/// The Bot API surface the caption pipeline and the poll scheduler depend on.
#[async_trait::async_trait]
pub trait TelegramApi: Send + Sync {
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, TelegramError>;

    /// Replies even when the target message has disappeared.
    async fn send_reply(
        &self,
        chat_id: i64,
        reply_to_message_id: i64,
        text: &str,
    ) -> Result<i64, TelegramError>;

    async fn send_poll(&self, poll: &PollRequest) -> Result<i64, TelegramError>;

    /// Returns the (discussion chat id, discussion message id) copy of a channel post.
    async fn get_discussion_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<(i64, i64), TelegramError>;
}

#[async_trait::async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, update: TelegramUpdate);
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
    #[serde(default)]
    chat: Option<TelegramChat>,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    }
}

fn interpret_response<T: DeserializeOwned>(
    method: &str,
    status: u16,
    body: &str,
) -> Result<T, TelegramError> {
    let parsed: ApiResponse<T> = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return Err(match status {
                404 => TelegramError::Unsupported {
                    method: method.to_string(),
                },
                200..=299 => TelegramError::Decode {
                    method: method.to_string(),
                    message: format!("{} | body={}", err, truncate_for_error(body, 400)),
                },
                _ => TelegramError::Http {
                    method: method.to_string(),
                    status,
                    description: truncate_for_error(body, 400),
                },
            })
        }
    };

    if parsed.ok {
        return parsed.result.ok_or_else(|| TelegramError::Decode {
            method: method.to_string(),
            message: "missing result".to_string(),
        });
    }

    let description = parsed
        .description
        .unwrap_or_else(|| "unknown error".to_string());
    if status == 404 || parsed.error_code == Some(404) {
        return Err(TelegramError::Unsupported {
            method: method.to_string(),
        });
    }
    if (200..300).contains(&status) {
        Err(TelegramError::Api {
            method: method.to_string(),
            description,
        })
    } else {
        Err(TelegramError::Http {
            method: method.to_string(),
            status,
            description,
        })
    }
}

fn remove_reply_to_message_id(payload: &mut serde_json::Value) -> bool {
    payload
        .as_object_mut()
        .map(|obj| obj.remove("reply_to_message_id").is_some())
        .unwrap_or(false)
}

pub struct BotClient {
    client: Client,
    api_url: String,
    file_url: String,
}

impl BotClient {
    pub fn new(bot_token: &str, api_base_url: &str) -> Result<Self, TelegramError> {
        let base = api_base_url.trim_end_matches('/');
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(45))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| TelegramError::Transport {
                method: "client".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            api_url: format!("{}/bot{}", base, bot_token),
            file_url: format!("{}/file/bot{}", base, bot_token),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<T, TelegramError> {
        let url = format!("{}/{}", self.api_url, method);
        let mut request = self.client.post(&url).json(payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let transport = |e: reqwest::Error| TelegramError::Transport {
            method: method.to_string(),
            message: redact_token(&e.without_url().to_string()),
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        interpret_response(method, status, &body)
    }

    pub async fn set_webhook(
        &self,
        url: &str,
        secret_token: &str,
        drop_pending_updates: bool,
    ) -> Result<(), TelegramError> {
        let payload = serde_json::json!({
            "url": url,
            "secret_token": secret_token,
            "allowed_updates": ALLOWED_UPDATES,
            "drop_pending_updates": drop_pending_updates,
        });
        let _: bool = self.call("setWebhook", &payload, None).await?;
        info!(url = %redact_token(url), "Telegram webhook registered");
        Ok(())
    }

    pub async fn delete_webhook(&self, drop_pending_updates: bool) -> Result<(), TelegramError> {
        let payload = serde_json::json!({ "drop_pending_updates": drop_pending_updates });
        let _: bool = self.call("deleteWebhook", &payload, None).await?;
        info!("Telegram webhook deleted");
        Ok(())
    }

    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<TelegramUpdate>, TelegramError> {
        let mut payload = serde_json::json!({
            "timeout": timeout_secs,
            "allowed_updates": ALLOWED_UPDATES,
        });
        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }
        self.call(
            "getUpdates",
            &payload,
            Some(Duration::from_secs(timeout_secs + 15)),
        )
        .await
    }

    /// Long-polling loop for deployments without a public URL. Never returns.
    pub async fn poll(&self, timeout_secs: u64, handler: &dyn UpdateHandler) {
        if let Err(err) = self.delete_webhook(false).await {
            warn!("Failed to delete webhook before polling: {}", err);
        }

        let mut offset: Option<i64> = None;
        info!("Telegram polling started");

        loop {
            let updates = match self.get_updates(offset, timeout_secs).await {
                Ok(updates) => updates,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                handler.handle_update(update).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl TelegramApi for BotClient {
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, TelegramError> {
        let info: FileInfo = self
            .call(
                "getFile",
                &serde_json::json!({ "file_id": file_id }),
                None,
            )
            .await?;
        let file_path = info.file_path.ok_or_else(|| TelegramError::Decode {
            method: "getFile".to_string(),
            message: "missing file_path".to_string(),
        })?;

        let transport = |e: reqwest::Error| TelegramError::Transport {
            method: "download".to_string(),
            message: redact_token(&e.without_url().to_string()),
        };
        let response = self
            .client
            .get(format!("{}/{}", self.file_url, file_path))
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TelegramError::Http {
                method: "download".to_string(),
                status: status.as_u16(),
                description: "file download failed".to_string(),
            });
        }
        let bytes = response.bytes().await.map_err(transport)?;
        debug!(file_id = %file_id, size = bytes.len(), "Telegram file downloaded");
        Ok(bytes.to_vec())
    }

    async fn send_reply(
        &self,
        chat_id: i64,
        reply_to_message_id: i64,
        text: &str,
    ) -> Result<i64, TelegramError> {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "reply_to_message_id": reply_to_message_id,
            "allow_sending_without_reply": true,
        });

        match self.call::<SentMessage>("sendMessage", &payload, None).await {
            Ok(sent) => Ok(sent.message_id),
            Err(err) if err.is_reply_target_missing() => {
                warn!(
                    chat_id = chat_id,
                    "sendMessage failed due to missing reply target; retrying without reply_to_message_id"
                );
                remove_reply_to_message_id(&mut payload);
                let sent: SentMessage = self.call("sendMessage", &payload, None).await?;
                Ok(sent.message_id)
            }
            Err(err) => Err(err),
        }
    }

    async fn send_poll(&self, poll: &PollRequest) -> Result<i64, TelegramError> {
        let sent: SentMessage = self.call("sendPoll", &poll.payload(), None).await?;
        Ok(sent.message_id)
    }

    async fn get_discussion_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<(i64, i64), TelegramError> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
        });
        let found: SentMessage = self.call("getDiscussionMessage", &payload, None).await?;
        let chat = found.chat.ok_or_else(|| TelegramError::Decode {
            method: "getDiscussionMessage".to_string(),
            message: "missing chat".to_string(),
        })?;
        Ok((chat.id, found.message_id))
    }
}
