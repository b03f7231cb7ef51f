use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub channel_post: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_channel_post: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub date: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<TelegramPhotoSize>>,
    #[serde(default)]
    pub media_group_id: Option<String>,
    #[serde(default)]
    pub is_automatic_forward: bool,
    #[serde(default)]
    pub forward_from_chat: Option<TelegramChat>,
    #[serde(default)]
    pub forward_from_message_id: Option<i64>,
    #[serde(default)]
    pub forward_origin: Option<MessageOrigin>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramPhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub chat_type: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Structured forward origin (Bot API 7.0+). Only channel origins carry a message id we can use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageOrigin {
    Channel { chat: TelegramChat, message_id: i64 },
    #[serde(other)]
    Other,
}

impl TelegramMessage {
    pub fn largest_photo(&self) -> Option<&TelegramPhotoSize> {
        self.photo
            .as_ref()?
            .iter()
            .max_by_key(|size| size.width.saturating_mul(size.height))
    }

    pub fn caption_text(&self) -> Option<&str> {
        self.caption
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn is_group(&self) -> bool {
        matches!(self.chat.chat_type.as_str(), "group" | "supergroup")
    }

    /// The (channel chat id, channel message id) an automatic forward was copied from.
    pub fn forward_source(&self) -> Option<(i64, i64)> {
        if let (Some(chat), Some(message_id)) =
            (&self.forward_from_chat, self.forward_from_message_id)
        {
            return Some((chat.id, message_id));
        }
        match &self.forward_origin {
            Some(MessageOrigin::Channel { chat, message_id }) => Some((chat.id, *message_id)),
            _ => None,
        }
    }
}
