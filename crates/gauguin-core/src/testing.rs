//! In-memory stand-ins for the Bot API and the AI service.

use gauguin_providers::{AiError, CaptionGenerator};
use gauguin_telegram::{
    PollRequest, TelegramApi, TelegramChat, TelegramError, TelegramMessage, TelegramPhotoSize,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

pub fn temp_db_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("gauguin-core-{}-{}.db", name, nanos))
}

fn chat(id: i64, chat_type: &str) -> TelegramChat {
    TelegramChat {
        id,
        chat_type: chat_type.to_string(),
        title: None,
    }
}

pub fn photo_post(
    channel_id: i64,
    message_id: i64,
    caption: Option<&str>,
    media_group_id: Option<&str>,
) -> TelegramMessage {
    let size = |suffix: &str, width: i64, height: i64| TelegramPhotoSize {
        file_id: format!("photo-{}-{}", message_id, suffix),
        width,
        height,
        file_size: None,
    };
    TelegramMessage {
        message_id,
        date: 1_704_096_000,
        chat: chat(channel_id, "channel"),
        text: None,
        caption: caption.map(str::to_string),
        photo: Some(vec![size("small", 90, 60), size("large", 1280, 853)]),
        media_group_id: media_group_id.map(str::to_string),
        is_automatic_forward: false,
        forward_from_chat: None,
        forward_from_message_id: None,
        forward_origin: None,
    }
}

pub fn auto_forward(
    discussion_chat_id: i64,
    discussion_message_id: i64,
    channel_id: i64,
    channel_message_id: i64,
) -> TelegramMessage {
    TelegramMessage {
        message_id: discussion_message_id,
        date: 1_704_096_003,
        chat: chat(discussion_chat_id, "supergroup"),
        text: None,
        caption: None,
        photo: None,
        media_group_id: None,
        is_automatic_forward: true,
        forward_from_chat: Some(chat(channel_id, "channel")),
        forward_from_message_id: Some(channel_message_id),
        forward_origin: None,
    }
}

#[derive(Debug, Clone)]
pub struct SentReply {
    pub chat_id: i64,
    pub reply_to: i64,
    pub text: String,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub enum DirectMode {
    Unsupported,
    Found(i64, i64),
}

pub struct FakeTelegram {
    replies: Mutex<Vec<SentReply>>,
    reply_attempts: AtomicUsize,
    fail_replies: AtomicBool,
    downloads: AtomicUsize,
    polls: Mutex<Vec<PollRequest>>,
    direct: Mutex<DirectMode>,
}

impl Default for FakeTelegram {
    fn default() -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            reply_attempts: AtomicUsize::new(0),
            fail_replies: AtomicBool::new(false),
            downloads: AtomicUsize::new(0),
            polls: Mutex::new(Vec::new()),
            direct: Mutex::new(DirectMode::Unsupported),
        }
    }
}

impl FakeTelegram {
    pub fn replies(&self) -> Vec<SentReply> {
        self.replies.lock().expect("replies lock").clone()
    }

    pub fn reply_attempts(&self) -> usize {
        self.reply_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_replies(&self) {
        self.fail_replies.store(true, Ordering::SeqCst);
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> Vec<PollRequest> {
        self.polls.lock().expect("polls lock").clone()
    }

    pub fn set_direct(&self, mode: DirectMode) {
        *self.direct.lock().expect("direct lock") = mode;
    }
}

#[async_trait::async_trait]
impl TelegramApi for FakeTelegram {
    async fn download_file(&self, _file_id: &str) -> Result<Vec<u8>, TelegramError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0xff, 0xd8, 0xff, 0xe0])
    }

    async fn send_reply(
        &self,
        chat_id: i64,
        reply_to_message_id: i64,
        text: &str,
    ) -> Result<i64, TelegramError> {
        self.reply_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_replies.load(Ordering::SeqCst) {
            return Err(TelegramError::Api {
                method: "sendMessage".to_string(),
                description: "Forbidden: bot is not a member of the supergroup chat".to_string(),
            });
        }
        let mut replies = self.replies.lock().expect("replies lock");
        replies.push(SentReply {
            chat_id,
            reply_to: reply_to_message_id,
            text: text.to_string(),
            at: Instant::now(),
        });
        Ok(1000 + replies.len() as i64)
    }

    async fn send_poll(&self, poll: &PollRequest) -> Result<i64, TelegramError> {
        let mut polls = self.polls.lock().expect("polls lock");
        polls.push(poll.clone());
        Ok(9000 + polls.len() as i64)
    }

    async fn get_discussion_message(
        &self,
        _chat_id: i64,
        _message_id: i64,
    ) -> Result<(i64, i64), TelegramError> {
        match *self.direct.lock().expect("direct lock") {
            DirectMode::Found(chat_id, message_id) => Ok((chat_id, message_id)),
            DirectMode::Unsupported => Err(TelegramError::Unsupported {
                method: "getDiscussionMessage".to_string(),
            }),
        }
    }
}

pub struct FakeAi {
    caption: String,
    fail: bool,
    contexts: Mutex<Vec<Option<String>>>,
}

impl FakeAi {
    pub fn with_caption(caption: &str) -> Self {
        Self {
            caption: caption.to_string(),
            fail: false,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_caption("")
        }
    }

    pub fn contexts(&self) -> Vec<Option<String>> {
        self.contexts.lock().expect("contexts lock").clone()
    }
}

#[async_trait::async_trait]
impl CaptionGenerator for FakeAi {
    async fn generate_caption(
        &self,
        _image_bytes: &[u8],
        context: Option<&str>,
    ) -> Result<String, AiError> {
        self.contexts
            .lock()
            .expect("contexts lock")
            .push(context.map(str::to_string));
        if self.fail {
            return Err(AiError::Http {
                status: 500,
                body: "upstream unavailable".to_string(),
            });
        }
        Ok(self.caption.clone())
    }

    async fn generate_poll_options(
        &self,
        _image_bytes: &[u8],
        _question: &str,
        count: usize,
    ) -> Result<Vec<String>, AiError> {
        Ok((1..=count).map(|i| format!("option {}", i)).collect())
    }
}

/// Counts `ERROR` events emitted on the current thread while the guard lives.
#[derive(Clone, Default)]
pub struct ErrorCounter {
    count: Arc<AtomicUsize>,
}

impl ErrorCounter {
    pub fn install() -> (Self, DefaultGuard) {
        let counter = Self::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        (counter, tracing::subscriber::set_default(subscriber))
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
