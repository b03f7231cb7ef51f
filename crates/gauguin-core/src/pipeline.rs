//! Caption pipeline: channel photo post → AI caption → comment in the linked
//! discussion group.
//!
//! The caption is generated while the webhook handler is still running; the
//! wait for the discussion copy of the post and the reply itself run as a
//! tracked background task.

use crate::dedup::{DedupStore, CHANNEL_MESSAGE_TTL, MEDIA_GROUP_TTL};
use crate::discussion::{DiscussionMap, DiscussionRef};
use chrono::Utc;
use gauguin_config::DiscussionLookup;
use gauguin_providers::CaptionGenerator;
use gauguin_scheduler::PollScheduler;
use gauguin_storage::Storage;
use gauguin_telegram::{TelegramApi, TelegramMessage, TelegramUpdate, UpdateHandler};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pauses between discussion-map lookups; the map is checked once more after the last one.
pub const RESOLVE_DELAYS: [Duration; 6] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(12),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostDisposition {
    NotAllowed,
    NoPhoto,
    Duplicate,
    DuplicateMediaGroup,
    DownloadFailed,
    CaptionFailed,
    CommentScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommentOutcome {
    Sent { chat_id: i64, message_id: i64 },
    SendFailed,
    Unresolved,
}

#[derive(Debug, Error)]
pub enum RegenerateError {
    #[error("post ledger is disabled")]
    LedgerDisabled,
    #[error("post not found in ledger or has no photo")]
    PostNotFound,
    #[error("no live discussion mapping for this post")]
    DiscussionNotFound,
    #[error("ledger query failed: {0}")]
    Storage(String),
    #[error("photo download failed: {0}")]
    Download(String),
    #[error("caption generation failed: {0}")]
    Caption(String),
}

/// Persistent side of intake: post records and daily poll planning.
pub struct Ledger {
    pub storage: Arc<Mutex<Storage>>,
    pub scheduler: Arc<PollScheduler>,
    pub retention_days: u32,
}

pub struct CaptionPipeline {
    allowed_channel_id: Option<i64>,
    lookup: DiscussionLookup,
    telegram: Arc<dyn TelegramApi>,
    ai: Arc<dyn CaptionGenerator>,
    ledger: Option<Ledger>,
    messages: DedupStore<(i64, i64)>,
    media_groups: DedupStore<String>,
    discussions: Arc<DiscussionMap>,
    tasks: StdMutex<JoinSet<()>>,
}

impl CaptionPipeline {
    pub fn new(telegram: Arc<dyn TelegramApi>, ai: Arc<dyn CaptionGenerator>) -> Self {
        Self {
            allowed_channel_id: None,
            lookup: DiscussionLookup::default(),
            telegram,
            ai,
            ledger: None,
            messages: DedupStore::new(),
            media_groups: DedupStore::new(),
            discussions: Arc::new(DiscussionMap::new()),
            tasks: StdMutex::new(JoinSet::new()),
        }
    }

    pub fn with_allowed_channel(mut self, channel_id: Option<i64>) -> Self {
        self.allowed_channel_id = channel_id;
        self
    }

    pub fn with_lookup(mut self, lookup: DiscussionLookup) -> Self {
        self.lookup = lookup;
        self
    }

    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn discussions(&self) -> &DiscussionMap {
        &self.discussions
    }

    /// Runs `task` in the background; it is aborted by [`CaptionPipeline::shutdown`].
    pub fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("Background task panicked: {}", e);
                }
            }
        }
        tasks.spawn(task);
    }

    pub fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Abandons pending comment deliveries.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            info!(tasks = tasks.len(), "Aborting background caption tasks");
        }
        tasks.abort_all();
    }

    pub async fn process_update(&self, update: TelegramUpdate) {
        if let Some(post) = &update.channel_post {
            let disposition = self.handle_channel_post(post).await;
            debug!(
                update_id = update.update_id,
                channel_id = post.chat.id,
                message_id = post.message_id,
                disposition = ?disposition,
                "Channel post handled"
            );
        } else if let Some(message) = &update.message {
            if !self.handle_discussion_message(message) {
                debug!(update_id = update.update_id, "Ignoring non-forward message");
            }
        } else {
            debug!(update_id = update.update_id, "Ignoring update");
        }
    }

    /// Records the rendezvous entry for an automatic forward; `false` for any other message.
    pub fn handle_discussion_message(&self, message: &TelegramMessage) -> bool {
        if !message.is_automatic_forward {
            return false;
        }
        let Some((channel_id, channel_message_id)) = message.forward_source() else {
            debug!(
                chat_id = message.chat.id,
                message_id = message.message_id,
                "Automatic forward without a channel origin"
            );
            return false;
        };
        self.discussions.put(
            channel_id,
            channel_message_id,
            message.chat.id,
            message.message_id,
        );
        debug!(
            channel_id = channel_id,
            message_id = channel_message_id,
            discussion_chat_id = message.chat.id,
            discussion_message_id = message.message_id,
            "Discussion mapping stored"
        );
        true
    }

    pub async fn handle_channel_post(&self, post: &TelegramMessage) -> PostDisposition {
        let channel_id = post.chat.id;
        let message_id = post.message_id;

        if self
            .allowed_channel_id
            .is_some_and(|allowed| allowed != channel_id)
        {
            return PostDisposition::NotAllowed;
        }
        let Some(photo) = post.largest_photo() else {
            return PostDisposition::NoPhoto;
        };
        if self
            .messages
            .mark_and_check((channel_id, message_id), CHANNEL_MESSAGE_TTL)
        {
            debug!(channel_id = channel_id, message_id = message_id, "Duplicate channel post");
            return PostDisposition::Duplicate;
        }
        if let Some(group) = post.media_group_id.as_deref().filter(|g| !g.is_empty()) {
            if self
                .media_groups
                .mark_and_check(group.to_string(), MEDIA_GROUP_TTL)
            {
                debug!(media_group_id = %group, message_id = message_id, "Album already answered");
                return PostDisposition::DuplicateMediaGroup;
            }
        }

        let image = match self.telegram.download_file(&photo.file_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(channel_id = channel_id, message_id = message_id, "Failed to download photo: {}", e);
                return PostDisposition::DownloadFailed;
            }
        };

        self.record_in_ledger(post, &photo.file_id).await;

        let caption = match self.ai.generate_caption(&image, post.caption_text()).await {
            Ok(caption) if !caption.trim().is_empty() => caption,
            Ok(_) => {
                error!(channel_id = channel_id, message_id = message_id, "AI returned an empty caption");
                return PostDisposition::CaptionFailed;
            }
            Err(e) => {
                error!(channel_id = channel_id, message_id = message_id, "Failed to generate caption: {}", e);
                return PostDisposition::CaptionFailed;
            }
        };
        info!(channel_id = channel_id, message_id = message_id, "Caption ready");

        let telegram = Arc::clone(&self.telegram);
        let discussions = Arc::clone(&self.discussions);
        let lookup = self.lookup;
        self.spawn_tracked(async move {
            deliver_comment(
                telegram.as_ref(),
                &discussions,
                lookup,
                channel_id,
                message_id,
                &caption,
            )
            .await;
        });
        PostDisposition::CommentScheduled
    }

    async fn record_in_ledger(&self, post: &TelegramMessage, file_id: &str) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let window = ledger.scheduler.window();
        let now = Utc::now();
        let today = window.local_date(now);
        let post_date = Some(post.date)
            .filter(|secs| *secs > 0)
            .and_then(|secs| window.date_of_unix(secs))
            .unwrap_or(today);
        let channel_id = post.chat.id;

        let storage = ledger.storage.lock().await;
        match storage.prune_if_new_day(today, ledger.retention_days, now) {
            Ok(0) => {}
            Ok(deleted) => info!(deleted = deleted, "Pruned old ledger posts"),
            Err(e) => warn!("Ledger cleanup failed: {:#}", e),
        }
        if let Err(e) =
            storage.record_post(channel_id, post.message_id, post_date, Some(file_id), now)
        {
            warn!(channel_id = channel_id, message_id = post.message_id, "Failed to record post: {:#}", e);
        }
        if let Err(e) = ledger.scheduler.ensure_poll_for(&storage, channel_id, post_date) {
            warn!(channel_id = channel_id, poll_date = %post_date, "Failed to plan daily poll: {:#}", e);
        }
    }

    /// Captions a recorded post again and replies once in its known discussion thread.
    pub async fn regenerate(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<CommentOutcome, RegenerateError> {
        let ledger = self.ledger.as_ref().ok_or(RegenerateError::LedgerDisabled)?;
        let post = ledger
            .storage
            .lock()
            .await
            .get_post(channel_id, message_id)
            .map_err(|e| RegenerateError::Storage(e.to_string()))?;
        let file_id = post
            .and_then(|p| p.photo_file_id)
            .ok_or(RegenerateError::PostNotFound)?;
        let target = self
            .discussions
            .get(channel_id, message_id)
            .ok_or(RegenerateError::DiscussionNotFound)?;

        let image = self
            .telegram
            .download_file(&file_id)
            .await
            .map_err(|e| RegenerateError::Download(e.to_string()))?;
        let caption = self
            .ai
            .generate_caption(&image, None)
            .await
            .map_err(|e| RegenerateError::Caption(e.to_string()))?;

        Ok(send_comment(self.telegram.as_ref(), target, &caption).await)
    }
}

#[async_trait::async_trait]
impl UpdateHandler for CaptionPipeline {
    async fn handle_update(&self, update: TelegramUpdate) {
        self.process_update(update).await;
    }
}

/// Polls the rendezvous table on the [`RESOLVE_DELAYS`] schedule.
pub async fn await_discussion(
    discussions: &DiscussionMap,
    channel_id: i64,
    message_id: i64,
) -> Option<DiscussionRef> {
    for delay in RESOLVE_DELAYS {
        if let Some(found) = discussions.get(channel_id, message_id) {
            return Some(found);
        }
        tokio::time::sleep(delay).await;
    }
    discussions.get(channel_id, message_id)
}

async fn direct_lookup(
    telegram: &dyn TelegramApi,
    discussions: &DiscussionMap,
    channel_id: i64,
    message_id: i64,
) -> Option<DiscussionRef> {
    match telegram.get_discussion_message(channel_id, message_id).await {
        Ok((chat_id, discussion_message_id)) => Some(DiscussionRef {
            discussion_chat_id: chat_id,
            discussion_message_id,
            created_at: tokio::time::Instant::now(),
        }),
        Err(e) if e.is_unsupported() => {
            debug!("getDiscussionMessage unsupported, using discussion map");
            discussions.get(channel_id, message_id)
        }
        Err(e) => {
            warn!(channel_id = channel_id, message_id = message_id, "Discussion lookup failed: {}", e);
            None
        }
    }
}

async fn send_comment(
    telegram: &dyn TelegramApi,
    target: DiscussionRef,
    caption: &str,
) -> CommentOutcome {
    match telegram
        .send_reply(
            target.discussion_chat_id,
            target.discussion_message_id,
            caption,
        )
        .await
    {
        Ok(message_id) => {
            info!(
                discussion_chat_id = target.discussion_chat_id,
                reply_to = target.discussion_message_id,
                message_id = message_id,
                "Caption comment sent"
            );
            CommentOutcome::Sent {
                chat_id: target.discussion_chat_id,
                message_id,
            }
        }
        Err(e) => {
            error!(
                discussion_chat_id = target.discussion_chat_id,
                "Failed to send caption comment: {}", e
            );
            CommentOutcome::SendFailed
        }
    }
}

/// Resolves the discussion thread of a channel post and replies with `caption`.
pub async fn deliver_comment(
    telegram: &dyn TelegramApi,
    discussions: &DiscussionMap,
    lookup: DiscussionLookup,
    channel_id: i64,
    message_id: i64,
    caption: &str,
) -> CommentOutcome {
    let target = match lookup {
        DiscussionLookup::Rendezvous => await_discussion(discussions, channel_id, message_id).await,
        DiscussionLookup::Direct => {
            direct_lookup(telegram, discussions, channel_id, message_id).await
        }
    };

    let Some(target) = target else {
        error!(
            channel_id = channel_id,
            message_id = message_id,
            "No discussion message found for channel post. Check that comments are enabled \
             (linked discussion group) and that the bot is a member of it and sees automatic forwards"
        );
        return CommentOutcome::Unresolved;
    };

    send_comment(telegram, target, caption).await
}
