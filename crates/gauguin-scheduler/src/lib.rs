//! Gauguin Scheduler
//!
//! Daily poll: one row per (channel, date) planned at a random instant inside
//! the publication window, advanced by a periodic tick

pub mod window;

pub use window::PollWindow;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use gauguin_config::DailyPollConfig;
use gauguin_providers::CaptionGenerator;
use gauguin_storage::{DailyPoll, Storage};
use gauguin_telegram::{PollRequest, TelegramApi};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotPostedReason {
    Disabled,
    NoDuePolls,
    DownloadFailed,
    AiFailed,
    SendFailed,
    /// Another run published the poll for this row first.
    AlreadyPosted,
    NoPollPosted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollRunOutcome {
    Posted {
        channel_id: i64,
        date: NaiveDate,
        poll_message_id: i64,
    },
    NotPosted {
        reason: NotPostedReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        date: Option<NaiveDate>,
    },
}

impl PollRunOutcome {
    fn not_posted(reason: NotPostedReason) -> Self {
        PollRunOutcome::NotPosted {
            reason,
            channel_id: None,
            date: None,
        }
    }

    fn failed(reason: NotPostedReason, row: &DailyPoll) -> Self {
        PollRunOutcome::NotPosted {
            reason,
            channel_id: Some(row.channel_id),
            date: Some(row.poll_date),
        }
    }

    pub fn is_posted(&self) -> bool {
        matches!(self, PollRunOutcome::Posted { .. })
    }
}

pub struct PollScheduler {
    config: DailyPollConfig,
    window: PollWindow,
    storage: Arc<Mutex<Storage>>,
    telegram: Arc<dyn TelegramApi>,
    ai: Arc<dyn CaptionGenerator>,
    /// Serialises whole runs: the periodic tick and manual triggers.
    run_guard: Mutex<()>,
}

impl PollScheduler {
    pub fn new(
        config: DailyPollConfig,
        storage: Arc<Mutex<Storage>>,
        telegram: Arc<dyn TelegramApi>,
        ai: Arc<dyn CaptionGenerator>,
    ) -> Result<Self> {
        let window = PollWindow::from_config(&config)?;
        Ok(Self {
            config,
            window,
            storage,
            telegram,
            ai,
            run_guard: Mutex::new(()),
        })
    }

    pub fn window(&self) -> &PollWindow {
        &self.window
    }

    pub fn is_poll_channel(&self, channel_id: i64) -> bool {
        self.config.is_poll_channel(channel_id)
    }

    /// Plans the day's poll for a poll channel; an existing row keeps its schedule.
    pub fn ensure_poll_for(
        &self,
        storage: &Storage,
        channel_id: i64,
        date: NaiveDate,
    ) -> Result<bool> {
        if !self.is_poll_channel(channel_id) {
            return Ok(false);
        }
        let scheduled_at = self
            .window
            .random_instant(date, &mut rand::thread_rng())?;
        let created = storage.ensure_daily_poll(channel_id, date, scheduled_at)?;
        if created {
            info!(
                channel_id = channel_id,
                poll_date = %date,
                scheduled_at = %scheduled_at,
                "Daily poll planned"
            );
        }
        Ok(created)
    }

    /// Periodic loop; every failure is logged and the next tick proceeds.
    pub async fn run(self: Arc<Self>) {
        info!(
            tick_secs = self.config.tick_secs,
            channels = ?self.config.channel_ids,
            "Daily poll scheduler started"
        );
        let tick = Duration::from_secs(self.config.tick_secs.max(1));

        loop {
            match self.run_once(Utc::now(), false, None).await {
                Ok(outcome @ PollRunOutcome::Posted { .. }) => {
                    info!(outcome = ?outcome, "Daily poll tick posted");
                }
                Ok(outcome) => debug!(outcome = ?outcome, "Daily poll tick"),
                Err(e) => error!("Daily poll tick failed: {:#}", e),
            }
            tokio::time::sleep(tick).await;
        }
    }

    /// Advances at most one due row. `force` bypasses the window and
    /// minimum-post checks; with a channel it also plans today's row if missing.
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        force: bool,
        channel: Option<i64>,
    ) -> Result<PollRunOutcome> {
        if !self.config.enabled {
            return Ok(PollRunOutcome::not_posted(NotPostedReason::Disabled));
        }
        let _run = self.run_guard.lock().await;

        let due = {
            let storage = self.storage.lock().await;
            if force {
                if let Some(channel_id) = channel.filter(|id| self.is_poll_channel(*id)) {
                    let today = self.window.local_date(now);
                    if storage.ensure_daily_poll(channel_id, today, now)? {
                        info!(channel_id = channel_id, poll_date = %today, "Forced daily poll planned");
                    }
                }
            }
            storage.get_due_polls(now)?
        };

        let due: Vec<DailyPoll> = due
            .into_iter()
            .filter(|row| channel.map_or(true, |id| id == row.channel_id))
            .collect();
        if due.is_empty() {
            return Ok(PollRunOutcome::not_posted(NotPostedReason::NoDuePolls));
        }

        for row in due {
            if !self.is_poll_channel(row.channel_id) {
                continue;
            }
            let channel_id = row.channel_id;
            let poll_date = row.poll_date;

            if !force && now > self.window.end_of(poll_date)? {
                let storage = self.storage.lock().await;
                storage.mark_poll_skipped(channel_id, poll_date, now)?;
                info!(channel_id = channel_id, poll_date = %poll_date, "Daily poll skipped: window passed");
                continue;
            }

            let post = {
                let storage = self.storage.lock().await;
                let count = storage.count_posts_for_date(channel_id, poll_date)?;
                if !force && count < i64::from(self.config.min_posts) {
                    info!(
                        channel_id = channel_id,
                        poll_date = %poll_date,
                        posts = count,
                        min_posts = self.config.min_posts,
                        "Daily poll not posted: not enough posts"
                    );
                    continue;
                }
                storage.pick_random_post(channel_id, poll_date)?
            };

            let Some(post) = post else {
                info!(channel_id = channel_id, poll_date = %poll_date, "Daily poll not posted: no posts found");
                continue;
            };
            let Some(file_id) = post.photo_file_id.as_deref() else {
                info!(
                    channel_id = channel_id,
                    poll_date = %poll_date,
                    message_id = post.message_id,
                    "Daily poll not posted: chosen post has no photo reference"
                );
                continue;
            };

            let image = match self.telegram.download_file(file_id).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(channel_id = channel_id, "Failed to download poll photo: {}", e);
                    return Ok(PollRunOutcome::failed(NotPostedReason::DownloadFailed, &row));
                }
            };

            let questions: Vec<&String> = self
                .config
                .questions
                .iter()
                .filter(|q| !q.trim().is_empty())
                .collect();
            let question = questions
                .choose(&mut rand::thread_rng())
                .map(|q| q.trim().to_string())
                .unwrap_or_default();

            let options = match self
                .ai
                .generate_poll_options(&image, &question, self.config.options_count)
                .await
            {
                Ok(options) => options,
                Err(e) => {
                    error!(channel_id = channel_id, poll_date = %poll_date, "Failed to generate poll options: {}", e);
                    let storage = self.storage.lock().await;
                    storage.mark_poll_error(channel_id, poll_date, &e.to_string(), Utc::now())?;
                    storage.mark_poll_skipped(channel_id, poll_date, Utc::now())?;
                    return Ok(PollRunOutcome::failed(NotPostedReason::AiFailed, &row));
                }
            };

            let request = PollRequest {
                chat_id: channel_id,
                question: question.clone(),
                options: options.clone(),
                reply_to_message_id: Some(post.message_id),
                open_period: self.config.open_period_secs,
            };
            let poll_message_id = match self.telegram.send_poll(&request).await {
                Ok(id) => id,
                Err(e) => {
                    error!(channel_id = channel_id, "Failed to send daily poll: {}", e);
                    return Ok(PollRunOutcome::failed(NotPostedReason::SendFailed, &row));
                }
            };

            let storage = self.storage.lock().await;
            let marked = storage.mark_poll_posted(
                channel_id,
                poll_date,
                poll_message_id,
                post.message_id,
                &question,
                &options,
                Utc::now(),
            )?;
            if !marked {
                warn!(
                    channel_id = channel_id,
                    poll_date = %poll_date,
                    poll_message_id = poll_message_id,
                    "Daily poll row was already terminal; this poll is a duplicate"
                );
                return Ok(PollRunOutcome::failed(NotPostedReason::AlreadyPosted, &row));
            }
            info!(
                channel_id = channel_id,
                poll_date = %poll_date,
                poll_message_id = poll_message_id,
                chosen_post = post.message_id,
                "Daily poll posted"
            );
            return Ok(PollRunOutcome::Posted {
                channel_id,
                date: poll_date,
                poll_message_id,
            });
        }

        Ok(PollRunOutcome::not_posted(NotPostedReason::NoPollPosted))
    }
}
