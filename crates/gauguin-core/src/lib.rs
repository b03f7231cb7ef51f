//! Gauguin Core
//!
//! Runtime wiring: caption pipeline, daily poll loop, update ingestion and the
//! HTTP surface

pub mod dedup;
pub mod discussion;
pub mod pipeline;
pub mod server;

#[cfg(test)]
mod testing;

pub use pipeline::{CaptionPipeline, CommentOutcome, Ledger, PostDisposition, RegenerateError};
pub use server::{build_router, serve, AppState, HealthStatus};

use anyhow::{Context, Result};
use gauguin_config::{token_fingerprint, Config, RetryPolicyConfig, UpdateMode};
use gauguin_providers::{AiClient, CaptionGenerator, RetryPolicy};
use gauguin_scheduler::PollScheduler;
use gauguin_storage::Storage;
use gauguin_telegram::{BotClient, TelegramApi};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DB_FILE_NAME: &str = "gauguin.db";

/// Long-lived services built from a validated configuration.
pub struct Services {
    pub bot: Arc<BotClient>,
    pub pipeline: Arc<CaptionPipeline>,
    /// `None` when the ledger is disabled.
    pub scheduler: Option<Arc<PollScheduler>>,
    pub storage: Option<Arc<Mutex<Storage>>>,
}

impl Services {
    pub fn build(config: &Config, db_path: &Path) -> Result<Self> {
        let bot = Arc::new(BotClient::new(
            &config.telegram.bot_token,
            &config.telegram.api_base_url,
        )?);
        let telegram: Arc<dyn TelegramApi> = bot.clone();
        let ai: Arc<dyn CaptionGenerator> = Arc::new(build_ai_client(config));

        let mut pipeline = CaptionPipeline::new(telegram.clone(), ai.clone())
            .with_allowed_channel(config.telegram.allowed_channel_id)
            .with_lookup(config.telegram.discussion_lookup);

        let (storage, scheduler) = if config.ledger.enabled {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let storage = Arc::new(Mutex::new(Storage::new(db_path).with_context(|| {
                format!("Failed to open ledger at {}", db_path.display())
            })?));
            let scheduler = Arc::new(PollScheduler::new(
                config.daily_poll.clone(),
                storage.clone(),
                telegram,
                ai,
            )?);
            pipeline = pipeline.with_ledger(Ledger {
                storage: storage.clone(),
                scheduler: scheduler.clone(),
                retention_days: config.ledger.retention_days,
            });
            (Some(storage), Some(scheduler))
        } else {
            (None, None)
        };

        Ok(Self {
            bot,
            pipeline: Arc::new(pipeline),
            scheduler,
            storage,
        })
    }
}

pub fn retry_policy_from_config(config: Option<&RetryPolicyConfig>) -> RetryPolicy {
    let default = RetryPolicy::default();
    match config {
        Some(cfg) => RetryPolicy {
            window_secs: cfg.window_secs.unwrap_or(default.window_secs),
            initial_delay_secs: cfg.initial_delay_secs.unwrap_or(default.initial_delay_secs),
            backoff_factor: cfg.backoff_factor.unwrap_or(default.backoff_factor),
            max_delay_secs: cfg.max_delay_secs.unwrap_or(default.max_delay_secs),
        },
        None => default,
    }
}

pub fn build_ai_client(config: &Config) -> AiClient {
    AiClient::new(
        config.ai.api_key.clone(),
        &config.ai.base_url,
        &config.ai.chat_path,
        config.ai.model.clone(),
    )
    .with_timeout(Duration::from_secs(config.ai.timeout_secs))
    .with_temperature(config.ai.temperature)
    .with_send_image(config.ai.send_image)
    .with_caption_style(&config.caption.language, config.caption.max_chars)
    .with_retry_policy(retry_policy_from_config(config.ai.retry.as_ref()))
}

pub fn resolve_db_path(config: &Config, data_dir: &Path) -> PathBuf {
    config
        .ledger
        .db_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join(DB_FILE_NAME))
}

pub fn update_mode_name(mode: UpdateMode) -> &'static str {
    match mode {
        UpdateMode::Webhook => "webhook",
        UpdateMode::Polling => "polling",
    }
}

/// Serves until `shutdown` resolves. A configuration that failed to load
/// still gets the HTTP surface, with `/health` reporting the error.
pub async fn run_server<F>(
    loaded: Result<Config>,
    data_dir: &Path,
    listener: TcpListener,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error, serving health only: {:#}", e);
            return serve(listener, AppState::degraded(format!("{:#}", e)), shutdown).await;
        }
    };

    let fingerprint = token_fingerprint(&config.telegram.bot_token);
    let mode = config.telegram.update_mode;
    info!(
        bot_token_fp = %fingerprint,
        update_mode = update_mode_name(mode),
        "Gauguin starting"
    );

    let services = match Services::build(&config, &resolve_db_path(&config, data_dir)) {
        Ok(services) => services,
        Err(e) => {
            error!("Failed to initialise services: {:#}", e);
            return serve(listener, AppState::degraded(format!("{:#}", e)), shutdown).await;
        }
    };
    let state = AppState::ready(&config, &services);

    let mut background: Vec<JoinHandle<()>> = Vec::new();

    if config.daily_poll.enabled {
        if let Some(scheduler) = services.scheduler.clone() {
            background.push(tokio::spawn(scheduler.run()));
        }
    }

    match mode {
        UpdateMode::Webhook => {
            let bot = services.bot.clone();
            let health = state.clone();
            let url = config.webhook_url();
            let secret_token = config.webhook.secret_token.clone();
            let drop_pending = config.webhook.drop_pending_updates;
            background.push(tokio::spawn(async move {
                match bot.set_webhook(&url, &secret_token, drop_pending).await {
                    Ok(()) => health.update_health(|h| {
                        h.webhook_configured = true;
                        h.webhook_error = None;
                    }),
                    Err(e) => {
                        error!("setWebhook failed: {}", e);
                        health.update_health(|h| {
                            h.webhook_configured = false;
                            h.webhook_error = Some(e.to_string());
                        });
                    }
                }
            }));
        }
        UpdateMode::Polling => {
            let bot = services.bot.clone();
            let pipeline = services.pipeline.clone();
            let timeout = config.telegram.poll_timeout_secs;
            background.push(tokio::spawn(async move {
                bot.poll(timeout, pipeline.as_ref()).await;
            }));
        }
    }

    let served = serve(listener, state, shutdown).await;

    info!("Shutting down");
    for task in &background {
        task.abort();
    }
    services.pipeline.shutdown();
    if mode == UpdateMode::Webhook {
        if let Err(e) = services.bot.delete_webhook(false).await {
            warn!("deleteWebhook on shutdown failed: {}", e);
        }
    }

    served
}

#[cfg(test)]
mod tests {
    use super::{resolve_db_path, retry_policy_from_config, run_server, Services, DB_FILE_NAME};
    use crate::testing::temp_db_path;
    use gauguin_config::{Config, RetryPolicyConfig};
    use gauguin_providers::RetryPolicy;
    use std::path::Path;
    use tokio::net::TcpListener;

    fn config() -> Config {
        let mut config = Config::default();
        config.telegram.bot_token = "123456:secret".to_string();
        config.ai.api_key = "key".to_string();
        config.ai.model = "vision-model".to_string();
        config
    }

    #[test]
    fn db_path_defaults_to_data_dir() {
        let mut config = config();
        assert_eq!(
            resolve_db_path(&config, Path::new("/var/lib/gauguin")),
            Path::new("/var/lib/gauguin").join(DB_FILE_NAME)
        );

        config.ledger.db_path = Some("/data/ledger.sqlite".to_string());
        assert_eq!(
            resolve_db_path(&config, Path::new("/var/lib/gauguin")),
            Path::new("/data/ledger.sqlite")
        );

        config.ledger.db_path = Some("  ".to_string());
        assert_eq!(
            resolve_db_path(&config, Path::new("/tmp")),
            Path::new("/tmp").join(DB_FILE_NAME)
        );
    }

    #[test]
    fn retry_policy_merges_with_defaults() {
        let default = RetryPolicy::default();
        let merged = retry_policy_from_config(Some(&RetryPolicyConfig {
            window_secs: Some(5),
            initial_delay_secs: None,
            backoff_factor: None,
            max_delay_secs: Some(3),
        }));
        assert_eq!(merged.window_secs, 5);
        assert_eq!(merged.max_delay_secs, 3);
        assert_eq!(merged.initial_delay_secs, default.initial_delay_secs);
        assert_eq!(merged.backoff_factor, default.backoff_factor);

        let untouched = retry_policy_from_config(None);
        assert_eq!(untouched.window_secs, default.window_secs);
    }

    #[tokio::test]
    async fn services_without_ledger_have_no_scheduler() {
        let mut config = config();
        config.ledger.enabled = false;
        let services = Services::build(&config, &temp_db_path("no-ledger")).unwrap();
        assert!(services.storage.is_none());
        assert!(services.scheduler.is_none());
    }

    #[tokio::test]
    async fn services_open_ledger_database() {
        let path = temp_db_path("ledger");
        let services = Services::build(&config(), &path).unwrap();
        assert!(services.storage.is_some());
        assert!(services.scheduler.is_some());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn degraded_server_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let loaded = Err(anyhow::anyhow!("telegram.bot_token is empty"));
        run_server(loaded, Path::new("/tmp"), listener, async {})
            .await
            .unwrap();
    }
}
