//! Gauguin CLI
//!
//! AI captions for channel photos, posted as comments, plus a daily poll

mod logging;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use gauguin_config::{token_fingerprint, Config, UpdateMode, DEFAULT_LISTEN};
use gauguin_core::{resolve_db_path, run_server, update_mode_name, Services};
use gauguin_storage::Storage;
use gauguin_telegram::BotClient;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "gauguin")]
#[command(about = "Telegram channel bot: AI photo captions in comments and a daily poll", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides core.log_level; RUST_LOG wins over both)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server, poll loop and update ingestion until Ctrl-C
    Serve,

    /// Load and validate the configuration
    Check,

    /// Telegram webhook management
    Webhook {
        #[command(subcommand)]
        action: WebhookCommands,
    },

    /// Daily poll commands
    Poll {
        #[command(subcommand)]
        action: PollCommands,
    },

    /// Post counts from the ledger
    Stats {
        /// Channel id (defaults to configured channels)
        #[arg(long, allow_hyphen_values = true)]
        channel: Option<i64>,

        /// Date as YYYY-MM-DD (defaults to today in the poll timezone)
        #[arg(long)]
        date: Option<String>,
    },
}

#[derive(Subcommand)]
enum WebhookCommands {
    /// Register <public_base_url>/webhook/<path_secret> with Telegram
    Set,
    /// Remove the webhook
    Delete {
        #[arg(long)]
        drop_pending: bool,
    },
}

#[derive(Subcommand)]
enum PollCommands {
    /// Run one scheduler tick now
    Run {
        /// Ignore the publication window and the minimum post count
        #[arg(long)]
        force: bool,

        /// Only this channel
        #[arg(long, allow_hyphen_values = true)]
        channel: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let loaded = load_config(cli.config.as_deref());
            let data_dir = match &loaded {
                Ok(config) => get_data_dir(config),
                Err(_) => default_data_dir(),
            };
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("Failed to create {}", data_dir.display()))?;

            let level = resolve_log_level(cli.log_level, loaded.as_ref().ok());
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &level)?;

            let listen = loaded
                .as_ref()
                .map(|config| config.webhook.listen.clone())
                .unwrap_or_else(|_| DEFAULT_LISTEN.to_string());
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("Failed to bind {}", listen))?;

            run_server(loaded, &data_dir, listener, shutdown_signal()).await?;
        }

        Commands::Check => {
            let config = load_config(cli.config.as_deref())?;
            println!("Configuration OK");
            println!(
                "  bot token fingerprint: {}",
                token_fingerprint(&config.telegram.bot_token)
            );
            println!(
                "  update mode:           {}",
                update_mode_name(config.telegram.update_mode)
            );
            if config.telegram.update_mode == UpdateMode::Webhook {
                println!("  webhook url:           {}", redact_path_secret(&config));
                println!("  listen:                {}", config.webhook.listen);
            }
            if config.ledger.enabled {
                println!(
                    "  ledger:                {}",
                    resolve_db_path(&config, &get_data_dir(&config)).display()
                );
            } else {
                println!("  ledger:                disabled");
            }
            if config.daily_poll.enabled {
                println!(
                    "  daily poll:            {:?} {}:00-{}:00 {}",
                    config.daily_poll.channel_ids,
                    config.daily_poll.start_hour,
                    config.daily_poll.end_hour,
                    config.daily_poll.timezone
                );
            } else {
                println!("  daily poll:            disabled");
            }
        }

        Commands::Webhook { action } => {
            let config = load_config(cli.config.as_deref())?;
            let _logging_guard = logging::init_stderr_logging(&resolve_log_level(
                cli.log_level,
                Some(&config),
            ))?;
            let bot = BotClient::new(&config.telegram.bot_token, &config.telegram.api_base_url)?;
            match action {
                WebhookCommands::Set => {
                    bot.set_webhook(
                        &config.webhook_url(),
                        &config.webhook.secret_token,
                        config.webhook.drop_pending_updates,
                    )
                    .await?;
                    println!("Webhook set: {}", redact_path_secret(&config));
                }
                WebhookCommands::Delete { drop_pending } => {
                    bot.delete_webhook(drop_pending).await?;
                    println!("Webhook deleted");
                }
            }
        }

        Commands::Poll { action } => {
            let config = load_config(cli.config.as_deref())?;
            let _logging_guard = logging::init_stderr_logging(&resolve_log_level(
                cli.log_level,
                Some(&config),
            ))?;
            match action {
                PollCommands::Run { force, channel } => {
                    let data_dir = get_data_dir(&config);
                    let services = Services::build(&config, &resolve_db_path(&config, &data_dir))?;
                    let scheduler = services
                        .scheduler
                        .context("Daily polls need the ledger (ledger.enabled = true)")?;
                    info!(force = force, channel = ?channel, "Running daily poll tick");
                    let outcome = scheduler.run_once(Utc::now(), force, channel).await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
            }
        }

        Commands::Stats { channel, date } => {
            let config = load_config(cli.config.as_deref())?;
            if !config.ledger.enabled {
                anyhow::bail!("Ledger is disabled (ledger.enabled = false)");
            }
            let db_path = resolve_db_path(&config, &get_data_dir(&config));
            let storage = Storage::new(&db_path)
                .with_context(|| format!("Failed to open ledger at {}", db_path.display()))?;

            let date = match date {
                Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                    .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", raw))?,
                None => Utc::now()
                    .with_timezone(&config.daily_poll.tz()?)
                    .date_naive(),
            };

            let channels = stats_channels(&config, channel);
            if channels.is_empty() {
                anyhow::bail!("No channel given and none configured; use --channel");
            }
            for channel_id in channels {
                let posts = storage.count_posts_for_date(channel_id, date)?;
                let poll = match storage.get_daily_poll(channel_id, date)? {
                    Some(poll) if poll.posted_at.is_some() => "posted".to_string(),
                    Some(poll) if poll.skipped_at.is_some() => "skipped".to_string(),
                    Some(poll) => format!("scheduled at {}", poll.scheduled_at),
                    None => "none".to_string(),
                };
                println!("{}  {}  posts: {}  poll: {}", date, channel_id, posts, poll);
            }
        }
    }

    Ok(())
}

/// Explicit path, then the default config file if present, then env vars only.
fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        return Config::load(path).with_context(|| format!("Failed to load config {}", path));
    }
    match Config::default_path().filter(|path| path.exists()) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Config::from_env().context("No config file found and env config is incomplete"),
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gauguin")
}

fn get_data_dir(config: &Config) -> PathBuf {
    match config.core.data_dir.as_deref() {
        Some("~") => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        Some(dir) if dir.starts_with("~/") => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(dir.trim_start_matches("~/")),
        Some(dir) => Path::new(dir).to_path_buf(),
        None => default_data_dir(),
    }
}

fn resolve_log_level(flag: Option<String>, config: Option<&Config>) -> String {
    flag.or_else(|| config.and_then(|c| c.core.log_level.clone()))
        .unwrap_or_else(|| "info".to_string())
}

fn redact_path_secret(config: &Config) -> String {
    format!(
        "{}/webhook/<path_secret>",
        config.webhook.public_base_url.trim_end_matches('/')
    )
}

fn stats_channels(config: &Config, explicit: Option<i64>) -> Vec<i64> {
    if let Some(channel_id) = explicit {
        return vec![channel_id];
    }
    let mut channels: Vec<i64> = config.daily_poll.channel_ids.clone();
    if let Some(allowed) = config.telegram.allowed_channel_id {
        if !channels.contains(&allowed) {
            channels.push(allowed);
        }
    }
    channels
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl-C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                info!("Received Ctrl-C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received Ctrl-C");
    }
}
