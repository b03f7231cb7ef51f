//! Gauguin Configuration
//!
//! TOML configuration loading with environment variable overrides for secrets

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const DEFAULT_AI_BASE_URL: &str = "https://api.timeweb.cloud";
pub const DEFAULT_AI_CHAT_PATH: &str = "/v1/chat/completions";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub caption: CaptionConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub daily_poll: DailyPollConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    #[default]
    Webhook,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionLookup {
    /// Wait for the auto-forward to show up in the linked group.
    #[default]
    Rendezvous,
    /// Ask the Bot API server for the discussion message directly.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_telegram_api_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub allowed_channel_id: Option<i64>,
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default)]
    pub discussion_lookup: DiscussionLookup,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base_url: default_telegram_api_url(),
            allowed_channel_id: None,
            update_mode: UpdateMode::default(),
            poll_timeout_secs: default_poll_timeout_secs(),
            discussion_lookup: DiscussionLookup::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default)]
    pub path_secret: String,
    #[serde(default)]
    pub secret_token: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_true")]
    pub drop_pending_updates: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            public_base_url: String::new(),
            path_secret: String::new(),
            secret_token: String::new(),
            listen: default_listen(),
            drop_pending_updates: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_ai_base_url")]
    pub base_url: String,
    #[serde(default = "default_ai_chat_path")]
    pub chat_path: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_true")]
    pub send_image: bool,
    pub retry: Option<RetryPolicyConfig>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: default_ai_base_url(),
            chat_path: default_ai_chat_path(),
            api_key: String::new(),
            model: String::new(),
            timeout_secs: default_ai_timeout_secs(),
            temperature: None,
            send_image: true,
            retry: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub window_secs: Option<u64>,
    pub initial_delay_secs: Option<u64>,
    pub backoff_factor: Option<u32>,
    pub max_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionConfig {
    #[serde(default = "default_caption_language")]
    pub language: String,
    #[serde(default = "default_caption_max_chars")]
    pub max_chars: usize,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            language: default_caption_language(),
            max_chars: default_caption_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `<data_dir>/gauguin.db`.
    pub db_path: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPollConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub channel_ids: Vec<i64>,
    #[serde(default = "default_poll_timezone")]
    pub timezone: String,
    #[serde(default = "default_poll_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_poll_end_hour")]
    pub end_hour: u32,
    #[serde(default = "default_poll_min_posts")]
    pub min_posts: u32,
    #[serde(default = "default_poll_options_count")]
    pub options_count: usize,
    /// Telegram accepts 5..=600; `None` keeps the poll open.
    #[serde(default)]
    pub open_period_secs: Option<u32>,
    #[serde(default = "default_poll_questions")]
    pub questions: Vec<String>,
    #[serde(default = "default_poll_tick_secs")]
    pub tick_secs: u64,
}

impl Default for DailyPollConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_ids: Vec::new(),
            timezone: default_poll_timezone(),
            start_hour: default_poll_start_hour(),
            end_hour: default_poll_end_hour(),
            min_posts: default_poll_min_posts(),
            options_count: default_poll_options_count(),
            open_period_secs: None,
            questions: default_poll_questions(),
            tick_secs: default_poll_tick_secs(),
        }
    }
}

impl DailyPollConfig {
    pub fn is_poll_channel(&self, channel_id: i64) -> bool {
        self.enabled && self.channel_ids.contains(&channel_id)
    }

    pub fn tz(&self) -> anyhow::Result<chrono_tz::Tz> {
        self.timezone
            .trim()
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("Unknown daily_poll.timezone '{}': {}", self.timezone, e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    /// Bearer token for `/admin/*`. Admin routes are disabled when unset.
    pub token: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_telegram_api_url() -> String {
    DEFAULT_TELEGRAM_API_URL.to_string()
}

fn default_poll_timeout_secs() -> u64 {
    50
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_ai_base_url() -> String {
    DEFAULT_AI_BASE_URL.to_string()
}

fn default_ai_chat_path() -> String {
    DEFAULT_AI_CHAT_PATH.to_string()
}

fn default_ai_timeout_secs() -> u64 {
    30
}

fn default_caption_language() -> String {
    "ru".to_string()
}

fn default_caption_max_chars() -> usize {
    400
}

fn default_retention_days() -> u32 {
    30
}

fn default_poll_timezone() -> String {
    "Europe/Moscow".to_string()
}

fn default_poll_start_hour() -> u32 {
    9
}

fn default_poll_end_hour() -> u32 {
    21
}

fn default_poll_min_posts() -> u32 {
    3
}

fn default_poll_options_count() -> usize {
    4
}

fn default_poll_tick_secs() -> u64 {
    60
}

fn default_poll_questions() -> Vec<String> {
    vec![
        "Что здесь на самом деле происходит?".to_string(),
        "Как бы вы подписали эту картинку?".to_string(),
        "Что было через минуту после этого кадра?".to_string(),
        "О чём думает главный герой?".to_string(),
    ]
}

/// Strips whitespace and one pair of matching quotes; deploy panels tend to add both.
pub fn normalize_bot_token(raw: &str) -> String {
    let token = raw.trim();
    let unquoted = token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .or_else(|| token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
        .unwrap_or(token);
    unquoted.trim().to_string()
}

/// First 12 hex chars of SHA-256, safe to log.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest
        .iter()
        .take(6)
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Config made of env vars only, for container deployments without a file.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gauguin").join("config.toml"))
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(v) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Some(v) = get("TELEGRAM_ALLOWED_CHANNEL_ID").and_then(|v| v.parse().ok()) {
            self.telegram.allowed_channel_id = Some(v);
        }
        if let Some(v) = get("PUBLIC_BASE_URL") {
            self.webhook.public_base_url = v;
        }
        if let Some(v) = get("TELEGRAM_WEBHOOK_PATH_SECRET") {
            self.webhook.path_secret = v;
        }
        if let Some(v) = get("TELEGRAM_WEBHOOK_SECRET_TOKEN") {
            self.webhook.secret_token = v;
        }
        if let Some(v) = get("AI_API_KEY") {
            self.ai.api_key = v;
        }
        if let Some(v) = get("AI_MODEL") {
            self.ai.model = v;
        }
        if let Some(v) = get("AI_BASE_URL") {
            self.ai.base_url = v;
        }
        if let Some(v) = get("GAUGUIN_ADMIN_TOKEN") {
            self.admin.token = Some(v);
        }
        if let Some(v) = get("DATABASE_PATH") {
            self.ledger.db_path = Some(v);
        }

        self.telegram.bot_token = normalize_bot_token(&self.telegram.bot_token);
    }

    pub fn webhook_url(&self) -> String {
        format!(
            "{}/webhook/{}",
            self.webhook.public_base_url.trim_end_matches('/'),
            self.webhook.path_secret
        )
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token is empty (set TELEGRAM_BOT_TOKEN)");
        }
        if !self.telegram.bot_token.contains(':') {
            anyhow::bail!("telegram.bot_token does not look like a Bot API token");
        }

        if self.telegram.update_mode == UpdateMode::Webhook {
            if self.webhook.public_base_url.trim().is_empty() {
                anyhow::bail!("webhook.public_base_url is required in webhook mode");
            }
            if self.webhook.path_secret.trim().is_empty() {
                anyhow::bail!("webhook.path_secret is required in webhook mode");
            }
            if self.webhook.secret_token.trim().is_empty() {
                anyhow::bail!("webhook.secret_token is required in webhook mode");
            }
        }

        if self.ai.api_key.trim().is_empty() {
            anyhow::bail!("ai.api_key is empty (set AI_API_KEY)");
        }
        if self.ai.model.trim().is_empty() {
            anyhow::bail!("ai.model is empty (set AI_MODEL)");
        }
        if self.caption.max_chars == 0 {
            anyhow::bail!("caption.max_chars must be positive");
        }

        let poll = &self.daily_poll;
        if poll.start_hour > 24 || poll.end_hour > 24 {
            anyhow::bail!(
                "daily_poll hours must be within 0..=24 (got {}..{})",
                poll.start_hour,
                poll.end_hour
            );
        }
        if poll.start_hour >= poll.end_hour {
            anyhow::bail!(
                "daily_poll.start_hour ({}) must be before end_hour ({})",
                poll.start_hour,
                poll.end_hour
            );
        }
        poll.tz()?;
        if !(2..=4).contains(&poll.options_count) {
            anyhow::bail!(
                "daily_poll.options_count must be within 2..=4 (got {})",
                poll.options_count
            );
        }
        if let Some(period) = poll.open_period_secs {
            if !(5..=600).contains(&period) {
                anyhow::bail!(
                    "daily_poll.open_period_secs must be within 5..=600 (got {})",
                    period
                );
            }
        }
        if poll.tick_secs == 0 {
            anyhow::bail!("daily_poll.tick_secs must be positive");
        }

        if poll.enabled {
            if !self.ledger.enabled {
                anyhow::bail!("daily_poll requires the ledger to be enabled");
            }
            if poll.questions.is_empty() {
                anyhow::bail!("daily_poll.questions cannot be empty");
            }
            if let Some(idx) = poll.questions.iter().position(|q| q.trim().is_empty()) {
                anyhow::bail!("daily_poll.questions[{}] is blank", idx);
            }
            let mut seen = HashSet::new();
            for channel_id in &poll.channel_ids {
                if !seen.insert(*channel_id) {
                    anyhow::bail!("Duplicate daily_poll channel id {}", channel_id);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_bot_token, token_fingerprint, Config, DiscussionLookup, UpdateMode};
    use std::collections::HashMap;

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    const MINIMAL: &str = r#"
[telegram]
bot_token = "123456:ABC"

[webhook]
public_base_url = "https://bot.example.com/"
path_secret = "p4th"
secret_token = "s3cret"

[ai]
api_key = "k"
model = "gpt-4o-mini"
"#;

    #[test]
    fn validate_accepts_minimal_webhook_config() {
        let cfg = parse_config(MINIMAL);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.telegram.update_mode, UpdateMode::Webhook);
        assert_eq!(cfg.telegram.discussion_lookup, DiscussionLookup::Rendezvous);
        assert_eq!(cfg.caption.max_chars, 400);
        assert_eq!(cfg.ledger.retention_days, 30);
    }

    #[test]
    fn webhook_url_joins_base_without_double_slash() {
        let cfg = parse_config(MINIMAL);
        assert_eq!(cfg.webhook_url(), "https://bot.example.com/webhook/p4th");
    }

    #[test]
    fn validate_rejects_webhook_mode_without_secret_token() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123456:ABC"

[webhook]
public_base_url = "https://bot.example.com"
path_secret = "p"

[ai]
api_key = "k"
model = "m"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_polling_mode_without_webhook_section() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123456:ABC"
update_mode = "polling"

[ai]
api_key = "k"
model = "m"
"#,
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_poll_window() {
        let mut cfg = parse_config(MINIMAL);
        cfg.daily_poll.start_hour = 21;
        cfg.daily_poll.end_hour = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_timezone() {
        let mut cfg = parse_config(MINIMAL);
        cfg.daily_poll.timezone = "Mars/Olympus".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_options_count() {
        let mut cfg = parse_config(MINIMAL);
        cfg.daily_poll.options_count = 5;
        assert!(cfg.validate().is_err());
        cfg.daily_poll.options_count = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_polls_without_ledger() {
        let mut cfg = parse_config(MINIMAL);
        cfg.daily_poll.enabled = true;
        cfg.daily_poll.channel_ids = vec![-100];
        cfg.ledger.enabled = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_replace_secrets_and_normalize_token() {
        let mut cfg = parse_config(MINIMAL);
        let env: HashMap<&str, &str> = HashMap::from([
            ("TELEGRAM_BOT_TOKEN", "  \"999:XYZ\"  "),
            ("TELEGRAM_ALLOWED_CHANNEL_ID", "-1001234"),
            ("AI_API_KEY", "env-key"),
            ("GAUGUIN_ADMIN_TOKEN", "adm"),
            ("AI_MODEL", "   "),
        ]);
        cfg.apply_env_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.telegram.bot_token, "999:XYZ");
        assert_eq!(cfg.telegram.allowed_channel_id, Some(-1001234));
        assert_eq!(cfg.ai.api_key, "env-key");
        assert_eq!(cfg.ai.model, "gpt-4o-mini");
        assert_eq!(cfg.admin.token.as_deref(), Some("adm"));
    }

    #[test]
    fn normalize_bot_token_strips_single_quotes() {
        assert_eq!(normalize_bot_token(" '1:abc' "), "1:abc");
        assert_eq!(normalize_bot_token("1:abc"), "1:abc");
        assert_eq!(normalize_bot_token("\"1:abc'"), "\"1:abc'");
    }

    #[test]
    fn token_fingerprint_is_twelve_hex_chars() {
        let fp = token_fingerprint("123456:ABC");
        assert_eq!(fp.len(), 12);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(fp, token_fingerprint("123456:ABD"));
    }

    #[test]
    fn poll_channel_requires_enabled_flag() {
        let mut cfg = parse_config(MINIMAL);
        cfg.daily_poll.channel_ids = vec![-100];
        assert!(!cfg.daily_poll.is_poll_channel(-100));
        cfg.daily_poll.enabled = true;
        assert!(cfg.daily_poll.is_poll_channel(-100));
        assert!(!cfg.daily_poll.is_poll_channel(-200));
    }

    #[test]
    fn validate_rejects_blank_poll_question() {
        let mut cfg = parse_config(MINIMAL);
        cfg.daily_poll.enabled = true;
        cfg.daily_poll.channel_ids = vec![-100];
        cfg.daily_poll.questions = vec!["Что здесь происходит?".to_string()];
        assert!(cfg.validate().is_ok());

        cfg.daily_poll.questions = vec!["".to_string(), "Что здесь происходит?".to_string()];
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("questions[0]"), "unexpected error: {}", err);

        cfg.daily_poll.questions.clear();
        assert!(cfg.validate().is_err());
    }
}
