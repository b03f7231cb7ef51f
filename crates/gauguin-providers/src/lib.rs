//! Gauguin Providers
//!
//! OpenAI-compatible vision client that writes captions and poll options for photos

pub mod extract;

use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

pub use extract::{clean_caption, extract_text, parse_poll_options};

const CAPTION_ATTEMPTS: u32 = 2;
const POLL_OPTION_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("AI request failed: {0}")]
    Transport(String),
    #[error("AI response decode failed: {0}")]
    Decode(String),
    #[error("AI returned an empty response")]
    EmptyResponse,
    #[error("AI returned {got} usable poll options, need at least 2")]
    InsufficientOptions { got: usize },
}

/// The captioning capability consumed by the caption pipeline and the poll scheduler.
#[async_trait::async_trait]
pub trait CaptionGenerator: Send + Sync {
    async fn generate_caption(
        &self,
        image_bytes: &[u8],
        context: Option<&str>,
    ) -> Result<String, AiError>;

    async fn generate_poll_options(
        &self,
        image_bytes: &[u8],
        question: &str,
        count: usize,
    ) -> Result<Vec<String>, AiError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub window_secs: u64,
    pub initial_delay_secs: u64,
    pub backoff_factor: u32,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            window_secs: 60,
            initial_delay_secs: 2,
            backoff_factor: 2,
            max_delay_secs: 15,
        }
    }
}

pub struct AiClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    send_image: bool,
    language: String,
    caption_max_chars: usize,
    retry_policy: RetryPolicy,
}

pub fn guess_mime(image_bytes: &[u8]) -> &'static str {
    if image_bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if image_bytes.starts_with(b"\xff\xd8") {
        "image/jpeg"
    } else if image_bytes.len() >= 12 && &image_bytes[..4] == b"RIFF" && &image_bytes[8..12] == b"WEBP"
    {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

impl AiClient {
    pub fn new(api_key: String, base_url: &str, chat_path: &str, model: String) -> Self {
        let endpoint = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            chat_path.trim_start_matches('/')
        );
        Self {
            client: Client::new(),
            endpoint,
            api_key,
            model,
            temperature: None,
            send_image: true,
            language: "ru".to_string(),
            caption_max_chars: 400,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| Client::new());
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_send_image(mut self, send_image: bool) -> Self {
        self.send_image = send_image;
        self
    }

    pub fn with_caption_style(mut self, language: &str, max_chars: usize) -> Self {
        self.language = language.trim().to_lowercase();
        self.caption_max_chars = max_chars.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn is_russian(&self) -> bool {
        self.language == "ru"
    }

    fn caption_prompts(&self, context: Option<&str>) -> (String, String) {
        let context = context.map(str::trim).filter(|c| !c.is_empty());
        if self.is_russian() {
            let system = "Ты остроумный русскоязычный автор подписей к картинкам. \
                Смешно, но без токсичности, оскорблений и политики. \
                Никаких лишних слов, только готовая подпись."
                .to_string();
            let mut user = "Придумай одну короткую смешную подпись (до 120 символов) к картинке. \
                Верни только подпись, без кавычек, без хэштегов, без объяснений."
                .to_string();
            if let Some(ctx) = context {
                user.push_str("\nКонтекст/подпись автора поста: ");
                user.push_str(ctx);
            }
            (system, user)
        } else {
            let system = format!(
                "You are a witty caption writer. Be funny without toxicity, insults or politics. \
                 Reply in language '{}' with the caption only.",
                self.language
            );
            let mut user = "Write one short funny caption (up to 120 characters) for this picture. \
                Return only the caption: no quotes, no hashtags, no explanations."
                .to_string();
            if let Some(ctx) = context {
                user.push_str("\nPost author's caption/context: ");
                user.push_str(ctx);
            }
            (system, user)
        }
    }

    fn poll_prompts(&self, question: &str, count: usize) -> (String, String) {
        if self.is_russian() {
            (
                "Ты придумываешь смешные варианты ответов для опросов в телеграм-канале. \
                 Без токсичности и политики."
                    .to_string(),
                format!(
                    "Вопрос опроса к картинке: «{}». Придумай {} коротких смешных варианта ответа \
                     (до 60 символов каждый). Каждый вариант с новой строки, без нумерации, \
                     без кавычек, без пояснений.",
                    question, count
                ),
            )
        } else {
            (
                format!(
                    "You write funny answer options for Telegram channel polls. \
                     No toxicity or politics. Reply in language '{}'.",
                    self.language
                ),
                format!(
                    "Poll question about the picture: \"{}\". Write {} short funny answer options \
                     (up to 60 characters each). One option per line, no numbering, no quotes, \
                     no explanations.",
                    question, count
                ),
            )
        }
    }

    fn build_body(
        &self,
        system: &str,
        user: &str,
        image_bytes: &[u8],
        max_tokens: u32,
    ) -> serde_json::Value {
        let user_content = if self.send_image {
            let image_data = format!(
                "data:{};base64,{}",
                guess_mime(image_bytes),
                base64::engine::general_purpose::STANDARD.encode(image_bytes)
            );
            serde_json::json!([
                { "type": "text", "text": user },
                { "type": "image_url", "image_url": { "url": image_data } }
            ])
        } else {
            serde_json::json!(user)
        };

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user_content }
            ],
            "max_tokens": max_tokens,
        });
        body["temperature"] = serde_json::json!(self.temperature.unwrap_or(0.9));
        body
    }

    async fn request_text(&self, body: &serde_json::Value) -> Result<String, AiError> {
        let start = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            let response = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            let (status, headers, raw_body) = match response {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let raw_body = response
                        .text()
                        .await
                        .map_err(|e| AiError::Transport(e.without_url().to_string()))?;
                    (status, headers, raw_body)
                }
                Err(err) => {
                    if !Self::is_retryable_reqwest(&err) {
                        return Err(AiError::Transport(err.without_url().to_string()));
                    }
                    match Self::next_retry_delay(
                        &self.retry_policy,
                        attempt,
                        &HeaderMap::new(),
                        start.elapsed(),
                    ) {
                        Some(delay) => {
                            tracing::warn!(
                                model = %self.model,
                                attempt = attempt,
                                delay_ms = delay.as_millis(),
                                error = %err.without_url(),
                                "Retrying AI request after transient network error"
                            );
                            sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        None => return Err(AiError::Transport(err.without_url().to_string())),
                    }
                }
            };

            if status.is_success() {
                let parsed: serde_json::Value = serde_json::from_str(&raw_body).map_err(|e| {
                    AiError::Decode(format!(
                        "{} | body={}",
                        e,
                        truncate_for_error(&raw_body, 500)
                    ))
                })?;
                if let Some(error) = parsed.get("error") {
                    return Err(AiError::Decode(format!(
                        "API error: {}",
                        truncate_for_error(&error.to_string(), 500)
                    )));
                }
                return extract_text(&parsed).ok_or(AiError::EmptyResponse);
            }

            let err = AiError::Http {
                status: status.as_u16(),
                body: truncate_for_error(&raw_body, 500),
            };
            if !Self::is_retryable_status(status.as_u16()) {
                return Err(err);
            }
            match Self::next_retry_delay(&self.retry_policy, attempt, &headers, start.elapsed()) {
                Some(delay) => {
                    tracing::warn!(
                        model = %self.model,
                        status = %status.as_u16(),
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        "Retrying AI request after transient HTTP error"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            }
        }
    }

    fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
    }

    fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect()
    }

    fn next_retry_delay(
        policy: &RetryPolicy,
        attempt: u32,
        headers: &HeaderMap,
        elapsed: Duration,
    ) -> Option<Duration> {
        let window = Duration::from_secs(policy.window_secs.max(1));
        let remaining = window.checked_sub(elapsed).filter(|r| !r.is_zero())?;

        let delay = Self::parse_retry_after_headers(headers)
            .unwrap_or_else(|| Self::exponential_delay(policy, attempt))
            .min(remaining);

        Some(delay.max(Duration::from_millis(1)))
    }

    fn exponential_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let initial = policy.initial_delay_secs.max(1);
        let factor = u64::from(policy.backoff_factor.max(1));
        let exponent = attempt.saturating_sub(1).min(20);
        let secs = initial
            .saturating_mul(factor.saturating_pow(exponent))
            .min(policy.max_delay_secs.max(1));
        Duration::from_secs(secs)
    }

    fn parse_retry_after_headers(headers: &HeaderMap) -> Option<Duration> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        if let Some(ms) = header("retry-after-ms").and_then(|v| v.parse::<u64>().ok()) {
            if ms > 0 {
                return Some(Duration::from_millis(ms));
            }
        }

        let value = header("retry-after")?;
        if let Ok(secs) = value.parse::<u64>() {
            return (secs > 0).then(|| Duration::from_secs(secs));
        }

        let target = DateTime::parse_from_rfc2822(&value).ok()?.with_timezone(&Utc);
        let millis = (target - Utc::now()).num_milliseconds();
        (millis > 0).then(|| Duration::from_millis(millis as u64))
    }
}

#[async_trait::async_trait]
impl CaptionGenerator for AiClient {
    async fn generate_caption(
        &self,
        image_bytes: &[u8],
        context: Option<&str>,
    ) -> Result<String, AiError> {
        let (system, user) = self.caption_prompts(context);
        let body = self.build_body(&system, &user, image_bytes, 80);

        let mut last_err = AiError::EmptyResponse;
        for attempt in 1..=CAPTION_ATTEMPTS {
            match self.request_text(&body).await {
                Ok(text) => {
                    let caption = clean_caption(&text, self.caption_max_chars);
                    if !caption.is_empty() {
                        return Ok(caption);
                    }
                    last_err = AiError::EmptyResponse;
                }
                Err(AiError::EmptyResponse) => last_err = AiError::EmptyResponse,
                Err(err) => return Err(err),
            }
            tracing::warn!(attempt = attempt, "AI returned an empty caption");
        }
        Err(last_err)
    }

    async fn generate_poll_options(
        &self,
        image_bytes: &[u8],
        question: &str,
        count: usize,
    ) -> Result<Vec<String>, AiError> {
        let count = count.clamp(2, 4);
        let (system, user) = self.poll_prompts(question, count);
        let body = self.build_body(&system, &user, image_bytes, 200);

        let mut best = 0;
        for attempt in 1..=POLL_OPTION_ATTEMPTS {
            let options = match self.request_text(&body).await {
                Ok(text) => parse_poll_options(&text, count),
                Err(AiError::EmptyResponse) => Vec::new(),
                Err(err) => return Err(err),
            };
            if options.len() >= 2 {
                return Ok(options);
            }
            best = best.max(options.len());
            tracing::warn!(
                attempt = attempt,
                got = options.len(),
                "AI returned too few poll options"
            );
        }
        Err(AiError::InsufficientOptions { got: best })
    }
}
