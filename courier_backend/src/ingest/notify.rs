//! Alerts for keyword hits, posted by a bot to a short list of chats.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::transport::{post_bot_message, SendError};

/// Snippet length, in characters, quoted in an alert.
const SNIPPET_CHARS: usize = 300;

#[async_trait]
pub trait HitNotifier: Send + Sync {
    /// Deliver `text` (Telegram HTML) to every target. Failures are logged,
    /// never returned.
    async fn notify(&self, text: &str);
}

/// Accepts `@name`, `name`, `https://t.me/name` or a numeric chat id.
/// Returns the Bot API `chat_id` form, or `None` for blank input.
pub fn normalize_target(raw: &str) -> Option<String> {
    let mut target = raw.trim();
    for prefix in ["https://t.me/", "http://t.me/", "t.me/"] {
        if let Some(rest) = target.strip_prefix(prefix) {
            target = rest.trim().trim_matches('/');
            break;
        }
    }
    let target = target.trim_start_matches('@');
    if target.is_empty() {
        return None;
    }

    let digits = target.strip_prefix('-').unwrap_or(target);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return Some(target.to_string());
    }
    Some(format!("@{}", target))
}

/// Normalize and de-duplicate, keeping first-seen order.
pub fn normalize_targets<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for target in raw.iter().filter_map(|t| normalize_target(t.as_ref())) {
        if !out.contains(&target) {
            out.push(target);
        }
    }
    out
}

/// The facts shown in one keyword alert.
#[derive(Debug, Clone)]
pub struct KeywordAlert<'a> {
    pub chat: &'a str,
    pub topic: Option<&'a str>,
    pub sender: &'a str,
    pub link: Option<&'a str>,
    pub text: &'a str,
    pub at: DateTime<Utc>,
}

impl KeywordAlert<'_> {
    pub fn render(&self) -> String {
        let mut snippet: String = self.text.chars().take(SNIPPET_CHARS).collect();
        if self.text.chars().count() > SNIPPET_CHARS {
            snippet.push('…');
        }
        format!(
            "<b>[kw] New keyword hit</b>\n\
             <b>Chat:</b> {}\n\
             <b>Topic:</b> {}\n\
             <b>Sender:</b> {}\n\
             <b>Time:</b> {}\n\
             <b>Link:</b> {}\n\
             \n<code>{}</code>",
            escape_html(self.chat),
            escape_html(self.topic.unwrap_or("—")),
            escape_html(self.sender),
            self.at.to_rfc3339_opts(SecondsFormat::Secs, true),
            escape_html(self.link.unwrap_or("—")),
            escape_html(&snippet),
        )
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Posts alerts through a Telegram bot. A target the API reports as
/// unknown is dropped for the rest of the run.
pub struct BotNotifier {
    send_url: String,
    client: reqwest::Client,
    targets: Mutex<Vec<String>>,
}

impl BotNotifier {
    pub fn new(api_base: &str, token: &str, targets: Vec<String>, proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(20));
        if let Some(proxy_url) = proxy.map(str::trim).filter(|p| !p.is_empty()) {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy_url)
                    .with_context(|| format!("Invalid proxy URL {}", proxy_url))?,
            );
        }
        Ok(Self {
            send_url: format!(
                "{}/bot{}/sendMessage",
                api_base.trim_end_matches('/'),
                token.trim()
            ),
            client: builder.build().context("Failed to build HTTP client")?,
            targets: Mutex::new(targets),
        })
    }

    pub fn targets(&self) -> Vec<String> {
        self.targets
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn drop_targets(&self, dropped: &[String]) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.retain(|t| !dropped.contains(t));
            tracing::info!("[KW-NOTIFY] Remaining targets: {:?}", *targets);
        }
    }
}

#[async_trait]
impl HitNotifier for BotNotifier {
    async fn notify(&self, text: &str) {
        let mut dropped = Vec::new();
        for target in self.targets() {
            let payload = serde_json::json!({
                "chat_id": target,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            });
            match post_bot_message(&self.client, &self.send_url, &payload).await {
                Ok(()) => {}
                Err(SendError::RecipientNotFound(detail)) => {
                    tracing::warn!("[KW-NOTIFY] Dropping unknown target {}: {}", target, detail);
                    dropped.push(target);
                }
                Err(e) => tracing::warn!("[KW-NOTIFY] Failed to notify {}: {}", target, e),
            }
        }
        if !dropped.is_empty() {
            self.drop_targets(&dropped);
        }
    }
}
