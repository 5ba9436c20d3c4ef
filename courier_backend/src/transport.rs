//! Outbound send transports and the failure taxonomy for send attempts.
//!
//! A transport owns whatever connection state an identity needs. The
//! supervisor opens every identity before dispatch starts and closes them on
//! every exit path.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;

/// Telegram rejects messages longer than this many characters.
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("recipient does not exist: {0}")]
    RecipientNotFound(String),
    #[error("recipient privacy settings forbid the message: {0}")]
    PrivacyRestricted(String),
    #[error("recipient blocked this identity: {0}")]
    RecipientBlocked(String),
    #[error("request rejected: {0}")]
    InvalidRequest(String),
    #[error("identity is flood-restricted: {0}")]
    PeerFlood(String),
    #[error("flood wait of {seconds}s")]
    FloodWait { seconds: u64 },
    #[error("identity not authorized: {0}")]
    Unauthorized(String),
    #[error("transient transport failure: {0}")]
    Transient(String),
}

/// What the dispatcher does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Drop the recipient from this flow for good.
    Permanent,
    /// Requeue the recipient and rest the identity for `cooldown`.
    Temporary { cooldown: Duration },
}

/// Identity cooldowns applied on temporary failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub flood: Duration,
    pub transient: Duration,
    pub flood_wait_padding: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            flood: Duration::hours(6),
            transient: Duration::minutes(5),
            flood_wait_padding: Duration::seconds(2),
        }
    }
}

impl SendError {
    pub fn disposition(&self, policy: &CooldownPolicy) -> FailureDisposition {
        match self {
            SendError::RecipientNotFound(_)
            | SendError::PrivacyRestricted(_)
            | SendError::RecipientBlocked(_)
            | SendError::InvalidRequest(_) => FailureDisposition::Permanent,
            SendError::PeerFlood(_) | SendError::Unauthorized(_) => FailureDisposition::Temporary {
                cooldown: policy.flood,
            },
            // A wait too large for a Duration rests the identity like a flood ban.
            SendError::FloodWait { seconds } => FailureDisposition::Temporary {
                cooldown: i64::try_from(*seconds)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|wait| wait.checked_add(&policy.flood_wait_padding))
                    .unwrap_or(policy.flood),
            },
            SendError::Transient(_) => FailureDisposition::Temporary {
                cooldown: policy.transient,
            },
        }
    }
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the session for `session`. Failing sessions are left out
    /// of the identity pool.
    async fn open(&self, session: &str) -> Result<()>;

    async fn send(&self, session: &str, recipient: &str, text: &str) -> Result<(), SendError>;

    async fn close(&self, session: &str);
}

/// Logs what would be sent and always succeeds.
#[derive(Debug, Default)]
pub struct DryRunTransport;

#[async_trait]
impl SendTransport for DryRunTransport {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn open(&self, session: &str) -> Result<()> {
        tracing::info!("[DRY-RUN] session ready: {}", session);
        Ok(())
    }

    async fn send(&self, session: &str, recipient: &str, text: &str) -> Result<(), SendError> {
        let preview: String = text.chars().take(80).collect();
        tracing::info!(
            "[DRY-RUN] would send to {} via {}: {:?}",
            recipient,
            session,
            preview
        );
        Ok(())
    }

    async fn close(&self, session: &str) {
        tracing::debug!("[DRY-RUN] session closed: {}", session);
    }
}

// ─── Telegram Bot API ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Sends through the Telegram Bot API, one bot token per identity.
pub struct TelegramBotTransport {
    api_base: String,
    tokens: HashMap<String, String>,
    client: reqwest::Client,
}

impl TelegramBotTransport {
    pub fn new(api_base: &str, tokens: HashMap<String, String>, proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(StdDuration::from_secs(40));
        if let Some(proxy_url) = proxy.map(str::trim).filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("Invalid proxy URL {}", proxy_url))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            tokens,
            client,
        })
    }

    fn method_url(&self, session: &str, method: &str) -> Option<String> {
        self.tokens
            .get(session)
            .map(|token| format!("{}/bot{}/{}", self.api_base, token, method))
    }
}

#[async_trait]
impl SendTransport for TelegramBotTransport {
    fn name(&self) -> &str {
        "telegram_bot"
    }

    async fn open(&self, session: &str) -> Result<()> {
        let url = self
            .method_url(session, "getMe")
            .ok_or_else(|| anyhow::anyhow!("No bot token configured for session {}", session))?;

        let body: TelegramResponse = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("getMe failed for session {}", session))?
            .json()
            .await
            .with_context(|| format!("getMe returned unparseable body for session {}", session))?;

        if !body.ok {
            anyhow::bail!(
                "getMe rejected session {}: {}",
                session,
                body.description.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn send(&self, session: &str, recipient: &str, text: &str) -> Result<(), SendError> {
        let url = self
            .method_url(session, "sendMessage")
            .ok_or_else(|| SendError::Unauthorized(format!("no token for session {}", session)))?;

        let text: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        let payload = serde_json::json!({ "chat_id": recipient, "text": text });
        post_bot_message(&self.client, &url, &payload).await
    }

    async fn close(&self, session: &str) {
        tracing::debug!("Telegram session released: {}", session);
    }
}

/// POST a Bot API message call and map any rejection onto [`SendError`].
pub(crate) async fn post_bot_message(
    client: &reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
) -> Result<(), SendError> {
    let resp = client
        .post(url)
        .json(payload)
        .send()
        .await
        .map_err(|e| SendError::Transient(e.to_string()))?;

    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<TelegramResponse>(&body).ok();

    if (200..300).contains(&status) && parsed.as_ref().map_or(true, |r| r.ok) {
        return Ok(());
    }

    let (description, retry_after) = match parsed {
        Some(r) => (
            r.description.unwrap_or_default(),
            r.parameters.and_then(|p| p.retry_after),
        ),
        None => (body.chars().take(200).collect(), None),
    };
    Err(classify_api_error(status, &description, retry_after))
}

/// Map a Bot API error response onto the send failure taxonomy.
pub fn classify_api_error(status: u16, description: &str, retry_after: Option<u64>) -> SendError {
    let desc = description.to_ascii_lowercase();
    let detail = description.to_string();

    if status == 429 || retry_after.is_some() {
        return SendError::FloodWait {
            seconds: retry_after.unwrap_or(60),
        };
    }
    if desc.contains("peer_flood") {
        return SendError::PeerFlood(detail);
    }

    match status {
        401 => SendError::Unauthorized(detail),
        403 if desc.contains("deactivated") => SendError::RecipientNotFound(detail),
        403 if desc.contains("blocked") => SendError::RecipientBlocked(detail),
        403 => SendError::PrivacyRestricted(detail),
        400 if desc.contains("chat not found")
            || desc.contains("user not found")
            || desc.contains("username_not_occupied")
            || desc.contains("peer_id_invalid") =>
        {
            SendError::RecipientNotFound(detail)
        }
        400 if desc.contains("privacy") => SendError::PrivacyRestricted(detail),
        400 => SendError::InvalidRequest(detail),
        _ => SendError::Transient(format!("HTTP {}: {}", status, detail)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    use super::*;

    /// In-memory transport whose outcomes are scripted per recipient.
    #[derive(Default)]
    pub struct ScriptedTransport {
        outcomes: Mutex<HashMap<String, VecDeque<Result<(), SendError>>>>,
        broken_sessions: HashSet<String>,
        pub sent: Mutex<Vec<(String, String, String)>>,
        pub opened: Mutex<Vec<String>>,
        pub closed: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_broken_session(mut self, session: &str) -> Self {
            self.broken_sessions.insert(session.to_string());
            self
        }

        pub fn script(&self, recipient: &str, outcome: Result<(), SendError>) {
            self.outcomes
                .lock()
                .unwrap()
                .entry(recipient.to_string())
                .or_default()
                .push_back(outcome);
        }

        pub fn sent_to(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, r, _)| r.clone()).collect()
        }
    }

    #[async_trait]
    impl SendTransport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn open(&self, session: &str) -> Result<()> {
            if self.broken_sessions.contains(session) {
                anyhow::bail!("session {} is broken", session);
            }
            self.opened.lock().unwrap().push(session.to_string());
            Ok(())
        }

        async fn send(&self, session: &str, recipient: &str, text: &str) -> Result<(), SendError> {
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .get_mut(recipient)
                .and_then(|q| q.pop_front())
                .unwrap_or(Ok(()));
            if outcome.is_ok() {
                self.sent.lock().unwrap().push((
                    session.to_string(),
                    recipient.to_string(),
                    text.to_string(),
                ));
            }
            outcome
        }

        async fn close(&self, session: &str) {
            self.closed.lock().unwrap().push(session.to_string());
        }
    }
}
