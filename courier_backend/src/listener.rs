//! Telegram long-polling listener.
//!
//! Polls `getUpdates` with the listener bot token and forwards each group
//! message over a `flume` channel to an ingest worker, so slow ingestion
//! (LLM calls, file locks) never stalls polling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ingest::{InboundMessage, Ingestor};

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    message_id: i64,
    #[serde(default)]
    date: i64,
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    username: Option<String>,
}

fn to_inbound(msg: TelegramMessage) -> Option<InboundMessage> {
    let from = msg.from.filter(|u| !u.is_bot)?;
    let date = Utc
        .timestamp_opt(msg.date, 0)
        .single()
        .unwrap_or_else(Utc::now);
    Some(InboundMessage {
        chat_id: msg.chat.id,
        chat_username: msg.chat.username,
        message_id: msg.message_id,
        sender_id: from.id,
        sender_username: from.username,
        text: msg.text.or(msg.caption).unwrap_or_default(),
        date,
    })
}

// ─── Listener ────────────────────────────────────────────────────────────────

pub struct TelegramListener {
    api_base: String,
    client: reqwest::Client,
}

impl TelegramListener {
    pub fn new(api_base: &str, token: &str, proxy: Option<&str>) -> Result<Self> {
        // Long polls hold the connection for 30 s.
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(45));
        if let Some(proxy_url) = proxy.map(str::trim).filter(|p| !p.is_empty()) {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy_url)
                    .with_context(|| format!("Invalid proxy URL {}", proxy_url))?,
            );
        }
        Ok(Self {
            api_base: format!("{}/bot{}", api_base.trim_end_matches('/'), token.trim()),
            client: builder.build().context("Failed to build HTTP client")?,
        })
    }

    /// Poll until `shutdown` flips or the ingest side hangs up.
    pub async fn run(self, tx: flume::Sender<InboundMessage>, mut shutdown: watch::Receiver<bool>) {
        let mut offset: i64 = 0;
        tracing::info!("[LISTEN] Listener polling started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                polled = self.poll_updates(offset) => polled,
                _ = shutdown.changed() => break,
            };

            let updates = match polled {
                Ok(u) => u,
                Err(e) => {
                    let backoff = Duration::from_secs(rand::rng().random_range(5..=10));
                    tracing::warn!("[LISTEN] getUpdates failed ({:#}); retrying in {:?}", e, backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(inbound) = update.message.and_then(to_inbound) else {
                    continue;
                };
                if tx.send_async(inbound).await.is_err() {
                    tracing::warn!("[LISTEN] Ingest worker gone; stopping listener");
                    return;
                }
            }
        }

        tracing::info!("[LISTEN] Listener stopped");
    }

    async fn poll_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let url = format!("{}/getUpdates", self.api_base);
        let params = serde_json::json!({
            "offset": offset,
            "timeout": 30,
            "allowed_updates": ["message"]
        });

        let body: TelegramResponse<Vec<Update>> = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates returned unparseable body")?;

        if !body.ok {
            anyhow::bail!(
                "Telegram API returned ok=false: {}",
                body.description.unwrap_or_default()
            );
        }
        Ok(body.result.unwrap_or_default())
    }
}

/// Drain `rx` into the ingestor until every sender is dropped.
pub fn spawn_ingest_worker(ingestor: Arc<Ingestor>, rx: flume::Receiver<InboundMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(msg) = rx.recv_async().await {
            match ingestor.ingest(&msg).await {
                Ok(report) => tracing::debug!(
                    "[LISTEN] message {} in chat {}: {:?}",
                    msg.message_id,
                    msg.chat_id,
                    report
                ),
                Err(e) => tracing::error!("[LISTEN] ingest failed for chat {}: {:#}", msg.chat_id, e),
            }
        }
        tracing::debug!("[LISTEN] Ingest worker finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenScope;
    use crate::database::CourierDatabase;
    use crate::ingest::IngestSettings;

    #[test]
    fn converts_updates_and_skips_bots() {
        let raw = r#"{"ok": true, "result": [
            {"update_id": 10, "message": {"message_id": 5, "date": 1700000000,
             "chat": {"id": -1001, "username": "physics_group"},
             "from": {"id": 7, "is_bot": false, "username": "alice"},
             "caption": "photo of notes"}},
            {"update_id": 11, "message": {"message_id": 6, "date": 1700000001,
             "chat": {"id": -1001}, "from": {"id": 8, "is_bot": true}, "text": "beep"}},
            {"update_id": 12}
        ]}"#;
        let body: TelegramResponse<Vec<Update>> = serde_json::from_str(raw).unwrap();
        let inbound: Vec<InboundMessage> = body
            .result
            .unwrap()
            .into_iter()
            .filter_map(|u| u.message.and_then(to_inbound))
            .collect();

        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].sender_username.as_deref(), Some("alice"));
        assert_eq!(inbound[0].text, "photo of notes");
        assert_eq!(inbound[0].date.timestamp(), 1700000000);
    }

    #[tokio::test]
    async fn worker_ingests_until_channel_closes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(CourierDatabase::new(dir.path().join("listen.db")).unwrap());
        let auto = dir.path().join("auto_all.txt");
        let ingestor = Arc::new(Ingestor::new(
            db,
            IngestSettings {
                auto_queue: Some(auto.clone()),
                keyword_queue: None,
                subjects_log: dir.path().join("subjects.jsonl"),
                sections_dir: dir.path().join("sections"),
                listen_scope: ListenScope::All,
                exclude_no_username: true,
            },
        ));

        let (tx, rx) = flume::unbounded();
        let worker = spawn_ingest_worker(ingestor, rx);
        for (id, name) in [(1, "alice"), (2, "bob_b"), (3, "alice")] {
            tx.send_async(InboundMessage {
                chat_id: -1,
                chat_username: None,
                message_id: id,
                sender_id: id,
                sender_username: Some(name.to_string()),
                text: "hi".to_string(),
                date: Utc::now(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let queued = std::fs::read_to_string(&auto).unwrap();
        assert_eq!(queued.lines().collect::<Vec<_>>(), vec!["@alice", "@bob_b"]);
    }
}
