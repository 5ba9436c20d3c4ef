//! Ingestion: turns inbound chat messages into queued recipients.
//!
//! This is the only writer that appends to queue files. A message can land
//! in several queues at once: the auto flow, the keyword queue, its group's
//! flow queue and any matching topic-section queues.

pub mod keywords;
pub mod notify;
pub mod sections;
pub mod subjects;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{CourierConfig, ListenScope};
use crate::database::{CapturedMessage, CourierDatabase, FlowRecord, TopicSection, GLOBAL_SECTION_TAG};
use crate::ledger::ensure_parent_dir;
use crate::queue::RecipientQueue;
use crate::recipient::{build_message_link, is_valid_handle, normalize_recipient, recipient_token};

pub use keywords::KeywordMatcher;
pub use notify::{BotNotifier, HitNotifier, KeywordAlert};
pub use sections::{match_sections, merge_sections, slugify_section_name};
pub use subjects::SubjectExtractor;

/// Flow and section metadata is re-read at most this often.
const METADATA_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub chat_username: Option<String>,
    pub message_id: i64,
    pub sender_id: i64,
    pub sender_username: Option<String>,
    pub text: String,
    pub date: DateTime<Utc>,
}

/// What a classifier says about a message. Treated as untrusted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub tags: Vec<String>,
    pub recipient: Option<String>,
}

impl Classification {
    /// Trimmed, non-empty, de-duplicated tags and a recipient only if it is
    /// a valid handle.
    pub fn sanitized(self) -> Self {
        let mut tags: Vec<String> = Vec::new();
        for tag in self.tags {
            let tag = tag.trim();
            if !tag.is_empty() && tag.chars().count() <= 120 && !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        let recipient = self
            .recipient
            .map(|r| normalize_recipient(&r))
            .filter(|r| is_valid_handle(r));
        Self { tags, recipient }
    }
}

#[async_trait]
pub trait IngestionClassifier: Send + Sync {
    async fn classify(&self, msg: &InboundMessage) -> Classification;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    BlockedSender,
    OutOfScope,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub ignored: Option<IgnoreReason>,
    pub flow: Option<String>,
    pub source_tag: Option<String>,
    pub keyword_hit: bool,
    pub subjects: Vec<String>,
    pub sections: Vec<String>,
    pub recipient: Option<String>,
    pub queued: Vec<PathBuf>,
    pub stored: bool,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub auto_queue: Option<PathBuf>,
    pub keyword_queue: Option<PathBuf>,
    pub subjects_log: PathBuf,
    pub sections_dir: PathBuf,
    pub listen_scope: ListenScope,
    pub exclude_no_username: bool,
}

impl IngestSettings {
    pub fn from_config(config: &CourierConfig) -> Self {
        let outputs = Path::new(&config.outputs_dir);
        Self {
            auto_queue: config
                .auto_flow
                .enabled
                .then(|| PathBuf::from(&config.auto_flow.out_file)),
            keyword_queue: config
                .keyword_filter
                .enabled
                .then(|| PathBuf::from(&config.keyword_filter.out_file)),
            subjects_log: outputs.join("subjects.jsonl"),
            sections_dir: outputs.join("sections"),
            listen_scope: config.listen_scope,
            exclude_no_username: config.exclude_no_username,
        }
    }
}

#[derive(Serialize)]
struct SubjectRecord<'a> {
    username_or_link: &'a str,
    chat_id: i64,
    chat_username: &'a str,
    topic_tag: &'a str,
    subjects: &'a [String],
    text: &'a str,
    date: String,
}

struct Metadata {
    loaded_at: Instant,
    flows: Vec<FlowRecord>,
    sections: std::collections::HashMap<String, Vec<TopicSection>>,
}

pub struct Ingestor {
    db: Arc<CourierDatabase>,
    settings: IngestSettings,
    keywords: Option<KeywordMatcher>,
    classifier: Option<Arc<dyn IngestionClassifier>>,
    notifier: Option<Arc<dyn HitNotifier>>,
    metadata: Mutex<Option<Metadata>>,
}

impl Ingestor {
    pub fn new(db: Arc<CourierDatabase>, settings: IngestSettings) -> Self {
        Self {
            db,
            settings,
            keywords: None,
            classifier: None,
            notifier: None,
            metadata: Mutex::new(None),
        }
    }

    pub fn with_keywords(mut self, matcher: KeywordMatcher) -> Self {
        self.keywords = Some(matcher);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IngestionClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn HitNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn metadata(&self) -> Result<(Vec<FlowRecord>, std::collections::HashMap<String, Vec<TopicSection>>)> {
        let mut cache = self
            .metadata
            .lock()
            .map_err(|e| anyhow::anyhow!("Ingest cache lock poisoned: {}", e))?;
        let stale = cache
            .as_ref()
            .map_or(true, |m| m.loaded_at.elapsed() > METADATA_TTL);
        if stale {
            *cache = Some(Metadata {
                loaded_at: Instant::now(),
                flows: self.db.list_flows()?,
                sections: self.db.list_enabled_sections()?,
            });
        }
        let meta = cache.as_ref().context("metadata cache empty")?;
        Ok((meta.flows.clone(), meta.sections.clone()))
    }

    pub async fn ingest(&self, msg: &InboundMessage) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        if self.db.is_user_blocked(msg.sender_id)? {
            report.ignored = Some(IgnoreReason::BlockedSender);
            return Ok(report);
        }

        let (flows, sections) = self.metadata()?;
        let flow = resolve_flow(&flows, msg);
        let topic = flow.map(|f| f.effective_topic().to_string());
        report.flow = flow.map(|f| f.name.clone());

        if let Some(topic) = &topic {
            let empty = Vec::new();
            let merged = merge_sections(
                sections.get(GLOBAL_SECTION_TAG).unwrap_or(&empty),
                sections.get(topic).unwrap_or(&empty),
            );
            report.sections = match_sections(&msg.text, &merged, true);
        }

        let classification = match &self.classifier {
            Some(classifier) => classifier.classify(msg).await.sanitized(),
            None => Classification::default(),
        };

        for subject in classification.tags.iter().chain(report.sections.iter()) {
            if !report.subjects.contains(subject) {
                report.subjects.push(subject.clone());
            }
        }
        let has_subjects = !report.subjects.is_empty();

        report.keyword_hit = self
            .keywords
            .as_ref()
            .is_some_and(|k| k.is_match(&msg.text));

        if !report.keyword_hit
            && !has_subjects
            && flow.is_none()
            && self.settings.listen_scope == ListenScope::Configured
        {
            report.ignored = Some(IgnoreReason::OutOfScope);
            return Ok(report);
        }

        let username = msg
            .sender_username
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());
        let link = match username {
            Some(_) => None,
            None => build_message_link(msg.chat_username.as_deref(), msg.chat_id, msg.message_id),
        };
        let display_id = match username {
            Some(u) => u.to_string(),
            None => link.clone().unwrap_or_else(|| msg.sender_id.to_string()),
        };
        let chat_label = msg
            .chat_username
            .clone()
            .unwrap_or_else(|| msg.chat_id.to_string());

        let source_tag = if report.keyword_hit {
            "kw".to_string()
        } else if let Some(topic) = &topic {
            topic.clone()
        } else if has_subjects {
            "subjects".to_string()
        } else {
            chat_label.clone()
        };
        report.source_tag = Some(source_tag.clone());

        let token = recipient_token(
            username,
            link.as_deref(),
            msg.sender_id,
            self.settings.exclude_no_username,
        )
        .or_else(|| classification.recipient.clone());
        report.recipient = token.clone();

        let capture_group =
            flow.is_some_and(|f| !f.subjects_only || report.keyword_hit || has_subjects);

        if report.keyword_hit || has_subjects || capture_group {
            let subjects_json = if has_subjects {
                Some(serde_json::to_string(&report.subjects)?)
            } else {
                None
            };
            self.db.insert_message(&CapturedMessage {
                chat_id: msg.chat_id,
                chat_username: Some(chat_label.clone()),
                user_id: msg.sender_id,
                username: Some(display_id.clone()),
                text: msg.text.clone(),
                date: msg.date,
                source_tag: Some(source_tag.clone()),
                subjects_json,
            })?;
            report.stored = true;
        }

        if let Some(token) = token.as_deref() {
            if let Some(auto) = &self.settings.auto_queue {
                self.enqueue(auto, token, "[AUTO]", &mut report).await;
            }
            if report.keyword_hit {
                if let Some(kw) = &self.settings.keyword_queue {
                    self.enqueue(kw, token, "[LISTEN/KEYWORD]", &mut report).await;
                }
            }
            if capture_group {
                if let Some(flow) = flow {
                    let path = PathBuf::from(&flow.queue_path);
                    self.enqueue(&path, token, "[LISTEN]", &mut report).await;
                }
            }
        }

        if has_subjects {
            let record = SubjectRecord {
                username_or_link: &display_id,
                chat_id: msg.chat_id,
                chat_username: &chat_label,
                topic_tag: topic.as_deref().unwrap_or(&source_tag),
                subjects: &report.subjects,
                text: &msg.text,
                date: Utc::now().to_rfc3339(),
            };
            if let Err(e) = append_json_line(&self.settings.subjects_log, &record) {
                tracing::warn!("[SUBJECTS] Failed to log subjects for {}: {:#}", display_id, e);
            } else {
                tracing::info!("[SUBJECTS] {} -> {:?}", display_id, report.subjects);
            }
        }

        // Section queues only take real handles.
        if let (Some(topic), Some(name)) = (&topic, username) {
            let handle = normalize_recipient(&format!("@{}", name.trim_start_matches('@')));
            let dir = self.settings.sections_dir.join(path_safe(topic));
            for section in report.sections.clone() {
                let path = dir.join(format!("{}.txt", slugify_section_name(&section)));
                self.enqueue(&path, &handle, "[SECTION]", &mut report).await;
            }
        }

        if report.keyword_hit {
            if let Some(notifier) = &self.notifier {
                let link = build_message_link(msg.chat_username.as_deref(), msg.chat_id, msg.message_id);
                let alert = KeywordAlert {
                    chat: &chat_label,
                    topic: topic.as_deref(),
                    sender: &display_id,
                    link: link.as_deref(),
                    text: &msg.text,
                    at: Utc::now(),
                };
                notifier.notify(&alert.render()).await;
            }
        }

        Ok(report)
    }

    async fn enqueue(&self, path: &Path, token: &str, tag: &str, report: &mut IngestReport) {
        let owned = token.to_string();
        let appended = RecipientQueue::new(path)
            .run_blocking(move |q| q.append_if_absent(&owned))
            .await;
        match appended {
            Ok(true) => {
                tracing::info!("{} + {} -> {:?}", tag, token, path);
                report.queued.push(path.to_path_buf());
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("{} Failed to queue {} in {:?}: {:#}", tag, token, path, e),
        }
    }
}

/// Match by chat username (case-insensitive, `@` optional) or numeric id.
fn resolve_flow<'a>(flows: &'a [FlowRecord], msg: &InboundMessage) -> Option<&'a FlowRecord> {
    let chat_key = |raw: &str| raw.trim().trim_start_matches('@').to_lowercase();

    if let Some(username) = msg.chat_username.as_deref().filter(|u| !u.trim().is_empty()) {
        let wanted = chat_key(username);
        if let Some(flow) = flows.iter().find(|f| chat_key(&f.chat) == wanted) {
            return Some(flow);
        }
    }
    let id = msg.chat_id.to_string();
    flows.iter().find(|f| f.chat.trim() == id)
}

fn path_safe(tag: &str) -> String {
    tag.trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dir(path)?;
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {:?}", path))?;
    Ok(())
}
