//! Per-flow dispatch loop.
//!
//! Each pass takes a snapshot of the flow's queue and walks it in order:
//! validate the token, skip recipients still inside the history cooldown,
//! take an identity from the shared pool, send, then settle the outcome
//! against the queue, the history ledger and the pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::PacingConfig;
use crate::history::SendHistoryStore;
use crate::identity::{IdentityPool, SendMode, TurnCounter};
use crate::queue::RecipientQueue;
use crate::recipient::{is_valid_handle, normalize_recipient};
use crate::send_log::{SendOutcomeLog, SendResult};
use crate::template::{variant_key, MessageTemplate};
use crate::transport::{CooldownPolicy, FailureDisposition, SendTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Aggregate flow fed only by ingestion.
    Auto,
    Group,
}

impl FlowKind {
    fn tag(self) -> &'static str {
        match self {
            FlowKind::Auto => "[AUTO]",
            FlowKind::Group => "[SEND]",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub name: String,
    pub kind: FlowKind,
    pub queue: RecipientQueue,
    pub template: MessageTemplate,
    pub send_enabled: bool,
    pub attachments_enabled: bool,
    /// Ingestion only captures this flow's chat when a subject matched.
    pub subjects_only: bool,
    pub topic_tag: Option<String>,
    pub dead_letter_path: PathBuf,
}

impl Flow {
    pub fn new(
        name: &str,
        kind: FlowKind,
        queue_path: impl AsRef<Path>,
        template: MessageTemplate,
        dead_letter_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            queue: RecipientQueue::new(queue_path),
            template,
            send_enabled: true,
            attachments_enabled: false,
            subjects_only: false,
            topic_tag: None,
            dead_letter_path: dead_letter_path(dead_letter_dir.as_ref(), name),
        }
    }

    pub fn variant_key(&self) -> String {
        variant_key(&self.name, &self.template)
    }
}

/// `<dir>/<flow>_dead.txt`, with the flow name reduced to a safe file stem.
pub fn dead_letter_path(dir: &Path, flow_name: &str) -> PathBuf {
    let stem: String = flow_name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let stem = if stem.is_empty() { "flow".to_string() } else { stem };
    dir.join(format!("{}_dead.txt", stem))
}

/// Everything the flow tasks share.
pub struct DispatchContext {
    pub pool: Arc<IdentityPool>,
    pub history: Arc<SendHistoryStore>,
    pub send_log: Arc<SendOutcomeLog>,
    pub transport: Arc<dyn SendTransport>,
    pub pacing: PacingConfig,
    pub send_mode: SendMode,
    pub cooldown_window: chrono::Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub fetched: usize,
    pub sent: usize,
    pub dropped_invalid: usize,
    pub deferred_cooldown: usize,
    pub permanent_failures: usize,
    pub temporary_failures: usize,
    pub exhausted: usize,
}

impl PassReport {
    pub fn attempts(&self) -> usize {
        self.sent + self.permanent_failures + self.temporary_failures
    }
}

pub struct FlowDispatcher {
    flow: Flow,
    ctx: Arc<DispatchContext>,
    turns: TurnCounter,
    policy: CooldownPolicy,
    variant: String,
    shutdown: Option<watch::Receiver<bool>>,
}

impl FlowDispatcher {
    pub fn new(flow: Flow, ctx: Arc<DispatchContext>) -> Self {
        let turns = TurnCounter::new(ctx.pacing.turn_cap);
        let policy = ctx.pacing.cooldown_policy();
        let variant = flow.variant_key();
        Self {
            flow,
            ctx,
            turns,
            policy,
            variant,
            shutdown: None,
        }
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Loop passes until `shutdown` flips to true. An idle pass (nothing
    /// attempted, no exhaustion) sleeps the long idle interval.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown);
        let tag = self.flow.kind.tag();
        tracing::info!("{} Flow '{}' started ({})", tag, self.flow.name, self.variant);

        while !self.is_shutdown() {
            let report = self.run_pass().await;
            if report.attempts() > 0 || report.exhausted > 0 {
                continue;
            }
            let idle = Duration::from_secs(self.ctx.pacing.idle_sleep_secs);
            if report.fetched == 0 {
                tracing::debug!("{} Queue for '{}' is empty; sleeping {:?}", tag, self.flow.name, idle);
            }
            if self.pause(idle).await {
                break;
            }
        }

        tracing::info!("{} Flow '{}' stopped", tag, self.flow.name);
    }

    /// Process one snapshot of the queue.
    pub async fn run_pass(&mut self) -> PassReport {
        let tag = self.flow.kind.tag();
        let mut report = PassReport::default();

        let snapshot = match self.flow.queue.run_blocking(|q| q.load()).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!("{} Could not read queue for '{}': {:#}", tag, self.flow.name, e);
                return report;
            }
        };
        report.fetched = snapshot.len();

        for token in snapshot {
            if self.is_shutdown() {
                break;
            }

            let recipient = normalize_recipient(&token);
            if !is_valid_handle(&recipient) {
                tracing::info!("{} Dropping malformed recipient {:?} from '{}'", tag, token, self.flow.name);
                self.queue_remove(&token).await;
                report.dropped_invalid += 1;
                continue;
            }

            if self
                .ctx
                .history
                .is_within_cooldown(&recipient, &self.variant, self.ctx.cooldown_window)
            {
                tracing::debug!("{} {} contacted recently for {}; deferring", tag, recipient, self.variant);
                self.queue_move_to_end(&token).await;
                report.deferred_cooldown += 1;
                continue;
            }

            let Some(lease) = self.ctx.pool.acquire(self.ctx.send_mode) else {
                tracing::info!("{} No identity available for '{}'; backing off", tag, self.flow.name);
                self.queue_move_to_end(&token).await;
                report.exhausted += 1;
                self.pause(Duration::from_secs(self.ctx.pacing.exhausted_sleep_secs))
                    .await;
                break;
            };
            let session = lease.session().to_string();

            if self.pause(self.ctx.pacing.pre_send_delay.sample()).await {
                break;
            }

            let text = self.flow.template.render(&recipient, &self.flow.name, &session);
            let outcome = self.ctx.transport.send(&session, &recipient, &text).await;

            match outcome {
                Ok(()) => {
                    tracing::info!("{} Sent to {} via {} ({})", tag, recipient, session, self.flow.name);
                    self.log_attempt(&recipient, &session, SendResult::Ok, "");
                    self.queue_remove(&token).await;
                    if let Err(e) = self.ctx.history.record(&recipient, &self.variant) {
                        tracing::warn!("{} Failed to record history for {}: {:#}", tag, recipient, e);
                    }
                    report.sent += 1;

                    if self.turns.record_send(&session) {
                        let rest = self.ctx.pacing.turn_cooldown.sample();
                        let rest = chrono::Duration::from_std(rest)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                        let until = self.ctx.pool.cool_down(&session, rest);
                        tracing::info!("{} {} finished its turn; resting until {}", tag, session, until);
                    }
                }
                Err(err) => {
                    self.log_attempt(&recipient, &session, SendResult::Failed, &err.to_string());
                    match err.disposition(&self.policy) {
                        FailureDisposition::Permanent => {
                            tracing::warn!("{} Dropping {} from '{}': {}", tag, recipient, self.flow.name, err);
                            self.queue_remove(&token).await;
                            self.dead_letter(&recipient).await;
                            report.permanent_failures += 1;
                        }
                        FailureDisposition::Temporary { cooldown } => {
                            let until = self.ctx.pool.cool_down(&session, cooldown);
                            tracing::warn!(
                                "{} Send to {} via {} failed ({}); identity resting until {}",
                                tag,
                                recipient,
                                session,
                                err,
                                until
                            );
                            self.queue_move_to_end(&token).await;
                            report.temporary_failures += 1;
                        }
                    }
                }
            }
            drop(lease);

            let delay = self.ctx.pacing.inter_send_delay(&session).sample();
            if self.pause(delay).await {
                break;
            }
        }

        tracing::debug!("{} Pass over '{}' done: {:?}", tag, self.flow.name, report);
        report
    }

    fn log_attempt(&self, recipient: &str, session: &str, result: SendResult, error: &str) {
        if let Err(e) = self
            .ctx
            .send_log
            .append(recipient, &self.flow.name, session, result, error)
        {
            tracing::warn!("Failed to write send log row for {}: {:#}", recipient, e);
        }
    }

    async fn queue_remove(&self, token: &str) {
        let owned = token.to_string();
        if let Err(e) = self.flow.queue.run_blocking(move |q| q.remove(&owned)).await {
            tracing::warn!("Failed to remove {:?} from {:?}: {:#}", token, self.flow.queue.path(), e);
        }
    }

    async fn queue_move_to_end(&self, token: &str) {
        let owned = token.to_string();
        if let Err(e) = self.flow.queue.run_blocking(move |q| q.move_to_end(&owned)).await {
            tracing::warn!("Failed to requeue {:?} in {:?}: {:#}", token, self.flow.queue.path(), e);
        }
    }

    async fn dead_letter(&self, recipient: &str) {
        let dead = RecipientQueue::new(&self.flow.dead_letter_path);
        let owned = recipient.to_string();
        if let Err(e) = dead.run_blocking(move |q| q.append_if_absent(&owned)).await {
            tracing::warn!("Failed to dead-letter {}: {:#}", recipient, e);
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep for `duration`, waking early on shutdown. Returns true when the
    /// flow should stop.
    async fn pause(&mut self, duration: Duration) -> bool {
        if !duration.is_zero() {
            match self.shutdown.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = wait_for_stop(rx) => {}
                    }
                }
                None => tokio::time::sleep(duration).await,
            }
        }
        self.is_shutdown()
    }
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender gone without a stop signal; only the timer can wake us.
            std::future::pending::<()>().await;
        }
    }
}
