//! Runs one dispatcher task per enabled flow over a shared identity pool.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::PacingConfig;
use crate::dispatcher::{DispatchContext, Flow, FlowDispatcher, FlowKind, PassReport};
use crate::history::SendHistoryStore;
use crate::identity::{IdentityPool, SendMode};
use crate::send_log::SendOutcomeLog;
use crate::template::MessageTemplate;
use crate::transport::SendTransport;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no usable sender identities ({configured} configured, {blocked} deny-listed, {failed} failed to open)")]
    NoUsableIdentities {
        configured: usize,
        blocked: usize,
        failed: usize,
    },
    #[error("no enabled flows to dispatch")]
    NoActiveFlows,
}

/// Pick the flows for a sender run.
///
/// Without `only`, the auto flow (if any) comes first followed by every
/// group flow. With `only`, the auto flow is left out and the group whose
/// name or queue path equals `only` is used; when nothing matches, an ad-hoc
/// flow named `only` sends from the file `only`.
pub fn select_flows(
    auto: Option<Flow>,
    groups: Vec<Flow>,
    only: Option<&str>,
    dead_letter_dir: &Path,
) -> Vec<Flow> {
    let Some(only) = only.map(str::trim).filter(|o| !o.is_empty()) else {
        return auto.into_iter().chain(groups).collect();
    };

    let matched: Vec<Flow> = groups
        .into_iter()
        .filter(|f| f.name == only || f.queue.path() == Path::new(only))
        .collect();
    if !matched.is_empty() {
        return matched;
    }

    tracing::info!("[SEND] No flow named {:?}; sending from that file directly", only);
    vec![Flow::new(
        only,
        FlowKind::Group,
        only,
        MessageTemplate::from_file(None),
        dead_letter_dir,
    )]
}

pub struct DispatchSupervisor {
    flows: Vec<Flow>,
    sessions: Vec<String>,
    blocked: HashSet<String>,
    history: Arc<SendHistoryStore>,
    send_log: Arc<SendOutcomeLog>,
    transport: Arc<dyn SendTransport>,
    pacing: PacingConfig,
    send_mode: SendMode,
    cooldown_window: chrono::Duration,
}

impl DispatchSupervisor {
    pub fn new(
        flows: Vec<Flow>,
        sessions: Vec<String>,
        history: Arc<SendHistoryStore>,
        send_log: Arc<SendOutcomeLog>,
        transport: Arc<dyn SendTransport>,
    ) -> Self {
        Self {
            flows,
            sessions,
            blocked: HashSet::new(),
            history,
            send_log,
            transport,
            pacing: PacingConfig::default(),
            send_mode: SendMode::default(),
            cooldown_window: chrono::Duration::days(5),
        }
    }

    pub fn with_blocked(mut self, blocked: HashSet<String>) -> Self {
        self.blocked = blocked;
        self
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_send_mode(mut self, mode: SendMode) -> Self {
        self.send_mode = mode;
        self
    }

    pub fn with_cooldown_window(mut self, window: chrono::Duration) -> Self {
        self.cooldown_window = window;
        self
    }

    /// Open every session and spawn one task per enabled flow.
    pub async fn start(self) -> Result<SupervisorHandle, SupervisorError> {
        let flows = self.active_flows()?;
        let opened = self.open_sessions().await?;
        let ctx = self.context(&opened);

        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks: Vec<JoinHandle<()>> = flows
            .into_iter()
            .map(|flow| {
                let dispatcher = FlowDispatcher::new(flow, ctx.clone());
                tokio::spawn(dispatcher.run(stop_rx.clone()))
            })
            .collect();
        tracing::info!(
            "[SEND] Supervisor running {} flow(s) over {} identit(ies)",
            tasks.len(),
            opened.len()
        );

        Ok(SupervisorHandle {
            stop_tx: Arc::new(stop_tx),
            tasks,
            transport: self.transport,
            sessions: opened,
        })
    }

    /// One pass over every enabled flow, run concurrently. Sessions are
    /// opened for the pass and closed before returning.
    pub async fn run_once(&self) -> Result<Vec<(String, PassReport)>, SupervisorError> {
        let flows = self.active_flows()?;
        let opened = self.open_sessions().await?;
        let ctx = self.context(&opened);

        let mut set = JoinSet::new();
        for (idx, flow) in flows.into_iter().enumerate() {
            let mut dispatcher = FlowDispatcher::new(flow, ctx.clone());
            set.spawn(async move {
                let report = dispatcher.run_pass().await;
                (idx, dispatcher.flow().name.clone(), report)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => reports.push(entry),
                Err(e) => tracing::error!("[SEND] Flow task failed: {}", e),
            }
        }
        close_sessions(self.transport.as_ref(), &opened).await;

        reports.sort_by_key(|(idx, _, _)| *idx);
        Ok(reports
            .into_iter()
            .map(|(_, name, report)| (name, report))
            .collect())
    }

    fn active_flows(&self) -> Result<Vec<Flow>, SupervisorError> {
        let mut active = Vec::new();
        for flow in &self.flows {
            if flow.send_enabled {
                active.push(flow.clone());
            } else {
                tracing::info!("[SEND] Skipping disabled flow '{}'", flow.name);
            }
        }
        if active.is_empty() {
            return Err(SupervisorError::NoActiveFlows);
        }
        Ok(active)
    }

    async fn open_sessions(&self) -> Result<Vec<String>, SupervisorError> {
        let mut opened = Vec::new();
        let mut blocked = 0;
        let mut failed = 0;

        for session in &self.sessions {
            if self.blocked.contains(session) {
                tracing::info!("[SEND] Session {} is deny-listed; not opening", session);
                blocked += 1;
                continue;
            }
            match self.transport.open(session).await {
                Ok(()) => {
                    tracing::info!("[SEND] Session ok -> {}", session);
                    opened.push(session.clone());
                }
                Err(e) => {
                    tracing::error!("[SEND] Skipping broken session {}: {:#}", session, e);
                    self.transport.close(session).await;
                    failed += 1;
                }
            }
        }

        if opened.is_empty() {
            return Err(SupervisorError::NoUsableIdentities {
                configured: self.sessions.len(),
                blocked,
                failed,
            });
        }
        Ok(opened)
    }

    fn context(&self, opened: &[String]) -> Arc<DispatchContext> {
        let pool = Arc::new(IdentityPool::new(opened.to_vec(), self.blocked.clone()));
        Arc::new(DispatchContext {
            pool,
            history: self.history.clone(),
            send_log: self.send_log.clone(),
            transport: self.transport.clone(),
            pacing: self.pacing.clone(),
            send_mode: self.send_mode,
            cooldown_window: self.cooldown_window,
        })
    }
}

async fn close_sessions(transport: &dyn SendTransport, sessions: &[String]) {
    for session in sessions {
        transport.close(session).await;
    }
}

/// Cloneable stop button for a running supervisor.
#[derive(Clone)]
pub struct StopTrigger(Arc<watch::Sender<bool>>);

impl StopTrigger {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

pub struct SupervisorHandle {
    stop_tx: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    transport: Arc<dyn SendTransport>,
    sessions: Vec<String>,
}

impl SupervisorHandle {
    pub fn flow_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn trigger(&self) -> StopTrigger {
        StopTrigger(self.stop_tx.clone())
    }

    /// Signal every flow to stop and wait for them to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        self.wait().await;
    }

    /// Wait for all flow tasks, then close every session, whatever the
    /// tasks' outcome.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("[SEND] Flow task ended abnormally: {}", e);
            }
        }
        close_sessions(self.transport.as_ref(), &self.sessions).await;
        tracing::info!("[SEND] All flows stopped; sessions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedTransport;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        history: Arc<SendHistoryStore>,
        send_log: Arc<SendOutcomeLog>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        Fixture {
            history: Arc::new(SendHistoryStore::open(root.join("sent_history.csv")).unwrap()),
            send_log: Arc::new(SendOutcomeLog::new(root.join("send_log.csv"))),
            root,
            _dir: dir,
        }
    }

    impl Fixture {
        fn flow(&self, name: &str, lines: &[&str]) -> Flow {
            let path = self.root.join(format!("{}.txt", name));
            fs::write(&path, lines.join("\n")).unwrap();
            Flow::new(
                name,
                FlowKind::Group,
                &path,
                MessageTemplate::inline("Hi {username}"),
                self.root.join("errors"),
            )
        }

        fn supervisor(&self, flows: Vec<Flow>, sessions: &[&str], transport: Arc<ScriptedTransport>) -> DispatchSupervisor {
            DispatchSupervisor::new(
                flows,
                sessions.iter().map(|s| s.to_string()).collect(),
                self.history.clone(),
                self.send_log.clone(),
                transport,
            )
            .with_pacing(PacingConfig::immediate())
        }
    }

    #[tokio::test]
    async fn run_once_skips_broken_sessions_and_closes_the_rest() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new().with_broken_session("sender_bad"));
        let flows = vec![fx.flow("physics", &["@alice"]), fx.flow("chemistry", &["@bob_b"])];
        let supervisor = fx.supervisor(flows, &["sender_bad", "sender_a", "sender_b"], transport.clone());

        let reports = supervisor.run_once().await.unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, "physics");
        assert_eq!(reports.iter().map(|(_, r)| r.sent).sum::<usize>(), 2);
        assert!(transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .all(|(s, _, _)| s != "sender_bad"));

        let mut closed = transport.closed.lock().unwrap().clone();
        closed.sort();
        assert_eq!(closed, vec!["sender_a", "sender_b", "sender_bad"]);
    }

    #[tokio::test]
    async fn no_usable_sessions_is_fatal() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new().with_broken_session("sender_a"));
        let supervisor = fx
            .supervisor(vec![fx.flow("physics", &["@alice"])], &["sender_a", "sender_b"], transport)
            .with_blocked(["sender_b".to_string()].into_iter().collect());

        match supervisor.run_once().await {
            Err(SupervisorError::NoUsableIdentities { blocked, failed, .. }) => {
                assert_eq!(blocked, 1);
                assert_eq!(failed, 1);
            }
            other => panic!("expected NoUsableIdentities, got {:?}", other.map(|r| r.len())),
        }
    }

    #[tokio::test]
    async fn disabled_flows_are_not_started() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new());
        let mut disabled = fx.flow("physics", &["@alice"]);
        disabled.send_enabled = false;

        let only_disabled = fx.supervisor(vec![disabled.clone()], &["sender_a"], transport.clone());
        assert!(matches!(
            only_disabled.run_once().await,
            Err(SupervisorError::NoActiveFlows)
        ));

        let mixed = fx.supervisor(
            vec![disabled, fx.flow("chemistry", &["@bob_b"])],
            &["sender_a"],
            transport.clone(),
        );
        let reports = mixed.run_once().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(transport.sent_to(), vec!["@bob_b"]);
    }

    #[tokio::test]
    async fn started_supervisor_stops_and_closes_sessions() {
        let fx = fixture();
        let transport = Arc::new(ScriptedTransport::new());
        let mut pacing = PacingConfig::immediate();
        pacing.idle_sleep_secs = 3600;
        let supervisor = fx
            .supervisor(vec![fx.flow("physics", &["@alice"])], &["sender_a"], transport.clone())
            .with_pacing(pacing);

        let handle = supervisor.start().await.unwrap();
        assert_eq!(handle.flow_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("supervisor should stop");

        assert_eq!(transport.sent_to(), vec!["@alice"]);
        assert_eq!(*transport.closed.lock().unwrap(), vec!["sender_a"]);
    }

    #[test]
    fn select_flows_prefers_named_group_then_adhoc_file() {
        let fx = fixture();
        let auto = Flow::new(
            "AUTO",
            FlowKind::Auto,
            fx.root.join("auto_all.txt"),
            MessageTemplate::inline("x"),
            fx.root.join("errors"),
        );
        let physics = fx.flow("physics", &[]);
        let physics_path = physics.queue.path().to_string_lossy().into_owned();

        let all = select_flows(Some(auto.clone()), vec![physics.clone()], None, &fx.root);
        assert_eq!(all.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), vec!["AUTO", "physics"]);

        let by_name = select_flows(Some(auto.clone()), vec![physics.clone()], Some("physics"), &fx.root);
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].name, "physics");

        let by_path = select_flows(Some(auto.clone()), vec![physics.clone()], Some(physics_path.as_str()), &fx.root);
        assert_eq!(by_path[0].name, "physics");

        let adhoc = select_flows(Some(auto), vec![physics], Some("outputs/manual.txt"), &fx.root);
        assert_eq!(adhoc[0].name, "outputs/manual.txt");
        assert_eq!(adhoc[0].queue.path(), Path::new("outputs/manual.txt"));
    }
}
