use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::config::{CourierConfig, TransportKind};
use crate::database::{CourierDatabase, FlowRecord};
use crate::dispatcher::{Flow, FlowKind, PassReport};
use crate::history::SendHistoryStore;
use crate::identity::load_deny_list;
use crate::ingest::notify::normalize_targets;
use crate::ingest::{
    BotNotifier, HitNotifier, IngestSettings, IngestionClassifier, Ingestor, KeywordMatcher,
    SubjectExtractor,
};
use crate::listener::{spawn_ingest_worker, TelegramListener};
use crate::llm_client::LlmClient;
use crate::send_log::SendOutcomeLog;
use crate::supervisor::{select_flows, DispatchSupervisor};
use crate::template::MessageTemplate;
use crate::transport::{DryRunTransport, SendTransport, TelegramBotTransport};

pub struct CourierRuntime {
    pub config: CourierConfig,
    pub database: Arc<CourierDatabase>,
    pub history: Arc<SendHistoryStore>,
    pub send_log: Arc<SendOutcomeLog>,
    pub transport: Arc<dyn SendTransport>,
    pub deny_list: HashSet<String>,
    classifier: Option<Arc<dyn IngestionClassifier>>,
}

pub struct CourierRuntimeBuilder {
    config: CourierConfig,
    transport: Option<Arc<dyn SendTransport>>,
    classifier: Option<Arc<dyn IngestionClassifier>>,
}

impl CourierRuntimeBuilder {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            transport: None,
            classifier: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn SendTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IngestionClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> Result<CourierRuntime> {
        let config = self.config;

        let database = Arc::new(
            CourierDatabase::new(&config.database_path).context("Failed to open flow database")?,
        );
        database
            .seed_flows_from_config(&config.groups)
            .context("Failed to seed flows from config")?;

        let deny_list = load_deny_list(&config.blocked_senders_path)?;
        if !deny_list.is_empty() {
            tracing::info!("Loaded {} deny-listed session(s)", deny_list.len());
        }

        let history = Arc::new(SendHistoryStore::open(&config.history_path)?);
        let send_log = Arc::new(SendOutcomeLog::new(&config.send_log_path));

        let transport = match self.transport {
            Some(transport) => transport,
            None => build_transport(&config)?,
        };
        tracing::info!("Using {} transport", transport.name());

        let classifier = match self.classifier {
            Some(classifier) => Some(classifier),
            None => build_classifier(&config),
        };

        Ok(CourierRuntime {
            config,
            database,
            history,
            send_log,
            transport,
            deny_list,
            classifier,
        })
    }
}

fn build_transport(config: &CourierConfig) -> Result<Arc<dyn SendTransport>> {
    if config.dry_run || config.transport.kind == TransportKind::DryRun {
        tracing::warn!("[DRY-RUN] No messages will actually be sent");
        return Ok(Arc::new(DryRunTransport));
    }
    let transport = TelegramBotTransport::new(
        &config.transport.api_base,
        config.transport.tokens.clone(),
        config.proxy.as_deref(),
    )?;
    Ok(Arc::new(transport))
}

fn build_classifier(config: &CourierConfig) -> Option<Arc<dyn IngestionClassifier>> {
    let classifier = &config.classifier;
    if !classifier.enabled {
        return None;
    }
    let llm = LlmClient::new(
        classifier.llm_api_url.clone(),
        classifier.llm_api_key.clone().unwrap_or_default(),
        classifier.llm_model.clone(),
    );
    tracing::info!("Subject extraction enabled (model: {})", llm.model());
    Some(Arc::new(SubjectExtractor::new(llm)))
}

impl CourierRuntime {
    pub fn bootstrap(config: CourierConfig) -> Result<Self> {
        CourierRuntimeBuilder::new(config).build()
    }

    fn flow_from_record(&self, record: &FlowRecord) -> Flow {
        let template = if record.template_text.trim().is_empty() {
            MessageTemplate::from_file(None)
        } else {
            MessageTemplate::inline(&record.template_text)
        };
        let mut flow = Flow::new(
            &record.name,
            FlowKind::Group,
            &record.queue_path,
            template,
            &self.config.dead_letter_dir,
        );
        flow.send_enabled = record.send_enabled;
        flow.attachments_enabled = record.attachments_enabled;
        flow.subjects_only = record.subjects_only;
        flow.topic_tag = record.topic_tag.clone();
        flow
    }

    /// The auto flow (when enabled) and every stored group flow.
    pub fn flows(&self) -> Result<(Option<Flow>, Vec<Flow>)> {
        let auto_cfg = &self.config.auto_flow;
        let auto = auto_cfg.enabled.then(|| {
            let mut flow = Flow::new(
                "AUTO",
                FlowKind::Auto,
                &auto_cfg.out_file,
                MessageTemplate::from_file(Some(Path::new(&auto_cfg.template_path))),
                &self.config.dead_letter_dir,
            );
            flow.attachments_enabled = auto_cfg.attachments_enabled;
            flow
        });

        let groups = self
            .database
            .list_flows()?
            .iter()
            .map(|record| self.flow_from_record(record))
            .collect();
        Ok((auto, groups))
    }

    pub fn build_supervisor(&self, only: Option<&str>) -> Result<DispatchSupervisor> {
        let (auto, groups) = self.flows()?;
        let flows = select_flows(auto, groups, only, Path::new(&self.config.dead_letter_dir));

        Ok(DispatchSupervisor::new(
            flows,
            self.config.sender_sessions.clone(),
            self.history.clone(),
            self.send_log.clone(),
            self.transport.clone(),
        )
        .with_blocked(self.deny_list.clone())
        .with_pacing(self.config.pacing.clone())
        .with_send_mode(self.config.send_mode)
        .with_cooldown_window(self.config.cooldown_window()))
    }

    /// Run every selected flow until `shutdown` flips to true.
    pub async fn run_sender(&self, only: Option<&str>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.config.sender_sessions.is_empty() {
            anyhow::bail!("No sender_sessions configured");
        }

        let handle = self.build_supervisor(only)?.start().await?;
        let trigger = handle.trigger();
        tokio::spawn(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            trigger.stop();
        });

        handle.wait().await;
        Ok(())
    }

    /// One pass over every selected flow.
    pub async fn run_sender_once(&self, only: Option<&str>) -> Result<Vec<(String, PassReport)>> {
        let reports = self.build_supervisor(only)?.run_once().await?;
        for (flow, report) in &reports {
            tracing::info!("[SEND] {}: {:?}", flow, report);
        }
        Ok(reports)
    }

    pub fn ingestor(&self) -> Result<Ingestor> {
        let mut ingestor = Ingestor::new(self.database.clone(), IngestSettings::from_config(&self.config));
        let kw = &self.config.keyword_filter;
        if kw.enabled {
            ingestor = ingestor.with_keywords(KeywordMatcher::new(&kw.keywords, kw.case_insensitive));
            if let Some(notifier) = self.keyword_notifier()? {
                ingestor = ingestor.with_notifier(notifier);
            }
        }
        if let Some(classifier) = &self.classifier {
            ingestor = ingestor.with_classifier(classifier.clone());
        }
        Ok(ingestor)
    }

    /// The keyword alert bot, when targets and a token are configured.
    fn keyword_notifier(&self) -> Result<Option<Arc<dyn HitNotifier>>> {
        let kw = &self.config.keyword_filter;
        let targets = normalize_targets(&kw.notify_targets);
        if targets.is_empty() {
            return Ok(None);
        }
        let token = kw
            .notify_token
            .as_deref()
            .or(self.config.transport.listener_token.as_deref())
            .filter(|t| !t.trim().is_empty());
        let Some(token) = token else {
            tracing::warn!("[KW-NOTIFY] Targets configured but no bot token; alerts disabled");
            return Ok(None);
        };

        let notifier: Arc<dyn HitNotifier> = Arc::new(BotNotifier::new(
            &self.config.transport.api_base,
            token,
            targets.clone(),
            self.config.proxy.as_deref(),
        )?);
        tracing::info!("[KW-NOTIFY] Alerting {:?} on keyword hits", targets);
        Ok(Some(notifier))
    }

    /// Run the listener and/or the sender until `stop` flips to true. If one
    /// side fails it is logged at once and the other side is stopped, so the
    /// sender still closes its sessions.
    pub async fn serve(
        &self,
        listen: bool,
        send: bool,
        only: Option<&str>,
        stop: Arc<watch::Sender<bool>>,
    ) -> Result<()> {
        let listener = async {
            if !listen {
                return Ok(());
            }
            let result = self.run_listener(stop.subscribe()).await;
            if let Err(e) = &result {
                tracing::error!("[LISTEN] Listener failed: {:#}; stopping", e);
                stop.send_replace(true);
            }
            result
        };
        let sender = async {
            if !send {
                return Ok(());
            }
            let result = self.run_sender(only, stop.subscribe()).await;
            if let Err(e) = &result {
                tracing::error!("[SEND] Sender failed: {:#}; stopping", e);
                stop.send_replace(true);
            }
            result
        };

        let (listened, sent) = tokio::join!(listener, sender);
        listened?;
        sent?;
        Ok(())
    }

    /// Poll the listener bot and ingest until `shutdown` flips to true.
    pub async fn run_listener(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let token = self
            .config
            .transport
            .listener_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .context("No listener token configured (transport.listener_token or COURIER_LISTENER_TOKEN)")?;

        let listener = TelegramListener::new(
            &self.config.transport.api_base,
            token,
            self.config.proxy.as_deref(),
        )?;
        let (tx, rx) = flume::bounded(1024);
        let worker = spawn_ingest_worker(Arc::new(self.ingestor()?), rx);

        listener.run(tx, shutdown).await;
        if let Err(e) = worker.await {
            tracing::error!("[LISTEN] Ingest worker ended abnormally: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupConfig, PacingConfig};
    use crate::transport::testing::ScriptedTransport;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config_in(root: &Path) -> CourierConfig {
        let path = |rel: &str| root.join(rel).to_string_lossy().into_owned();
        let mut config = CourierConfig::default();
        config.sender_sessions = vec!["sender_a".to_string(), "sender_b".to_string()];
        config.database_path = path("data/listen_messages.db");
        config.history_path = path("logs/sent_history.csv");
        config.send_log_path = path("logs/send_log.csv");
        config.dead_letter_dir = path("errors");
        config.outputs_dir = path("outputs");
        config.blocked_senders_path = path("blocked_senders.txt");
        config.auto_flow.out_file = path("outputs/auto_all.txt");
        config.auto_flow.template_path = path("templates/auto_offer.txt");
        config.pacing = PacingConfig::immediate();
        config.groups = vec![GroupConfig {
            name: "physics".to_string(),
            chat: "@physics_group".to_string(),
            out_file: path("outputs/physics.txt"),
            template_path: None,
            attachments_enabled: false,
            send_enabled: true,
            subjects_only: false,
            topic_tag: None,
        }];
        config
    }

    #[test]
    fn bootstrap_seeds_flows_and_honours_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blocked_senders.txt"), "sender_b\n").unwrap();
        let runtime = CourierRuntime::bootstrap(config_in(dir.path())).unwrap();

        assert_eq!(runtime.transport.name(), "dry_run");
        assert!(runtime.deny_list.contains("sender_b"));

        let (auto, groups) = runtime.flows().unwrap();
        assert_eq!(auto.unwrap().kind, FlowKind::Auto);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "physics");
        assert!(groups[0].variant_key().starts_with("physics:tpl-"));
    }

    #[test]
    fn flow_attributes_survive_the_database_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.auto_flow.attachments_enabled = true;
        config.groups[0].attachments_enabled = true;
        config.groups[0].send_enabled = false;
        config.groups[0].subjects_only = true;
        config.groups[0].topic_tag = Some("north_uni".to_string());
        let runtime = CourierRuntime::bootstrap(config).unwrap();

        let (auto, groups) = runtime.flows().unwrap();
        assert!(auto.unwrap().attachments_enabled);

        let physics = &groups[0];
        assert!(physics.attachments_enabled);
        assert!(!physics.send_enabled);
        assert!(physics.subjects_only);
        assert_eq!(physics.topic_tag.as_deref(), Some("north_uni"));
    }

    #[tokio::test]
    async fn dry_run_pass_drains_auto_and_group_queues() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let outputs = PathBuf::from(&config.outputs_dir);
        fs::create_dir_all(&outputs).unwrap();
        fs::write(outputs.join("auto_all.txt"), "@alice\n").unwrap();
        fs::write(outputs.join("physics.txt"), "bob_b\n").unwrap();

        let runtime = CourierRuntime::bootstrap(config).unwrap();
        let reports = runtime.run_sender_once(None).await.unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, "AUTO");
        assert!(reports.iter().all(|(_, r)| r.sent == 1));
        assert_eq!(fs::read_to_string(outputs.join("physics.txt")).unwrap(), "");
        assert_eq!(runtime.history.len(), 2);
    }

    #[tokio::test]
    async fn send_only_targets_one_flow() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let runtime = CourierRuntime::bootstrap(config).unwrap();

        let reports = runtime.run_sender_once(Some("physics")).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "physics");
    }

    #[tokio::test]
    async fn listener_failure_stops_the_sender() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.pacing.idle_sleep_secs = 3600;
        let scripted = Arc::new(ScriptedTransport::new());
        let runtime = CourierRuntimeBuilder::new(config)
            .with_transport(scripted.clone())
            .build()
            .unwrap();

        let (tx, _) = watch::channel(false);
        let stop = Arc::new(tx);
        let served = tokio::time::timeout(
            Duration::from_secs(5),
            runtime.serve(true, true, None, stop.clone()),
        )
        .await
        .expect("sender should stop once the listener fails");

        assert!(served.is_err());
        assert!(*stop.borrow());
        let mut closed = scripted.closed.lock().unwrap().clone();
        closed.sort();
        assert_eq!(closed, vec!["sender_a", "sender_b"]);
    }

    #[test]
    fn keyword_alerts_need_targets_and_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.keyword_filter.enabled = true;
        config.keyword_filter.keywords = vec!["tutor".to_string()];
        config.keyword_filter.notify_targets = vec!["@ops_room".to_string(), "ops_room".to_string()];
        let runtime = CourierRuntime::bootstrap(config.clone()).unwrap();
        assert!(runtime.keyword_notifier().unwrap().is_none());

        config.transport.listener_token = Some("123:abc".to_string());
        let runtime = CourierRuntime::bootstrap(config.clone()).unwrap();
        assert!(runtime.keyword_notifier().unwrap().is_some());

        config.keyword_filter.notify_targets.clear();
        let runtime = CourierRuntime::bootstrap(config).unwrap();
        assert!(runtime.keyword_notifier().unwrap().is_none());
    }

    #[tokio::test]
    async fn listener_requires_a_token() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CourierRuntime::bootstrap(config_in(dir.path())).unwrap();
        let (_tx, rx) = watch::channel(false);
        assert!(runtime.run_listener(rx).await.is_err());
    }
}
