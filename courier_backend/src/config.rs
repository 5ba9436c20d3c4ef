use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identity::{SendMode, DEFAULT_TURN_CAP};
use crate::transport::CooldownPolicy;

/// Inclusive range of seconds a randomized delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateRange {
    #[serde(alias = "min")]
    pub min_seconds: f64,
    #[serde(alias = "max")]
    pub max_seconds: f64,
}

impl RateRange {
    pub const fn new(min_seconds: f64, max_seconds: f64) -> Self {
        Self {
            min_seconds,
            max_seconds,
        }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn sample(&self) -> Duration {
        let min = self.min_seconds.max(0.0);
        let max = self.max_seconds.max(min);
        let secs = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Delay after every send attempt, unless overridden per account.
    #[serde(default = "default_send_delay")]
    pub send_delay: RateRange,
    #[serde(default)]
    pub per_account_rate: HashMap<String, RateRange>,
    /// Small jitter before each outbound send.
    #[serde(default = "default_pre_send_delay")]
    pub pre_send_delay: RateRange,
    #[serde(default = "default_idle_sleep_secs")]
    pub idle_sleep_secs: u64,
    #[serde(default = "default_exhausted_sleep_secs")]
    pub exhausted_sleep_secs: u64,
    #[serde(default = "default_turn_cap")]
    pub turn_cap: u32,
    #[serde(default = "default_turn_cooldown")]
    pub turn_cooldown: RateRange,
    #[serde(default = "default_flood_cooldown_secs")]
    pub flood_cooldown_secs: u64,
    #[serde(default = "default_transient_cooldown_secs")]
    pub transient_cooldown_secs: u64,
    #[serde(default = "default_flood_wait_padding_secs")]
    pub flood_wait_padding_secs: u64,
}

fn default_send_delay() -> RateRange {
    RateRange::new(3.5, 8.5)
}

fn default_pre_send_delay() -> RateRange {
    RateRange::new(2.5, 6.0)
}

fn default_idle_sleep_secs() -> u64 {
    300
}

fn default_exhausted_sleep_secs() -> u64 {
    5
}

fn default_turn_cap() -> u32 {
    DEFAULT_TURN_CAP
}

fn default_turn_cooldown() -> RateRange {
    RateRange::new(20.0, 40.0)
}

fn default_flood_cooldown_secs() -> u64 {
    6 * 3600
}

fn default_transient_cooldown_secs() -> u64 {
    300
}

fn default_flood_wait_padding_secs() -> u64 {
    2
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            send_delay: default_send_delay(),
            per_account_rate: HashMap::new(),
            pre_send_delay: default_pre_send_delay(),
            idle_sleep_secs: default_idle_sleep_secs(),
            exhausted_sleep_secs: default_exhausted_sleep_secs(),
            turn_cap: default_turn_cap(),
            turn_cooldown: default_turn_cooldown(),
            flood_cooldown_secs: default_flood_cooldown_secs(),
            transient_cooldown_secs: default_transient_cooldown_secs(),
            flood_wait_padding_secs: default_flood_wait_padding_secs(),
        }
    }
}

impl PacingConfig {
    /// No delays at all; cooldown durations keep their defaults.
    pub fn immediate() -> Self {
        Self {
            send_delay: RateRange::zero(),
            pre_send_delay: RateRange::zero(),
            idle_sleep_secs: 0,
            exhausted_sleep_secs: 0,
            ..Self::default()
        }
    }

    pub fn inter_send_delay(&self, session: &str) -> RateRange {
        self.per_account_rate
            .get(session)
            .copied()
            .unwrap_or(self.send_delay)
    }

    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy {
            flood: secs(self.flood_cooldown_secs),
            transient: secs(self.transient_cooldown_secs),
            flood_wait_padding: secs(self.flood_wait_padding_secs),
        }
    }
}

/// Seconds as a chrono duration, saturating at the largest representable one.
fn secs(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// A monitored group and the outreach flow fed from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub name: String,
    /// `@username` or numeric chat id of the monitored source.
    pub chat: String,
    pub out_file: String,
    #[serde(default)]
    pub template_path: Option<String>,
    #[serde(default)]
    pub attachments_enabled: bool,
    #[serde(default = "default_true")]
    pub send_enabled: bool,
    #[serde(default)]
    pub subjects_only: bool,
    /// Several chats may share one topic tag; defaults to the group name.
    #[serde(default, alias = "uni_tag")]
    pub topic_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFlowConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_auto_out_file")]
    pub out_file: String,
    #[serde(default = "default_auto_template_path")]
    pub template_path: String,
    #[serde(default)]
    pub attachments_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_auto_out_file() -> String {
    "outputs/auto_all.txt".to_string()
}

fn default_auto_template_path() -> String {
    "templates/auto_offer.txt".to_string()
}

impl Default for AutoFlowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            out_file: default_auto_out_file(),
            template_path: default_auto_template_path(),
            attachments_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_keyword_out_file")]
    pub out_file: String,
    /// Chats alerted on every hit (`@name`, t.me link or numeric id).
    #[serde(default)]
    pub notify_targets: Vec<String>,
    /// Bot posting the alerts; falls back to the listener token.
    #[serde(default)]
    pub notify_token: Option<String>,
}

fn default_keyword_out_file() -> String {
    "outputs/keyword_hits.txt".to_string()
}

impl Default for KeywordFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            case_insensitive: true,
            keywords: Vec::new(),
            out_file: default_keyword_out_file(),
            notify_targets: Vec::new(),
            notify_token: None,
        }
    }
}

/// Optional LLM-backed subject extraction during ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4.1-mini".to_string()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    DryRun,
    #[default]
    TelegramBot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Bot token per sender session.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    #[serde(default)]
    pub listener_token: Option<String>,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            api_base: default_api_base(),
            tokens: HashMap::new(),
            listener_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            path: None,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenScope {
    /// Only chats with a configured flow, plus keyword/subject hits anywhere.
    #[default]
    Configured,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub sender_sessions: Vec<String>,
    #[serde(default)]
    pub send_mode: SendMode,
    #[serde(default = "default_cooldown_days")]
    pub cooldown_days: u32,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub exclude_no_username: bool,
    #[serde(default)]
    pub listen_scope: ListenScope,

    #[serde(default = "default_blocked_senders_path")]
    pub blocked_senders_path: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_history_path")]
    pub history_path: String,
    #[serde(default = "default_send_log_path")]
    pub send_log_path: String,
    #[serde(default = "default_dead_letter_dir")]
    pub dead_letter_dir: String,
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: String,

    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default, alias = "auto_reply")]
    pub auto_flow: AutoFlowConfig,
    #[serde(default)]
    pub keyword_filter: KeywordFilterConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
}

fn default_cooldown_days() -> u32 {
    5
}

fn default_blocked_senders_path() -> String {
    "blocked_senders.txt".to_string()
}

fn default_database_path() -> String {
    "data/listen_messages.db".to_string()
}

fn default_history_path() -> String {
    "logs/sent_history.csv".to_string()
}

fn default_send_log_path() -> String {
    "logs/send_log.csv".to_string()
}

fn default_dead_letter_dir() -> String {
    "errors".to_string()
}

fn default_outputs_dir() -> String {
    "outputs".to_string()
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            sender_sessions: Vec::new(),
            send_mode: SendMode::default(),
            cooldown_days: default_cooldown_days(),
            dry_run: true,
            exclude_no_username: true,
            listen_scope: ListenScope::default(),
            blocked_senders_path: default_blocked_senders_path(),
            database_path: default_database_path(),
            history_path: default_history_path(),
            send_log_path: default_send_log_path(),
            dead_letter_dir: default_dead_letter_dir(),
            outputs_dir: default_outputs_dir(),
            proxy: None,
            logging: LoggingConfig::default(),
            groups: Vec::new(),
            auto_flow: AutoFlowConfig::default(),
            keyword_filter: KeywordFilterConfig::default(),
            classifier: ClassifierConfig::default(),
            transport: TransportConfig::default(),
            pacing: PacingConfig::default(),
        }
    }
}

fn env_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

impl CourierConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Default config location: `courier_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("courier_config.toml")
    }

    /// Load from `path`. A missing file yields defaults; a file that does not
    /// parse is an error. Environment overrides are applied last.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str::<CourierConfig>(&contents)
                    .with_context(|| format!("Failed to parse {:?}", path))?;
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };
        Ok(config.with_env_overrides())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(flag) = env::var("COURIER_DRY_RUN") {
            self.dry_run = env_flag(&flag);
        }

        if let Ok(mode) = env::var("COURIER_SEND_MODE") {
            match SendMode::parse(&mode) {
                Some(mode) => self.send_mode = mode,
                None => tracing::warn!("Ignoring unknown COURIER_SEND_MODE {:?}", mode),
            }
        }

        if let Ok(days) = env::var("COURIER_COOLDOWN_DAYS") {
            if let Ok(days) = days.parse() {
                self.cooldown_days = days;
            }
        }

        if let Ok(token) = env::var("COURIER_LISTENER_TOKEN") {
            if !token.trim().is_empty() {
                self.transport.listener_token = Some(token.trim().to_string());
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.classifier.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.classifier.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.classifier.llm_api_key = Some(key);
            }
        }

        self
    }

    pub fn cooldown_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.cooldown_days as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: CourierConfig = toml::from_str("").unwrap();
        assert_eq!(config.send_mode, SendMode::RoundRobin);
        assert_eq!(config.cooldown_days, 5);
        assert!(config.dry_run);
        assert!(config.auto_flow.enabled);
        assert_eq!(config.auto_flow.out_file, "outputs/auto_all.txt");
        assert_eq!(config.pacing.turn_cap, 2);
        assert_eq!(config.pacing.idle_sleep_secs, 300);
        assert_eq!(config.transport.kind, TransportKind::TelegramBot);
    }

    #[test]
    fn parses_groups_and_rates() {
        let raw = r#"
            sender_sessions = ["sender_a", "sender_b"]
            send_mode = "single_account"
            cooldown_days = 3

            [[groups]]
            name = "physics"
            chat = "@physics_group"
            out_file = "outputs/physics.txt"
            uni_tag = "north_uni"
            subjects_only = true

            [pacing.per_account_rate.sender_b]
            min = 10
            max = 20
        "#;
        let config: CourierConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.send_mode, SendMode::Single);
        assert_eq!(config.cooldown_window(), chrono::Duration::days(3));

        let group = &config.groups[0];
        assert!(group.send_enabled);
        assert!(group.subjects_only);
        assert_eq!(group.topic_tag.as_deref(), Some("north_uni"));

        assert_eq!(
            config.pacing.inter_send_delay("sender_b"),
            RateRange::new(10.0, 20.0)
        );
        assert_eq!(
            config.pacing.inter_send_delay("sender_a"),
            RateRange::new(3.5, 8.5)
        );
    }

    #[test]
    fn oversized_cooldown_settings_saturate() {
        let mut pacing = PacingConfig::default();
        pacing.flood_cooldown_secs = u64::MAX;
        pacing.flood_wait_padding_secs = 3;

        let policy = pacing.cooldown_policy();
        assert_eq!(policy.flood, chrono::Duration::MAX);
        assert_eq!(policy.flood_wait_padding, chrono::Duration::seconds(3));
    }

    #[test]
    fn missing_file_falls_back_and_bad_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = CourierConfig::load_from(dir.path().join("nope.toml")).unwrap();
        assert_eq!(missing.history_path, "logs/sent_history.csv");

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "cooldown_days = \"many\"").unwrap();
        assert!(CourierConfig::load_from(&bad).is_err());
    }

    #[test]
    fn save_then_load_preserves_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier_config.toml");
        let mut config = CourierConfig::default();
        config.sender_sessions = vec!["sender_a".to_string()];
        config.save(&path).unwrap();

        let loaded = CourierConfig::load_from(&path).unwrap();
        assert_eq!(loaded.sender_sessions, vec!["sender_a".to_string()]);
    }

    #[test]
    fn rate_range_samples_inside_bounds() {
        let range = RateRange::new(0.5, 1.0);
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_secs_f64(0.5) && d <= Duration::from_secs_f64(1.0));
        }
        assert_eq!(RateRange::zero().sample(), Duration::ZERO);
    }
}
