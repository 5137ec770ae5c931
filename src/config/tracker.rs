// src/config/tracker.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TrackerError;
use crate::notify::ChannelPolicy;

pub const ENV_CONFIG_PATH: &str = "TRACKER_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/tracker.toml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub retention: RetentionConfig,
    pub notify: NotifyConfig,
    pub provider: ProviderConfig,
    pub ical: IcalConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_secs: u64,
    pub max_parallel_searches: usize,
    pub search_timeout_secs: u64,
    /// Deadline for one whole cycle.
    pub cycle_timeout_secs: u64,
    /// Releases already out on first sighting are not tracked.
    pub skip_released: bool,
    pub match_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3600,
            max_parallel_searches: 4,
            search_timeout_secs: 30,
            cycle_timeout_secs: 900,
            skip_released: true,
            match_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub pool_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("db/audiobooks.db"),
            pool_size: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// 0 = remove on release day.
    pub cleanup_grace_period_days: u32,
    pub cleanup_interval_secs: u64,
    pub vacuum_interval_days: u32,
    /// How often the vacuum due-date is checked.
    pub vacuum_check_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cleanup_grace_period_days: 0,
            cleanup_interval_secs: 6 * 3600,
            vacuum_interval_days: 7,
            vacuum_check_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub send_timeout_secs: u64,
    /// Per-channel send rate, 0 = unlimited.
    pub per_minute: u32,
    pub discord: WebhookChannelConfig,
    pub slack: WebhookChannelConfig,
    pub pushover: PushoverConfig,
    pub email: EmailConfig,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            send_timeout_secs: 15,
            per_minute: 0,
            discord: WebhookChannelConfig::default(),
            slack: WebhookChannelConfig::default(),
            pushover: PushoverConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl NotifyConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookChannelConfig {
    pub enabled: bool,
    pub notify_on_update: bool,
    /// Set `false` to let retention delete records this channel still owes.
    pub required: bool,
    /// Usually injected from the environment.
    pub webhook_url: Option<String>,
}

impl Default for WebhookChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            notify_on_update: false,
            required: true,
            webhook_url: None,
        }
    }
}

impl WebhookChannelConfig {
    pub fn policy(&self) -> ChannelPolicy {
        ChannelPolicy {
            notify_on_update: self.notify_on_update,
            required: self.required,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PushoverConfig {
    pub enabled: bool,
    pub notify_on_update: bool,
    pub required: bool,
    pub priority: i8,
    pub sound: Option<String>,
    pub user_key: Option<String>,
    pub api_token: Option<String>,
}

impl Default for PushoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            notify_on_update: false,
            required: true,
            priority: 0,
            sound: None,
            user_key: None,
            api_token: None,
        }
    }
}

impl PushoverConfig {
    pub fn policy(&self) -> ChannelPolicy {
        ChannelPolicy {
            notify_on_update: self.notify_on_update,
            required: self.required,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub notify_on_update: bool,
    pub required: bool,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            notify_on_update: false,
            required: true,
            smtp_host: None,
            smtp_port: 587,
            smtp_user: None,
            smtp_pass: None,
            from: None,
            to: Vec::new(),
        }
    }
}

impl EmailConfig {
    pub fn policy(&self) -> ChannelPolicy {
        ChannelPolicy {
            notify_on_update: self.notify_on_update,
            required: self.required,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub marketplace: String,
    pub language: String,
    pub results_per_page: u32,
    pub max_pages: u32,
    pub requests_per_minute: u32,
    pub request_timeout_secs: u64,
    /// Search pages are reused for this long; 0 turns the cache off.
    pub cache_ttl_hours: u64,
    pub cache_dir: PathBuf,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.audible.com/1.0/catalog/products".to_string(),
            marketplace: "US".to_string(),
            language: "english".to_string(),
            results_per_page: 50,
            max_pages: 4,
            requests_per_minute: 10,
            request_timeout_secs: 20,
            cache_ttl_hours: 24,
            cache_dir: PathBuf::from("data/cache"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IcalConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_books: usize,
}

impl Default for IcalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("data/audiobooks.ics"),
            max_books: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub metrics: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8000".to_string(),
            metrics: true,
        }
    }
}

impl TrackerConfig {
    /// Parse from TOML text, then sanitise. Secrets are not read here.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: TrackerConfig = toml::from_str(s).context("parsing tracker config")?;
        cfg.sanitize();
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading tracker config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load using env var + fallback, then merge secrets from the environment:
    /// 1) $TRACKER_CONFIG_PATH (must exist)
    /// 2) config/tracker.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(TrackerError::config(format!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display())).into());
            }
            Self::load_from(&pb)?
        } else {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Self::load_from(&default)?
            } else {
                tracing::info!("no {DEFAULT_CONFIG_PATH}; using built-in defaults");
                Self::default()
            }
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Environment wins over file values for credentials.
    pub fn apply_env(&mut self) {
        let var = |k: &str| std::env::var(k).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = var("DISCORD_WEBHOOK_URL") {
            self.notify.discord.webhook_url = Some(v);
        }
        if let Some(v) = var("SLACK_WEBHOOK_URL") {
            self.notify.slack.webhook_url = Some(v);
        }
        if let Some(v) = var("PUSHOVER_USER_KEY") {
            self.notify.pushover.user_key = Some(v);
        }
        if let Some(v) = var("PUSHOVER_API_TOKEN") {
            self.notify.pushover.api_token = Some(v);
        }
        let email = &mut self.notify.email;
        if let Some(v) = var("SMTP_HOST") {
            email.smtp_host = Some(v);
        }
        if let Some(v) = var("SMTP_USER") {
            email.smtp_user = Some(v);
        }
        if let Some(v) = var("SMTP_PASS") {
            email.smtp_pass = Some(v);
        }
        if let Some(v) = var("EMAIL_FROM") {
            email.from = Some(v);
        }
        if let Some(v) = var("EMAIL_TO") {
            email.to = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    fn sanitize(&mut self) {
        let d = EngineConfig::default();
        let e = &mut self.engine;
        if e.poll_interval_secs == 0 {
            e.poll_interval_secs = d.poll_interval_secs;
        }
        if e.search_timeout_secs == 0 {
            e.search_timeout_secs = d.search_timeout_secs;
        }
        if e.cycle_timeout_secs == 0 {
            e.cycle_timeout_secs = d.cycle_timeout_secs;
        }
        e.max_parallel_searches = e.max_parallel_searches.max(1);
        if !(0.0..=1.0).contains(&e.match_threshold) {
            e.match_threshold = d.match_threshold;
        }

        self.store.pool_size = self.store.pool_size.max(1);

        let r = RetentionConfig::default();
        let ret = &mut self.retention;
        if ret.cleanup_interval_secs == 0 {
            ret.cleanup_interval_secs = r.cleanup_interval_secs;
        }
        if ret.vacuum_interval_days == 0 {
            ret.vacuum_interval_days = r.vacuum_interval_days;
        }
        if ret.vacuum_check_interval_secs == 0 {
            ret.vacuum_check_interval_secs = r.vacuum_check_interval_secs;
        }

        let n = &mut self.notify;
        n.max_attempts = n.max_attempts.max(1);
        if n.send_timeout_secs == 0 {
            n.send_timeout_secs = NotifyConfig::default().send_timeout_secs;
        }
        n.backoff_max_ms = n.backoff_max_ms.max(n.backoff_base_ms);

        let p = &mut self.provider;
        p.results_per_page = p.results_per_page.clamp(1, 50);
        p.max_pages = p.max_pages.max(1);
        if p.request_timeout_secs == 0 {
            p.request_timeout_secs = ProviderConfig::default().request_timeout_secs;
        }
    }
}
