//! Notification fan-out: channel adapters, error classification and the
//! dispatcher that owns per-channel retry and receipts.

pub mod backoff;
pub mod discord;
pub mod dispatcher;
pub mod email;
pub mod memory;
pub mod pushover;
pub mod slack;
pub mod throttle;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::config::NotifyConfig;
use crate::model::CatalogRecord;

pub use backoff::BackoffPolicy;
pub use dispatcher::{DispatchOutcome, Dispatcher, SkipReason};
pub use memory::RecordingChannel;
pub use throttle::Throttle;

/// Delivery failure, classified by the adapter that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Network trouble, timeouts, 5xx, 429. Retried per backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Bad request, bad credentials, bad address. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ChannelError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ChannelError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ChannelError::Transient(m) | ChannelError::Permanent(m) => m,
        }
    }
}

/// Shared predicate for HTTP based adapters.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> ChannelError {
    let msg = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(body.trim(), 300))
    };
    match status.as_u16() {
        408 | 429 => ChannelError::Transient(msg),
        s if (500..600).contains(&s) => ChannelError::Transient(msg),
        _ => ChannelError::Permanent(msg),
    }
}

/// Transport-level reqwest failures: connection and timeout problems are
/// transient, a request that could not even be built is not.
pub fn classify_reqwest(err: &reqwest::Error) -> ChannelError {
    if let Some(status) = err.status() {
        return classify_status(status, "");
    }
    if err.is_builder() {
        ChannelError::Permanent(format!("invalid request: {err}"))
    } else {
        ChannelError::Transient(format!("request failed: {err}"))
    }
}

/// POSTs and maps the response through [`classify_status`].
pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<(), ChannelError> {
    let rsp = req.send().await.map_err(|e| classify_reqwest(&e))?;
    let status = rsp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = rsp.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Updated,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Updated => "updated",
        }
    }
}

/// Channel-agnostic message content. Adapters format it themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub external_id: String,
    pub title: String,
    pub author: String,
    pub series_label: Option<String>,
    pub narrators: Vec<String>,
    pub publisher: Option<String>,
    pub release_date: NaiveDate,
    pub summary: Option<String>,
    pub link: Option<String>,
    pub change_kind: ChangeKind,
    /// Human readable "what changed" line, empty for new releases.
    pub change_summary: Option<String>,
}

impl NotificationPayload {
    pub fn from_record(record: &CatalogRecord, kind: ChangeKind, changed_fields: &[String]) -> Self {
        let d = &record.details;
        let change_summary = match kind {
            ChangeKind::Updated if !changed_fields.is_empty() => {
                Some(format!("Changed: {}", changed_fields.join(", ")))
            }
            _ => None,
        };
        Self {
            external_id: record.external_id.clone(),
            title: d.title.clone(),
            author: d.author.clone(),
            series_label: d.series_label(),
            narrators: d.narrators.clone(),
            publisher: d.publisher.clone(),
            release_date: d.release_date,
            summary: d.summary.clone(),
            link: record.link.clone(),
            change_kind: kind,
            change_summary,
        }
    }

    /// "Title (Series #2)" or just the title.
    pub fn headline(&self) -> String {
        match &self.series_label {
            Some(series) => format!("{} ({series})", self.title),
            None => self.title.clone(),
        }
    }

    pub fn narrators_line(&self) -> String {
        if self.narrators.is_empty() {
            "Unknown".to_string()
        } else {
            self.narrators.join(", ")
        }
    }

    /// Plain-text body shared by text-only channels.
    pub fn text_body(&self) -> String {
        let mut lines = vec![
            format!("Author: {}", self.author),
            format!("Narrator: {}", self.narrators_line()),
        ];
        if let Some(p) = &self.publisher {
            lines.push(format!("Publisher: {p}"));
        }
        lines.push(format!("Release date: {}", self.release_date));
        if let Some(c) = &self.change_summary {
            lines.push(c.clone());
        }
        if let Some(link) = &self.link {
            lines.push(link.clone());
        }
        lines.join("\n")
    }
}

/// Transport for one channel. Implementations own formatting and wire format.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable channel identifier used as the receipt key.
    fn name(&self) -> &str;

    async fn send(&self, payload: &NotificationPayload) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
    /// Re-send on content updates even after a successful delivery.
    pub notify_on_update: bool,
    /// Expired records are kept until this channel stops owing a delivery.
    /// On unless a channel opts out.
    pub required: bool,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            notify_on_update: false,
            required: true,
        }
    }
}

/// An adapter plus the policy and throttle it runs under.
#[derive(Clone)]
pub struct RegisteredChannel {
    pub adapter: Arc<dyn ChannelAdapter>,
    pub policy: ChannelPolicy,
    pub throttle: Arc<Throttle>,
}

impl RegisteredChannel {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, policy: ChannelPolicy) -> Self {
        Self {
            adapter,
            policy,
            throttle: Arc::new(Throttle::unlimited()),
        }
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = Arc::new(throttle);
        self
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }
}

impl std::fmt::Debug for RegisteredChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredChannel")
            .field("name", &self.adapter.name())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Builds the enabled channels. A channel that is enabled but misses its
/// credentials is left out with a warning.
pub fn channels_from_config(cfg: &NotifyConfig) -> Vec<RegisteredChannel> {
    let mut out = Vec::new();
    let timeout = std::time::Duration::from_secs(cfg.send_timeout_secs);

    let mut push = |adapter: Arc<dyn ChannelAdapter>, policy: ChannelPolicy| {
        out.push(RegisteredChannel::new(adapter, policy).with_throttle(Throttle::per_minute(cfg.per_minute)));
    };

    if cfg.discord.enabled {
        match cfg.discord.webhook_url.as_deref() {
            Some(url) => push(
                Arc::new(discord::DiscordChannel::new(url.to_string()).with_timeout(timeout)),
                cfg.discord.policy(),
            ),
            None => tracing::warn!(target: "notify", "discord enabled but DISCORD_WEBHOOK_URL is not set"),
        }
    }
    if cfg.slack.enabled {
        match cfg.slack.webhook_url.as_deref() {
            Some(url) => push(
                Arc::new(slack::SlackChannel::new(url.to_string()).with_timeout(timeout)),
                cfg.slack.policy(),
            ),
            None => tracing::warn!(target: "notify", "slack enabled but SLACK_WEBHOOK_URL is not set"),
        }
    }
    if cfg.pushover.enabled {
        match (cfg.pushover.user_key.as_deref(), cfg.pushover.api_token.as_deref()) {
            (Some(user), Some(token)) => push(
                Arc::new(
                    pushover::PushoverChannel::new(user.to_string(), token.to_string())
                        .with_timeout(timeout)
                        .with_priority(cfg.pushover.priority)
                        .with_sound(cfg.pushover.sound.clone()),
                ),
                cfg.pushover.policy(),
            ),
            _ => tracing::warn!(target: "notify", "pushover enabled but PUSHOVER_USER_KEY / PUSHOVER_API_TOKEN missing"),
        }
    }
    if cfg.email.enabled {
        match email::EmailChannel::from_config(&cfg.email) {
            Ok(ch) => push(Arc::new(ch), cfg.email.policy()),
            Err(e) => tracing::warn!(target: "notify", "email enabled but unusable: {e:#}"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification() {
        assert!(!classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_permanent());
        assert!(!classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_permanent());
        assert!(!classify_status(StatusCode::REQUEST_TIMEOUT, "").is_permanent());
        assert!(classify_status(StatusCode::UNAUTHORIZED, "bad token").is_permanent());
        assert!(classify_status(StatusCode::NOT_FOUND, "").is_permanent());
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, " nope ").message(),
            "HTTP 400 Bad Request: nope"
        );
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
    }
}
