use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{send_checked, truncate, ChangeKind, ChannelAdapter, ChannelError, NotificationPayload};

const EMBED_COLOR_NEW: u32 = 0x00b0f4;
const EMBED_COLOR_UPDATED: u32 = 0xf39c12;
const DESCRIPTION_MAX: usize = 4000;

#[derive(Clone)]
pub struct DiscordChannel {
    webhook: String,
    client: Client,
    timeout: Duration,
    username: String,
}

impl DiscordChannel {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(10),
            username: "AudioStacker".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    fn build_payload(&self, p: &NotificationPayload) -> DiscordWebhookPayload {
        let mut description = format!(
            "**Author:** {}\n**Narrator:** {}\n**Release date:** {}",
            p.author,
            p.narrators_line(),
            p.release_date.format("%B %-d, %Y"),
        );
        if let Some(publisher) = &p.publisher {
            description.push_str(&format!("\n**Publisher:** {publisher}"));
        }
        if let Some(change) = &p.change_summary {
            description.push_str(&format!("\n\n_{change}_"));
        }

        let (prefix, color) = match p.change_kind {
            ChangeKind::New => ("New release", EMBED_COLOR_NEW),
            ChangeKind::Updated => ("Updated release", EMBED_COLOR_UPDATED),
        };

        DiscordWebhookPayload {
            username: self.username.clone(),
            content: Some(format!("{prefix}: {}", p.title)),
            embeds: vec![DiscordEmbed {
                title: truncate(&p.headline(), 256),
                url: p.link.clone(),
                description: truncate(&description, DESCRIPTION_MAX),
                color,
                footer: DiscordFooter {
                    text: format!("ASIN: {}", p.external_id),
                },
            }],
        }
    }
}

#[async_trait]
impl ChannelAdapter for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<(), ChannelError> {
        let body = self.build_payload(payload);
        send_checked(
            self.client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&body),
        )
        .await
    }
}

#[derive(Serialize)]
struct DiscordFooter {
    text: String,
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    description: String,
    color: u32,
    footer: DiscordFooter,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    username: String,
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}
