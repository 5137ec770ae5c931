use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{send_checked, ChangeKind, ChannelAdapter, ChannelError, NotificationPayload};

pub struct SlackChannel {
    webhook_url: String,
    client: Client,
    timeout: Duration,
}

impl SlackChannel {
    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn text(p: &NotificationPayload) -> String {
        let kind = match p.change_kind {
            ChangeKind::New => "New audiobook",
            ChangeKind::Updated => "Audiobook updated",
        };
        let headline = match &p.link {
            Some(link) => format!("<{link}|{}>", p.headline()),
            None => p.headline(),
        };
        format!("*{kind}:* {headline}\n{}", p.text_body())
    }
}

#[async_trait]
impl ChannelAdapter for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<(), ChannelError> {
        let body = serde_json::json!({ "text": Self::text(payload) });
        send_checked(
            self.client
                .post(&self.webhook_url)
                .timeout(self.timeout)
                .json(&body),
        )
        .await
    }
}
