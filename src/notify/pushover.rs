//! Pushover push notifications (form-encoded POST).

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{send_checked, truncate, ChangeKind, ChannelAdapter, ChannelError, NotificationPayload};

const API_URL: &str = "https://api.pushover.net/1/messages.json";
const TITLE_MAX: usize = 250;
const MESSAGE_MAX: usize = 1024;

pub struct PushoverChannel {
    user_key: String,
    api_token: String,
    api_url: String,
    priority: i8,
    sound: Option<String>,
    client: Client,
    timeout: Duration,
}

impl PushoverChannel {
    pub fn new(user_key: String, api_token: String) -> Self {
        Self {
            user_key,
            api_token,
            api_url: API_URL.to_string(),
            priority: 0,
            sound: None,
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pushover accepts -2..=2.
    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority.clamp(-2, 2);
        self
    }

    pub fn with_sound(mut self, sound: Option<String>) -> Self {
        self.sound = sound.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn form(&self, p: &NotificationPayload) -> Vec<(&'static str, String)> {
        let title = match p.change_kind {
            ChangeKind::New => format!("New audiobook: {}", p.title),
            ChangeKind::Updated => format!("Updated audiobook: {}", p.title),
        };
        let mut message = p.text_body();
        if let Some(series) = &p.series_label {
            message = format!("Series: {series}\n{message}");
        }

        let mut form = vec![
            ("token", self.api_token.clone()),
            ("user", self.user_key.clone()),
            ("title", truncate(&title, TITLE_MAX)),
            ("message", truncate(&message, MESSAGE_MAX)),
            ("priority", self.priority.to_string()),
        ];
        if let Some(link) = &p.link {
            form.push(("url", link.clone()));
            form.push(("url_title", "Open on Audible".to_string()));
        }
        if let Some(sound) = &self.sound {
            form.push(("sound", sound.clone()));
        }
        form
    }
}

#[async_trait]
impl ChannelAdapter for PushoverChannel {
    fn name(&self) -> &str {
        "pushover"
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<(), ChannelError> {
        send_checked(
            self.client
                .post(&self.api_url)
                .timeout(self.timeout)
                .form(&self.form(payload)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn form_respects_limits() {
        let ch = PushoverChannel::new("u".into(), "t".into()).with_priority(9);
        let p = NotificationPayload {
            external_id: "X1".into(),
            title: "T".repeat(400),
            author: "A".into(),
            series_label: None,
            narrators: vec!["N".repeat(2000)],
            publisher: None,
            release_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            summary: None,
            link: Some("https://www.audible.com/pd/X1".into()),
            change_kind: ChangeKind::New,
            change_summary: None,
        };
        let form = ch.form(&p);
        let get = |k: &str| form.iter().find(|(key, _)| *key == k).map(|(_, v)| v.clone());
        assert_eq!(get("title").unwrap().chars().count(), TITLE_MAX);
        assert_eq!(get("message").unwrap().chars().count(), MESSAGE_MAX);
        assert_eq!(get("priority").as_deref(), Some("2"));
        assert_eq!(get("url_title").as_deref(), Some("Open on Audible"));
    }
}
