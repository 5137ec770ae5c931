//! In-process channel that records payloads and plays back scripted results.
//! Used by tests and by the demo binary when no real channel is configured.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ChannelAdapter, ChannelError, NotificationPayload};

#[derive(Debug, Default)]
struct Inner {
    script: VecDeque<Result<(), ChannelError>>,
    fallback: Option<ChannelError>,
    sent: Vec<NotificationPayload>,
}

/// Cheap to clone; clones share the same script and log.
#[derive(Debug, Clone)]
pub struct RecordingChannel {
    name: String,
    delay: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl RecordingChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            inner: Arc::default(),
        }
    }

    /// Results returned by the next sends, in order. Once used up the
    /// channel falls back to success (or to [`RecordingChannel::failing`]).
    pub fn script(self, results: impl IntoIterator<Item = Result<(), ChannelError>>) -> Self {
        self.inner.lock().script.extend(results);
        self
    }

    /// Every unscripted send fails with `err`.
    pub fn failing(self, err: ChannelError) -> Self {
        self.inner.lock().fallback = Some(err);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every attempt, successful or not.
    pub fn sent(&self) -> Vec<NotificationPayload> {
        self.inner.lock().sent.clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<(), ChannelError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut inner = self.inner.lock();
        inner.sent.push(payload.clone());
        match inner.script.pop_front() {
            Some(r) => r,
            None => match &inner.fallback {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            },
        }
    }
}
