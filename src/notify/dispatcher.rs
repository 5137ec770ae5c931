//! Notification Dispatcher: fans one record out to every registered channel.
//!
//! Each channel runs in its own failure domain with its own retry budget.
//! Every attempt is written to the State Store before the next one starts, so
//! a crash or cancellation leaves the receipt in its last durable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use tracing::{debug, error, info, warn};

use super::{BackoffPolicy, ChangeKind, ChannelError, NotificationPayload, RegisteredChannel};
use crate::model::{CatalogRecord, NotificationReceipt, ReceiptStatus};
use crate::store::{ReceiptGuard, StateStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyDelivered,
    /// A failed-permanently receipt is only reopened by a content update.
    FailedPermanently,
    /// Pending, but the persisted attempt count already used the budget.
    BudgetExhausted,
    /// Delivered before and the channel does not re-send on updates.
    UpdateSuppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { attempts: u32 },
    Skipped(SkipReason),
    FailedPermanently { attempts: u32, error: String },
    /// A receipt write failed; the receipt keeps its last durable state.
    Aborted { error: String },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered { .. } => "delivered",
            DispatchOutcome::Skipped(_) => "skipped",
            DispatchOutcome::FailedPermanently { .. } => "failed_permanently",
            DispatchOutcome::Aborted { .. } => "aborted",
        }
    }
}

pub struct Dispatcher {
    store: Arc<StateStore>,
    channels: Vec<RegisteredChannel>,
    backoff: BackoffPolicy,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<StateStore>, channels: Vec<RegisteredChannel>, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            channels,
            backoff,
            send_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Guard for retention: required channels plus the retry budget.
    pub fn receipt_guard(&self) -> ReceiptGuard {
        ReceiptGuard {
            required_channels: self
                .channels
                .iter()
                .filter(|c| c.policy.required)
                .map(|c| c.name().to_string())
                .collect(),
            max_attempts: self.backoff.max_attempts,
        }
    }

    /// Delivers `record` on every channel concurrently. One channel failing
    /// never affects another.
    pub async fn dispatch(
        &self,
        record: &CatalogRecord,
        kind: ChangeKind,
        changed_fields: &[String],
    ) -> HashMap<String, DispatchOutcome> {
        let payload = NotificationPayload::from_record(record, kind, changed_fields);
        let tasks = self.channels.iter().map(|ch| {
            let payload = &payload;
            async move {
                let outcome = self.dispatch_channel(ch, record, kind, payload).await;
                counter!(
                    "tracker_notifications_total",
                    "channel" => ch.name().to_string(),
                    "outcome" => outcome.label()
                )
                .increment(1);
                (ch.name().to_string(), outcome)
            }
        });
        join_all(tasks).await.into_iter().collect()
    }

    async fn dispatch_channel(
        &self,
        ch: &RegisteredChannel,
        record: &CatalogRecord,
        kind: ChangeKind,
        payload: &NotificationPayload,
    ) -> DispatchOutcome {
        let name = ch.name();
        let id = record.external_id.as_str();
        let max = self.backoff.max_attempts;

        let receipt = record.receipt(name).cloned();
        let used = match (kind, receipt.as_ref()) {
            (ChangeKind::New, Some(r)) => match r.status {
                ReceiptStatus::Delivered => return DispatchOutcome::Skipped(SkipReason::AlreadyDelivered),
                ReceiptStatus::FailedPermanently => {
                    return DispatchOutcome::Skipped(SkipReason::FailedPermanently)
                }
                ReceiptStatus::Pending if !r.is_retryable(max) => {
                    return DispatchOutcome::Skipped(SkipReason::BudgetExhausted)
                }
                ReceiptStatus::Pending => r.attempt_count,
            },
            (ChangeKind::Updated, Some(r)) => {
                let reopen = match r.status {
                    ReceiptStatus::Delivered if !ch.policy.notify_on_update => {
                        debug!(target: "notify", id, channel = name, "update not re-sent on this channel");
                        return DispatchOutcome::Skipped(SkipReason::UpdateSuppressed);
                    }
                    ReceiptStatus::Delivered | ReceiptStatus::FailedPermanently => true,
                    ReceiptStatus::Pending => !r.is_retryable(max),
                };
                if reopen {
                    let (rid, rname) = (id.to_string(), name.to_string());
                    if let Err(e) = self.store.call(move |s| s.reopen_receipt(&rid, &rname)).await {
                        return aborted(id, name, e);
                    }
                    info!(target: "notify", id, channel = name, previous = %r.status, "receipt reopened for update");
                    0
                } else {
                    r.attempt_count
                }
            }
            (_, None) => 0,
        };

        self.deliver(ch, id, payload, used).await
    }

    /// Attempt loop over the remaining budget.
    async fn deliver(
        &self,
        ch: &RegisteredChannel,
        id: &str,
        payload: &NotificationPayload,
        already_used: u32,
    ) -> DispatchOutcome {
        let name = ch.name();
        let max = self.backoff.max_attempts;
        let mut attempt = already_used;

        loop {
            attempt += 1;
            ch.throttle.acquire().await;

            let result = match tokio::time::timeout(self.send_timeout, ch.adapter.send(payload)).await {
                Ok(r) => r,
                Err(_) => Err(ChannelError::Transient(format!(
                    "send timed out after {}s",
                    self.send_timeout.as_secs_f32()
                ))),
            };

            match result {
                Ok(()) => {
                    return match self.write_receipt(id, name, ReceiptStatus::Delivered, None).await {
                        Ok(r) => {
                            info!(target: "notify", id, channel = name, attempts = r.attempt_count, "delivered");
                            DispatchOutcome::Delivered { attempts: r.attempt_count }
                        }
                        Err(e) => aborted(id, name, e),
                    };
                }
                Err(err) => {
                    let exhausted = attempt >= max;
                    if err.is_permanent() || exhausted {
                        return match self
                            .write_receipt(id, name, ReceiptStatus::FailedPermanently, Some(err.message()))
                            .await
                        {
                            Ok(r) => {
                                error!(
                                    target: "notify",
                                    id,
                                    channel = name,
                                    attempts = r.attempt_count,
                                    permanent = err.is_permanent(),
                                    "delivery failed permanently: {err}"
                                );
                                counter!("tracker_notifications_failed_permanently_total", "channel" => name.to_string())
                                    .increment(1);
                                DispatchOutcome::FailedPermanently {
                                    attempts: r.attempt_count,
                                    error: err.message().to_string(),
                                }
                            }
                            Err(e) => aborted(id, name, e),
                        };
                    }

                    let receipt: NotificationReceipt = match self
                        .write_receipt(id, name, ReceiptStatus::Pending, Some(err.message()))
                        .await
                    {
                        Ok(r) => r,
                        Err(e) => return aborted(id, name, e),
                    };
                    let delay = self.backoff.delay(attempt - already_used);
                    warn!(
                        target: "notify",
                        id,
                        channel = name,
                        attempt = receipt.attempt_count,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        "transient delivery failure, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn write_receipt(
        &self,
        id: &str,
        channel: &str,
        status: ReceiptStatus,
        error: Option<&str>,
    ) -> Result<NotificationReceipt, StoreError> {
        let (id, channel, error) = (id.to_string(), channel.to_string(), error.map(str::to_string));
        self.store
            .call(move |s| s.record_receipt(&id, &channel, status, error.as_deref()))
            .await
    }
}

fn aborted(id: &str, channel: &str, e: StoreError) -> DispatchOutcome {
    error!(target: "notify", id, channel, "receipt write failed: {e}");
    DispatchOutcome::Aborted { error: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelPolicy, RecordingChannel};
    use crate::store::StoreOptions;
    use chrono::{NaiveDate, Utc};

    fn setup() -> (tempfile::TempDir, Arc<StateStore>, CatalogRecord) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(&dir.path().join("t.db"), StoreOptions::default()).unwrap());
        let now = Utc::now();
        let rec = CatalogRecord {
            external_id: "X1".into(),
            details: crate::model::ReleaseDetails {
                title: "Book A".into(),
                author: "Jane Author".into(),
                series: None,
                series_sequence: None,
                narrators: vec!["Jane".into()],
                publisher: None,
                release_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                summary: None,
            },
            link: None,
            complete: false,
            receipts: Default::default(),
            first_seen: now,
            last_seen: now,
        };
        store.upsert(&rec).unwrap();
        (dir, store, rec)
    }

    fn fast() -> BackoffPolicy {
        BackoffPolicy::new(3, Duration::from_millis(1)).with_jitter(0.0)
    }

    #[tokio::test]
    async fn transient_then_success_counts_attempts() {
        let (_d, store, rec) = setup();
        let ch = RecordingChannel::new("push")
            .script([Err(ChannelError::Transient("503".into())), Ok(())]);
        let d = Dispatcher::new(
            store.clone(),
            vec![RegisteredChannel::new(Arc::new(ch.clone()), ChannelPolicy::default())],
            fast(),
        );
        let out = d.dispatch(&rec, ChangeKind::New, &[]).await;
        assert_eq!(out["push"], DispatchOutcome::Delivered { attempts: 2 });
        assert_eq!(ch.sent().len(), 2);
        let stored = store.get("X1").unwrap().unwrap();
        assert_eq!(stored.receipt_status("push"), Some(ReceiptStatus::Delivered));
    }

    #[tokio::test]
    async fn exhausted_budget_fails_permanently() {
        let (_d, store, rec) = setup();
        let ch = RecordingChannel::new("push").failing(ChannelError::Transient("down".into()));
        let d = Dispatcher::new(
            store.clone(),
            vec![RegisteredChannel::new(Arc::new(ch.clone()), ChannelPolicy::default())],
            fast(),
        );
        let out = d.dispatch(&rec, ChangeKind::New, &[]).await;
        assert_eq!(
            out["push"],
            DispatchOutcome::FailedPermanently { attempts: 3, error: "down".into() }
        );
        assert_eq!(ch.sent().len(), 3);

        // not retried automatically
        let stored = store.get("X1").unwrap().unwrap();
        let out = d.dispatch(&stored, ChangeKind::New, &[]).await;
        assert_eq!(out["push"], DispatchOutcome::Skipped(SkipReason::FailedPermanently));
        assert_eq!(ch.sent().len(), 3);
    }

    #[tokio::test]
    async fn update_reopens_failed_receipt() {
        let (_d, store, rec) = setup();
        let ch = RecordingChannel::new("push")
            .script([Err(ChannelError::Permanent("401".into())), Ok(())]);
        let d = Dispatcher::new(
            store.clone(),
            vec![RegisteredChannel::new(Arc::new(ch.clone()), ChannelPolicy::default())],
            fast(),
        );
        d.dispatch(&rec, ChangeKind::New, &[]).await;
        let stored = store.get("X1").unwrap().unwrap();
        assert_eq!(stored.receipt_status("push"), Some(ReceiptStatus::FailedPermanently));

        let out = d
            .dispatch(&stored, ChangeKind::Updated, &["title".to_string()])
            .await;
        assert_eq!(out["push"], DispatchOutcome::Delivered { attempts: 1 });
        assert_eq!(ch.sent()[1].change_summary.as_deref(), Some("Changed: title"));
    }

    #[tokio::test]
    async fn send_timeout_is_transient() {
        let (_d, store, rec) = setup();
        let ch = RecordingChannel::new("slow").with_delay(Duration::from_millis(200));
        let d = Dispatcher::new(
            store.clone(),
            vec![RegisteredChannel::new(Arc::new(ch), ChannelPolicy::default())],
            BackoffPolicy::new(1, Duration::from_millis(1)),
        )
        .with_send_timeout(Duration::from_millis(20));
        let out = d.dispatch(&rec, ChangeKind::New, &[]).await;
        assert!(matches!(out["slow"], DispatchOutcome::FailedPermanently { attempts: 1, .. }));
    }

    #[test]
    fn guard_lists_required_channels() {
        let (_d, store, _) = setup();
        let d = Dispatcher::new(
            store,
            vec![
                RegisteredChannel::new(
                    Arc::new(RecordingChannel::new("a")),
                    ChannelPolicy { notify_on_update: false, required: true },
                ),
                RegisteredChannel::new(
                    Arc::new(RecordingChannel::new("b")),
                    ChannelPolicy { notify_on_update: false, required: false },
                ),
            ],
            fast(),
        );
        assert_eq!(
            d.receipt_guard(),
            ReceiptGuard { required_channels: vec!["a".into()], max_attempts: 3 }
        );
    }

    #[test]
    fn default_config_keeps_records_an_enabled_channel_still_owes() {
        let (_d, store, _) = setup();
        let mut cfg = crate::config::TrackerConfig::default();
        cfg.notify.discord.enabled = true;
        cfg.notify.discord.webhook_url = Some("https://discord.test/hook".into());

        let d = Dispatcher::new(
            store.clone(),
            crate::notify::channels_from_config(&cfg.notify),
            BackoffPolicy::new(cfg.notify.max_attempts, Duration::from_millis(1)),
        );
        let guard = d.receipt_guard();
        assert_eq!(guard.required_channels, vec!["discord".to_string()]);

        // X1 released 2025-03-01; one transient failure used 1 of 3 attempts.
        store
            .record_receipt("X1", "discord", ReceiptStatus::Pending, Some("503"))
            .unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        assert_eq!(store.delete_expired(today, 0, &guard).unwrap(), 0);
        assert!(store.get("X1").unwrap().is_some());
    }
}
