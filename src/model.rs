//! Core data model: watched entities, raw search candidates, persisted catalog
//! records and their per-channel notification receipts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which catalog field a query term is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    Author,
    Title,
    Keywords,
}

impl SearchField {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchField::Author => "author",
            SearchField::Title => "title",
            SearchField::Keywords => "keywords",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityQuery {
    pub term: String,
    pub field: SearchField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Author,
    Series,
}

/// An author or series the user tracks. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEntity {
    pub id: String,
    pub display_name: String,
    pub kind: EntityKind,
    pub query: EntityQuery,
    /// Only releases in this series are tracked for the entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_filter: Option<String>,
    /// Author the releases must be credited to (author entities set this to themselves).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_filter: Option<String>,
}

impl WatchedEntity {
    pub fn author(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("author:{}", crate::normalize::normalize_key(&name)),
            display_name: name.clone(),
            kind: EntityKind::Author,
            query: EntityQuery {
                term: name.clone(),
                field: SearchField::Author,
            },
            series_filter: None,
            author_filter: Some(name),
        }
    }

    pub fn series(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("series:{}", crate::normalize::normalize_key(&name)),
            display_name: name.clone(),
            kind: EntityKind::Series,
            query: EntityQuery {
                term: name.clone(),
                field: SearchField::Keywords,
            },
            series_filter: Some(name),
            author_filter: None,
        }
    }

    pub fn with_series_filter(mut self, series: impl Into<String>) -> Self {
        let series = series.into();
        self.id = format!("{}+{}", self.id, crate::normalize::normalize_key(&series));
        self.series_filter = Some(series);
        self
    }

    pub fn with_author_filter(mut self, author: impl Into<String>) -> Self {
        self.author_filter = Some(author.into());
        self
    }
}

/// One search hit as returned by a [`crate::provider::SearchProvider`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub external_id: Option<String>,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub series_sequence: Option<String>,
    #[serde(default)]
    pub narrators: Vec<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    pub release_date: Option<NaiveDate>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// Descriptive fields of a release. These (and only these) take part in change detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDetails {
    pub title: String,
    pub author: String,
    pub series: Option<String>,
    pub series_sequence: Option<String>,
    pub narrators: Vec<String>,
    pub publisher: Option<String>,
    pub release_date: NaiveDate,
    pub summary: Option<String>,
}

impl ReleaseDetails {
    /// Names of the fields that differ, in declaration order.
    pub fn diff(&self, other: &ReleaseDetails) -> Vec<String> {
        let mut out = Vec::new();
        if self.title != other.title {
            out.push("title");
        }
        if self.author != other.author {
            out.push("author");
        }
        if self.series != other.series {
            out.push("series");
        }
        if self.series_sequence != other.series_sequence {
            out.push("series_sequence");
        }
        if self.narrators != other.narrators {
            out.push("narrator");
        }
        if self.publisher != other.publisher {
            out.push("publisher");
        }
        if self.release_date != other.release_date {
            out.push("release_date");
        }
        if self.summary != other.summary {
            out.push("summary");
        }
        out.into_iter().map(str::to_string).collect()
    }

    /// "Series #3", "Series" or `None`.
    pub fn series_label(&self) -> Option<String> {
        let series = self.series.as_deref().filter(|s| !s.trim().is_empty())?;
        match self.series_sequence.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(seq) => Some(format!("{series} #{seq}")),
            None => Some(series.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Delivered,
    FailedPermanently,
}

impl ReceiptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Delivered => "delivered",
            ReceiptStatus::FailedPermanently => "failed_permanently",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ReceiptStatus::Pending)
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReceiptStatus::Pending),
            "delivered" => Ok(ReceiptStatus::Delivered),
            "failed_permanently" => Ok(ReceiptStatus::FailedPermanently),
            other => Err(format!("unknown receipt status '{other}'")),
        }
    }
}

/// Delivery state of one record on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationReceipt {
    pub channel: String,
    pub status: ReceiptStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl NotificationReceipt {
    pub fn pending(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            status: ReceiptStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// Pending with budget left: the dispatcher will try it again.
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        self.status == ReceiptStatus::Pending && self.attempt_count < max_attempts
    }
}

/// The central persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub external_id: String,
    #[serde(flatten)]
    pub details: ReleaseDetails,
    pub link: Option<String>,
    /// All required descriptive fields are populated.
    pub complete: bool,
    pub receipts: BTreeMap<String, NotificationReceipt>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl CatalogRecord {
    pub fn receipt(&self, channel: &str) -> Option<&NotificationReceipt> {
        self.receipts.get(channel)
    }

    pub fn receipt_status(&self, channel: &str) -> Option<ReceiptStatus> {
        self.receipts.get(channel).map(|r| r.status)
    }

    /// Adds a pending receipt for `channel` unless one exists already.
    pub fn ensure_receipt(&mut self, channel: &str) {
        self.receipts
            .entry(channel.to_string())
            .or_insert_with(|| NotificationReceipt::pending(channel));
    }

    /// `today >= release_date + grace_period_days`.
    pub fn is_expired(&self, today: NaiveDate, grace_period_days: u32) -> bool {
        match self
            .details
            .release_date
            .checked_add_days(chrono::Days::new(u64::from(grace_period_days)))
        {
            Some(limit) => today >= limit,
            None => false,
        }
    }
}

/// How a record was classified against persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Updated,
    Unchanged,
}

/// One classified record, carrying both snapshots where applicable.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub classification: Classification,
    pub previous: Option<CatalogRecord>,
    pub current: CatalogRecord,
    pub changed_fields: Vec<String>,
}

/// Ephemeral per-cycle output of the reconciler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationResult {
    pub new: Vec<Transition>,
    pub updated: Vec<Transition>,
    pub unchanged: Vec<Transition>,
    /// Candidates dropped as ambiguous or irrelevant.
    pub skipped: usize,
    /// Why each ambiguous candidate was dropped.
    pub ambiguities: Vec<String>,
}

impl ReconciliationResult {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.unchanged.is_empty()
    }

    /// New and updated transitions, merged in notification order.
    pub fn actionable(&self) -> Vec<&Transition> {
        let mut out: Vec<&Transition> = self.new.iter().chain(self.updated.iter()).collect();
        out.sort_by(|a, b| release_order(&a.current, &b.current));
        out
    }

    pub(crate) fn sort(&mut self) {
        for list in [&mut self.new, &mut self.updated, &mut self.unchanged] {
            list.sort_by(|a, b| release_order(&a.current, &b.current));
        }
    }
}

/// Release date ascending, then title, then identifier.
pub fn release_order(a: &CatalogRecord, b: &CatalogRecord) -> std::cmp::Ordering {
    a.details
        .release_date
        .cmp(&b.details.release_date)
        .then_with(|| a.details.title.cmp(&b.details.title))
        .then_with(|| a.external_id.cmp(&b.external_id))
}
