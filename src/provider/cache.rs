// src/provider/cache.rs
//! On-disk cache of catalog search pages, one JSON file per request.
//! Cache trouble is logged and treated as a miss; it never fails a search.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::model::EntityQuery;

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    fetched_at: DateTime<Utc>,
    body: String,
}

#[derive(Debug, Clone)]
pub struct SearchCache {
    dir: PathBuf,
    ttl: Duration,
}

impl SearchCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self { dir: dir.into(), ttl }
    }

    /// Stable key for one page of one query.
    pub fn key(query: &EntityQuery, page: u32, per_page: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.field.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(query.term.trim().to_lowercase().as_bytes());
        hasher.update(format!("\u{1f}{page}\u{1f}{per_page}").as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for b in digest.iter().take(16) {
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Utc::now()).await
    }

    /// The cached body for `key` unless it is older than the TTL at `now`.
    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(target: "provider", path = %path.display(), "reading search cache failed: {e}");
                return None;
            }
        };
        let entry: Entry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(target: "provider", path = %path.display(), "corrupt search cache entry: {e}");
                return None;
            }
        };
        // An entry stamped in the future (clock change) counts as fresh.
        let fresh = (now - entry.fetched_at).to_std().map_or(true, |age| age <= self.ttl);
        if !fresh {
            debug!(target: "provider", key, "search cache entry expired");
            return None;
        }
        debug!(target: "provider", key, "search cache hit");
        Some(entry.body)
    }

    pub async fn put(&self, key: &str, body: &str) {
        self.put_at(key, body, Utc::now()).await
    }

    pub async fn put_at(&self, key: &str, body: &str, fetched_at: DateTime<Utc>) {
        if let Err(e) = self.write(key, body, fetched_at).await {
            warn!(target: "provider", dir = %self.dir.display(), "writing search cache failed: {e:#}");
        }
    }

    async fn write(&self, key: &str, body: &str, fetched_at: DateTime<Utc>) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let entry = Entry {
            fetched_at,
            body: body.to_string(),
        };
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SearchField;

    fn query(term: &str) -> EntityQuery {
        EntityQuery {
            term: term.into(),
            field: SearchField::Author,
        }
    }

    #[test]
    fn keys_separate_term_field_page_and_size() {
        let k = SearchCache::key(&query("Jane Author"), 1, 50);
        assert_eq!(k.len(), 32);
        assert_eq!(k, SearchCache::key(&query(" jane author "), 1, 50));
        assert_ne!(k, SearchCache::key(&query("Jane Author"), 2, 50));
        assert_ne!(k, SearchCache::key(&query("Jane Author"), 1, 20));
        let title = EntityQuery {
            term: "Jane Author".into(),
            field: SearchField::Title,
        };
        assert_ne!(k, SearchCache::key(&title, 1, 50));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SearchCache::new(dir.path().join("cache"), Duration::from_secs(24 * 3600));
        let key = SearchCache::key(&query("Jane Author"), 1, 50);
        let t0 = Utc::now();

        assert_eq!(cache.get_at(&key, t0).await, None);
        cache.put_at(&key, r#"{"products": []}"#, t0).await;

        let hit = cache.get_at(&key, t0 + chrono::Duration::hours(23)).await;
        assert_eq!(hit.as_deref(), Some(r#"{"products": []}"#));
        assert_eq!(cache.get_at(&key, t0 + chrono::Duration::hours(25)).await, None);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SearchCache::new(dir.path(), Duration::from_secs(60));
        std::fs::write(dir.path().join("abc.json"), "{ nope").unwrap();
        assert_eq!(cache.get("abc").await, None);
    }
}
