// src/config/watchlist.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TrackerError;
use crate::model::{EntityQuery, SearchField, WatchedEntity};

pub const ENV_WATCHLIST_PATH: &str = "TRACKER_WATCHLIST_PATH";

/// One line of the user's watchlist.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct WatchEntry {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl WatchEntry {
    /// Author entries search by author (optionally narrowed to a series or title),
    /// series entries by keywords, bare titles by title.
    pub fn into_entity(self) -> Option<WatchedEntity> {
        let clean = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let (author, series, title) = (clean(self.author), clean(self.series), clean(self.title));

        match (author, series, title) {
            (Some(a), Some(s), _) => Some(WatchedEntity::author(a).with_series_filter(s)),
            (Some(a), None, Some(t)) => {
                let mut e = WatchedEntity::author(a);
                e.id = format!("{}+title:{}", e.id, crate::normalize::normalize_key(&t));
                e.query = EntityQuery {
                    term: t,
                    field: SearchField::Title,
                };
                Some(e)
            }
            (Some(a), None, None) => Some(WatchedEntity::author(a)),
            (None, Some(s), _) => Some(WatchedEntity::series(s)),
            (None, None, Some(t)) => {
                let mut e = WatchedEntity::series(t.clone());
                e.id = format!("title:{}", crate::normalize::normalize_key(&t));
                e.query.field = SearchField::Title;
                e.series_filter = None;
                Some(e)
            }
            (None, None, None) => None,
        }
    }
}

/// Load the watchlist from an explicit path. Supports TOML or JSON formats.
pub fn load_watchlist_from(path: &Path) -> Result<Vec<WatchedEntity>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading watchlist from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_watchlist(&content, ext.as_str())
}

/// Load the watchlist using env var + fallbacks:
/// 1) $TRACKER_WATCHLIST_PATH
/// 2) config/watchlist.toml
/// 3) config/watchlist.json
pub fn load_watchlist_default() -> Result<Vec<WatchedEntity>> {
    if let Ok(p) = std::env::var(ENV_WATCHLIST_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_watchlist_from(&pb);
        } else {
            return Err(TrackerError::config(format!("{ENV_WATCHLIST_PATH} points to non-existent path {}", pb.display())).into());
        }
    }
    let toml_p = PathBuf::from("config/watchlist.toml");
    if toml_p.exists() {
        return load_watchlist_from(&toml_p);
    }
    let json_p = PathBuf::from("config/watchlist.json");
    if json_p.exists() {
        return load_watchlist_from(&json_p);
    }
    Ok(Vec::new())
}

pub fn parse_watchlist(s: &str, hint_ext: &str) -> Result<Vec<WatchedEntity>> {
    let try_toml = hint_ext == "toml" || s.contains("[[watch]]");
    if try_toml {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    if let Ok(v) = parse_json(s) {
        return Ok(v);
    }
    if !try_toml {
        if let Ok(v) = parse_toml(s) {
            return Ok(v);
        }
    }
    Err(TrackerError::config("unsupported watchlist format").into())
}

fn parse_toml(s: &str) -> Result<Vec<WatchedEntity>> {
    #[derive(Deserialize)]
    struct TomlWl {
        #[serde(default)]
        watch: Vec<WatchEntry>,
    }
    let v: TomlWl = toml::from_str(s)?;
    Ok(clean_list(v.watch))
}

/// Either a bare array of entries or a `{ "watch": [...] }` object.
fn parse_json(s: &str) -> Result<Vec<WatchedEntity>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum JsonWl {
        List(Vec<WatchEntry>),
        Wrapped { watch: Vec<WatchEntry> },
    }
    let v: JsonWl = serde_json::from_str(s)?;
    let entries = match v {
        JsonWl::List(l) => l,
        JsonWl::Wrapped { watch } => watch,
    };
    Ok(clean_list(entries))
}

/// Drops empty entries and collapses duplicates (same entity id), ordered by id.
fn clean_list(items: Vec<WatchEntry>) -> Vec<WatchedEntity> {
    let mut by_id = BTreeMap::new();
    for entity in items.into_iter().filter_map(WatchEntry::into_entity) {
        by_id.entry(entity.id.clone()).or_insert(entity);
    }
    by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use std::{env, fs};

    #[test]
    fn toml_and_json_entries_map_to_entities() {
        let toml = r#"
            [[watch]]
            author = "Brandon Sanderson"

            [[watch]]
            author = " brandon sanderson "

            [[watch]]
            series = "The Wandering Inn"

            [[watch]]
            author = "Will Wight"
            series = "Cradle"

            [[watch]]
        "#;
        let out = parse_watchlist(toml, "toml").unwrap();
        let ids: Vec<_> = out.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["author:brandon sanderson", "author:will wight+cradle", "series:the wandering inn"]
        );
        assert_eq!(out[1].series_filter.as_deref(), Some("Cradle"));
        assert_eq!(out[2].kind, EntityKind::Series);

        let json = r#"[{"title": "Project Hail Mary"}, {"author": ""}]"#;
        let out = parse_watchlist(json, "json").unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].query.field, SearchField::Title);
        assert_eq!(out[0].series_filter, None);
    }

    #[test]
    fn unreadable_watchlist_is_a_config_error() {
        let err = parse_watchlist("this is = = not a watchlist", "txt").unwrap_err();
        assert!(matches!(err.downcast_ref::<TrackerError>(), Some(TrackerError::Config(_))));
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_WATCHLIST_PATH);

        assert!(load_watchlist_default().unwrap().is_empty());

        let p_json = tmp.path().join("wl.json");
        fs::write(&p_json, r#"{"watch": [{"author": "X"}]}"#).unwrap();
        env::set_var(ENV_WATCHLIST_PATH, p_json.display().to_string());
        let v = load_watchlist_default().unwrap();
        assert_eq!(v.len(), 1);
        env::remove_var(ENV_WATCHLIST_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
