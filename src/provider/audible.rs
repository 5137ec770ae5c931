// src/provider/audible.rs
use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use super::{SearchCache, SearchProvider};
use crate::config::ProviderConfig;
use crate::model::{EntityQuery, RawCandidate};
use crate::normalize::non_empty;
use crate::notify::Throttle;

const RESPONSE_GROUPS: &str = "product_desc,media,contributors,series,product_attrs,relationships,product_extended_attrs,category_ladders";
const PRODUCT_URL: &str = "https://www.audible.com/pd/";

/// Credits that name a contributor rather than an author.
const NON_AUTHOR_ROLES: &[&str] = &[
    "illustrator",
    "translator",
    "translated by",
    "editor",
    "edited by",
    "foreword",
    "afterword",
    "introduction",
    "preface",
    "contributor",
    "adapter",
    "adaptor",
    "compiler",
    "compiled by",
    "cover designer",
    "cover artist",
    "commentary",
    "annotated by",
    "revised by",
    "reviser",
];

/// Audible catalog API client.
pub struct AudibleProvider {
    client: Client,
    cfg: ProviderConfig,
    limiter: Throttle,
    cache: Option<SearchCache>,
}

impl AudibleProvider {
    pub fn new(cfg: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .user_agent(concat!("audio-release-tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building catalog http client")?;
        let cache = (cfg.cache_ttl_hours > 0)
            .then(|| SearchCache::new(cfg.cache_dir.clone(), Duration::from_secs(cfg.cache_ttl_hours * 3600)));
        Ok(Self {
            limiter: Throttle::per_minute(cfg.requests_per_minute),
            client,
            cfg,
            cache,
        })
    }

    /// One page, from the cache when fresh. Only bodies that parse are cached.
    async fn page(&self, query: &EntityQuery, page: u32) -> Result<ParsedPage> {
        let key = SearchCache::key(query, page, self.cfg.results_per_page);
        if let Some(cache) = &self.cache {
            if let Some(body) = cache.get(&key).await {
                match parse_products(&body, &self.cfg.language) {
                    Ok(parsed) => return Ok(parsed),
                    Err(e) => tracing::warn!(target: "provider", key, "ignoring unparsable cached page: {e:#}"),
                }
            }
        }

        let body = self.fetch_page(query, page).await?;
        let parsed = parse_products(&body, &self.cfg.language)?;
        if let Some(cache) = &self.cache {
            cache.put(&key, &body).await;
        }
        Ok(parsed)
    }

    async fn fetch_page(&self, query: &EntityQuery, page: u32) -> Result<String> {
        self.limiter.acquire().await;
        let num_results = self.cfg.results_per_page.to_string();
        let page_s = page.to_string();
        let rsp = self
            .client
            .get(&self.cfg.base_url)
            .query(&[
                (query.field.as_str(), query.term.as_str()),
                ("num_results", num_results.as_str()),
                ("products_sort_by", "-ReleaseDate"),
                ("response_groups", RESPONSE_GROUPS),
                ("marketplace", self.cfg.marketplace.as_str()),
                ("page", page_s.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("catalog request '{}' page {page}", query.term))?;
        let rsp = rsp
            .error_for_status()
            .with_context(|| format!("catalog non-2xx for '{}'", query.term))?;
        rsp.text().await.context("reading catalog body")
    }
}

#[async_trait::async_trait]
impl SearchProvider for AudibleProvider {
    async fn search(&self, query: &EntityQuery) -> Result<Vec<RawCandidate>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        for page in 1..=self.cfg.max_pages {
            let page_out = self.page(query, page).await?;
            let raw_len = page_out.raw_len;

            for cand in page_out.candidates {
                let key = cand.external_id.clone().unwrap_or_default();
                if key.is_empty() || seen.insert(key) {
                    out.push(cand);
                }
            }
            if raw_len < self.cfg.results_per_page as usize {
                break;
            }
        }

        tracing::debug!(target: "provider", term = %query.term, field = query.field.as_str(), found = out.len(), "catalog search done");
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "audible"
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProductsResponse {
    #[serde(default)]
    products: Vec<Product>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Product {
    asin: Option<String>,
    title: Option<String>,
    authors: Vec<Named>,
    narrators: Vec<Named>,
    publisher_name: Option<String>,
    series: Vec<SeriesRef>,
    release_date: Option<String>,
    issue_date: Option<String>,
    publisher_summary: Option<String>,
    language: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Named {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SeriesRef {
    title: Option<String>,
    sequence: Option<String>,
}

/// One parsed page: kept candidates plus the raw product count for paging.
#[derive(Debug)]
pub struct ParsedPage {
    pub candidates: Vec<RawCandidate>,
    pub raw_len: usize,
}

/// Maps a catalog response body to candidates. Other languages and podcasts are dropped.
pub fn parse_products(body: &str, language: &str) -> Result<ParsedPage> {
    let rsp: ProductsResponse = serde_json::from_str(body).context("parsing catalog JSON")?;
    let raw_len = rsp.products.len();
    let wanted_lang = language.trim().to_lowercase();

    let candidates = rsp
        .products
        .into_iter()
        .filter(|p| {
            let lang = p.language.as_deref().unwrap_or_default().to_lowercase();
            if !lang.is_empty() && !wanted_lang.is_empty() && lang != wanted_lang {
                tracing::trace!(target: "provider", title = ?p.title, %lang, "language mismatch");
                return false;
            }
            !p.content_type
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case("podcast"))
        })
        .map(to_candidate)
        .collect();

    Ok(ParsedPage { candidates, raw_len })
}

fn to_candidate(p: Product) -> RawCandidate {
    let authors: Vec<String> = p
        .authors
        .into_iter()
        .filter_map(|a| a.name)
        .filter(|name| {
            let lower = name.to_lowercase();
            !name.trim().is_empty() && !NON_AUTHOR_ROLES.iter().any(|role| lower.contains(role))
        })
        .collect();

    let narrators = p
        .narrators
        .into_iter()
        .filter_map(|n| n.name)
        .filter(|n| !n.trim().is_empty())
        .collect();

    let (series, series_sequence) = match p.series.into_iter().next() {
        Some(s) => (
            non_empty(s.title.as_deref()),
            s.sequence.filter(|seq| is_numeric_sequence(seq)),
        ),
        None => (None, None),
    };

    let release_date = p
        .release_date
        .or(p.issue_date)
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());

    let asin = p.asin.map(|a| a.trim().to_string()).filter(|a| !a.is_empty());
    RawCandidate {
        link: asin.as_ref().map(|a| format!("{PRODUCT_URL}{a}")),
        external_id: asin,
        title: p.title.unwrap_or_default(),
        author: authors.join(", "),
        series,
        series_sequence,
        narrators,
        publisher: p.publisher_name,
        release_date,
        summary: p.publisher_summary,
    }
}

/// "3", "2.5"; not "Book Three" or "1-3".
fn is_numeric_sequence(seq: &str) -> bool {
    let s = seq.trim();
    !s.is_empty()
        && s.chars().filter(|c| *c == '.').count() <= 1
        && s.chars().all(|c| c.is_ascii_digit() || c == '.')
        && s.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
      "products": [
        {
          "asin": "B0TEST0001",
          "title": "Book A",
          "authors": [{"name": "Jane Author"}, {"name": "Sam Artist - illustrator"}],
          "narrators": [{"name": "Jane"}, {"name": "John"}],
          "publisher_name": "Pub",
          "series": [{"title": "Saga", "sequence": "2"}, {"title": "Other", "sequence": "9"}],
          "release_date": "2025-03-01",
          "publisher_summary": "<p>Great <b>book</b></p>",
          "language": "english"
        },
        {"asin": "B0TEST0002", "title": "Libro", "language": "spanish", "release_date": "2025-03-01"},
        {"asin": "B0TEST0003", "title": "A Podcast", "content_type": "Podcast", "release_date": "2025-03-01"},
        {"asin": "B0TEST0004", "title": "Omnibus", "series": [{"title": "Saga", "sequence": "1-3"}], "issue_date": "2025-04-02"}
      ]
    }"#;

    #[test]
    fn parse_products_maps_and_filters() {
        let page = parse_products(BODY, "english").unwrap();
        assert_eq!(page.raw_len, 4);
        assert_eq!(page.candidates.len(), 2);

        let a = &page.candidates[0];
        assert_eq!(a.external_id.as_deref(), Some("B0TEST0001"));
        assert_eq!(a.author, "Jane Author");
        assert_eq!(a.narrators, vec!["Jane", "John"]);
        assert_eq!(a.series.as_deref(), Some("Saga"));
        assert_eq!(a.series_sequence.as_deref(), Some("2"));
        assert_eq!(a.release_date, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert_eq!(a.link.as_deref(), Some("https://www.audible.com/pd/B0TEST0001"));

        let omnibus = &page.candidates[1];
        assert_eq!(omnibus.series_sequence, None);
        assert_eq!(omnibus.release_date, NaiveDate::from_ymd_opt(2025, 4, 2));
    }

    #[test]
    fn empty_or_bad_bodies() {
        assert_eq!(parse_products("{}", "english").unwrap().raw_len, 0);
        assert!(parse_products("not json", "english").is_err());
    }

    #[tokio::test]
    async fn fresh_cached_pages_skip_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ProviderConfig {
            // Nothing listens here; a request would fail the search.
            base_url: "http://127.0.0.1:9/1.0/catalog/products".into(),
            cache_dir: dir.path().to_path_buf(),
            cache_ttl_hours: 24,
            ..ProviderConfig::default()
        };
        let query = EntityQuery {
            term: "Jane Author".into(),
            field: crate::model::SearchField::Author,
        };
        SearchCache::new(dir.path(), Duration::from_secs(3600))
            .put(&SearchCache::key(&query, 1, cfg.results_per_page), BODY)
            .await;

        let provider = AudibleProvider::new(cfg).unwrap();
        let found = provider.search(&query).await.unwrap();
        let ids: Vec<_> = found.iter().filter_map(|c| c.external_id.as_deref()).collect();
        assert_eq!(ids, vec!["B0TEST0001", "B0TEST0004"]);
    }

    #[tokio::test]
    async fn zero_ttl_disables_the_cache() {
        let cfg = ProviderConfig {
            cache_ttl_hours: 0,
            ..ProviderConfig::default()
        };
        assert!(AudibleProvider::new(cfg).unwrap().cache.is_none());
    }

    #[test]
    fn numeric_sequences() {
        assert!(is_numeric_sequence("3"));
        assert!(is_numeric_sequence("2.5"));
        assert!(!is_numeric_sequence("1-3"));
        assert!(!is_numeric_sequence("."));
        assert!(!is_numeric_sequence("Book Three"));
    }
}
