// src/normalize.rs
//! Text clean-up for provider payloads and comparison keys for relevance checks.

use once_cell::sync::OnceCell;
use regex::Regex;

const SUMMARY_MAX_CHARS: usize = 4000;

fn re_tags() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"))
}

fn re_ws() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"))
}

fn re_punct() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s]").expect("punctuation regex"))
}

/// Decode entities, strip HTML tags, fold typographic quotes and collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // Entities first so encoded tags get stripped too
    let mut out = html_escape::decode_html_entities(s).to_string();
    out = re_tags().replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    out = re_ws().replace_all(&out, " ").trim().to_string();

    if out.chars().count() > SUMMARY_MAX_CHARS {
        out = out.chars().take(SUMMARY_MAX_CHARS).collect();
    }
    out
}

/// `Some(normalized)` unless the text is blank after clean-up.
pub fn non_empty(s: Option<&str>) -> Option<String> {
    let t = normalize_text(s?);
    (!t.is_empty()).then_some(t)
}

/// Lowercase, punctuation-free, single-spaced key for loose comparisons.
pub fn normalize_key(s: &str) -> String {
    let lower = s.to_lowercase();
    let stripped = re_punct().replace_all(&lower, "");
    re_ws().replace_all(&stripped, " ").trim().to_string()
}

/// Loose name equality: exact on normalized keys or Jaro-Winkler >= `threshold`.
pub fn names_match(a: &str, b: &str, threshold: f64) -> bool {
    let (ka, kb) = (normalize_key(a), normalize_key(b));
    if ka.is_empty() || kb.is_empty() {
        return false;
    }
    ka == kb || strsim::jaro_winkler(&ka, &kb) >= threshold
}

/// Does the comma separated credit list contain `wanted`?
pub fn credits_contain(credits: &str, wanted: &str, threshold: f64) -> bool {
    credits
        .split([',', '&', ';'])
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .any(|c| names_match(c, wanted, threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_strips_html_and_ws() {
        let s = "  <p>Hello,&nbsp;&nbsp;<b>world</b></p>\n\n";
        assert_eq!(normalize_text(s), "Hello, world");
    }

    #[test]
    fn normalize_text_folds_quotes() {
        assert_eq!(normalize_text("\u{201C}Hi\u{201D} it\u{2019}s"), "\"Hi\" it's");
    }

    #[test]
    fn non_empty_drops_blank() {
        assert_eq!(non_empty(Some("  <br/> ")), None);
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some(" x ")).as_deref(), Some("x"));
    }

    #[test]
    fn keys_ignore_case_and_punctuation() {
        assert_eq!(normalize_key("The Wandering Inn: Vol. 2!"), "the wandering inn vol 2");
        assert!(names_match("Brandon Sanderson", "brandon  sanderson", 0.9));
        assert!(!names_match("Brandon Sanderson", "Robert Jordan", 0.9));
    }

    #[test]
    fn credits_contain_handles_co_authors() {
        assert!(credits_contain(
            "Robert Jordan, Brandon Sanderson",
            "Brandon Sanderson",
            0.9
        ));
        assert!(!credits_contain("Robert Jordan", "Brandon Sanderson", 0.9));
    }
}
