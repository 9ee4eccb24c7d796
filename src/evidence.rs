//! Evidence pool: dedup, scoring, and ranking of web citations
//!
//! Candidates arrive from search passes, keyed by canonical URL. A successful
//! page read promotes an item once. Scores only ever move up.

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Flat read-promotion bonus. Bounded well under the 0.2 ceiling.
const READ_BONUS: f64 = 0.12;

/// Query tokens counted for the overlap boost, at most
const OVERLAP_QUERY_CAP: usize = 8;

/// Maximum token-overlap boost
const OVERLAP_MAX: f64 = 0.24;

/// Words ignored when tokenizing queries and result text
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "what", "how", "why",
    "are", "was", "were", "has", "have", "had", "about", "into", "when",
    "where", "which", "will", "would", "can", "could", "should", "does",
];

/// A citable source as persisted and sent over the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub source_provider: String,
    pub query: String,
    /// Search pass (1-based) that first produced this source
    pub pass: u32,
    /// Confidence in [0, 1], rounded to 0.001
    pub score: f64,
}

/// A citation plus optional read enrichment
#[derive(Debug, Clone)]
pub struct EvidenceItem {
    pub citation: Citation,
    pub extracted_text: Option<String>,
    pub fetched_at: Option<chrono::DateTime<Utc>>,
    pub enriched_by_read: bool,
}

impl EvidenceItem {
    fn new(citation: Citation) -> Self {
        Self {
            citation,
            extracted_text: None,
            fetched_at: None,
            enriched_by_read: false,
        }
    }
}

/// Canonical identity of a URL: lowercased scheme + host, path with trailing
/// slashes stripped, query and fragment dropped. Idempotent.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(u) => {
            let scheme = u.scheme().to_ascii_lowercase();
            let host = u.host_str().unwrap_or("").to_ascii_lowercase();
            let path = u.path().trim_end_matches('/');
            match u.port() {
                Some(port) => format!("{scheme}://{host}:{port}{path}"),
                None => format!("{scheme}://{host}{path}"),
            }
        }
        Err(_) => {
            // Not a parseable URL; strip query/fragment and trailing slashes
            let no_fragment = trimmed.split('#').next().unwrap_or("");
            let no_query = no_fragment.split('?').next().unwrap_or("");
            no_query.trim_end_matches('/').to_string()
        }
    }
}

/// Lowercased letter/digit tokens of length >= 3, stop words removed
fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn is_url_like_title(title: &str, host: &str) -> bool {
    let t = title.trim();
    t.starts_with("http://")
        || t.starts_with("https://")
        || t.starts_with("www.")
        || (!host.is_empty() && t.eq_ignore_ascii_case(host))
}

fn domain_boost(host: &str) -> f64 {
    if host.ends_with(".gov") || host.ends_with(".edu") {
        0.18
    } else if host.ends_with(".org") {
        0.10
    } else if host.contains("docs.") || host.contains("developer") || host.contains("changelog") {
        0.08
    } else {
        0.04
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Score a search candidate against its producing query.
///
/// The constants here are a contract; tune via a per-domain lookup rather
/// than editing the clamp if that ever becomes necessary.
pub fn score_candidate(title: &str, snippet: &str, url: &str, query: &str, time_sensitive: bool) -> f64 {
    let mut score = 0.20;

    let (scheme, host) = match Url::parse(url) {
        Ok(u) => (
            u.scheme().to_ascii_lowercase(),
            u.host_str().unwrap_or("").to_ascii_lowercase(),
        ),
        Err(_) => (String::new(), String::new()),
    };

    if !title.trim().is_empty() && !is_url_like_title(title, &host) {
        score += 0.16;
    }

    let snippet_len = snippet.chars().count();
    if snippet_len >= 280 {
        score += 0.24;
    } else if snippet_len >= 120 {
        score += 0.17;
    } else if snippet_len >= 50 {
        score += 0.10;
    }

    if scheme == "https" {
        score += 0.06;
    }

    score += domain_boost(&host);

    let query_tokens = tokens(query);
    if !query_tokens.is_empty() {
        let text_tokens = tokens(&format!("{title} {snippet}"));
        let matches = query_tokens
            .iter()
            .filter(|q| text_tokens.contains(q))
            .count();
        let denom = query_tokens.len().min(OVERLAP_QUERY_CAP) as f64;
        score += ((matches as f64 / denom) * OVERLAP_MAX).min(OVERLAP_MAX);
    }

    if time_sensitive {
        let text = format!("{title} {snippet}").to_lowercase();
        let year = Utc::now().year();
        let fresh_words = ["updated", "release", "published", "announced"];
        let has_word = fresh_words.iter().any(|w| text.contains(w));
        let has_year =
            text.contains(&year.to_string()) || text.contains(&(year - 1).to_string());
        if has_word || has_year {
            score += 0.10;
        }
    }

    round3(score.clamp(0.0, 1.0))
}

/// Dedup-and-score aggregation of evidence for one research run
#[derive(Debug, Default)]
pub struct EvidencePool {
    items: HashMap<String, EvidenceItem>,
}

impl EvidencePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Add a search hit. On canonical collision the higher score wins and
    /// enrichment is preserved.
    pub fn add_candidate(&mut self, citation: Citation) {
        if citation.url.is_empty() {
            return;
        }
        let key = canonical_url(&citation.url);

        match self.items.get_mut(&key) {
            Some(existing) => {
                if citation.score > existing.citation.score {
                    existing.citation.score = citation.score;
                    existing.citation.query = citation.query;
                    existing.citation.snippet = citation.snippet;
                }
                if existing.citation.title.trim().is_empty() && !citation.title.trim().is_empty() {
                    existing.citation.title = citation.title;
                }
            }
            None => {
                self.items.insert(key, EvidenceItem::new(citation));
            }
        }
    }

    /// Promote an item with a successful page read. Idempotent per item;
    /// the score bonus applies once.
    pub fn promote_with_read(
        &mut self,
        url: &str,
        extracted_text: String,
        fetched_at: chrono::DateTime<Utc>,
    ) {
        let key = canonical_url(url);
        if let Some(item) = self.items.get_mut(&key) {
            if !item.enriched_by_read {
                item.citation.score = round3((item.citation.score + READ_BONUS).clamp(0.0, 1.0));
            }
            item.extracted_text = Some(extracted_text);
            item.fetched_at = Some(fetched_at);
            item.enriched_by_read = true;
        }
    }

    pub fn has_read(&self, url: &str) -> bool {
        self.items
            .get(&canonical_url(url))
            .map(|i| i.enriched_by_read)
            .unwrap_or(false)
    }

    /// Stable ranking: score desc, then pass asc, then url asc
    pub fn rank(&self) -> Vec<EvidenceItem> {
        let mut ranked: Vec<EvidenceItem> = self.items.values().cloned().collect();
        ranked.sort_by(|a, b| {
            b.citation
                .score
                .partial_cmp(&a.citation.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.citation.pass.cmp(&b.citation.pass))
                .then(a.citation.url.cmp(&b.citation.url))
        });
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(url: &str, score: f64) -> Citation {
        Citation {
            url: url.to_string(),
            title: "Title".to_string(),
            snippet: String::new(),
            source_provider: "google".to_string(),
            query: "q".to_string(),
            pass: 1,
            score,
        }
    }

    #[test]
    fn test_canonical_url_basic() {
        assert_eq!(
            canonical_url("HTTPS://Example.COM/Path/?q=1#frag"),
            "https://example.com/Path"
        );
        assert_eq!(canonical_url("https://example.com/"), "https://example.com");
    }

    #[test]
    fn test_canonical_url_idempotent() {
        let u = "https://Docs.Example.org/guide/?x=2#top";
        let once = canonical_url(u);
        assert_eq!(canonical_url(&once), once);
    }

    #[test]
    fn test_canonical_url_preserves_port_and_path_case() {
        assert_eq!(
            canonical_url("http://host:8080/A/B/"),
            "http://host:8080/A/B"
        );
    }

    #[test]
    fn test_score_base_and_clamp() {
        // bare http result on an unknown domain with no title/snippet:
        // base 0.20 + generic domain 0.04
        let s = score_candidate("", "", "http://example.io/x", "unrelated", false);
        assert_eq!(s, 0.24);
    }

    #[test]
    fn test_score_title_and_https() {
        let s = score_candidate("Rust 1.80 notes", "", "https://example.io/x", "zzz", false);
        // base 0.20 + title 0.16 + https 0.06 + generic 0.04
        assert_eq!(s, 0.46);
    }

    #[test]
    fn test_url_like_title_gets_no_title_credit() {
        let with_title = score_candidate("https://example.io/x", "", "https://example.io/x", "zzz", false);
        let without = score_candidate("", "", "https://example.io/x", "zzz", false);
        assert_eq!(with_title, without);
    }

    #[test]
    fn test_snippet_tiers() {
        let short = "a".repeat(50);
        let mid = "a".repeat(120);
        let long = "a".repeat(280);
        let base = score_candidate("", "", "http://example.io/x", "zzz", false);
        assert_eq!(
            score_candidate("", &short, "http://example.io/x", "zzz", false),
            round3(base + 0.10)
        );
        assert_eq!(
            score_candidate("", &mid, "http://example.io/x", "zzz", false),
            round3(base + 0.17)
        );
        assert_eq!(
            score_candidate("", &long, "http://example.io/x", "zzz", false),
            round3(base + 0.24)
        );
    }

    #[test]
    fn test_domain_tiers() {
        let gov = score_candidate("", "", "http://data.census.gov/x", "zzz", false);
        let org = score_candidate("", "", "http://example.org/x", "zzz", false);
        let docs = score_candidate("", "", "http://docs.example.io/x", "zzz", false);
        let plain = score_candidate("", "", "http://example.io/x", "zzz", false);
        assert!(gov > org && org > docs && docs > plain);
        assert_eq!(round3(gov - plain), 0.14);
    }

    #[test]
    fn test_token_overlap_boost() {
        let matched = score_candidate(
            "tokio runtime scheduler",
            "",
            "http://example.io/x",
            "tokio scheduler",
            false,
        );
        let unmatched = score_candidate("tokio runtime scheduler", "", "http://example.io/x", "zzz", false);
        // both query tokens match: full 0.24 boost
        assert_eq!(round3(matched - unmatched), 0.24);
    }

    #[test]
    fn test_freshness_boost_requires_time_sensitivity() {
        let insensitive =
            score_candidate("updated guide", "", "http://example.io/x", "zzz", false);
        let sensitive = score_candidate("updated guide", "", "http://example.io/x", "zzz", true);
        assert_eq!(round3(sensitive - insensitive), 0.10);
    }

    #[test]
    fn test_pool_dedup_keeps_higher_score() {
        let mut pool = EvidencePool::new();
        pool.add_candidate(citation("https://a.io/one", 0.4));
        pool.add_candidate(citation("https://a.io/one/", 0.7));
        pool.add_candidate(citation("https://A.io/one?utm=x", 0.2));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.rank()[0].citation.score, 0.7);
    }

    #[test]
    fn test_rank_order_and_tie_breaks() {
        let mut pool = EvidencePool::new();
        let mut a = citation("https://a.io/a", 0.5);
        a.pass = 2;
        let mut b = citation("https://a.io/b", 0.5);
        b.pass = 1;
        let c = citation("https://a.io/c", 0.9);
        pool.add_candidate(a);
        pool.add_candidate(b);
        pool.add_candidate(c);

        let ranked = pool.rank();
        assert_eq!(ranked[0].citation.url, "https://a.io/c");
        // equal scores: earlier pass first
        assert_eq!(ranked[1].citation.url, "https://a.io/b");
        assert_eq!(ranked[2].citation.url, "https://a.io/a");
    }

    #[test]
    fn test_read_promotion_applies_once() {
        let mut pool = EvidencePool::new();
        pool.add_candidate(citation("https://a.io/one", 0.5));
        pool.promote_with_read("https://a.io/one", "text".into(), Utc::now());
        assert!(pool.has_read("https://a.io/one"));
        let after_first = pool.rank()[0].citation.score;
        assert_eq!(after_first, 0.62);

        pool.promote_with_read("https://a.io/one", "more text".into(), Utc::now());
        assert_eq!(pool.rank()[0].citation.score, after_first);
    }

    #[test]
    fn test_empty_url_rejected() {
        let mut pool = EvidencePool::new();
        pool.add_candidate(citation("", 0.9));
        assert!(pool.is_empty());
    }
}
