//! Citation ordering against `[n]` markers in the final answer
//!
//! Indices are 1-based positions into the evidence sequence as it was
//! presented to the model. Referenced sources come first in marker order,
//! unreferenced ones follow in their original order, deduped by raw URL.
//!
//! Call this exactly once per response, with the sequence the model actually
//! saw: markers are positional, so the output is a reordering and must not
//! be fed back in as `presented`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::evidence::Citation;

static RE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d{1,2})\]").expect("valid regex"));

/// Order citations to follow marker order in `text`, then cap to `max`.
pub fn order_citations(text: &str, presented: &[Citation], max: usize) -> Vec<Citation> {
    let mut ordered: Vec<Citation> = Vec::with_capacity(presented.len());
    let mut used = vec![false; presented.len()];

    for cap in RE_MARKER.captures_iter(text) {
        let Ok(n) = cap[1].parse::<usize>() else {
            continue;
        };
        if n == 0 {
            continue;
        }
        let idx = n - 1;
        if idx < presented.len() && !used[idx] {
            used[idx] = true;
            ordered.push(presented[idx].clone());
        }
    }

    for (idx, citation) in presented.iter().enumerate() {
        if !used[idx] {
            ordered.push(citation.clone());
        }
    }

    // Dedup by raw URL, first occurrence wins
    let mut seen = std::collections::HashSet::new();
    ordered.retain(|c| seen.insert(c.url.clone()));

    ordered.truncate(max);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(url: &str) -> Citation {
        Citation {
            url: url.to_string(),
            title: url.to_string(),
            snippet: String::new(),
            source_provider: "google".to_string(),
            query: "q".to_string(),
            pass: 1,
            score: 0.5,
        }
    }

    #[test]
    fn test_marker_order_wins() {
        let presented = vec![citation("https://a/1"), citation("https://a/2")];
        let ordered = order_citations("Summary [2] then [1].", &presented, 10);
        assert_eq!(ordered[0].url, "https://a/2");
        assert_eq!(ordered[1].url, "https://a/1");
    }

    #[test]
    fn test_unreferenced_appended_in_original_order() {
        let presented = vec![
            citation("https://a/1"),
            citation("https://a/2"),
            citation("https://a/3"),
        ];
        let ordered = order_citations("Only [3] matters.", &presented, 10);
        let urls: Vec<&str> = ordered.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a/3", "https://a/1", "https://a/2"]);
    }

    #[test]
    fn test_out_of_range_and_repeated_markers_ignored() {
        let presented = vec![citation("https://a/1")];
        let ordered = order_citations("[1] and again [1] and bogus [7] [0]", &presented, 10);
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_dedup_by_raw_url() {
        let presented = vec![citation("https://a/1"), citation("https://a/1")];
        let ordered = order_citations("", &presented, 10);
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_cap() {
        let presented: Vec<Citation> = (0..15)
            .map(|i| citation(&format!("https://a/{i}")))
            .collect();
        let ordered = order_citations("", &presented, 10);
        assert_eq!(ordered.len(), 10);
    }

    #[test]
    fn test_no_markers_keeps_presented_order() {
        let presented = vec![
            citation("https://a/1"),
            citation("https://a/2"),
            citation("https://a/3"),
        ];
        let ordered = order_citations("no references here", &presented, 10);
        assert_eq!(ordered, presented);
    }

    #[test]
    fn test_markers_in_presented_order_are_a_fixpoint() {
        // When the answer cites sources in the order they were presented,
        // the output equals the input.
        let presented = vec![citation("https://a/1"), citation("https://a/2")];
        let ordered = order_citations("First [1], then [2].", &presented, 10);
        assert_eq!(ordered, presented);
    }
}
