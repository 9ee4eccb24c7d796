//! Bounded thinking trace for research transparency
//!
//! Every progress event observed by the stream multiplexer lands here so the
//! planner/search/read steps can be replayed later from the message row.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Oldest entries are evicted past this cap
pub const TRACE_CAP: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Done,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingTrace {
    pub status: TraceStatus,
    pub summary: String,
    pub entries: VecDeque<TraceEntry>,
}

impl Default for ThinkingTrace {
    fn default() -> Self {
        Self {
            status: TraceStatus::Running,
            summary: String::new(),
            entries: VecDeque::new(),
        }
    }
}

impl ThinkingTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, evicting the oldest past the cap, and refresh the
    /// summary from it.
    pub fn push(&mut self, entry: TraceEntry) {
        self.summary = match (&entry.title, &entry.detail) {
            (Some(t), Some(d)) => format!("{t}: {d}"),
            (Some(t), None) => t.clone(),
            (None, _) => entry
                .message
                .clone()
                .unwrap_or_else(|| entry.phase.clone()),
        };

        self.entries.push_back(entry);
        while self.entries.len() > TRACE_CAP {
            self.entries.pop_front();
        }
    }

    pub fn mark_done(&mut self) {
        self.status = TraceStatus::Done;
    }

    pub fn mark_stopped(&mut self) {
        self.status = TraceStatus::Stopped;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a stored trace blob. Invalid JSON is ignored, not fatal.
    pub fn from_json(blob: &str) -> Option<Self> {
        serde_json::from_str(blob).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(phase: &str, title: Option<&str>, detail: Option<&str>) -> TraceEntry {
        TraceEntry {
            phase: phase.to_string(),
            title: title.map(String::from),
            message: None,
            detail: detail.map(String::from),
            at: 0,
        }
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut trace = ThinkingTrace::new();
        for i in 0..70 {
            trace.push(entry(&format!("p{i}"), None, None));
        }
        assert_eq!(trace.entries.len(), TRACE_CAP);
        assert_eq!(trace.entries.front().unwrap().phase, "p10");
        assert_eq!(trace.entries.back().unwrap().phase, "p69");
    }

    #[test]
    fn test_summary_follows_latest_entry() {
        let mut trace = ThinkingTrace::new();
        trace.push(entry("searching", Some("Searching"), Some("rust async")));
        assert_eq!(trace.summary, "Searching: rust async");
        trace.push(entry("reading", Some("Reading sources"), None));
        assert_eq!(trace.summary, "Reading sources");
    }

    #[test]
    fn test_terminal_status() {
        let mut trace = ThinkingTrace::new();
        assert_eq!(trace.status, TraceStatus::Running);
        trace.mark_done();
        assert_eq!(trace.status, TraceStatus::Done);
        trace.mark_stopped();
        assert_eq!(trace.status, TraceStatus::Stopped);
    }

    #[test]
    fn test_roundtrip_and_bad_blob() {
        let mut trace = ThinkingTrace::new();
        trace.push(entry("planning", Some("Planning"), None));
        trace.mark_done();

        let blob = trace.to_json();
        let parsed = ThinkingTrace::from_json(&blob).unwrap();
        assert_eq!(parsed.status, TraceStatus::Done);
        assert_eq!(parsed.entries.len(), 1);

        assert!(ThinkingTrace::from_json("not json {").is_none());
    }
}
