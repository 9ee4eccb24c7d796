//! Research planners
//!
//! Two variants behind one seam: a JSON-over-LLM planner that must emit a
//! strict small object, and a deterministic heuristic. The orchestrator asks
//! the LLM variant first; any parse, schema, or timeout failure falls back to
//! the heuristic for that decision.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::completions::{CompletionGateway, CompletionRequest, PromptMessage};
use crate::evidence::EvidenceItem;

/// Items at or above this score count as high-confidence evidence
pub const HIGH_CONFIDENCE_SCORE: f64 = 0.58;

/// High-confidence items needed before the heuristic finalizes early
const MIN_HIGH_CONFIDENCE: usize = 3;

/// Ceiling for one JSON-planner model call
const PLANNER_CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Ranked evidence lines shown to the JSON planner
const EVIDENCE_LINES_FOR_PROMPT: usize = 8;

const QUERY_SUFFIXES: &[&str] = &[
    "key facts",
    "official sources",
    "statistics",
    "comparison",
    "best practices",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Search,
    Finalize,
}

/// What the orchestrator should do next
#[derive(Debug, Clone)]
pub struct PlanDecision {
    pub next_action: NextAction,
    pub queries: Vec<String>,
    pub coverage_gaps: Vec<String>,
}

/// Everything a planner may look at for one decision
pub struct PlannerInput<'a> {
    pub question: &'a str,
    pub time_sensitive: bool,
    pub loop_index: u32,
    pub max_loops: u32,
    pub remaining_query_budget: u32,
    pub remaining_read_budget: u32,
    pub previous_queries: &'a [String],
    pub coverage_gaps: &'a [String],
    /// Current pool ranking, best first
    pub evidence: &'a [EvidenceItem],
}

impl PlannerInput<'_> {
    fn high_confidence_count(&self) -> usize {
        self.evidence
            .iter()
            .filter(|i| i.citation.score >= HIGH_CONFIDENCE_SCORE)
            .count()
    }

    fn budgets_exhausted(&self) -> bool {
        self.remaining_query_budget == 0 || self.loop_index >= self.max_loops
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn initial_plan(&self, input: &PlannerInput<'_>) -> PlanDecision;
    async fn evaluate_evidence(&self, input: &PlannerInput<'_>) -> PlanDecision;
}

/// Dedup queries case-insensitively against themselves and `previous`,
/// then truncate to the remaining budget.
fn sanitize_queries(queries: Vec<String>, previous: &[String], budget: u32) -> Vec<String> {
    let mut seen: Vec<String> = previous.iter().map(|q| q.to_lowercase()).collect();
    let mut out = Vec::new();
    for query in queries {
        if out.len() >= budget as usize {
            break;
        }
        let trimmed = query.trim().to_string();
        if trimmed.is_empty() {
            continue;
        }
        let key = trimmed.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(trimmed);
    }
    out
}

// ============================================================================
// Heuristic planner
// ============================================================================

/// Deterministic fallback planner
#[derive(Debug, Default)]
pub struct HeuristicPlanner;

impl HeuristicPlanner {
    pub fn new() -> Self {
        Self
    }

    fn query_variants(question: &str, time_sensitive: bool) -> Vec<String> {
        let base = question.trim();
        let mut variants = vec![base.to_string()];
        for suffix in QUERY_SUFFIXES {
            variants.push(format!("{base} {suffix}"));
        }
        if time_sensitive {
            let year = Utc::now().year();
            variants.push(format!("{base} latest"));
            variants.push(format!("{base} changelog"));
            variants.push(format!("{base} {year}"));
        }
        variants
    }

    fn gaps(input: &PlannerInput<'_>) -> Vec<String> {
        let mut gaps = Vec::new();
        let has_authority = input.evidence.iter().any(|i| {
            let url = i.citation.url.to_lowercase();
            url.contains(".gov") || url.contains(".edu") || url.contains(".org")
        });
        if !has_authority {
            gaps.push("authoritative sources".to_string());
        }
        if input.remaining_read_budget > 0 && !input.evidence.iter().any(|i| i.enriched_by_read) {
            gaps.push("page-level detail".to_string());
        }
        gaps
    }
}

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn initial_plan(&self, input: &PlannerInput<'_>) -> PlanDecision {
        let queries = sanitize_queries(
            Self::query_variants(input.question, input.time_sensitive),
            input.previous_queries,
            input.remaining_query_budget,
        );

        if queries.is_empty() && !input.evidence.is_empty() {
            return PlanDecision {
                next_action: NextAction::Finalize,
                queries: Vec::new(),
                coverage_gaps: Vec::new(),
            };
        }

        PlanDecision {
            next_action: NextAction::Search,
            queries,
            coverage_gaps: Vec::new(),
        }
    }

    async fn evaluate_evidence(&self, input: &PlannerInput<'_>) -> PlanDecision {
        let enough = input.high_confidence_count() >= MIN_HIGH_CONFIDENCE;
        if (enough || input.budgets_exhausted()) && !input.evidence.is_empty() {
            return PlanDecision {
                next_action: NextAction::Finalize,
                queries: Vec::new(),
                coverage_gaps: Vec::new(),
            };
        }

        let gaps = Self::gaps(input);
        let mut variants = Self::query_variants(input.question, input.time_sensitive);
        for gap in &gaps {
            variants.push(format!("{} {gap}", input.question.trim()));
        }
        let queries = sanitize_queries(
            variants,
            input.previous_queries,
            input.remaining_query_budget,
        );

        if queries.is_empty() && !input.evidence.is_empty() {
            return PlanDecision {
                next_action: NextAction::Finalize,
                queries: Vec::new(),
                coverage_gaps: gaps,
            };
        }

        PlanDecision {
            next_action: NextAction::Search,
            queries,
            coverage_gaps: gaps,
        }
    }
}

// ============================================================================
// JSON planner
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawDecision {
    next_action: String,
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    coverage_gaps: Vec<String>,
}

/// LLM-backed planner with the heuristic as its safety net
pub struct JsonPlanner {
    gateway: Arc<dyn CompletionGateway>,
    model: String,
    fallback: HeuristicPlanner,
}

impl JsonPlanner {
    pub fn new(gateway: Arc<dyn CompletionGateway>, model: String) -> Self {
        Self {
            gateway,
            model,
            fallback: HeuristicPlanner::new(),
        }
    }

    fn prompt(input: &PlannerInput<'_>, initial: bool) -> String {
        let mut evidence_lines = String::new();
        for item in input.evidence.iter().take(EVIDENCE_LINES_FOR_PROMPT) {
            let read = if item.enriched_by_read { " [read]" } else { "" };
            evidence_lines.push_str(&format!(
                "- {:.3} {} {}{read}\n",
                item.citation.score, item.citation.url, item.citation.title
            ));
        }
        if evidence_lines.is_empty() {
            evidence_lines.push_str("(none yet)\n");
        }

        let phase = if initial {
            "Plan the first round of web searches."
        } else {
            "Evaluate the evidence and decide whether to keep searching."
        };

        format!(
            "You are the research planner of a web-grounded assistant. {phase}\n\
             Question: {question}\n\
             Loop {loop_index} of {max_loops}. Remaining query budget: {budget}.\n\
             Queries already used: {previous:?}\n\
             Current evidence (score, url, title):\n{evidence_lines}\
             Respond with ONLY a JSON object, no prose, matching exactly:\n\
             {{\"next_action\":\"search\"|\"finalize\",\"queries\":[\"...\"],\"coverage_gaps\":[\"...\"]}}\n\
             Rules: at most {budget} queries; never repeat a used query; \
             finalize only when the evidence already answers the question.",
            question = input.question,
            loop_index = input.loop_index,
            max_loops = input.max_loops,
            budget = input.remaining_query_budget,
            previous = input.previous_queries,
        )
    }

    /// Pull the JSON object out of a possibly fenced or chatty reply
    fn extract_json(reply: &str) -> Option<&str> {
        let start = reply.find('{')?;
        let end = reply.rfind('}')?;
        if end < start {
            return None;
        }
        Some(&reply[start..=end])
    }

    fn coerce(raw: RawDecision, input: &PlannerInput<'_>) -> Option<PlanDecision> {
        let next_action = match raw.next_action.as_str() {
            "search" => NextAction::Search,
            // finalize is only valid over a non-empty pool
            "finalize" if !input.evidence.is_empty() => NextAction::Finalize,
            "finalize" => NextAction::Search,
            _ => return None,
        };

        let queries = sanitize_queries(
            raw.queries,
            input.previous_queries,
            input.remaining_query_budget,
        );

        if next_action == NextAction::Search && queries.is_empty() {
            return None;
        }

        Some(PlanDecision {
            next_action,
            queries,
            coverage_gaps: raw
                .coverage_gaps
                .into_iter()
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .take(5)
                .collect(),
        })
    }

    async fn decide(&self, input: &PlannerInput<'_>, initial: bool) -> Option<PlanDecision> {
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![PromptMessage::user(Self::prompt(input, initial))],
            reasoning_effort: None,
        };

        let reply = match tokio::time::timeout(PLANNER_CALL_TIMEOUT, self.gateway.complete(request))
            .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!("planner model call failed: {e}");
                return None;
            }
            Err(_) => {
                debug!("planner model call timed out");
                return None;
            }
        };

        let json = Self::extract_json(&reply)?;
        let raw: RawDecision = serde_json::from_str(json).ok()?;
        Self::coerce(raw, input)
    }
}

#[async_trait]
impl Planner for JsonPlanner {
    async fn initial_plan(&self, input: &PlannerInput<'_>) -> PlanDecision {
        match self.decide(input, true).await {
            Some(decision) => decision,
            None => self.fallback.initial_plan(input).await,
        }
    }

    async fn evaluate_evidence(&self, input: &PlannerInput<'_>) -> PlanDecision {
        match self.decide(input, false).await {
            Some(decision) => decision,
            None => self.fallback.evaluate_evidence(input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Citation;

    fn item(url: &str, score: f64) -> EvidenceItem {
        EvidenceItem {
            citation: Citation {
                url: url.to_string(),
                title: "t".to_string(),
                snippet: String::new(),
                source_provider: "google".to_string(),
                query: "q".to_string(),
                pass: 1,
                score,
            },
            extracted_text: None,
            fetched_at: None,
            enriched_by_read: false,
        }
    }

    fn input<'a>(
        question: &'a str,
        evidence: &'a [EvidenceItem],
        previous: &'a [String],
        budget: u32,
    ) -> PlannerInput<'a> {
        PlannerInput {
            question,
            time_sensitive: false,
            loop_index: 1,
            max_loops: 3,
            remaining_query_budget: budget,
            remaining_read_budget: 2,
            previous_queries: previous,
            coverage_gaps: &[],
            evidence,
        }
    }

    #[tokio::test]
    async fn test_heuristic_initial_plan_variants() {
        let planner = HeuristicPlanner::new();
        let decision = planner
            .initial_plan(&input("rust async runtimes", &[], &[], 4))
            .await;

        assert_eq!(decision.next_action, NextAction::Search);
        assert_eq!(decision.queries.len(), 4);
        assert_eq!(decision.queries[0], "rust async runtimes");
        assert!(decision.queries[1].ends_with("key facts"));
    }

    #[tokio::test]
    async fn test_heuristic_time_sensitive_adds_latest() {
        let planner = HeuristicPlanner::new();
        let mut inp = input("tokio release", &[], &[], 20);
        inp.time_sensitive = true;
        let decision = planner.initial_plan(&inp).await;
        assert!(decision.queries.iter().any(|q| q.ends_with("latest")));
        assert!(decision.queries.iter().any(|q| q.ends_with("changelog")));
    }

    #[tokio::test]
    async fn test_heuristic_never_repeats_previous_queries() {
        let planner = HeuristicPlanner::new();
        let previous = vec!["Rust Async Runtimes".to_string()];
        let decision = planner
            .initial_plan(&input("rust async runtimes", &[], &previous, 4))
            .await;
        assert!(
            decision
                .queries
                .iter()
                .all(|q| !q.eq_ignore_ascii_case("rust async runtimes"))
        );
    }

    #[tokio::test]
    async fn test_heuristic_finalizes_on_high_confidence() {
        let planner = HeuristicPlanner::new();
        let evidence = vec![
            item("https://a/1", 0.7),
            item("https://a/2", 0.66),
            item("https://a/3", 0.58),
        ];
        let decision = planner
            .evaluate_evidence(&input("q", &evidence, &[], 4))
            .await;
        assert_eq!(decision.next_action, NextAction::Finalize);
    }

    #[tokio::test]
    async fn test_heuristic_keeps_searching_below_threshold() {
        let planner = HeuristicPlanner::new();
        let evidence = vec![item("https://a/1", 0.3)];
        let decision = planner
            .evaluate_evidence(&input("some question", &evidence, &[], 4))
            .await;
        assert_eq!(decision.next_action, NextAction::Search);
        assert!(!decision.queries.is_empty());
    }

    #[tokio::test]
    async fn test_heuristic_exhausted_budget_finalizes_nonempty_pool() {
        let planner = HeuristicPlanner::new();
        let evidence = vec![item("https://a/1", 0.3)];
        let mut inp = input("q", &evidence, &[], 0);
        inp.loop_index = 3;
        let decision = planner.evaluate_evidence(&inp).await;
        assert_eq!(decision.next_action, NextAction::Finalize);
    }

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Sure!\n```json\n{\"next_action\":\"search\",\"queries\":[\"a\"]}\n```";
        let json = JsonPlanner::extract_json(reply).unwrap();
        assert!(json.starts_with('{') && json.ends_with('}'));
        let raw: RawDecision = serde_json::from_str(json).unwrap();
        assert_eq!(raw.next_action, "search");
    }

    #[test]
    fn test_coerce_rejects_unknown_action() {
        let raw = RawDecision {
            next_action: "ponder".into(),
            queries: vec!["a".into()],
            coverage_gaps: vec![],
        };
        assert!(JsonPlanner::coerce(raw, &input("q", &[], &[], 4)).is_none());
    }

    #[test]
    fn test_coerce_finalize_on_empty_pool_becomes_search() {
        let raw = RawDecision {
            next_action: "finalize".into(),
            queries: vec!["follow up".into()],
            coverage_gaps: vec![],
        };
        let decision = JsonPlanner::coerce(raw, &input("q", &[], &[], 4)).unwrap();
        assert_eq!(decision.next_action, NextAction::Search);
    }

    #[test]
    fn test_coerce_truncates_to_budget_and_dedupes() {
        let raw = RawDecision {
            next_action: "search".into(),
            queries: vec![
                "one".into(),
                "ONE".into(),
                "two".into(),
                "three".into(),
                "four".into(),
            ],
            coverage_gaps: vec![],
        };
        let decision = JsonPlanner::coerce(raw, &input("q", &[], &[], 2)).unwrap();
        assert_eq!(decision.queries, vec!["one".to_string(), "two".to_string()]);
    }
}
