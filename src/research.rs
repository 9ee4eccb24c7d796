//! Research orchestrator
//!
//! Drives the bounded plan -> search -> read -> evaluate loop for one
//! request, feeding the evidence pool and emitting progress over a channel.
//! Budgets and the run deadline are hard limits; individual query or read
//! failures degrade to warnings.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ResearchBudgets;
use crate::evidence::{score_candidate, Citation, EvidenceItem, EvidencePool};
use crate::planner::{NextAction, PlanDecision, Planner, PlannerInput};
use crate::reader::PageFetcher;
use crate::search::{SearchBackend, SearchError, SearchLimiter};

/// Phases of a research run, in the order they occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    Planning,
    Searching,
    Reading,
    Evaluating,
    Iterating,
    Synthesizing,
    Finalizing,
}

impl ResearchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Searching => "searching",
            Self::Reading => "reading",
            Self::Evaluating => "evaluating",
            Self::Iterating => "iterating",
            Self::Synthesizing => "synthesizing",
            Self::Finalizing => "finalizing",
        }
    }
}

/// One progress update, forwarded 1:1 onto the client stream
#[derive(Debug, Clone, Serialize)]
pub struct ResearchProgress {
    pub phase: ResearchPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_passes: Option<u32>,
    #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_loops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources_considered: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources_read: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

impl ResearchProgress {
    pub fn phase(phase: ResearchPhase) -> Self {
        Self {
            phase,
            title: None,
            message: None,
            detail: None,
            pass: None,
            total_passes: None,
            loop_index: None,
            max_loops: None,
            sources_considered: None,
            sources_read: None,
            decision: None,
        }
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Sufficient,
    BudgetExhausted,
    Timeout,
    Error,
}

/// Limits for one run
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub budgets: ResearchBudgets,
    /// Run-scoped wall-clock ceiling; None means the outer request deadline
    /// is the only limit
    pub overall_timeout: Option<Duration>,
}

/// Result of one run; partial on timeout
#[derive(Debug)]
pub struct ResearchOutcome {
    /// Ranked evidence, best first
    pub evidence: Vec<EvidenceItem>,
    pub warnings: Vec<String>,
    pub stop_reason: StopReason,
    pub loops: u32,
    pub queries_used: u32,
    pub sources_read: u32,
}

pub struct ResearchOrchestrator {
    search: Arc<dyn SearchBackend>,
    reader: Arc<dyn PageFetcher>,
    planner: Arc<dyn Planner>,
    limiter: Arc<SearchLimiter>,
}

struct RunState {
    pool: EvidencePool,
    warnings: Vec<String>,
    previous_queries: Vec<String>,
    coverage_gaps: Vec<String>,
    queries_used: u32,
    reads_attempted: u32,
    sources_read: u32,
    loops: u32,
}

impl RunState {
    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }
}

impl ResearchOrchestrator {
    pub fn new(
        search: Arc<dyn SearchBackend>,
        reader: Arc<dyn PageFetcher>,
        planner: Arc<dyn Planner>,
        limiter: Arc<SearchLimiter>,
    ) -> Self {
        Self {
            search,
            reader,
            planner,
            limiter,
        }
    }

    /// Run the research loop to completion, timeout, or budget exhaustion.
    pub async fn run(
        &self,
        question: &str,
        time_sensitive: bool,
        config: &ResearchConfig,
        progress: mpsc::Sender<ResearchProgress>,
    ) -> ResearchOutcome {
        let deadline = config.overall_timeout.map(|t| Instant::now() + t);
        let budgets = &config.budgets;

        let mut state = RunState {
            pool: EvidencePool::new(),
            warnings: Vec::new(),
            previous_queries: Vec::new(),
            coverage_gaps: Vec::new(),
            queries_used: 0,
            reads_attempted: 0,
            sources_read: 0,
            loops: 0,
        };

        // Single-pass grounding keeps the stream lean: only the search phase
        // announces itself. Multi-loop runs narrate every transition.
        let narrate = budgets.max_loops > 1;

        if narrate {
            emit(
                &progress,
                ResearchProgress {
                    title: Some("Planning".to_string()),
                    message: Some("Working out what to search for".to_string()),
                    loop_index: Some(1),
                    max_loops: Some(budgets.max_loops),
                    ..ResearchProgress::phase(ResearchPhase::Planning)
                },
            )
            .await;
        }

        let mut decision = {
            let ranked = state.pool.rank();
            self.planner
                .initial_plan(&planner_input(question, time_sensitive, 1, budgets, &state, &ranked))
                .await
        };

        for loop_index in 1..=budgets.max_loops {
            state.loops = loop_index;

            if decision.next_action == NextAction::Finalize {
                return finish(state, StopReason::Sufficient);
            }
            if expired(deadline) {
                return finish(state, StopReason::Timeout);
            }

            // SEARCH
            let search_outcome = self
                .search_phase(
                    &mut state,
                    &decision,
                    time_sensitive,
                    loop_index,
                    budgets,
                    deadline,
                    &progress,
                )
                .await;
            match search_outcome {
                PhaseOutcome::Continue => {}
                PhaseOutcome::Timeout => return finish(state, StopReason::Timeout),
                PhaseOutcome::Fatal => return finish(state, StopReason::Error),
            }

            // READ
            if budgets.max_sources_read > state.reads_attempted {
                match self
                    .read_phase(&mut state, loop_index, budgets, deadline, &progress)
                    .await
                {
                    PhaseOutcome::Continue => {}
                    PhaseOutcome::Timeout => return finish(state, StopReason::Timeout),
                    PhaseOutcome::Fatal => unreachable!("reader failures never abort the loop"),
                }
            }

            // EVALUATE
            if narrate {
                emit(
                    &progress,
                    ResearchProgress {
                        title: Some("Evaluating".to_string()),
                        message: Some(format!(
                            "Weighing {} sources ({} read)",
                            state.pool.len(),
                            state.sources_read
                        )),
                        loop_index: Some(loop_index),
                        max_loops: Some(budgets.max_loops),
                        sources_considered: Some(state.pool.len()),
                        sources_read: Some(state.sources_read as usize),
                        ..ResearchProgress::phase(ResearchPhase::Evaluating)
                    },
                )
                .await;
            }

            if expired(deadline) {
                return finish(state, StopReason::Timeout);
            }

            let ranked = state.pool.rank();
            decision = self
                .planner
                .evaluate_evidence(&planner_input(
                    question,
                    time_sensitive,
                    loop_index,
                    budgets,
                    &state,
                    &ranked,
                ))
                .await;
            state.coverage_gaps = decision.coverage_gaps.clone();

            if decision.next_action == NextAction::Finalize {
                return finish(state, StopReason::Sufficient);
            }

            // A failed query is a warning, not fatal, unless it was the lone
            // query of the first loop and left the pool empty.
            if loop_index == 1
                && state.queries_used == 1
                && state.pool.is_empty()
                && !state.warnings.is_empty()
            {
                return finish(state, StopReason::Error);
            }

            let out_of_budget = state.queries_used >= budgets.max_search_queries
                || loop_index >= budgets.max_loops;
            if out_of_budget {
                return finish(state, StopReason::BudgetExhausted);
            }

            emit(
                &progress,
                ResearchProgress {
                    title: Some("Digging deeper".to_string()),
                    message: Some(format!("Starting pass {}", loop_index + 1)),
                    detail: (!decision.coverage_gaps.is_empty())
                        .then(|| decision.coverage_gaps.join(", ")),
                    loop_index: Some(loop_index + 1),
                    max_loops: Some(budgets.max_loops),
                    sources_considered: Some(state.pool.len()),
                    sources_read: Some(state.sources_read as usize),
                    decision: Some("search".to_string()),
                    ..ResearchProgress::phase(ResearchPhase::Iterating)
                },
            )
            .await;
        }

        finish(state, StopReason::BudgetExhausted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn search_phase(
        &self,
        state: &mut RunState,
        decision: &PlanDecision,
        time_sensitive: bool,
        loop_index: u32,
        budgets: &ResearchBudgets,
        deadline: Option<Instant>,
        progress: &mpsc::Sender<ResearchProgress>,
    ) -> PhaseOutcome {
        let planned: Vec<&String> = decision
            .queries
            .iter()
            .take(
                budgets
                    .max_search_queries
                    .saturating_sub(state.queries_used) as usize,
            )
            .collect();
        if planned.is_empty() {
            return PhaseOutcome::Continue;
        }

        emit(
            progress,
            ResearchProgress {
                title: Some("Searching".to_string()),
                message: Some(format!("Searching the web: {}", planned[0])),
                detail: (planned.len() > 1).then(|| format!("{} queries this pass", planned.len())),
                pass: Some(loop_index),
                total_passes: Some(budgets.max_loops),
                loop_index: Some(loop_index),
                max_loops: Some(budgets.max_loops),
                sources_considered: Some(state.pool.len()),
                sources_read: Some(state.sources_read as usize),
                ..ResearchProgress::phase(ResearchPhase::Searching)
            },
        )
        .await;

        for query in planned {
            if expired(deadline) {
                return PhaseOutcome::Timeout;
            }

            if let Err(e) = self
                .limiter
                .wait_turn(budgets.min_search_interval, deadline)
                .await
            {
                debug!("search slot wait aborted: {e}");
                return PhaseOutcome::Timeout;
            }

            state.queries_used += 1;
            state.previous_queries.push(query.clone());

            match self
                .search_with_retry(query, budgets, deadline)
                .await
            {
                Ok(hits) => {
                    for hit in hits {
                        let score =
                            score_candidate(&hit.title, &hit.snippet, &hit.url, query, time_sensitive);
                        state.pool.add_candidate(Citation {
                            url: hit.url,
                            title: hit.title,
                            snippet: hit.snippet,
                            source_provider: "google".to_string(),
                            query: query.clone(),
                            pass: loop_index,
                            score,
                        });
                    }
                }
                Err(SearchError::MissingApiKey) => {
                    state.warn("web search unavailable: search API key not configured");
                    return PhaseOutcome::Fatal;
                }
                Err(SearchError::DeadlineExceeded) => return PhaseOutcome::Timeout,
                Err(SearchError::RateLimited) => {
                    state.warn(format!("search rate limited, skipped query: {query}"));
                }
                Err(e) => {
                    warn!("search query failed: {e}");
                    state.warn(format!("search failed for query: {query}"));
                }
            }
        }

        PhaseOutcome::Continue
    }

    /// One automatic retry on rate-limit, after waiting at least the
    /// configured interval. Anything beyond that is the caller's warning.
    async fn search_with_retry(
        &self,
        query: &str,
        budgets: &ResearchBudgets,
        deadline: Option<Instant>,
    ) -> Result<Vec<crate::search::SearchHit>, SearchError> {
        let count = budgets.search_results_per_query;
        match bounded(deadline, self.search.search(query, count)).await? {
            Ok(hits) => Ok(hits),
            Err(SearchError::RateLimited) => {
                debug!("search rate limited, retrying once: {query}");
                self.limiter
                    .wait_turn(budgets.min_search_interval, deadline)
                    .await?;
                bounded(deadline, self.search.search(query, count)).await?
            }
            Err(e) => Err(e),
        }
    }

    async fn read_phase(
        &self,
        state: &mut RunState,
        loop_index: u32,
        budgets: &ResearchBudgets,
        deadline: Option<Instant>,
        progress: &mpsc::Sender<ResearchProgress>,
    ) -> PhaseOutcome {
        let remaining = budgets.max_sources_read.saturating_sub(state.reads_attempted);
        let candidates: Vec<String> = state
            .pool
            .rank()
            .into_iter()
            .filter(|item| !item.enriched_by_read)
            .take(remaining as usize)
            .map(|item| item.citation.url.clone())
            .collect();

        if candidates.is_empty() {
            return PhaseOutcome::Continue;
        }

        emit(
            progress,
            ResearchProgress {
                title: Some("Reading".to_string()),
                message: Some(format!("Reading {} sources", candidates.len())),
                loop_index: Some(loop_index),
                max_loops: Some(budgets.max_loops),
                sources_considered: Some(state.pool.len()),
                sources_read: Some(state.sources_read as usize),
                ..ResearchProgress::phase(ResearchPhase::Reading)
            },
        )
        .await;

        for url in candidates {
            if expired(deadline) {
                return PhaseOutcome::Timeout;
            }
            if state.pool.has_read(&url) {
                continue;
            }

            state.reads_attempted += 1;
            match bounded(deadline, self.reader.read(&url)).await {
                Err(_) => return PhaseOutcome::Timeout,
                Ok(Ok(page)) => {
                    state.sources_read += 1;
                    state
                        .pool
                        .promote_with_read(&url, page.extracted_text, page.fetched_at);
                }
                Ok(Err(e)) => {
                    debug!("read failed ({}) for {url}", e.reason());
                    state.warn(format!("could not read a source ({})", e.reason()));
                }
            }
        }

        PhaseOutcome::Continue
    }
}

enum PhaseOutcome {
    Continue,
    Timeout,
    Fatal,
}

fn planner_input<'a>(
    question: &'a str,
    time_sensitive: bool,
    loop_index: u32,
    budgets: &ResearchBudgets,
    state: &'a RunState,
    ranked: &'a [EvidenceItem],
) -> PlannerInput<'a> {
    PlannerInput {
        question,
        time_sensitive,
        loop_index,
        max_loops: budgets.max_loops,
        remaining_query_budget: budgets.max_search_queries.saturating_sub(state.queries_used),
        remaining_read_budget: budgets.max_sources_read.saturating_sub(state.reads_attempted),
        previous_queries: &state.previous_queries,
        coverage_gaps: &state.coverage_gaps,
        evidence: ranked,
    }
}

fn finish(state: RunState, stop_reason: StopReason) -> ResearchOutcome {
    ResearchOutcome {
        evidence: state.pool.rank(),
        warnings: state.warnings,
        stop_reason,
        loops: state.loops,
        queries_used: state.queries_used,
        sources_read: state.sources_read,
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Run a future, bounded by the run deadline when one is set
async fn bounded<T>(
    deadline: Option<Instant>,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, SearchError> {
    match deadline {
        Some(d) => tokio::time::timeout_at(d, fut)
            .await
            .map_err(|_| SearchError::DeadlineExceeded),
        None => Ok(fut.await),
    }
}

async fn emit(progress: &mpsc::Sender<ResearchProgress>, event: ResearchProgress) {
    // Receiver may have gone away with the client; research carries on
    let _ = progress.send(event).await;
}
