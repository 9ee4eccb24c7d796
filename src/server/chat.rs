//! Chat stream processing
//!
//! One request, one pipeline task, one outbound SSE connection. Everything
//! that can fail with an HTTP status does so before the stream opens; after
//! that, failures are in-band `error` events. Event order is fixed:
//! `metadata` first, exactly one `done` last, tokens only in between.

use anyhow::Result;
use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::citations::order_citations;
use crate::completions::{CompletionEvent, CompletionRequest, TokenUsage};
use crate::context::{
    apply_attachments, compose_messages, is_time_sensitive, ChatMode, HistoryMessage,
};
use crate::error::ApiError;
use crate::evidence::{Citation, EvidenceItem};
use crate::planner::{HeuristicPlanner, JsonPlanner, Planner};
use crate::research::{
    ResearchConfig, ResearchOrchestrator, ResearchOutcome, ResearchPhase, ResearchProgress,
    StopReason,
};
use crate::store::AssistantResponse;
use crate::trace::{ThinkingTrace, TraceEntry};

use super::types::{ChatRequest, StreamEvent};
use super::{require_user, AppState};

/// Ceiling for the detached usage-enrichment task
const ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(20);

/// Fully resolved request, ready to stream
struct ResolvedRequest {
    request_id: String,
    user_id: String,
    conversation_id: String,
    /// Original user text, as persisted
    message: String,
    /// User text plus bounded attachment suffix, as prompted
    prompt_message: String,
    model_id: String,
    mode: ChatMode,
    grounding: bool,
    deep_research: bool,
    reasoning_effort: Option<String>,
    history: Vec<HistoryMessage>,
    time_sensitive: bool,
}

/// POST /api/chat/stream
pub async fn chat_stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let resolved = resolve(&state, &headers, request).await?;

    tracing::info!(
        request_id = %resolved.request_id,
        conversation_id = %resolved.conversation_id,
        model = %resolved.model_id,
        mode = resolved.mode.as_str(),
        grounding = resolved.grounding,
        "chat stream starting"
    );

    let (tx, rx) = mpsc::channel::<StreamEvent>(256);

    tokio::spawn(async move {
        if let Err(e) = run_pipeline(state, resolved, tx.clone()).await {
            let _ = tx
                .send(StreamEvent::Error {
                    message: e.to_string(),
                })
                .await;
        }
        let _ = tx.send(StreamEvent::Done).await;
    });

    let stream = async_stream::stream! {
        let mut rx = rx;
        while let Some(event) = rx.recv().await {
            let done = matches!(event, StreamEvent::Done);
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().event("message").data(data));
            if done {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Everything that must fail with an HTTP status happens here, before the
/// SSE headers go out.
async fn resolve(
    state: &AppState,
    headers: &HeaderMap,
    request: ChatRequest,
) -> Result<ResolvedRequest, ApiError> {
    let user_id = require_user(headers)?;
    request.validate()?;

    if !state.gateway.ready() {
        return Err(ApiError::missing_provider_key(
            "model provider API key not configured",
        ));
    }

    let deep_research = request.deep_research.unwrap_or(false);
    // Grounding is the product default; deep research implies it
    let grounding = request.grounding.unwrap_or(true) || deep_research;
    let mode = if deep_research {
        ChatMode::DeepResearch
    } else {
        ChatMode::Chat
    };

    let attachments = if request.file_ids.is_empty() {
        Vec::new()
    } else {
        state
            .store
            .attachments_for_user(&user_id, &request.file_ids)
            .await?
            .ok_or_else(|| ApiError::invalid_request("attachment does not exist or is not yours"))?
    };

    // Ownership check happens inside resolve_conversation, before any write
    let (conversation_id, _created) = state
        .store
        .resolve_conversation(&user_id, request.conversation_id.as_deref(), &request.message)
        .await?;

    let history = state
        .store
        .load_history(&conversation_id, state.settings.history_window)
        .await?;

    state
        .store
        .insert_user_message(&user_id, &conversation_id, &request.message)
        .await?;

    let model_id = request
        .model_id
        .clone()
        .unwrap_or_else(|| state.settings.default_model.clone());
    let supports_reasoning = state.store.model_supports_reasoning(&model_id).await?;

    let reasoning_effort = if !supports_reasoning {
        None
    } else if let Some(effort) = &request.reasoning_effort {
        // Explicit override also updates the per-user per-mode preset
        state
            .store
            .set_reasoning_preset(&user_id, mode.as_str(), effort)
            .await?;
        Some(effort.clone())
    } else {
        state
            .store
            .reasoning_preset(&user_id, mode.as_str())
            .await?
            .filter(|e| crate::context::valid_effort(e))
            .or_else(|| {
                state
                    .settings
                    .default_effort(deep_research)
                    .map(String::from)
            })
    };

    let prompt_message = apply_attachments(&request.message, &attachments);
    let time_sensitive = is_time_sensitive(&request.message);

    Ok(ResolvedRequest {
        request_id: Uuid::new_v4().to_string(),
        user_id,
        conversation_id,
        message: request.message,
        prompt_message,
        model_id,
        mode,
        grounding,
        deep_research,
        reasoning_effort,
        history,
        time_sensitive,
    })
}

async fn run_pipeline(
    state: AppState,
    resolved: ResolvedRequest,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<()> {
    tx.send(StreamEvent::Metadata {
        grounding: resolved.grounding,
        deep_research: resolved.deep_research,
        model_id: resolved.model_id.clone(),
        conversation_id: resolved.conversation_id.clone(),
        reasoning_effort: resolved.reasoning_effort.clone(),
    })
    .await?;

    let budgets = state.settings.budgets(resolved.deep_research).clone();
    let mut trace = ThinkingTrace::new();
    let mut evidence: Vec<EvidenceItem> = Vec::new();

    if resolved.grounding {
        let outcome = run_research(&state, &resolved, &mut trace, &tx).await?;

        for message in &outcome.warnings {
            tx.send(StreamEvent::Warning {
                scope: "grounding".to_string(),
                message: message.clone(),
            })
            .await?;
        }

        if resolved.deep_research && outcome.stop_reason == StopReason::Timeout {
            let seconds = state.settings.deep_research_timeout.as_secs();
            trace.mark_stopped();
            tx.send(StreamEvent::Error {
                message: format!("deep research timed out after {seconds} seconds"),
            })
            .await?;
            return Ok(());
        }

        evidence = outcome.evidence;
        evidence.truncate(budgets.max_citations);
    }

    if resolved.grounding {
        let progress = ResearchProgress {
            title: Some("Synthesizing".to_string()),
            message: Some("Writing the answer".to_string()),
            ..ResearchProgress::phase(ResearchPhase::Synthesizing)
        };
        observe(&mut trace, &progress);
        tx.send(StreamEvent::Progress { progress }).await?;
    }

    // The evidence order in this prompt is the order citation markers
    // resolve against.
    let messages = compose_messages(
        resolved.mode,
        &evidence,
        &resolved.history,
        &resolved.prompt_message,
    );

    let completion = CompletionRequest {
        model: resolved.model_id.clone(),
        messages,
        reasoning_effort: resolved.reasoning_effort.clone(),
    };

    let mut model_rx = match state.gateway.stream(completion).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(request_id = %resolved.request_id, "model stream failed to open: {e}");
            tx.send(StreamEvent::Error {
                message: format!("model stream failed: {e}"),
            })
            .await?;
            return Ok(());
        }
    };

    let mut content = String::new();
    let mut reasoning_content = String::new();
    let mut usage: Option<TokenUsage> = None;
    let mut generation_id: Option<String> = None;
    let mut stream_error: Option<String> = None;

    while let Some(event) = model_rx.recv().await {
        match event {
            CompletionEvent::Start { generation_id: id } => generation_id = id,
            CompletionEvent::TextDelta(delta) => {
                content.push_str(&delta);
                tx.send(StreamEvent::Token { delta }).await?;
            }
            CompletionEvent::ReasoningDelta(delta) => {
                reasoning_content.push_str(&delta);
                tx.send(StreamEvent::Reasoning { delta }).await?;
            }
            CompletionEvent::Usage(u) => usage = Some(u),
            CompletionEvent::Done => break,
            CompletionEvent::Error(message) => {
                stream_error = Some(message);
                break;
            }
        }
    }

    if resolved.grounding {
        if stream_error.is_none() {
            trace.mark_done();
        } else {
            trace.mark_stopped();
        }
    }

    let presented: Vec<Citation> = evidence.iter().map(|i| i.citation.clone()).collect();
    let ordered = order_citations(&content, &presented, budgets.max_citations);

    let persisted = state
        .store
        .persist_assistant_response(AssistantResponse {
            user_id: &resolved.user_id,
            conversation_id: &resolved.conversation_id,
            content: &content,
            reasoning_content: (!reasoning_content.is_empty()).then_some(reasoning_content.as_str()),
            model_id: Some(&resolved.model_id),
            grounding_enabled: resolved.grounding,
            deep_research_enabled: resolved.deep_research,
            citations: &ordered,
            thinking_trace: (resolved.grounding && !trace.is_empty()).then_some(&trace),
            usage: usage.as_ref(),
        })
        .await;

    let message_id = match persisted {
        Ok(id) => id,
        Err(e) => {
            // Tokens already streamed; the status line is long gone
            warn!(request_id = %resolved.request_id, "persist failed: {e}");
            tx.send(StreamEvent::Error {
                message: "failed to save the response".to_string(),
            })
            .await?;
            return Ok(());
        }
    };

    if let Some(message) = stream_error {
        tx.send(StreamEvent::Error { message }).await?;
        return Ok(());
    }

    if let Some(usage) = usage.clone() {
        tx.send(StreamEvent::Usage { usage }).await?;
    }

    tx.send(StreamEvent::Progress {
        progress: ResearchProgress {
            title: Some("Finalizing".to_string()),
            ..ResearchProgress::phase(ResearchPhase::Finalizing)
        },
    })
    .await?;

    if message_id.is_some() && !ordered.is_empty() {
        tx.send(StreamEvent::Citations { citations: ordered }).await?;
    }

    // Usage enrichment runs detached and only touches the committed row
    if let (Some(message_id), Some(generation_id)) = (message_id, generation_id) {
        let gateway = Arc::clone(&state.gateway);
        let store = state.store.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(
                ENRICHMENT_TIMEOUT,
                gateway.generation_metadata(&generation_id),
            )
            .await
            {
                Ok(Ok(metadata)) => {
                    if let Err(e) = store.enrich_usage(&message_id, &metadata).await {
                        debug!("usage enrichment write failed: {e}");
                    }
                }
                Ok(Err(e)) => debug!("generation metadata lookup failed: {e}"),
                Err(_) => debug!("generation metadata lookup timed out"),
            }
        });
    }

    Ok(())
}

/// Drive the orchestrator, forwarding progress 1:1 and into the trace
async fn run_research(
    state: &AppState,
    resolved: &ResolvedRequest,
    trace: &mut ThinkingTrace,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<ResearchOutcome> {
    let planner: Arc<dyn Planner> = if resolved.deep_research {
        Arc::new(JsonPlanner::new(
            Arc::clone(&state.gateway),
            resolved.model_id.clone(),
        ))
    } else {
        Arc::new(HeuristicPlanner::new())
    };

    let orchestrator = ResearchOrchestrator::new(
        Arc::clone(&state.search),
        Arc::clone(&state.reader),
        planner,
        Arc::clone(&state.limiter),
    );

    let config = ResearchConfig {
        budgets: state.settings.budgets(resolved.deep_research).clone(),
        overall_timeout: resolved
            .deep_research
            .then(|| state.settings.deep_research_timeout),
    };

    let (progress_tx, mut progress_rx) = mpsc::channel::<ResearchProgress>(64);
    let question = resolved.message.clone();
    let time_sensitive = resolved.time_sensitive;

    let run = tokio::spawn(async move {
        orchestrator
            .run(&question, time_sensitive, &config, progress_tx)
            .await
    });

    while let Some(progress) = progress_rx.recv().await {
        observe(trace, &progress);
        tx.send(StreamEvent::Progress { progress }).await?;
    }

    let outcome = run.await.map_err(|e| anyhow::anyhow!("research task failed: {e}"))?;
    Ok(outcome)
}

fn observe(trace: &mut ThinkingTrace, progress: &ResearchProgress) {
    trace.push(TraceEntry {
        phase: progress.phase.as_str().to_string(),
        title: progress.title.clone(),
        message: progress.message.clone(),
        detail: progress.detail.clone(),
        at: Utc::now().timestamp(),
    });
}
