//! HTTP server
//!
//! Routes and boundary endpoints. Session handling lives outside this
//! service; the authenticated user id arrives in the `x-user-id` header.

pub mod chat;
pub mod types;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method},
    response::Json,
    routing::{delete, get, patch, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::completions::CompletionGateway;
use crate::config::Settings;
use crate::error::ApiError;
use crate::reader::PageFetcher;
use crate::search::{SearchBackend, SearchLimiter};
use crate::store::{ChatStore, ModelSync};

#[derive(Clone)]
pub struct AppState {
    pub store: ChatStore,
    pub settings: Arc<Settings>,
    pub search: Arc<dyn SearchBackend>,
    pub reader: Arc<dyn PageFetcher>,
    pub gateway: Arc<dyn CompletionGateway>,
    pub limiter: Arc<SearchLimiter>,
    /// Whether the search provider is usable at all; reported by /api/status
    pub search_configured: bool,
}

/// Authenticated user id, installed upstream by the session layer
pub fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| ApiError::unauthorized("missing user identity"))
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/chat/stream", post(chat::chat_stream_handler))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations/{id}", patch(rename_conversation))
        .route("/api/conversations/{id}", delete(delete_conversation))
        .route("/api/conversations/{id}/messages", get(conversation_messages))
        .route("/api/models", get(list_models))
        .route("/api/models/sync", post(sync_models))
        .route("/api/models/{id}/favorite", put(set_favorite))
        .route("/api/preferences", get(get_preferences))
        .route("/api/preferences", put(set_preference))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(port: u16, state: AppState) -> Result<()> {
    let app = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model_provider": state.gateway.ready(),
        "search_provider": state.search_configured,
        "default_model": state.settings.default_model,
    }))
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let conversations = state.store.conversations_for_user(&user_id).await?;
    Ok(Json(json!({ "conversations": conversations })))
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    #[serde(default)]
    title: Option<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let title = body.title.unwrap_or_default();
    let (id, _) = state
        .store
        .resolve_conversation(&user_id, None, title.trim())
        .await?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    title: String,
}

async fn rename_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    if body.title.trim().is_empty() {
        return Err(ApiError::invalid_request("title must not be empty"));
    }
    state
        .store
        .rename_conversation(&user_id, &id, body.title.trim())
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    state.store.delete_conversation(&user_id, &id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn conversation_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let messages = state.store.messages_with_details(&user_id, &id).await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let models = state.store.list_models(&user_id).await?;
    Ok(Json(json!({ "models": models })))
}

/// Admin catalog sync, bearer-token gated
async fn sync_models(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(models): Json<Vec<ModelSync>>,
) -> Result<Json<Value>, ApiError> {
    let Some(expected) = state.settings.sync_token.as_deref() else {
        return Err(ApiError::unauthorized("model sync is disabled"));
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if provided != expected {
        tracing::warn!("model sync auth failure: invalid or missing token");
        return Err(ApiError::unauthorized("invalid or missing sync token"));
    }

    let count = state.store.sync_models(&models).await?;
    Ok(Json(json!({ "synced": count })))
}

#[derive(Debug, Deserialize)]
struct FavoriteBody {
    favorite: bool,
}

async fn set_favorite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<FavoriteBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    state.store.set_favorite(&user_id, &id, body.favorite).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_preferences(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    let chat = state.store.reasoning_preset(&user_id, "chat").await?;
    let deep = state.store.reasoning_preset(&user_id, "deep_research").await?;
    Ok(Json(json!({
        "reasoning": { "chat": chat, "deep_research": deep },
    })))
}

#[derive(Debug, Deserialize)]
struct PreferenceBody {
    mode: String,
    effort: String,
}

async fn set_preference(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PreferenceBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&headers)?;
    if !matches!(body.mode.as_str(), "chat" | "deep_research") {
        return Err(ApiError::invalid_request("mode must be chat or deep_research"));
    }
    if !crate::context::valid_effort(&body.effort) {
        return Err(ApiError::invalid_request(
            "effort must be one of low, medium, high",
        ));
    }
    state
        .store
        .set_reasoning_preset(&user_id, &body.mode, &body.effort)
        .await?;
    Ok(Json(json!({ "ok": true })))
}
