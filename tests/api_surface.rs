//! Boundary endpoint contracts: conversations, models, preferences.

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

use sounder::server::{create_router, AppState};

use support::*;

async fn request(
    state: AppState,
    method: &str,
    uri: &str,
    user: Option<&str>,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let app = create_router(state);
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };

    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn state_with_sync_token() -> AppState {
    let gateway = Arc::new(ScriptedGateway::speaking("x"));
    let search = Arc::new(StaticSearch { hits: vec![] });
    let mut settings = fast_settings();
    settings.sync_token = Some("sekrit".to_string());
    app_state(search, gateway, settings).await
}

#[tokio::test]
async fn status_reports_providers() {
    let state = state_with_sync_token().await;
    let (status, body) = request(state, "GET", "/api/status", None, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model_provider"], true);
}

#[tokio::test]
async fn conversation_create_endpoint() {
    let state = state_with_sync_token().await;
    let (status, body) = request(
        state.clone(),
        "POST",
        "/api/conversations",
        Some("u1"),
        None,
        Some(json!({"title": "notes"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let (_, body) =
        request(state, "GET", "/api/conversations", Some("u1"), None, None).await;
    let listed = body["conversations"].as_array().unwrap();
    assert_eq!(listed[0]["id"], id.as_str());
    assert_eq!(listed[0]["title"], "notes");
}

#[tokio::test]
async fn conversations_crud_is_user_scoped() {
    let state = state_with_sync_token().await;
    let store = state.store.clone();

    let (mine, _) = store.resolve_conversation("u1", None, "my chat").await.unwrap();
    store.resolve_conversation("u2", None, "their chat").await.unwrap();

    let (status, body) =
        request(state.clone(), "GET", "/api/conversations", Some("u1"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = body["conversations"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], mine.as_str());

    // rename
    let (status, _) = request(
        state.clone(),
        "PATCH",
        &format!("/api/conversations/{mine}"),
        Some("u1"),
        None,
        Some(json!({"title": "renamed"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // rename by the wrong user 404s
    let (status, _) = request(
        state.clone(),
        "PATCH",
        &format!("/api/conversations/{mine}"),
        Some("u2"),
        None,
        Some(json!({"title": "stolen"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // delete
    let (status, _) = request(
        state.clone(),
        "DELETE",
        &format!("/api/conversations/{mine}"),
        Some("u1"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) =
        request(state, "GET", "/api/conversations", Some("u1"), None, None).await;
    assert!(body["conversations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn conversation_messages_enforce_ownership() {
    let state = state_with_sync_token().await;
    let store = state.store.clone();
    let (conv, _) = store.resolve_conversation("u1", None, "hi").await.unwrap();
    store.insert_user_message("u1", &conv, "hi").await.unwrap();

    let (status, body) = request(
        state.clone(),
        "GET",
        &format!("/api/conversations/{conv}/messages"),
        Some("u1"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);

    let (status, _) = request(
        state,
        "GET",
        &format!("/api/conversations/{conv}/messages"),
        Some("u2"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn model_sync_is_bearer_gated() {
    let state = state_with_sync_token().await;
    let catalog = json!([
        {"id": "acme/large", "name": "Acme Large", "supports_reasoning": true},
        {"id": "m/free", "name": "Free"},
    ]);

    // no token
    let (status, _) = request(
        state.clone(),
        "POST",
        "/api/models/sync",
        None,
        None,
        Some(catalog.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // wrong token
    let (status, _) = request(
        state.clone(),
        "POST",
        "/api/models/sync",
        None,
        Some("wrong"),
        Some(catalog.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // right token
    let (status, body) = request(
        state.clone(),
        "POST",
        "/api/models/sync",
        None,
        Some("sekrit"),
        Some(catalog),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["synced"], 2);

    let (status, body) =
        request(state, "GET", "/api/models", Some("u1"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let models = body["models"].as_array().unwrap();
    assert_eq!(models.len(), 2);
    let acme = models.iter().find(|m| m["id"] == "acme/large").unwrap();
    assert_eq!(acme["supports_reasoning"], true);
}

#[tokio::test]
async fn favorites_toggle() {
    let state = state_with_sync_token().await;
    state
        .store
        .sync_models(&[sounder::store::ModelSync {
            id: "m/free".into(),
            name: "Free".into(),
            supports_reasoning: false,
        }])
        .await
        .unwrap();

    let (status, _) = request(
        state.clone(),
        "PUT",
        "/api/models/m%2Ffree/favorite",
        Some("u1"),
        None,
        Some(json!({"favorite": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(state.clone(), "GET", "/api/models", Some("u1"), None, None).await;
    assert_eq!(body["models"][0]["favorite"], true);

    // other users are unaffected
    let (_, body) = request(state, "GET", "/api/models", Some("u2"), None, None).await;
    assert_eq!(body["models"][0]["favorite"], false);
}

#[tokio::test]
async fn preference_endpoint_validates_and_persists() {
    let state = state_with_sync_token().await;

    let (status, _) = request(
        state.clone(),
        "PUT",
        "/api/preferences",
        Some("u1"),
        None,
        Some(json!({"mode": "chat", "effort": "extreme"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        state.clone(),
        "PUT",
        "/api/preferences",
        Some("u1"),
        None,
        Some(json!({"mode": "deep_research", "effort": "medium"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        request(state, "GET", "/api/preferences", Some("u1"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reasoning"]["deep_research"], "medium");
    assert!(body["reasoning"]["chat"].is_null());
}
