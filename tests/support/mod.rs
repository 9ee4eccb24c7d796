//! Shared fixtures for the integration suite: scripted provider gateways
//! and an app-state builder over an in-memory database.
#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use sounder::completions::{
    CompletionError, CompletionEvent, CompletionGateway, CompletionRequest, GenerationMetadata,
    TokenUsage,
};
use sounder::config::Settings;
use sounder::reader::{PageFetcher, PageText, ReadError};
use sounder::search::{SearchBackend, SearchError, SearchHit, SearchLimiter};
use sounder::server::AppState;
use sounder::store::ChatStore;

// ============================================================================
// Model gateway
// ============================================================================

/// Plays back a fixed completion stream and records every request it sees
pub struct ScriptedGateway {
    pub token_deltas: Vec<String>,
    pub reasoning_deltas: Vec<String>,
    pub usage: Option<TokenUsage>,
    /// Reply for non-streaming calls (the JSON planner)
    pub complete_reply: String,
    pub captured: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedGateway {
    pub fn speaking(text: &str) -> Self {
        Self {
            token_deltas: vec![text.to_string()],
            reasoning_deltas: Vec::new(),
            usage: None,
            complete_reply: "no json here".to_string(),
            captured: Mutex::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> CompletionRequest {
        self.captured.lock().unwrap().last().cloned().expect("no requests captured")
    }

    pub fn request_count(&self) -> usize {
        self.captured.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionGateway for ScriptedGateway {
    fn ready(&self) -> bool {
        true
    }

    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<CompletionEvent>, CompletionError> {
        self.captured.lock().unwrap().push(request);

        let mut events = vec![CompletionEvent::Start {
            generation_id: Some("gen-test".to_string()),
        }];
        for delta in &self.reasoning_deltas {
            events.push(CompletionEvent::ReasoningDelta(delta.clone()));
        }
        for delta in &self.token_deltas {
            events.push(CompletionEvent::TextDelta(delta.clone()));
        }
        if let Some(usage) = &self.usage {
            events.push(CompletionEvent::Usage(usage.clone()));
        }
        events.push(CompletionEvent::Done);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        self.captured.lock().unwrap().push(request);
        Ok(self.complete_reply.clone())
    }

    async fn generation_metadata(
        &self,
        _generation_id: &str,
    ) -> Result<GenerationMetadata, CompletionError> {
        Ok(GenerationMetadata::default())
    }
}

// ============================================================================
// Search backends
// ============================================================================

pub struct StaticSearch {
    pub hits: Vec<SearchHit>,
}

#[async_trait]
impl SearchBackend for StaticSearch {
    async fn search(&self, _query: &str, _count: u32) -> Result<Vec<SearchHit>, SearchError> {
        Ok(self.hits.clone())
    }
}

pub struct TransientFailingSearch;

#[async_trait]
impl SearchBackend for TransientFailingSearch {
    async fn search(&self, _query: &str, _count: u32) -> Result<Vec<SearchHit>, SearchError> {
        Err(SearchError::Transient("upstream hiccup".to_string()))
    }
}

pub struct HangingSearch;

#[async_trait]
impl SearchBackend for HangingSearch {
    async fn search(&self, _query: &str, _count: u32) -> Result<Vec<SearchHit>, SearchError> {
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        Ok(Vec::new())
    }
}

pub fn hit(url: &str, title: &str) -> SearchHit {
    SearchHit {
        title: title.to_string(),
        url: url.to_string(),
        snippet: "A reasonably descriptive snippet about the page contents here.".to_string(),
    }
}

// ============================================================================
// Reader
// ============================================================================

pub struct OkReader;

#[async_trait]
impl PageFetcher for OkReader {
    async fn read(&self, _url: &str) -> Result<PageText, ReadError> {
        Ok(PageText {
            extracted_text: "extracted page body".to_string(),
            fetched_at: chrono::Utc::now(),
        })
    }
}

// ============================================================================
// App state
// ============================================================================

/// Settings tuned so tests run in milliseconds
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.chat.max_search_queries = 1;
    settings.chat.min_search_interval = std::time::Duration::from_millis(1);
    settings.deep_research.max_loops = 1;
    settings.deep_research.max_search_queries = 1;
    settings.deep_research.max_sources_read = 0;
    settings.deep_research.min_search_interval = std::time::Duration::from_millis(1);
    settings
}

pub async fn app_state(
    search: Arc<dyn SearchBackend>,
    gateway: Arc<dyn CompletionGateway>,
    settings: Settings,
) -> AppState {
    // One connection: an in-memory database exists per connection
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory db");
    sounder::db::init_schema(&pool).await.expect("apply schema");

    AppState {
        store: ChatStore::new(pool),
        settings: Arc::new(settings),
        search,
        reader: Arc::new(OkReader),
        gateway,
        limiter: Arc::new(SearchLimiter::new()),
        search_configured: true,
    }
}

// ============================================================================
// SSE parsing
// ============================================================================

/// Split an SSE body into its JSON payloads
pub fn parse_events(body: &str) -> Vec<serde_json::Value> {
    body.split("\n\n")
        .filter_map(|frame| {
            frame
                .lines()
                .find_map(|line| line.strip_prefix("data: "))
                .and_then(|data| serde_json::from_str(data).ok())
        })
        .collect()
}

/// The `type` tags of the parsed events, in order
pub fn event_types(events: &[serde_json::Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e["type"].as_str().map(String::from))
        .collect()
}

/// Assert `needles` appear in `haystack` in order (gaps allowed)
pub fn assert_subsequence(haystack: &[String], needles: &[&str]) {
    let mut it = haystack.iter();
    for needle in needles {
        assert!(
            it.any(|t| t == needle),
            "expected event '{needle}' in order within {haystack:?}"
        );
    }
}
