//! Web search gateway
//!
//! Google Custom Search JSON API behind a typed-error contract, plus the
//! process-wide limiter that spaces out search attempts. Callers decide
//! whether a rate-limited query is retried; this layer just classifies.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

const SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";

/// Google caps Custom Search at 10 results per request
const MAX_RESULTS_PER_CALL: u32 = 10;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search provider API key not configured")]
    MissingApiKey,

    #[error("search provider rate limited")]
    RateLimited,

    #[error("search provider unavailable: {0}")]
    Transient(String),

    #[error("search provider rejected request: {0}")]
    Permanent(String),

    #[error("deadline passed while waiting for a search slot")]
    DeadlineExceeded,
}

/// One search result as returned by the provider
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Run one query and return up to `count` ordered results.
    async fn search(&self, query: &str, count: u32) -> Result<Vec<SearchHit>, SearchError>;
}

#[derive(Debug, Deserialize)]
struct GoogleSearchResponse {
    items: Option<Vec<GoogleSearchItem>>,
    error: Option<GoogleSearchError>,
}

#[derive(Debug, Deserialize)]
struct GoogleSearchItem {
    title: Option<String>,
    link: String,
    snippet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleSearchError {
    code: i32,
    message: String,
}

/// Google Custom Search client
pub struct GoogleSearch {
    http: reqwest::Client,
    api_key: Option<String>,
    engine_id: Option<String>,
}

impl GoogleSearch {
    pub fn new(api_key: Option<String>, engine_id: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (compatible; Sounder/1.0)")
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            api_key,
            engine_id,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.engine_id.is_some()
    }
}

#[async_trait]
impl SearchBackend for GoogleSearch {
    async fn search(&self, query: &str, count: u32) -> Result<Vec<SearchHit>, SearchError> {
        let (Some(api_key), Some(cx)) = (self.api_key.as_ref(), self.engine_id.as_ref()) else {
            return Err(SearchError::MissingApiKey);
        };

        let num = count.clamp(1, MAX_RESULTS_PER_CALL);
        let url = format!(
            "{SEARCH_URL}?key={}&cx={}&q={}&num={}",
            api_key,
            cx,
            urlencoding::encode(query),
            num
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SearchError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SearchError::RateLimited);
        }
        if status.is_server_error() {
            return Err(SearchError::Transient(format!("HTTP {status}")));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Permanent(format!("HTTP {status}: {body}")));
        }

        let parsed: GoogleSearchResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Transient(e.to_string()))?;

        if let Some(error) = parsed.error {
            if error.code == 429 {
                return Err(SearchError::RateLimited);
            }
            return Err(SearchError::Permanent(format!(
                "API error {}: {}",
                error.code, error.message
            )));
        }

        let hits = parsed
            .items
            .unwrap_or_default()
            .into_iter()
            .filter(|item| !item.link.is_empty())
            .map(|item| SearchHit {
                title: item.title.unwrap_or_default(),
                url: item.link,
                snippet: item.snippet.unwrap_or_default().replace('\n', " "),
            })
            .collect();

        Ok(hits)
    }
}

/// Process-wide spacing of search attempts.
///
/// A single "next allowed at" instant under a mutex; waiters compute their
/// slot, release the lock, and sleep cooperatively until it arrives.
#[derive(Debug, Default)]
pub struct SearchLimiter {
    next_allowed: Mutex<Option<Instant>>,
}

impl SearchLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next attempt slot, spacing attempts by `min_interval`.
    /// Returns without sleeping when the slot is already due. A deadline
    /// that would pass before the slot arrives fails fast instead of
    /// consuming it.
    pub async fn wait_turn(
        &self,
        min_interval: Duration,
        deadline: Option<Instant>,
    ) -> Result<(), SearchError> {
        let slot = {
            let mut next = self.next_allowed.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            if let Some(deadline) = deadline {
                if slot > deadline {
                    return Err(SearchError::DeadlineExceeded);
                }
            }
            *next = Some(slot + min_interval);
            slot
        };

        tokio::time::sleep_until(slot).await;
        Ok(())
    }
}
