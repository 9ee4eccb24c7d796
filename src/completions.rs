//! Model gateway: streaming chat completions
//!
//! Speaks an OpenRouter-compatible chat completions API. The stream surface
//! is a typed event channel: one `Start`, interleaved text/reasoning deltas,
//! at most one `Usage` near the end, then `Done`. A dropped receiver aborts
//! the upstream read.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("model provider API key not configured")]
    MissingApiKey,

    #[error("model provider error: {0}")]
    Provider(String),

    #[error("model provider unreachable: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One message of the assembled prompt sequence
#[derive(Debug, Clone, Serialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    /// low | medium | high, only for reasoning-capable models
    pub reasoning_effort: Option<String>,
}

/// Token usage, optionally enriched with generation metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub reasoning_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Out-of-band generation lookup result
#[derive(Debug, Clone, Default)]
pub struct GenerationMetadata {
    pub provider: Option<String>,
    pub tokens_per_second: Option<f64>,
    pub total_cost: Option<f64>,
}

/// Events produced by a model stream
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    Start { generation_id: Option<String> },
    TextDelta(String),
    ReasoningDelta(String),
    Usage(TokenUsage),
    Done,
    Error(String),
}

#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Whether the gateway can reach its provider at all (key configured).
    /// Checked before the response stream opens so a missing key stays an
    /// HTTP-level failure.
    fn ready(&self) -> bool;

    /// Stream a completion as a typed event channel.
    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<CompletionEvent>, CompletionError>;

    /// Non-streaming completion; returns the full assistant text.
    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError>;

    /// Fetch post-hoc metadata for a finished generation.
    async fn generation_metadata(
        &self,
        generation_id: &str,
    ) -> Result<GenerationMetadata, CompletionError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct StreamChunk {
    id: Option<String>,
    choices: Option<Vec<StreamChoice>>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: u32,
}

impl WireUsage {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            reasoning_tokens: self
                .completion_tokens_details
                .map(|d| d.reasoning_tokens)
                .unwrap_or(0),
            total_tokens: self.total_tokens,
            provider: None,
            tokens_per_second: None,
            cost: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    data: Option<GenerationData>,
}

#[derive(Debug, Deserialize)]
struct GenerationData {
    provider_name: Option<String>,
    tokens_per_second: Option<f64>,
    total_cost: Option<f64>,
}

/// First ~500 chars of a provider body, for error messages
fn preview(body: &str) -> String {
    body.chars().take(500).collect()
}

// ============================================================================
// Client
// ============================================================================

/// OpenRouter-compatible chat completions client
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenRouterClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn api_key(&self) -> Result<&str, CompletionError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(CompletionError::MissingApiKey)
    }

    fn request_body(request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(effort) = &request.reasoning_effort {
            body["reasoning"] = json!({ "effort": effort });
        }
        body
    }
}

#[async_trait]
impl CompletionGateway for OpenRouterClient {
    fn ready(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<CompletionEvent>, CompletionError> {
        let api_key = self.api_key()?.to_string();
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request, true);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Provider(format!(
                "HTTP {status}: {}",
                preview(&body)
            )));
        }

        let (tx, rx) = mpsc::channel::<CompletionEvent>(100);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut started = false;

            while let Some(chunk_result) = stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(CompletionEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Process complete SSE lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line == "data: [DONE]" {
                        continue;
                    }

                    let Some(json_str) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(parsed) = serde_json::from_str::<StreamChunk>(json_str) else {
                        continue;
                    };

                    if !started {
                        started = true;
                        if tx
                            .send(CompletionEvent::Start {
                                generation_id: parsed.id.clone(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }

                    if let Some(choices) = parsed.choices {
                        for choice in choices {
                            let Some(delta) = choice.delta else { continue };
                            if let Some(reasoning) = delta.reasoning {
                                if !reasoning.is_empty()
                                    && tx
                                        .send(CompletionEvent::ReasoningDelta(reasoning))
                                        .await
                                        .is_err()
                                {
                                    return;
                                }
                            }
                            if let Some(content) = delta.content {
                                if !content.is_empty()
                                    && tx.send(CompletionEvent::TextDelta(content)).await.is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }

                    if let Some(usage) = parsed.usage {
                        if tx
                            .send(CompletionEvent::Usage(usage.into_usage()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }

            if !started {
                let _ = tx
                    .send(CompletionEvent::Start {
                        generation_id: None,
                    })
                    .await;
            }
            let _ = tx.send(CompletionEvent::Done).await;
        });

        Ok(rx)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, CompletionError> {
        let api_key = self.api_key()?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request, false);

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Provider(format!(
                "HTTP {status}: {}",
                preview(&body)
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let parsed: CompletionResponse = serde_json::from_str(&text).map_err(|e| {
            CompletionError::Provider(format!(
                "JSON parse error: {e}. Response preview: {}",
                preview(&text)
            ))
        })?;

        Ok(parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    async fn generation_metadata(
        &self,
        generation_id: &str,
    ) -> Result<GenerationMetadata, CompletionError> {
        let api_key = self.api_key()?;
        let url = format!(
            "{}/generation?id={}",
            self.base_url,
            urlencoding::encode(generation_id)
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CompletionError::Provider(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let parsed: GenerationResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let data = parsed.data.unwrap_or(GenerationData {
            provider_name: None,
            tokens_per_second: None,
            total_cost: None,
        });

        Ok(GenerationMetadata {
            provider: data.provider_name,
            tokens_per_second: data.tokens_per_second,
            total_cost: data.total_cost,
        })
    }
}
