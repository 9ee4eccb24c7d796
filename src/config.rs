//! Configuration for sounder
//!
//! Values resolve CLI args > env vars > ~/.sounder/config.toml > defaults.
//! Research budgets differ between plain chat grounding and deep research.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// File-backed configuration (~/.sounder/config.toml)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    /// Model provider API key (OpenRouter-compatible)
    pub model_api_key: Option<String>,

    /// Model provider base URL
    pub model_base_url: Option<String>,

    /// Google Custom Search API key
    pub search_api_key: Option<String>,

    /// Google Custom Search engine id (cx)
    pub search_engine_id: Option<String>,

    /// Database URL
    pub database_url: Option<String>,

    /// Fallback model id when a request names none
    pub default_model: Option<String>,

    /// Bearer token for the admin model-sync endpoint
    pub sync_token: Option<String>,
}

impl FileConfig {
    /// Load config from ~/.sounder/config.toml
    pub fn load() -> Self {
        let path = config_path();

        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Get a value with fallback to environment variable
    pub fn get_or_env(&self, field: Option<&String>, env_var: &str) -> Option<String> {
        field.cloned().or_else(|| std::env::var(env_var).ok())
    }
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".sounder")
        .join("config.toml")
}

/// Budgets for one research mode
#[derive(Debug, Clone)]
pub struct ResearchBudgets {
    pub max_loops: u32,
    pub max_search_queries: u32,
    pub max_sources_read: u32,
    pub max_citations: usize,
    pub search_results_per_query: u32,
    pub min_search_interval: Duration,
}

/// Resolved runtime configuration shared across requests
#[derive(Debug, Clone)]
pub struct Settings {
    pub model_api_key: Option<String>,
    pub model_base_url: String,
    pub search_api_key: Option<String>,
    pub search_engine_id: Option<String>,
    pub default_model: String,
    pub sync_token: Option<String>,

    pub chat: ResearchBudgets,
    pub deep_research: ResearchBudgets,

    /// Fallback reasoning effort per mode, applied when neither the request
    /// nor a stored preset names one
    pub default_effort_chat: Option<String>,
    pub default_effort_deep: Option<String>,

    /// Overall wall-clock ceiling for a deep research run
    pub deep_research_timeout: Duration,
    /// Per-page fetch ceiling
    pub source_fetch_timeout: Duration,
    /// Per-page body cap
    pub source_max_bytes: usize,
    /// User+assistant messages carried into the prompt
    pub history_window: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_api_key: None,
            model_base_url: "https://openrouter.ai/api/v1".to_string(),
            search_api_key: None,
            search_engine_id: None,
            default_model: "openrouter/auto".to_string(),
            sync_token: None,
            chat: ResearchBudgets {
                max_loops: 1,
                max_search_queries: 2,
                max_sources_read: 0,
                max_citations: 10,
                search_results_per_query: 5,
                min_search_interval: Duration::from_millis(500),
            },
            deep_research: ResearchBudgets {
                max_loops: 3,
                max_search_queries: 8,
                max_sources_read: 6,
                max_citations: 10,
                search_results_per_query: 6,
                min_search_interval: Duration::from_millis(1200),
            },
            default_effort_chat: None,
            default_effort_deep: None,
            deep_research_timeout: Duration::from_secs(150),
            source_fetch_timeout: Duration::from_secs(12),
            source_max_bytes: 1_000_000,
            history_window: 12,
        }
    }
}

impl Settings {
    /// Apply recognized environment overrides on top of defaults
    pub fn from_env() -> Self {
        let mut s = Self::default();

        if let Some(secs) = env_u64("SOUNDER_DEEP_RESEARCH_TIMEOUT_SECS") {
            s.deep_research_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SOUNDER_SOURCE_FETCH_TIMEOUT_SECS") {
            s.source_fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_u64("SOUNDER_SOURCE_MAX_BYTES") {
            s.source_max_bytes = bytes as usize;
        }
        if let Some(n) = env_u64("SOUNDER_HISTORY_WINDOW") {
            s.history_window = n as usize;
        }
        if let Ok(model) = std::env::var("SOUNDER_DEFAULT_MODEL") {
            if !model.is_empty() {
                s.default_model = model;
            }
        }
        s.default_effort_chat = env_effort("SOUNDER_CHAT_DEFAULT_EFFORT");
        s.default_effort_deep = env_effort("SOUNDER_DEEP_DEFAULT_EFFORT");

        apply_budget_env(&mut s.chat, "CHAT");
        apply_budget_env(&mut s.deep_research, "DEEP");

        s
    }

    /// Mode-level effort fallback
    pub fn default_effort(&self, deep_research: bool) -> Option<&str> {
        if deep_research {
            self.default_effort_deep.as_deref()
        } else {
            self.default_effort_chat.as_deref()
        }
    }

    /// Budgets for the given mode
    pub fn budgets(&self, deep_research: bool) -> &ResearchBudgets {
        if deep_research {
            &self.deep_research
        } else {
            &self.chat
        }
    }
}

fn apply_budget_env(budgets: &mut ResearchBudgets, prefix: &str) {
    if let Some(n) = env_u64(&format!("SOUNDER_{prefix}_MAX_LOOPS")) {
        budgets.max_loops = n as u32;
    }
    if let Some(n) = env_u64(&format!("SOUNDER_{prefix}_MAX_SEARCH_QUERIES")) {
        budgets.max_search_queries = n as u32;
    }
    if let Some(n) = env_u64(&format!("SOUNDER_{prefix}_MAX_SOURCES_READ")) {
        budgets.max_sources_read = n as u32;
    }
    if let Some(n) = env_u64(&format!("SOUNDER_{prefix}_MAX_CITATIONS")) {
        budgets.max_citations = n as usize;
    }
    if let Some(n) = env_u64(&format!("SOUNDER_{prefix}_RESULTS_PER_QUERY")) {
        budgets.search_results_per_query = n as u32;
    }
    if let Some(ms) = env_u64(&format!("SOUNDER_{prefix}_MIN_SEARCH_INTERVAL_MS")) {
        budgets.min_search_interval = Duration::from_millis(ms);
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_effort(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|v| matches!(v.as_str(), "low" | "medium" | "high"))
}
