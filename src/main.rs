//! Sounder - grounded chat backend
//!
//! Serves the chat stream plus conversation, model, and preference
//! endpoints. Provider keys and budgets resolve CLI > env > config file.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use sounder::completions::OpenRouterClient;
use sounder::config::{FileConfig, Settings};
use sounder::reader::HttpPageReader;
use sounder::search::{GoogleSearch, SearchLimiter};
use sounder::server::{self, AppState};
use sounder::store::ChatStore;

#[derive(Parser)]
#[command(name = "sounder")]
#[command(about = "Grounded chat backend with streaming answers and deep research")]
struct Args {
    /// HTTP server port
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Database path (sqlite URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Model provider API key (OpenRouter-compatible)
    #[arg(long, env = "MODEL_API_KEY")]
    model_api_key: Option<String>,

    /// Model provider base URL
    #[arg(long, env = "MODEL_BASE_URL")]
    model_base_url: Option<String>,

    /// Google Custom Search API key
    #[arg(long, env = "SEARCH_API_KEY")]
    search_api_key: Option<String>,

    /// Google Custom Search engine id (cx)
    #[arg(long, env = "SEARCH_ENGINE_ID")]
    search_engine_id: Option<String>,

    /// Bearer token for the admin model-sync endpoint
    #[arg(long, env = "SOUNDER_SYNC_TOKEN")]
    sync_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (~/.sounder/.env, falling back to the current dir)
    let env_path = dirs::home_dir()
        .map(|h| h.join(".sounder").join(".env"))
        .filter(|p| p.exists());
    if let Some(path) = env_path {
        let _ = dotenvy::from_path(&path);
    } else {
        let _ = dotenvy::dotenv();
    }

    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let file_config = FileConfig::load();

    let mut settings = Settings::from_env();
    settings.model_api_key = args
        .model_api_key
        .or(file_config.model_api_key)
        .filter(|k| !k.is_empty());
    if let Some(base) = args.model_base_url.or(file_config.model_base_url) {
        settings.model_base_url = base;
    }
    settings.search_api_key = args.search_api_key.or(file_config.search_api_key);
    settings.search_engine_id = args.search_engine_id.or(file_config.search_engine_id);
    settings.sync_token = args.sync_token.or(file_config.sync_token);
    if let Some(model) = file_config.default_model {
        settings.default_model = model;
    }

    let database_url = args
        .database_url
        .or(file_config.database_url)
        .unwrap_or_else(|| "sqlite://data/sounder.db?mode=rwc".to_string());

    let pool = sounder::db::connect(&database_url).await?;
    tracing::info!("database ready at {database_url}");

    let search = GoogleSearch::new(
        settings.search_api_key.clone(),
        settings.search_engine_id.clone(),
    );
    let search_configured = search.is_configured();
    if !search_configured {
        tracing::warn!("search provider not configured; grounding will degrade to warnings");
    }

    let gateway = OpenRouterClient::new(
        settings.model_base_url.clone(),
        settings.model_api_key.clone(),
    );
    if settings.model_api_key.is_none() {
        tracing::warn!("model provider API key not configured; chat requests will fail");
    }

    let reader = HttpPageReader::new(settings.source_fetch_timeout, settings.source_max_bytes);

    let port = args.port;
    let state = AppState {
        store: ChatStore::new(pool),
        settings: Arc::new(settings),
        search: Arc::new(search),
        reader: Arc::new(reader),
        gateway: Arc::new(gateway),
        limiter: Arc::new(SearchLimiter::new()),
        search_configured,
    };

    server::run(port, state).await
}
