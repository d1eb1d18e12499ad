//! Gateway configuration loaded from the environment.
//!
//! Everything is env-driven so deployments change behavior without code
//! edits. `main` calls `dotenvy::dotenv()` first, then `GatewayConfig::from_env()`.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | CONFAB_BIND_ADDR | 127.0.0.1:3000 | Listen address for HTTP + WebSocket. |
//! | CONFAB_JWT_SECRET | (required) | HS256 secret for bearer-token verification. |
//! | CONFAB_DATA_DIR | ./data/confab | Sled database directory. |
//! | CONFAB_LLM_MODE | mock | `live` \| `mock` — mock runs the whole pipeline offline. |
//! | CONFAB_LLM_API_URL | OpenRouter chat completions | OpenAI-compatible chat endpoint. |
//! | CONFAB_LLM_API_KEY | (required in live mode) | Bearer key for the model endpoint. |
//! | CONFAB_LLM_MODEL | meta-llama/llama-3.3-70b-instruct | Chat model id. |
//! | CONFAB_EMBEDDINGS_API_URL | OpenRouter embeddings | OpenAI-compatible embeddings endpoint. |
//! | CONFAB_EMBEDDINGS_MODEL | text-embedding-3-small | Embeddings model id. |
//! | CONFAB_VECTOR_DB_URL | (unset) | Qdrant REST base URL; unset falls back to the in-memory index. |
//! | CONFAB_RETRIEVAL_LIMIT | 5 | Top-K long-term memory records per query. |
//! | CONFAB_SESSION_BUDGET_SECS | 120 | Wall-clock budget for one message pipeline. |

use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DATA_DIR: &str = "./data/confab";
const DEFAULT_LLM_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_LLM_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";
const DEFAULT_EMBEDDINGS_API_URL: &str = "https://openrouter.ai/api/v1/embeddings";
const DEFAULT_EMBEDDINGS_MODEL: &str = "text-embedding-3-small";
const DEFAULT_RETRIEVAL_LIMIT: usize = 5;
const DEFAULT_SESSION_BUDGET_SECS: u64 = 120;

/// Whether model calls go out over the network or stay deterministic/local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmMode {
    /// Deterministic local generation and embeddings; no network.
    #[default]
    Mock,
    /// Calls the configured OpenAI-compatible endpoints.
    Live,
}

impl LlmMode {
    fn parse(s: &str) -> Self {
        match s.trim().eq_ignore_ascii_case("live") {
            true => LlmMode::Live,
            false => LlmMode::Mock,
        }
    }
}

/// Process-wide configuration, created once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub data_dir: String,
    pub llm_mode: LlmMode,
    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub embeddings_api_url: String,
    pub embeddings_model: String,
    pub vector_db_url: Option<String>,
    pub retrieval_limit: usize,
    pub session_budget: Duration,
}

impl GatewayConfig {
    /// Reads configuration from the environment. Fails only when
    /// `CONFAB_JWT_SECRET` is missing, since the gateway cannot admit any
    /// connection without it.
    pub fn from_env() -> Result<Self, String> {
        let jwt_secret = std::env::var("CONFAB_JWT_SECRET")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "CONFAB_JWT_SECRET must be set".to_string())?;

        let retrieval_limit = std::env::var("CONFAB_RETRIEVAL_LIMIT")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_RETRIEVAL_LIMIT);

        let budget_secs = std::env::var("CONFAB_SESSION_BUDGET_SECS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_SESSION_BUDGET_SECS);

        Ok(Self {
            bind_addr: env_or("CONFAB_BIND_ADDR", DEFAULT_BIND_ADDR),
            jwt_secret,
            data_dir: env_or("CONFAB_DATA_DIR", DEFAULT_DATA_DIR),
            llm_mode: LlmMode::parse(&env_or("CONFAB_LLM_MODE", "mock")),
            llm_api_url: env_or("CONFAB_LLM_API_URL", DEFAULT_LLM_API_URL),
            llm_api_key: std::env::var("CONFAB_LLM_API_KEY")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            llm_model: env_or("CONFAB_LLM_MODEL", DEFAULT_LLM_MODEL),
            embeddings_api_url: env_or("CONFAB_EMBEDDINGS_API_URL", DEFAULT_EMBEDDINGS_API_URL),
            embeddings_model: env_or("CONFAB_EMBEDDINGS_MODEL", DEFAULT_EMBEDDINGS_MODEL),
            vector_db_url: std::env::var("CONFAB_VECTOR_DB_URL")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            retrieval_limit,
            session_budget: Duration::from_secs(budget_secs),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}
