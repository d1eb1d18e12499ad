//! Confab gateway: real-time conversational gateway binary.
//!
//! Wires the sled stores, the vector index, and the model clients into the
//! orchestrator, then serves the WebSocket gateway and the thin CRUD surface
//! over axum. All clients are constructed once here and injected; nothing in
//! the pipeline reaches for process-wide singletons.

mod events;
mod handlers;
mod orchestrator;
mod session;
mod ws;

use axum::routing::{get, post};
use axum::Router;
use confab_core::{
    EmbeddingClient, GatewayConfig, GenerationClient, HttpVectorIndex, InMemoryVectorIndex,
    LlmMode, MockModelClient, OpenAiCompatClient, SledStore, TokenVerifier, VectorIndex,
};
use orchestrator::Orchestrator;
use session::SessionRegistry;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

/// Qdrant collection holding the memory records.
const MEMORY_COLLECTION: &str = "confab_memory_v1";

/// Shared handles for every request and connection.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SledStore>,
    pub verifier: Arc<TokenVerifier>,
    pub sessions: Arc<SessionRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

async fn health() -> &'static str {
    "Server is running"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = GatewayConfig::from_env().map_err(|e| {
        tracing::error!(target: "confab::gateway", "configuration error: {}", e);
        e
    })?;

    let store = Arc::new(SledStore::open(&config.data_dir)?);

    let index: Arc<dyn VectorIndex> = match &config.vector_db_url {
        Some(url) => Arc::new(HttpVectorIndex::connect(url, MEMORY_COLLECTION).await?),
        None => Arc::new(InMemoryVectorIndex::new()),
    };

    let (embedder, generator): (Arc<dyn EmbeddingClient>, Arc<dyn GenerationClient>) =
        match config.llm_mode {
            LlmMode::Live => {
                let api_key = config
                    .llm_api_key
                    .as_deref()
                    .ok_or("CONFAB_LLM_API_KEY must be set in live mode")?;
                let client = Arc::new(OpenAiCompatClient::new(
                    &config.llm_api_url,
                    api_key,
                    &config.llm_model,
                    &config.embeddings_api_url,
                    &config.embeddings_model,
                ));
                (client.clone(), client)
            }
            LlmMode::Mock => {
                tracing::info!(target: "confab::gateway", "mock model mode; no network calls");
                let client = Arc::new(MockModelClient::new());
                (client.clone(), client)
            }
        };

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        index,
        embedder,
        generator,
        config.retrieval_limit,
        config.session_budget,
    ));

    let state = AppState {
        store,
        verifier: Arc::new(TokenVerifier::new(&config.jwt_secret)),
        sessions: Arc::new(SessionRegistry::new()),
        orchestrator,
    };

    let app = Router::new()
        .route("/api", get(health))
        .route("/api/users/profile", get(handlers::users::profile))
        .route(
            "/api/conversations",
            post(handlers::conversations::create).get(handlers::conversations::list),
        )
        .route("/api/conversations/:id", get(handlers::conversations::get_one))
        .route(
            "/api/conversations/:id/messages",
            get(handlers::conversations::messages),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!(target: "confab::gateway", "listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
