//! Generation and embedding model clients.
//!
//! `OpenAiCompatClient` talks to OpenAI-compatible chat-completions and
//! embeddings endpoints (OpenRouter by default) and streams tokens over a
//! channel; `MockModelClient` is the deterministic offline counterpart used
//! when `CONFAB_LLM_MODE=mock` and by the test suites. Both sit behind the
//! `GenerationClient`/`EmbeddingClient` traits so the orchestrator never
//! knows which one it holds.

use crate::shared::EMBEDDING_DIM;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Caller-safe classification of a generation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    RateLimited,
    BadRequest,
    UpstreamUnavailable,
    Unknown,
}

impl GenerationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationErrorKind::RateLimited => "rate_limited",
            GenerationErrorKind::BadRequest => "bad_request",
            GenerationErrorKind::UpstreamUnavailable => "upstream_unavailable",
            GenerationErrorKind::Unknown => "unknown",
        }
    }

    fn from_status(status: reqwest::StatusCode) -> Self {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            GenerationErrorKind::RateLimited
        } else if status.is_client_error() {
            GenerationErrorKind::BadRequest
        } else if status.is_server_error() {
            GenerationErrorKind::UpstreamUnavailable
        } else {
            GenerationErrorKind::Unknown
        }
    }
}

/// A classified generation failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("generation failed ({}): {message}", kind.as_str())]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Embedding failure. Fatal at the two mandatory join points; degraded to
/// empty context at the optional retrieval point.
#[derive(Debug, Clone, thiserror::Error)]
#[error("embedding request failed: {0}")]
pub struct EmbedError(pub String);

/// Role in the generation request, in the model API's vocabulary. Stored
/// `model` turns map to `Assistant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One role/content pair of the short-term history.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Everything one generation call needs: the optional system-level
/// instruction (synthesized from long-term memory), the prior turns oldest
/// first, and the new prompt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub history: Vec<ChatTurn>,
    pub prompt: String,
}

impl GenerationRequest {
    fn into_messages(self) -> Vec<ChatTurn> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = self.system {
            messages.push(ChatTurn {
                role: ChatRole::System,
                content: system,
            });
        }
        messages.extend(self.history);
        messages.push(ChatTurn {
            role: ChatRole::User,
            content: self.prompt,
        });
        messages
    }
}

/// Produces a response as a lazy, finite, ordered sequence of text
/// fragments. The receiver yields fragments in arrival order; a mid-stream
/// failure arrives as one `Err` item and ends the sequence.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn stream_generate(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<Result<String, GenerationError>>, GenerationError>;
}

/// Converts text to a fixed-length vector.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbedError>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible wire shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatTurn>,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingsRequest {
    model: String,
    input: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Live client
// ---------------------------------------------------------------------------

/// Client for OpenAI-compatible chat-completions and embeddings endpoints.
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    embeddings_url: String,
    embeddings_model: String,
}

impl OpenAiCompatClient {
    pub fn new(
        api_url: &str,
        api_key: &str,
        model: &str,
        embeddings_url: &str,
        embeddings_model: &str,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            embeddings_url: embeddings_url.to_string(),
            embeddings_model: embeddings_model.to_string(),
        }
    }

    fn classify(e: &reqwest::Error) -> GenerationErrorKind {
        if e.is_timeout() || e.is_connect() {
            GenerationErrorKind::UpstreamUnavailable
        } else if let Some(status) = e.status() {
            GenerationErrorKind::from_status(status)
        } else {
            GenerationErrorKind::Unknown
        }
    }
}

#[async_trait]
impl GenerationClient for OpenAiCompatClient {
    async fn stream_generate(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<Result<String, GenerationError>>, GenerationError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: request.into_messages(),
            stream: true,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::new(Self::classify(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(
                target: "confab::model",
                status = %status,
                "chat completions request refused: {}",
                text
            );
            return Err(GenerationError::new(
                GenerationErrorKind::from_status(status),
                format!("model API error ({}): {}", status, text),
            ));
        }

        tracing::debug!(target: "confab::model", model = %self.model, "token stream established");

        let (tx, rx) = mpsc::channel::<Result<String, GenerationError>>(100);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(next) = stream.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GenerationError::new(
                                GenerationErrorKind::UpstreamUnavailable,
                                format!("stream interrupted: {}", e),
                            )))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete SSE lines.
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer = buffer[newline + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(chunk) => {
                            if let Some(content) = chunk
                                .choices
                                .first()
                                .and_then(|c| c.delta.content.as_ref())
                                .filter(|c| !c.is_empty())
                            {
                                if tx.send(Ok(content.clone())).await.is_err() {
                                    // Receiver dropped, stop reading.
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(
                                target: "confab::model",
                                "skipping unparseable stream chunk: {} - data: {}",
                                e,
                                data
                            );
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiCompatClient {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbedError> {
        let body = EmbeddingsRequest {
            model: self.embeddings_model.clone(),
            input: input.to_string(),
        };
        let response = self
            .client
            .post(&self.embeddings_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EmbedError(format!(
                "embeddings API error ({}): {}",
                status, text
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbedError(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedError("embeddings response missing data[0].embedding".into()))
    }
}

// ---------------------------------------------------------------------------
// Mock client
// ---------------------------------------------------------------------------

/// Deterministic offline model: word-by-word streaming and hash-based
/// embeddings. Keeps the entire pipeline runnable with no network.
#[derive(Default)]
pub struct MockModelClient;

impl MockModelClient {
    pub fn new() -> Self {
        Self
    }

    fn mock_reply(prompt: &str) -> String {
        format!(
            "You said: \"{}\". This is a mock response streamed word by word.",
            prompt.trim()
        )
    }

    fn mock_embedding(input: &str) -> Vec<f32> {
        // Cheap deterministic vector: seed an LCG from the input bytes.
        let mut seed: u64 = 0xcbf29ce484222325;
        for b in input.as_bytes() {
            seed ^= u64::from(*b);
            seed = seed.wrapping_mul(0x100000001b3);
        }
        let mut state = seed;
        (0..EMBEDDING_DIM)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl GenerationClient for MockModelClient {
    async fn stream_generate(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<Result<String, GenerationError>>, GenerationError> {
        let reply = Self::mock_reply(&request.prompt);
        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            for word in reply.split_inclusive(' ') {
                if tx.send(Ok(word.to_string())).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl EmbeddingClient for MockModelClient {
    async fn embed(&self, input: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(Self::mock_embedding(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_stream_concatenates_to_the_full_reply() {
        let client = MockModelClient::new();
        let mut rx = client
            .stream_generate(GenerationRequest {
                system: None,
                history: Vec::new(),
                prompt: "Hello".into(),
            })
            .await
            .unwrap();

        let mut assembled = String::new();
        while let Some(chunk) = rx.recv().await {
            assembled.push_str(&chunk.unwrap());
        }
        assert_eq!(assembled, MockModelClient::mock_reply("Hello"));
        assert!(!assembled.is_empty());
    }

    #[tokio::test]
    async fn mock_embedding_is_deterministic_and_fixed_dim() {
        let client = MockModelClient::new();
        let a = client.embed("same input").await.unwrap();
        let b = client.embed("same input").await.unwrap();
        let c = client.embed("different input").await.unwrap();
        assert_eq!(a.len(), EMBEDDING_DIM);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn request_assembles_system_history_prompt_in_order() {
        let request = GenerationRequest {
            system: Some("context".into()),
            history: vec![ChatTurn {
                role: ChatRole::Assistant,
                content: "earlier".into(),
            }],
            prompt: "now".into(),
        };
        let messages = request.into_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[1].role, ChatRole::Assistant);
        assert_eq!(messages[2].role, ChatRole::User);
        assert_eq!(messages[2].content, "now");
    }

    #[test]
    fn status_classification_is_caller_safe() {
        use reqwest::StatusCode;
        assert_eq!(
            GenerationErrorKind::from_status(StatusCode::TOO_MANY_REQUESTS),
            GenerationErrorKind::RateLimited
        );
        assert_eq!(
            GenerationErrorKind::from_status(StatusCode::BAD_REQUEST),
            GenerationErrorKind::BadRequest
        );
        assert_eq!(
            GenerationErrorKind::from_status(StatusCode::BAD_GATEWAY),
            GenerationErrorKind::UpstreamUnavailable
        );
    }
}
