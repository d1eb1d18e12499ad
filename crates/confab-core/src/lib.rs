//! confab-core: shared library for the Confab conversational gateway.
//!
//! Holds everything the gateway binary composes: domain types (`shared`),
//! environment configuration (`config`), bearer-token verification (`auth`),
//! the durable sled-backed stores (`store`), the vector memory adapters
//! (`vector`), and the generation/embedding model clients (`model`).
//!
//! All external collaborators sit behind traits (`TurnStore`,
//! `ConversationStore`, `UserStore`, `VectorIndex`, `GenerationClient`,
//! `EmbeddingClient`) so the orchestrator receives explicitly constructed,
//! injectable handles and tests can substitute fakes.

mod auth;
mod config;
mod model;
mod shared;
mod store;
mod vector;

pub use auth::{AuthError, Claims, TokenVerifier};
pub use config::{GatewayConfig, LlmMode};
pub use model::{
    ChatTurn, ChatRole, EmbedError, EmbeddingClient, GenerationClient, GenerationError,
    GenerationErrorKind, GenerationRequest, MockModelClient, OpenAiCompatClient,
};
pub use shared::{
    Conversation, MemoryRecord, Principal, RecordMetadata, Sender, Turn, EMBEDDING_DIM,
};
pub use store::{ConversationStore, SledStore, StoreError, TurnStore, UserStore};
pub use vector::{HttpVectorIndex, InMemoryVectorIndex, ScoredRecord, VectorError, VectorIndex};
