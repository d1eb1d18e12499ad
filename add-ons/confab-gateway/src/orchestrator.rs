//! Conversation orchestrator: the per-message pipeline.
//!
//! One inbound message drives one StreamSession through a strict sequence:
//! validate → authorize → (persist user turn ∥ embed prompt) → index →
//! (fetch history ∥ query long-term memory) → stream generation →
//! (persist model turn ∥ embed + index it). Two policies are deliberate:
//! a message that cannot be durably recorded is never answered, and
//! long-term memory is best-effort (degrades to empty context) while
//! short-term history is required (its loss would silently change model
//! behavior).
//!
//! All collaborators arrive as injected `Arc<dyn Trait>` handles, created
//! once at process start and shared read-only.

use crate::events::{ErrorCode, EventSink, ServerEvent};
use chrono::Utc;
use confab_core::{
    ChatRole, ChatTurn, ConversationStore, EmbeddingClient, GenerationClient, GenerationError,
    GenerationErrorKind, GenerationRequest, MemoryRecord, Principal, ScoredRecord, Sender, Turn,
    TurnStore, VectorIndex,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of one StreamSession. Terminal states are `Done` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Idle,
    AwaitingSave,
    Retrieving,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Idle => "idle",
            StreamStatus::AwaitingSave => "awaiting-save",
            StreamStatus::Retrieving => "retrieving",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Finalizing => "finalizing",
            StreamStatus::Done => "done",
            StreamStatus::Failed => "failed",
        }
    }
}

/// Ephemeral per-request state: owned exclusively by the orchestrator from
/// acceptance until a terminal state.
struct StreamSession {
    conversation_id: String,
    accumulated: String,
    status: StreamStatus,
    stream_started: bool,
    stream_ended: bool,
}

impl StreamSession {
    fn new() -> Self {
        Self {
            conversation_id: String::new(),
            accumulated: String::new(),
            status: StreamStatus::Idle,
            stream_started: false,
            stream_ended: false,
        }
    }

    fn advance(&mut self, next: StreamStatus) {
        tracing::debug!(
            target: "confab::pipeline",
            conversation = %self.conversation_id,
            "session {} -> {}",
            self.status.as_str(),
            next.as_str()
        );
        self.status = next;
    }
}

/// Session-aborting failures, mapped to caller-safe `error` events. Every
/// variant leaves the connection usable for the next message.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("access denied")]
    AccessDenied,

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("embedding failure: {0}")]
    Embedding(String),

    #[error("memory indexing failure: {0}")]
    Index(String),

    #[error(transparent)]
    Generation(GenerationError),

    #[error("finalization failure: {0}")]
    Finalization(String),
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::Validation(_) => ErrorCode::Validation,
            PipelineError::AccessDenied => ErrorCode::AccessDenied,
            PipelineError::Persistence(_) => ErrorCode::Persistence,
            PipelineError::Embedding(_) => ErrorCode::Embedding,
            PipelineError::Index(_) => ErrorCode::Index,
            PipelineError::Generation(e) => match e.kind {
                GenerationErrorKind::RateLimited => ErrorCode::RateLimited,
                GenerationErrorKind::BadRequest => ErrorCode::BadRequest,
                GenerationErrorKind::UpstreamUnavailable => ErrorCode::UpstreamUnavailable,
                GenerationErrorKind::Unknown => ErrorCode::Unknown,
            },
            PipelineError::Finalization(_) => ErrorCode::Finalization,
        }
    }

    /// The human-readable string sent to the caller. Validation messages are
    /// reported verbatim; everything else stays generic (details go to the
    /// logs only).
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Validation(msg) => msg.clone(),
            PipelineError::AccessDenied => "access denied".into(),
            PipelineError::Persistence(_) => "failed to record the message".into(),
            PipelineError::Embedding(_) => "failed to process the message".into(),
            PipelineError::Index(_) => "failed to index the message".into(),
            PipelineError::Generation(e) => format!("generation failed ({})", e.kind.as_str()),
            PipelineError::Finalization(_) => {
                "response was delivered but could not be recorded".into()
            }
        }
    }
}

/// Composes the stores, the vector index, and the model clients into the
/// per-message pipeline.
pub struct Orchestrator {
    conversations: Arc<dyn ConversationStore>,
    turns: Arc<dyn TurnStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingClient>,
    generator: Arc<dyn GenerationClient>,
    retrieval_limit: usize,
    session_budget: Duration,
}

impl Orchestrator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        turns: Arc<dyn TurnStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingClient>,
        generator: Arc<dyn GenerationClient>,
        retrieval_limit: usize,
        session_budget: Duration,
    ) -> Self {
        Self {
            conversations,
            turns,
            index,
            embedder,
            generator,
            retrieval_limit,
            session_budget,
        }
    }

    /// Runs one message through the pipeline, emitting protocol events on
    /// `sink`, and returns the terminal session status. Event order on
    /// success: `message_saved`, `stream_start`, `stream_chunk`*,
    /// `stream_end`, `response`. On failure after `stream_start`, a
    /// `stream_end` still precedes the `error` event.
    pub async fn handle_message(
        &self,
        principal: &Principal,
        conversation_id: Option<String>,
        prompt: Option<String>,
        sink: &EventSink,
    ) -> StreamStatus {
        let mut session = StreamSession::new();
        match self
            .run(principal, conversation_id, prompt, &mut session, sink)
            .await
        {
            Ok(()) => session.advance(StreamStatus::Done),
            Err(err) => {
                if session.stream_started && !session.stream_ended {
                    sink.emit(ServerEvent::StreamEnd {
                        conversation_id: session.conversation_id.clone(),
                    });
                    session.stream_ended = true;
                }
                tracing::warn!(
                    target: "confab::pipeline",
                    user = %principal.id,
                    conversation = %session.conversation_id,
                    "session failed: {}",
                    err
                );
                sink.emit(ServerEvent::Error {
                    code: err.code(),
                    message: err.public_message(),
                });
                session.advance(StreamStatus::Failed);
            }
        }
        session.status
    }

    async fn run(
        &self,
        principal: &Principal,
        conversation_id: Option<String>,
        prompt: Option<String>,
        session: &mut StreamSession,
        sink: &EventSink,
    ) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.session_budget;

        // Step 1: validate, then authorize. Validation happens before any
        // store call; the emitted authorization error never reveals whether
        // the conversation exists.
        let conversation_id = conversation_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::Validation("conversationId is required".into()))?;
        let prompt = prompt
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| PipelineError::Validation("prompt must not be empty".into()))?;

        session.conversation_id = conversation_id.clone();
        session.advance(StreamStatus::AwaitingSave);

        let conversation = self
            .conversations
            .get_conversation(&conversation_id)
            .await
            .map_err(|e| PipelineError::Persistence(e.to_string()))?;
        match conversation {
            None => {
                tracing::debug!(target: "confab::pipeline", conversation = %conversation_id, "denied: not found");
                return Err(PipelineError::AccessDenied);
            }
            Some(c) if c.user_id != principal.id => {
                tracing::debug!(target: "confab::pipeline", conversation = %conversation_id, "denied: not owned");
                return Err(PipelineError::AccessDenied);
            }
            Some(_) => {}
        }

        // Step 2: fork-join — persist the user turn and embed the prompt.
        // Both must succeed before anything is acknowledged or generated.
        let user_turn = Turn::new(&conversation_id, Sender::User, &prompt);
        let persist = async {
            self.turns
                .append_turn(&user_turn)
                .await
                .map_err(|e| PipelineError::Persistence(e.to_string()))
        };
        let embed = async {
            self.embedder
                .embed(&prompt)
                .await
                .map_err(|e| PipelineError::Embedding(e.0))
        };
        let ((), prompt_vector) = tokio::try_join!(persist, embed)?;

        self.index
            .upsert(MemoryRecord::for_turn(&user_turn, &principal.id, prompt_vector.clone()))
            .await
            .map_err(|e| PipelineError::Index(e.to_string()))?;

        sink.emit(ServerEvent::MessageSaved {
            message: user_turn.clone(),
        });
        session.advance(StreamStatus::Retrieving);

        // Step 3: fork-join — short-term history (required) and long-term
        // memory (best-effort; degraded retrieval must not abort the session).
        let history_fut = async {
            self.turns
                .history(&conversation_id)
                .await
                .map_err(|e| PipelineError::Persistence(e.to_string()))
        };
        let memory_fut = async {
            match self
                .index
                .query(&prompt_vector, &principal.id, self.retrieval_limit)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(
                        target: "confab::pipeline",
                        conversation = %conversation_id,
                        "long-term memory unavailable, proceeding without it: {}",
                        e
                    );
                    Vec::new()
                }
            }
        };
        let (history, memories) = tokio::join!(history_fut, memory_fut);
        let history = history?;

        sink.emit(ServerEvent::StreamStart {
            conversation_id: conversation_id.clone(),
        });
        session.stream_started = true;
        session.advance(StreamStatus::Streaming);

        // Step 4: stream generation, preserving fragment arrival order. The
        // prompt travels separately, so the just-persisted turn is excluded
        // from the mapped history.
        let request = GenerationRequest {
            system: synthesize_memory_context(&memories),
            history: history
                .iter()
                .filter(|t| t.id != user_turn.id)
                .map(|t| ChatTurn {
                    role: match t.sender {
                        Sender::User => ChatRole::User,
                        Sender::Model => ChatRole::Assistant,
                    },
                    content: t.content.clone(),
                })
                .collect(),
            prompt: prompt.clone(),
        };

        let mut fragments = tokio::time::timeout_at(deadline, self.generator.stream_generate(request))
            .await
            .map_err(|_| budget_exceeded())?
            .map_err(PipelineError::Generation)?;

        loop {
            let next = tokio::time::timeout_at(deadline, fragments.recv())
                .await
                .map_err(|_| budget_exceeded())?;
            match next {
                Some(Ok(chunk)) => {
                    session.accumulated.push_str(&chunk);
                    sink.emit(ServerEvent::StreamChunk {
                        chunk,
                        conversation_id: conversation_id.clone(),
                        timestamp: Utc::now(),
                    });
                }
                Some(Err(e)) => return Err(PipelineError::Generation(e)),
                None => break,
            }
        }

        session.advance(StreamStatus::Finalizing);
        sink.emit(ServerEvent::StreamEnd {
            conversation_id: conversation_id.clone(),
        });
        session.stream_ended = true;

        // Step 5: fork-join — persist the model turn and index its memory
        // record. The streamed text is already with the caller; a failure
        // here is a recorded inconsistency surfaced as a finalization error.
        let model_turn = Turn::new(&conversation_id, Sender::Model, &session.accumulated);
        let persist = async {
            self.turns
                .append_turn(&model_turn)
                .await
                .map_err(|e| PipelineError::Finalization(e.to_string()))
        };
        let index_memory = async {
            let vector = self
                .embedder
                .embed(&model_turn.content)
                .await
                .map_err(|e| PipelineError::Finalization(e.0))?;
            self.index
                .upsert(MemoryRecord::for_turn(&model_turn, &principal.id, vector))
                .await
                .map_err(|e| PipelineError::Finalization(e.to_string()))
        };
        tokio::try_join!(persist, index_memory)?;

        sink.emit(ServerEvent::Response {
            text: session.accumulated.clone(),
            message: model_turn,
            conversation_id: conversation_id.clone(),
        });
        Ok(())
    }
}

fn budget_exceeded() -> PipelineError {
    PipelineError::Generation(GenerationError::new(
        GenerationErrorKind::UpstreamUnavailable,
        "session wall-clock budget exceeded",
    ))
}

/// Concatenates retrieved long-term records into one system-level
/// instruction. `None` when nothing was retrieved.
fn synthesize_memory_context(memories: &[ScoredRecord]) -> Option<String> {
    if memories.is_empty() {
        return None;
    }
    let mut context =
        String::from("Relevant context from the user's prior conversations:\n");
    for hit in memories {
        context.push_str("- ");
        context.push_str(&hit.record.metadata.text);
        context.push('\n');
    }
    Some(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use confab_core::{
        Conversation, EmbedError, InMemoryVectorIndex, MockModelClient, RecordMetadata,
        SledStore, StoreError, VectorError,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    struct TestEnv {
        _dir: tempfile::TempDir,
        store: Arc<SledStore>,
        index: Arc<InMemoryVectorIndex>,
        principal: Principal,
    }

    const CONVO: &str = "c-1";

    async fn env() -> TestEnv {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let principal = Principal {
            id: "u-1".into(),
            name: "Ada".into(),
        };
        let now = Utc::now();
        store
            .create_conversation(&Conversation {
                id: CONVO.into(),
                user_id: principal.id.clone(),
                title: "Test".into(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        TestEnv {
            _dir: dir,
            store,
            index: Arc::new(InMemoryVectorIndex::default()),
            principal,
        }
    }

    fn orchestrator(
        env: &TestEnv,
        turns: Arc<dyn TurnStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingClient>,
        generator: Arc<dyn GenerationClient>,
    ) -> Orchestrator {
        Orchestrator::new(
            env.store.clone(),
            turns,
            index,
            embedder,
            generator,
            5,
            Duration::from_secs(30),
        )
    }

    fn default_orchestrator(env: &TestEnv) -> Orchestrator {
        let model = Arc::new(MockModelClient::new());
        orchestrator(
            env,
            env.store.clone(),
            env.index.clone(),
            model.clone(),
            model,
        )
    }

    async fn run(
        orch: &Orchestrator,
        principal: &Principal,
        conversation_id: Option<&str>,
        prompt: Option<&str>,
    ) -> (StreamStatus, Vec<ServerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        let status = orch
            .handle_message(
                principal,
                conversation_id.map(String::from),
                prompt.map(String::from),
                &sink,
            )
            .await;
        drop(sink);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (status, events)
    }

    fn kind(event: &ServerEvent) -> &'static str {
        match event {
            ServerEvent::MessageSaved { .. } => "message_saved",
            ServerEvent::StreamStart { .. } => "stream_start",
            ServerEvent::StreamChunk { .. } => "stream_chunk",
            ServerEvent::StreamEnd { .. } => "stream_end",
            ServerEvent::Response { .. } => "response",
            ServerEvent::Error { .. } => "error",
        }
    }

    fn error_code(event: &ServerEvent) -> Option<ErrorCode> {
        match event {
            ServerEvent::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingClient for FailingEmbedder {
        async fn embed(&self, _input: &str) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError("embedding service unavailable".into()))
        }
    }

    struct TrackingGenerator {
        called: AtomicBool,
        inner: MockModelClient,
    }

    impl TrackingGenerator {
        fn new() -> Self {
            Self {
                called: AtomicBool::new(false),
                inner: MockModelClient::new(),
            }
        }
    }

    #[async_trait]
    impl GenerationClient for TrackingGenerator {
        async fn stream_generate(
            &self,
            request: GenerationRequest,
        ) -> Result<mpsc::Receiver<Result<String, GenerationError>>, GenerationError> {
            self.called.store(true, Ordering::SeqCst);
            self.inner.stream_generate(request).await
        }
    }

    struct CapturingGenerator {
        seen: Mutex<Option<GenerationRequest>>,
        inner: MockModelClient,
    }

    impl CapturingGenerator {
        fn new() -> Self {
            Self {
                seen: Mutex::new(None),
                inner: MockModelClient::new(),
            }
        }
    }

    #[async_trait]
    impl GenerationClient for CapturingGenerator {
        async fn stream_generate(
            &self,
            request: GenerationRequest,
        ) -> Result<mpsc::Receiver<Result<String, GenerationError>>, GenerationError> {
            *self.seen.lock().unwrap() = Some(request.clone());
            self.inner.stream_generate(request).await
        }
    }

    /// Yields one fragment and then fails with a rate-limit classification.
    struct RateLimitedGenerator;

    #[async_trait]
    impl GenerationClient for RateLimitedGenerator {
        async fn stream_generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<mpsc::Receiver<Result<String, GenerationError>>, GenerationError> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(Ok("partial ".to_string())).await;
                let _ = tx
                    .send(Err(GenerationError::new(
                        GenerationErrorKind::RateLimited,
                        "model API error (429)",
                    )))
                    .await;
            });
            Ok(rx)
        }
    }

    /// Stalls longer than any test budget before producing anything.
    struct StalledGenerator;

    #[async_trait]
    impl GenerationClient for StalledGenerator {
        async fn stream_generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<mpsc::Receiver<Result<String, GenerationError>>, GenerationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    /// Upserts fail; queries never happen before the step-2 upsert aborts.
    struct FailingUpsertIndex;

    #[async_trait]
    impl VectorIndex for FailingUpsertIndex {
        async fn upsert(&self, _record: MemoryRecord) -> Result<(), VectorError> {
            Err(VectorError::Index("index write refused".into()))
        }

        async fn query(
            &self,
            _vector: &[f32],
            _user_id: &str,
            _limit: usize,
        ) -> Result<Vec<ScoredRecord>, VectorError> {
            Ok(Vec::new())
        }
    }

    /// Upserts succeed but queries fail — the degraded-retrieval case.
    struct FailingQueryIndex {
        inner: Arc<InMemoryVectorIndex>,
    }

    #[async_trait]
    impl VectorIndex for FailingQueryIndex {
        async fn upsert(&self, record: MemoryRecord) -> Result<(), VectorError> {
            self.inner.upsert(record).await
        }

        async fn query(
            &self,
            _vector: &[f32],
            _user_id: &str,
            _limit: usize,
        ) -> Result<Vec<ScoredRecord>, VectorError> {
            Err(VectorError::Query("vector search down".into()))
        }
    }

    /// History reads fail while appends keep working.
    struct BrokenHistoryStore {
        inner: Arc<SledStore>,
    }

    #[async_trait]
    impl TurnStore for BrokenHistoryStore {
        async fn append_turn(&self, turn: &Turn) -> Result<(), StoreError> {
            self.inner.append_turn(turn).await
        }

        async fn history(&self, _conversation_id: &str) -> Result<Vec<Turn>, StoreError> {
            Err(StoreError::Backend("history unavailable".into()))
        }
    }

    /// Refuses to persist model turns (finalization failure).
    struct ModelAppendFails {
        inner: Arc<SledStore>,
    }

    #[async_trait]
    impl TurnStore for ModelAppendFails {
        async fn append_turn(&self, turn: &Turn) -> Result<(), StoreError> {
            if turn.sender == Sender::Model {
                return Err(StoreError::Backend("write refused".into()));
            }
            self.inner.append_turn(turn).await
        }

        async fn history(&self, conversation_id: &str) -> Result<Vec<Turn>, StoreError> {
            self.inner.history(conversation_id).await
        }
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn successful_session_emits_the_exact_event_order() {
        let env = env().await;
        let orch = default_orchestrator(&env);

        let (status, events) = run(&orch, &env.principal, Some(CONVO), Some("Hello")).await;
        assert_eq!(status, StreamStatus::Done);

        let kinds: Vec<_> = events.iter().map(kind).collect();
        assert_eq!(kinds.first(), Some(&"message_saved"));
        assert_eq!(kinds.get(1), Some(&"stream_start"));
        assert!(kinds[2..kinds.len() - 2]
            .iter()
            .all(|k| *k == "stream_chunk"));
        assert!(kinds.len() > 4, "expected at least one chunk");
        assert_eq!(kinds[kinds.len() - 2], "stream_end");
        assert_eq!(kinds[kinds.len() - 1], "response");

        // message_saved carries the persisted user turn.
        let ServerEvent::MessageSaved { message } = &events[0] else {
            panic!("first event must be message_saved");
        };
        assert_eq!(message.sender, Sender::User);
        assert_eq!(message.content, "Hello");

        // Chunks concatenate exactly to the final response text.
        let assembled: String = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::StreamChunk { chunk, .. } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        let ServerEvent::Response { text, message, .. } = events.last().unwrap() else {
            panic!("last event must be response");
        };
        assert!(!text.is_empty());
        assert_eq!(text, &assembled);
        assert_eq!(message.sender, Sender::Model);

        // Both turns are durably recorded, oldest first.
        let history = env.store.history(CONVO).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sender, Sender::User);
        assert_eq!(history[1].sender, Sender::Model);

        // Both memory records landed in the index, keyed by turn id.
        let vector = MockModelClient::new().embed("Hello").await.unwrap();
        let hits = env.index.query(&vector, &env.principal.id, 5).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn foreign_conversation_is_denied_without_a_trace() {
        let env = env().await;
        let now = Utc::now();
        env.store
            .create_conversation(&Conversation {
                id: "c-other".into(),
                user_id: "u-2".into(),
                title: "Theirs".into(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let orch = default_orchestrator(&env);

        let (status, events) = run(&orch, &env.principal, Some("c-other"), Some("hi")).await;
        assert_eq!(status, StreamStatus::Failed);
        assert_eq!(events.len(), 1);
        assert_eq!(error_code(&events[0]), Some(ErrorCode::AccessDenied));

        // No turn was written to the foreign conversation.
        assert!(env.store.history("c-other").await.unwrap().is_empty());

        // An absent conversation produces the same non-distinguishing error.
        let (_, events) = run(&orch, &env.principal, Some("c-missing"), Some("hi")).await;
        assert_eq!(error_code(&events[0]), Some(ErrorCode::AccessDenied));
    }

    #[tokio::test]
    async fn rate_limit_after_stream_start_still_closes_the_stream() {
        let env = env().await;
        let model = Arc::new(MockModelClient::new());
        let orch = orchestrator(
            &env,
            env.store.clone(),
            env.index.clone(),
            model,
            Arc::new(RateLimitedGenerator),
        );

        let (status, events) = run(&orch, &env.principal, Some(CONVO), Some("hi")).await;
        assert_eq!(status, StreamStatus::Failed);

        let kinds: Vec<_> = events.iter().map(kind).collect();
        assert_eq!(
            kinds,
            vec![
                "message_saved",
                "stream_start",
                "stream_chunk",
                "stream_end",
                "error"
            ]
        );
        assert_eq!(error_code(events.last().unwrap()), Some(ErrorCode::RateLimited));

        // The user turn from step 2 stays persisted.
        let history = env.store.history(CONVO).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, Sender::User);
    }

    #[tokio::test]
    async fn empty_prompt_fails_validation_before_any_store_call() {
        let env = env().await;
        let orch = default_orchestrator(&env);

        for prompt in [Some("   "), Some(""), None] {
            let (status, events) = run(&orch, &env.principal, Some(CONVO), prompt).await;
            assert_eq!(status, StreamStatus::Failed);
            assert_eq!(events.len(), 1);
            assert_eq!(error_code(&events[0]), Some(ErrorCode::Validation));
        }
        let (_, events) = run(&orch, &env.principal, None, Some("hi")).await;
        assert_eq!(error_code(&events[0]), Some(ErrorCode::Validation));

        assert!(env.store.history(CONVO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_means_no_ack_and_no_generation() {
        let env = env().await;
        let generator = Arc::new(TrackingGenerator::new());
        let orch = orchestrator(
            &env,
            env.store.clone(),
            env.index.clone(),
            Arc::new(FailingEmbedder),
            generator.clone(),
        );

        let (status, events) = run(&orch, &env.principal, Some(CONVO), Some("hi")).await;
        assert_eq!(status, StreamStatus::Failed);
        assert!(events.iter().all(|e| kind(e) != "message_saved"));
        assert_eq!(error_code(events.last().unwrap()), Some(ErrorCode::Embedding));
        assert!(!generator.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn step_two_index_failure_is_fatal() {
        let env = env().await;
        let model = Arc::new(MockModelClient::new());
        let orch = orchestrator(
            &env,
            env.store.clone(),
            Arc::new(FailingUpsertIndex),
            model.clone(),
            model,
        );

        let (status, events) = run(&orch, &env.principal, Some(CONVO), Some("hi")).await;
        assert_eq!(status, StreamStatus::Failed);
        assert!(events.iter().all(|e| kind(e) != "message_saved"));
        assert_eq!(error_code(events.last().unwrap()), Some(ErrorCode::Index));
    }

    #[tokio::test]
    async fn history_failure_is_fatal_after_acknowledgment() {
        let env = env().await;
        let model = Arc::new(MockModelClient::new());
        let orch = orchestrator(
            &env,
            Arc::new(BrokenHistoryStore {
                inner: env.store.clone(),
            }),
            env.index.clone(),
            model.clone(),
            model,
        );

        let (status, events) = run(&orch, &env.principal, Some(CONVO), Some("hi")).await;
        assert_eq!(status, StreamStatus::Failed);
        let kinds: Vec<_> = events.iter().map(kind).collect();
        // The ack already happened; no stream was started so no stream_end.
        assert_eq!(kinds, vec!["message_saved", "error"]);
        assert_eq!(error_code(events.last().unwrap()), Some(ErrorCode::Persistence));
    }

    #[tokio::test]
    async fn memory_query_failure_degrades_to_empty_context() {
        let env = env().await;
        let model = Arc::new(MockModelClient::new());
        let generator = Arc::new(CapturingGenerator::new());
        let orch = orchestrator(
            &env,
            env.store.clone(),
            Arc::new(FailingQueryIndex {
                inner: env.index.clone(),
            }),
            model,
            generator.clone(),
        );

        let (status, events) = run(&orch, &env.principal, Some(CONVO), Some("hi")).await;
        assert_eq!(status, StreamStatus::Done);
        assert_eq!(kind(events.last().unwrap()), "response");

        let request = generator.seen.lock().unwrap().clone().unwrap();
        assert!(request.system.is_none());
    }

    #[tokio::test]
    async fn retrieved_context_is_scoped_to_the_caller() {
        let env = env().await;
        let model = Arc::new(MockModelClient::new());

        // Seed one record for the caller and one for a stranger.
        for (id, user, text) in [
            ("m-mine", "u-1", "the caller's favorite color is teal"),
            ("m-theirs", "u-2", "someone else's tax return"),
        ] {
            let vector = model.embed("hi").await.unwrap();
            env.index
                .upsert(MemoryRecord {
                    id: id.into(),
                    vector,
                    metadata: RecordMetadata {
                        conversation_id: "c-x".into(),
                        user_id: user.into(),
                        text: text.into(),
                    },
                })
                .await
                .unwrap();
        }

        let generator = Arc::new(CapturingGenerator::new());
        let orch = orchestrator(
            &env,
            env.store.clone(),
            env.index.clone(),
            model,
            generator.clone(),
        );
        let (status, _) = run(&orch, &env.principal, Some(CONVO), Some("hi")).await;
        assert_eq!(status, StreamStatus::Done);

        let request = generator.seen.lock().unwrap().clone().unwrap();
        let system = request.system.expect("caller has retrievable memory");
        assert!(system.contains("favorite color is teal"));
        assert!(!system.contains("tax return"));
    }

    #[tokio::test]
    async fn history_maps_model_turns_to_the_assistant_role() {
        let env = env().await;
        let model = Arc::new(MockModelClient::new());
        env.store
            .append_turn(&Turn::new(CONVO, Sender::User, "earlier question"))
            .await
            .unwrap();
        env.store
            .append_turn(&Turn::new(CONVO, Sender::Model, "earlier answer"))
            .await
            .unwrap();

        let generator = Arc::new(CapturingGenerator::new());
        let orch = orchestrator(
            &env,
            env.store.clone(),
            env.index.clone(),
            model,
            generator.clone(),
        );
        let (status, _) = run(&orch, &env.principal, Some(CONVO), Some("follow-up")).await;
        assert_eq!(status, StreamStatus::Done);

        let request = generator.seen.lock().unwrap().clone().unwrap();
        // The just-persisted prompt turn is excluded; prior turns map roles.
        assert_eq!(request.history.len(), 2);
        assert_eq!(request.history[0].role, ChatRole::User);
        assert_eq!(request.history[1].role, ChatRole::Assistant);
        assert_eq!(request.prompt, "follow-up");
    }

    #[tokio::test]
    async fn finalization_failure_is_reported_distinctly() {
        let env = env().await;
        let model = Arc::new(MockModelClient::new());
        let orch = orchestrator(
            &env,
            Arc::new(ModelAppendFails {
                inner: env.store.clone(),
            }),
            env.index.clone(),
            model.clone(),
            model,
        );

        let (status, events) = run(&orch, &env.principal, Some(CONVO), Some("hi")).await;
        assert_eq!(status, StreamStatus::Failed);

        let kinds: Vec<_> = events.iter().map(kind).collect();
        assert_eq!(kinds.first(), Some(&"message_saved"));
        assert!(kinds.contains(&"stream_chunk"), "text was still delivered");
        assert_eq!(kinds[kinds.len() - 2], "stream_end");
        assert_eq!(error_code(events.last().unwrap()), Some(ErrorCode::Finalization));
        // stream_end is emitted exactly once even though the session failed.
        assert_eq!(kinds.iter().filter(|k| **k == "stream_end").count(), 1);
    }

    #[tokio::test]
    async fn session_budget_expiry_classifies_as_upstream_unavailable() {
        let env = env().await;
        let model = Arc::new(MockModelClient::new());
        let orch = Orchestrator::new(
            env.store.clone(),
            env.store.clone(),
            env.index.clone(),
            model,
            Arc::new(StalledGenerator),
            5,
            Duration::from_millis(50),
        );

        let (status, events) = run(&orch, &env.principal, Some(CONVO), Some("hi")).await;
        assert_eq!(status, StreamStatus::Failed);
        let kinds: Vec<_> = events.iter().map(kind).collect();
        assert_eq!(kinds[kinds.len() - 2], "stream_end");
        assert_eq!(
            error_code(events.last().unwrap()),
            Some(ErrorCode::UpstreamUnavailable)
        );
    }
}
