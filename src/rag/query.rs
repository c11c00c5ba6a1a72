use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{FALLBACK_ANSWER, system_prompt};
use crate::config::RetrievalConfig;
use crate::context::{AssembledContext, ContextAssembler};
use crate::db::models::ContextEntry;
use crate::db::store::check_top_k;
use crate::db::{RetrievedChunk, VectorStore};
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::generator::{ChatMessage, Generator, Role, TokenStream};

/// Where a query run currently is.
///
/// `Failed` is reachable from every stage except `Done`; `Done` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Received,
    Embedding,
    Searching,
    Assembling,
    Generating,
    Streaming,
    Complete,
    Done,
    Failed,
}

impl QueryStage {
    pub fn can_advance_to(self, next: QueryStage) -> bool {
        use QueryStage::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Received, Embedding)
            | (Embedding, Searching)
            | (Searching, Assembling)
            | (Assembling, Generating)
            | (Generating, Streaming | Complete)
            | (Streaming | Complete, Done) => true,
            // empty retrieval skips generation
            (Assembling, Complete) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "RECEIVED",
            Self::Embedding => "EMBEDDING",
            Self::Searching => "SEARCHING",
            Self::Assembling => "ASSEMBLING",
            Self::Generating => "GENERATING",
            Self::Streaming => "STREAMING",
            Self::Complete => "COMPLETE",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Stage bookkeeping for one run; every transition is logged.
#[derive(Debug)]
struct Run {
    id: u64,
    stage: QueryStage,
}

impl Run {
    fn new(id: u64) -> Self {
        debug!("query#{id} {}", QueryStage::Received);
        Self {
            id,
            stage: QueryStage::Received,
        }
    }

    fn advance(&mut self, next: QueryStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.stage
        );
        debug!("query#{} {} -> {next}", self.id, self.stage);
        self.stage = next;
    }

    fn fail(&mut self, err: &Error) {
        if self.stage.is_terminal() {
            return;
        }
        warn!("query#{} failed during {}: {err}", self.id, self.stage);
        self.stage = QueryStage::Failed;
    }

    /// Run `result` through the tracker: a failure moves the run to `Failed`.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.inspect_err(|e| self.fail(e))
    }
}

/// One fragment of a chat message, as sent by chat UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

/// Chat message in the multi-part form used by the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl UiMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![MessagePart::text(text)],
        }
    }

    /// Text parts joined in order; other part types are ignored.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

/// One-shot result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub context: Vec<ContextEntry>,
}

/// Streaming result: the context is known before the first fragment.
pub struct ChatResponse {
    pub context: Vec<ContextEntry>,
    pub stream: TokenStream,
}

/// What retrieval produced for one run.
struct Grounding {
    context: AssembledContext,
    entries: Vec<ContextEntry>,
}

/// Embed → search → assemble → generate.
#[derive(Clone)]
pub struct QueryPipeline {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    generator: Arc<dyn Generator>,
    assembler: ContextAssembler,
    default_top_k: usize,
    history_turns: usize,
    runs: Arc<AtomicU64>,
}

impl QueryPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        generator: Arc<dyn Generator>,
        retrieval: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            generator,
            assembler: ContextAssembler::new(retrieval.max_context_chars),
            default_top_k: retrieval.default_top_k,
            history_turns: retrieval.history_turns,
            runs: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Model answering queries, for diagnostics.
    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    fn start(&self) -> Run {
        Run::new(self.runs.fetch_add(1, Ordering::Relaxed))
    }

    fn resolve_top_k(&self, top_k: Option<usize>) -> Result<usize> {
        let top_k = top_k.unwrap_or(self.default_top_k);
        check_top_k(top_k, self.store.max_top_k())?;
        Ok(top_k)
    }

    async fn retrieve(
        &self,
        run: &mut Run,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        run.advance(QueryStage::Embedding);
        let vector = run.check(self.embedder.embed(query).await)?;

        run.advance(QueryStage::Searching);
        let chunks = run.check(self.store.search(&vector, top_k).await)?;
        debug!("query#{} retrieved {} chunks", run.id, chunks.len());
        Ok(chunks)
    }

    fn ground(&self, run: &mut Run, chunks: &[RetrievedChunk]) -> Grounding {
        run.advance(QueryStage::Assembling);
        let assembly = self.assembler.assemble(chunks);
        if assembly.used < chunks.len() {
            debug!(
                "query#{} context budget kept {} of {} chunks",
                run.id,
                assembly.used,
                chunks.len()
            );
        }
        Grounding {
            context: assembly.context,
            entries: chunks[..assembly.used].iter().map(ContextEntry::from).collect(),
        }
    }

    /// Retrieval only: the chunks a question would be grounded on.
    pub async fn search(&self, question: &str, top_k: Option<usize>) -> Result<Vec<RetrievedChunk>> {
        let mut run = self.start();
        let question = run.check(validate_question(question))?;
        let top_k = run.check(self.resolve_top_k(top_k))?;
        self.retrieve(&mut run, question, top_k).await
    }

    /// One-shot question answering with a blocking generation call.
    pub async fn ask(&self, question: &str, top_k: Option<usize>) -> Result<Answer> {
        let mut run = self.start();
        let question = run.check(validate_question(question))?;
        let top_k = run.check(self.resolve_top_k(top_k))?;

        let chunks = self.retrieve(&mut run, question, top_k).await?;
        let grounding = self.ground(&mut run, &chunks);

        if grounding.context.is_no_context() {
            info!("query#{} found no context; returning fallback", run.id);
            run.advance(QueryStage::Complete);
            run.advance(QueryStage::Done);
            return Ok(Answer {
                answer: FALLBACK_ANSWER.to_string(),
                context: Vec::new(),
            });
        }

        run.advance(QueryStage::Generating);
        let prompt = system_prompt(&grounding.context);
        let answer = run.check(
            self.generator
                .generate(&prompt, &[ChatMessage::user(question)])
                .await,
        )?;

        run.advance(QueryStage::Complete);
        run.advance(QueryStage::Done);
        info!(
            "query#{} answered with {} context chunks",
            run.id,
            grounding.entries.len()
        );
        Ok(Answer {
            answer,
            context: grounding.entries,
        })
    }

    /// Multi-turn chat with a streamed answer.
    ///
    /// The retrieval query is the latest user message; the last
    /// `history_turns` messages are forwarded to the model.
    pub async fn chat(&self, messages: &[UiMessage]) -> Result<ChatResponse> {
        let mut run = self.start();
        let query = run.check(latest_user_text(messages))?;
        let top_k = run.check(self.resolve_top_k(None))?;

        let chunks = self.retrieve(&mut run, &query, top_k).await?;
        let grounding = self.ground(&mut run, &chunks);

        if grounding.context.is_no_context() {
            info!("query#{} found no context; returning fallback", run.id);
            run.advance(QueryStage::Complete);
            run.advance(QueryStage::Done);
            let fallback = futures::stream::once(async { Ok(FALLBACK_ANSWER.to_string()) });
            return Ok(ChatResponse {
                context: Vec::new(),
                stream: fallback.boxed(),
            });
        }

        run.advance(QueryStage::Generating);
        let prompt = system_prompt(&grounding.context);
        let history = trim_history(messages, self.history_turns);
        let mut tokens = run.check(self.generator.generate_stream(&prompt, &history).await)?;

        run.advance(QueryStage::Streaming);
        let stream = async_stream::stream! {
            let mut fragments = 0usize;
            while let Some(item) = tokens.next().await {
                match &item {
                    Ok(_) => fragments += 1,
                    Err(e) => {
                        debug!("query#{} stream broke after {fragments} fragments", run.id);
                        run.fail(e);
                    }
                }
                yield item;
            }
            if !run.stage.is_terminal() {
                run.advance(QueryStage::Done);
                info!("query#{} streamed {fragments} fragments", run.id);
            }
        };

        Ok(ChatResponse {
            context: grounding.entries,
            stream: stream.boxed(),
        })
    }
}

fn validate_question(question: &str) -> Result<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid("question must not be empty"));
    }
    Ok(trimmed)
}

/// Text of the most recent user message.
fn latest_user_text(messages: &[UiMessage]) -> Result<String> {
    let latest = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .ok_or_else(|| Error::invalid("conversation has no user message"))?;

    let text = latest.text();
    if text.trim().is_empty() {
        return Err(Error::invalid("latest user message has no text"));
    }
    Ok(text)
}

/// The last `turns` messages, as plain chat messages. Messages without text
/// are dropped after the window is taken.
fn trim_history(messages: &[UiMessage], turns: usize) -> Vec<ChatMessage> {
    let start = messages.len().saturating_sub(turns);
    messages[start..]
        .iter()
        .filter_map(|m| {
            let content = m.text();
            (!content.trim().is_empty()).then_some(ChatMessage {
                role: m.role,
                content,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, SqliteVectorStore};
    use crate::embedder::mock::MockEmbedder;
    use crate::error::ServiceError;
    use crate::generator::mock::MockGenerator;
    use crate::rag::SYSTEM_INSTRUCTION;
    use serde_json::json;
    use std::time::Duration;

    const PARIS: &str = "Paris is the capital of France.";
    const BERLIN: &str = "Berlin is the capital of Germany.";
    const QUESTION: &str = "What is the capital of France?";

    struct Fixture {
        embedder: Arc<MockEmbedder>,
        generator: Arc<MockGenerator>,
        store: Arc<SqliteVectorStore>,
        pipeline: QueryPipeline,
    }

    fn embedder() -> MockEmbedder {
        MockEmbedder::new(3)
            .with_vector(PARIS, vec![1.0, 0.0, 0.0])
            .with_vector(BERLIN, vec![0.0, 1.0, 0.0])
            .with_vector(QUESTION, vec![0.9, 0.1, 0.0])
    }

    fn fixture_with(generator: MockGenerator, retrieval: RetrievalConfig) -> Fixture {
        let embedder = Arc::new(embedder());
        let generator = Arc::new(generator);
        let db = Db::open_in_memory(3).unwrap();
        let store = Arc::new(SqliteVectorStore::new(
            db,
            retrieval.max_top_k,
            Duration::from_secs(5),
        ));
        let pipeline = QueryPipeline::new(
            embedder.clone(),
            store.clone(),
            generator.clone(),
            &retrieval,
        );
        Fixture {
            embedder,
            generator,
            store,
            pipeline,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            MockGenerator::new("The capital of France is Paris."),
            RetrievalConfig::default(),
        )
    }

    async fn seed(fx: &Fixture) {
        let meta = json!({"source": "doc1"}).as_object().cloned().unwrap();
        fx.store
            .insert(PARIS, &[1.0, 0.0, 0.0], Some(&meta))
            .await
            .unwrap();
        fx.store.insert(BERLIN, &[0.0, 1.0, 0.0], None).await.unwrap();
    }

    #[test]
    fn test_stage_transitions() {
        use QueryStage::*;
        assert!(Received.can_advance_to(Embedding));
        assert!(Generating.can_advance_to(Streaming));
        assert!(Assembling.can_advance_to(Complete));
        assert!(Searching.can_advance_to(Failed));
        assert!(!Embedding.can_advance_to(Generating));
        assert!(!Done.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Received));
    }

    #[test]
    fn test_ui_message_text_ignores_other_parts() {
        let message = UiMessage {
            role: Role::User,
            parts: vec![
                MessagePart::text("capital "),
                MessagePart {
                    kind: "file".into(),
                    text: Some("ignored".into()),
                },
                MessagePart::text("of France"),
            ],
        };
        assert_eq!(message.text(), "capital of France");
    }

    #[test]
    fn test_ui_message_deserialize() {
        let message: UiMessage = serde_json::from_value(json!({
            "id": "m1",
            "role": "user",
            "parts": [{"type": "text", "text": "hello"}, {"type": "step-start"}]
        }))
        .unwrap();
        assert_eq!(message.text(), "hello");
    }

    #[test]
    fn test_trim_history() {
        let messages: Vec<UiMessage> = (0..8).map(|i| UiMessage::user(format!("m{i}"))).collect();
        let history = trim_history(&messages, 5);
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5", "m6", "m7"]);
    }

    #[test]
    fn test_latest_user_text_skips_assistant() {
        let messages = vec![
            UiMessage::user("first"),
            UiMessage {
                role: Role::Assistant,
                parts: vec![MessagePart::text("reply")],
            },
        ];
        assert_eq!(latest_user_text(&messages).unwrap(), "first");
        assert!(latest_user_text(&[]).is_err());
    }

    #[tokio::test]
    async fn test_ask_paris() {
        let fx = fixture();
        seed(&fx).await;

        let answer = fx.pipeline.ask(QUESTION, Some(1)).await.unwrap();
        assert_eq!(answer.context.len(), 1);
        assert_eq!(answer.context[0].content, PARIS);
        assert_eq!(answer.context[0].metadata.as_ref().unwrap()["source"], "doc1");
        assert_ne!(answer.answer, FALLBACK_ANSWER);
        assert_eq!(answer.answer, "The capital of France is Paris.");

        let recorded = fx.generator.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].system_prompt.starts_with(SYSTEM_INSTRUCTION));
        assert!(recorded[0].system_prompt.contains(PARIS));
        assert!(!recorded[0].system_prompt.contains(BERLIN));
        assert_eq!(recorded[0].messages, vec![ChatMessage::user(QUESTION)]);
    }

    #[tokio::test]
    async fn test_ask_default_top_k_orders_by_similarity() {
        let fx = fixture();
        seed(&fx).await;

        let answer = fx.pipeline.ask(QUESTION, None).await.unwrap();
        assert_eq!(answer.context.len(), 2);
        assert_eq!(answer.context[0].content, PARIS);
        assert!(answer.context[0].similarity >= answer.context[1].similarity);
    }

    #[tokio::test]
    async fn test_ask_empty_store_returns_fallback() {
        let fx = fixture();

        let answer = fx.pipeline.ask(QUESTION, None).await.unwrap();
        assert_eq!(answer.answer, FALLBACK_ANSWER);
        assert!(answer.context.is_empty());
        assert_eq!(fx.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_ask_top_k_out_of_range_skips_embedding() {
        let fx = fixture();
        for k in [0, 11] {
            let err = fx.pipeline.ask(QUESTION, Some(k)).await.unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "k = {k}");
        }
        assert_eq!(fx.embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_ask_empty_question() {
        let fx = fixture();
        let err = fx.pipeline.ask("   ", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(fx.embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_ask_generation_failure_surfaces() {
        let fx = fixture_with(
            MockGenerator::failing(ServiceError::timeout("model too slow")),
            RetrievalConfig::default(),
        );
        seed(&fx).await;

        let err = fx.pipeline.ask(QUESTION, None).await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_ask_respects_context_budget() {
        let retrieval = RetrievalConfig {
            max_context_chars: Some(PARIS.len() + 5),
            ..RetrievalConfig::default()
        };
        let fx = fixture_with(MockGenerator::new("Paris."), retrieval);
        seed(&fx).await;

        let answer = fx.pipeline.ask(QUESTION, Some(2)).await.unwrap();
        assert_eq!(answer.context.len(), 1);
        assert!(!fx.generator.recorded()[0].system_prompt.contains(BERLIN));
    }

    #[tokio::test]
    async fn test_search_only_makes_no_generation_call() {
        let fx = fixture();
        seed(&fx).await;

        let chunks = fx.pipeline.search(QUESTION, Some(2)).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, PARIS);
        assert_eq!(fx.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_chat_streams_answer_with_context() {
        let fx = fixture();
        seed(&fx).await;

        let messages = vec![
            UiMessage::user("Hello"),
            UiMessage {
                role: Role::Assistant,
                parts: vec![MessagePart::text("Hi! Ask me anything.")],
            },
            UiMessage::user(QUESTION),
        ];
        let response = fx.pipeline.chat(&messages).await.unwrap();
        assert_eq!(response.context[0].content, PARIS);

        let fragments: Vec<String> = response
            .stream
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), "The capital of France is Paris.");

        let recorded = fx.generator.recorded();
        assert_eq!(recorded[0].messages.len(), 3);
        assert_eq!(recorded[0].messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_chat_trims_history() {
        let retrieval = RetrievalConfig {
            history_turns: 2,
            ..RetrievalConfig::default()
        };
        let fx = fixture_with(MockGenerator::new("ok"), retrieval);
        seed(&fx).await;

        let mut messages: Vec<UiMessage> =
            (0..6).map(|i| UiMessage::user(format!("old {i}"))).collect();
        messages.push(UiMessage::user(QUESTION));

        let response = fx.pipeline.chat(&messages).await.unwrap();
        let _: Vec<_> = response.stream.collect().await;

        let sent = &fx.generator.recorded()[0].messages;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].content, QUESTION);
    }

    #[tokio::test]
    async fn test_chat_without_text_skips_embedding() {
        let fx = fixture();
        let messages = vec![UiMessage {
            role: Role::User,
            parts: vec![MessagePart {
                kind: "file".into(),
                text: None,
            }],
        }];

        let err = fx.pipeline.chat(&messages).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(fx.embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_chat_empty_store_streams_fallback() {
        let fx = fixture();
        let response = fx.pipeline.chat(&[UiMessage::user(QUESTION)]).await.unwrap();
        assert!(response.context.is_empty());

        let fragments: Vec<String> = response.stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(fragments.concat(), FALLBACK_ANSWER);
        assert_eq!(fx.generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_chat_mid_stream_failure_is_last_item() {
        let fx = fixture_with(
            MockGenerator::failing_mid_stream("one two three", 2, ServiceError::timeout("idle")),
            RetrievalConfig::default(),
        );
        seed(&fx).await;

        let response = fx.pipeline.chat(&[UiMessage::user(QUESTION)]).await.unwrap();
        let items: Vec<Result<String>> = response.stream.collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[..2].iter().all(|i| i.is_ok()));
        assert!(matches!(items[2], Err(Error::Generation(_))));
    }
}
