//! History-aware retrieval-augmented answer pipeline.
//!
//! One request flows through fixed stages:
//!
//! ```text
//! Received ─▶ (history? Rewriting) ─▶ Retrieving ─▶ Generating ─▶ Streaming ─▶ Completed
//!                    └───────────────────┴──────────────┴────────────┴─▶ Failed
//! ```
//!
//! - **Rewriting** turns a follow-up question into a standalone one using
//!   the earlier turns. Skipped when there are none.
//! - **Retrieving** embeds the question and takes the index's top-k
//!   chunks as-is: no dedup, re-ranking or score threshold.
//! - **Generating** renders the answer prompt and calls the model, either
//!   buffered ([`QueryPipeline::answer`]) or streamed
//!   ([`QueryPipeline::answer_stream`]).
//!
//! The pipeline holds no per-request state; one instance serves every
//! request concurrently.

use anyhow::Result;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::{AnswerPolicy, Config, Credentials};
use crate::embedding::{Embedder, OpenAIEmbedder};
use crate::llm::{ChatModel, GenerationRequest, OpenAIChat, PromptMessage};
use crate::models::{ChatMessage, RetrievedChunk, Role};
use crate::streaming::{collect_fragments, TextStream};
use crate::vector_store::{PineconeStore, VectorStore};

pub const CONTEXTUALIZE_SYSTEM_PROMPT: &str = "Given a chat history and the latest user question \
which might reference context in the chat history, formulate a standalone question which can be \
understood without the chat history. Do NOT answer the question, just reformulate it if needed \
and otherwise return it as is.";

const STRICT_INSTRUCTIONS: &str = "You are an assistant for question-answering tasks. Use the \
following pieces of retrieved context to answer the question. If you don't know the answer, just \
say that you don't know. Use three sentences maximum and keep the answer concise.";

const GENERAL_INSTRUCTIONS: &str = "You are an assistant for question-answering tasks. Use the \
following pieces of retrieved context to answer the question. If the context does not contain the \
answer, answer from your general knowledge and say that you did. Keep the answer concise.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStage {
    Received,
    Rewriting,
    Retrieving,
    Generating,
    Streaming,
    Completed,
    Failed,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryStage::Received => "received",
            QueryStage::Rewriting => "rewriting",
            QueryStage::Retrieving => "retrieving",
            QueryStage::Generating => "generating",
            QueryStage::Streaming => "streaming",
            QueryStage::Completed => "completed",
            QueryStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The request itself is unusable.
    #[error("{0}")]
    InvalidInput(String),
    /// An embedding, index or model call failed.
    #[error("{stage} failed: {error:#}")]
    Upstream {
        stage: QueryStage,
        error: anyhow::Error,
    },
}

impl QueryError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, QueryError::InvalidInput(_))
    }
}

/// A validated question plus the turns that preceded it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub question: String,
    pub history: Vec<ChatMessage>,
}

impl QueryRequest {
    /// Single-turn request.
    pub fn from_prompt(prompt: &str) -> Result<Self, QueryError> {
        if prompt.trim().is_empty() {
            return Err(QueryError::InvalidInput("Missing or invalid prompt".to_string()));
        }
        Ok(Self {
            question: prompt.to_string(),
            history: Vec::new(),
        })
    }

    /// Multi-turn request. The last message is the question and must come
    /// from the user; everything before it is history.
    pub fn from_messages(mut messages: Vec<ChatMessage>) -> Result<Self, QueryError> {
        let last = messages
            .pop()
            .ok_or_else(|| QueryError::InvalidInput("messages must not be empty".to_string()))?;
        if last.role != Role::User {
            return Err(QueryError::InvalidInput(
                "last message must be from the user".to_string(),
            ));
        }
        if last.content.trim().is_empty() {
            return Err(QueryError::InvalidInput(
                "last message must not be empty".to_string(),
            ));
        }
        Ok(Self {
            question: last.content,
            history: messages,
        })
    }
}

/// Lightweight reference to a chunk that grounded an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub id: String,
    pub source: Option<String>,
    pub chunk_index: Option<u32>,
    pub score: f32,
}

impl From<&RetrievedChunk> for SourceRef {
    fn from(chunk: &RetrievedChunk) -> Self {
        Self {
            id: chunk.id.clone(),
            source: chunk.source.clone(),
            chunk_index: chunk.chunk_index,
            score: chunk.score,
        }
    }
}

/// A buffered answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    /// The standalone question actually used for retrieval.
    pub question: String,
    pub sources: Vec<SourceRef>,
}

/// A streamed answer. `fragments` concatenate to the full answer text.
pub struct AnswerStream {
    pub question: String,
    pub sources: Vec<SourceRef>,
    pub fragments: TextStream,
}

impl AnswerStream {
    /// Drain the fragments into a buffered [`Answer`].
    pub async fn collect(self) -> Result<Answer, QueryError> {
        let answer = collect_fragments(self.fragments)
            .await
            .map_err(upstream(QueryStage::Streaming))?;
        Ok(Answer {
            answer,
            question: self.question,
            sources: self.sources,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuerySettings {
    pub top_k: usize,
    pub temperature: f32,
    pub rewrite_temperature: f32,
    pub policy: AnswerPolicy,
}

impl QuerySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            temperature: config.llm.temperature,
            rewrite_temperature: config.llm.rewrite_temperature,
            policy: config.llm.answer_policy,
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct Grounding {
    question: String,
    chunks: Vec<RetrievedChunk>,
}

pub struct QueryPipeline {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn ChatModel>,
    settings: QuerySettings,
}

impl QueryPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn ChatModel>,
        settings: QuerySettings,
    ) -> Self {
        tracing::debug!(
            embedding_model = embedder.model_name(),
            chat_model = llm.model_name(),
            top_k = settings.top_k,
            "query pipeline ready"
        );
        Self {
            embedder,
            store,
            llm,
            settings,
        }
    }

    /// Pipeline over the OpenAI embedder and chat model and the Pinecone index.
    pub fn from_config(config: &Config, credentials: &Credentials) -> Result<Self> {
        Ok(Self::new(
            Arc::new(OpenAIEmbedder::new(&config.embedding, credentials)?),
            Arc::new(PineconeStore::new(&config.vector_store, credentials)?),
            Arc::new(OpenAIChat::new(&config.llm, credentials)?),
            QuerySettings::from_config(config),
        ))
    }

    /// Rewrite `question` into a standalone question using `history`.
    /// Returns `question` unchanged, without calling the model, when
    /// `history` is empty.
    pub async fn contextualize(&self, question: &str, history: &[ChatMessage]) -> Result<String> {
        if history.is_empty() {
            return Ok(question.to_string());
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(PromptMessage::system(CONTEXTUALIZE_SYSTEM_PROMPT));
        messages.extend(history.iter().map(PromptMessage::from));
        messages.push(PromptMessage::user(question));

        let rewritten = self
            .llm
            .generate(&GenerationRequest {
                messages,
                temperature: self.settings.rewrite_temperature,
            })
            .await?;

        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            Ok(question.to_string())
        } else {
            Ok(rewritten.to_string())
        }
    }

    /// Top-k chunks for `question`, in the index's order.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedChunk>> {
        let vector = self.embedder.embed_query(question).await?;
        self.store.query(&vector, self.settings.top_k).await
    }

    /// The final generation request for `question` grounded in `context`.
    pub fn answer_request(&self, question: &str, context: &str) -> GenerationRequest {
        GenerationRequest {
            messages: vec![PromptMessage::user(render_answer_prompt(
                self.settings.policy,
                question,
                context,
            ))],
            temperature: self.settings.temperature,
        }
    }

    async fn ground(&self, request: &QueryRequest) -> Result<Grounding, QueryError> {
        tracing::debug!(stage = %QueryStage::Received, turns = request.history.len());

        let question = if request.history.is_empty() {
            request.question.clone()
        } else {
            tracing::debug!(stage = %QueryStage::Rewriting);
            let rewritten = self
                .contextualize(&request.question, &request.history)
                .await
                .map_err(upstream(QueryStage::Rewriting))?;
            tracing::info!(original = %request.question, standalone = %rewritten, "rewrote question");
            rewritten
        };

        tracing::debug!(stage = %QueryStage::Retrieving);
        let chunks = self
            .retrieve(&question)
            .await
            .map_err(upstream(QueryStage::Retrieving))?;
        tracing::info!(chunks = chunks.len(), "retrieved context");

        Ok(Grounding { question, chunks })
    }

    /// Run the pipeline and wait for the whole answer.
    #[tracing::instrument(skip_all, fields(turns = request.history.len()))]
    pub async fn answer(&self, request: &QueryRequest) -> Result<Answer, QueryError> {
        let grounding = self.ground(request).await?;
        let generation = self.answer_request(&grounding.question, &format_context(&grounding.chunks));

        tracing::debug!(stage = %QueryStage::Generating);
        let answer = self
            .llm
            .generate(&generation)
            .await
            .map_err(upstream(QueryStage::Generating))?;

        tracing::debug!(stage = %QueryStage::Completed);
        Ok(Answer {
            answer,
            question: grounding.question,
            sources: grounding.chunks.iter().map(SourceRef::from).collect(),
        })
    }

    /// Run the pipeline up to the model call and return the answer as a
    /// fragment stream. Failures after this returns arrive as stream items.
    #[tracing::instrument(skip_all, fields(turns = request.history.len()))]
    pub async fn answer_stream(&self, request: &QueryRequest) -> Result<AnswerStream, QueryError> {
        let grounding = self.ground(request).await?;
        let generation = self.answer_request(&grounding.question, &format_context(&grounding.chunks));

        tracing::debug!(stage = %QueryStage::Generating);
        let fragments = self
            .llm
            .generate_stream(&generation)
            .await
            .map_err(upstream(QueryStage::Generating))?;

        tracing::debug!(stage = %QueryStage::Streaming);
        let fragments = fragments
            .inspect(|item| {
                if let Err(e) = item {
                    tracing::warn!(stage = %QueryStage::Failed, error = %format!("{:#}", e), "answer stream failed");
                }
            })
            .boxed();

        Ok(AnswerStream {
            question: grounding.question,
            sources: grounding.chunks.iter().map(SourceRef::from).collect(),
            fragments,
        })
    }
}

/// Join chunk texts, in order, into one context block.
pub fn format_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn render_answer_prompt(policy: AnswerPolicy, question: &str, context: &str) -> String {
    let instructions = match policy {
        AnswerPolicy::Strict => STRICT_INSTRUCTIONS,
        AnswerPolicy::General => GENERAL_INSTRUCTIONS,
    };
    format!(
        "{}\nQuestion: {}\nContext: {}\nAnswer:",
        instructions, question, context
    )
}

fn upstream(stage: QueryStage) -> impl FnOnce(anyhow::Error) -> QueryError {
    move |error| {
        tracing::warn!(stage = %QueryStage::Failed, failed_stage = %stage, error = %format!("{:#}", error), "query failed");
        QueryError::Upstream { stage, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, VectorRecord};
    use crate::streaming::from_fragments;
    use crate::vector_store::InMemoryVectorStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Letter-frequency embedding: similar wording, similar vector.
    struct LetterEmbedder {
        queries: Mutex<Vec<String>>,
    }

    impl LetterEmbedder {
        fn new() -> Self {
            Self {
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    fn letters(text: &str) -> Vec<f32> {
        let mut v = vec![0.0; 26];
        for c in text.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()) {
            v[(c as u8 - b'a') as usize] += 1.0;
        }
        v
    }

    #[async_trait]
    impl Embedder for LetterEmbedder {
        fn model_name(&self) -> &str {
            "letters"
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.queries.lock().unwrap().extend(texts.iter().cloned());
            Ok(texts.iter().map(|t| letters(t)).collect())
        }
    }

    /// Answers rewrites with `rewrite` and everything else with `answer`.
    struct ScriptedChat {
        rewrite: String,
        answer: String,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedChat {
        fn new(rewrite: &str, answer: &str) -> Self {
            Self {
                rewrite: rewrite.to_string(),
                answer: answer.to_string(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn reply(&self, request: &GenerationRequest) -> String {
            self.requests.lock().unwrap().push(request.clone());
            if request.messages[0].content == CONTEXTUALIZE_SYSTEM_PROMPT {
                self.rewrite.clone()
            } else {
                self.answer.clone()
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            Ok(self.reply(request))
        }

        async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
            let text = self.reply(request);
            let fragments: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
            Ok(from_fragments(fragments))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl VectorStore for BrokenStore {
        async fn upsert(&self, _records: &[VectorRecord]) -> Result<usize> {
            anyhow::bail!("index unavailable")
        }
        async fn query(&self, _vector: &[f32], _top_k: usize) -> Result<Vec<RetrievedChunk>> {
            anyhow::bail!("index unavailable")
        }
    }

    async fn seeded_store() -> Arc<InMemoryVectorStore> {
        let store = Arc::new(InMemoryVectorStore::new());
        let texts = [
            "Ethan Hunt leads the Impossible Missions Force.",
            "The disavowed team escapes from a Prague embassy.",
            "Zzz quiet buzz fuzz jazz.",
        ];
        let records: Vec<VectorRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| VectorRecord {
                id: format!("mi.txt-chunk-{}", i),
                values: letters(t),
                text: t.to_string(),
                metadata: ChunkMetadata {
                    source: "mi.txt".to_string(),
                    chunk_index: i as u32,
                    start: 0,
                    end: t.len(),
                },
            })
            .collect();
        store.upsert(&records).await.unwrap();
        store
    }

    fn settings(top_k: usize) -> QuerySettings {
        QuerySettings {
            top_k,
            ..QuerySettings::default()
        }
    }

    #[tokio::test]
    async fn test_single_turn_skips_rewrite() {
        let chat = Arc::new(ScriptedChat::new("unused", "He leads the IMF."));
        let pipeline = QueryPipeline::new(
            Arc::new(LetterEmbedder::new()),
            seeded_store().await,
            chat.clone(),
            settings(2),
        );

        let request = QueryRequest::from_prompt("Who leads the Impossible Missions Force?").unwrap();
        let answer = pipeline.answer(&request).await.unwrap();

        assert_eq!(answer.answer, "He leads the IMF.");
        assert_eq!(answer.question, request.question);
        assert_eq!(answer.sources.len(), 2);
        let requests = chat.requests.lock().unwrap();
        assert_eq!(requests.len(), 1, "only the answer call is expected");
        assert!(requests[0].messages[0].content.contains("Question: Who leads"));
    }

    #[tokio::test]
    async fn test_multi_turn_rewrites_before_retrieval() {
        let embedder = Arc::new(LetterEmbedder::new());
        let chat = Arc::new(ScriptedChat::new(
            "  Where does the disavowed team escape from?  ",
            "A Prague embassy.",
        ));
        let pipeline = QueryPipeline::new(
            embedder.clone(),
            seeded_store().await,
            chat.clone(),
            settings(1),
        );

        let request = QueryRequest::from_messages(vec![
            ChatMessage::user("Tell me about the disavowed team."),
            ChatMessage::assistant("They go rogue."),
            ChatMessage::user("Where do they escape from?"),
        ])
        .unwrap();
        let answer = pipeline.answer(&request).await.unwrap();

        assert_eq!(answer.question, "Where does the disavowed team escape from?");
        assert_eq!(
            embedder.queries.lock().unwrap().as_slice(),
            ["Where does the disavowed team escape from?"]
        );

        let requests = chat.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let rewrite = &requests[0];
        assert_eq!(rewrite.temperature, 0.0);
        assert_eq!(rewrite.messages.len(), 4);
        assert_eq!(rewrite.messages[3].content, "Where do they escape from?");
        assert!(requests[1].messages[0].content.contains("Prague embassy"));
    }

    #[tokio::test]
    async fn test_empty_rewrite_falls_back_to_question() {
        let chat = ScriptedChat::new("   ", "unused");
        let pipeline = QueryPipeline::new(
            Arc::new(LetterEmbedder::new()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(chat),
            settings(1),
        );
        let rewritten = pipeline
            .contextualize("and then?", &[ChatMessage::user("hi"), ChatMessage::assistant("hello")])
            .await
            .unwrap();
        assert_eq!(rewritten, "and then?");
    }

    #[tokio::test]
    async fn test_stream_matches_buffered_answer() {
        let chat = Arc::new(ScriptedChat::new("unused", "Ethan Hunt leads the team."));
        let pipeline = QueryPipeline::new(
            Arc::new(LetterEmbedder::new()),
            seeded_store().await,
            chat,
            settings(2),
        );
        let request = QueryRequest::from_prompt("Who leads?").unwrap();

        let buffered = pipeline.answer(&request).await.unwrap();
        let streamed = pipeline.answer_stream(&request).await.unwrap().collect().await.unwrap();
        assert_eq!(buffered, streamed);
    }

    #[tokio::test]
    async fn test_index_failure_reports_retrieving_stage() {
        let pipeline = QueryPipeline::new(
            Arc::new(LetterEmbedder::new()),
            Arc::new(BrokenStore),
            Arc::new(ScriptedChat::new("unused", "unused")),
            settings(2),
        );
        let request = QueryRequest::from_prompt("anything").unwrap();
        match pipeline.answer(&request).await {
            Err(QueryError::Upstream { stage, error }) => {
                assert_eq!(stage, QueryStage::Retrieving);
                assert!(error.to_string().contains("index unavailable"));
            }
            other => panic!("expected upstream failure, got {:?}", other.map(|a| a.answer)),
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(QueryRequest::from_prompt("").unwrap_err().is_client_error());
        assert!(QueryRequest::from_prompt("   ").is_err());
        assert!(QueryRequest::from_messages(vec![]).is_err());
        assert!(QueryRequest::from_messages(vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ])
        .is_err());

        let request = QueryRequest::from_messages(vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::user("who?"),
        ])
        .unwrap();
        assert_eq!(request.question, "who?");
        assert_eq!(request.history.len(), 2);
    }

    #[test]
    fn test_format_context_keeps_order() {
        let chunk = |id: &str, text: &str| RetrievedChunk {
            id: id.to_string(),
            text: text.to_string(),
            score: 0.0,
            source: None,
            chunk_index: None,
        };
        let context = format_context(&[chunk("b", "second"), chunk("a", "first"), chunk("b", "second")]);
        assert_eq!(context, "second\n\nfirst\n\nsecond");
    }

    #[test]
    fn test_prompt_policies() {
        let strict = render_answer_prompt(AnswerPolicy::Strict, "Q?", "ctx");
        assert!(strict.contains("just say that you don't know"));
        assert!(strict.ends_with("Question: Q?\nContext: ctx\nAnswer:"));

        let general = render_answer_prompt(AnswerPolicy::General, "Q?", "ctx");
        assert!(general.contains("general knowledge"));
    }
}
