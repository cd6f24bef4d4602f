//! HTTP chat server.
//!
//! Serves the answer pipeline and the browser chat UI.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/prompt` | Answer a question, streamed (SSE) or buffered |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/` | Chat UI |
//!
//! # Request body
//!
//! Either a single question or a conversation whose last message is the
//! question:
//!
//! ```json
//! { "prompt": "Who leads the IMF?" }
//! { "messages": [{ "role": "user", "content": "Who leads the IMF?" }], "stream": false }
//! ```
//!
//! `stream` defaults to `true`.
//!
//! # Streamed response
//!
//! `text/event-stream` with these events, in order:
//!
//! | Event | Data |
//! |-------|------|
//! | `meta` | `{"question": ..., "sources": [...]}` |
//! | `token` | `{"text": ...}`, repeated |
//! | `done` | `{}` |
//!
//! A failure after the stream has started ends it with one `error` event
//! (`{"message": ...}`) in place of `done`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Missing or invalid prompt" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500).

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, Credentials};
use crate::models::ChatMessage;
use crate::pipeline::{AnswerStream, QueryError, QueryPipeline, QueryRequest, QueryStage, SourceRef};

const CHAT_PAGE: &str = include_str!("../static/chat.html");

#[derive(Clone)]
struct AppState {
    pipeline: Arc<QueryPipeline>,
}

/// Build the pipeline from `config` and serve on `[server].bind` until
/// the process is terminated.
pub async fn run_server(config: &Config, credentials: &Credentials) -> anyhow::Result<()> {
    let pipeline = Arc::new(QueryPipeline::from_config(config, credentials)?);
    let listener = TcpListener::bind(&config.server.bind).await?;

    println!("RAG chat listening on http://{}", config.server.bind);
    tracing::info!(
        bind = %config.server.bind,
        model = %config.llm.model,
        top_k = config.retrieval.top_k,
        "server started"
    );

    serve(listener, pipeline).await
}

/// Serve `pipeline` on an already-bound listener.
pub async fn serve(listener: TcpListener, pipeline: Arc<QueryPipeline>) -> anyhow::Result<()> {
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

pub fn router(pipeline: Arc<QueryPipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/api/prompt", post(handle_prompt))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { pipeline })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        if err.is_client_error() {
            bad_request(err.to_string())
        } else {
            internal(err.to_string())
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET / ============

async fn handle_index() -> Html<&'static str> {
    Html(CHAT_PAGE)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/prompt ============

#[derive(Deserialize)]
struct PromptBody {
    #[serde(default)]
    prompt: Option<Value>,
    #[serde(default)]
    messages: Option<Vec<ChatMessage>>,
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_stream() -> bool {
    true
}

/// Decode and validate a prompt body. The body is parsed by hand so that
/// every malformed shape gets the JSON error contract.
fn parse_prompt_body(body: &[u8]) -> Result<(QueryRequest, bool), AppError> {
    let body: PromptBody = serde_json::from_slice(body)
        .map_err(|e| bad_request(format!("Invalid request body: {}", e)))?;

    let request = match (body.messages, body.prompt) {
        (Some(messages), _) => QueryRequest::from_messages(messages)?,
        (None, Some(Value::String(prompt))) => QueryRequest::from_prompt(&prompt)?,
        (None, _) => return Err(bad_request("Missing or invalid prompt")),
    };
    Ok((request, body.stream))
}

async fn handle_prompt(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    let (request, stream) = parse_prompt_body(&body)?;

    if stream {
        let answer = state.pipeline.answer_stream(&request).await?;
        Ok(Sse::new(answer_events(answer))
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        let answer = state.pipeline.answer(&request).await?;
        Ok(Json(answer).into_response())
    }
}

fn meta_event(question: &str, sources: &[SourceRef]) -> Event {
    Event::default()
        .event("meta")
        .data(json!({ "question": question, "sources": sources }).to_string())
}

fn token_event(text: &str) -> Event {
    Event::default()
        .event("token")
        .data(json!({ "text": text }).to_string())
}

/// SSE events for one streamed answer: `meta`, the `token`s, then `done`
/// or a single `error`.
fn answer_events(answer: AnswerStream) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let meta = meta_event(&answer.question, &answer.sources);

    let body = stream::unfold(Some(answer.fragments), |fragments| async move {
        let mut fragments = fragments?;
        match fragments.next().await {
            Some(Ok(text)) => Some((token_event(&text), Some(fragments))),
            Some(Err(e)) => {
                let event = Event::default()
                    .event("error")
                    .data(json!({ "message": format!("{:#}", e) }).to_string());
                Some((event, None))
            }
            None => {
                tracing::debug!(stage = %QueryStage::Completed);
                Some((Event::default().event("done").data("{}"), None))
            }
        }
    });

    stream::once(futures::future::ready(meta))
        .chain(body)
        .map(Ok)
}
