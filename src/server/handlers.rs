use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::error::ErrorBody;
use crate::db::Metadata;
use crate::db::models::ContextEntry;
use crate::error::{Error, Result};
use crate::rag::{Answer, UiMessage};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AddKnowledgeRequest {
    #[serde(default, alias = "text")]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Serialize)]
pub struct AddKnowledgeResponse {
    pub success: bool,
    pub id: String,
    pub message: &'static str,
    /// First components of the stored embedding.
    pub embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default, rename = "topK")]
    pub top_k: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<UiMessage>,
}

#[derive(Debug, Serialize)]
struct Delta<'a> {
    text: &'a str,
}

pub async fn add_knowledge(
    State(state): State<AppState>,
    body: std::result::Result<Json<AddKnowledgeRequest>, JsonRejection>,
) -> Result<Json<AddKnowledgeResponse>> {
    let Json(req) = body?;
    let content = req
        .content
        .ok_or_else(|| Error::invalid("content is required"))?;

    let outcome = state.ingest.ingest(&content, req.metadata.as_ref()).await?;
    Ok(Json(AddKnowledgeResponse {
        success: true,
        id: outcome.id,
        message: "Knowledge stored",
        embedding: outcome.embedding_preview,
    }))
}

pub async fn ask(
    State(state): State<AppState>,
    body: std::result::Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<Answer>> {
    let Json(req) = body?;
    let question = req
        .question
        .ok_or_else(|| Error::invalid("question is required"))?;
    let top_k = req
        .top_k
        .map(|k| {
            usize::try_from(k).map_err(|_| Error::invalid(format!("topK must be positive, got {k}")))
        })
        .transpose()?;

    Ok(Json(state.query.ask(&question, top_k).await?))
}

/// Streamed chat. Failures before the first fragment are plain JSON errors;
/// later ones arrive as an `error` event that ends the stream.
pub async fn chat_stream(
    State(state): State<AppState>,
    body: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let Json(req) = body?;
    let response = state.query.chat(&req.messages).await?;
    Ok(Sse::new(chat_events(response.context, response.stream)).keep_alive(KeepAlive::default()))
}

fn chat_events(
    context: Vec<ContextEntry>,
    mut fragments: crate::generator::TokenStream,
) -> impl Stream<Item = std::result::Result<Event, axum::Error>> {
    async_stream::stream! {
        let mut failed = false;
        while let Some(item) = fragments.next().await {
            match item {
                Ok(text) => yield Event::default().event("delta").json_data(Delta { text: &text }),
                Err(e) => {
                    yield Event::default().event("error").json_data(ErrorBody::from(&e));
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            yield Event::default().event("context").json_data(&context);
            yield Ok::<_, axum::Error>(Event::default().event("done").data("[DONE]"));
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Result<Json<Value>> {
    let chunks = state.store.count().await?;
    Ok(Json(json!({
        "status": "ok",
        "chunks": chunks,
        "embedding_model": state.config.embedding.model,
        "generation_model": state.query.model_name(),
    })))
}
