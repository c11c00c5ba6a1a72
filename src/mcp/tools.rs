//! MCP Tool handlers.
//!
//! 1. add_knowledge    – embed and store a piece of text
//! 2. ask              – grounded answer with its supporting context
//! 3. search_knowledge – retrieval only, no generation
use crate::db::Metadata;
use crate::db::models::ContextEntry;
use crate::error::Error;
use crate::state::AppState;
use rmcp::handler::server::ServerHandler;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{ErrorData as McpError, handler::server::tool::ToolRouter, model::*, tool, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;

// ── Parameter structs ────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct AddKnowledgeParams {
    /// Text to store
    content: String,
    /// Optional key-value metadata returned with search results (e.g. {"source": "doc1"})
    metadata: Option<Metadata>,
}

#[derive(Deserialize, JsonSchema)]
struct AskParams {
    /// Question in natural language
    question: String,
    /// Number of chunks to ground the answer on (default: 3, max: 10)
    top_k: Option<usize>,
}

#[derive(Deserialize, JsonSchema)]
struct SearchParams {
    /// Search query (natural language)
    query: String,
    /// Max results (default: 3, max: 10)
    top_k: Option<usize>,
}

// ── Response helpers ─────────────────────────────────────────────────

fn json_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(&value).unwrap_or_default(),
    )]))
}

fn error_result(msg: &str) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.to_string())]))
}

/// Caller mistakes become tool errors; service failures become protocol errors.
fn failure(err: Error) -> Result<CallToolResult, McpError> {
    match err {
        Error::InvalidInput(msg) => error_result(&msg),
        other => Err(McpError::internal_error(
            other.to_string(),
            Some(serde_json::json!({
                "kind": other.kind(),
                "retryable": other.is_retryable(),
            })),
        )),
    }
}

// ── Tool implementations ─────────────────────────────────────────────

#[derive(Clone)]
pub struct AppTools {
    pub state: AppState,
    pub tool_router: ToolRouter<Self>,
}

impl ServerHandler for AppTools {}

#[tool_router]
impl AppTools {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Add a piece of knowledge to the store so later questions can be answered from it")]
    async fn add_knowledge(
        &self,
        params: Parameters<AddKnowledgeParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        match self.state.ingest.ingest(&p.content, p.metadata.as_ref()).await {
            Ok(outcome) => json_result(serde_json::json!({
                "success": true,
                "id": outcome.id,
                "dimensions": outcome.dimensions,
                "embedding_preview": outcome.embedding_preview,
            })),
            Err(e) => failure(e),
        }
    }

    #[tool(description = "Answer a question using the stored knowledge. Returns the answer and the context chunks it was based on.")]
    async fn ask(&self, params: Parameters<AskParams>) -> Result<CallToolResult, McpError> {
        let p = params.0;
        match self.state.query.ask(&p.question, p.top_k).await {
            Ok(answer) => json_result(serde_json::to_value(&answer).unwrap_or_default()),
            Err(e) => failure(e),
        }
    }

    #[tool(description = "Natural language vector search over stored knowledge, without generating an answer")]
    async fn search_knowledge(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        if p.query.is_empty() {
            return error_result("query is required");
        }

        match self.state.query.search(&p.query, p.top_k).await {
            Ok(chunks) => {
                let results: Vec<ContextEntry> = chunks.iter().map(ContextEntry::from).collect();
                json_result(serde_json::json!({ "results": results }))
            }
            Err(e) => failure(e),
        }
    }
}
