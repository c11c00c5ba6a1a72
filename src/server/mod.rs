//! HTTP transport.
//!
//! | Route | Body | Response |
//! |---|---|---|
//! | `POST /api/knowledge-chunk` | `{content, metadata?}` | `{success, id, message, embedding}` |
//! | `POST /api/chat` | `{question, topK?}` | `{answer, context}` |
//! | `POST /api/chat/stream` | `{messages}` | SSE: `delta`*, `context`, `done` (or `error`) |
//! | `GET /api/health` | | `{status, chunks}` |
pub mod error;
pub mod handlers;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tracing::info;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/knowledge-chunk", post(handlers::add_knowledge))
        .route("/api/chat", post(handlers::ask))
        .route("/api/chat/stream", post(handlers::chat_stream))
        .route("/api/health", get(handlers::health))
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}
