//! Text generation clients.
//!
//! One conceptual request (system prompt + trimmed conversation) served in
//! two modes: a single blocking completion, or a lazy stream of text
//! fragments that concatenate to the full answer.
pub mod mock;
pub mod openai;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use openai::OpenAiGenerator;

/// Finite, forward-only sequence of answer fragments.
///
/// A failure is delivered as a final `Err` item; after it the stream ends.
/// Dropping the stream early releases the underlying connection.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce the complete answer in one call.
    async fn generate(&self, system_prompt: &str, messages: &[ChatMessage]) -> Result<String>;

    /// Open a stream of answer fragments.
    ///
    /// Errors that happen before the first byte (connection, status) are
    /// returned directly; later ones arrive as the stream's last item.
    async fn generate_stream(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<TokenStream>;

    /// Model identifier used for requests.
    fn model_name(&self) -> &str;
}
