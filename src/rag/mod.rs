//! Retrieval-augmented pipelines.
//!
//! [`IngestPipeline`] turns text into a stored chunk; [`QueryPipeline`] turns
//! a question (or a chat transcript) into a grounded answer. Both receive
//! their collaborators at construction and hold no per-request state, so one
//! instance serves every request in the process.
pub mod ingest;
pub mod query;

pub use ingest::{IngestOutcome, IngestPipeline, PREVIEW_DIMENSIONS};
pub use query::{Answer, ChatResponse, MessagePart, QueryPipeline, QueryStage, UiMessage};

use crate::context::AssembledContext;

/// Instruction placed ahead of the retrieved context in every prompt.
pub const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Answer the user's question \
using the provided context. If the context does not contain the answer, say honestly that you \
don't know.";

/// Returned instead of a generated answer when retrieval finds nothing.
pub const FALLBACK_ANSWER: &str =
    "Sorry, I could not find any relevant information to answer your question.";

/// Full system prompt for one query.
#[must_use]
pub fn system_prompt(context: &AssembledContext) -> String {
    format!(
        "{SYSTEM_INSTRUCTION}\n\nContext:\n{}",
        context.prompt_text()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NO_CONTEXT;

    #[test]
    fn test_system_prompt_embeds_context() {
        let prompt = system_prompt(&AssembledContext::Context("Paris is in France.".into()));
        assert!(prompt.starts_with(SYSTEM_INSTRUCTION));
        assert!(prompt.ends_with("Context:\nParis is in France."));
    }

    #[test]
    fn test_system_prompt_without_context() {
        let prompt = system_prompt(&AssembledContext::NoContext);
        assert!(prompt.ends_with(NO_CONTEXT));
    }
}
