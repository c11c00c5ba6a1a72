//! Context assembly: retrieved chunks in, one prompt-context string out.
//!
//! Order is whatever the store returned (most similar first); nothing here
//! re-sorts. An empty retrieval is reported as [`AssembledContext::NoContext`],
//! never as an empty string, so "nothing found" and "found a chunk with
//! empty content" stay distinguishable.
use crate::db::RetrievedChunk;

/// Joins chunk contents.
pub const SEPARATOR: &str = "\n\n";

/// Prompt text standing in for a missing context.
pub const NO_CONTEXT: &str = "No relevant context was found.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembledContext {
    NoContext,
    Context(String),
}

impl AssembledContext {
    #[must_use]
    pub fn is_no_context(&self) -> bool {
        matches!(self, Self::NoContext)
    }

    /// Text to embed in a prompt; [`NO_CONTEXT`] when nothing was retrieved.
    #[must_use]
    pub fn prompt_text(&self) -> &str {
        match self {
            Self::NoContext => NO_CONTEXT,
            Self::Context(text) => text,
        }
    }
}

/// Result of assembling under an optional budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    pub context: AssembledContext,
    /// How many leading chunks made it into `context`.
    pub used: usize,
}

/// Assemble every chunk, unbounded.
#[must_use]
pub fn assemble(chunks: &[RetrievedChunk]) -> AssembledContext {
    ContextAssembler::default().assemble(chunks).context
}

/// Assembler with an optional character budget.
///
/// Under a budget, whole chunks are kept in order until the next one would
/// overflow it. The first chunk is always kept, even if it alone is larger
/// than the budget, so a non-empty retrieval never assembles to nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextAssembler {
    max_chars: Option<usize>,
}

impl ContextAssembler {
    #[must_use]
    pub fn new(max_chars: Option<usize>) -> Self {
        Self { max_chars }
    }

    #[must_use]
    pub fn assemble(&self, chunks: &[RetrievedChunk]) -> Assembly {
        if chunks.is_empty() {
            return Assembly {
                context: AssembledContext::NoContext,
                used: 0,
            };
        }

        let sep_len = SEPARATOR.chars().count();
        let mut parts: Vec<&str> = Vec::with_capacity(chunks.len());
        let mut total = 0usize;

        for chunk in chunks {
            let len = chunk.content.chars().count();
            let added = if parts.is_empty() { len } else { len + sep_len };
            if let Some(max) = self.max_chars {
                if !parts.is_empty() && total + added > max {
                    break;
                }
            }
            parts.push(&chunk.content);
            total += added;
        }

        Assembly {
            used: parts.len(),
            context: AssembledContext::Context(parts.join(SEPARATOR)),
        }
    }
}
