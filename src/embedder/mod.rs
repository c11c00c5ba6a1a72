//! Embedder trait and shared helpers for turning text into vectors.
pub mod mock;
pub mod remote;

use async_trait::async_trait;

use crate::error::{Error, Result};

pub use remote::RemoteEmbedder;

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`. Every call embeds exactly one text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text into a vector of exactly [`Embedder::dimensions`] floats.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;
}

/// Reject text that is empty after trimming.
pub fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::invalid("text to embed must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_text() {
        assert!(validate_text("hello").is_ok());
        assert!(matches!(validate_text(""), Err(Error::InvalidInput(_))));
        assert!(matches!(validate_text(" \n\t "), Err(Error::InvalidInput(_))));
    }
}
