//! Mock embedder for testing and offline use.
//!
//! Generates deterministic embeddings based on a text hash.
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Embedder, validate_text};
use crate::error::{Error, Result, ServiceError};

/// A mock embedder that produces deterministic vectors from text hashes.
///
/// Counts calls so tests can assert that a pipeline never reached the
/// embedding step.
pub struct MockEmbedder {
    pub dimensions: usize,
    calls: AtomicUsize,
    failure: Option<ServiceError>,
    fixed: HashMap<String, Vec<f32>>,
}

impl MockEmbedder {
    /// Create a new `MockEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicUsize::new(0),
            failure: None,
            fixed: HashMap::new(),
        }
    }

    /// Return `vector` verbatim whenever `text` is embedded.
    #[must_use]
    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.fixed.insert(text.into(), vector);
        self
    }

    /// A mock whose every call fails with `failure`.
    #[must_use]
    pub fn failing(dimensions: usize, failure: ServiceError) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(dimensions)
        }
    }

    /// Number of `embed` calls made so far, valid or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        validate_text(text)?;
        if let Some(failure) = &self.failure {
            return Err(Error::Embedding(failure.clone()));
        }
        if let Some(vector) = self.fixed.get(text) {
            return Ok(vector.clone());
        }

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let hash = hasher.finish();

        // Use the hash bytes to seed deterministic float values
        let bytes = hash.to_le_bytes();
        let mut embedding = Vec::with_capacity(self.dimensions);
        for i in 0..self.dimensions {
            embedding.push((bytes[i % 8] as f32 + 1.0) / 256.0);
        }

        // L2 normalize
        let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
        if norm_sq > 0.0 {
            let inv = 1.0 / norm_sq.sqrt();
            for v in &mut embedding {
                *v *= inv;
            }
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
