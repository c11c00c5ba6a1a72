use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::{Metadata, VectorStore};
use crate::embedder::Embedder;
use crate::error::{Error, Result};

/// Number of leading embedding components echoed back after an insert.
pub const PREVIEW_DIMENSIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub id: String,
    /// First few components of the stored vector. Diagnostic only.
    pub embedding_preview: Vec<f32>,
    pub dimensions: usize,
}

/// Embed, then store. Nothing is written unless both steps succeed.
#[derive(Clone)]
pub struct IngestPipeline {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl IngestPipeline {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub async fn ingest(&self, content: &str, metadata: Option<&Metadata>) -> Result<IngestOutcome> {
        if content.trim().is_empty() {
            return Err(Error::invalid("content must not be empty"));
        }

        let started = Instant::now();
        let embedding = self
            .embedder
            .embed(content)
            .await
            .inspect_err(|e| warn!("Ingest aborted at embedding: {e}"))?;
        let id = self
            .store
            .insert(content, &embedding, metadata)
            .await
            .inspect_err(|e| warn!("Ingest aborted at storage: {e}"))?;

        info!(
            "Stored chunk {id} ({} chars, {} dims) in {:?}",
            content.chars().count(),
            embedding.len(),
            started.elapsed()
        );

        Ok(IngestOutcome {
            id: id.to_string(),
            embedding_preview: embedding.iter().take(PREVIEW_DIMENSIONS).copied().collect(),
            dimensions: embedding.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, SqliteVectorStore};
    use crate::embedder::mock::MockEmbedder;
    use crate::error::ServiceError;
    use serde_json::json;
    use std::time::Duration;

    fn store(dims: usize) -> Arc<SqliteVectorStore> {
        let db = Db::open_in_memory(dims).unwrap();
        Arc::new(SqliteVectorStore::new(db, 10, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_ingest_stores_chunk() {
        let store = store(8);
        let pipeline = IngestPipeline::new(Arc::new(MockEmbedder::new(8)), store.clone());

        let meta = json!({"source": "doc1"}).as_object().cloned().unwrap();
        let outcome = pipeline
            .ingest("Paris is the capital of France.", Some(&meta))
            .await
            .unwrap();

        assert_eq!(outcome.embedding_preview.len(), PREVIEW_DIMENSIONS);
        assert_eq!(outcome.dimensions, 8);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ingest_short_vector_preview() {
        let pipeline = IngestPipeline::new(Arc::new(MockEmbedder::new(3)), store(3));
        let outcome = pipeline.ingest("tiny", None).await.unwrap();
        assert_eq!(outcome.embedding_preview.len(), 3);
    }

    #[tokio::test]
    async fn test_ingest_empty_content_skips_embedding() {
        let embedder = Arc::new(MockEmbedder::new(8));
        let store = store(8);
        let pipeline = IngestPipeline::new(embedder.clone(), store.clone());

        let err = pipeline.ingest(" \n ", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(embedder.calls(), 0);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_embedding_failure_writes_nothing() {
        let store = store(8);
        let pipeline = IngestPipeline::new(
            Arc::new(MockEmbedder::failing(8, ServiceError::timeout("slow"))),
            store.clone(),
        );

        let err = pipeline.ingest("some text", None).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_dimension_mismatch_is_storage_error() {
        let store = store(8);
        let pipeline = IngestPipeline::new(Arc::new(MockEmbedder::new(4)), store.clone());

        let err = pipeline.ingest("some text", None).await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
