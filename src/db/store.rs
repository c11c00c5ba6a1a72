//! Shared, bounded access to the knowledge store.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Instant;
use tracing::warn;

use super::{Db, Metadata, RetrievedChunk};
use crate::error::{Error, Result};

/// Persistence contract the pipelines depend on.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Append an immutable chunk and return its id.
    async fn insert(
        &self,
        content: &str,
        embedding: &[f32],
        metadata: Option<&Metadata>,
    ) -> Result<i64>;

    /// Up to `top_k` chunks nearest to `query_vector`, most similar first.
    async fn search(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<RetrievedChunk>>;

    /// Number of stored chunks.
    async fn count(&self) -> Result<usize>;

    /// Length every stored and query vector must have.
    fn dimensions(&self) -> usize;

    /// Largest `top_k` a search accepts.
    fn max_top_k(&self) -> usize;
}

/// Reject `top_k` outside `1..=max`.
pub fn check_top_k(top_k: usize, max: usize) -> Result<()> {
    if top_k == 0 || top_k > max {
        return Err(Error::invalid(format!(
            "topK must be between 1 and {max}, got {top_k}"
        )));
    }
    Ok(())
}

/// [`VectorStore`] over one process-wide [`Db`] handle.
///
/// The connection sits behind an async mutex, so a search never sees an
/// insert half-way through its transaction. Every call is bounded by
/// `timeout`: the lock wait counts against it, and SQLite interrupts any
/// statement still running when it expires.
#[derive(Clone)]
pub struct SqliteVectorStore {
    db: Arc<TokioMutex<Db>>,
    dimensions: usize,
    max_top_k: usize,
    timeout: Duration,
}

impl SqliteVectorStore {
    pub fn new(db: Db, max_top_k: usize, timeout: Duration) -> Self {
        Self {
            dimensions: db.dimensions(),
            db: Arc::new(TokioMutex::new(db)),
            max_top_k,
            timeout,
        }
    }

    /// Run `work` on a blocking thread, under the lock and within `timeout`.
    async fn bounded<T, F>(&self, op: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Db) -> Result<T> + Send + 'static,
    {
        let deadline = Instant::now() + self.timeout;
        let mut db = tokio::time::timeout_at(deadline, self.db.clone().lock_owned())
            .await
            .map_err(|_| Error::Storage {
                message: format!("{op} timed out after {:?} waiting for the store", self.timeout),
                timed_out: true,
            })?;

        tokio::task::spawn_blocking(move || db.run_with_deadline(deadline.into_std(), work))
            .await
            .map_err(|e| Error::storage(format!("{op} task failed: {e}")))?
            .inspect_err(|e| {
                if e.is_retryable() {
                    warn!("Store {op} interrupted after {:?}", self.timeout);
                }
            })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn insert(
        &self,
        content: &str,
        embedding: &[f32],
        metadata: Option<&Metadata>,
    ) -> Result<i64> {
        let content = content.to_owned();
        let embedding = embedding.to_vec();
        let metadata = metadata.cloned();
        self.bounded("insert", move |db| {
            db.insert_chunk(&content, &embedding, metadata.as_ref())
        })
        .await
    }

    async fn search(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<RetrievedChunk>> {
        check_top_k(top_k, self.max_top_k)?;
        let query_vector = query_vector.to_vec();
        self.bounded("search", move |db| db.search(&query_vector, top_k))
            .await
    }

    async fn count(&self) -> Result<usize> {
        self.bounded("count", |db| db.count_chunks()).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_top_k(&self) -> usize {
        self.max_top_k
    }
}
