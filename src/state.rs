//! Process-wide services, built once and shared by every transport.
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::db::{Db, SqliteVectorStore, VectorStore};
use crate::embedder::{Embedder, RemoteEmbedder};
use crate::error::{Error, Result};
use crate::generator::{Generator, OpenAiGenerator};
use crate::rag::{IngestPipeline, QueryPipeline};

/// Shared application context handed to HTTP handlers and MCP tools.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn VectorStore>,
    pub ingest: IngestPipeline,
    pub query: QueryPipeline,
}

impl AppState {
    /// Wire pipelines around already constructed components.
    ///
    /// Refuses an embedder whose vectors the store could never hold.
    pub fn new(
        config: Arc<Config>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        if embedder.dimensions() != store.dimensions() {
            return Err(Error::storage(format!(
                "embedder produces {}-dimensional vectors, store holds {}",
                embedder.dimensions(),
                store.dimensions()
            )));
        }

        let ingest = IngestPipeline::new(embedder.clone(), store.clone());
        let query = QueryPipeline::new(embedder, store.clone(), generator, &config.retrieval);
        Ok(Self {
            config,
            store,
            ingest,
            query,
        })
    }

    /// Open the store and build the remote clients described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let db = Db::open(&config.db_path, config.embedding.dimensions)?;
        let store = SqliteVectorStore::new(
            db,
            config.retrieval.max_top_k,
            config.retrieval.store_timeout(),
        );
        let embedder = RemoteEmbedder::from_config(&config.embedding)?;
        let generator = OpenAiGenerator::from_config(&config.generation)?;

        info!(
            "Using embedding model {} ({} dims) and generation model {}",
            config.embedding.model, config.embedding.dimensions, config.generation.model
        );

        Self::new(
            Arc::new(config),
            Arc::new(embedder),
            Arc::new(store),
            Arc::new(generator),
        )
    }
}
