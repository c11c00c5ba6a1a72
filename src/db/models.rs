use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied key-value data stored beside a chunk. Opaque to retrieval.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A stored unit of knowledge. Immutable once inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeChunk {
    pub id: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
}

/// A chunk matched by one query, with its similarity to that query vector.
///
/// The embedding itself is not carried: callers only need provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub id: i64,
    pub content: String,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    /// `1 - cosine_distance`
    pub similarity: f64,
}

/// Wire form of a retrieved chunk, as returned to callers in `context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub content: String,
    pub similarity: f64,
    pub metadata: Option<Metadata>,
}

impl From<&RetrievedChunk> for ContextEntry {
    fn from(chunk: &RetrievedChunk) -> Self {
        Self {
            id: chunk.id.to_string(),
            content: chunk.content.clone(),
            similarity: chunk.similarity,
            metadata: chunk.metadata.clone(),
        }
    }
}
