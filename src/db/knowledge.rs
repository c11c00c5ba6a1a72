use super::{Db, deserialize_vector, models::*, serialize_vector};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use tracing::debug;

fn encode_metadata(metadata: Option<&Metadata>) -> Result<Option<String>> {
    metadata
        .map(|m| {
            serde_json::to_string(m)
                .map_err(|e| Error::storage(format!("failed to encode metadata: {e}")))
        })
        .transpose()
}

fn decode_metadata(raw: Option<String>) -> Result<Option<Metadata>> {
    raw.map(|s| {
        serde_json::from_str::<Metadata>(&s)
            .map_err(|e| Error::storage(format!("stored metadata is not a JSON object: {e}")))
    })
    .transpose()
}

impl Db {
    /// Appends a chunk and its embedding in a single transaction.
    ///
    /// Returns the new chunk id. Ids come from an AUTOINCREMENT key and are
    /// never reused, even after a failed insert.
    pub fn insert_chunk(
        &mut self,
        content: &str,
        embedding: &[f32],
        metadata: Option<&Metadata>,
    ) -> Result<i64> {
        self.check_dimensions(embedding, "embedding")?;
        let metadata_json = encode_metadata(metadata)?;
        let created_at = Utc::now();

        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO knowledge_chunks (content, metadata, created_at) VALUES (?, ?, ?)",
            params![content, metadata_json, created_at],
        )?;
        let chunk_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO vec_knowledge (rowid, embedding) VALUES (?, ?)",
            params![chunk_id, serialize_vector(embedding)],
        )?;

        tx.commit()?;
        debug!("Inserted knowledge chunk {chunk_id} ({} chars)", content.len());
        Ok(chunk_id)
    }

    /// Nearest-neighbour search by cosine distance.
    ///
    /// Results are ordered by ascending distance; equal distances fall back
    /// to ascending id so the order is stable for a given store state. Rows
    /// whose distance is undefined (a zero stored vector) never match.
    pub fn search(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<RetrievedChunk>> {
        self.check_dimensions(query_vector, "query vector")?;

        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, content, metadata, created_at, distance
            FROM (
                SELECT
                    c.id,
                    c.content,
                    c.metadata,
                    c.created_at,
                    vec_distance_cosine(v.embedding, ?) AS distance
                FROM vec_knowledge v
                JOIN knowledge_chunks c ON v.rowid = c.id
            )
            WHERE distance IS NOT NULL
            ORDER BY distance ASC, id ASC
            LIMIT ?
            "#,
        )?;

        let rows = stmt.query_map(
            params![serialize_vector(query_vector), top_k as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            },
        )?;

        let mut results = Vec::new();
        for row in rows {
            let (id, content, metadata, created_at, distance) = row?;
            results.push(RetrievedChunk {
                id,
                content,
                metadata: decode_metadata(metadata)?,
                created_at,
                similarity: 1.0 - distance,
            });
        }

        debug!("Vector search returned {} of top {top_k}", results.len());
        Ok(results)
    }

    /// Fetch a stored chunk, embedding included.
    pub fn get_chunk(&self, id: i64) -> Result<Option<KnowledgeChunk>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT c.content, c.metadata, c.created_at, v.embedding
                FROM knowledge_chunks c
                JOIN vec_knowledge v ON v.rowid = c.id
                WHERE c.id = ?
                "#,
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, DateTime<Utc>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(content, metadata, created_at, blob)| {
            Ok(KnowledgeChunk {
                id,
                content,
                embedding: deserialize_vector(&blob),
                metadata: decode_metadata(metadata)?,
                created_at,
            })
        })
        .transpose()
    }

    /// Number of stored chunks.
    pub fn count_chunks(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM knowledge_chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
