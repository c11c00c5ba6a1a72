//! Vector store backed by SQLite and sqlite-vec
use rusqlite::{Connection, OptionalExtension, params};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use std::time::Instant;
use tracing::info;

use crate::error::{Error, Result};

pub mod knowledge;
pub mod models;
pub mod store;

pub use models::{KnowledgeChunk, Metadata, RetrievedChunk};
pub use store::{SqliteVectorStore, VectorStore};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS knowledge_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    metadata TEXT,
    created_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS store_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// SQLite VM steps between deadline checks.
const DEADLINE_CHECK_STEPS: i32 = 100;

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// A SQLite connection initialized with sqlite-vec and the knowledge schema.
///
/// The embedding dimension is fixed when the store is first created and
/// recorded in `store_info`; reopening with another dimension is refused.
pub struct Db {
    pub(crate) conn: Connection,
    dimensions: usize,
}

impl Db {
    /// Open a database at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing knowledge store: {}", path.display());

        init_sqlite_vec();
        let conn = Connection::open(path)?;
        Self::init(conn, dimensions)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory(dimensions: usize) -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::init(conn, dimensions)
    }

    fn init(conn: Connection, dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(Error::storage("embedding dimension must be positive"));
        }

        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {}", vec_version);

        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM store_info WHERE key = 'dimensions'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(value) => {
                let existing: usize = value.parse().map_err(|_| {
                    Error::storage(format!("corrupt dimension record in store: {value:?}"))
                })?;
                if existing != dimensions {
                    return Err(Error::storage(format!(
                        "store was created with {existing}-dimensional embeddings, \
                         configured model produces {dimensions}"
                    )));
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO store_info (key, value) VALUES ('dimensions', ?)",
                    params![dimensions.to_string()],
                )?;
            }
        }

        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vec_knowledge USING vec0(embedding FLOAT[{dimensions}]);"
        ))?;

        info!("Knowledge store ready ({dimensions} dimensions)");

        Ok(Self { conn, dimensions })
    }

    /// Embedding dimension every stored and query vector must have.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Refuse vectors cosine distance is undefined for, and wrong lengths.
    pub(crate) fn check_dimensions(&self, vector: &[f32], what: &str) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::storage(format!(
                "{what} has {} dimensions, store expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        if let Some(defect) = vector_defect(vector) {
            return Err(Error::storage(format!("{what} {defect}")));
        }
        Ok(())
    }

    /// Run `op` with SQLite interrupting any statement still executing at
    /// `deadline`. An interrupted write rolls back with its transaction.
    pub fn run_with_deadline<T>(
        &mut self,
        deadline: Instant,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.conn.progress_handler(
            DEADLINE_CHECK_STEPS,
            Some(move || Instant::now() >= deadline),
        );
        let result = op(self);
        self.conn.progress_handler(DEADLINE_CHECK_STEPS, None::<fn() -> bool>);
        result
    }
}

/// Why a vector cannot take part in cosine search, if it cannot.
pub fn vector_defect(vector: &[f32]) -> Option<&'static str> {
    if vector.iter().any(|v| !v.is_finite()) {
        return Some("contains non-finite values");
    }
    if vector.iter().all(|v| *v == 0.0) {
        return Some("has zero norm");
    }
    None
}

/// Serialize a float32 vector into the little-endian blob vec0 expects.
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`serialize_vector`]. Trailing bytes that do not form a full
/// float are ignored.
pub fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_init() {
        let db = Db::open_in_memory(8).expect("Failed to open in-memory DB");

        let tables: usize = db
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('knowledge_chunks', 'store_info', 'vec_knowledge');",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
        assert_eq!(db.dimensions(), 8);
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(matches!(
            Db::open_in_memory(0),
            Err(Error::Storage { .. })
        ));
    }

    #[test]
    fn test_reopen_with_other_dimensions_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.db");

        {
            let _db = Db::open(&path, 4).unwrap();
        }
        // Same dimension reopens fine
        assert!(Db::open(&path, 4).is_ok());

        let err = Db::open(&path, 5).err().expect("dimension change must fail");
        assert!(err.to_string().contains("4-dimensional"));
    }

    #[test]
    fn test_serialize_vector() {
        let vec = vec![1.0, 2.0, -3.5];
        let bytes = serialize_vector(&vec);
        assert_eq!(bytes.len(), 12);

        // 1.0f32 in hex: 0x3f800000 -> little endian: 00 00 80 3f
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x3f]);
        // -3.5f32 in hex: 0xc0600000 -> little endian: 00 00 60 c0
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x60, 0xc0]);

        assert_eq!(deserialize_vector(&bytes), vec);
    }

    #[test]
    fn test_vector_defect() {
        assert_eq!(vector_defect(&[0.0, 0.0]), Some("has zero norm"));
        assert_eq!(vector_defect(&[1.0, f32::NAN]), Some("contains non-finite values"));
        assert_eq!(vector_defect(&[f32::INFINITY, 0.0]), Some("contains non-finite values"));
        assert_eq!(vector_defect(&[0.0, -0.5]), None);
    }

    #[test]
    fn test_check_dimensions_rejects_degenerate_vectors() {
        let db = Db::open_in_memory(2).unwrap();
        assert!(db.check_dimensions(&[0.6, 0.8], "query vector").is_ok());

        let err = db.check_dimensions(&[0.0, 0.0], "query vector").unwrap_err();
        assert!(matches!(err, Error::Storage { timed_out: false, .. }));
        assert!(err.to_string().contains("zero norm"));

        let err = db.check_dimensions(&[f32::NAN, 1.0], "embedding").unwrap_err();
        assert!(err.to_string().contains("non-finite"));
    }

    #[test]
    fn test_expired_deadline_interrupts_statement() {
        let mut db = Db::open_in_memory(2).unwrap();
        let err = db
            .run_with_deadline(Instant::now(), |db| {
                let total: i64 = db.conn.query_row(
                    "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 100000) \
                     SELECT sum(i) FROM n",
                    [],
                    |row| row.get(0),
                )?;
                Ok(total)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Storage { timed_out: true, .. }));

        // The handler is gone once the call returns
        let total: i64 = db
            .conn
            .query_row(
                "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 1000) \
                 SELECT sum(i) FROM n",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(total, 500_500);
    }

    #[test]
    fn test_distant_deadline_lets_work_finish() {
        let mut db = Db::open_in_memory(2).unwrap();
        let deadline = Instant::now() + std::time::Duration::from_secs(30);
        let count = db.run_with_deadline(deadline, |db| db.count_chunks()).unwrap();
        assert_eq!(count, 0);
    }
}
