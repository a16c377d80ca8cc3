use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use skein_core::error::{Result, SkeinError};
use skein_core::traits::{RawHit, VectorIndex};

use crate::codec::decode_vector;
use crate::embeddings::cosine_distance;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS rag_data (
        key TEXT PRIMARY KEY,
        index_name TEXT NOT NULL,
        content TEXT,
        embedding BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_rag_data_index ON rag_data(index_name);";

fn db_err(e: impl std::fmt::Display) -> SkeinError {
    SkeinError::Database(e.to_string())
}

/// SQLite-backed vector index with brute-force cosine k-NN.
pub struct SqliteVectorIndex {
    conn: Mutex<Connection>,
}

impl SqliteVectorIndex {
    /// Open or create a vector database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Vector store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Raw embedding bytes stored under `key`.
    pub fn embedding_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT embedding FROM rag_data WHERE key = ?1")
            .map_err(db_err)?;
        let mut rows = stmt.query(params![key]).map_err(db_err)?;
        match rows.next().map_err(db_err)? {
            Some(row) => Ok(Some(row.get(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn put(
        &self,
        index: &str,
        key: &str,
        content: &str,
        embedding: &[u8],
    ) -> BoxFuture<'_, Result<()>> {
        let (index, key, content, embedding) = (
            index.to_string(),
            key.to_string(),
            content.to_string(),
            embedding.to_vec(),
        );
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO rag_data (key, index_name, content, embedding) VALUES (?1, ?2, ?3, ?4)",
                params![key, index, content, embedding],
            )
            .map_err(|e| db_err(format!("insert {}: {}", key, e)))?;
            Ok(())
        })
    }

    fn search(&self, index: &str, query: &[f32], k: usize) -> BoxFuture<'_, Result<Vec<RawHit>>> {
        let index = index.to_string();
        let query = query.to_vec();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT key, content, embedding FROM rag_data WHERE index_name = ?1")
                .map_err(|e| SkeinError::Search(e.to_string()))?;

            let rows = stmt
                .query_map(params![index], |row| {
                    let key: String = row.get(0)?;
                    let content: Option<String> = row.get(1)?;
                    let blob: Vec<u8> = row.get(2)?;
                    Ok((key, content, blob))
                })
                .map_err(|e| SkeinError::Search(e.to_string()))?;

            let mut scored: Vec<(f64, String, Option<String>)> = Vec::new();
            for row in rows {
                let (key, content, blob) = match row {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "Skipping unreadable vector row");
                        continue;
                    }
                };
                let score = decode_vector(&blob)
                    .filter(|v| v.len() == query.len())
                    .map(|v| cosine_distance(&query, &v))
                    .filter(|d| d.is_finite());
                let Some(score) = score else {
                    debug!(key = %key, bytes = blob.len(), "Skipping vector with unusable embedding");
                    continue;
                };
                scored.push((score, key, content));
            }

            scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            scored.truncate(k);
            Ok(scored
                .into_iter()
                .map(|(score, key, content)| RawHit {
                    key,
                    content,
                    score: Some(score),
                })
                .collect())
        })
    }

    fn count(&self, index: &str) -> BoxFuture<'_, Result<usize>> {
        let index = index.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM rag_data WHERE index_name = ?1",
                    params![index],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(n as usize)
        })
    }
}
