//! Chunk catalog operations.
//!
//! Chunk rows are inserted only after the corresponding vectors are in the
//! vector store, so a row's `vector_id` always has a live vector while the
//! row exists.

use super::models::ChunkRecord;
use super::{now_rfc3339, Database};

/// A chunk pending insertion.
pub struct NewChunk {
    pub kb_id: i64,
    pub file_id: i64,
    pub chunk_index: i64,
    pub content: String,
    pub vector_id: String,
}

/// Extension trait for chunk rows.
pub trait ChunkOps {
    /// Bulk-insert chunk rows in one transaction.
    fn insert_chunks(
        &self,
        chunks: &[NewChunk],
    ) -> impl std::future::Future<Output = Result<usize, sqlx::Error>> + Send;

    fn list_chunks_by_file(
        &self,
        file_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ChunkRecord>, sqlx::Error>> + Send;

    fn list_chunks_by_kb(
        &self,
        kb_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ChunkRecord>, sqlx::Error>> + Send;

    /// Vector-store ids of all chunks belonging to a file, for vector
    /// cleanup before the rows go away.
    fn vector_ids_by_file(
        &self,
        file_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<String>, sqlx::Error>> + Send;

    fn count_chunks_by_file(
        &self,
        file_id: i64,
    ) -> impl std::future::Future<Output = Result<i64, sqlx::Error>> + Send;

    fn delete_chunks_by_file(
        &self,
        file_id: i64,
    ) -> impl std::future::Future<Output = Result<u64, sqlx::Error>> + Send;
}

impl ChunkOps for Database {
    async fn insert_chunks(&self, chunks: &[NewChunk]) -> Result<usize, sqlx::Error> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let now = now_rfc3339();
        let mut tx = self.pool().begin().await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO text_chunks (kb_id, file_id, chunk_index, content, vector_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(chunk.kb_id)
            .bind(chunk.file_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.vector_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(count = chunks.len(), "chunk rows inserted");
        Ok(chunks.len())
    }

    async fn list_chunks_by_file(&self, file_id: i64) -> Result<Vec<ChunkRecord>, sqlx::Error> {
        sqlx::query_as::<_, ChunkRecord>(
            "SELECT * FROM text_chunks WHERE file_id = ? ORDER BY chunk_index ASC",
        )
        .bind(file_id)
        .fetch_all(self.pool())
        .await
    }

    async fn list_chunks_by_kb(&self, kb_id: i64) -> Result<Vec<ChunkRecord>, sqlx::Error> {
        sqlx::query_as::<_, ChunkRecord>(
            "SELECT * FROM text_chunks WHERE kb_id = ? ORDER BY file_id ASC, chunk_index ASC",
        )
        .bind(kb_id)
        .fetch_all(self.pool())
        .await
    }

    async fn vector_ids_by_file(&self, file_id: i64) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT vector_id FROM text_chunks WHERE file_id = ? ORDER BY chunk_index ASC",
        )
        .bind(file_id)
        .fetch_all(self.pool())
        .await
    }

    async fn count_chunks_by_file(&self, file_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM text_chunks WHERE file_id = ?")
            .bind(file_id)
            .fetch_one(self.pool())
            .await
    }

    async fn delete_chunks_by_file(&self, file_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM text_chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
