//! Knowledge base catalog operations.

use sqlx::Row;

use super::models::KnowledgeBaseRecord;
use super::{now_rfc3339, Database};

/// Extension trait for knowledge-base CRUD and stat roll-ups.
pub trait KnowledgeBaseOps {
    fn create_knowledge_base(
        &self,
        name: &str,
        description: Option<&str>,
        embedding_model: &str,
        embedding_provider: &str,
    ) -> impl std::future::Future<Output = Result<KnowledgeBaseRecord, sqlx::Error>> + Send;

    fn get_knowledge_base(
        &self,
        kb_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<KnowledgeBaseRecord>, sqlx::Error>> + Send;

    fn get_knowledge_base_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<KnowledgeBaseRecord>, sqlx::Error>> + Send;

    fn list_knowledge_bases(
        &self,
        limit: i64,
        offset: i64,
    ) -> impl std::future::Future<Output = Result<Vec<KnowledgeBaseRecord>, sqlx::Error>> + Send;

    /// Recompute file_count and chunk_count from persisted rows; only
    /// completed files contribute. Runs in one transaction and returns the
    /// new (file_count, chunk_count).
    fn update_kb_stats(
        &self,
        kb_id: i64,
    ) -> impl std::future::Future<Output = Result<(i64, i64), sqlx::Error>> + Send;

    /// Delete the KB row together with its file and chunk rows, in one
    /// transaction. The vector collection, graph scope, and upload directory
    /// are owned by other services.
    fn delete_knowledge_base_rows(
        &self,
        kb_id: i64,
    ) -> impl std::future::Future<Output = Result<bool, sqlx::Error>> + Send;
}

impl KnowledgeBaseOps for Database {
    async fn create_knowledge_base(
        &self,
        name: &str,
        description: Option<&str>,
        embedding_model: &str,
        embedding_provider: &str,
    ) -> Result<KnowledgeBaseRecord, sqlx::Error> {
        let now = now_rfc3339();
        let row = sqlx::query_as::<_, KnowledgeBaseRecord>(
            r#"
            INSERT INTO knowledge_bases
                (name, description, embedding_model, embedding_provider, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'ready', ?, ?)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(embedding_model)
        .bind(embedding_provider)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await?;

        tracing::info!(kb_id = row.id, name, embedding_provider, "knowledge base created");
        Ok(row)
    }

    async fn get_knowledge_base(
        &self,
        kb_id: i64,
    ) -> Result<Option<KnowledgeBaseRecord>, sqlx::Error> {
        sqlx::query_as::<_, KnowledgeBaseRecord>("SELECT * FROM knowledge_bases WHERE id = ?")
            .bind(kb_id)
            .fetch_optional(self.pool())
            .await
    }

    async fn get_knowledge_base_by_name(
        &self,
        name: &str,
    ) -> Result<Option<KnowledgeBaseRecord>, sqlx::Error> {
        sqlx::query_as::<_, KnowledgeBaseRecord>("SELECT * FROM knowledge_bases WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
    }

    async fn list_knowledge_bases(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<KnowledgeBaseRecord>, sqlx::Error> {
        sqlx::query_as::<_, KnowledgeBaseRecord>(
            "SELECT * FROM knowledge_bases ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
    }

    async fn update_kb_stats(&self, kb_id: i64) -> Result<(i64, i64), sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as file_count, COALESCE(SUM(chunk_count), 0) as chunk_count
            FROM files
            WHERE kb_id = ? AND status = 'completed'
            "#,
        )
        .bind(kb_id)
        .fetch_one(&mut *tx)
        .await?;

        let file_count: i64 = row.try_get("file_count")?;
        let chunk_count: i64 = row.try_get("chunk_count")?;

        sqlx::query(
            "UPDATE knowledge_bases SET file_count = ?, chunk_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(file_count)
        .bind(chunk_count)
        .bind(now_rfc3339())
        .bind(kb_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(kb_id, file_count, chunk_count, "knowledge base stats updated");
        Ok((file_count, chunk_count))
    }

    async fn delete_knowledge_base_rows(&self, kb_id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM text_chunks WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM knowledge_bases WHERE id = ?")
            .bind(kb_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
