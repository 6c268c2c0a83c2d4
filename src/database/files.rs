//! File catalog operations.

use super::models::{FileRecord, FileStatus};
use super::{now_rfc3339, Database};

/// Parameters for inserting a freshly stored upload.
pub struct NewFile<'a> {
    pub kb_id: i64,
    pub filename: &'a str,
    pub file_type: &'a str,
    pub file_size: i64,
    pub file_hash: &'a str,
    pub storage_path: &'a str,
}

/// Extension trait for file rows: CRUD scoped by KB, hash lookup, and
/// status transitions.
pub trait FileOps {
    fn insert_file(
        &self,
        file: NewFile<'_>,
    ) -> impl std::future::Future<Output = Result<FileRecord, sqlx::Error>> + Send;

    fn get_file(
        &self,
        file_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<FileRecord>, sqlx::Error>> + Send;

    fn get_file_by_hash(
        &self,
        kb_id: i64,
        file_hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<FileRecord>, sqlx::Error>> + Send;

    fn list_files(
        &self,
        kb_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<FileRecord>, sqlx::Error>> + Send;

    /// Map file ids to filenames, for source attribution in search results.
    fn filenames_by_ids(
        &self,
        file_ids: &[i64],
    ) -> impl std::future::Future<Output = Result<std::collections::HashMap<i64, String>, sqlx::Error>> + Send;

    /// Transition a file's status. `Completed` also stamps `processed_at`;
    /// `Error` records the message.
    fn update_file_status(
        &self,
        file_id: i64,
        status: FileStatus,
        error_message: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;

    fn update_file_chunk_count(
        &self,
        file_id: i64,
        chunk_count: i64,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;

    fn delete_file_row(
        &self,
        file_id: i64,
    ) -> impl std::future::Future<Output = Result<bool, sqlx::Error>> + Send;
}

impl FileOps for Database {
    async fn insert_file(&self, file: NewFile<'_>) -> Result<FileRecord, sqlx::Error> {
        let now = now_rfc3339();
        sqlx::query_as::<_, FileRecord>(
            r#"
            INSERT INTO files
                (kb_id, filename, file_type, file_size, file_hash, storage_path, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'uploaded', ?, ?)
            RETURNING *
            "#,
        )
        .bind(file.kb_id)
        .bind(file.filename)
        .bind(file.file_type)
        .bind(file.file_size)
        .bind(file.file_hash)
        .bind(file.storage_path)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await
    }

    async fn get_file(&self, file_id: i64) -> Result<Option<FileRecord>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(self.pool())
            .await
    }

    async fn get_file_by_hash(
        &self,
        kb_id: i64,
        file_hash: &str,
    ) -> Result<Option<FileRecord>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>("SELECT * FROM files WHERE kb_id = ? AND file_hash = ?")
            .bind(kb_id)
            .bind(file_hash)
            .fetch_optional(self.pool())
            .await
    }

    async fn list_files(&self, kb_id: i64) -> Result<Vec<FileRecord>, sqlx::Error> {
        sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files WHERE kb_id = ? ORDER BY created_at DESC",
        )
        .bind(kb_id)
        .fetch_all(self.pool())
        .await
    }

    async fn filenames_by_ids(
        &self,
        file_ids: &[i64],
    ) -> Result<std::collections::HashMap<i64, String>, sqlx::Error> {
        let mut map = std::collections::HashMap::new();
        if file_ids.is_empty() {
            return Ok(map);
        }

        let placeholders = vec!["?"; file_ids.len()].join(",");
        let sql = format!("SELECT id, filename FROM files WHERE id IN ({})", placeholders);
        let mut query = sqlx::query_as::<_, (i64, String)>(&sql);
        for id in file_ids {
            query = query.bind(id);
        }

        for (id, filename) in query.fetch_all(self.pool()).await? {
            map.insert(id, filename);
        }
        Ok(map)
    }

    async fn update_file_status(
        &self,
        file_id: i64,
        status: FileStatus,
        error_message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let now = now_rfc3339();
        if status == FileStatus::Completed {
            sqlx::query(
                "UPDATE files SET status = ?, error_message = ?, processed_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(error_message)
            .bind(&now)
            .bind(&now)
            .bind(file_id)
            .execute(self.pool())
            .await?;
        } else {
            sqlx::query(
                "UPDATE files SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(error_message)
            .bind(&now)
            .bind(file_id)
            .execute(self.pool())
            .await?;
        }

        tracing::debug!(file_id, status = status.as_str(), "file status updated");
        Ok(())
    }

    async fn update_file_chunk_count(
        &self,
        file_id: i64,
        chunk_count: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE files SET chunk_count = ?, updated_at = ? WHERE id = ?")
            .bind(chunk_count)
            .bind(now_rfc3339())
            .bind(file_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn delete_file_row(&self, file_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
