//! Conversation and message catalog operations.
//!
//! Appending a message inserts the row and bumps the conversation's counter
//! and timestamp in the same transaction, so `message_count` always equals
//! the number of message rows.

use super::models::{ConversationRecord, MessageRecord};
use super::{now_rfc3339, Database};

/// Extension trait for conversations and their messages.
pub trait ConversationOps {
    fn create_conversation(
        &self,
        assistant_id: i64,
        title: &str,
    ) -> impl std::future::Future<Output = Result<ConversationRecord, sqlx::Error>> + Send;

    fn get_conversation(
        &self,
        conversation_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<ConversationRecord>, sqlx::Error>> + Send;

    fn list_conversations(
        &self,
        assistant_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationRecord>, sqlx::Error>> + Send;

    /// Delete a conversation and its messages in one transaction.
    fn delete_conversation(
        &self,
        conversation_id: i64,
    ) -> impl std::future::Future<Output = Result<bool, sqlx::Error>> + Send;

    /// Insert one message and increment the conversation counter atomically.
    fn append_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
        sources: Option<&str>,
    ) -> impl std::future::Future<Output = Result<MessageRecord, sqlx::Error>> + Send;

    /// The most recent `limit` messages, newest first.
    fn recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<MessageRecord>, sqlx::Error>> + Send;

    /// All messages in chronological order.
    fn list_messages(
        &self,
        conversation_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<MessageRecord>, sqlx::Error>> + Send;
}

impl ConversationOps for Database {
    async fn create_conversation(
        &self,
        assistant_id: i64,
        title: &str,
    ) -> Result<ConversationRecord, sqlx::Error> {
        let now = now_rfc3339();
        sqlx::query_as::<_, ConversationRecord>(
            r#"
            INSERT INTO conversations (assistant_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(assistant_id)
        .bind(title)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await
    }

    async fn get_conversation(
        &self,
        conversation_id: i64,
    ) -> Result<Option<ConversationRecord>, sqlx::Error> {
        sqlx::query_as::<_, ConversationRecord>("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(self.pool())
            .await
    }

    async fn list_conversations(
        &self,
        assistant_id: i64,
    ) -> Result<Vec<ConversationRecord>, sqlx::Error> {
        sqlx::query_as::<_, ConversationRecord>(
            "SELECT * FROM conversations WHERE assistant_id = ? ORDER BY updated_at DESC",
        )
        .bind(assistant_id)
        .fetch_all(self.pool())
        .await
    }

    async fn delete_conversation(&self, conversation_id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
        sources: Option<&str>,
    ) -> Result<MessageRecord, sqlx::Error> {
        let now = now_rfc3339();
        let mut tx = self.pool().begin().await?;

        let message = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (conversation_id, role, content, sources, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(sources)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET message_count = message_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>, sqlx::Error> {
        sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<MessageRecord>, sqlx::Error> {
        sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await
    }
}
