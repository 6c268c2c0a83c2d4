//! Assistant catalog operations.
//!
//! An assistant holds weak references (by id) to its bound knowledge bases.
//! Binding is rejected when the bound KBs disagree on embedding
//! configuration, since a single query vector must serve all of them.

use super::models::{kb_ids_to_string, AssistantRecord, KnowledgeBaseRecord};
use super::{now_rfc3339, CatalogError, Database, KnowledgeBaseOps, Result};

/// Parameters for creating an assistant.
pub struct NewAssistant<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub kb_ids: &'a [i64],
    pub llm_model: &'a str,
    pub llm_provider: &'a str,
    pub system_prompt: Option<&'a str>,
}

/// Extension trait for assistant CRUD.
pub trait AssistantOps {
    fn create_assistant(
        &self,
        assistant: NewAssistant<'_>,
    ) -> impl std::future::Future<Output = Result<AssistantRecord>> + Send;

    fn get_assistant(
        &self,
        assistant_id: i64,
    ) -> impl std::future::Future<Output = Result<Option<AssistantRecord>>> + Send;

    fn list_assistants(&self)
        -> impl std::future::Future<Output = Result<Vec<AssistantRecord>>> + Send;

    /// Rebind the assistant's KB list, re-running the consistency check.
    fn update_assistant_kbs(
        &self,
        assistant_id: i64,
        kb_ids: &[i64],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Delete the assistant and purge its conversations and messages in one
    /// transaction.
    fn delete_assistant(
        &self,
        assistant_id: i64,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Validate that all `kb_ids` exist and share one embedding
    /// configuration; returns that configuration, or None for an empty list.
    fn check_embedding_consistency(
        &self,
        kb_ids: &[i64],
    ) -> impl std::future::Future<Output = Result<Option<(String, String)>>> + Send;
}

async fn resolve_kbs(db: &Database, kb_ids: &[i64]) -> Result<Vec<KnowledgeBaseRecord>> {
    let mut kbs = Vec::with_capacity(kb_ids.len());
    for kb_id in kb_ids {
        let kb = db
            .get_knowledge_base(*kb_id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("knowledge base {}", kb_id)))?;
        kbs.push(kb);
    }
    Ok(kbs)
}

impl AssistantOps for Database {
    async fn create_assistant(&self, assistant: NewAssistant<'_>) -> Result<AssistantRecord> {
        let config = self.check_embedding_consistency(assistant.kb_ids).await?;
        let embedding_model = config.map(|(_, model)| model);

        let now = now_rfc3339();
        let row = sqlx::query_as::<_, AssistantRecord>(
            r#"
            INSERT INTO assistants
                (name, description, kb_ids, embedding_model, llm_model, llm_provider,
                 system_prompt, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
            RETURNING *
            "#,
        )
        .bind(assistant.name)
        .bind(assistant.description)
        .bind(kb_ids_to_string(assistant.kb_ids))
        .bind(&embedding_model)
        .bind(assistant.llm_model)
        .bind(assistant.llm_provider)
        .bind(assistant.system_prompt)
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await?;

        tracing::info!(assistant_id = row.id, name = assistant.name, "assistant created");
        Ok(row)
    }

    async fn get_assistant(&self, assistant_id: i64) -> Result<Option<AssistantRecord>> {
        Ok(
            sqlx::query_as::<_, AssistantRecord>("SELECT * FROM assistants WHERE id = ?")
                .bind(assistant_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    async fn list_assistants(&self) -> Result<Vec<AssistantRecord>> {
        Ok(sqlx::query_as::<_, AssistantRecord>(
            "SELECT * FROM assistants ORDER BY created_at DESC",
        )
        .fetch_all(self.pool())
        .await?)
    }

    async fn update_assistant_kbs(&self, assistant_id: i64, kb_ids: &[i64]) -> Result<()> {
        let config = self.check_embedding_consistency(kb_ids).await?;
        let embedding_model = config.map(|(_, model)| model);

        sqlx::query(
            "UPDATE assistants SET kb_ids = ?, embedding_model = ?, updated_at = ? WHERE id = ?",
        )
        .bind(kb_ids_to_string(kb_ids))
        .bind(&embedding_model)
        .bind(now_rfc3339())
        .bind(assistant_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn delete_assistant(&self, assistant_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "DELETE FROM messages WHERE conversation_id IN
                 (SELECT id FROM conversations WHERE assistant_id = ?)",
        )
        .bind(assistant_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM conversations WHERE assistant_id = ?")
            .bind(assistant_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM assistants WHERE id = ?")
            .bind(assistant_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn check_embedding_consistency(
        &self,
        kb_ids: &[i64],
    ) -> Result<Option<(String, String)>> {
        if kb_ids.is_empty() {
            return Ok(None);
        }

        let kbs = resolve_kbs(self, kb_ids).await?;
        let mut configs: Vec<(String, String)> = kbs
            .iter()
            .map(|kb| (kb.embedding_provider.clone(), kb.embedding_model.clone()))
            .collect();
        configs.sort();
        configs.dedup();

        if configs.len() > 1 {
            return Err(CatalogError::EmbeddingConfigMismatch(format!(
                "bound knowledge bases use {} distinct embedding configurations: {:?}",
                configs.len(),
                configs
            )));
        }

        Ok(configs.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_db() -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("catalog.db")).await.unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn test_create_with_consistent_kbs() {
        let (db, _dir) = test_db().await;
        let a = db.create_knowledge_base("a", None, "m1", "remote").await.unwrap();
        let b = db.create_knowledge_base("b", None, "m1", "remote").await.unwrap();

        let assistant = db
            .create_assistant(NewAssistant {
                name: "helper",
                description: None,
                kb_ids: &[a.id, b.id],
                llm_model: "qwen2.5:7b",
                llm_provider: "remote",
                system_prompt: Some("You are helpful."),
            })
            .await
            .unwrap();

        assert_eq!(assistant.embedding_model.as_deref(), Some("m1"));
        assert_eq!(assistant.kb_id_list(), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_create_with_mismatched_kbs_rejected() {
        let (db, _dir) = test_db().await;
        let a = db.create_knowledge_base("a", None, "m1", "remote").await.unwrap();
        let b = db.create_knowledge_base("b", None, "m2", "remote").await.unwrap();

        let err = db
            .create_assistant(NewAssistant {
                name: "helper",
                description: None,
                kb_ids: &[a.id, b.id],
                llm_model: "qwen2.5:7b",
                llm_provider: "remote",
                system_prompt: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CatalogError::EmbeddingConfigMismatch(_)));
    }

    #[tokio::test]
    async fn test_create_without_kbs() {
        let (db, _dir) = test_db().await;
        let assistant = db
            .create_assistant(NewAssistant {
                name: "chat only",
                description: None,
                kb_ids: &[],
                llm_model: "qwen2.5:7b",
                llm_provider: "remote",
                system_prompt: None,
            })
            .await
            .unwrap();
        assert!(assistant.embedding_model.is_none());
        assert!(assistant.kb_id_list().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kb_rejected() {
        let (db, _dir) = test_db().await;
        let err = db.check_embedding_consistency(&[404]).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }
}
