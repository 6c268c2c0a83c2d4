//! Model administration.
//!
//! Usage checks and guarded deletion of on-disk models. Deleting a model
//! still referenced by a knowledge base or assistant is a conflict unless
//! forced; the referencing rows are left untouched either way and will
//! degrade at query time until rebound.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::database::Database;

#[derive(Error, Debug)]
pub enum ModelAdminError {
    #[error("model {model} is in use by: {}", used_by.join(", "))]
    InUse { model: String, used_by: Vec<String> },

    #[error("model not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelAdminError>;

/// Where a model is referenced from.
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub in_use: bool,
    pub used_by: Vec<String>,
}

pub struct ModelAdmin {
    catalog: Database,
    embedding_model_dir: PathBuf,
    llm_models_dir: PathBuf,
}

impl ModelAdmin {
    pub fn new(catalog: Database, embedding_model_dir: PathBuf, llm_models_dir: PathBuf) -> Self {
        Self {
            catalog,
            embedding_model_dir,
            llm_models_dir,
        }
    }

    /// Knowledge bases bound to an embedding model.
    pub async fn embedding_model_usage(&self, model: &str) -> Result<ModelUsage> {
        let used_by: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM knowledge_bases WHERE embedding_model = ? ORDER BY name",
        )
        .bind(model)
        .fetch_all(self.catalog.pool())
        .await?;

        Ok(ModelUsage {
            model: model.to_string(),
            in_use: !used_by.is_empty(),
            used_by,
        })
    }

    /// Assistants bound to an LLM model.
    pub async fn llm_model_usage(&self, model: &str) -> Result<ModelUsage> {
        let used_by: Vec<String> =
            sqlx::query_scalar("SELECT name FROM assistants WHERE llm_model = ? ORDER BY name")
                .bind(model)
                .fetch_all(self.catalog.pool())
                .await?;

        Ok(ModelUsage {
            model: model.to_string(),
            in_use: !used_by.is_empty(),
            used_by,
        })
    }

    /// Delete a local embedding model's files. In-use models are rejected
    /// unless `force`.
    pub async fn delete_embedding_model(&self, model: &str, force: bool) -> Result<()> {
        let usage = self.embedding_model_usage(model).await?;
        if usage.in_use && !force {
            return Err(ModelAdminError::InUse {
                model: model.to_string(),
                used_by: usage.used_by,
            });
        }

        let dir = self.embedding_model_dir.join(model);
        if !dir.exists() {
            return Err(ModelAdminError::NotFound(model.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;

        tracing::info!(model, force, "embedding model deleted");
        Ok(())
    }

    /// Delete a local LLM's files. In-use models are rejected unless
    /// `force`.
    pub async fn delete_llm_model(&self, model: &str, force: bool) -> Result<()> {
        let usage = self.llm_model_usage(model).await?;
        if usage.in_use && !force {
            return Err(ModelAdminError::InUse {
                model: model.to_string(),
                used_by: usage.used_by,
            });
        }

        let dir = self.llm_models_dir.join(model);
        if !dir.exists() {
            return Err(ModelAdminError::NotFound(model.to_string()));
        }
        std::fs::remove_dir_all(&dir)?;

        tracing::info!(model, force, "LLM model deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{AssistantOps, KnowledgeBaseOps, NewAssistant};
    use tempfile::TempDir;

    async fn setup() -> (ModelAdmin, Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let catalog = Database::new(&dir.path().join("catalog.db")).await.unwrap();
        let admin = ModelAdmin::new(
            catalog.clone(),
            dir.path().join("embedding"),
            dir.path().join("llm"),
        );
        (admin, catalog, dir)
    }

    #[tokio::test]
    async fn test_embedding_usage() {
        let (admin, catalog, _dir) = setup().await;
        catalog
            .create_knowledge_base("docs", None, "minilm", "local")
            .await
            .unwrap();

        let usage = admin.embedding_model_usage("minilm").await.unwrap();
        assert!(usage.in_use);
        assert_eq!(usage.used_by, vec!["docs"]);

        let unused = admin.embedding_model_usage("other").await.unwrap();
        assert!(!unused.in_use);
    }

    #[tokio::test]
    async fn test_delete_in_use_conflicts_unless_forced() {
        let (admin, catalog, dir) = setup().await;
        catalog
            .create_knowledge_base("docs", None, "minilm", "local")
            .await
            .unwrap();

        let model_dir = dir.path().join("embedding").join("minilm");
        std::fs::create_dir_all(&model_dir).unwrap();

        let err = admin.delete_embedding_model("minilm", false).await.unwrap_err();
        assert!(matches!(err, ModelAdminError::InUse { .. }));
        assert!(model_dir.exists());

        admin.delete_embedding_model("minilm", true).await.unwrap();
        assert!(!model_dir.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_model() {
        let (admin, _catalog, _dir) = setup().await;
        let err = admin.delete_llm_model("ghost", false).await.unwrap_err();
        assert!(matches!(err, ModelAdminError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_llm_usage_tracks_assistants() {
        let (admin, catalog, _dir) = setup().await;
        catalog
            .create_assistant(NewAssistant {
                name: "helper",
                description: None,
                kb_ids: &[],
                llm_model: "qwen2.5:7b",
                llm_provider: "remote",
                system_prompt: None,
            })
            .await
            .unwrap();

        let usage = admin.llm_model_usage("qwen2.5:7b").await.unwrap();
        assert!(usage.in_use);
        assert_eq!(usage.used_by, vec!["helper"]);
    }
}
