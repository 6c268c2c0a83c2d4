//! Relational catalog for knowledge bases, files, chunks, assistants,
//! conversations, and messages.
//!
//! A single [`Database`] handle owns a SQLite connection pool; per-domain
//! operations are provided as extension traits implemented on it
//! (`KnowledgeBaseOps`, `FileOps`, `ChunkOps`, `AssistantOps`,
//! `ConversationOps`). Multi-row operations run in one transaction each.

mod assistants;
mod chunks;
mod conversations;
mod files;
mod knowledge_bases;
pub mod migrations;
pub mod models;

pub use assistants::{AssistantOps, NewAssistant};
pub use chunks::{ChunkOps, NewChunk};
pub use conversations::ConversationOps;
pub use files::{FileOps, NewFile};
pub use knowledge_bases::KnowledgeBaseOps;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

/// Catalog-level errors. Most operations surface plain `sqlx::Error`; the
/// variants here exist where the catalog itself owns a rule.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("embedding configuration mismatch: {0}")]
    EmbeddingConfigMismatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Shared handle over the catalog's connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the catalog at `path` and run migrations.
    pub async fn new(path: &Path) -> std::result::Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .unwrap_or_else(|_| SqliteConnectOptions::new().filename(path))
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        migrations::run_migrations(&pool).await?;

        tracing::info!(path = %path.display(), "catalog database opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap connectivity probe; the startup health check treats a failure
    /// here as fatal.
    pub async fn health_check(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Current UTC timestamp in the RFC 3339 format used for all catalog rows.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
