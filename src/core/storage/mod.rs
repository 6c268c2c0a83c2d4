//! Embedded vector + graph store on SurrealDB.
//!
//! One RocksDB-backed SurrealDB instance hosts both the per-KB vector
//! collections and the entity/relation graph. The stores are internally
//! thread-safe; handles are cheap clones of an `Arc<Surreal<Db>>`.

pub mod graph;
pub mod vector;

pub use graph::GraphStore;
pub use vector::VectorStore;

use std::path::PathBuf;
use std::sync::Arc;

use surrealdb::engine::local::{Db, RocksDb};
use surrealdb::Surreal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage initialization failed: {0}")]
    Init(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Embedded SurrealDB handle shared by the vector and graph stores.
#[derive(Clone)]
pub struct SurrealStore {
    db: Arc<Surreal<Db>>,
}

impl SurrealStore {
    /// Initialize SurrealDB with RocksDB persistence at `dir`, selecting the
    /// given namespace/database and applying base schema.
    pub async fn new(dir: PathBuf, namespace: &str, database: &str) -> Result<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                StorageError::Init(format!(
                    "failed to create store directory at {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let db = Surreal::new::<RocksDb>(dir.clone())
            .await
            .map_err(|e| StorageError::Database(format!("failed to open SurrealDB: {}", e)))?;

        db.use_ns(namespace)
            .use_db(database)
            .await
            .map_err(|e| StorageError::Database(format!("failed to select ns/db: {}", e)))?;

        let store = Self { db: Arc::new(db) };
        store.apply_schema().await?;

        tracing::info!(
            path = %dir.display(),
            namespace,
            database,
            "surreal store initialized"
        );
        Ok(store)
    }

    /// Apply base schema: the collection registry and the graph tables with
    /// their indices. All statements are `IF NOT EXISTS`, so this is
    /// idempotent and safe on every startup.
    async fn apply_schema(&self) -> Result<()> {
        self.db
            .query(BASE_SCHEMA)
            .await
            .map_err(|e| StorageError::Init(format!("schema application failed: {}", e)))?;
        Ok(())
    }

    pub fn db(&self) -> &Surreal<Db> {
        &self.db
    }

    pub fn clone_db(&self) -> Arc<Surreal<Db>> {
        Arc::clone(&self.db)
    }

    /// Cheap connectivity probe.
    pub async fn health_check(&self) -> Result<()> {
        self.db
            .query("RETURN 1")
            .await
            .map_err(|e| StorageError::Database(format!("health check failed: {}", e)))?;
        Ok(())
    }
}

/// Registry of vector collections plus graph tables and indices.
const BASE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS vector_collection SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS name ON vector_collection TYPE string;
DEFINE FIELD IF NOT EXISTS dimension ON vector_collection TYPE int;
DEFINE FIELD IF NOT EXISTS created_at ON vector_collection TYPE datetime DEFAULT time::now();
DEFINE INDEX IF NOT EXISTS vector_collection_name ON vector_collection FIELDS name UNIQUE;

DEFINE TABLE IF NOT EXISTS entity SCHEMALESS;
DEFINE INDEX IF NOT EXISTS entity_name ON entity FIELDS name;
DEFINE INDEX IF NOT EXISTS entity_kb ON entity FIELDS kb_id;
DEFINE INDEX IF NOT EXISTS entity_type ON entity FIELDS etype;
DEFINE INDEX IF NOT EXISTS entity_kb_name ON entity FIELDS kb_id, name UNIQUE;

DEFINE TABLE IF NOT EXISTS relation SCHEMALESS;
DEFINE INDEX IF NOT EXISTS relation_kb ON relation FIELDS kb_id;
DEFINE INDEX IF NOT EXISTS relation_source ON relation FIELDS kb_id, source;
DEFINE INDEX IF NOT EXISTS relation_target ON relation FIELDS kb_id, target;
"#;
