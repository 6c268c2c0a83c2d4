//! Per-KB vector collections.
//!
//! Each knowledge base owns one SurrealDB table named `kb_<id>` holding
//! `(id, embedding, document, metadata)` records under an HNSW index of
//! fixed dimension with EUCLIDEAN distance. A `vector_collection` registry
//! row records each collection's dimension; every write is checked against
//! it, so all vectors in a collection share one dimension by construction.
//!
//! Metadata values are plain strings for portability. Distances returned by
//! [`VectorStore::query`] are raw EUCLIDEAN distances; callers convert to
//! similarity via `sim = clamp(1 - d^2 / 2, 0, 1)`, which assumes
//! L2-normalized embeddings.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Result, StorageError, SurrealStore};

/// HNSW search quality factor.
const KNN_EFC: usize = 150;

static COLLECTION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid collection name regex"));

static METADATA_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid metadata key regex"));

/// Conventional collection name for a knowledge base.
pub fn collection_name(kb_id: i64) -> String {
    format!("kb_{}", kb_id)
}

/// A record to be upserted into a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: HashMap<String, String>,
}

/// A stored record fetched by id.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredVector {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// k-NN query result in parallel-array form.
#[derive(Debug, Clone, Default)]
pub struct VectorQueryResult {
    pub ids: Vec<String>,
    pub distances: Vec<f32>,
    pub documents: Vec<String>,
    pub metadatas: Vec<HashMap<String, String>>,
}

impl VectorQueryResult {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Registry entry for a collection.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: i64,
}

/// Collection statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub count: usize,
    pub dimension: usize,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct DimensionRow {
    dimension: i64,
}

#[derive(Debug, Deserialize)]
struct QueryHit {
    id: String,
    document: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    distance: f32,
}

/// Vector store over the shared SurrealDB instance.
#[derive(Clone)]
pub struct VectorStore {
    store: SurrealStore,
}

impl VectorStore {
    pub fn new(store: SurrealStore) -> Self {
        Self { store }
    }

    fn validate_name(name: &str) -> Result<()> {
        if COLLECTION_NAME.is_match(name) {
            Ok(())
        } else {
            Err(StorageError::InvalidCollection(name.to_string()))
        }
    }

    /// Registered dimension of a collection, if it exists.
    pub async fn collection_dimension(&self, name: &str) -> Result<Option<usize>> {
        Self::validate_name(name)?;
        let row: Option<DimensionRow> = self
            .store
            .db()
            .query("SELECT dimension FROM type::thing('vector_collection', $name)")
            .bind(("name", name.to_string()))
            .await
            .map_err(|e| StorageError::Query(format!("collection lookup failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("collection lookup decode failed: {}", e)))?;
        Ok(row.map(|r| r.dimension as usize))
    }

    /// Create the collection table, its HNSW index, and the registry row if
    /// they do not exist. An existing collection with a different dimension
    /// is a `DimensionMismatch` (the KB's embedding model is immutable once
    /// indexed).
    pub async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        Self::validate_name(name)?;
        if dimension == 0 {
            return Err(StorageError::InvalidArgument(
                "vector dimension must be positive".to_string(),
            ));
        }

        if let Some(existing) = self.collection_dimension(name).await? {
            if existing != dimension {
                return Err(StorageError::DimensionMismatch {
                    expected: existing,
                    actual: dimension,
                });
            }
            return Ok(());
        }

        let ddl = format!(
            r#"
            DEFINE TABLE IF NOT EXISTS {name} SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS idx_{name}_embedding ON {name}
                FIELDS embedding HNSW DIMENSION {dimension} DIST EUCLIDEAN EFC 150 M 12;
            UPSERT type::thing('vector_collection', $name) CONTENT {{
                name: $name,
                dimension: {dimension},
                created_at: time::now()
            }};
            "#,
            name = name,
            dimension = dimension
        );

        self.store
            .db()
            .query(ddl)
            .bind(("name", name.to_string()))
            .await
            .map_err(|e| StorageError::Query(format!("collection creation failed: {}", e)))?;

        tracing::info!(collection = name, dimension, "vector collection created");
        Ok(())
    }

    /// Upsert records into a collection inside one transaction. Every
    /// embedding is checked against the registered dimension before any
    /// write happens, so a bad batch leaves no partial insert.
    pub async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<usize> {
        Self::validate_name(collection)?;
        if records.is_empty() {
            return Ok(0);
        }

        let dimension = self
            .collection_dimension(collection)
            .await?
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))?;

        for record in &records {
            if record.embedding.len() != dimension {
                return Err(StorageError::DimensionMismatch {
                    expected: dimension,
                    actual: record.embedding.len(),
                });
            }
        }

        let db = self.store.db();
        db.query("BEGIN TRANSACTION")
            .await
            .map_err(|e| StorageError::Transaction(format!("failed to begin: {}", e)))?;

        let total = records.len();
        let table = collection.to_string();

        for (i, record) in records.into_iter().enumerate() {
            let result = db
                .query(
                    r#"
                    UPSERT type::thing($tb, $id) CONTENT {
                        embedding: $embedding,
                        document: $document,
                        metadata: $metadata
                    };
                    "#,
                )
                .bind(("tb", table.clone()))
                .bind(("id", record.id))
                .bind(("embedding", record.embedding))
                .bind(("document", record.document))
                .bind(("metadata", record.metadata))
                .await;

            if let Err(e) = result {
                let _ = db.query("CANCEL TRANSACTION").await;
                return Err(StorageError::Query(format!(
                    "failed to upsert vector {} of {}: {}",
                    i + 1,
                    total,
                    e
                )));
            }
        }

        db.query("COMMIT TRANSACTION")
            .await
            .map_err(|e| StorageError::Transaction(format!("failed to commit: {}", e)))?;

        tracing::debug!(collection = %table, count = total, "vectors upserted");
        Ok(total)
    }

    /// k-NN query ordered by ascending EUCLIDEAN distance. `filter` is an
    /// optional metadata equality constraint applied before the KNN operator.
    pub async fn query(
        &self,
        collection: &str,
        query_embedding: Vec<f32>,
        k: usize,
        filter: Option<(&str, &str)>,
    ) -> Result<VectorQueryResult> {
        Self::validate_name(collection)?;

        let dimension = self
            .collection_dimension(collection)
            .await?
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))?;
        if query_embedding.len() != dimension {
            return Err(StorageError::DimensionMismatch {
                expected: dimension,
                actual: query_embedding.len(),
            });
        }

        let filter_clause = match filter {
            Some((key, _)) => {
                if !METADATA_KEY.is_match(key) {
                    return Err(StorageError::InvalidArgument(format!(
                        "invalid metadata filter key: {}",
                        key
                    )));
                }
                format!("metadata.{} = $filter_value AND", key)
            }
            None => String::new(),
        };

        // Filters must appear before the KNN operator.
        let query = format!(
            r#"
            SELECT
                meta::id(id) AS id,
                document,
                metadata,
                vector::distance::knn() AS distance
            FROM {collection}
            WHERE {filter_clause} embedding <|{k},{efc}|> $embedding
            ORDER BY distance ASC;
            "#,
            collection = collection,
            filter_clause = filter_clause,
            k = k,
            efc = KNN_EFC,
        );

        let mut request = self.store.db().query(query).bind(("embedding", query_embedding));
        if let Some((_, value)) = filter {
            request = request.bind(("filter_value", value.to_string()));
        }

        let hits: Vec<QueryHit> = request
            .await
            .map_err(|e| StorageError::Query(format!("vector query failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("vector query decode failed: {}", e)))?;

        let mut result = VectorQueryResult::default();
        for hit in hits {
            result.ids.push(hit.id);
            result.distances.push(hit.distance);
            result.documents.push(hit.document);
            result.metadatas.push(hit.metadata);
        }
        Ok(result)
    }

    /// Fetch stored records by id. Unknown ids are silently absent.
    pub async fn get_by_ids(&self, collection: &str, ids: Vec<String>) -> Result<Vec<StoredVector>> {
        Self::validate_name(collection)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT meta::id(id) AS id, embedding, document, metadata FROM {} WHERE meta::id(id) IN $ids",
            collection
        );

        self.store
            .db()
            .query(query)
            .bind(("ids", ids))
            .await
            .map_err(|e| StorageError::Query(format!("vector fetch failed: {}", e)))?
            .take::<Vec<StoredVector>>(0)
            .map_err(|e| StorageError::Query(format!("vector fetch decode failed: {}", e)))
    }

    /// Delete records by id. Deleting unknown ids is a no-op success.
    pub async fn delete_by_ids(&self, collection: &str, ids: Vec<String>) -> Result<()> {
        Self::validate_name(collection)?;
        if ids.is_empty() {
            return Ok(());
        }

        let query = format!("DELETE {} WHERE meta::id(id) IN $ids", collection);
        self.store
            .db()
            .query(query)
            .bind(("ids", ids))
            .await
            .map_err(|e| StorageError::Query(format!("vector delete failed: {}", e)))?;
        Ok(())
    }

    /// Drop a collection's table and registry row. Dropping an unknown
    /// collection is a no-op success.
    pub async fn delete_collection(&self, collection: &str) -> Result<()> {
        Self::validate_name(collection)?;

        let query = format!(
            r#"
            REMOVE TABLE IF EXISTS {collection};
            DELETE type::thing('vector_collection', $name);
            "#,
            collection = collection
        );

        self.store
            .db()
            .query(query)
            .bind(("name", collection.to_string()))
            .await
            .map_err(|e| StorageError::Query(format!("collection drop failed: {}", e)))?;

        tracing::info!(collection, "vector collection deleted");
        Ok(())
    }

    /// All registered collections.
    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        self.store
            .db()
            .query("SELECT name, dimension FROM vector_collection ORDER BY name ASC")
            .await
            .map_err(|e| StorageError::Query(format!("collection list failed: {}", e)))?
            .take::<Vec<CollectionInfo>>(0)
            .map_err(|e| StorageError::Query(format!("collection list decode failed: {}", e)))
    }

    /// Record count and dimension of a collection.
    pub async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        Self::validate_name(collection)?;
        let dimension = self
            .collection_dimension(collection)
            .await?
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))?;

        let query = format!("SELECT count() AS count FROM {} GROUP ALL", collection);
        let row: Option<CountRow> = self
            .store
            .db()
            .query(query)
            .await
            .map_err(|e| StorageError::Query(format!("collection stats failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("collection stats decode failed: {}", e)))?;

        Ok(CollectionStats {
            name: collection.to_string(),
            count: row.map(|r| r.count as usize).unwrap_or(0),
            dimension,
        })
    }
}
