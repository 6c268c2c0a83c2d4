//! Knowledge graph store.
//!
//! Entities and relations live in two SurrealDB tables scoped by a `kb_id`
//! field. Record ids are deterministic arrays — `entity:[kb_id, name]` and
//! `relation:[kb_id, source, target, rtype]` — so every upsert is
//! merge-idempotent by construction: re-running an import yields the same
//! node and edge counts.
//!
//! Traversal is an iterative breadth-first expansion in Rust (one frontier
//! query per hop, bounded by `max_hops`/`max_results`, cycle-safe via a
//! visited set) rather than a variable-length path query.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Result, StorageError, SurrealStore};

/// Batched imports run this many rows per transaction; a failing batch rolls
/// back alone, earlier batches stay committed (at-least-once per batch).
const BATCH_SIZE: usize = 1000;

// ============================================================================
// Types
// ============================================================================

/// An entity to upsert. `(kb_id, name)` is the merge key; `etype` is
/// last-writer-wins; `attrs` keys merge into existing attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEntity {
    pub name: String,
    pub etype: String,
    #[serde(default)]
    pub attrs: Map<String, Value>,
}

impl GraphEntity {
    pub fn new(name: impl Into<String>, etype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            etype: etype.into(),
            attrs: Map::new(),
        }
    }
}

/// A directed relation to upsert. `(kb_id, source, target, rtype)` is the
/// merge key; both endpoints are merged as entities first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelation {
    pub source: String,
    pub target: String,
    pub rtype: String,
    #[serde(default)]
    pub attrs: Map<String, Value>,
}

impl GraphRelation {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        rtype: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rtype: rtype.into(),
            attrs: Map::new(),
        }
    }
}

/// A traversal hit: an entity reachable from the start within `hop` hops,
/// with the edge types along the discovery path.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedEntity {
    pub entity: String,
    pub etype: Option<String>,
    pub relations: Vec<String>,
    pub hop: usize,
}

/// One end of a one-hop neighborhood.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborRelation {
    pub entity: String,
    pub relation: String,
}

/// Full entity view: attributes plus one-hop neighborhoods both ways.
#[derive(Debug, Clone, Serialize)]
pub struct EntityInfo {
    pub name: String,
    pub etype: Option<String>,
    pub attrs: Map<String, Value>,
    pub out_relations: Vec<NeighborRelation>,
    pub in_relations: Vec<NeighborRelation>,
}

/// Per-KB graph statistics.
#[derive(Debug, Clone, Serialize, Default)]
pub struct GraphStats {
    pub kb_id: i64,
    pub node_count: usize,
    pub edge_count: usize,
    pub entity_types: HashMap<String, usize>,
    pub relation_types: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct EntityRow {
    name: String,
    etype: Option<String>,
    #[serde(default)]
    attrs: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct EdgeRow {
    source: String,
    target: String,
    rtype: String,
}

#[derive(Debug, Deserialize)]
struct TypeCountRow {
    #[serde(alias = "etype", alias = "rtype")]
    ty: Option<String>,
    count: i64,
}

// ============================================================================
// Store
// ============================================================================

/// Graph store over the shared SurrealDB instance.
#[derive(Clone)]
pub struct GraphStore {
    store: SurrealStore,
}

impl GraphStore {
    pub fn new(store: SurrealStore) -> Self {
        Self { store }
    }

    /// Cheap availability probe. Retrieval uses this to degrade to
    /// vector-only instead of failing a query.
    pub async fn is_available(&self) -> bool {
        self.store.health_check().await.is_ok()
    }

    /// Merge-upsert a single entity.
    pub async fn upsert_entity(
        &self,
        kb_id: i64,
        name: &str,
        etype: &str,
        attrs: Option<Map<String, Value>>,
    ) -> Result<()> {
        self.store
            .db()
            .query(
                r#"
                UPSERT type::thing('entity', [$kb_id, $name]) MERGE {
                    kb_id: $kb_id,
                    name: $name,
                    etype: $etype,
                    attrs: $attrs,
                    updated_at: time::now()
                };
                "#,
            )
            .bind(("kb_id", kb_id))
            .bind(("name", name.to_string()))
            .bind(("etype", etype.to_string()))
            .bind(("attrs", attrs.unwrap_or_default()))
            .await
            .map_err(|e| StorageError::Query(format!("entity upsert failed: {}", e)))?;
        Ok(())
    }

    /// Merge-upsert a single relation, merging both endpoints first. The
    /// endpoint merges omit `etype` so an existing type is never clobbered.
    pub async fn upsert_relation(
        &self,
        kb_id: i64,
        source: &str,
        target: &str,
        rtype: &str,
        attrs: Option<Map<String, Value>>,
    ) -> Result<()> {
        self.store
            .db()
            .query(
                r#"
                UPSERT type::thing('entity', [$kb_id, $source]) MERGE {
                    kb_id: $kb_id, name: $source, updated_at: time::now()
                };
                UPSERT type::thing('entity', [$kb_id, $target]) MERGE {
                    kb_id: $kb_id, name: $target, updated_at: time::now()
                };
                UPSERT type::thing('relation', [$kb_id, $source, $target, $rtype]) MERGE {
                    kb_id: $kb_id,
                    source: $source,
                    target: $target,
                    rtype: $rtype,
                    attrs: $attrs,
                    updated_at: time::now()
                };
                "#,
            )
            .bind(("kb_id", kb_id))
            .bind(("source", source.to_string()))
            .bind(("target", target.to_string()))
            .bind(("rtype", rtype.to_string()))
            .bind(("attrs", attrs.unwrap_or_default()))
            .await
            .map_err(|e| StorageError::Query(format!("relation upsert failed: {}", e)))?;
        Ok(())
    }

    /// Batch-import entities in transactions of [`BATCH_SIZE`]. Returns the
    /// number of rows imported; a failing batch rolls back and propagates.
    pub async fn batch_upsert_entities(
        &self,
        kb_id: i64,
        entities: Vec<GraphEntity>,
    ) -> Result<usize> {
        let db = self.store.db();
        let mut imported = 0;

        for batch in entities.chunks(BATCH_SIZE) {
            db.query("BEGIN TRANSACTION")
                .await
                .map_err(|e| StorageError::Transaction(format!("failed to begin: {}", e)))?;

            let result = db
                .query(
                    r#"
                    FOR $e IN $entities {
                        UPSERT type::thing('entity', [$kb_id, $e.name]) MERGE {
                            kb_id: $kb_id,
                            name: $e.name,
                            etype: $e.etype,
                            attrs: $e.attrs,
                            updated_at: time::now()
                        };
                    };
                    "#,
                )
                .bind(("kb_id", kb_id))
                .bind(("entities", batch.to_vec()))
                .await;

            if let Err(e) = result {
                let _ = db.query("CANCEL TRANSACTION").await;
                return Err(StorageError::Query(format!("entity batch failed: {}", e)));
            }

            db.query("COMMIT TRANSACTION")
                .await
                .map_err(|e| StorageError::Transaction(format!("failed to commit: {}", e)))?;
            imported += batch.len();
        }

        tracing::info!(kb_id, imported, "entities imported");
        Ok(imported)
    }

    /// Batch-import relations in transactions of [`BATCH_SIZE`], merging
    /// endpoints as they go.
    pub async fn batch_upsert_relations(
        &self,
        kb_id: i64,
        relations: Vec<GraphRelation>,
    ) -> Result<usize> {
        let db = self.store.db();
        let mut imported = 0;

        for batch in relations.chunks(BATCH_SIZE) {
            db.query("BEGIN TRANSACTION")
                .await
                .map_err(|e| StorageError::Transaction(format!("failed to begin: {}", e)))?;

            let result = db
                .query(
                    r#"
                    FOR $r IN $relations {
                        UPSERT type::thing('entity', [$kb_id, $r.source]) MERGE {
                            kb_id: $kb_id, name: $r.source, updated_at: time::now()
                        };
                        UPSERT type::thing('entity', [$kb_id, $r.target]) MERGE {
                            kb_id: $kb_id, name: $r.target, updated_at: time::now()
                        };
                        UPSERT type::thing('relation', [$kb_id, $r.source, $r.target, $r.rtype]) MERGE {
                            kb_id: $kb_id,
                            source: $r.source,
                            target: $r.target,
                            rtype: $r.rtype,
                            attrs: $r.attrs,
                            updated_at: time::now()
                        };
                    };
                    "#,
                )
                .bind(("kb_id", kb_id))
                .bind(("relations", batch.to_vec()))
                .await;

            if let Err(e) = result {
                let _ = db.query("CANCEL TRANSACTION").await;
                return Err(StorageError::Query(format!("relation batch failed: {}", e)));
            }

            db.query("COMMIT TRANSACTION")
                .await
                .map_err(|e| StorageError::Transaction(format!("failed to commit: {}", e)))?;
            imported += batch.len();
        }

        tracing::info!(kb_id, imported, "relations imported");
        Ok(imported)
    }

    /// Undirected BFS from `name`, up to `max_hops` hops, returning at most
    /// `max_results` distinct entities other than the start, ordered by
    /// (hop ascending, name ascending).
    pub async fn find_related(
        &self,
        kb_id: i64,
        name: &str,
        max_hops: usize,
        max_results: usize,
    ) -> Result<Vec<RelatedEntity>> {
        if max_hops == 0 || max_results == 0 {
            return Ok(Vec::new());
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(name.to_string());
        let mut frontier: Vec<String> = vec![name.to_string()];
        // name -> (hop, edge-type path from the start)
        let mut discovered: HashMap<String, (usize, Vec<String>)> = HashMap::new();
        let mut paths: HashMap<String, Vec<String>> = HashMap::new();
        paths.insert(name.to_string(), Vec::new());

        for hop in 1..=max_hops {
            if frontier.is_empty() {
                break;
            }

            let edges: Vec<EdgeRow> = self
                .store
                .db()
                .query(
                    r#"
                    SELECT source, target, rtype FROM relation
                    WHERE kb_id = $kb_id AND (source IN $frontier OR target IN $frontier)
                    "#,
                )
                .bind(("kb_id", kb_id))
                .bind(("frontier", frontier.clone()))
                .await
                .map_err(|e| StorageError::Query(format!("traversal query failed: {}", e)))?
                .take(0)
                .map_err(|e| StorageError::Query(format!("traversal decode failed: {}", e)))?;

            let mut next_frontier = Vec::new();
            for edge in edges {
                let (from, to) = if visited.contains(&edge.source) {
                    (edge.source.clone(), edge.target.clone())
                } else {
                    (edge.target.clone(), edge.source.clone())
                };

                if !visited.contains(&from) || visited.contains(&to) {
                    continue;
                }

                let mut path = paths.get(&from).cloned().unwrap_or_default();
                path.push(edge.rtype.clone());

                visited.insert(to.clone());
                paths.insert(to.clone(), path.clone());
                discovered.insert(to.clone(), (hop, path));
                next_frontier.push(to);
            }

            frontier = next_frontier;
        }

        let names: Vec<String> = discovered.keys().cloned().collect();
        let etypes = self.entity_types(kb_id, names).await?;

        let mut related: Vec<RelatedEntity> = discovered
            .into_iter()
            .map(|(entity, (hop, relations))| RelatedEntity {
                etype: etypes.get(&entity).cloned().flatten(),
                entity,
                relations,
                hop,
            })
            .collect();

        related.sort_by(|a, b| a.hop.cmp(&b.hop).then_with(|| a.entity.cmp(&b.entity)));
        related.truncate(max_results);
        Ok(related)
    }

    async fn entity_types(
        &self,
        kb_id: i64,
        names: Vec<String>,
    ) -> Result<HashMap<String, Option<String>>> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<EntityRow> = self
            .store
            .db()
            .query("SELECT name, etype FROM entity WHERE kb_id = $kb_id AND name IN $names")
            .bind(("kb_id", kb_id))
            .bind(("names", names))
            .await
            .map_err(|e| StorageError::Query(format!("entity type lookup failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("entity type decode failed: {}", e)))?;

        Ok(rows.into_iter().map(|r| (r.name, r.etype)).collect())
    }

    /// Attributes plus one-hop outgoing and incoming neighborhoods, or None
    /// when the entity does not exist in this KB scope.
    pub async fn get_entity(&self, kb_id: i64, name: &str) -> Result<Option<EntityInfo>> {
        let row: Option<EntityRow> = self
            .store
            .db()
            .query("SELECT name, etype, attrs FROM type::thing('entity', [$kb_id, $name])")
            .bind(("kb_id", kb_id))
            .bind(("name", name.to_string()))
            .await
            .map_err(|e| StorageError::Query(format!("entity fetch failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("entity decode failed: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let out_edges: Vec<EdgeRow> = self
            .store
            .db()
            .query("SELECT source, target, rtype FROM relation WHERE kb_id = $kb_id AND source = $name")
            .bind(("kb_id", kb_id))
            .bind(("name", name.to_string()))
            .await
            .map_err(|e| StorageError::Query(format!("out-relations fetch failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("out-relations decode failed: {}", e)))?;

        let in_edges: Vec<EdgeRow> = self
            .store
            .db()
            .query("SELECT source, target, rtype FROM relation WHERE kb_id = $kb_id AND target = $name")
            .bind(("kb_id", kb_id))
            .bind(("name", name.to_string()))
            .await
            .map_err(|e| StorageError::Query(format!("in-relations fetch failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("in-relations decode failed: {}", e)))?;

        Ok(Some(EntityInfo {
            name: row.name,
            etype: row.etype,
            attrs: row.attrs.unwrap_or_default(),
            out_relations: out_edges
                .into_iter()
                .map(|e| NeighborRelation {
                    entity: e.target,
                    relation: e.rtype,
                })
                .collect(),
            in_relations: in_edges
                .into_iter()
                .map(|e| NeighborRelation {
                    entity: e.source,
                    relation: e.rtype,
                })
                .collect(),
        }))
    }

    /// Remove all nodes and edges in a KB scope. Returns the number of
    /// nodes removed; an empty scope is a no-op success.
    pub async fn delete_kb(&self, kb_id: i64) -> Result<usize> {
        let stats = self.stats(kb_id).await?;

        self.store
            .db()
            .query("DELETE relation WHERE kb_id = $kb_id; DELETE entity WHERE kb_id = $kb_id;")
            .bind(("kb_id", kb_id))
            .await
            .map_err(|e| StorageError::Query(format!("graph delete failed: {}", e)))?;

        tracing::info!(kb_id, nodes = stats.node_count, "graph scope deleted");
        Ok(stats.node_count)
    }

    /// Node and edge counts plus by-type histograms for a KB scope.
    pub async fn stats(&self, kb_id: i64) -> Result<GraphStats> {
        let db = self.store.db();

        let node_count: Option<CountRow> = db
            .query("SELECT count() AS count FROM entity WHERE kb_id = $kb_id GROUP ALL")
            .bind(("kb_id", kb_id))
            .await
            .map_err(|e| StorageError::Query(format!("node count failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("node count decode failed: {}", e)))?;

        let edge_count: Option<CountRow> = db
            .query("SELECT count() AS count FROM relation WHERE kb_id = $kb_id GROUP ALL")
            .bind(("kb_id", kb_id))
            .await
            .map_err(|e| StorageError::Query(format!("edge count failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("edge count decode failed: {}", e)))?;

        let entity_types: Vec<TypeCountRow> = db
            .query("SELECT etype, count() AS count FROM entity WHERE kb_id = $kb_id GROUP BY etype")
            .bind(("kb_id", kb_id))
            .await
            .map_err(|e| StorageError::Query(format!("entity histogram failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("entity histogram decode failed: {}", e)))?;

        let relation_types: Vec<TypeCountRow> = db
            .query("SELECT rtype, count() AS count FROM relation WHERE kb_id = $kb_id GROUP BY rtype")
            .bind(("kb_id", kb_id))
            .await
            .map_err(|e| StorageError::Query(format!("relation histogram failed: {}", e)))?
            .take(0)
            .map_err(|e| StorageError::Query(format!("relation histogram decode failed: {}", e)))?;

        Ok(GraphStats {
            kb_id,
            node_count: node_count.map(|r| r.count as usize).unwrap_or(0),
            edge_count: edge_count.map(|r| r.count as usize).unwrap_or(0),
            entity_types: entity_types
                .into_iter()
                .filter_map(|r| r.ty.map(|t| (t, r.count as usize)))
                .collect(),
            relation_types: relation_types
                .into_iter()
                .filter_map(|r| r.ty.map(|t| (t, r.count as usize)))
                .collect(),
        })
    }
}
