//! Hybrid vector + graph retrieval.
//!
//! Vector search supplies 2k candidates; query-time entity extraction (with
//! a lowered length floor) seeds graph lookups — a direct entity hit scores
//! 0.9, related entities score 0.7/hop up to the traversal bound. Fusion
//! multiplies raw scores by the configured vector/graph weights, sorts, and
//! returns the top k. Any failure or absence on the graph side degrades the
//! query to vector-only with a logged warning; a hybrid query never fails
//! because of the graph.

use std::collections::HashSet;

use super::{RetrievalSource, Result, RetrievedChunk, Retriever};
use crate::core::storage::graph::{EntityInfo, RelatedEntity};

/// Score for a direct entity hit.
const DIRECT_HIT_SCORE: f32 = 0.9;
/// Numerator of the per-hop decay for related entities.
const RELATED_BASE_SCORE: f32 = 0.7;
/// Entity extraction floor override for short query strings.
const QUERY_MIN_TEXT_LENGTH: usize = 5;
/// Graph results are deduped on this many leading characters.
const DEDUPE_PREFIX: usize = 100;

impl Retriever {
    /// Hybrid search across one or more knowledge bases.
    pub async fn hybrid_search(
        &self,
        kb_ids: &[i64],
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        // The vector leg also enforces the multi-KB embedding gate.
        let vector_results = self
            .search_many(kb_ids, query, top_k * 2, None)
            .await?;

        let graph_results = match self.graph_leg(kb_ids, query, top_k).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("graph retrieval failed, degrading to vector-only: {}", e);
                Vec::new()
            }
        };

        Ok(self.fuse(vector_results, graph_results, top_k))
    }

    /// Graph evidence for a query. Returns empty (after logging) whenever
    /// the graph side is not usable.
    async fn graph_leg(
        &self,
        kb_ids: &[i64],
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let (Some(graph), Some(extractor)) = (self.graph.as_ref(), self.extractor.as_ref()) else {
            tracing::debug!("graph side not configured, vector-only retrieval");
            return Ok(Vec::new());
        };

        if !graph.is_available().await {
            tracing::warn!("graph store unavailable, degrading to vector-only");
            return Ok(Vec::new());
        }

        let extraction = extractor
            .extract(query, None, Some(QUERY_MIN_TEXT_LENGTH))
            .await;
        if extraction.entities.is_empty() {
            tracing::debug!("no entities extracted from query");
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for kb_id in kb_ids {
            for entity in &extraction.entities {
                match graph.get_entity(*kb_id, &entity.name).await {
                    Ok(Some(info)) => {
                        hits.push(RetrievedChunk {
                            chunk_id: None,
                            content: format_entity_info(&info),
                            similarity: DIRECT_HIT_SCORE,
                            kb_id: *kb_id,
                            file_id: None,
                            chunk_index: None,
                            filename: None,
                            source: RetrievalSource::GraphDirect,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(kb_id, entity = %entity.name, "entity lookup failed: {}", e);
                        continue;
                    }
                }

                match graph
                    .find_related(*kb_id, &entity.name, self.max_hops, 5)
                    .await
                {
                    Ok(related) => {
                        for rel in related {
                            let score = RELATED_BASE_SCORE / rel.hop.max(1) as f32;
                            hits.push(RetrievedChunk {
                                chunk_id: None,
                                content: format_relation_info(&entity.name, &rel),
                                similarity: score,
                                kb_id: *kb_id,
                                file_id: None,
                                chunk_index: None,
                                filename: None,
                                source: RetrievalSource::GraphRelated,
                            });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(kb_id, entity = %entity.name, "traversal failed: {}", e);
                    }
                }
            }
        }

        Ok(dedupe_graph_hits(hits, top_k))
    }

    /// Weighted fusion: `final = raw x weight`, globally sorted, top k.
    fn fuse(
        &self,
        vector_results: Vec<RetrievedChunk>,
        graph_results: Vec<RetrievedChunk>,
        top_k: usize,
    ) -> Vec<RetrievedChunk> {
        let mut fused = Vec::with_capacity(vector_results.len() + graph_results.len());

        for mut chunk in vector_results {
            chunk.similarity *= self.config.vector_weight;
            fused.push(chunk);
        }
        for mut chunk in graph_results {
            chunk.similarity *= self.config.graph_weight;
            fused.push(chunk);
        }

        fused.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        fused.truncate(top_k);
        fused
    }
}

/// Keep the highest-scored representative of near-identical graph facts,
/// keyed by the first [`DEDUPE_PREFIX`] characters of formatted content.
fn dedupe_graph_hits(mut hits: Vec<RetrievedChunk>, top_k: usize) -> Vec<RetrievedChunk> {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for hit in hits {
        let key: String = hit.content.chars().take(DEDUPE_PREFIX).collect();
        if seen.insert(key) {
            unique.push(hit);
            if unique.len() >= top_k {
                break;
            }
        }
    }
    unique
}

/// Render a direct entity hit as evidence text.
fn format_entity_info(info: &EntityInfo) -> String {
    let mut parts = vec![format!(
        "Entity: {} (type: {})",
        info.name,
        info.etype.as_deref().unwrap_or("Unknown")
    )];

    if !info.attrs.is_empty() {
        let attrs: Vec<String> = info
            .attrs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        parts.push(format!("Attributes: {}", attrs.join(", ")));
    }

    if !info.out_relations.is_empty() {
        let relations: Vec<String> = info
            .out_relations
            .iter()
            .take(3)
            .map(|r| format!("{}->{}", r.relation, r.entity))
            .collect();
        parts.push(format!("Relations: {}", relations.join(", ")));
    }

    if !info.in_relations.is_empty() {
        let relations: Vec<String> = info
            .in_relations
            .iter()
            .take(3)
            .map(|r| format!("{}-{}->this entity", r.entity, r.relation))
            .collect();
        parts.push(format!("Referenced by: {}", relations.join(", ")));
    }

    parts.join("\n")
}

/// Render a traversal hit as evidence text.
fn format_relation_info(source: &str, related: &RelatedEntity) -> String {
    let etype = related.etype.as_deref().unwrap_or("Unknown");
    if related.relations.is_empty() {
        format!(
            "{} relates to {} (type: {}, {} hops)",
            source, related.entity, etype, related.hop
        )
    } else {
        format!(
            "{} relates to {} via [{}] (type: {}, {} hops)",
            source,
            related.entity,
            related.relations.join(" -> "),
            etype,
            related.hop
        )
    }
}
