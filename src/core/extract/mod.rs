//! Entity Extraction
//!
//! LLM-driven extraction of typed entities and relations from text. The
//! model is asked for strict JSON; responses are recovered from raw JSON,
//! fenced blocks, or the widest `{...}` span, and every failure path yields
//! an empty result rather than an error — extraction must never take down
//! an ingestion or retrieval call.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::ExtractionConfig;
use crate::core::llm::{ChatMessage, LlmProviderKind, LlmService};

// ============================================================================
// Types
// ============================================================================

/// An extracted entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", default = "unknown_type")]
    pub etype: String,
}

/// An extracted directed relation between two entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    #[serde(rename = "relation", default = "related_to")]
    pub rtype: String,
}

/// Result of extracting one text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
}

impl Extraction {
    fn empty(chunk_id: Option<String>) -> Self {
        Self {
            entities: Vec::new(),
            relations: Vec::new(),
            chunk_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

fn unknown_type() -> String {
    "Unknown".to_string()
}

fn related_to() -> String {
    "related_to".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
    #[serde(default)]
    relations: Vec<ExtractedRelation>,
}

// ============================================================================
// Extractor
// ============================================================================

pub struct EntityExtractor {
    llm: Arc<LlmService>,
    kind: LlmProviderKind,
    config: ExtractionConfig,
}

impl EntityExtractor {
    pub fn new(llm: Arc<LlmService>, kind: LlmProviderKind, config: ExtractionConfig) -> Self {
        Self { llm, kind, config }
    }

    fn build_prompt(text: &str) -> String {
        format!(
            r#"You are a knowledge graph construction assistant. Extract entities and relations from the text below.

Text:
{text}

Requirements:
1. Identify the key entities (people, organizations, locations, products, concepts, events).
2. Extract the semantic relations between them.
3. Entity names must be exact and complete, without qualifiers.
4. Relation types must be specific (e.g. works_at, located_in, part_of, founded_by).
5. Entity types are one of: Person, Organization, Location, Product, Concept, Event, Date.

Output format (valid JSON only, nothing else):
{{
  "entities": [
    {{"name": "entity name", "type": "entity type"}}
  ],
  "relations": [
    {{"source": "source entity", "target": "target entity", "relation": "relation type"}}
  ]
}}

Return only the JSON."#,
        )
    }

    /// Recover a JSON object from an LLM response: direct parse, fenced
    /// block, or the widest `{{...}}` span, in that order.
    fn parse_response(response: &str) -> RawExtraction {
        if let Ok(parsed) = serde_json::from_str::<RawExtraction>(response) {
            return parsed;
        }

        let candidate = if let Some(start) = response.find("```json") {
            let rest = &response[start + 7..];
            rest.find("```").map(|end| rest[..end].trim().to_string())
        } else if let Some(start) = response.find("```") {
            let rest = &response[start + 3..];
            rest.find("```").map(|end| rest[..end].trim().to_string())
        } else {
            None
        };

        if let Some(candidate) = candidate {
            if let Ok(parsed) = serde_json::from_str::<RawExtraction>(&candidate) {
                return parsed;
            }
        }

        // Widest object span.
        if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
            if end > start {
                if let Ok(parsed) = serde_json::from_str::<RawExtraction>(&response[start..=end]) {
                    return parsed;
                }
            }
        }

        tracing::warn!(
            head = %response.chars().take(120).collect::<String>(),
            "unparseable extraction response"
        );
        RawExtraction::default()
    }

    fn normalize_entities(&self, entities: Vec<ExtractedEntity>) -> Vec<ExtractedEntity> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::new();

        for entity in entities {
            let name = entity.name.trim().to_string();
            let etype = {
                let t = entity.etype.trim();
                if t.is_empty() {
                    unknown_type()
                } else {
                    t.to_string()
                }
            };

            if name.chars().count() < self.config.min_entity_length {
                continue;
            }
            if seen.insert((name.clone(), etype.clone())) {
                normalized.push(ExtractedEntity { name, etype });
            }
        }
        normalized
    }

    fn normalize_relations(
        relations: Vec<ExtractedRelation>,
        valid_entities: &HashSet<&str>,
    ) -> Vec<ExtractedRelation> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::new();

        for relation in relations {
            let source = relation.source.trim().to_string();
            let target = relation.target.trim().to_string();
            let rtype = {
                let t = relation.rtype.trim();
                if t.is_empty() {
                    related_to()
                } else {
                    t.to_string()
                }
            };

            if source.is_empty() || target.is_empty() || source == target {
                continue;
            }
            // Both endpoints must survive entity normalization.
            if !valid_entities.contains(source.as_str()) || !valid_entities.contains(target.as_str())
            {
                continue;
            }
            if seen.insert((source.clone(), target.clone(), rtype.clone())) {
                normalized.push(ExtractedRelation {
                    source,
                    target,
                    rtype,
                });
            }
        }
        normalized
    }

    /// Extract entities and relations from one text. Inputs below the
    /// configured minimum length are skipped; `min_length_override` lets
    /// query-time callers lower that floor. Never returns an error.
    pub async fn extract(
        &self,
        text: &str,
        chunk_id: Option<String>,
        min_length_override: Option<usize>,
    ) -> Extraction {
        let min_length = min_length_override.unwrap_or(self.config.min_text_length);
        if text.chars().count() < min_length {
            tracing::debug!(
                length = text.chars().count(),
                min_length,
                "text below extraction floor, skipping"
            );
            return Extraction::empty(chunk_id);
        }

        let prompt = Self::build_prompt(text);
        let messages = [ChatMessage::user(prompt)];

        let response = match self
            .llm
            .chat(
                self.kind,
                &self.config.model,
                &messages,
                self.config.temperature,
                None,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("extraction LLM call failed: {}", e);
                return Extraction::empty(chunk_id);
            }
        };

        let raw = Self::parse_response(&response);
        let entities = self.normalize_entities(raw.entities);
        let valid: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let relations = Self::normalize_relations(raw.relations, &valid);

        tracing::debug!(
            entities = entities.len(),
            relations = relations.len(),
            "extraction complete"
        );
        Extraction {
            entities,
            relations,
            chunk_id,
        }
    }

    /// Concurrent extraction over many texts under a bounded semaphore.
    /// Per-task failures are isolated as empty per-task results.
    pub async fn batch_extract(
        &self,
        texts: Vec<(String, Option<String>)>,
        concurrency: Option<usize>,
    ) -> Vec<Extraction> {
        if texts.is_empty() {
            return Vec::new();
        }

        let concurrency = concurrency.unwrap_or(self.config.batch_size).max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        tracing::info!(total = texts.len(), concurrency, "batch extraction started");

        let tasks = texts.into_iter().map(|(text, chunk_id)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                self.extract(&text, chunk_id, None).await
            }
        });

        let results = join_all(tasks).await;

        let total_entities: usize = results.iter().map(|r| r.entities.len()).sum();
        let total_relations: usize = results.iter().map(|r| r.relations.len()).sum();
        tracing::info!(
            entities = total_entities,
            relations = total_relations,
            "batch extraction complete"
        );
        results
    }

    /// Merge many extraction results into unique entity and relation lists,
    /// using the same dedupe keys as normalization.
    pub fn merge(results: &[Extraction]) -> (Vec<ExtractedEntity>, Vec<ExtractedRelation>) {
        let mut entity_seen = HashSet::new();
        let mut entities = Vec::new();
        let mut relation_seen = HashSet::new();
        let mut relations = Vec::new();

        for result in results {
            for entity in &result.entities {
                if entity_seen.insert((entity.name.clone(), entity.etype.clone())) {
                    entities.push(entity.clone());
                }
            }
            for relation in &result.relations {
                if relation_seen.insert((
                    relation.source.clone(),
                    relation.target.clone(),
                    relation.rtype.clone(),
                )) {
                    relations.push(relation.clone());
                }
            }
        }

        (entities, relations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extraction(entities: &[(&str, &str)], relations: &[(&str, &str, &str)]) -> Extraction {
        Extraction {
            entities: entities
                .iter()
                .map(|(n, t)| ExtractedEntity {
                    name: n.to_string(),
                    etype: t.to_string(),
                })
                .collect(),
            relations: relations
                .iter()
                .map(|(s, t, r)| ExtractedRelation {
                    source: s.to_string(),
                    target: t.to_string(),
                    rtype: r.to_string(),
                })
                .collect(),
            chunk_id: None,
        }
    }

    #[test]
    fn test_parse_raw_json() {
        let raw = r#"{"entities": [{"name": "Alice", "type": "Person"}], "relations": []}"#;
        let parsed = EntityExtractor::parse_response(raw);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].name, "Alice");
        assert_eq!(parsed.entities[0].etype, "Person");
    }

    #[test]
    fn test_parse_fenced_json() {
        let fenced = "Here you go:\n```json\n{\"entities\": [{\"name\": \"Acme\", \"type\": \"Organization\"}], \"relations\": []}\n```\nDone.";
        let parsed = EntityExtractor::parse_response(fenced);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].name, "Acme");
    }

    #[test]
    fn test_parse_widest_span() {
        let chatty = "Sure! The result is {\"entities\": [{\"name\": \"Paris\", \"type\": \"Location\"}], \"relations\": []} — hope that helps.";
        let parsed = EntityExtractor::parse_response(chatty);
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].name, "Paris");
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        let parsed = EntityExtractor::parse_response("I could not find any entities, sorry!");
        assert!(parsed.entities.is_empty());
        assert!(parsed.relations.is_empty());
    }

    #[test]
    fn test_merge_dedupes() {
        let a = extraction(
            &[("Alice", "Person"), ("Acme", "Organization")],
            &[("Alice", "Acme", "works_at")],
        );
        let b = extraction(
            &[("Alice", "Person"), ("Paris", "Location")],
            &[("Alice", "Acme", "works_at"), ("Acme", "Paris", "located_in")],
        );

        let (entities, relations) = EntityExtractor::merge(&[a, b]);
        assert_eq!(entities.len(), 3);
        assert_eq!(relations.len(), 2);
    }

    #[test]
    fn test_normalize_relations_drops_invalid() {
        let valid: HashSet<&str> = ["Alice", "Acme"].into_iter().collect();
        let relations = vec![
            ExtractedRelation {
                source: " Alice ".into(),
                target: "Acme".into(),
                rtype: "works_at".into(),
            },
            // Self loop.
            ExtractedRelation {
                source: "Alice".into(),
                target: "Alice".into(),
                rtype: "knows".into(),
            },
            // Dangling endpoint.
            ExtractedRelation {
                source: "Alice".into(),
                target: "Ghost".into(),
                rtype: "knows".into(),
            },
            // Duplicate of the first after trimming.
            ExtractedRelation {
                source: "Alice".into(),
                target: "Acme".into(),
                rtype: "works_at".into(),
            },
        ];

        let normalized = EntityExtractor::normalize_relations(relations, &valid);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].rtype, "works_at");
    }
}
