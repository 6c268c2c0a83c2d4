//! Text splitting strategies.
//!
//! Two strategies, chosen by configuration and input length:
//! - [`RecursiveSplitter`]: separator-priority splitting with overlap carry.
//! - [`SemanticSplitter`]: paragraph merging with optional LLM decisions.
//!
//! Selection rule: when semantic splitting is enabled and the input is
//! under `short_text_threshold` characters, use semantic merging with LLM
//! consultation; when enabled but longer, use semantic merging with rules
//! only; otherwise use the recursive splitter.

pub mod recursive;
pub mod semantic;

pub use recursive::RecursiveSplitter;
pub use semantic::{MergeDecider, SemanticSplitter};

use crate::config::TextConfig;

/// Which strategy [`TextSplitter::split`] will take for a given input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    SemanticLlm,
    SemanticRules,
    Recursive,
}

/// Strategy-selecting facade over both splitters.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    config: TextConfig,
}

impl TextSplitter {
    pub fn new(config: TextConfig) -> Self {
        Self { config }
    }

    /// Strategy for an input of `input_len` characters.
    pub fn strategy_for(&self, input_len: usize) -> SplitStrategy {
        let semantic = &self.config.semantic;
        if semantic.enabled && input_len < semantic.short_text_threshold {
            SplitStrategy::SemanticLlm
        } else if semantic.enabled {
            SplitStrategy::SemanticRules
        } else {
            SplitStrategy::Recursive
        }
    }

    /// Split `text` with the configured strategy. The decider is consulted
    /// only on the semantic-LLM path; chunks never exceed the configured
    /// maximum either way.
    pub async fn split(&self, text: &str, decider: Option<&dyn MergeDecider>) -> Vec<String> {
        let strategy = self.strategy_for(text.chars().count());
        let chunks = match strategy {
            SplitStrategy::SemanticLlm => {
                let splitter = SemanticSplitter::new(
                    self.config.semantic.max_chunk_size,
                    self.config.semantic.min_chunk_size,
                );
                splitter.split(text, decider).await
            }
            SplitStrategy::SemanticRules => {
                let splitter = SemanticSplitter::new(
                    self.config.semantic.max_chunk_size,
                    self.config.semantic.min_chunk_size,
                );
                splitter.split(text, None).await
            }
            SplitStrategy::Recursive => {
                RecursiveSplitter::new(self.config.chunk_size, self.config.chunk_overlap)
                    .split(text)
            }
        };

        tracing::debug!(
            ?strategy,
            input_chars = text.chars().count(),
            chunks = chunks.len(),
            "text split"
        );
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SemanticSplitConfig;

    fn config(semantic_enabled: bool) -> TextConfig {
        TextConfig {
            chunk_size: 800,
            chunk_overlap: 100,
            semantic: SemanticSplitConfig {
                enabled: semantic_enabled,
                max_chunk_size: 800,
                min_chunk_size: 200,
                provider: "remote".into(),
                model: "test".into(),
                short_text_threshold: 5000,
            },
        }
    }

    #[test]
    fn test_strategy_selection() {
        let splitter = TextSplitter::new(config(true));
        assert_eq!(splitter.strategy_for(1000), SplitStrategy::SemanticLlm);
        assert_eq!(splitter.strategy_for(10_000), SplitStrategy::SemanticRules);

        let splitter = TextSplitter::new(config(false));
        assert_eq!(splitter.strategy_for(1000), SplitStrategy::Recursive);
        assert_eq!(splitter.strategy_for(10_000), SplitStrategy::Recursive);
    }

    #[tokio::test]
    async fn test_recursive_path_respects_chunk_size() {
        let splitter = TextSplitter::new(config(false));
        let text = "Sentence one here. ".repeat(200);

        let chunks = splitter.split(&text, None).await;
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 800));
    }

    #[tokio::test]
    async fn test_semantic_rules_path_without_decider() {
        let splitter = TextSplitter::new(config(true));
        let text = format!("{}\n\n{}", "a".repeat(6000), "b".repeat(6000));

        // Over the threshold: rule-only semantic merge, still bounded.
        let chunks = splitter.split(&text, None).await;
        assert!(chunks.iter().all(|c| c.chars().count() <= 800));
    }
}
