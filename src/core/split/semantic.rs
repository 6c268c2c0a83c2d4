//! Semantic merge splitter.
//!
//! Segments text on paragraph separators, then greedily merges adjacent
//! segments while the accumulator stays under `max_chunk_size`. Once the
//! accumulator has grown past `min_chunk_size * 2`, a [`MergeDecider`] is
//! consulted with the accumulator's tail and the next segment's head; a
//! negative decision forces a cut. Post-processing force-splits oversized
//! chunks on sentence terminators and merges undersized chunks forward.
//!
//! Without a decider (or when the decider's backing LLM fails) the splitter
//! degrades to rule-only merging.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

/// Characters of accumulator tail / segment head shown to the decider.
const DECISION_WINDOW: usize = 200;

static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{2,}").expect("valid paragraph regex"));

static SENTENCE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(.*?[。！？.!?]+)").expect("valid sentence regex"));

/// Decides whether two adjacent passages belong to the same chunk.
#[async_trait]
pub trait MergeDecider: Send + Sync {
    /// `tail` is the end of the accumulated chunk, `head` the start of the
    /// next segment. Implementations must degrade to `false` on failure so
    /// a broken backend forces cuts instead of runaway chunks.
    async fn should_merge(&self, tail: &str, head: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct SemanticSplitter {
    max_chunk_size: usize,
    min_chunk_size: usize,
}

impl SemanticSplitter {
    pub fn new(max_chunk_size: usize, min_chunk_size: usize) -> Self {
        Self {
            max_chunk_size: max_chunk_size.max(1),
            min_chunk_size,
        }
    }

    /// Split with optional LLM merge decisions. `None` is the rule-only
    /// path.
    pub async fn split(&self, text: &str, decider: Option<&dyn MergeDecider>) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        if char_len(text) <= self.max_chunk_size {
            return vec![text.to_string()];
        }

        let paragraphs = split_paragraphs(text);
        if paragraphs.is_empty() {
            return Vec::new();
        }

        let merged = self.merge_paragraphs(paragraphs, decider).await;
        self.post_process(merged)
    }

    async fn merge_paragraphs(
        &self,
        paragraphs: Vec<String>,
        decider: Option<&dyn MergeDecider>,
    ) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut iter = paragraphs.into_iter();
        let mut current = match iter.next() {
            Some(first) => first,
            None => return chunks,
        };

        for next in iter {
            // A merge that would overflow is always a cut.
            if char_len(&current) + char_len(&next) > self.max_chunk_size {
                chunks.push(std::mem::replace(&mut current, next));
                continue;
            }

            // Once the accumulator is comfortably sized, let the decider
            // veto further growth.
            if char_len(&current) >= self.min_chunk_size * 2 {
                if let Some(decider) = decider {
                    let tail = char_tail(&current, DECISION_WINDOW);
                    let head = char_head(&next, DECISION_WINDOW);
                    if !decider.should_merge(&tail, &head).await {
                        chunks.push(std::mem::replace(&mut current, next));
                        continue;
                    }
                }
            }

            current.push_str("\n\n");
            current.push_str(&next);
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Force-split oversized chunks on sentence terminators, then merge
    /// undersized chunks with their successor where the sum fits.
    fn post_process(&self, chunks: Vec<String>) -> Vec<String> {
        let mut sized = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if char_len(&chunk) > self.max_chunk_size {
                sized.extend(self.force_split(&chunk));
            } else {
                sized.push(chunk);
            }
        }

        let mut out: Vec<String> = Vec::with_capacity(sized.len());
        let mut i = 0;
        while i < sized.len() {
            let chunk = &sized[i];
            if char_len(chunk) < self.min_chunk_size && i + 1 < sized.len() {
                let next = &sized[i + 1];
                if char_len(chunk) + char_len(next) + 2 <= self.max_chunk_size {
                    out.push(format!("{}\n\n{}", chunk, next));
                    i += 2;
                    continue;
                }
            }
            out.push(chunk.clone());
            i += 1;
        }
        out
    }

    fn force_split(&self, text: &str) -> Vec<String> {
        let mut sentences: Vec<String> = SENTENCE_SPLIT
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect();

        // Trailing text without a terminator.
        let matched: usize = sentences.iter().map(|s| s.len()).sum();
        if matched < text.len() {
            sentences.push(text[matched..].to_string());
        }

        let mut chunks = Vec::new();
        let mut current = String::new();
        for sentence in sentences {
            // A single terminator-free run over the cap gets a fixed cut.
            if char_len(&sentence) > self.max_chunk_size {
                if !current.trim().is_empty() {
                    chunks.push(std::mem::take(&mut current).trim().to_string());
                } else {
                    current.clear();
                }
                let glyphs: Vec<char> = sentence.chars().collect();
                chunks.extend(
                    glyphs
                        .chunks(self.max_chunk_size)
                        .map(|w| w.iter().collect::<String>()),
                );
                continue;
            }

            if !current.is_empty()
                && char_len(&current) + char_len(&sentence) > self.max_chunk_size
            {
                chunks.push(std::mem::take(&mut current).trim().to_string());
            }
            current.push_str(&sentence);
        }
        if !current.trim().is_empty() {
            chunks.push(current.trim().to_string());
        }

        chunks
    }
}

fn split_paragraphs(text: &str) -> Vec<String> {
    PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn char_tail(s: &str, n: usize) -> String {
    let len = char_len(s);
    s.chars().skip(len.saturating_sub(n)).collect()
}

fn char_head(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Decider that always refuses and counts consultations.
    struct AlwaysCut {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MergeDecider for AlwaysCut {
        async fn should_merge(&self, _tail: &str, _head: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    struct AlwaysMerge;

    #[async_trait]
    impl MergeDecider for AlwaysMerge {
        async fn should_merge(&self, _tail: &str, _head: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_short_text_passes_through() {
        let splitter = SemanticSplitter::new(100, 10);
        assert_eq!(splitter.split("short", None).await, vec!["short"]);
        assert!(splitter.split("", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_rule_only_merges_up_to_max() {
        let splitter = SemanticSplitter::new(30, 5);
        let text = "aaaaaaaaaa\n\nbbbbbbbbbb\n\ncccccccccc\n\ndddddddddd";

        let chunks = splitter.split(text, None).await;
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(char_len(chunk) <= 30);
        }
        // First two paragraphs fit together (10 + 10 <= 30 with separator).
        assert!(chunks[0].contains("aaaaaaaaaa"));
        assert!(chunks[0].contains("bbbbbbbbbb"));
    }

    #[tokio::test]
    async fn test_decider_gate_respects_min_size() {
        // min*2 = 20; the decider must not be asked before the accumulator
        // reaches that size.
        let decider = AlwaysCut { calls: AtomicUsize::new(0) };
        let splitter = SemanticSplitter::new(200, 10);
        let text = "aaaaa\n\nbbbbb\n\ncccccccccccccccccccccccc\n\nddddd";

        let chunks = splitter.split(text, Some(&decider)).await;
        assert!(decider.calls.load(Ordering::SeqCst) >= 1);
        assert!(chunks.len() >= 2);
    }

    #[tokio::test]
    async fn test_negative_decision_forces_cut() {
        let decider = AlwaysCut { calls: AtomicUsize::new(0) };
        let splitter = SemanticSplitter::new(1000, 5);
        let a = "a".repeat(20);
        let b = "b".repeat(20);
        let text = format!("{}\n\n{}", a, b);

        let chunks = splitter.split(&text, Some(&decider)).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[tokio::test]
    async fn test_positive_decision_merges() {
        let splitter = SemanticSplitter::new(1000, 5);
        let a = "a".repeat(20);
        let b = "b".repeat(20);
        let text = format!("{}\n\n{}", a, b);

        let chunks = splitter.split(&text, Some(&AlwaysMerge)).await;
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_chunk_force_split_on_sentences() {
        let splitter = SemanticSplitter::new(40, 5);
        // One paragraph, far over max, with sentence boundaries.
        let text = "First sentence here. Second sentence here. Third sentence here. Fourth sentence here.";

        let chunks = splitter.split(text, None).await;
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(char_len(chunk) <= 40, "chunk too long: {:?}", chunk);
        }
    }

    #[tokio::test]
    async fn test_undersized_tail_merges_forward() {
        let splitter = SemanticSplitter::new(100, 30);
        let text = format!("{}\n\n{}", "a".repeat(50), "tiny");

        let chunks = splitter.split(&text, None).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("tiny"));
    }
}
