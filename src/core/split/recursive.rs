//! Recursive separator splitter.
//!
//! Splits text on separators in priority order — paragraph break, line
//! break, CJK and ASCII sentence terminators, space — refining only pieces
//! that still exceed the budget, with a fixed-width cut as the last resort.
//! The refinement loop is iterative; input shape cannot grow the call
//! stack. Separators stay attached to the piece on their left, so the
//! concatenation of the produced base chunks reproduces the input exactly.
//!
//! Overlap is applied post-hoc: the last `chunk_overlap` characters of
//! chunk i-1 are prepended to chunk i. Base chunks are capped at
//! `chunk_size - chunk_overlap` characters, so every emitted chunk is at
//! most `chunk_size` characters.
//!
//! All length accounting is in characters, not bytes.

/// Separator priority order. The empty-string last resort is handled as a
/// fixed-width cut rather than a separator.
const SEPARATORS: &[&str] = &[
    "\n\n", "\n", "。", "！", "？", "；", "，", ". ", "! ", "? ", "; ", ", ", " ",
];

#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveSplitter {
    /// `chunk_overlap` is clamped below `chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Split `text` into chunks of at most `chunk_size` characters with
    /// `chunk_overlap` characters of tail carry between neighbors.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        if char_len(text) <= self.chunk_size {
            return vec![text.to_string()];
        }

        let budget = self.chunk_size - self.chunk_overlap;
        let pieces = split_to_budget(text, budget);
        let base = merge_to_budget(pieces, budget);
        self.apply_overlap(base)
    }

    fn apply_overlap(&self, base: Vec<String>) -> Vec<String> {
        let mut chunks: Vec<String> = Vec::with_capacity(base.len());

        for piece in base {
            if piece.trim().is_empty() {
                continue;
            }

            let chunk = match chunks.last() {
                Some(prev) if self.chunk_overlap > 0 => {
                    let tail = char_tail(prev, self.chunk_overlap);
                    if piece.starts_with(&tail) {
                        piece
                    } else {
                        format!("{}{}", tail, piece)
                    }
                }
                _ => piece,
            };
            chunks.push(chunk);
        }

        chunks
    }
}

/// Refine pieces with progressively finer separators until each fits the
/// budget, ending with a fixed-width cut for anything still oversized.
fn split_to_budget(text: &str, budget: usize) -> Vec<String> {
    let mut pieces = vec![text.to_string()];

    for sep in SEPARATORS {
        if pieces.iter().all(|p| char_len(p) <= budget) {
            break;
        }

        let mut refined = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if char_len(&piece) <= budget {
                refined.push(piece);
            } else {
                refined.extend(split_keep_separator(&piece, sep));
            }
        }
        pieces = refined;
    }

    let mut out = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if char_len(&piece) <= budget {
            out.push(piece);
        } else {
            out.extend(fixed_cut(&piece, budget));
        }
    }
    out
}

/// Split on a separator, keeping the separator attached to the left piece.
fn split_keep_separator(text: &str, sep: &str) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let raw: Vec<&str> = text.split(sep).collect();
    let last = raw.len() - 1;

    for (i, part) in raw.into_iter().enumerate() {
        let piece = if i < last {
            format!("{}{}", part, sep)
        } else {
            part.to_string()
        };
        if !piece.is_empty() {
            parts.push(piece);
        }
    }
    parts
}

/// Last resort: cut into fixed-width character windows.
fn fixed_cut(text: &str, budget: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(budget.max(1))
        .map(|window| window.iter().collect())
        .collect()
}

/// Greedily merge adjacent pieces while the accumulator stays within the
/// budget, so chunks approach the budget instead of one-piece-per-sentence.
fn merge_to_budget(pieces: Vec<String>, budget: usize) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let mut acc = String::new();
    let mut acc_len = 0usize;

    for piece in pieces {
        let piece_len = char_len(&piece);
        if acc.is_empty() {
            acc = piece;
            acc_len = piece_len;
        } else if acc_len + piece_len <= budget {
            acc.push_str(&piece);
            acc_len += piece_len;
        } else {
            merged.push(std::mem::take(&mut acc));
            acc = piece;
            acc_len = piece_len;
        }
    }
    if !acc.is_empty() {
        merged.push(acc);
    }
    merged
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// The last `n` characters of `s` (all of `s` when shorter).
fn char_tail(s: &str, n: usize) -> String {
    let len = char_len(s);
    s.chars().skip(len.saturating_sub(n)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_short_text_passes_through() {
        let splitter = RecursiveSplitter::new(100, 10);
        assert_eq!(splitter.split("short text"), vec!["short text"]);
        assert!(splitter.split("").is_empty());
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let splitter = RecursiveSplitter::new(20, 0);
        let chunks = splitter.split("first paragraph\n\nsecond paragraph");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "first paragraph\n\n");
        assert_eq!(chunks[1], "second paragraph");
    }

    #[test]
    fn test_hello_world_scenario() {
        // chunk_size 5, overlap 0: "hello\n\nworld" becomes two chunks.
        let splitter = RecursiveSplitter::new(5, 0);
        let chunks = splitter.split("hello\n\nworld");
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("hello"));
        assert_eq!(chunks[1], "world");
    }

    #[rstest]
    #[case(800, 100)]
    #[case(200, 50)]
    #[case(64, 16)]
    fn test_chunk_size_invariant(#[case] chunk_size: usize, #[case] overlap: usize) {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text: String = sentence.repeat(250); // ~11,500 chars
        let splitter = RecursiveSplitter::new(chunk_size, overlap);

        let chunks = splitter.split(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(
                char_len(chunk) <= chunk_size,
                "chunk of {} chars exceeds {}",
                char_len(chunk),
                chunk_size
            );
        }
    }

    #[test]
    fn test_overlap_is_shared_between_neighbors() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text: String = sentence.repeat(250);
        let splitter = RecursiveSplitter::new(800, 100);

        let chunks = splitter.split(&text);
        for window in chunks.windows(2) {
            let tail = char_tail(&window[0], 100);
            let head: String = window[1].chars().take(char_len(&tail)).collect();
            assert_eq!(tail, head, "consecutive chunks must share the overlap");
        }
    }

    #[test]
    fn test_concatenation_reconstructs_input() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text: String = sentence.repeat(250);
        let splitter = RecursiveSplitter::new(800, 100);

        let chunks = splitter.split(&text);
        let mut rebuilt = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                rebuilt.push_str(chunk);
            } else {
                let overlap_len = char_len(&char_tail(&chunks[i - 1], 100));
                rebuilt.push_str(&chunk.chars().skip(overlap_len).collect::<String>());
            }
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_cjk_sentence_terminators() {
        let text = "这是第一句话。这是第二句话。这是第三句话。".repeat(10);
        let splitter = RecursiveSplitter::new(20, 0);

        let chunks = splitter.split(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(char_len(chunk) <= 20);
        }
        // Boundary landed on a sentence terminator, not mid-character.
        assert!(chunks[0].ends_with('。'));
    }

    #[test]
    fn test_unbroken_text_falls_back_to_fixed_cut() {
        let text = "x".repeat(1000);
        let splitter = RecursiveSplitter::new(100, 0);

        let chunks = splitter.split(&text);
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| char_len(c) == 100));
    }

    #[test]
    fn test_overlap_clamped_below_chunk_size() {
        let splitter = RecursiveSplitter::new(10, 50);
        let chunks = splitter.split(&"a ".repeat(50));
        for chunk in &chunks {
            assert!(char_len(chunk) <= 10);
        }
    }
}
