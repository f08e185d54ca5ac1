//! Token-budgeted context selection.
//!
//! Greedy in rerank order: a chunk is kept when it still fits the
//! remaining budget. A chunk larger than the entire budget is truncated
//! to the last sentence boundary inside the budget (hard-cut when no
//! sentence fits) so a single oversized chunk cannot starve the prompt.

use crate::chunk::count_tokens;
use crate::models::RetrievedChunk;

pub fn compress(chunks: &[RetrievedChunk], budget_tokens: usize) -> Vec<RetrievedChunk> {
    let mut selected = Vec::new();
    let mut used = 0usize;

    for chunk in chunks {
        let tokens = count_tokens(&chunk.text);
        if used + tokens <= budget_tokens {
            selected.push(chunk.clone());
            used += tokens;
            continue;
        }
        if selected.is_empty() && tokens > budget_tokens {
            let truncated = truncate_to_sentence(&chunk.text, budget_tokens);
            let truncated_tokens = count_tokens(&truncated);
            selected.push(RetrievedChunk {
                text: truncated,
                ..chunk.clone()
            });
            used += truncated_tokens;
        }
        // Otherwise skip and keep scanning: a smaller chunk further down
        // may still fit.
    }

    selected
}

/// Longest prefix ending on a sentence terminator within `budget` tokens;
/// a hard cut at the budget when no terminator fits.
fn truncate_to_sentence(text: &str, budget: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let cut = budget.min(words.len());

    let mut sentence_cut = None;
    for i in (0..cut).rev() {
        if words[i].ends_with(['.', '!', '?']) {
            sentence_cut = Some(i + 1);
            break;
        }
    }

    words[..sentence_cut.unwrap_or(cut)].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            doc_id: "d1".to_string(),
            page: 1,
            text: text.to_string(),
            score,
        }
    }

    #[test]
    fn keeps_chunks_within_budget_in_order() {
        let chunks = vec![
            chunk("a", "one two three", 0.9),
            chunk("b", "four five six", 0.8),
            chunk("c", "seven eight nine", 0.7),
        ];
        let selected = compress(&chunks, 7);
        let ids: Vec<&str> = selected.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn skips_oversized_then_takes_smaller() {
        let chunks = vec![
            chunk("a", "one two three four", 0.9),
            chunk("b", "this chunk has rather many tokens inside it", 0.8),
            chunk("c", "tiny bit", 0.7),
        ];
        let selected = compress(&chunks, 6);
        let ids: Vec<&str> = selected.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn single_oversized_chunk_truncates_at_sentence() {
        let text = "First sentence here. Second sentence follows. Third one is never reached at all";
        let chunks = vec![chunk("a", text, 0.9)];
        let selected = compress(&chunks, 5);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].text, "First sentence here.");
    }

    #[test]
    fn oversized_without_sentence_hard_cuts() {
        let text = "w1 w2 w3 w4 w5 w6 w7 w8 w9 w10";
        let chunks = vec![chunk("a", text, 0.9)];
        let selected = compress(&chunks, 4);
        assert_eq!(selected[0].text, "w1 w2 w3 w4");
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(compress(&[], 100).is_empty());
    }
}
