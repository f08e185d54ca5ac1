//! Deterministic token-window chunker.
//!
//! Splits page-tagged text into overlapping windows of at most
//! `target_tokens` tokens, snapping window ends backward to sentence
//! boundaries when that leaves at least `min_tokens`. Given identical
//! input and configuration the output is identical bit for bit; chunk
//! text is always an exact substring of the normalized input.

use crate::config::ChunkConfig;
use crate::models::{ChunkPiece, PageText};

/// A token is a maximal run of non-whitespace, addressed by byte offsets.
#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;

    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                tokens.push(Token { start: s, end: i });
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            start: s,
            end: text.len(),
        });
    }
    tokens
}

/// Token count under the built-in tokenizer. Shared with the context
/// compressor and the rate limiter's estimates.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// True when a sentence may end after token `i`: the token closes with a
/// terminator, or a newline separates it from a following capitalized
/// token. End of input always qualifies.
fn is_sentence_end(text: &str, tokens: &[Token], i: usize) -> bool {
    let tok = &tokens[i];
    let token_text = &text[tok.start..tok.end];
    if token_text.ends_with(['.', '!', '?']) {
        return true;
    }
    match tokens.get(i + 1) {
        None => true,
        Some(next) => {
            let gap = &text[tok.end..next.start];
            gap.contains('\n')
                && text[next.start..next.end]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_uppercase())
        }
    }
}

/// Split pages into chunks.
///
/// Pages are concatenated with a blank line; each chunk is tagged with the
/// page of its first token. A document shorter than `min_tokens` yields
/// exactly one chunk. A trailing window smaller than `min_tokens` that is
/// fully contained in the previous window's overlap is dropped.
pub fn chunk_pages(pages: &[PageText], config: &ChunkConfig) -> Vec<ChunkPiece> {
    // Concatenate pages, remembering where each starts.
    let mut text = String::new();
    let mut page_starts: Vec<(usize, u32)> = Vec::with_capacity(pages.len());
    for page in pages {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        page_starts.push((text.len(), page.page));
        text.push_str(&page.text);
    }

    let page_for = |offset: usize| -> u32 {
        match page_starts.binary_search_by(|(start, _)| start.cmp(&offset)) {
            Ok(i) => page_starts[i].1,
            Err(0) => page_starts.first().map(|(_, p)| *p).unwrap_or(1),
            Err(i) => page_starts[i - 1].1,
        }
    };

    let tokens = tokenize(&text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let n = tokens.len();
    let mut pieces: Vec<ChunkPiece> = Vec::new();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + config.target_tokens).min(n);
        let mut end = hard_end;

        // Snap backward to the nearest sentence end that keeps the window
        // at or above min_tokens. Only interior windows snap; the final
        // window always runs to the end of input.
        if hard_end < n {
            for j in (start..hard_end).rev() {
                let len = j + 1 - start;
                if len < config.min_tokens {
                    break;
                }
                if is_sentence_end(&text, &tokens, j) {
                    end = j + 1;
                    break;
                }
            }
        }

        let first = tokens[start];
        let last = tokens[end - 1];
        pieces.push(ChunkPiece {
            ordinal: pieces.len(),
            text: text[first.start..last.end].to_string(),
            token_count: end - start,
            page: page_for(first.start),
        });
        ranges.push((start, end));

        if end >= n {
            break;
        }
        // Next window begins overlap_tokens before this one ended, and
        // must advance by at least one token.
        start = (end.saturating_sub(config.overlap_tokens)).max(start + 1);
    }

    // A short tail fully covered by the previous window's overlap adds
    // nothing retrievable.
    if pieces.len() >= 2 {
        let (last_start, last_end) = ranges[ranges.len() - 1];
        let (_, prev_end) = ranges[ranges.len() - 2];
        if last_end - last_start < config.min_tokens && last_end <= prev_end {
            pieces.pop();
        }
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(target: usize, overlap: usize, min: usize) -> ChunkConfig {
        ChunkConfig {
            target_tokens: target,
            overlap_tokens: overlap,
            min_tokens: min,
            ..ChunkConfig::default()
        }
    }

    fn page(n: u32, text: &str) -> PageText {
        PageText {
            page: n,
            text: text.to_string(),
        }
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn short_document_single_chunk() {
        let pages = vec![page(1, "Just a few words here.")];
        let pieces = chunk_pages(&pages, &config(450, 80, 100));
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].ordinal, 0);
        assert_eq!(pieces[0].token_count, 5);
        assert_eq!(pieces[0].page, 1);
    }

    #[test]
    fn ordinals_dense_and_zero_based() {
        let pages = vec![page(1, &words(1000))];
        let pieces = chunk_pages(&pages, &config(100, 20, 10));
        assert!(pieces.len() > 1);
        for (i, piece) in pieces.iter().enumerate() {
            assert_eq!(piece.ordinal, i);
        }
    }

    #[test]
    fn windows_overlap() {
        let pages = vec![page(1, &words(300))];
        let pieces = chunk_pages(&pages, &config(100, 20, 10));
        // Second window restarts 20 tokens before the first ended.
        let first_words: Vec<&str> = pieces[0].text.split_whitespace().collect();
        let second_words: Vec<&str> = pieces[1].text.split_whitespace().collect();
        assert_eq!(&first_words[first_words.len() - 20..], &second_words[..20]);
    }

    #[test]
    fn snaps_to_sentence_boundary() {
        // 30 tokens ending in a period, then more text; target 40 with a
        // min of 10 should cut right after the period.
        let text = format!("{} end.\n{}", words(29), words(40));
        let pages = vec![page(1, &text)];
        let pieces = chunk_pages(&pages, &config(40, 5, 10));
        assert!(pieces[0].text.ends_with("end."));
        assert_eq!(pieces[0].token_count, 30);
    }

    #[test]
    fn hard_boundary_when_no_sentence_end_fits() {
        let pages = vec![page(1, &words(200))];
        let pieces = chunk_pages(&pages, &config(50, 10, 10));
        assert_eq!(pieces[0].token_count, 50);
    }

    #[test]
    fn page_of_first_token() {
        let pages = vec![page(1, &words(60)), page(2, &words(60))];
        let pieces = chunk_pages(&pages, &config(50, 10, 10));
        assert_eq!(pieces[0].page, 1);
        let last = pieces.last().unwrap();
        assert_eq!(last.page, 2);
    }

    #[test]
    fn no_trailing_chunk_is_fully_covered_by_overlap() {
        // Whatever the layout, the final chunk must contribute tokens
        // beyond the previous chunk's end.
        for total in [101usize, 150, 199, 230] {
            let tail: String = (1000..1000 + (total - 96))
                .map(|i| format!("word{}", i))
                .collect::<Vec<_>>()
                .join(" ");
            let text = format!("{} done. {}", words(94), tail);
            let pages = vec![page(1, &text)];
            let pieces = chunk_pages(&pages, &config(100, 10, 20));
            if pieces.len() >= 2 {
                let prev = &pieces[pieces.len() - 2];
                let last = pieces.last().unwrap();
                // Words are unique in the fixture, so a tail that ends on
                // the same word as its predecessor contributed nothing.
                assert_ne!(
                    prev.text.split_whitespace().last(),
                    last.text.split_whitespace().last(),
                    "trailing chunk added no new tokens"
                );
            }
        }
    }

    #[test]
    fn deterministic() {
        let pages = vec![page(1, &words(500)), page(2, &words(300))];
        let cfg = config(120, 30, 40);
        let a = chunk_pages(&pages, &cfg);
        let b = chunk_pages(&pages, &cfg);
        assert_eq!(a, b);
    }

    #[test]
    fn chunk_text_is_exact_substring() {
        let body = format!("{}. Next sentence starts here and {}", words(120), words(120));
        let pages = vec![page(1, &body)];
        for piece in chunk_pages(&pages, &config(100, 20, 30)) {
            assert!(body.contains(&piece.text));
            assert_eq!(piece.token_count, count_tokens(&piece.text));
        }
    }

    #[test]
    fn empty_pages_give_no_chunks() {
        let pieces = chunk_pages(&[], &config(100, 20, 10));
        assert!(pieces.is_empty());
    }
}
