//! Per-tenant BM25 retrieval over chunk text.
//!
//! The index is built lazily on the first query after a tenant's chunk set
//! changes and memoized until the next ingest or delete invalidates it
//! ([`LexicalCache`]). Build cost is linear in the tenant's chunks; no
//! state is persisted.

use std::collections::HashMap;
use std::sync::Arc;

/// BM25 term-frequency saturation.
const BM25_K1: f32 = 1.2;
/// BM25 length normalization.
const BM25_B: f32 = 0.75;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "been", "being", "have", "has", "had", "does",
    "did", "will", "would", "could", "should", "may", "might", "must", "shall", "can", "this",
    "that", "these", "those", "with", "from", "into", "about", "its", "but", "not", "you",
    "your",
];

/// Lowercase, split on non-alphanumeric, keep terms longer than two
/// characters that are not stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

pub struct LexicalIndex {
    chunk_ids: Vec<String>,
    doc_lengths: Vec<u32>,
    avg_doc_len: f32,
    /// term → postings of (chunk position, term frequency).
    postings: HashMap<String, Vec<(u32, f32)>>,
}

impl LexicalIndex {
    pub fn build(chunks: &[(String, String)]) -> Self {
        let mut postings: HashMap<String, Vec<(u32, f32)>> = HashMap::new();
        let mut chunk_ids = Vec::with_capacity(chunks.len());
        let mut doc_lengths = Vec::with_capacity(chunks.len());
        let mut total_len = 0u64;

        for (pos, (chunk_id, text)) in chunks.iter().enumerate() {
            let tokens = tokenize(text);
            doc_lengths.push(tokens.len() as u32);
            total_len += tokens.len() as u64;
            chunk_ids.push(chunk_id.clone());

            let mut freqs: HashMap<String, f32> = HashMap::new();
            for token in tokens {
                *freqs.entry(token).or_insert(0.0) += 1.0;
            }
            for (term, tf) in freqs {
                postings.entry(term).or_default().push((pos as u32, tf));
            }
        }

        let avg_doc_len = if chunks.is_empty() {
            0.0
        } else {
            total_len as f32 / chunks.len() as f32
        };

        Self {
            chunk_ids,
            doc_lengths,
            avg_doc_len,
            postings,
        }
    }

    pub fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    /// Top-k chunks by summed BM25 over the query terms. Chunks matching
    /// no term are not returned. Ties break toward build order.
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        if self.is_empty() || k == 0 {
            return Vec::new();
        }
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let doc_count = self.chunk_ids.len() as u32;
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for term in &terms {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let doc_freq = postings.len() as u32;
            for &(pos, tf) in postings {
                let score = bm25_score(
                    tf,
                    self.doc_lengths[pos as usize],
                    self.avg_doc_len,
                    doc_count,
                    doc_freq,
                );
                *scores.entry(pos).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(u32, f32)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(k);

        ranked
            .into_iter()
            .map(|(pos, score)| (self.chunk_ids[pos as usize].clone(), score))
            .collect()
    }
}

/// Classic BM25 with the +1 idf smoothing.
fn bm25_score(tf: f32, doc_len: u32, avg_doc_len: f32, doc_count: u32, doc_freq: u32) -> f32 {
    if doc_freq == 0 || doc_count == 0 || avg_doc_len == 0.0 {
        return 0.0;
    }
    let n = doc_freq as f32;
    let big_n = doc_count as f32;
    let idf = ((big_n - n + 0.5) / (n + 0.5) + 1.0).ln();
    let dl = doc_len as f32;
    let tf_component =
        (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avg_doc_len));
    idf * tf_component
}

/// Memoized per-tenant lexical indexes, invalidated on any chunk change.
#[derive(Default)]
pub struct LexicalCache {
    inner: std::sync::Mutex<HashMap<String, Arc<LexicalIndex>>>,
}

impl LexicalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<LexicalIndex>> {
        self.inner.lock().unwrap().get(tenant_id).cloned()
    }

    pub fn put(&self, tenant_id: &str, index: Arc<LexicalIndex>) {
        self.inner
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), index);
    }

    /// Called after any successful ingest or delete for the tenant; the
    /// rebuild is deferred to the next query.
    pub fn invalidate(&self, tenant_id: &str) {
        self.inner.lock().unwrap().remove(tenant_id);
    }
}
