//! Rescoring of fused retrieval results.
//!
//! [`Reranker`] produces a relevance score in [0,1] per candidate. The
//! built-in [`OverlapReranker`] combines cheap lexical signals and needs
//! no network; the [`HttpReranker`] calls a cross-encoder endpoint when
//! `reranker.model_id` is configured, falling back to the overlap scorer
//! on provider failure.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

use crate::config::RerankerConfig;
use crate::error::{Error, Result};
use crate::lexical::tokenize;
use crate::models::RetrievedChunk;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each text against the query; output aligns with input order,
    /// values in [0,1].
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;

    fn name(&self) -> &str;
}

/// Blend reranker scores into the candidates and sort. The original
/// retrieval score keeps a minority weight so a cross-encoder miss cannot
/// fully invert a strong retrieval signal.
pub fn apply_scores(chunks: &mut [RetrievedChunk], rerank_scores: &[f32]) {
    for (chunk, &score) in chunks.iter_mut().zip(rerank_scores) {
        chunk.score = (0.3 * chunk.score + 0.7 * score).clamp(0.0, 1.0);
    }
    chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

// ============ Overlap Scorer ============

/// Lexical-overlap reranker: exact phrase match, query-term coverage,
/// term density, early-position boost, and a mild length penalty.
pub struct OverlapReranker;

#[async_trait]
impl Reranker for OverlapReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let query_lower = query.to_lowercase();
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();

        Ok(texts
            .iter()
            .map(|text| overlap_score(&query_lower, &query_terms, text))
            .collect())
    }

    fn name(&self) -> &str {
        "overlap"
    }
}

fn overlap_score(query_lower: &str, query_terms: &HashSet<String>, text: &str) -> f32 {
    let text_lower = text.to_lowercase();
    let text_terms = tokenize(text);

    let exact = if !query_lower.trim().is_empty() && text_lower.contains(query_lower.trim()) {
        1.0
    } else {
        0.0
    };

    let coverage = if query_terms.is_empty() {
        0.0
    } else {
        let covered = query_terms
            .iter()
            .filter(|t| text_terms.iter().any(|x| x == *t))
            .count();
        covered as f32 / query_terms.len() as f32
    };

    let density = if text_terms.is_empty() {
        0.0
    } else {
        let hits = text_terms.iter().filter(|t| query_terms.contains(*t)).count();
        (hits as f32 / text_terms.len() as f32).min(1.0)
    };

    // Matches in the opening words signal a topical chunk, not a passing
    // mention.
    let position = text_terms
        .iter()
        .take(20)
        .any(|t| query_terms.contains(t)) as u8 as f32;

    let length_penalty = match text_terms.len() {
        0..=20 => 0.5,
        21..=600 => 1.0,
        _ => 0.7,
    };

    ((0.25 * exact + 0.35 * coverage + 0.2 * density + 0.2 * position) * length_penalty)
        .clamp(0.0, 1.0)
}

// ============ HTTP Cross-Encoder ============

/// Client for a `POST {api_base}/rerank` endpoint returning
/// `results[].{index, relevance_score}`.
pub struct HttpReranker {
    client: reqwest::Client,
    api_base: String,
    model: String,
    fallback: OverlapReranker,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .ok_or_else(|| Error::Config("reranker.api_base required with model_id".into()))?;
        let model = config
            .model_id
            .clone()
            .ok_or_else(|| Error::Config("reranker.model_id required".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            client,
            api_base,
            model,
            fallback: OverlapReranker,
        })
    }

    async fn call(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": texts,
        });
        let response = self
            .client
            .post(format!("{}/rerank", self.api_base))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        let json: serde_json::Value = response
            .error_for_status()
            .map_err(|e| Error::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Unavailable(e.to_string()))?;

        let results = json
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| Error::Unavailable("rerank response missing results".into()))?;

        let mut scores = vec![0.0f32; texts.len()];
        for item in results {
            let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let score = item
                .get("relevance_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0) as f32;
            if let Some(slot) = scores.get_mut(index) {
                *slot = score.clamp(0.0, 1.0);
            }
        }
        Ok(scores)
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        match self.call(query, texts).await {
            Ok(scores) => Ok(scores),
            Err(err) => {
                tracing::warn!("cross-encoder unavailable, using overlap scorer: {}", err);
                self.fallback.rerank(query, texts).await
            }
        }
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Build the reranker named by the configuration.
pub fn create_reranker(config: &RerankerConfig) -> Result<Box<dyn Reranker>> {
    match &config.model_id {
        Some(_) => Ok(Box::new(HttpReranker::new(config)?)),
        None => Ok(Box::new(OverlapReranker)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            doc_id: "d1".to_string(),
            page: 1,
            text: String::new(),
            score,
        }
    }

    #[tokio::test]
    async fn relevant_text_outscores_unrelated() {
        let scores = OverlapReranker
            .rerank(
                "refund policy duration",
                &[
                    "Our refund policy allows returns within thirty days of purchase.".to_string(),
                    "The office kitchen is cleaned every Friday afternoon.".to_string(),
                ],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[tokio::test]
    async fn exact_phrase_boosts() {
        let scores = OverlapReranker
            .rerank(
                "grace period",
                &[
                    "The grace period is fifteen days for all premium payments due.".to_string(),
                    "A period of grace may apply under some conditions for payments.".to_string(),
                ],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn apply_scores_blends_and_sorts() {
        let mut chunks = vec![chunk("a", 1.0), chunk("b", 0.2)];
        apply_scores(&mut chunks, &[0.0, 1.0]);
        // b: 0.3*0.2 + 0.7*1.0 = 0.76; a: 0.3*1.0 = 0.30
        assert_eq!(chunks[0].chunk_id, "b");
        assert!((chunks[0].score - 0.76).abs() < 1e-6);
        assert!((chunks[1].score - 0.30).abs() < 1e-6);
    }
}
