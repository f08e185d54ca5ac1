//! Embedding providers.
//!
//! Defines the [`Embedder`] capability and two implementations:
//! - **[`HttpEmbedder`]** — OpenAI-compatible `POST {api_base}/embeddings`
//!   with batching, capped exponential backoff, and jitter.
//! - **[`NullEmbedder`]** — deterministic bag-of-words random projection,
//!   used in tests and offline deployments. No I/O.
//!
//! Every vector leaving this module is L2-normalized, so inner-product
//! search over them equals cosine similarity.
//!
//! # Retry Strategy (HTTP)
//!
//! - HTTP 429 and 5xx → retry with backoff (1s, 2s, 4s, ... capped at 32s)
//!   plus up to 250ms of jitter
//! - other 4xx → fail immediately
//! - network errors → retry
//!
//! Callers treat a returned error as terminal for the current request.

use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::chunk::count_tokens;
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one batch of texts, returning unit vectors in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Embed an arbitrary number of texts, splitting into batches bounded by
/// both count and summed token estimate.
pub async fn embed_all(
    embedder: &dyn Embedder,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    let mut batch: Vec<String> = Vec::new();
    let mut batch_tokens = 0usize;

    for text in texts {
        let tokens = count_tokens(text);
        let full = batch.len() >= config.batch_size
            || (!batch.is_empty() && batch_tokens + tokens > config.max_batch_tokens);
        if full {
            out.extend(embedder.embed(&batch).await?);
            batch.clear();
            batch_tokens = 0;
        }
        batch.push(text.clone());
        batch_tokens += tokens;
    }
    if !batch.is_empty() {
        out.extend(embedder.embed(&batch).await?);
    }
    Ok(out)
}

/// Normalize to unit L2 length in place. An all-zero vector becomes a unit
/// vector on the first axis so the index never stores a degenerate entry.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    } else if let Some(first) = v.first_mut() {
        *first = 1.0;
    }
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============ Null Provider ============

/// Deterministic offline embedder.
///
/// Each token is hashed into a handful of signed positions; a text's
/// vector is the normalized sum over its tokens. Texts sharing vocabulary
/// land near each other, which is enough signal for tests and for the
/// lexical-degraded mode to be exercised realistically.
pub struct NullEmbedder {
    dims: usize,
}

impl NullEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; self.dims];
                for token in text.to_lowercase().split_whitespace() {
                    let digest = Sha256::digest(token.as_bytes());
                    for pair in digest.chunks_exact(4).take(4) {
                        let idx =
                            u16::from_le_bytes([pair[0], pair[1]]) as usize % self.dims;
                        let sign = if pair[2] & 1 == 0 { 1.0 } else { -1.0 };
                        v[idx] += sign;
                    }
                }
                normalize(&mut v);
                v
            })
            .collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "null"
    }
}

// ============ HTTP Provider ============

/// OpenAI-compatible embedding client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .ok_or_else(|| Error::Config("embedding.api_base required".into()))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("embedding.model required".into()))?;
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            Error::Config(format!("{} environment variable not set", config.api_key_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            client,
            api_base,
            api_key,
            model,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.api_base))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::EmbeddingFailure(e.to_string()))?;
                        let mut vectors = parse_embedding_response(&json)?;
                        for v in &mut vectors {
                            normalize(v);
                        }
                        return Ok(vectors);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    let err = Error::EmbeddingFailure(format!("{}: {}", status, body_text));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(Error::EmbeddingFailure(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::EmbeddingFailure("embedding failed after retries".into())))
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Exponential backoff capped at 32s, plus up to 250ms of jitter so
/// concurrent ingests do not retry in lockstep.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << (attempt - 1).min(5));
    base + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

/// Parse `data[].embedding` honoring the `index` field: some providers
/// return entries out of order.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::EmbeddingFailure("response missing data array".into()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::EmbeddingFailure("response item missing embedding".into()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Build the embedder named by the configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "null" => Ok(Box::new(NullEmbedder::new(config.dims))),
        "http" => Ok(Box::new(HttpEmbedder::new(config)?)),
        other => Err(Error::Config(format!("unknown embedding provider: {}", other))),
    }
}
