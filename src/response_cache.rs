//! Fingerprint-keyed response cache with single-flight builds.
//!
//! The key is a SHA-256 over `(tenant, normalized question, sorted doc
//! scope, pipeline version)`. Entries expire by TTL and are invalidated
//! tenant-wide in O(1): each tenant has a monotonic epoch, entries record
//! the epoch current when their build *started*, and any entry from an
//! older epoch is treated as absent. Ingest and delete bump the epoch
//! after publishing, so a served entry either predates the change (and is
//! invalidated) or was built against the new state.
//!
//! `get_or_build` gives single-flight semantics per key: concurrent
//! callers await one execution and share its result. Errors are never
//! cached.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::models::{Confidence, SourceRef};

/// Bumped whenever pipeline behavior changes in a way that invalidates
/// previously cached answers.
pub const PIPELINE_VERSION: &str = "ragline-pipeline/1";

const SHARD_COUNT: usize = 16;

/// The cached payload: everything needed to answer without re-running the
/// pipeline.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: Confidence,
    pub suggestions: Vec<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    /// Set on answers produced through a dependency-failure fallback.
    /// Degraded answers are served but never stored: the next request
    /// retries the full pipeline.
    pub degraded: bool,
}

impl CachedAnswer {
    pub fn tokens_used(&self) -> i64 {
        self.tokens_in + self.tokens_out
    }
}

struct Entry {
    value: CachedAnswer,
    created: Instant,
    epoch: u64,
}

pub struct ResponseCache {
    ttl: Duration,
    shards: Vec<std::sync::Mutex<HashMap<String, Entry>>>,
    epochs: std::sync::Mutex<HashMap<String, u64>>,
    inflight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Collapse whitespace and case so trivially reworded repeats hit.
pub fn normalize_question(question: &str) -> String {
    question
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pure function of `(tenant, question, scope, pipeline version)`.
pub fn fingerprint(tenant_id: &str, question: &str, doc_scope: Option<&[String]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_question(question).as_bytes());
    hasher.update([0u8]);
    if let Some(scope) = doc_scope {
        let mut sorted: Vec<&String> = scope.iter().collect();
        sorted.sort();
        for doc_id in sorted {
            hasher.update(doc_id.as_bytes());
            hasher.update([1u8]);
        }
    }
    hasher.update([0u8]);
    hasher.update(PIPELINE_VERSION.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            shards: (0..SHARD_COUNT)
                .map(|_| std::sync::Mutex::new(HashMap::new()))
                .collect(),
            epochs: std::sync::Mutex::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn shard(&self, key: &str) -> &std::sync::Mutex<HashMap<String, Entry>> {
        let index = key.as_bytes().first().copied().unwrap_or(0) as usize % SHARD_COUNT;
        &self.shards[index]
    }

    pub fn epoch(&self, tenant_id: &str) -> u64 {
        *self.epochs.lock().unwrap().get(tenant_id).unwrap_or(&0)
    }

    /// Invalidate every cached answer for the tenant.
    pub fn bump_epoch(&self, tenant_id: &str) {
        *self
            .epochs
            .lock()
            .unwrap()
            .entry(tenant_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn get(&self, tenant_id: &str, key: &str) -> Option<CachedAnswer> {
        let current_epoch = self.epoch(tenant_id);
        let mut shard = self.shard(key).lock().unwrap();
        match shard.get(key) {
            Some(entry) if entry.created.elapsed() <= self.ttl && entry.epoch >= current_epoch => {
                Some(entry.value.clone())
            }
            Some(_) => {
                shard.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: &str, epoch_at_build: u64, value: CachedAnswer) {
        self.shard(key).lock().unwrap().insert(
            key.to_string(),
            Entry {
                value,
                created: Instant::now(),
                epoch: epoch_at_build,
            },
        );
    }

    /// Return the cached value or run `build` exactly once across all
    /// concurrent callers of this key. The boolean is the cache-hit flag.
    pub async fn get_or_build<F, Fut>(
        &self,
        tenant_id: &str,
        key: &str,
        build: F,
    ) -> Result<(CachedAnswer, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedAnswer>>,
    {
        if let Some(value) = self.get(tenant_id, key) {
            return Ok((value, true));
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let _guard = gate.lock().await;

        // A concurrent holder may have populated the entry while this
        // caller waited on the gate.
        if let Some(value) = self.get(tenant_id, key) {
            return Ok((value, true));
        }

        // The epoch observed before the build: an invalidation racing the
        // build leaves the entry already-stale instead of wrongly fresh.
        let epoch_at_build = self.epoch(tenant_id);
        let result = build().await;

        // Publish before dismantling the gate: a caller that misses the
        // gate entry must already find the value (or, on error, nothing).
        let outcome = match result {
            Ok(value) => {
                if !value.degraded {
                    self.insert(key, epoch_at_build, value.clone());
                }
                Ok((value, false))
            }
            Err(err) => Err(err),
        };

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(key);
        }

        outcome
    }

    /// Sweep expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let before = shard.len();
            shard.retain(|_, entry| entry.created.elapsed() <= self.ttl);
            removed += before - shard.len();
        }
        removed
    }
}
