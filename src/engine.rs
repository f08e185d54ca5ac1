//! The engine: owned state and public entry points.
//!
//! [`Engine`] owns the connection pool, the index cache, the governors,
//! and the provider clients. Lifecycle: [`Engine::new`] (connects and
//! migrates) → entry points → [`Engine::shutdown`] (flushes dirty
//! indexes). There is no global state; two engines over different
//! directories are fully independent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::audit;
use crate::config::Config;
use crate::db;
use crate::docs;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{Error, Result};
use crate::index_cache::{IndexCache, IndexHandle};
use crate::ingest;
use crate::lexical::LexicalCache;
use crate::llm::{create_llm, Llm};
use crate::migrate;
use crate::models::{
    Document, FeedbackStats, IndexStats, IngestReceipt, QueryEvent, QueryOptions, QueryResult,
};
use crate::object_store::{LocalStore, ObjectStore};
use crate::query;
use crate::quota::QuotaGovernor;
use crate::rate_limit::{RateLimiter, RateStatus};
use crate::rerank::{create_reranker, Reranker};
use crate::response_cache::ResponseCache;

pub struct Engine {
    pub(crate) config: Config,
    pub(crate) pool: SqlitePool,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) embedder: Arc<dyn Embedder>,
    pub(crate) llm: Arc<dyn Llm>,
    pub(crate) reranker: Arc<dyn Reranker>,
    pub(crate) index_cache: IndexCache,
    pub(crate) lexical: LexicalCache,
    pub(crate) response_cache: ResponseCache,
    pub(crate) quota: QuotaGovernor,
    pub(crate) rate: RateLimiter,
    ingest_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    quarantine_logged: std::sync::Mutex<HashSet<String>>,
}

impl Engine {
    /// Build an engine with providers taken from the configuration.
    pub async fn new(config: Config) -> Result<Engine> {
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        let llm: Arc<dyn Llm> = Arc::from(create_llm(&config.llm)?);
        let reranker: Arc<dyn Reranker> = Arc::from(create_reranker(&config.reranker)?);
        Self::with_providers(config, embedder, llm, reranker).await
    }

    /// Build an engine with injected providers. Tests and embedders use
    /// this to substitute failing or instrumented implementations.
    pub async fn with_providers(
        config: Config,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn Llm>,
        reranker: Arc<dyn Reranker>,
    ) -> Result<Engine> {
        let pool = db::open_pool(&config.db).await?;
        migrate::run_migrations(&pool).await?;

        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(config.object_store.root.clone()));
        let index_cache = IndexCache::new(
            store.clone(),
            embedder.dims(),
            config.index_cache.size,
            Duration::from_secs(config.index_cache.flush_interval_secs),
        );
        let response_cache = ResponseCache::new(Duration::from_secs(config.cache.ttl_seconds));
        let quota = QuotaGovernor::new(pool.clone(), config.quota.clone());
        let rate = RateLimiter::new(config.rate.clone());

        Ok(Engine {
            config,
            pool,
            store,
            embedder,
            llm,
            reranker,
            index_cache,
            lexical: LexicalCache::new(),
            response_cache,
            quota,
            rate,
            ingest_locks: Mutex::new(HashMap::new()),
            quarantine_logged: std::sync::Mutex::new(HashSet::new()),
        })
    }

    /// Flush dirty indexes. Call before dropping the engine; queries in
    /// flight on other tasks should be drained first.
    pub async fn shutdown(&self) {
        self.index_cache.flush_all().await;
        self.pool.close().await;
    }

    // ============ Entry points ============

    /// Ingest one uploaded blob. Idempotent on `(tenant, content digest)`.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        user_id: &str,
        blob: &[u8],
        name: &str,
        declared_type: &str,
    ) -> Result<IngestReceipt> {
        validate_tenant_id(tenant_id)?;
        ingest::run_ingest(self, tenant_id, user_id, blob, name, declared_type).await
    }

    /// Answer a question from the tenant's documents.
    pub async fn query(
        &self,
        tenant_id: &str,
        user_id: &str,
        question: &str,
        opts: QueryOptions,
    ) -> Result<QueryResult> {
        validate_tenant_id(tenant_id)?;
        query::run_query(self, tenant_id, user_id, question, opts).await
    }

    /// Answer with token streaming: answer tokens, then a terminal
    /// [`QueryEvent::Done`].
    pub async fn query_stream(
        &self,
        tenant_id: &str,
        user_id: &str,
        question: &str,
        opts: QueryOptions,
    ) -> Result<tokio::sync::mpsc::Receiver<QueryEvent>> {
        validate_tenant_id(tenant_id)?;
        query::run_query_stream(self, tenant_id, user_id, question, opts).await
    }

    /// Record a rating for a previously returned answer.
    pub async fn feedback(
        &self,
        tenant_id: &str,
        user_id: &str,
        message_id: &str,
        rating: i32,
        issue_tag: Option<&str>,
        note: Option<&str>,
    ) -> Result<()> {
        validate_tenant_id(tenant_id)?;
        audit::record_feedback(
            &self.pool, tenant_id, user_id, message_id, rating, issue_tag, note,
        )
        .await
    }

    pub async fn get_document(&self, tenant_id: &str, document_id: &str) -> Result<Document> {
        validate_tenant_id(tenant_id)?;
        docs::fetch_document(&self.pool, tenant_id, document_id).await
    }

    pub async fn list_documents(&self, tenant_id: &str) -> Result<Vec<Document>> {
        validate_tenant_id(tenant_id)?;
        docs::list_documents(&self.pool, tenant_id).await
    }

    /// Delete a document and purge its vectors. Cached answers for the
    /// tenant are invalidated.
    pub async fn delete_document(
        &self,
        tenant_id: &str,
        user_id: &str,
        document_id: &str,
    ) -> Result<()> {
        validate_tenant_id(tenant_id)?;
        ingest::delete_document(self, tenant_id, user_id, document_id).await
    }

    /// Rebuild the tenant's vector index from stored chunk vectors and
    /// clear any quarantine. Returns the rebuilt vector count.
    pub async fn rebuild_index(&self, tenant_id: &str, user_id: &str) -> Result<usize> {
        validate_tenant_id(tenant_id)?;
        let count = ingest::rebuild_index(self, tenant_id, user_id).await?;
        self.quarantine_logged.lock().unwrap().remove(tenant_id);
        Ok(count)
    }

    pub async fn index_stats(&self, tenant_id: &str) -> Result<IndexStats> {
        validate_tenant_id(tenant_id)?;
        let handle = self.acquire_index(tenant_id).await?;
        let index = handle.read().await;
        Ok(IndexStats {
            tenant_id: tenant_id.to_string(),
            vectors: index.live_len(),
            tombstones: index.tombstone_count(),
            dims: index.dims(),
        })
    }

    pub async fn quota_status(&self, tenant_id: &str) -> Result<crate::quota::QuotaStatus> {
        validate_tenant_id(tenant_id)?;
        self.quota.status(tenant_id).await
    }

    pub fn rate_status(&self, tenant_id: &str) -> RateStatus {
        self.rate.status(tenant_id)
    }

    pub async fn feedback_stats(&self, tenant_id: &str) -> Result<FeedbackStats> {
        validate_tenant_id(tenant_id)?;
        audit::feedback_stats(&self.pool, tenant_id).await
    }

    /// Sweep expired response-cache entries; returns how many were dropped.
    pub fn purge_expired_responses(&self) -> usize {
        self.response_cache.purge_expired()
    }

    /// Audit rows of one action kind (`audit::ACTION_*`) for a tenant.
    pub async fn audit_count(&self, tenant_id: &str, action: &str) -> Result<i64> {
        validate_tenant_id(tenant_id)?;
        audit::action_count(&self.pool, tenant_id, action).await
    }

    // ============ Internals ============

    /// Per-tenant ingestion mutex: document writes for one tenant are
    /// serialized, different tenants proceed in parallel.
    pub(crate) async fn ingest_lock(&self, tenant_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.ingest_locks.lock().await;
        locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire via the index cache, recording one operator-visible audit
    /// entry on the first quarantine observation.
    pub(crate) async fn acquire_index(&self, tenant_id: &str) -> Result<Arc<IndexHandle>> {
        match self.index_cache.acquire(tenant_id).await {
            Err(err @ Error::Unavailable(_)) => {
                let first_observation = self
                    .quarantine_logged
                    .lock()
                    .unwrap()
                    .insert(tenant_id.to_string());
                if first_observation {
                    let _ = audit::record_action(
                        &self.pool,
                        tenant_id,
                        "system",
                        audit::ACTION_QUARANTINE,
                        tenant_id,
                        serde_json::json!({ "error": err.to_string() }),
                    )
                    .await;
                }
                Err(err)
            }
            other => other,
        }
    }
}

/// Tenant ids flow into SQL predicates and object-store paths; restrict
/// them to a filesystem-safe alphabet.
fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= 64
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::CorruptInput(format!(
            "invalid tenant id: {:?}",
            tenant_id
        )))
    }
}
