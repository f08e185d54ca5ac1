//! End-to-end engine scenarios with offline providers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use ragline::audit::ACTION_QUERY;
use ragline::embedding::NullEmbedder;
use ragline::error::{Error, Result};
use ragline::llm::{Llm, LlmReply, LlmRequest, NullLlm};
use ragline::models::{ConfidenceLevel, DocumentStatus, QueryEvent, QueryOptions};
use ragline::rerank::OverlapReranker;
use ragline::{Config, Engine};

const MIME: &str = "text/plain";

const WARRANTY_DOC: &str = "The standard warranty covers manufacturing defects for a period of \
    two years from the purchase date. Warranty claims require the original receipt and the \
    product serial number. Shipping costs for warranty returns are paid by the manufacturer.";

const RETURNS_DOC: &str = "Customers may return undamaged products within thirty days for a \
    full refund. Refunds are issued to the original payment method within five business days. \
    Opened software and gift cards are not eligible for return.";

const PRIVACY_DOC: &str = "Personal data is retained for eighteen months after account \
    closure. Users may request deletion of their personal data at any time. Data export \
    requests are fulfilled within seventy two hours in a machine readable format.";

struct CountingLlm {
    inner: NullLlm,
    calls: AtomicUsize,
}

impl CountingLlm {
    fn new() -> Self {
        Self {
            inner: NullLlm,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Llm for CountingLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.complete(request).await
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

struct FailingLlm;

#[async_trait]
impl Llm for FailingLlm {
    async fn complete(&self, _request: &LlmRequest) -> Result<LlmReply> {
        Err(Error::LlmFailure("forced failure".to_string()))
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

fn test_config(root: &std::path::Path) -> Config {
    let toml = format!(
        r#"
[db]
path = "{root}/data/ragline.sqlite"

[object_store]
root = "{root}/blobs"

[chunk]
target_tokens = 48
overlap_tokens = 8
min_tokens = 4

[retrieval]
k_retrieval = 20
k_fused = 10

[context]
budget_tokens = 400

[embedding]
dims = 128

[rate]
rpm = 1000
tpm = 1000000

[quota]
daily_queries = 10000
daily_tokens = 10000000
"#,
        root = root.display()
    );
    Config::from_toml_str(&toml).unwrap()
}

async fn engine_with_llm(tmp: &TempDir, llm: Arc<dyn Llm>) -> Engine {
    let config = test_config(tmp.path());
    let dims = config.embedding.dims;
    Engine::with_providers(config, Arc::new(NullEmbedder::new(dims)), llm, Arc::new(OverlapReranker))
        .await
        .unwrap()
}

async fn engine_with_config(tmp: &TempDir, mutate: impl FnOnce(&mut Config)) -> Engine {
    let mut config = test_config(tmp.path());
    mutate(&mut config);
    let dims = config.embedding.dims;
    Engine::with_providers(
        config,
        Arc::new(NullEmbedder::new(dims)),
        Arc::new(NullLlm),
        Arc::new(OverlapReranker),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn ingest_is_idempotent_on_content() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;

    let first = engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();
    assert_eq!(first.status, DocumentStatus::Ready);
    assert!(!first.deduplicated);
    assert!(first.chunk_count >= 1);

    let stats_before = engine.index_stats("t1").await.unwrap();

    let second = engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty-again.txt", MIME)
        .await
        .unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.document_id, first.document_id);
    assert_eq!(second.chunk_count, first.chunk_count);

    let stats_after = engine.index_stats("t1").await.unwrap();
    assert_eq!(stats_after.vectors, stats_before.vectors, "no new slots appended");

    let docs = engine.list_documents("t1").await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].status, DocumentStatus::Ready);
}

#[tokio::test]
async fn query_answers_from_ingested_content() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;
    engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();

    let result = engine
        .query("t1", "u1", "How long does the warranty last?", QueryOptions::default())
        .await
        .unwrap();

    assert!(!result.sources.is_empty());
    assert!(result.answer.to_lowercase().contains("warranty"));
    assert!(!result.cache_hit);
    assert_ne!(result.confidence.level, ConfidenceLevel::None);
    assert_eq!(result.suggestions.len(), 3);
    assert!(result.tokens_used > 0);
}

#[tokio::test]
async fn cross_tenant_queries_see_nothing() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;
    engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();

    let result = engine
        .query("t2", "u9", "How long does the warranty last?", QueryOptions::default())
        .await
        .unwrap();

    assert!(result.sources.is_empty());
    assert_eq!(result.confidence.level, ConfidenceLevel::None);
    assert!(result.answer.contains("No matching content"));
    // The empty outcome is still a completed, audited query.
    assert_eq!(engine.audit_count("t2", ACTION_QUERY).await.unwrap(), 1);
}

#[tokio::test]
async fn isolation_holds_for_sources_across_tenants() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;
    let receipt_t1 = engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();
    let receipt_t2 = engine
        .ingest("t2", "u2", RETURNS_DOC.as_bytes(), "returns.txt", MIME)
        .await
        .unwrap();

    let result = engine
        .query("t2", "u2", "What is the refund and warranty policy?", QueryOptions::default())
        .await
        .unwrap();
    for source in &result.sources {
        assert_eq!(source.doc_id, receipt_t2.document_id);
        assert_ne!(source.doc_id, receipt_t1.document_id);
    }
}

#[tokio::test]
async fn identical_queries_share_one_model_call() {
    let tmp = TempDir::new().unwrap();
    let llm = Arc::new(CountingLlm::new());
    let engine = Arc::new(engine_with_llm(&tmp, llm.clone()).await);
    engine
        .ingest("t1", "u1", RETURNS_DOC.as_bytes(), "returns.txt", MIME)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .query(
                    "t1",
                    &format!("user-{}", i),
                    "How many days do customers have to return a product?",
                    QueryOptions::default(),
                )
                .await
                .unwrap()
        }));
    }

    let mut answers = Vec::new();
    let mut misses = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        if !result.cache_hit {
            misses += 1;
        }
        answers.push(result.answer);
    }

    assert_eq!(llm.calls.load(Ordering::SeqCst), 1, "single-flight build");
    assert_eq!(misses, 1, "only the builder misses");
    assert!(answers.windows(2).all(|w| w[0] == w[1]), "identical answers");
    assert_eq!(engine.audit_count("t1", ACTION_QUERY).await.unwrap(), 50);
}

#[tokio::test]
async fn rate_limit_denies_sixth_request() {
    let tmp = TempDir::new().unwrap();
    let llm = Arc::new(CountingLlm::new());
    let config_llm: Arc<dyn Llm> = llm.clone();
    let mut config = test_config(tmp.path());
    config.rate.rpm = 5;
    let dims = config.embedding.dims;
    let engine = Engine::with_providers(
        config,
        Arc::new(NullEmbedder::new(dims)),
        config_llm,
        Arc::new(OverlapReranker),
    )
    .await
    .unwrap();

    engine
        .ingest("t1", "u1", PRIVACY_DOC.as_bytes(), "privacy.txt", MIME)
        .await
        .unwrap();

    for i in 0..5 {
        engine
            .query("t1", "u1", &format!("What about data retention topic {}?", i), QueryOptions::default())
            .await
            .unwrap();
    }
    let calls_before_denial = llm.calls.load(Ordering::SeqCst);

    let err = engine
        .query("t1", "u1", "One more question about deletion?", QueryOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::RateLimited { retry_after } => {
            assert!(retry_after > 0.0 && retry_after <= 60.0);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }

    assert_eq!(llm.calls.load(Ordering::SeqCst), calls_before_denial, "no model call when denied");
    assert_eq!(engine.audit_count("t1", ACTION_QUERY).await.unwrap(), 5);
}

#[tokio::test]
async fn delete_then_query_never_cites_the_deleted_document() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;

    let kept = engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();
    let doomed = engine
        .ingest("t1", "u1", RETURNS_DOC.as_bytes(), "returns.txt", MIME)
        .await
        .unwrap();

    engine.delete_document("t1", "u1", &doomed.document_id).await.unwrap();

    let result = engine
        .query("t1", "u1", "How are refunds and warranty claims handled?", QueryOptions::default())
        .await
        .unwrap();
    assert!(!result.sources.is_empty());
    for source in &result.sources {
        assert_ne!(source.doc_id, doomed.document_id);
        assert_eq!(source.doc_id, kept.document_id);
    }

    assert!(engine.get_document("t1", &doomed.document_id).await.is_err());
}

#[tokio::test]
async fn deletion_compacts_and_retrieval_is_stable() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;

    engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();
    let middle = engine
        .ingest("t1", "u1", RETURNS_DOC.as_bytes(), "returns.txt", MIME)
        .await
        .unwrap();
    engine
        .ingest("t1", "u1", PRIVACY_DOC.as_bytes(), "privacy.txt", MIME)
        .await
        .unwrap();

    engine.delete_document("t1", "u1", &middle.document_id).await.unwrap();

    // A third of the slots died: the tombstone ratio crossed 0.25 and
    // compaction ran.
    let stats = engine.index_stats("t1").await.unwrap();
    assert_eq!(stats.tombstones, 0, "compaction rewrote the index");

    let question = "How long is personal data retained after closure?";
    let before: Vec<String> = engine
        .query("t1", "u1", question, QueryOptions { enable_cache: false, ..Default::default() })
        .await
        .unwrap()
        .sources
        .iter()
        .map(|s| s.chunk_id.clone())
        .collect();
    assert!(!before.is_empty());

    // Rebuilding from stored vectors reproduces the same result set, so
    // the compacted slots and the chunk rows agree.
    engine.rebuild_index("t1", "admin").await.unwrap();
    let after: Vec<String> = engine
        .query("t1", "u1", question, QueryOptions { enable_cache: false, ..Default::default() })
        .await
        .unwrap()
        .sources
        .iter()
        .map(|s| s.chunk_id.clone())
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn llm_failure_degrades_and_is_audited() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(FailingLlm)).await;
    engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();

    let result = engine
        .query("t1", "u1", "How long does the warranty last?", QueryOptions::default())
        .await
        .unwrap();

    assert!(result.answer.contains("Unable to synthesize"));
    assert!(!result.sources.is_empty(), "sources still listed");
    assert_eq!(result.confidence.level, ConfidenceLevel::None);
    assert_eq!(result.tokens_used, 0);
    assert_eq!(engine.audit_count("t1", ACTION_QUERY).await.unwrap(), 1);

    // Degraded answers are not cached: the next identical query re-runs
    // the pipeline (and fails the model again rather than serving junk).
    let again = engine
        .query("t1", "u1", "How long does the warranty last?", QueryOptions::default())
        .await
        .unwrap();
    assert!(!again.cache_hit);
}

#[tokio::test]
async fn greeting_short_circuits_without_quota() {
    let tmp = TempDir::new().unwrap();
    let llm = Arc::new(CountingLlm::new());
    let engine = engine_with_llm(&tmp, llm.clone()).await;

    let result = engine
        .query("t1", "u1", "Hello!", QueryOptions::default())
        .await
        .unwrap();
    assert!(result.sources.is_empty());
    assert_eq!(result.tokens_used, 0);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0, "no model call");

    let status = engine.quota_status("t1").await.unwrap();
    assert_eq!(status.queries_today, 0, "greetings cost no quota");
    assert_eq!(engine.audit_count("t1", ACTION_QUERY).await.unwrap(), 1);
}

#[tokio::test]
async fn quota_cap_denies_with_reset_hint() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_config(&tmp, |c| c.quota.daily_queries = 2).await;
    engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();

    for i in 0..2 {
        engine
            .query("t1", "u1", &format!("Question number {} about warranty?", i), QueryOptions::default())
            .await
            .unwrap();
    }
    let err = engine
        .query("t1", "u1", "Third question about warranty?", QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { reset_at, .. } if reset_at > 0));
}

#[tokio::test]
async fn document_quota_blocks_upload_and_marks_failed() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_config(&tmp, |c| c.quota.max_documents = 1).await;

    engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();
    let err = engine
        .ingest("t1", "u1", RETURNS_DOC.as_bytes(), "returns.txt", MIME)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));

    let docs = engine.list_documents("t1").await.unwrap();
    assert_eq!(docs.len(), 2);
    let failed = docs.iter().find(|d| d.name == "returns.txt").unwrap();
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert!(failed.error.is_some());
}

#[tokio::test]
async fn unsupported_and_empty_uploads_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;

    let err = engine
        .ingest("t1", "u1", b"bytes", "x.zip", "application/zip")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));

    let err = engine.ingest("t1", "u1", b"", "empty.txt", MIME).await.unwrap_err();
    assert!(matches!(err, Error::CorruptInput(_)));
}

#[tokio::test]
async fn cache_is_invalidated_by_ingest() {
    let tmp = TempDir::new().unwrap();
    let llm = Arc::new(CountingLlm::new());
    let engine = engine_with_llm(&tmp, llm.clone()).await;
    engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();

    let question = "What does the warranty cover?";
    engine.query("t1", "u1", question, QueryOptions::default()).await.unwrap();
    let hit = engine.query("t1", "u1", question, QueryOptions::default()).await.unwrap();
    assert!(hit.cache_hit);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

    // New content for the tenant invalidates every cached answer.
    engine
        .ingest("t1", "u1", RETURNS_DOC.as_bytes(), "returns.txt", MIME)
        .await
        .unwrap();
    let rebuilt = engine.query("t1", "u1", question, QueryOptions::default()).await.unwrap();
    assert!(!rebuilt.cache_hit);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn doc_scope_restricts_sources() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;
    let warranty = engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();
    let returns = engine
        .ingest("t1", "u1", RETURNS_DOC.as_bytes(), "returns.txt", MIME)
        .await
        .unwrap();

    let opts = QueryOptions {
        doc_scope: Some(vec![returns.document_id.clone()]),
        ..Default::default()
    };
    let result = engine
        .query("t1", "u1", "What are the rules for refunds and warranty?", opts)
        .await
        .unwrap();
    assert!(!result.sources.is_empty());
    for source in &result.sources {
        assert_eq!(source.doc_id, returns.document_id);
        assert_ne!(source.doc_id, warranty.document_id);
    }
}

#[tokio::test]
async fn streaming_emits_tokens_then_terminal_payload() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;
    engine
        .ingest("t1", "u1", PRIVACY_DOC.as_bytes(), "privacy.txt", MIME)
        .await
        .unwrap();

    let mut rx = engine
        .query_stream("t1", "u1", "How long is personal data retained?", QueryOptions::default())
        .await
        .unwrap();

    let mut streamed = String::new();
    let mut terminal = None;
    while let Some(event) = rx.recv().await {
        match event {
            QueryEvent::Token(token) => streamed.push_str(&token),
            QueryEvent::Done(result) => terminal = Some(result),
        }
    }
    let terminal = terminal.expect("terminal payload");
    assert_eq!(streamed.trim(), terminal.answer.split_whitespace().collect::<Vec<_>>().join(" "));
    assert!(!terminal.sources.is_empty());
}

#[tokio::test]
async fn feedback_roundtrip_and_stats() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;
    engine
        .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
        .await
        .unwrap();
    let result = engine
        .query("t1", "u1", "What does the warranty cover?", QueryOptions::default())
        .await
        .unwrap();

    engine
        .feedback("t1", "u1", &result.message_id, 1, None, None)
        .await
        .unwrap();
    engine
        .feedback("t1", "u2", &result.message_id, -1, Some("incomplete"), Some("missed the serial number"))
        .await
        .unwrap();
    assert!(engine.feedback("t1", "u3", &result.message_id, 2, None, None).await.is_err());

    let stats = engine.feedback_stats("t1").await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.positive, 1);
    assert_eq!(stats.negative, 1);
}

#[tokio::test]
async fn engine_state_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let doc_id;
    {
        let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;
        doc_id = engine
            .ingest("t1", "u1", WARRANTY_DOC.as_bytes(), "warranty.txt", MIME)
            .await
            .unwrap()
            .document_id;
        engine.shutdown().await;
    }

    let engine = engine_with_llm(&tmp, Arc::new(NullLlm)).await;
    let document = engine.get_document("t1", &doc_id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Ready);

    let result = engine
        .query("t1", "u1", "How long does the warranty last?", QueryOptions::default())
        .await
        .unwrap();
    assert!(result.sources.iter().all(|s| s.doc_id == doc_id));
    assert!(!result.sources.is_empty());
}
