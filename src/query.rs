//! The query pipeline.
//!
//! ```text
//! START → GOVERN (quota, rate) → CACHE_LOOKUP
//!   ├─ HIT → RESPOND
//!   └─ MISS → RETRIEVE (dense ∥ lexical → RRF)
//!              → [EMPTY → GROUNDED_EMPTY → RESPOND]
//!              → RERANK → COMPRESS → GENERATE → SCORE → SUGGEST
//!              → CACHE_POPULATE → RECONCILE → AUDIT → RESPOND
//! ```
//!
//! Dependency failures degrade deterministically instead of erroring:
//! an embedding failure falls back to lexical-only retrieval with
//! confidence capped at `low`; an LLM failure yields a source-listing
//! answer with confidence `none`. Degraded answers still reach RESPOND,
//! AUDIT, and token reconciliation, and are never cached. A greeting
//! short-circuits before retrieval, costing one request token and no
//! quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::audit::{self, QueryAudit};
use crate::chunk::count_tokens;
use crate::compress::compress;
use crate::confidence;
use crate::docs;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::hybrid::rrf_fuse;
use crate::lexical::LexicalIndex;
use crate::llm::build_request;
use crate::models::{
    Confidence, QueryEvent, QueryOptions, QueryResult, RetrievedChunk, SourceRef,
};
use crate::quota::QuotaKind;
use crate::rerank::apply_scores;
use crate::response_cache::{fingerprint, CachedAnswer};
use crate::suggest;

/// Reserved on top of the question itself when estimating token spend
/// before the model call.
const TOKEN_ESTIMATE_PAD: usize = 500;

const GREETING_ANSWER: &str =
    "Hello! Ask me a question about your documents and I will answer from their content.";

const GROUNDED_EMPTY_ANSWER: &str =
    "No matching content was found in your documents for that question.";

pub(crate) async fn run_query(
    engine: &Engine,
    tenant_id: &str,
    user_id: &str,
    question: &str,
    opts: QueryOptions,
) -> Result<QueryResult> {
    let start = Instant::now();
    if question.trim().is_empty() {
        return Err(Error::CorruptInput("empty question".to_string()));
    }

    if is_greeting(&engine.config.greetings, question) {
        engine.rate.acquire_request(tenant_id)?;
        let latency_ms = start.elapsed().as_millis() as i64;
        audit::record_query(
            &engine.pool,
            QueryAudit {
                tenant_id,
                user_id,
                question,
                chunk_ids: &[],
                latency_ms,
                cache_hit: false,
                confidence: "none",
                tokens_in: 0,
                tokens_out: 0,
            },
        )
        .await?;
        return Ok(QueryResult {
            answer: GREETING_ANSWER.to_string(),
            sources: Vec::new(),
            confidence: Confidence::none(),
            suggestions: Vec::new(),
            cache_hit: false,
            tokens_used: 0,
            latency_ms,
            message_id: Uuid::new_v4().to_string(),
        });
    }

    // GOVERN: quota admits first, then rate. A denial after the query
    // count was consumed returns it, so denied requests cost nothing.
    engine
        .quota
        .try_consume(tenant_id, QuotaKind::Queries, 1)
        .await?;
    if let Err(err) = engine.quota.ensure_token_headroom(tenant_id).await {
        engine
            .quota
            .release(tenant_id, QuotaKind::Queries, 1)
            .await?;
        return Err(err);
    }

    let estimate = (count_tokens(question) + TOKEN_ESTIMATE_PAD) as i64;
    if let Err(err) = engine.rate.acquire(tenant_id, estimate) {
        engine
            .quota
            .release(tenant_id, QuotaKind::Queries, 1)
            .await?;
        return Err(err);
    }

    let outcome = answer(engine, tenant_id, question, &opts).await;

    match outcome {
        Ok((value, cache_hit)) => {
            // A cache hit spends no model tokens for this request.
            let (tokens_in, tokens_out) = if cache_hit {
                (0, 0)
            } else {
                (value.tokens_in, value.tokens_out)
            };
            let tokens_used = tokens_in + tokens_out;

            engine.rate.reconcile(tenant_id, estimate, tokens_used);
            if tokens_used > 0 {
                engine
                    .quota
                    .record(tenant_id, QuotaKind::Tokens, tokens_used)
                    .await?;
            }

            let latency_ms = start.elapsed().as_millis() as i64;
            let chunk_ids: Vec<String> =
                value.sources.iter().map(|s| s.chunk_id.clone()).collect();
            audit::record_query(
                &engine.pool,
                QueryAudit {
                    tenant_id,
                    user_id,
                    question,
                    chunk_ids: &chunk_ids,
                    latency_ms,
                    cache_hit,
                    confidence: value.confidence.level.as_str(),
                    tokens_in,
                    tokens_out,
                },
            )
            .await?;

            Ok(QueryResult {
                answer: value.answer,
                sources: value.sources,
                confidence: value.confidence,
                suggestions: value.suggestions,
                cache_hit,
                tokens_used,
                latency_ms,
                message_id: Uuid::new_v4().to_string(),
            })
        }
        Err(err) => {
            // The model call never completed; the reservation goes back.
            engine.rate.reconcile(tenant_id, estimate, 0);
            Err(err)
        }
    }
}

/// Streaming variant: the full pipeline runs, then the answer is emitted
/// token by token followed by the terminal payload. The sequence is finite
/// and not restartable; dropping the receiver stops emission.
pub(crate) async fn run_query_stream(
    engine: &Engine,
    tenant_id: &str,
    user_id: &str,
    question: &str,
    opts: QueryOptions,
) -> Result<tokio::sync::mpsc::Receiver<QueryEvent>> {
    let result = run_query(engine, tenant_id, user_id, question, opts).await?;
    let (tx, rx) = tokio::sync::mpsc::channel(32);

    tokio::spawn(async move {
        let words: Vec<String> = result
            .answer
            .split_whitespace()
            .map(|w| format!("{} ", w))
            .collect();
        for word in words {
            if tx.send(QueryEvent::Token(word)).await.is_err() {
                return;
            }
        }
        let _ = tx.send(QueryEvent::Done(Box::new(result))).await;
    });

    Ok(rx)
}

/// Cache layer: single-flight build on miss, bypass when disabled.
async fn answer(
    engine: &Engine,
    tenant_id: &str,
    question: &str,
    opts: &QueryOptions,
) -> Result<(CachedAnswer, bool)> {
    if opts.enable_cache {
        let key = fingerprint(tenant_id, question, opts.doc_scope.as_deref());
        engine
            .response_cache
            .get_or_build(tenant_id, &key, || build(engine, tenant_id, question, opts))
            .await
    } else {
        Ok((build(engine, tenant_id, question, opts).await?, false))
    }
}

/// The cache-miss pipeline: retrieve, rerank, compress, generate, score,
/// suggest.
async fn build(
    engine: &Engine,
    tenant_id: &str,
    question: &str,
    opts: &QueryOptions,
) -> Result<CachedAnswer> {
    let retrieval = &engine.config.retrieval;
    let k = opts
        .top_k
        .map(|k| k.clamp(1, retrieval.k_retrieval))
        .unwrap_or(retrieval.k_retrieval);
    // Scope filtering happens after fusion; over-fetch so a narrow scope
    // is not starved by out-of-scope candidates.
    let scoped = opts.doc_scope.is_some();
    let fetch_k = if scoped { k * 4 } else { k };
    let fused_k = if scoped {
        retrieval.k_fused * 4
    } else {
        retrieval.k_fused
    };

    // Dense retrieval; an embedding failure degrades to lexical-only.
    let mut embedding_degraded = false;
    let dense: Vec<(String, f32)> = match engine.embedder.embed(&[question.to_string()]).await {
        Ok(vectors) => {
            let handle = engine.acquire_index(tenant_id).await?;
            let index = handle.read().await;
            index
                .search(&vectors[0], fetch_k)
                .into_iter()
                .filter_map(|(slot, score)| {
                    index.chunk_id(slot).map(|id| (id.to_string(), score))
                })
                .collect()
        }
        Err(Error::EmbeddingFailure(msg)) => {
            tracing::warn!(tenant = tenant_id, "query embedding failed, lexical only: {}", msg);
            embedding_degraded = true;
            Vec::new()
        }
        Err(err) => return Err(err),
    };

    // Lexical retrieval, memoized per tenant until the chunk set changes.
    let lexical_index = match engine.lexical.get(tenant_id) {
        Some(index) => index,
        None => {
            let rows = docs::ready_chunk_texts(&engine.pool, tenant_id).await?;
            let index = Arc::new(LexicalIndex::build(&rows));
            engine.lexical.put(tenant_id, index.clone());
            index
        }
    };
    let lexical = lexical_index.search(question, fetch_k);

    if dense.is_empty() && lexical.is_empty() {
        return Ok(grounded_empty(question, embedding_degraded));
    }

    let fused = rrf_fuse(&dense, &lexical, retrieval.k_rrf, fused_k);

    // Resolve chunk rows (tenant-scoped) and apply the document scope.
    let ids: Vec<String> = fused.iter().map(|(id, _)| id.clone()).collect();
    let rows = docs::chunks_by_ids(&engine.pool, tenant_id, &ids).await?;
    let by_id: HashMap<&str, &crate::models::Chunk> =
        rows.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut candidates: Vec<RetrievedChunk> = fused
        .iter()
        .filter_map(|(id, score)| {
            let chunk = by_id.get(id.as_str())?;
            if let Some(scope) = &opts.doc_scope {
                if !scope.contains(&chunk.document_id) {
                    return None;
                }
            }
            Some(RetrievedChunk {
                chunk_id: chunk.id.clone(),
                doc_id: chunk.document_id.clone(),
                page: chunk.page,
                text: chunk.text.clone(),
                score: *score,
            })
        })
        .collect();
    candidates.truncate(retrieval.k_fused);

    if candidates.is_empty() {
        return Ok(grounded_empty(question, embedding_degraded));
    }

    if opts.enable_rerank && engine.config.reranker.enabled {
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let scores = engine.reranker.rerank(question, &texts).await?;
        apply_scores(&mut candidates, &scores);
    }

    let selected = compress(&candidates, engine.config.context.budget_tokens);

    let doc_names = document_names(engine, tenant_id, &selected).await?;
    let blocks: Vec<String> = selected
        .iter()
        .map(|c| {
            let name = doc_names
                .get(&c.doc_id)
                .map(String::as_str)
                .unwrap_or("document");
            format!("(Source: {}, page {})\n{}", name, c.page, c.text)
        })
        .collect();

    let request = build_request(&blocks, question, &engine.config.llm);
    let sources: Vec<SourceRef> = selected
        .iter()
        .map(|c| SourceRef {
            doc_id: c.doc_id.clone(),
            chunk_id: c.chunk_id.clone(),
            page: c.page,
            score: c.score,
        })
        .collect();

    match engine.llm.complete(&request).await {
        Ok(reply) => {
            let mut conf =
                confidence::score(&reply.answer, &selected, &engine.config.confidence.thresholds);
            if embedding_degraded {
                conf = conf.capped_at(crate::models::ConfidenceLevel::Low);
            }
            let suggestions = suggest::generate(question, &reply.answer, &selected);
            Ok(CachedAnswer {
                answer: reply.answer,
                sources,
                confidence: conf,
                suggestions,
                tokens_in: reply.prompt_tokens,
                tokens_out: reply.completion_tokens,
                degraded: embedding_degraded,
            })
        }
        Err(err @ (Error::LlmFailure(_) | Error::DeadlineExceeded(_))) => {
            tracing::warn!(tenant = tenant_id, "llm failed, degraded answer: {}", err);
            let mut answer = String::from(
                "Unable to synthesize an answer right now. The most relevant passages found:",
            );
            for (i, chunk) in selected.iter().enumerate() {
                let name = doc_names
                    .get(&chunk.doc_id)
                    .map(String::as_str)
                    .unwrap_or("document");
                answer.push_str(&format!("\n{}. {} (page {})", i + 1, name, chunk.page));
            }
            Ok(CachedAnswer {
                answer,
                sources,
                confidence: Confidence::none(),
                suggestions: suggest::generate(question, "", &selected),
                tokens_in: 0,
                tokens_out: 0,
                degraded: true,
            })
        }
        Err(err) => Err(err),
    }
}

fn grounded_empty(question: &str, degraded: bool) -> CachedAnswer {
    CachedAnswer {
        answer: GROUNDED_EMPTY_ANSWER.to_string(),
        sources: Vec::new(),
        confidence: Confidence::none(),
        suggestions: suggest::generate(question, "", &[]),
        tokens_in: 0,
        tokens_out: 0,
        degraded,
    }
}

async fn document_names(
    engine: &Engine,
    tenant_id: &str,
    selected: &[RetrievedChunk],
) -> Result<HashMap<String, String>> {
    let mut doc_ids: Vec<&str> = selected.iter().map(|c| c.doc_id.as_str()).collect();
    doc_ids.sort();
    doc_ids.dedup();
    if doc_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = vec!["?"; doc_ids.len()].join(", ");
    let sql = format!(
        "SELECT id, name FROM documents WHERE tenant_id = ? AND id IN ({})",
        placeholders
    );
    let mut query = sqlx::query_as::<_, (String, String)>(&sql).bind(tenant_id);
    for doc_id in doc_ids {
        query = query.bind(doc_id);
    }
    let rows = query.fetch_all(&engine.pool).await?;
    Ok(rows.into_iter().collect())
}

/// Exact membership after lowercasing, trimming, and stripping trailing
/// punctuation. Deliberately narrow: a short real question must not be
/// mistaken for small talk.
fn is_greeting(greetings: &[String], question: &str) -> bool {
    let normalized = question
        .to_lowercase()
        .trim()
        .trim_end_matches(['!', '?', '.', ',', ':', ';'])
        .trim()
        .to_string();
    greetings.iter().any(|g| g == &normalized)
}
