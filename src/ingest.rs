//! Ingestion pipeline orchestration.
//!
//! Coordinates digest → quota → extract → chunk → embed → index upsert →
//! relational commit for one uploaded blob. Per tenant, ingestion is
//! serialized; different tenants ingest in parallel.
//!
//! # Failure semantics
//!
//! There is no partial-ready state. Every failure marks the document row
//! `failed` with a reason, releases any quota it consumed, and commits no
//! chunks or vectors. When the relational transaction itself fails after
//! slots were assigned, the just-assigned slots are tombstoned before the
//! error is surfaced. The idempotency key for retries is
//! `(tenant, content digest)`: re-uploading identical bytes returns the
//! existing ready document.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::audit;
use crate::chunk::chunk_pages;
use crate::docs;
use crate::embedding::{embed_all, vec_to_blob};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::extract::extract;
use crate::models::{ChunkPiece, DocumentStatus, IngestReceipt};
use crate::quota::QuotaKind;

pub(crate) async fn run_ingest(
    engine: &Engine,
    tenant_id: &str,
    user_id: &str,
    blob: &[u8],
    name: &str,
    declared_type: &str,
) -> Result<IngestReceipt> {
    if blob.is_empty() {
        return Err(Error::CorruptInput("empty upload".to_string()));
    }
    let digest = format!("{:x}", Sha256::digest(blob));

    // Fast path outside the tenant lock.
    if let Some(existing) = docs::find_ready_by_digest(&engine.pool, tenant_id, &digest).await? {
        tracing::info!(tenant = tenant_id, document = %existing.id, "duplicate upload");
        return Ok(IngestReceipt {
            document_id: existing.id,
            status: existing.status,
            page_count: existing.page_count,
            chunk_count: existing.chunk_count,
            deduplicated: true,
        });
    }

    let tenant_lock = engine.ingest_lock(tenant_id).await;
    let _serialized = tenant_lock.lock().await;

    // A concurrent identical upload may have committed while this one
    // waited for the tenant lock.
    if let Some(existing) = docs::find_ready_by_digest(&engine.pool, tenant_id, &digest).await? {
        return Ok(IngestReceipt {
            document_id: existing.id,
            status: existing.status,
            page_count: existing.page_count,
            chunk_count: existing.chunk_count,
            deduplicated: true,
        });
    }

    let document_id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO documents (id, tenant_id, name, byte_size, content_digest, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&document_id)
    .bind(tenant_id)
    .bind(name)
    .bind(blob.len() as i64)
    .bind(&digest)
    .bind(DocumentStatus::Pending.as_str())
    .bind(chrono::Utc::now().timestamp())
    .execute(&engine.pool)
    .await?;

    match process(engine, tenant_id, &document_id, blob, declared_type).await {
        Ok((page_count, chunk_count)) => {
            engine.lexical.invalidate(tenant_id);
            engine.response_cache.bump_epoch(tenant_id);
            audit::record_action(
                &engine.pool,
                tenant_id,
                user_id,
                audit::ACTION_INGEST,
                &document_id,
                serde_json::json!({ "name": name, "chunks": chunk_count, "pages": page_count }),
            )
            .await?;
            tracing::info!(
                tenant = tenant_id,
                document = %document_id,
                chunks = chunk_count,
                "document ready"
            );
            Ok(IngestReceipt {
                document_id,
                status: DocumentStatus::Ready,
                page_count,
                chunk_count,
                deduplicated: false,
            })
        }
        Err(err) => {
            docs::update_status(
                &engine.pool,
                &document_id,
                DocumentStatus::Failed,
                Some(&err.to_string()),
            )
            .await?;
            tracing::warn!(tenant = tenant_id, document = %document_id, "ingest failed: {}", err);
            Err(err)
        }
    }
}

/// The fallible stages. Quota consumed here is released on any later
/// failure; the caller owns the failed-status transition.
async fn process(
    engine: &Engine,
    tenant_id: &str,
    document_id: &str,
    blob: &[u8],
    declared_type: &str,
) -> Result<(i64, i64)> {
    engine
        .quota
        .try_consume(tenant_id, QuotaKind::Documents, 1)
        .await?;
    if let Err(err) = engine
        .quota
        .try_consume(tenant_id, QuotaKind::Storage, blob.len() as i64)
        .await
    {
        engine
            .quota
            .release(tenant_id, QuotaKind::Documents, 1)
            .await?;
        return Err(err);
    }

    let result = process_inner(engine, tenant_id, document_id, blob, declared_type).await;
    if result.is_err() {
        engine
            .quota
            .release(tenant_id, QuotaKind::Documents, 1)
            .await?;
        engine
            .quota
            .release(tenant_id, QuotaKind::Storage, blob.len() as i64)
            .await?;
    }
    result
}

async fn process_inner(
    engine: &Engine,
    tenant_id: &str,
    document_id: &str,
    blob: &[u8],
    declared_type: &str,
) -> Result<(i64, i64)> {
    docs::update_status(&engine.pool, document_id, DocumentStatus::Processing, None).await?;

    let pages = extract(blob, declared_type)?;
    let page_count = pages.len() as i64;

    let pieces = chunk_pages(&pages, &engine.config.chunk);
    if pieces.is_empty() {
        return Err(Error::CorruptInput("document produced no chunks".to_string()));
    }

    let texts: Vec<String> = pieces.iter().map(|p| p.text.clone()).collect();
    let vectors = embed_all(engine.embedder.as_ref(), &engine.config.embedding, &texts).await?;

    let chunk_ids: Vec<String> = pieces.iter().map(|_| Uuid::new_v4().to_string()).collect();

    let handle = engine.acquire_index(tenant_id).await?;
    let mut index = handle.write().await;
    let slots = index.upsert(&chunk_ids, &vectors)?;
    // Dirty from the moment memory diverges from the stored artifacts; an
    // eviction racing the commit must persist, not silently drop, this
    // state.
    handle.mark_dirty();

    match commit_chunks(
        engine,
        tenant_id,
        document_id,
        &pieces,
        &chunk_ids,
        &vectors,
        &slots,
        page_count,
    )
    .await
    {
        Ok(()) => {
            drop(index);
            engine.index_cache.maybe_flush(tenant_id, &handle).await;
            Ok((page_count, chunk_ids.len() as i64))
        }
        Err(err) => {
            // Roll the index back so no vector outlives the failed commit.
            index.remove(&slots);
            drop(index);
            Err(err)
        }
    }
}

/// One relational transaction: chunk rows, vector blobs, and the ready
/// transition publish together.
#[allow(clippy::too_many_arguments)]
async fn commit_chunks(
    engine: &Engine,
    tenant_id: &str,
    document_id: &str,
    pieces: &[ChunkPiece],
    chunk_ids: &[String],
    vectors: &[Vec<f32>],
    slots: &[i64],
    page_count: i64,
) -> Result<()> {
    let mut tx = engine.pool.begin().await?;

    for (((piece, chunk_id), vector), slot) in
        pieces.iter().zip(chunk_ids).zip(vectors).zip(slots)
    {
        sqlx::query(
            r#"
            INSERT INTO chunks
                (id, document_id, tenant_id, ordinal, text, token_count, page, embedding_slot)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk_id)
        .bind(document_id)
        .bind(tenant_id)
        .bind(piece.ordinal as i64)
        .bind(&piece.text)
        .bind(piece.token_count as i64)
        .bind(piece.page as i64)
        .bind(slot)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunk_vectors (chunk_id, tenant_id, embedding) VALUES (?, ?, ?)")
            .bind(chunk_id)
            .bind(tenant_id)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        "UPDATE documents SET status = ?, page_count = ?, chunk_count = ?, error = NULL
         WHERE id = ?",
    )
    .bind(DocumentStatus::Ready.as_str())
    .bind(page_count)
    .bind(chunk_ids.len() as i64)
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Delete a document: tombstone its slots, drop its rows, release quota,
/// and invalidate derived state. Compaction runs when the tombstone ratio
/// crosses the threshold, rewriting chunk slots in the same transaction
/// that removes the document's rows.
pub(crate) async fn delete_document(
    engine: &Engine,
    tenant_id: &str,
    user_id: &str,
    document_id: &str,
) -> Result<()> {
    let document = docs::fetch_document(&engine.pool, tenant_id, document_id).await?;

    let tenant_lock = engine.ingest_lock(tenant_id).await;
    let _serialized = tenant_lock.lock().await;

    let slots = docs::document_slots(&engine.pool, document_id).await?;

    let handle = engine.acquire_index(tenant_id).await?;
    let mut index = handle.write().await;
    index.remove(&slots);

    let remap = if index.needs_compaction() {
        Some(index.compact())
    } else {
        None
    };
    handle.mark_dirty();

    let mut tx = engine.pool.begin().await?;
    sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    if let Some(remap) = &remap {
        for (old, new) in remap {
            sqlx::query(
                "UPDATE chunks SET embedding_slot = ? WHERE tenant_id = ? AND embedding_slot = ?",
            )
            .bind(new)
            .bind(tenant_id)
            .bind(old)
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await?;

    drop(index);
    engine.index_cache.maybe_flush(tenant_id, &handle).await;

    engine
        .quota
        .release(tenant_id, QuotaKind::Documents, 1)
        .await?;
    engine
        .quota
        .release(tenant_id, QuotaKind::Storage, document.byte_size)
        .await?;

    engine.lexical.invalidate(tenant_id);
    engine.response_cache.bump_epoch(tenant_id);

    audit::record_action(
        &engine.pool,
        tenant_id,
        user_id,
        audit::ACTION_DELETE,
        document_id,
        serde_json::json!({ "name": document.name, "compacted": remap.is_some() }),
    )
    .await?;
    tracing::info!(tenant = tenant_id, document = document_id, "document deleted");

    Ok(())
}

/// Rebuild a tenant's vector index from the stored chunk vectors. The
/// recovery path for quarantined indexes; also clears the quarantine.
pub(crate) async fn rebuild_index(engine: &Engine, tenant_id: &str, user_id: &str) -> Result<usize> {
    let tenant_lock = engine.ingest_lock(tenant_id).await;
    let _serialized = tenant_lock.lock().await;

    let stored = docs::tenant_chunk_vectors(&engine.pool, tenant_id).await?;

    let mut index = crate::index::TenantIndex::new(engine.embedder.dims());
    let chunk_ids: Vec<String> = stored.iter().map(|(id, _)| id.clone()).collect();
    let vectors: Vec<Vec<f32>> = stored
        .iter()
        .map(|(_, blob)| crate::embedding::blob_to_vec(blob))
        .collect();
    let slots = index.upsert(&chunk_ids, &vectors)?;

    let mut tx = engine.pool.begin().await?;
    for (chunk_id, slot) in chunk_ids.iter().zip(&slots) {
        sqlx::query("UPDATE chunks SET embedding_slot = ? WHERE id = ?")
            .bind(slot)
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    // Publish the fresh artifacts, then drop any resident (possibly
    // quarantined) state so the next acquire loads them.
    let (blob, sidecar) = index.encode();
    engine
        .store
        .put(&crate::object_store::index_blob_key(tenant_id), &blob)
        .await?;
    engine
        .store
        .put(&crate::object_store::sidecar_key(tenant_id), &sidecar)
        .await?;
    engine.index_cache.invalidate(tenant_id).await;
    engine.response_cache.bump_epoch(tenant_id);

    audit::record_action(
        &engine.pool,
        tenant_id,
        user_id,
        audit::ACTION_REBUILD,
        tenant_id,
        serde_json::json!({ "vectors": chunk_ids.len() }),
    )
    .await?;
    tracing::info!(tenant = tenant_id, vectors = chunk_ids.len(), "index rebuilt");

    Ok(chunk_ids.len())
}
