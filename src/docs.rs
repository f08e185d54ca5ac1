//! Document and chunk row access.
//!
//! Every read is tenant-scoped in SQL; a document id from another tenant
//! is indistinguishable from a missing one (`NotFound`).

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{Chunk, Document, DocumentStatus};

pub fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status_raw: String = row.get("status");
    let status = DocumentStatus::parse(&status_raw)
        .ok_or_else(|| Error::Storage(format!("unknown document status: {}", status_raw)))?;
    Ok(Document {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        byte_size: row.get("byte_size"),
        content_digest: row.get("content_digest"),
        status,
        page_count: row.get("page_count"),
        chunk_count: row.get("chunk_count"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}

pub fn row_to_chunk(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        tenant_id: row.get("tenant_id"),
        ordinal: row.get("ordinal"),
        text: row.get("text"),
        token_count: row.get("token_count"),
        page: row.get("page"),
        embedding_slot: row.get("embedding_slot"),
    }
}

pub async fn fetch_document(
    pool: &SqlitePool,
    tenant_id: &str,
    document_id: &str,
) -> Result<Document> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ? AND tenant_id = ?")
        .bind(document_id)
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("document {}", document_id)))?;
    row_to_document(&row)
}

pub async fn list_documents(pool: &SqlitePool, tenant_id: &str) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents WHERE tenant_id = ? ORDER BY created_at, id")
        .bind(tenant_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_document).collect()
}

pub async fn find_ready_by_digest(
    pool: &SqlitePool,
    tenant_id: &str,
    digest: &str,
) -> Result<Option<Document>> {
    let row = sqlx::query(
        "SELECT * FROM documents
         WHERE tenant_id = ? AND content_digest = ? AND status = 'ready'",
    )
    .bind(tenant_id)
    .bind(digest)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_document).transpose()
}

pub async fn update_status(
    pool: &SqlitePool,
    document_id: &str,
    status: DocumentStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ?, error = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// `(chunk_id, text)` pairs of all ready documents, in `(document, ordinal)`
/// order. Input for the lexical index build.
pub async fn ready_chunk_texts(pool: &SqlitePool, tenant_id: &str) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.text FROM chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE c.tenant_id = ? AND d.status = 'ready'
        ORDER BY c.document_id, c.ordinal
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("id"), r.get::<String, _>("text")))
        .collect())
}

/// Fetch chunk rows by id, tenant-scoped. Ids from other tenants are
/// silently absent from the result.
pub async fn chunks_by_ids(
    pool: &SqlitePool,
    tenant_id: &str,
    chunk_ids: &[String],
) -> Result<Vec<Chunk>> {
    if chunk_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; chunk_ids.len()].join(", ");
    let sql = format!(
        "SELECT * FROM chunks WHERE tenant_id = ? AND id IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&sql).bind(tenant_id);
    for chunk_id in chunk_ids {
        query = query.bind(chunk_id);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(row_to_chunk).collect())
}

/// Live embedding slots of a document's chunks.
pub async fn document_slots(pool: &SqlitePool, document_id: &str) -> Result<Vec<i64>> {
    let slots: Vec<i64> = sqlx::query_scalar(
        "SELECT embedding_slot FROM chunks
         WHERE document_id = ? AND embedding_slot IS NOT NULL",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    Ok(slots)
}

/// All stored chunk vectors for a tenant, in `(document, ordinal)` order.
/// Recovery input for index rebuilds.
pub async fn tenant_chunk_vectors(
    pool: &SqlitePool,
    tenant_id: &str,
) -> Result<Vec<(String, Vec<u8>)>> {
    let rows = sqlx::query(
        r#"
        SELECT v.chunk_id, v.embedding FROM chunk_vectors v
        JOIN chunks c ON c.id = v.chunk_id
        JOIN documents d ON d.id = c.document_id
        WHERE v.tenant_id = ? AND d.status = 'ready'
        ORDER BY c.document_id, c.ordinal
        "#,
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("chunk_id"), r.get::<Vec<u8>, _>("embedding")))
        .collect())
}
