//! Database schema migrations.
//!
//! Run once at engine init; every statement is idempotent.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌───────────────┐
//! │  documents   │──┐  │   chunks     │──┐  │ chunk_vectors │
//! │              │  │  │              │  │  │               │
//! │ id (PK)      │  │  │ id (PK)      │  └──│ chunk_id (PK) │
//! │ tenant_id    │  └──│ document_id  │     │ tenant_id     │
//! │ name         │     │ tenant_id    │     │ embedding     │
//! │ byte_size    │     │ ordinal      │     └───────────────┘
//! │ digest       │     │ text         │
//! │ status       │     │ token_count  │     ┌───────────────┐
//! │ page_count   │     │ page         │     │  quota_state  │
//! │ chunk_count  │     │ embed_slot   │     │ tenant_id(PK) │
//! │ error        │     └──────────────┘     │ day_key       │
//! └──────────────┘                          │ counters …    │
//!                                           └───────────────┘
//! ┌──────────────┐     ┌──────────────┐
//! │  audit_log   │     │   feedback   │
//! │  (append)    │     │  (append)    │
//! └──────────────┘     └──────────────┘
//! ```
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `documents` | Upload metadata, lifecycle status, content digest |
//! | `chunks` | Deterministic text segments with index slots |
//! | `chunk_vectors` | Embedding BLOBs, kept for index rebuilds |
//! | `quota_state` | Per-tenant day-keyed usage counters |
//! | `audit_log` | Append-only record of queries and admin actions |
//! | `feedback` | Per-answer ratings |
//!
//! The unique index on `(tenant_id, content_digest) WHERE status = 'ready'`
//! enforces the at-most-one-ready-copy invariant for idempotent uploads.

use sqlx::SqlitePool;

use crate::error::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            byte_size INTEGER NOT NULL,
            content_digest TEXT NOT NULL,
            status TEXT NOT NULL,
            page_count INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            page INTEGER NOT NULL,
            embedding_slot INTEGER,
            UNIQUE(document_id, ordinal),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quota_state (
            tenant_id TEXT PRIMARY KEY,
            day_key TEXT NOT NULL,
            documents_used INTEGER NOT NULL DEFAULT 0,
            storage_used_bytes INTEGER NOT NULL DEFAULT 0,
            queries_today INTEGER NOT NULL DEFAULT 0,
            tokens_today INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL,
            target TEXT,
            question_hash TEXT,
            chunk_ids TEXT,
            latency_ms INTEGER,
            cache_hit INTEGER,
            confidence TEXT,
            tokens_in INTEGER,
            tokens_out INTEGER,
            metadata TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            rating INTEGER NOT NULL,
            issue_tag TEXT,
            note TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Idempotent upload invariant: one ready copy per (tenant, digest).
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_ready_digest
        ON documents(tenant_id, content_digest) WHERE status = 'ready'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_tenant ON chunks(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_tenant ON chunk_vectors(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_tenant ON audit_log(tenant_id, created_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_feedback_tenant ON feedback(tenant_id)")
        .execute(pool)
        .await?;

    Ok(())
}
