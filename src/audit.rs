//! Append-only audit trail and feedback capture.
//!
//! Every completed query writes one audit row; ingests, deletions,
//! rebuilds, and index quarantines write action rows. Feedback is always
//! writable; statistics are computed read-side.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::FeedbackStats;
use crate::response_cache::normalize_question;

pub const ACTION_QUERY: &str = "query";
pub const ACTION_INGEST: &str = "ingest";
pub const ACTION_DELETE: &str = "document_delete";
pub const ACTION_REBUILD: &str = "index_rebuild";
pub const ACTION_QUARANTINE: &str = "index_quarantine";

/// One completed query, as recorded in the audit log. Only the question's
/// hash is stored.
pub struct QueryAudit<'a> {
    pub tenant_id: &'a str,
    pub user_id: &'a str,
    pub question: &'a str,
    pub chunk_ids: &'a [String],
    pub latency_ms: i64,
    pub cache_hit: bool,
    pub confidence: &'a str,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

pub fn question_hash(question: &str) -> String {
    format!(
        "{:x}",
        Sha256::digest(normalize_question(question).as_bytes())
    )
}

pub async fn record_query(pool: &SqlitePool, entry: QueryAudit<'_>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log
            (tenant_id, user_id, action, question_hash, chunk_ids, latency_ms,
             cache_hit, confidence, tokens_in, tokens_out, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.tenant_id)
    .bind(entry.user_id)
    .bind(ACTION_QUERY)
    .bind(question_hash(entry.question))
    .bind(serde_json::to_string(entry.chunk_ids).unwrap_or_default())
    .bind(entry.latency_ms)
    .bind(entry.cache_hit as i64)
    .bind(entry.confidence)
    .bind(entry.tokens_in)
    .bind(entry.tokens_out)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_action(
    pool: &SqlitePool,
    tenant_id: &str,
    user_id: &str,
    action: &str,
    target: &str,
    metadata: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (tenant_id, user_id, action, target, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(action)
    .bind(target)
    .bind(metadata.to_string())
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_feedback(
    pool: &SqlitePool,
    tenant_id: &str,
    user_id: &str,
    message_id: &str,
    rating: i32,
    issue_tag: Option<&str>,
    note: Option<&str>,
) -> Result<()> {
    if rating != 1 && rating != -1 {
        return Err(Error::CorruptInput(format!(
            "rating must be +1 or -1, got {}",
            rating
        )));
    }
    sqlx::query(
        r#"
        INSERT INTO feedback (message_id, tenant_id, user_id, rating, issue_tag, note, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(message_id)
    .bind(tenant_id)
    .bind(user_id)
    .bind(rating)
    .bind(issue_tag)
    .bind(note)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn feedback_stats(pool: &SqlitePool, tenant_id: &str) -> Result<FeedbackStats> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN rating = 1 THEN 1 ELSE 0 END), 0) AS positive,
            COALESCE(SUM(CASE WHEN rating = -1 THEN 1 ELSE 0 END), 0) AS negative
        FROM feedback WHERE tenant_id = ?
        "#,
    )
    .bind(tenant_id)
    .fetch_one(pool)
    .await?;

    Ok(FeedbackStats {
        total: row.get("total"),
        positive: row.get("positive"),
        negative: row.get("negative"),
    })
}

/// Audit rows of one action kind for a tenant. Read-side helper for
/// operators and tests.
pub async fn action_count(pool: &SqlitePool, tenant_id: &str, action: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE tenant_id = ? AND action = ?")
            .bind(tenant_id)
            .bind(action)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn pool() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let db_config = DbConfig {
            path: tmp.path().join("a.sqlite"),
            max_connections: 4,
        };
        let pool = db::open_pool(&db_config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, pool)
    }

    #[tokio::test]
    async fn query_audit_is_recorded_without_raw_question() {
        let (_tmp, pool) = pool().await;
        record_query(
            &pool,
            QueryAudit {
                tenant_id: "t1",
                user_id: "u1",
                question: "What is the Secret Plan?",
                chunk_ids: &["c1".to_string()],
                latency_ms: 42,
                cache_hit: false,
                confidence: "high",
                tokens_in: 100,
                tokens_out: 20,
            },
        )
        .await
        .unwrap();

        assert_eq!(action_count(&pool, "t1", ACTION_QUERY).await.unwrap(), 1);
        let hash: String = sqlx::query_scalar("SELECT question_hash FROM audit_log LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hash, question_hash("what is the secret plan?"));
        assert!(!hash.contains("Secret"));
    }

    #[tokio::test]
    async fn feedback_rating_validated_and_aggregated() {
        let (_tmp, pool) = pool().await;
        assert!(record_feedback(&pool, "t1", "u1", "m1", 0, None, None)
            .await
            .is_err());

        record_feedback(&pool, "t1", "u1", "m1", 1, None, None).await.unwrap();
        record_feedback(&pool, "t1", "u2", "m2", -1, Some("wrong"), Some("bad answer"))
            .await
            .unwrap();
        record_feedback(&pool, "t2", "u3", "m3", 1, None, None).await.unwrap();

        let stats = feedback_stats(&pool, "t1").await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.positive, 1);
        assert_eq!(stats.negative, 1);
    }
}
