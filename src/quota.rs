//! Per-tenant usage quotas.
//!
//! Counters live in the `quota_state` row: cumulative documents and
//! storage bytes, and day-keyed query/token counts. The first operation
//! on a new UTC day resets the daily counters before it is processed.
//! Each consume runs in one SQLite transaction, so checks and updates are
//! atomic per tenant.

use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::QuotaConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Cumulative count of live documents.
    Documents,
    /// Cumulative stored bytes.
    Storage,
    /// Queries answered today.
    Queries,
    /// Model tokens spent today.
    Tokens,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub day_key: String,
    pub documents_used: i64,
    pub storage_used_bytes: i64,
    pub queries_today: i64,
    pub tokens_today: i64,
}

pub struct QuotaGovernor {
    pool: SqlitePool,
    limits: QuotaConfig,
}

fn today_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Unix timestamp of the next UTC midnight, when daily counters reset.
fn next_reset_at() -> i64 {
    Utc::now()
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

impl QuotaGovernor {
    pub fn new(pool: SqlitePool, limits: QuotaConfig) -> Self {
        Self { pool, limits }
    }

    pub fn limits(&self) -> &QuotaConfig {
        &self.limits
    }

    /// Atomically check and consume. Denials carry the reset timestamp for
    /// daily kinds (0 for cumulative kinds, which never reset on their own).
    pub async fn try_consume(&self, tenant_id: &str, kind: QuotaKind, amount: i64) -> Result<()> {
        let today = today_key();
        let mut tx = self.pool.begin().await?;

        let state = load_state(&mut tx, tenant_id, &today).await?;

        let (used, limit, column, reset_at) = match kind {
            QuotaKind::Documents => (
                state.documents_used,
                self.limits.max_documents,
                "documents_used",
                0,
            ),
            QuotaKind::Storage => (
                state.storage_used_bytes,
                self.limits.max_storage_bytes,
                "storage_used_bytes",
                0,
            ),
            QuotaKind::Queries => (
                state.queries_today,
                self.limits.daily_queries,
                "queries_today",
                next_reset_at(),
            ),
            QuotaKind::Tokens => (
                state.tokens_today,
                self.limits.daily_tokens,
                "tokens_today",
                next_reset_at(),
            ),
        };

        if used + amount > limit {
            return Err(Error::QuotaExceeded {
                reason: format!("{} {}/{}", column, used, limit),
                reset_at,
            });
        }

        sqlx::query(&format!(
            "UPDATE quota_state SET {} = {} + ? WHERE tenant_id = ?",
            column, column
        ))
        .bind(amount)
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Add usage without a limit check. Used for post-call reconciliation,
    /// where the work already happened and must be counted; the next
    /// `try_consume` enforces the cap.
    pub async fn record(&self, tenant_id: &str, kind: QuotaKind, amount: i64) -> Result<()> {
        let today = today_key();
        let mut tx = self.pool.begin().await?;
        load_state(&mut tx, tenant_id, &today).await?;

        sqlx::query(&format!(
            "UPDATE quota_state SET {} = {} + ? WHERE tenant_id = ?",
            column_for(kind),
            column_for(kind)
        ))
        .bind(amount)
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Return previously consumed amount (failed ingest, deletion). Floors
    /// at zero.
    pub async fn release(&self, tenant_id: &str, kind: QuotaKind, amount: i64) -> Result<()> {
        let today = today_key();
        let mut tx = self.pool.begin().await?;
        load_state(&mut tx, tenant_id, &today).await?;

        sqlx::query(&format!(
            "UPDATE quota_state SET {} = MAX(0, {} - ?) WHERE tenant_id = ?",
            column_for(kind),
            column_for(kind)
        ))
        .bind(amount)
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deny when the daily token budget is already spent. Token usage is
    /// only known after the model call, so admission checks headroom and
    /// reconciliation records the actual spend.
    pub async fn ensure_token_headroom(&self, tenant_id: &str) -> Result<()> {
        let status = self.status(tenant_id).await?;
        if status.tokens_today >= self.limits.daily_tokens {
            return Err(Error::QuotaExceeded {
                reason: format!(
                    "tokens_today {}/{}",
                    status.tokens_today, self.limits.daily_tokens
                ),
                reset_at: next_reset_at(),
            });
        }
        Ok(())
    }

    pub async fn status(&self, tenant_id: &str) -> Result<QuotaStatus> {
        let today = today_key();
        let mut tx = self.pool.begin().await?;
        let state = load_state(&mut tx, tenant_id, &today).await?;
        tx.commit().await?;
        Ok(state)
    }
}

fn column_for(kind: QuotaKind) -> &'static str {
    match kind {
        QuotaKind::Documents => "documents_used",
        QuotaKind::Storage => "storage_used_bytes",
        QuotaKind::Queries => "queries_today",
        QuotaKind::Tokens => "tokens_today",
    }
}

/// Fetch the tenant row, creating it and applying day rollover as needed.
async fn load_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    tenant_id: &str,
    today: &str,
) -> Result<QuotaStatus> {
    sqlx::query(
        "INSERT INTO quota_state (tenant_id, day_key) VALUES (?, ?)
         ON CONFLICT(tenant_id) DO NOTHING",
    )
    .bind(tenant_id)
    .bind(today)
    .execute(&mut **tx)
    .await?;

    let row = sqlx::query(
        "SELECT day_key, documents_used, storage_used_bytes, queries_today, tokens_today
         FROM quota_state WHERE tenant_id = ?",
    )
    .bind(tenant_id)
    .fetch_one(&mut **tx)
    .await?;

    let day_key: String = row.get("day_key");
    let mut state = QuotaStatus {
        day_key: day_key.clone(),
        documents_used: row.get("documents_used"),
        storage_used_bytes: row.get("storage_used_bytes"),
        queries_today: row.get("queries_today"),
        tokens_today: row.get("tokens_today"),
    };

    if day_key != today {
        sqlx::query(
            "UPDATE quota_state SET day_key = ?, queries_today = 0, tokens_today = 0
             WHERE tenant_id = ?",
        )
        .bind(today)
        .bind(tenant_id)
        .execute(&mut **tx)
        .await?;
        state.day_key = today.to_string();
        state.queries_today = 0;
        state.tokens_today = 0;
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn governor(limits: QuotaConfig) -> (TempDir, QuotaGovernor) {
        let tmp = TempDir::new().unwrap();
        let db_config = DbConfig {
            path: tmp.path().join("q.sqlite"),
            max_connections: 4,
        };
        let pool = db::open_pool(&db_config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, QuotaGovernor::new(pool, limits))
    }

    #[tokio::test]
    async fn consume_until_denied() {
        let (_tmp, governor) = governor(QuotaConfig {
            daily_queries: 2,
            ..QuotaConfig::default()
        })
        .await;

        governor.try_consume("t1", QuotaKind::Queries, 1).await.unwrap();
        governor.try_consume("t1", QuotaKind::Queries, 1).await.unwrap();
        let err = governor
            .try_consume("t1", QuotaKind::Queries, 1)
            .await
            .unwrap_err();
        match err {
            Error::QuotaExceeded { reset_at, .. } => assert!(reset_at > Utc::now().timestamp()),
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tenants_are_independent() {
        let (_tmp, governor) = governor(QuotaConfig {
            daily_queries: 1,
            ..QuotaConfig::default()
        })
        .await;
        governor.try_consume("t1", QuotaKind::Queries, 1).await.unwrap();
        governor.try_consume("t2", QuotaKind::Queries, 1).await.unwrap();
        assert!(governor.try_consume("t1", QuotaKind::Queries, 1).await.is_err());
    }

    #[tokio::test]
    async fn storage_checks_amount() {
        let (_tmp, governor) = governor(QuotaConfig {
            max_storage_bytes: 1000,
            ..QuotaConfig::default()
        })
        .await;
        governor.try_consume("t1", QuotaKind::Storage, 900).await.unwrap();
        assert!(governor.try_consume("t1", QuotaKind::Storage, 200).await.is_err());
        governor.try_consume("t1", QuotaKind::Storage, 100).await.unwrap();
    }

    #[tokio::test]
    async fn release_floors_at_zero() {
        let (_tmp, governor) = governor(QuotaConfig::default()).await;
        governor.try_consume("t1", QuotaKind::Documents, 1).await.unwrap();
        governor.release("t1", QuotaKind::Documents, 5).await.unwrap();
        let status = governor.status("t1").await.unwrap();
        assert_eq!(status.documents_used, 0);
    }

    #[tokio::test]
    async fn record_bypasses_limit_but_counts() {
        let (_tmp, governor) = governor(QuotaConfig {
            daily_tokens: 100,
            ..QuotaConfig::default()
        })
        .await;
        governor.record("t1", QuotaKind::Tokens, 500).await.unwrap();
        let status = governor.status("t1").await.unwrap();
        assert_eq!(status.tokens_today, 500);
        assert!(governor.try_consume("t1", QuotaKind::Tokens, 1).await.is_err());
    }

    #[tokio::test]
    async fn stale_day_key_resets_daily_counters() {
        let (_tmp, governor) = governor(QuotaConfig::default()).await;
        governor.record("t1", QuotaKind::Queries, 7).await.unwrap();
        governor.record("t1", QuotaKind::Documents, 3).await.unwrap();

        // Simulate a row left over from a previous day.
        sqlx::query("UPDATE quota_state SET day_key = '2000-01-01' WHERE tenant_id = 't1'")
            .execute(&governor.pool)
            .await
            .unwrap();

        let status = governor.status("t1").await.unwrap();
        assert_eq!(status.queries_today, 0, "daily counter reset");
        assert_eq!(status.documents_used, 3, "cumulative counter survives");
        assert_eq!(status.day_key, today_key());
    }
}
