//! SQLite persistence for quota records.
//!
//! One row per owner, WAL mode for crash safety. The engine never reads the
//! database directly — [`crate::quota::store::SqliteQuotaStore`] wraps this
//! and converts rows to [`crate::quota::QuotaRecord`] values.

use anyhow::{Context as _, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking callers indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
/// Returns an error if the operation takes longer than `QUERY_TIMEOUT`.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QuotaRow {
    pub owner_id: String,
    pub count: i64,
    /// JSON array of epoch-millisecond deduction instants.
    pub deducted_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding it
    /// are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("proctord.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("src/storage/migrations")
            .run(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    // ─── Quota rows ─────────────────────────────────────────────────────────

    pub async fn get_quota(&self, owner_id: &str) -> Result<Option<QuotaRow>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, QuotaRow>(
                "SELECT owner_id, count, deducted_at, updated_at
                 FROM quota_records WHERE owner_id = ?",
            )
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    /// Upsert the full row for an owner. Last writer wins — reconciliation
    /// happens in the cache via timestamp-identity merge, not here.
    pub async fn upsert_quota(
        &self,
        owner_id: &str,
        count: i64,
        deducted_at_json: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        with_timeout(async {
            sqlx::query(
                "INSERT INTO quota_records (owner_id, count, deducted_at, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (owner_id)
                 DO UPDATE SET count = excluded.count,
                               deducted_at = excluded.deducted_at,
                               updated_at = excluded.updated_at",
            )
            .bind(owner_id)
            .bind(count)
            .bind(deducted_at_json)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}
