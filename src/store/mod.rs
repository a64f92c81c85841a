//! SQLite persistence shared by every ledger process.
//!
//! The database is the single source of truth: no user state is cached in
//! memory between calls. WAL mode lets readers proceed while one writer
//! holds the lock, and `busy_timeout` bounds how long a writer waits.
//!
//! # Tables
//!
//! - `users` keyed by identity hash
//! - `referrals` keyed by autoincrement id, unique on `invitee_hash`
//! - `kv` small scalar/blob values keyed by `(owner, key)`, versioned by last write

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users(
  user_hash TEXT PRIMARY KEY NOT NULL,
  created_at INTEGER NOT NULL,
  reset_at INTEGER NOT NULL,
  tier TEXT NOT NULL DEFAULT 'FREE',
  subscription_until INTEGER,
  daily_remaining INTEGER NOT NULL DEFAULT 0 CHECK (daily_remaining >= 0),
  bonus_balance INTEGER NOT NULL DEFAULT 0 CHECK (bonus_balance >= 0),
  earned_referral_credits INTEGER NOT NULL DEFAULT 0 CHECK (earned_referral_credits >= 0),
  referrer_hash TEXT
);

CREATE TABLE IF NOT EXISTS referrals(
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  referrer_hash TEXT NOT NULL,
  invitee_hash TEXT NOT NULL UNIQUE,
  created_at INTEGER NOT NULL,
  activated_at INTEGER,
  status TEXT NOT NULL DEFAULT 'pending'
    CHECK (status IN ('pending', 'activated', 'expired')),
  progress_count INTEGER NOT NULL DEFAULT 0,
  expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_referrals_status_expires ON referrals(status, expires_at);
CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referrals(referrer_hash);

CREATE TABLE IF NOT EXISTS kv(
  owner TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT,
  version INTEGER NOT NULL DEFAULT 1,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY(owner, key)
);
"#;

/// A value from the `kv` table together with its write metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Option<String>,
    /// Starts at 1 and increments on every overwrite.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Handle to the ledger database. Cheap to clone (wraps a pool).
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database described by `config`.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        Self::open_path(
            &config.resolved_path(),
            config.max_connections,
            Duration::from_millis(config.busy_timeout_ms),
        )
        .await
    }

    /// Open a database file directly.
    pub async fn open_path(
        path: &Path,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        debug!(path = %path.display(), "ledger database ready");
        Ok(store)
    }

    /// Open a private in-memory database.
    ///
    /// The database lives as long as its only connection, so the pool is
    /// pinned to one connection that never idles out.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection. Later operations fail with a storage error.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Read one `kv` entry.
    pub async fn kv_get(&self, owner: &str, key: &str) -> Result<Option<KvEntry>> {
        let row = sqlx::query("SELECT value, version, updated_at FROM kv WHERE owner = ? AND key = ?")
            .bind(owner)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| KvEntry {
            value: row.get("value"),
            version: row.get("version"),
            updated_at: from_unix(row.get("updated_at")),
        }))
    }

    /// Insert or overwrite one `kv` entry in a single statement. Returns the new version.
    pub async fn kv_set(
        &self,
        owner: &str,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let version: i64 = sqlx::query_scalar(
            "INSERT INTO kv(owner, key, value, version, updated_at) VALUES (?, ?, ?, 1, ?)
             ON CONFLICT(owner, key) DO UPDATE SET
               value = excluded.value,
               version = kv.version + 1,
               updated_at = excluded.updated_at
             RETURNING version",
        )
        .bind(owner)
        .bind(key)
        .bind(value)
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    /// Remove one `kv` entry. Returns whether it existed.
    pub async fn kv_delete(&self, owner: &str, key: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM kv WHERE owner = ? AND key = ?")
            .bind(owner)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

/// Seconds since the epoch to `DateTime<Utc>`, clamping garbage to the epoch.
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
