//! Entitlement ledger: per-user daily allowance and bonus balance.
//!
//! Every public operation starts with [`Ledger::ensure_user`], so a user row
//! always exists and its daily allowance is current for this epoch before
//! anything reads or debits it.
//!
//! No state lives in this struct beyond handles. Concurrency safety comes
//! from the statements themselves:
//!
//! - debits and grants are single conditional `UPDATE`s
//! - epoch resets are compare-and-swap on `(reset_at, tier, subscription_until)`
//!   and retried a bounded number of times

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::identity::UserHash;
use crate::quota::map::FREE_TIER;
use crate::quota::{
    compute_daily_limit, next_epoch_boundary, normalize_tier, reset_due, QuotaMapStore,
};
use crate::store::{from_unix, Store};

/// Attempts at a compare-and-swap reset before giving up with `Contention`.
const MAX_RESET_ATTEMPTS: usize = 8;

/// Longest accepted tier name.
pub const MAX_TIER_LEN: usize = 32;

/// What [`Ledger::ensure_user`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// No row existed; one was inserted with the FREE allowance.
    Created,
    /// The epoch had ended; the allowance was recomputed.
    Reset,
    /// Row exists and is current.
    Unchanged,
}

/// The user-facing view of a ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitsSnapshot {
    pub daily_remaining: i64,
    pub bonus_balance: i64,
    pub reset_at: DateTime<Utc>,
    pub tier: String,
    pub subscription_until: Option<DateTime<Utc>>,
}

/// Full ledger row, for audit and operator display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub user_hash: String,
    pub created_at: DateTime<Utc>,
    pub tier: String,
    pub subscription_until: Option<DateTime<Utc>>,
    pub daily_remaining: i64,
    pub reset_at: DateTime<Utc>,
    pub bonus_balance: i64,
    pub earned_referral_credits: i64,
    pub referrer: Option<String>,
}

impl UserRecord {
    pub fn snapshot(&self) -> LimitsSnapshot {
        LimitsSnapshot {
            daily_remaining: self.daily_remaining,
            bonus_balance: self.bonus_balance,
            reset_at: self.reset_at,
            tier: self.tier.clone(),
            subscription_until: self.subscription_until,
        }
    }
}

/// Tier names: 1..=32 chars of `[A-Za-z0-9_-]` after trimming.
pub fn is_valid_tier(tier: &str) -> bool {
    let t = tier.trim();
    !t.is_empty()
        && t.len() <= MAX_TIER_LEN
        && t.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Subscription end `days` from `now`.
///
/// `None` for zero or negative days, and for spans past chrono's calendar.
pub fn subscription_for_days(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    if days <= 0 {
        return None;
    }
    Duration::try_days(days).and_then(|span| now.checked_add_signed(span))
}

const USER_COLUMNS: &str = "user_hash, created_at, tier, subscription_until, daily_remaining, \
     reset_at, bonus_balance, earned_referral_credits, referrer_hash";

fn user_from_row(row: &SqliteRow) -> Result<UserRecord> {
    Ok(UserRecord {
        user_hash: row.try_get("user_hash")?,
        created_at: from_unix(row.try_get("created_at")?),
        tier: row.try_get("tier")?,
        subscription_until: row
            .try_get::<Option<i64>, _>("subscription_until")?
            .map(from_unix),
        daily_remaining: row.try_get("daily_remaining")?,
        reset_at: from_unix(row.try_get("reset_at")?),
        bonus_balance: row.try_get("bonus_balance")?,
        earned_referral_credits: row.try_get("earned_referral_credits")?,
        referrer: row.try_get("referrer_hash")?,
    })
}

/// Handle to the entitlement ledger. Cheap to clone.
#[derive(Clone)]
pub struct Ledger {
    store: Store,
    quota: QuotaMapStore,
    clock: Arc<dyn Clock>,
    epoch_offset: FixedOffset,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("epoch_offset", &self.epoch_offset)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn new(
        store: Store,
        quota: QuotaMapStore,
        clock: Arc<dyn Clock>,
        epoch_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            quota,
            clock,
            epoch_offset,
        }
    }

    /// Build a ledger and its quota map store from configuration.
    pub fn from_config(store: Store, clock: Arc<dyn Clock>, config: &Config) -> Result<Self> {
        let offset = config.quota.epoch_offset()?;
        let quota = QuotaMapStore::new(store.clone(), Arc::clone(&clock), &config.quota);
        Ok(Self::new(store, quota, clock, offset))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn quota(&self) -> &QuotaMapStore {
        &self.quota
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn epoch_offset(&self) -> FixedOffset {
        self.epoch_offset
    }

    // ---------------------------------------------------------------------
    // Epoch handling
    // ---------------------------------------------------------------------

    /// Create the user if missing, or reset their allowance if the epoch ended.
    ///
    /// Returns `None` for a malformed hash.
    pub async fn ensure_user(&self, user: &str) -> Result<Option<EnsureOutcome>> {
        let Some(hash) = UserHash::parse(user) else {
            debug!("ensure_user: malformed hash");
            return Ok(None);
        };
        self.ensure(&hash).await.map(Some)
    }

    pub(crate) async fn ensure(&self, hash: &UserHash) -> Result<EnsureOutcome> {
        let now = self.clock.now();
        for _ in 0..MAX_RESET_ATTEMPTS {
            let row = sqlx::query(
                "SELECT tier, subscription_until, reset_at FROM users WHERE user_hash = ?",
            )
            .bind(hash.as_str())
            .fetch_optional(self.store.pool())
            .await?;

            let Some(row) = row else {
                if self.insert_user(hash, now).await? {
                    return Ok(EnsureOutcome::Created);
                }
                // Lost the insert race; the row exists now.
                continue;
            };

            let tier: String = row.try_get("tier")?;
            let until: Option<i64> = row.try_get("subscription_until")?;
            let reset_at: i64 = row.try_get("reset_at")?;
            if !reset_due(now, from_unix(reset_at)) {
                return Ok(EnsureOutcome::Unchanged);
            }

            let limit = self.daily_limit(&tier, until.map(from_unix), now).await?;
            let next = next_epoch_boundary(now, self.epoch_offset);
            let done = sqlx::query(
                "UPDATE users SET daily_remaining = ?, reset_at = ?
                 WHERE user_hash = ? AND reset_at = ? AND tier = ? AND subscription_until IS ?",
            )
            .bind(limit)
            .bind(next.timestamp())
            .bind(hash.as_str())
            .bind(reset_at)
            .bind(&tier)
            .bind(until)
            .execute(self.store.pool())
            .await?;
            if done.rows_affected() == 1 {
                debug!(user = %hash.short(), tier = %tier, limit, "daily allowance reset");
                return Ok(EnsureOutcome::Reset);
            }
            // Someone else reset or changed the tier in between; re-read.
        }
        Err(LedgerError::Contention(format!(
            "epoch reset for {} kept conflicting",
            hash.short()
        )))
    }

    async fn insert_user(&self, hash: &UserHash, now: DateTime<Utc>) -> Result<bool> {
        let limit = self.daily_limit(FREE_TIER, None, now).await?;
        let reset_at = next_epoch_boundary(now, self.epoch_offset);
        let done = sqlx::query(
            "INSERT INTO users(user_hash, created_at, reset_at, tier, daily_remaining)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_hash) DO NOTHING",
        )
        .bind(hash.as_str())
        .bind(now.timestamp())
        .bind(reset_at.timestamp())
        .bind(FREE_TIER)
        .bind(limit)
        .execute(self.store.pool())
        .await?;
        let created = done.rows_affected() == 1;
        if created {
            debug!(user = %hash.short(), limit, "user created");
        }
        Ok(created)
    }

    async fn daily_limit(
        &self,
        tier: &str,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let map = self.quota.get_quota_map().await?;
        Ok(compute_daily_limit(
            tier,
            until,
            now,
            &map,
            self.quota.defaults(),
        ))
    }

    // ---------------------------------------------------------------------
    // Debits and grants
    // ---------------------------------------------------------------------

    /// Spend one unit: daily allowance first, then bonus.
    ///
    /// Returns `false` with nothing changed when both are zero.
    pub async fn consume_one(&self, user: &str) -> Result<bool> {
        let Some(hash) = UserHash::parse(user) else {
            return Ok(false);
        };
        self.ensure(&hash).await?;
        // SET expressions all see the pre-update row.
        let row = sqlx::query(
            "UPDATE users SET
               daily_remaining = CASE WHEN daily_remaining > 0
                                      THEN daily_remaining - 1 ELSE daily_remaining END,
               bonus_balance = CASE WHEN daily_remaining > 0
                                    THEN bonus_balance ELSE bonus_balance - 1 END
             WHERE user_hash = ? AND (daily_remaining > 0 OR bonus_balance > 0)
             RETURNING daily_remaining, bonus_balance",
        )
        .bind(hash.as_str())
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => {
                let daily: i64 = row.try_get("daily_remaining")?;
                let bonus: i64 = row.try_get("bonus_balance")?;
                debug!(user = %hash.short(), daily, bonus, "consumed one");
                Ok(true)
            }
            None => {
                debug!(user = %hash.short(), "allowance exhausted");
                Ok(false)
            }
        }
    }

    /// Add `amount` to the bonus balance.
    ///
    /// Non-positive amounts are rejected, as is any grant that would push the
    /// balance past `i64::MAX`. SQLite would otherwise store the sum as REAL.
    pub async fn grant_bonus(&self, user: &str, amount: i64) -> Result<bool> {
        if amount <= 0 {
            debug!(amount, "grant_bonus: non-positive amount ignored");
            return Ok(false);
        }
        let Some(hash) = UserHash::parse(user) else {
            return Ok(false);
        };
        self.ensure(&hash).await?;
        let done = sqlx::query(
            "UPDATE users SET bonus_balance = bonus_balance + ?
             WHERE user_hash = ? AND bonus_balance <= ?",
        )
        .bind(amount)
        .bind(hash.as_str())
        .bind(i64::MAX - amount)
        .execute(self.store.pool())
        .await?;
        let granted = done.rows_affected() == 1;
        if granted {
            info!(user = %hash.short(), amount, "bonus granted");
        } else {
            warn!(user = %hash.short(), amount, "grant rejected: bonus balance would overflow");
        }
        Ok(granted)
    }

    // ---------------------------------------------------------------------
    // Administration
    // ---------------------------------------------------------------------

    /// Set tier and subscription end. The daily allowance is left alone until
    /// the next reset (or [`Self::force_reset`]).
    pub async fn set_tier(
        &self,
        user: &str,
        tier: &str,
        subscription_until: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        if !is_valid_tier(tier) {
            debug!("set_tier: malformed tier name");
            return Ok(false);
        }
        let Some(hash) = UserHash::parse(user) else {
            return Ok(false);
        };
        self.ensure(&hash).await?;
        let tier = normalize_tier(tier);
        let done = sqlx::query("UPDATE users SET tier = ?, subscription_until = ? WHERE user_hash = ?")
            .bind(&tier)
            .bind(subscription_until.map(|t| t.timestamp()))
            .bind(hash.as_str())
            .execute(self.store.pool())
            .await?;
        let updated = done.rows_affected() == 1;
        if updated {
            info!(
                user = %hash.short(),
                tier = %tier,
                until = ?subscription_until,
                "tier updated"
            );
        }
        Ok(updated)
    }

    /// Recompute the daily allowance now, ignoring the epoch, and start a new epoch.
    pub async fn force_reset(&self, user: &str) -> Result<bool> {
        let Some(hash) = UserHash::parse(user) else {
            return Ok(false);
        };
        self.ensure(&hash).await?;
        let now = self.clock.now();
        for _ in 0..MAX_RESET_ATTEMPTS {
            let Some(row) =
                sqlx::query("SELECT tier, subscription_until FROM users WHERE user_hash = ?")
                    .bind(hash.as_str())
                    .fetch_optional(self.store.pool())
                    .await?
            else {
                return Ok(false);
            };
            let tier: String = row.try_get("tier")?;
            let until: Option<i64> = row.try_get("subscription_until")?;
            let limit = self.daily_limit(&tier, until.map(from_unix), now).await?;
            let next = next_epoch_boundary(now, self.epoch_offset);
            let done = sqlx::query(
                "UPDATE users SET daily_remaining = ?, reset_at = ?
                 WHERE user_hash = ? AND tier = ? AND subscription_until IS ?",
            )
            .bind(limit)
            .bind(next.timestamp())
            .bind(hash.as_str())
            .bind(&tier)
            .bind(until)
            .execute(self.store.pool())
            .await?;
            if done.rows_affected() == 1 {
                info!(user = %hash.short(), tier = %tier, limit, "allowance force-reset");
                return Ok(true);
            }
        }
        Err(LedgerError::Contention(format!(
            "force reset for {} kept conflicting",
            hash.short()
        )))
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Current limits, after bringing the row up to date.
    pub async fn snapshot(&self, user: &str) -> Result<Option<LimitsSnapshot>> {
        let Some(hash) = UserHash::parse(user) else {
            return Ok(None);
        };
        self.ensure(&hash).await?;
        Ok(self.fetch(&hash).await?.map(|u| u.snapshot()))
    }

    /// Raw row as stored. Does not create the user or apply a pending reset.
    pub async fn user(&self, user: &str) -> Result<Option<UserRecord>> {
        let Some(hash) = UserHash::parse(user) else {
            return Ok(None);
        };
        self.fetch(&hash).await
    }

    pub async fn user_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(self.store.pool())
            .await?;
        Ok(n)
    }

    async fn fetch(&self, hash: &UserHash) -> Result<Option<UserRecord>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE user_hash = ?");
        let row = sqlx::query(&sql)
            .bind(hash.as_str())
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }
}
