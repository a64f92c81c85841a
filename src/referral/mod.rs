//! Referral program.
//!
//! A referral links an invitee to the referrer whose code they arrived with.
//! It starts `pending`, counts the invitee's counted messages, and becomes
//! `activated` on the `required`-th one (paying the referrer) or `expired`
//! if the deadline passes first. Records are never deleted.
//!
//! Each multi-statement change runs in one transaction that opens with a
//! write, so SQLite takes the write lock up front and concurrent activations
//! serialise instead of deadlocking on a read-to-write upgrade.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::config::ReferralConfig;
use crate::error::Result;
use crate::identity::UserHash;
use crate::ledger::Ledger;
use crate::store::from_unix;

/// Lifecycle of a referral. Transitions only go forward from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Pending,
    Activated,
    Expired,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Activated => "activated",
            ReferralStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferralStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReferralStatus::Pending),
            "activated" => Ok(ReferralStatus::Activated),
            "expired" => Ok(ReferralStatus::Expired),
            other => Err(format!("unknown referral status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Referral {
    pub id: i64,
    pub referrer: String,
    pub invitee: String,
    pub status: ReferralStatus,
    pub progress_count: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// Result of one counted invitee message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// The user was not invited by anyone.
    NoReferral,
    /// Already activated or expired; nothing changed.
    NotPending(ReferralStatus),
    /// The deadline passed; the referral is now expired and nothing was paid.
    Expired,
    /// Counted, threshold not yet reached.
    Progressed { progress: i64 },
    /// Threshold reached. `granted` may be 0 once the referrer hit the cap.
    Activated { granted: i64 },
}

/// Referral counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReferralStats {
    pub pending: i64,
    pub activated: i64,
    pub expired: i64,
}

impl ReferralStats {
    pub fn total(&self) -> i64 {
        self.pending + self.activated + self.expired
    }
}

const REFERRAL_COLUMNS: &str =
    "id, referrer_hash, invitee_hash, status, progress_count, created_at, expires_at, activated_at";

fn referral_from_row(row: &SqliteRow) -> Result<Referral> {
    let raw: String = row.try_get("status")?;
    let status = raw
        .parse::<ReferralStatus>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;
    Ok(Referral {
        id: row.try_get("id")?,
        referrer: row.try_get("referrer_hash")?,
        invitee: row.try_get("invitee_hash")?,
        status,
        progress_count: row.try_get("progress_count")?,
        created_at: from_unix(row.try_get("created_at")?),
        expires_at: from_unix(row.try_get("expires_at")?),
        activated_at: row.try_get::<Option<i64>, _>("activated_at")?.map(from_unix),
    })
}

/// Referral operations on top of a [`Ledger`].
#[derive(Debug, Clone)]
pub struct ReferralProgram {
    ledger: Ledger,
    settings: ReferralConfig,
}

impl ReferralProgram {
    pub fn new(ledger: Ledger, settings: ReferralConfig) -> Self {
        Self { ledger, settings }
    }

    pub fn settings(&self) -> &ReferralConfig {
        &self.settings
    }

    /// Record that `invitee` was referred by `referrer`.
    ///
    /// Rejected for self-referral, for an invitee that already has a referral
    /// record, or for an invitee already attributed to someone else.
    pub async fn create(&self, referrer: &str, invitee: &str) -> Result<bool> {
        let (Some(referrer), Some(invitee)) = (UserHash::parse(referrer), UserHash::parse(invitee))
        else {
            debug!("referral rejected: malformed hash");
            return Ok(false);
        };
        if referrer == invitee {
            debug!(user = %invitee.short(), "referral rejected: self-referral");
            return Ok(false);
        }
        self.ledger.ensure(&referrer).await?;
        self.ledger.ensure(&invitee).await?;

        let now = self.ledger.clock().now();
        let Some(expires_at) = Duration::try_days(self.settings.deadline_days)
            .and_then(|deadline| now.checked_add_signed(deadline))
        else {
            warn!(
                deadline_days = self.settings.deadline_days,
                "referral rejected: deadline out of range"
            );
            return Ok(false);
        };
        let mut tx = self.ledger.store().pool().begin().await?;

        sqlx::query("UPDATE users SET referrer_hash = ? WHERE user_hash = ? AND referrer_hash IS NULL")
            .bind(referrer.as_str())
            .bind(invitee.as_str())
            .execute(&mut *tx)
            .await?;

        let attributed: Option<String> =
            sqlx::query_scalar("SELECT referrer_hash FROM users WHERE user_hash = ?")
                .bind(invitee.as_str())
                .fetch_one(&mut *tx)
                .await?;
        if attributed.as_deref() != Some(referrer.as_str()) {
            tx.rollback().await?;
            debug!(user = %invitee.short(), "referral rejected: already attributed");
            return Ok(false);
        }

        let inserted = sqlx::query(
            "INSERT INTO referrals(referrer_hash, invitee_hash, created_at, status, progress_count, expires_at)
             VALUES (?, ?, ?, 'pending', 0, ?)
             ON CONFLICT(invitee_hash) DO NOTHING",
        )
        .bind(referrer.as_str())
        .bind(invitee.as_str())
        .bind(now.timestamp())
        .bind(expires_at.timestamp())
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(user = %invitee.short(), "referral rejected: invitee already has a referral");
            return Ok(false);
        }

        tx.commit().await?;
        info!(
            referrer = %referrer.short(),
            invitee = %invitee.short(),
            expires_at = %expires_at,
            "referral created"
        );
        Ok(true)
    }

    /// Deep-link entry point: the code is the referrer's hash.
    pub async fn accept_code(&self, code: &str, invitee: &str) -> Result<bool> {
        self.create(code, invitee).await
    }

    /// Shareable referral code for `user`.
    pub fn code_for(&self, user: &str) -> Option<String> {
        UserHash::parse(user).map(|h| h.as_str().to_string())
    }

    /// Count one message from `invitee` towards their referral.
    pub async fn on_counted_activity(&self, invitee: &str) -> Result<ActivityOutcome> {
        let Some(invitee) = UserHash::parse(invitee) else {
            return Ok(ActivityOutcome::NoReferral);
        };
        self.ledger.ensure(&invitee).await?;
        let now = self.ledger.clock().now().timestamp();
        let mut tx = self.ledger.store().pool().begin().await?;

        let progressed = sqlx::query(
            "UPDATE referrals SET progress_count = progress_count + 1
             WHERE invitee_hash = ? AND status = 'pending' AND expires_at >= ?
             RETURNING id, referrer_hash, progress_count",
        )
        .bind(invitee.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = progressed else {
            let expired = sqlx::query(
                "UPDATE referrals SET status = 'expired'
                 WHERE invitee_hash = ? AND status = 'pending' AND expires_at < ?",
            )
            .bind(invitee.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if expired.rows_affected() > 0 {
                tx.commit().await?;
                info!(invitee = %invitee.short(), "referral expired before activation");
                return Ok(ActivityOutcome::Expired);
            }
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM referrals WHERE invitee_hash = ?")
                    .bind(invitee.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.commit().await?;
            return Ok(match status {
                None => ActivityOutcome::NoReferral,
                Some(raw) => {
                    let status = raw
                        .parse::<ReferralStatus>()
                        .map_err(|e| sqlx::Error::Decode(e.into()))?;
                    ActivityOutcome::NotPending(status)
                }
            });
        };

        let id: i64 = row.get("id");
        let referrer: String = row.get("referrer_hash");
        let progress: i64 = row.get("progress_count");
        let referrer_short = referrer.get(..8).unwrap_or(&referrer).to_string();
        if progress < self.settings.required {
            tx.commit().await?;
            debug!(invitee = %invitee.short(), progress, "referral progressed");
            return Ok(ActivityOutcome::Progressed { progress });
        }

        sqlx::query(
            "UPDATE referrals SET status = 'activated', activated_at = ?, progress_count = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(self.settings.required.max(0))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let earned: Option<i64> = sqlx::query_scalar(
            "SELECT earned_referral_credits FROM users WHERE user_hash = ?",
        )
        .bind(&referrer)
        .fetch_optional(&mut *tx)
        .await?;

        let granted = match earned {
            None => {
                warn!(referrer = %referrer_short, "referrer row missing; no reward paid");
                0
            }
            Some(earned) => {
                let grant = self
                    .settings
                    .reward
                    .min(self.settings.cap - earned)
                    .max(0);
                if grant > 0 {
                    let paid = sqlx::query(
                        "UPDATE users SET bonus_balance = bonus_balance + ?,
                           earned_referral_credits = earned_referral_credits + ?
                         WHERE user_hash = ? AND bonus_balance <= ?",
                    )
                    .bind(grant)
                    .bind(grant)
                    .bind(&referrer)
                    .bind(i64::MAX - grant)
                    .execute(&mut *tx)
                    .await?;
                    if paid.rows_affected() == 0 {
                        warn!(referrer = %referrer_short, grant, "bonus balance would overflow; no reward paid");
                        0
                    } else {
                        grant
                    }
                } else {
                    0
                }
            }
        };

        tx.commit().await?;
        info!(
            invitee = %invitee.short(),
            referrer = %referrer_short,
            granted,
            "referral activated"
        );
        Ok(ActivityOutcome::Activated { granted })
    }

    /// Expire every pending referral past its deadline. Returns how many changed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = self.ledger.clock().now().timestamp();
        let done = sqlx::query(
            "UPDATE referrals SET status = 'expired' WHERE status = 'pending' AND expires_at < ?",
        )
        .bind(now)
        .execute(self.ledger.store().pool())
        .await?;
        let n = done.rows_affected();
        if n > 0 {
            info!(count = n, "expired stale referrals");
        }
        Ok(n)
    }

    /// The referral record for `invitee`, if any.
    pub async fn get(&self, invitee: &str) -> Result<Option<Referral>> {
        let Some(invitee) = UserHash::parse(invitee) else {
            return Ok(None);
        };
        let sql = format!("SELECT {REFERRAL_COLUMNS} FROM referrals WHERE invitee_hash = ?");
        let row = sqlx::query(&sql)
            .bind(invitee.as_str())
            .fetch_optional(self.ledger.store().pool())
            .await?;
        row.as_ref().map(referral_from_row).transpose()
    }

    /// Every referral made by `referrer`, oldest first.
    pub async fn list_by_referrer(&self, referrer: &str) -> Result<Vec<Referral>> {
        let Some(referrer) = UserHash::parse(referrer) else {
            return Ok(Vec::new());
        };
        let sql =
            format!("SELECT {REFERRAL_COLUMNS} FROM referrals WHERE referrer_hash = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(referrer.as_str())
            .fetch_all(self.ledger.store().pool())
            .await?;
        rows.iter().map(referral_from_row).collect()
    }

    pub async fn stats(&self) -> Result<ReferralStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM referrals GROUP BY status")
            .fetch_all(self.ledger.store().pool())
            .await?;
        let mut stats = ReferralStats::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<ReferralStatus>() {
                Ok(ReferralStatus::Pending) => stats.pending = n,
                Ok(ReferralStatus::Activated) => stats.activated = n,
                Ok(ReferralStatus::Expired) => stats.expired = n,
                Err(e) => warn!(error = %e, "skipping unknown status in stats"),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::config::QuotaConfig;
    use crate::error::LedgerError;
    use crate::quota::QuotaMapStore;
    use crate::store::Store;
    use chrono::{FixedOffset, TimeZone};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn h(name: &str) -> String {
        UserHash::derive("test-secret", name).to_string()
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    async fn program_with(settings: ReferralConfig) -> (ReferralProgram, ManualClock) {
        let clock = ManualClock::new(start());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Store::open_in_memory().await.unwrap();
        let quota = QuotaMapStore::new(store.clone(), Arc::clone(&shared), &QuotaConfig::default());
        let ledger = Ledger::new(store, quota, shared, FixedOffset::east_opt(0).unwrap());
        (ReferralProgram::new(ledger, settings), clock)
    }

    async fn program() -> (ReferralProgram, ManualClock) {
        program_with(ReferralConfig::default()).await
    }

    async fn file_program(dir: &TempDir) -> ReferralProgram {
        let store = Store::open_path(&dir.path().join("ledger.db"), 5, StdDuration::from_secs(10))
            .await
            .unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let quota = QuotaMapStore::new(store.clone(), Arc::clone(&clock), &QuotaConfig::default());
        let ledger = Ledger::new(store, quota, clock, FixedOffset::east_opt(0).unwrap());
        ReferralProgram::new(ledger, ReferralConfig::default())
    }

    async fn activity(p: &ReferralProgram, invitee: &str, times: usize) -> ActivityOutcome {
        let mut last = ActivityOutcome::NoReferral;
        for _ in 0..times {
            last = p.on_counted_activity(invitee).await.unwrap();
        }
        last
    }

    #[tokio::test]
    async fn test_create_sets_referrer_and_pending_record() {
        let (p, _clock) = program().await;
        let (alice, bob) = (h("alice"), h("bob"));
        assert!(p.create(&alice, &bob).await.unwrap());

        let r = p.get(&bob).await.unwrap().unwrap();
        assert_eq!(r.referrer, alice);
        assert_eq!(r.status, ReferralStatus::Pending);
        assert_eq!(r.progress_count, 0);
        assert_eq!(r.expires_at, start() + Duration::days(7));
        assert_eq!(r.activated_at, None);

        let user = p.ledger.user(&bob).await.unwrap().unwrap();
        assert_eq!(user.referrer.as_deref(), Some(alice.as_str()));
    }

    #[tokio::test]
    async fn test_self_referral_rejected() {
        let (p, _clock) = program().await;
        let alice = h("alice");
        assert!(!p.create(&alice, &alice).await.unwrap());
        assert!(!p.create(&alice, &alice.to_uppercase()).await.unwrap());
        assert!(p.get(&alice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_invitee_keeps_first_record() {
        let (p, _clock) = program().await;
        let (alice, bob, carol) = (h("alice"), h("bob"), h("carol"));
        assert!(p.create(&alice, &bob).await.unwrap());
        let first = p.get(&bob).await.unwrap().unwrap();

        assert!(!p.create(&carol, &bob).await.unwrap());
        assert!(!p.create(&alice, &bob).await.unwrap());
        assert_eq!(p.get(&bob).await.unwrap().unwrap(), first);
        let user = p.ledger.user(&bob).await.unwrap().unwrap();
        assert_eq!(user.referrer.as_deref(), Some(alice.as_str()));
    }

    #[tokio::test]
    async fn test_activation_on_fifth_event_and_sixth_is_noop() {
        let (p, _clock) = program().await;
        let (alice, bob) = (h("alice"), h("bob"));
        p.create(&alice, &bob).await.unwrap();

        for i in 1..=4 {
            assert_eq!(
                p.on_counted_activity(&bob).await.unwrap(),
                ActivityOutcome::Progressed { progress: i }
            );
        }
        let before = p.ledger.user(&alice).await.unwrap().unwrap();
        assert_eq!(before.bonus_balance, 0);

        assert_eq!(
            p.on_counted_activity(&bob).await.unwrap(),
            ActivityOutcome::Activated { granted: 10 }
        );
        let r = p.get(&bob).await.unwrap().unwrap();
        assert_eq!(r.status, ReferralStatus::Activated);
        assert_eq!(r.progress_count, 5);
        assert_eq!(r.activated_at, Some(start()));

        let referrer = p.ledger.user(&alice).await.unwrap().unwrap();
        assert_eq!(referrer.bonus_balance, 10);
        assert_eq!(referrer.earned_referral_credits, 10);

        assert_eq!(
            p.on_counted_activity(&bob).await.unwrap(),
            ActivityOutcome::NotPending(ReferralStatus::Activated)
        );
        let after = p.ledger.user(&alice).await.unwrap().unwrap();
        assert_eq!(after.bonus_balance, 10);
        assert_eq!(p.get(&bob).await.unwrap().unwrap().progress_count, 5);
    }

    #[tokio::test]
    async fn test_reward_is_capped_per_referrer() {
        let settings = ReferralConfig {
            reward: 10,
            cap: 25,
            required: 1,
            deadline_days: 7,
        };
        let (p, _clock) = program_with(settings).await;
        let alice = h("alice");
        let mut grants = Vec::new();
        for name in ["b", "c", "d", "e"] {
            let invitee = h(name);
            p.create(&alice, &invitee).await.unwrap();
            match p.on_counted_activity(&invitee).await.unwrap() {
                ActivityOutcome::Activated { granted } => grants.push(granted),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(grants, vec![10, 10, 5, 0]);
        let referrer = p.ledger.user(&alice).await.unwrap().unwrap();
        assert_eq!(referrer.earned_referral_credits, 25);
        assert_eq!(referrer.bonus_balance, 25);
        assert_eq!(p.stats().await.unwrap().activated, 4);
    }

    #[tokio::test]
    async fn test_activity_after_deadline_expires_without_reward() {
        let (p, clock) = program().await;
        let (alice, bob) = (h("alice"), h("bob"));
        p.create(&alice, &bob).await.unwrap();
        activity(&p, &bob, 4).await;

        // Still valid exactly at the deadline.
        clock.advance(Duration::days(7));
        assert_eq!(
            p.on_counted_activity(&bob).await.unwrap(),
            ActivityOutcome::Activated { granted: 10 }
        );

        let carol = h("carol");
        p.create(&alice, &carol).await.unwrap();
        clock.advance(Duration::days(7) + Duration::seconds(1));
        assert_eq!(
            p.on_counted_activity(&carol).await.unwrap(),
            ActivityOutcome::Expired
        );
        assert_eq!(
            p.on_counted_activity(&carol).await.unwrap(),
            ActivityOutcome::NotPending(ReferralStatus::Expired)
        );
        let referrer = p.ledger.user(&alice).await.unwrap().unwrap();
        assert_eq!(referrer.bonus_balance, 10);
    }

    #[tokio::test]
    async fn test_activity_applies_pending_daily_reset() {
        let (p, clock) = program().await;
        let (alice, bob) = (h("alice"), h("bob"));
        p.create(&alice, &bob).await.unwrap();
        for _ in 0..10 {
            assert!(p.ledger.consume_one(&bob).await.unwrap());
        }
        clock.advance(Duration::days(1));

        p.on_counted_activity(&bob).await.unwrap();
        let rec = p.ledger.user(&bob).await.unwrap().unwrap();
        assert_eq!(rec.daily_remaining, 10);
        assert_eq!(rec.reset_at, Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_huge_deadline_rejects_instead_of_panicking() {
        let settings = ReferralConfig {
            deadline_days: i64::MAX,
            ..ReferralConfig::default()
        };
        let (p, _clock) = program_with(settings).await;
        assert!(!p.create(&h("alice"), &h("bob")).await.unwrap());
        assert!(p.get(&h("bob")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reward_skipped_when_referrer_balance_is_maxed() {
        let settings = ReferralConfig {
            required: 1,
            ..ReferralConfig::default()
        };
        let (p, _clock) = program_with(settings).await;
        let (alice, bob) = (h("alice"), h("bob"));
        assert!(p.ledger.grant_bonus(&alice, i64::MAX).await.unwrap());
        p.create(&alice, &bob).await.unwrap();
        assert_eq!(
            p.on_counted_activity(&bob).await.unwrap(),
            ActivityOutcome::Activated { granted: 0 }
        );
        let referrer = p.ledger.user(&alice).await.unwrap().unwrap();
        assert_eq!(referrer.bonus_balance, i64::MAX);
        assert_eq!(referrer.earned_referral_credits, 0);
    }

    #[tokio::test]
    async fn test_concurrent_activity_activates_once() {
        let tmp = TempDir::new().unwrap();
        let p = file_program(&tmp).await;
        let (alice, bob) = (h("alice"), h("bob"));
        assert!(p.create(&alice, &bob).await.unwrap());
        activity(&p, &bob, 4).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let p = p.clone();
            let bob = bob.clone();
            handles.push(tokio::spawn(async move { p.on_counted_activity(&bob).await }));
        }
        let mut activated = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                ActivityOutcome::Activated { granted } => {
                    assert_eq!(granted, 10);
                    activated += 1;
                }
                ActivityOutcome::NotPending(ReferralStatus::Activated) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(activated, 1);

        let r = p.get(&bob).await.unwrap().unwrap();
        assert_eq!(r.status, ReferralStatus::Activated);
        assert_eq!(r.progress_count, 5);
        let referrer = p.ledger.user(&alice).await.unwrap().unwrap();
        assert_eq!(referrer.bonus_balance, 10);
        assert_eq!(referrer.earned_referral_credits, 10);
    }

    #[tokio::test]
    async fn test_concurrent_create_for_one_invitee_accepts_one() {
        let tmp = TempDir::new().unwrap();
        let p = file_program(&tmp).await;
        let invitee = h("invitee");

        let mut handles = Vec::new();
        for i in 0..10 {
            let p = p.clone();
            let invitee = invitee.clone();
            let referrer = h(&format!("referrer-{i}"));
            handles.push(tokio::spawn(async move { p.create(&referrer, &invitee).await }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);

        let r = p.get(&invitee).await.unwrap().unwrap();
        let user = p.ledger.user(&invitee).await.unwrap().unwrap();
        assert_eq!(user.referrer.as_deref(), Some(r.referrer.as_str()));
        assert_eq!(p.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_activity_without_referral() {
        let (p, _clock) = program().await;
        assert_eq!(
            p.on_counted_activity(&h("loner")).await.unwrap(),
            ActivityOutcome::NoReferral
        );
        assert_eq!(
            p.on_counted_activity("garbage").await.unwrap(),
            ActivityOutcome::NoReferral
        );
    }

    #[tokio::test]
    async fn test_sweep_expired_only_touches_stale_pending() {
        let (p, clock) = program().await;
        let alice = h("alice");
        let (bob, carol) = (h("bob"), h("carol"));
        p.create(&alice, &bob).await.unwrap();
        clock.advance(Duration::days(3));
        p.create(&alice, &carol).await.unwrap();

        clock.advance(Duration::days(5));
        assert_eq!(p.sweep_expired().await.unwrap(), 1);
        assert_eq!(p.sweep_expired().await.unwrap(), 0);

        let stats = p.stats().await.unwrap();
        assert_eq!(stats, ReferralStats { pending: 1, activated: 0, expired: 1 });
        assert_eq!(stats.total(), 2);

        let listed = p.list_by_referrer(&alice).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].invitee, bob);
        assert_eq!(listed[0].status, ReferralStatus::Expired);
        assert_eq!(listed[1].status, ReferralStatus::Pending);
    }

    #[tokio::test]
    async fn test_accept_code_normalises_code() {
        let (p, _clock) = program().await;
        let alice = h("alice");
        let code = p.code_for(&alice).unwrap();
        assert_eq!(code, alice);
        let padded = format!("  {}  ", code.to_uppercase());
        assert!(p.accept_code(&padded, &h("bob")).await.unwrap());
        assert!(!p.accept_code("nope", &h("carol")).await.unwrap());
        assert!(p.code_for("xyz").is_none());
    }

    #[tokio::test]
    async fn test_storage_error_propagates() {
        let (p, _clock) = program().await;
        p.ledger.store().close().await;
        let err = p.on_counted_activity(&h("bob")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Storage(_)));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("pending".parse::<ReferralStatus>().unwrap(), ReferralStatus::Pending);
        assert!("PENDING".parse::<ReferralStatus>().is_err());
        assert_eq!(ReferralStatus::Expired.to_string(), "expired");
    }
}
