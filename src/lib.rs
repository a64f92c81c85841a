//! quotaledger: per-user daily message allowance, bonus credits and a
//! referral program, persisted in SQLite and safe to share across processes.
//!
//! ```no_run
//! # async fn demo() -> quotaledger::Result<()> {
//! use std::sync::Arc;
//! use quotaledger::{Config, Ledger, ReferralProgram, Store, SystemClock};
//!
//! let config = Config::load()?;
//! let store = Store::open(&config.storage).await?;
//! let ledger = Ledger::from_config(store, Arc::new(SystemClock), &config)?;
//! let referrals = ReferralProgram::new(ledger.clone(), config.referral.clone());
//!
//! let user = "0123456789abcdef0123456789abcdef";
//! if ledger.consume_one(user).await? {
//!     referrals.on_counted_activity(user).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod quota;
pub mod referral;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use error::{LedgerError, Result};
pub use identity::{resolve_identifier, UserHash};
pub use ledger::{EnsureOutcome, Ledger, LimitsSnapshot, UserRecord};
pub use quota::{compute_daily_limit, next_epoch_boundary, QuotaMap, QuotaMapStore, QuotaSource};
pub use referral::{ActivityOutcome, Referral, ReferralProgram, ReferralStats, ReferralStatus};
pub use store::{KvEntry, Store};
