//! Ledger configuration.
//!
//! Loaded from `~/.quotaledger/config.json` (or an explicit path), then
//! overridden by `QUOTALEDGER_*` environment variables. Every section is
//! `#[serde(default)]`, so a partial file only overrides what it names.

use std::path::{Path, PathBuf};

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LedgerError, Result};

/// Secret shipped as the default; using it in production is logged loudly.
pub const DEFAULT_IDENTITY_SECRET: &str = "change_me";

/// Upper bound on `referral.deadline_days` (100 years).
pub const MAX_DEADLINE_DAYS: i64 = 36_500;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub quota: QuotaConfig,
    pub referral: ReferralConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

/// SQLite storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file. `None` means `~/.quotaledger/ledger.db`.
    pub database_path: Option<PathBuf>,
    /// Pool size per process.
    pub max_connections: u32,
    /// How long a statement waits on another writer's lock.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Config::dir().join("ledger.db"))
    }
}

/// Daily allowance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Allowance for users without an active subscription when nothing better is known.
    pub free_daily_limit: i64,
    /// Allowance for subscribers when nothing better is known.
    pub paid_daily_limit: i64,
    /// Static tier map, e.g. `{"FREE": 10, "PLUS": 30, "PREMIUM": 100}`.
    ///
    /// Kept as raw JSON: a malformed map is skipped at resolution time
    /// rather than failing the whole config load.
    pub daily_map: Option<serde_json::Value>,
    /// UTC offset of the reference timezone whose midnight ends an epoch.
    pub epoch_utc_offset: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_daily_limit: 10,
            paid_daily_limit: 100,
            daily_map: None,
            epoch_utc_offset: "+00:00".to_string(),
        }
    }
}

impl QuotaConfig {
    /// Parsed [`Self::epoch_utc_offset`].
    pub fn epoch_offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.epoch_utc_offset)
    }
}

/// Referral program parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    /// Bonus credits paid to the referrer per activated referral.
    pub reward: i64,
    /// Maximum cumulative referral credits one referrer can earn.
    pub cap: i64,
    /// Counted invitee messages needed to activate a referral.
    pub required: i64,
    /// Days the invitee has to reach `required`.
    pub deadline_days: i64,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            reward: 10,
            cap: 30,
            required: 5,
            deadline_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// HMAC key used to derive user hashes from raw platform identities.
    pub secret: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            secret: DEFAULT_IDENTITY_SECRET.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// `~/.quotaledger`
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".quotaledger")
    }

    /// `~/.quotaledger/config.json`
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from the default path (defaults if absent), then apply env overrides.
    pub fn load() -> Result<Self> {
        Self::load_with_env(&Self::path())
    }

    /// Load from `path` (defaults if absent), then apply env overrides and validate.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load_from_path(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file without env overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("Failed to read config at {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            LedgerError::Config(format!("Failed to parse config at {}: {}", path.display(), e))
        })
    }

    /// Apply `QUOTALEDGER_*` overrides read through `lookup`.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("QUOTALEDGER_DB_PATH") {
            if !path.trim().is_empty() {
                self.storage.database_path = Some(PathBuf::from(path.trim()));
            }
        }
        override_parsed(
            &lookup,
            "QUOTALEDGER_DB_MAX_CONNECTIONS",
            &mut self.storage.max_connections,
        );
        override_parsed(
            &lookup,
            "QUOTALEDGER_FREE_DAILY_LIMIT",
            &mut self.quota.free_daily_limit,
        );
        override_parsed(
            &lookup,
            "QUOTALEDGER_PAID_DAILY_LIMIT",
            &mut self.quota.paid_daily_limit,
        );
        if let Some(raw) = lookup("QUOTALEDGER_DAILY_QUOTA_MAP") {
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value @ serde_json::Value::Object(_)) => self.quota.daily_map = Some(value),
                _ => warn!("QUOTALEDGER_DAILY_QUOTA_MAP is not a JSON object; ignoring"),
            }
        }
        if let Some(offset) = lookup("QUOTALEDGER_EPOCH_UTC_OFFSET") {
            self.quota.epoch_utc_offset = offset.trim().to_string();
        }
        override_parsed(&lookup, "QUOTALEDGER_REF_BONUS", &mut self.referral.reward);
        override_parsed(&lookup, "QUOTALEDGER_REF_CAP", &mut self.referral.cap);
        override_parsed(
            &lookup,
            "QUOTALEDGER_REF_REQUIRED",
            &mut self.referral.required,
        );
        override_parsed(
            &lookup,
            "QUOTALEDGER_REF_DEADLINE_DAYS",
            &mut self.referral.deadline_days,
        );
        if let Some(secret) = lookup("QUOTALEDGER_IDENTITY_SECRET") {
            if !secret.is_empty() {
                self.identity.secret = secret;
            }
        }
    }

    /// Reject values the ledger cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.storage.max_connections == 0 {
            return Err(LedgerError::Config(
                "storage.max_connections must be at least 1".into(),
            ));
        }
        if self.quota.free_daily_limit < 0 || self.quota.paid_daily_limit < 0 {
            return Err(LedgerError::Config(
                "daily limits must not be negative".into(),
            ));
        }
        self.quota.epoch_offset()?;
        let r = &self.referral;
        if r.required < 1 {
            return Err(LedgerError::Config(
                "referral.required must be at least 1".into(),
            ));
        }
        if r.reward < 0 || r.cap < 0 || r.deadline_days < 0 {
            return Err(LedgerError::Config(
                "referral reward, cap and deadline_days must not be negative".into(),
            ));
        }
        if r.deadline_days > MAX_DEADLINE_DAYS {
            return Err(LedgerError::Config(format!(
                "referral.deadline_days must be at most {}",
                MAX_DEADLINE_DAYS
            )));
        }
        if self.identity.secret == DEFAULT_IDENTITY_SECRET {
            warn!("identity.secret is the built-in default; set QUOTALEDGER_IDENTITY_SECRET");
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

/// Parse `Z`, `UTC`, `+HH`, `+HH:MM` or `-HH:MM` into a fixed offset.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let s = raw.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0)
            .ok_or_else(|| LedgerError::Config("invalid UTC offset".into()));
    }
    let bad = || LedgerError::Config(format!("invalid UTC offset '{}'", raw));
    let (sign, rest) = match s.as_bytes()[0] {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return Err(bad()),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().map_err(|_| bad())?;
    let minutes: i32 = minutes.parse().map_err(|_| bad())?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}
