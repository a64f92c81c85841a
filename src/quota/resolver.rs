//! Effective daily allowance for a user.

use chrono::{DateTime, Utc};

use super::map::{normalize_tier, QuotaMap, FREE_TIER, PLUS_TIER};

/// Generic bucket consulted for subscribers whose tier has no own entry.
pub const PAID_BUCKET: &str = "PAID";

/// Scalar fallbacks used when the quota map has no usable entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDefaults {
    pub free: i64,
    pub paid: i64,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            free: 10,
            paid: 100,
        }
    }
}

/// A subscription is active iff it has an end time strictly after `now`.
pub fn is_subscription_active(until: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(until, Some(until) if until > now)
}

/// Daily allowance for `tier` given its subscription state.
///
/// Subscribers: own tier entry, then `PAID`, then `PLUS`, then `defaults.paid`.
/// Everyone else: own tier entry, then `FREE`, then `defaults.free`.
pub fn compute_daily_limit(
    tier: &str,
    subscription_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    map: &QuotaMap,
    defaults: &QuotaDefaults,
) -> i64 {
    let tier = normalize_tier(tier);
    let limit = if is_subscription_active(subscription_until, now) {
        map.get(&tier)
            .or_else(|| map.get(PAID_BUCKET))
            .or_else(|| map.get(PLUS_TIER))
            .unwrap_or(defaults.paid)
    } else {
        map.get(&tier)
            .or_else(|| map.get(FREE_TIER))
            .unwrap_or(defaults.free)
    };
    limit.max(0)
}
