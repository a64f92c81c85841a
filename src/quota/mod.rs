//! Daily quota configuration, resolution and epoch rollover.

pub mod epoch;
pub mod map;
pub mod resolver;

pub use epoch::{next_epoch_boundary, reset_due};
pub use map::{normalize_tier, QuotaMap, QuotaMapStore, QuotaSource};
pub use resolver::{compute_daily_limit, is_subscription_active, QuotaDefaults};
