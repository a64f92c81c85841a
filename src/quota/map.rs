//! Tier → daily allowance map with layered precedence.
//!
//! Resolution order:
//! 1. runtime override stored in `kv` under `(global, limits:daily_map)`
//! 2. static map from configuration
//! 3. `{FREE: free, PLUS: paid, PREMIUM: paid}` built from the scalar defaults
//!
//! A malformed layer is skipped with a warning. Serving keeps going on the
//! next layer rather than failing the user's request.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::resolver::QuotaDefaults;
use crate::clock::Clock;
use crate::config::QuotaConfig;
use crate::error::Result;
use crate::store::{KvEntry, Store};

pub const FREE_TIER: &str = "FREE";
pub const PLUS_TIER: &str = "PLUS";
pub const PREMIUM_TIER: &str = "PREMIUM";

/// `kv` owner for process-wide values.
pub const GLOBAL_OWNER: &str = "global";
/// `kv` key of the runtime quota-map override.
pub const QUOTA_MAP_KEY: &str = "limits:daily_map";

/// Canonical form of a tier name: trimmed, uppercase, `FREE` when empty.
pub fn normalize_tier(tier: &str) -> String {
    let t = tier.trim();
    if t.is_empty() {
        FREE_TIER.to_string()
    } else {
        t.to_ascii_uppercase()
    }
}

/// Validated tier → allowance mapping. Keys are uppercase, values non-negative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaMap(BTreeMap<String, i64>);

impl QuotaMap {
    /// Build from raw pairs; `None` if any key is blank or any value negative.
    pub fn from_pairs<I>(pairs: I) -> Option<Self>
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let mut out = BTreeMap::new();
        for (key, value) in pairs {
            let key = key.trim();
            if key.is_empty() || value < 0 {
                return None;
            }
            out.insert(key.to_ascii_uppercase(), value);
        }
        Some(Self(out))
    }

    /// Accept only a JSON object whose values are all non-negative integers.
    pub fn from_json_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut pairs = Vec::with_capacity(obj.len());
        for (k, v) in obj {
            pairs.push((k.clone(), v.as_i64()?));
        }
        Self::from_pairs(pairs)
    }

    pub fn from_json_str(raw: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        Self::from_json_value(&value)
    }

    /// Layer 3: two-bucket map built from scalar defaults.
    pub fn fallback(defaults: &QuotaDefaults) -> Self {
        let mut m = BTreeMap::new();
        m.insert(FREE_TIER.to_string(), defaults.free);
        m.insert(PLUS_TIER.to_string(), defaults.paid);
        m.insert(PREMIUM_TIER.to_string(), defaults.paid);
        Self(m)
    }

    /// Lookup by already-normalised tier name.
    pub fn get(&self, tier: &str) -> Option<i64> {
        self.0.get(tier).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Which layer produced a resolved map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaSource {
    Override,
    Static,
    Fallback,
}

impl QuotaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaSource::Override => "override",
            QuotaSource::Static => "static",
            QuotaSource::Fallback => "fallback",
        }
    }
}

/// Reads and writes the quota map. Holds no map state of its own; every
/// resolution goes to the store so all processes see the latest override.
#[derive(Clone)]
pub struct QuotaMapStore {
    store: Store,
    clock: Arc<dyn Clock>,
    defaults: QuotaDefaults,
    static_map: Option<QuotaMap>,
}

impl std::fmt::Debug for QuotaMapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaMapStore")
            .field("defaults", &self.defaults)
            .field("static_map", &self.static_map)
            .finish()
    }
}

impl QuotaMapStore {
    pub fn new(store: Store, clock: Arc<dyn Clock>, config: &QuotaConfig) -> Self {
        let static_map = config.daily_map.as_ref().and_then(|raw| {
            let parsed = QuotaMap::from_json_value(raw);
            if parsed.is_none() {
                warn!("configured quota.daily_map is malformed; using scalar defaults");
            }
            parsed
        });
        Self {
            store,
            clock,
            defaults: QuotaDefaults {
                free: config.free_daily_limit,
                paid: config.paid_daily_limit,
            },
            static_map,
        }
    }

    pub fn defaults(&self) -> &QuotaDefaults {
        &self.defaults
    }

    /// The effective tier map.
    pub async fn get_quota_map(&self) -> Result<QuotaMap> {
        Ok(self.resolve().await?.0)
    }

    /// The effective tier map and the layer it came from.
    pub async fn resolve(&self) -> Result<(QuotaMap, QuotaSource)> {
        if let Some(entry) = self.override_record().await? {
            match entry.value.as_deref().and_then(QuotaMap::from_json_str) {
                Some(map) => return Ok((map, QuotaSource::Override)),
                None => warn!(
                    version = entry.version,
                    "runtime quota map override is malformed; falling through"
                ),
            }
        }
        if let Some(map) = &self.static_map {
            return Ok((map.clone(), QuotaSource::Static));
        }
        Ok((QuotaMap::fallback(&self.defaults), QuotaSource::Fallback))
    }

    /// Raw override row, if one has been written.
    pub async fn override_record(&self) -> Result<Option<KvEntry>> {
        self.store.kv_get(GLOBAL_OWNER, QUOTA_MAP_KEY).await
    }

    /// Replace the runtime override. Keys are uppercased.
    ///
    /// Returns `false` without writing if any key is blank or any value negative.
    pub async fn set_quota_map<I>(&self, pairs: I) -> Result<bool>
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let Some(map) = QuotaMap::from_pairs(pairs) else {
            warn!("rejected quota map with blank tier or negative allowance");
            return Ok(false);
        };
        self.write_override(&map).await?;
        Ok(true)
    }

    /// Replace the runtime override from raw JSON (admin entry point).
    pub async fn set_quota_map_json(&self, raw: &str) -> Result<bool> {
        let Some(map) = QuotaMap::from_json_str(raw) else {
            warn!("rejected quota map: not a JSON object of non-negative integers");
            return Ok(false);
        };
        self.write_override(&map).await?;
        Ok(true)
    }

    /// Drop the runtime override. Returns whether one existed.
    pub async fn clear_quota_map(&self) -> Result<bool> {
        let removed = self.store.kv_delete(GLOBAL_OWNER, QUOTA_MAP_KEY).await?;
        if removed {
            info!("runtime quota map override cleared");
        }
        Ok(removed)
    }

    async fn write_override(&self, map: &QuotaMap) -> Result<()> {
        let version = self
            .store
            .kv_set(GLOBAL_OWNER, QUOTA_MAP_KEY, &map.to_json(), self.clock.now())
            .await?;
        info!(version, map = %map.to_json(), "runtime quota map override updated");
        Ok(())
    }
}
