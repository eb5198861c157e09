//! Region lookup, and the per-session region recorded at authentication.
//!
//! The authenticator sees the client's real address; the web front-end only
//! sees traffic from inside the tunnel. So the region is resolved when the
//! tunnel is authenticated, parked under `session-geo:<id>` for a few
//! minutes, and picked up by the `/connected` request.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waypost_core::config::GeoConfig;
use waypost_core::session::{SessionId, GEO_PREFIX};

use crate::expiry::ExpiryTimer;
use crate::store::{FragmentStore, StoreError};

/// Region reported for addresses no rule covers.
pub const UNKNOWN_REGION: &str = "None";

pub trait RegionLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> String;
}

/// Dotted-prefix table, e.g. `"10.1."` → `"CA"`. The longest matching
/// prefix wins.
#[derive(Debug, Clone, Default)]
pub struct PrefixRegionTable {
    /// Sorted longest first.
    prefixes: Vec<(String, String)>,
}

impl PrefixRegionTable {
    pub fn from_config(config: &GeoConfig) -> Self {
        let mut prefixes: Vec<(String, String)> = config
            .prefixes
            .iter()
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { prefixes }
    }
}

impl RegionLookup for PrefixRegionTable {
    fn lookup(&self, ip: IpAddr) -> String {
        let text = ip.to_string();
        self.prefixes
            .iter()
            .find(|(prefix, _)| text.starts_with(prefix.as_str()))
            .map(|(_, region)| region.clone())
            .unwrap_or_else(|| UNKNOWN_REGION.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub region: String,
    /// Unix seconds after which the entry is no longer used.
    pub expires_at: u64,
}

/// Seconds an encoded entry has left at `now`. None once it is due, or if
/// it cannot be decoded.
pub(crate) fn remaining_secs(bytes: &[u8], now: u64) -> Option<u64> {
    serde_json::from_slice::<GeoInfo>(bytes)
        .ok()
        .filter(|info| info.expires_at > now)
        .map(|info| info.expires_at - now)
}

/// Session region entries in the fragment store.
#[derive(Clone)]
pub struct SessionGeo {
    store: Arc<dyn FragmentStore>,
    timer: ExpiryTimer,
    ttl: Duration,
}

impl SessionGeo {
    pub fn new(store: Arc<dyn FragmentStore>, timer: ExpiryTimer, ttl: Duration) -> Self {
        Self { store, timer, ttl }
    }

    pub fn put(&self, session_id: &SessionId, region: &str, now: u64) -> Result<(), StoreError> {
        let info = GeoInfo {
            region: region.to_string(),
            expires_at: now + self.ttl.as_secs(),
        };
        let key = session_id.geo_key();
        let bytes = serde_json::to_vec(&info)
            .map_err(|e| StoreError::Unavailable(format!("encode geo entry: {e}")))?;
        self.store.set(&key, bytes)?;
        self.timer.arm(&key, self.ttl);
        Ok(())
    }

    /// The region recorded for a session, if there is one and it is still
    /// fresh. The entry stays in the store until `forget`.
    pub fn region(&self, session_id: &SessionId, now: u64) -> Result<Option<String>, StoreError> {
        let key = session_id.geo_key();
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        match serde_json::from_slice::<GeoInfo>(&bytes) {
            Ok(info) if info.expires_at > now => Ok(Some(info.region)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "ignoring malformed geo entry");
                Ok(None)
            }
        }
    }

    /// Drop a session's region entry once it has been used.
    pub fn forget(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let key = session_id.geo_key();
        self.store.delete(&key)?;
        self.timer.disarm(&key);
        Ok(())
    }

    /// Delete entries past their lifetime. Entries written by another
    /// process have no deadline armed here, so this is what reclaims them
    /// when no `/connected` ever arrives.
    pub fn purge_expired(&self, now: u64) -> Result<usize, StoreError> {
        let mut purged = 0;
        for key in self.store.keys(GEO_PREFIX)? {
            let removed = self
                .store
                .remove_if(&key, &mut |bytes| remaining_secs(bytes, now).is_none())?;
            if removed.is_some() {
                self.timer.disarm(&key);
                purged += 1;
            }
        }
        Ok(purged)
    }
}
