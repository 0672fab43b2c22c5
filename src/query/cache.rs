//! Short-TTL cache for dashboard aggregates. Purely in-memory: a miss falls
//! through to the aggregation query, and nothing on the cache path can fail
//! a request.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Dashboard responses stay fresh for at most this long.
pub const DASHBOARD_TTL: Duration = Duration::from_secs(30);

struct CacheEntry {
    expires_at: Instant,
    payload: serde_json::Value,
}

pub struct DashboardCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl DashboardCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.payload.clone())
    }

    pub fn set(&self, key: &str, payload: serde_json::Value) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                expires_at: Instant::now() + self.ttl,
                payload,
            },
        );
    }

    /// Drops everything. Called on invalidating writes and the manual
    /// invalidation endpoint.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for DashboardCache {
    fn default() -> Self {
        Self::new(DASHBOARD_TTL)
    }
}
