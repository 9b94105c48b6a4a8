//! Versioned, timestamped cache entry envelope.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A stored value together with the schema version and write time.
///
/// Entries are written wholesale on every refresh and never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    /// Cache schema version the entry was written under.
    pub version: String,
    /// Cached payload.
    pub data: T,
    /// Write time as Unix milliseconds.
    pub timestamp: i64,
    /// Per-entry TTL override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl<T> CacheEntry<T> {
    /// Creates an entry without a TTL override.
    #[inline]
    #[must_use]
    pub fn new<V: Into<String>>(version: V, data: T, timestamp: i64) -> Self {
        Self {
            version: version.into(),
            data,
            timestamp,
            ttl_ms: None,
        }
    }

    /// Sets a per-entry TTL that takes precedence over the store default.
    #[inline]
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl_ms = ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Age of the entry at `now_ms`. Entries stamped in the future have
    /// age zero.
    #[inline]
    #[must_use]
    pub fn age(&self, now_ms: i64) -> Duration {
        let elapsed = now_ms.saturating_sub(self.timestamp);
        Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
    }

    /// Effective TTL: the entry override if present, else `default_ttl`.
    #[inline]
    #[must_use]
    pub fn ttl(&self, default_ttl: Duration) -> Duration {
        self.ttl_ms.map_or(default_ttl, Duration::from_millis)
    }

    /// Returns `true` once the entry is older than its effective TTL.
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now_ms: i64, default_ttl: Duration) -> bool {
        self.age(now_ms) > self.ttl(default_ttl)
    }

    /// Returns `true` once the entry is older than `threshold`.
    #[inline]
    #[must_use]
    pub fn is_stale(&self, now_ms: i64, threshold: Duration) -> bool {
        self.age(now_ms) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    #[test]
    fn age_and_expiry() {
        let entry = CacheEntry::new("1", "data", 0);
        let ttl = Duration::from_secs(48 * 3600);
        assert_eq!(entry.age(HOUR_MS), Duration::from_secs(3600));
        assert!(!entry.is_expired(47 * HOUR_MS, ttl));
        assert!(entry.is_expired(49 * HOUR_MS, ttl));
    }

    #[test]
    fn future_timestamps_have_zero_age() {
        let entry = CacheEntry::new("1", 5_u8, 10 * HOUR_MS);
        assert_eq!(entry.age(0), Duration::ZERO);
    }

    #[test]
    fn ttl_override_wins() {
        let entry = CacheEntry::new("1", (), 0).with_ttl(Some(Duration::from_secs(60)));
        assert_eq!(entry.ttl(Duration::from_secs(3600)), Duration::from_secs(60));
        assert!(entry.is_expired(61_000, Duration::from_secs(3600)));
    }

    #[test]
    fn staleness_is_independent_of_ttl() {
        let entry = CacheEntry::new("1", (), 0);
        let stale_after = Duration::from_secs(24 * 3600);
        assert!(!entry.is_stale(23 * HOUR_MS, stale_after));
        assert!(entry.is_stale(25 * HOUR_MS, stale_after));
    }

    #[test]
    fn serde_omits_missing_ttl() {
        let json = serde_json::to_string(&CacheEntry::new("v2", 1_u32, 5)).unwrap();
        assert_eq!(json, r#"{"version":"v2","data":1,"timestamp":5}"#);
        let parsed: CacheEntry<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ttl_ms, None);
    }
}
