//! Process-lifetime cache counters.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Number of most recent fetch durations kept per key.
pub const FETCH_DURATION_WINDOW: usize = 10;

/// Snapshot of cache activity since start-up or the last reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Reads answered from a valid cached value.
    pub hits: u64,
    /// Reads that found no valid value and started a fetch.
    pub misses: u64,
    /// Reads answered with a stale value while a refresh ran behind.
    pub stale_serves: u64,
    /// Completed refreshes (forced or background).
    pub refreshes: u64,
    /// Failed upstream fetches.
    pub errors: u64,
    /// Time of the last completed refresh per key.
    pub last_refresh: HashMap<String, DateTime<Utc>>,
    /// Most recent fetch durations per key, oldest first.
    pub fetch_durations: HashMap<String, VecDeque<Duration>>,
}

impl CacheMetrics {
    /// Records a fetch duration for `key`, keeping only the last
    /// [`FETCH_DURATION_WINDOW`] samples.
    #[inline]
    pub fn record_fetch_duration(&mut self, key: &str, duration: Duration) {
        let samples = self.fetch_durations.entry(key.to_owned()).or_default();
        samples.push_back(duration);
        while samples.len() > FETCH_DURATION_WINDOW {
            let _oldest = samples.pop_front();
        }
    }

    /// Mean of the recorded fetch durations for `key`.
    #[inline]
    #[must_use]
    pub fn average_fetch_duration(&self, key: &str) -> Option<Duration> {
        let samples = self.fetch_durations.get(key)?;
        let count = u32::try_from(samples.len()).ok().filter(|count| *count > 0)?;
        let total: Duration = samples.iter().sum();
        Some(total / count)
    }

    /// Fraction of reads answered from cache, stale serves included.
    /// `None` before the first read.
    #[inline]
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        reason = "counters stay far below 2^52 in a process lifetime"
    )]
    pub fn hit_ratio(&self) -> Option<f64> {
        let served = self.hits + self.stale_serves;
        let total = served + self.misses;
        (total > 0).then(|| served as f64 / total as f64)
    }
}
