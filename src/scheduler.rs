//! Refresh scheduler.
//!
//! Refreshes every registered source once a day at a fixed UTC time, on
//! manual request, and after a failed run on a one-shot retry timer.
//! Consecutive failures are capped; once the cap is reached the scheduler
//! stops retrying and waits for the next daily run.

use core::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::CacheService;
use crate::error::AffiliateError;
use crate::models::Catalog;
use crate::source::SourceRegistration;
use crate::storage::CacheStore;

/// Default daily refresh hour (UTC).
const DEFAULT_DAILY_HOUR: u32 = 3;

/// Default delay before retrying a failed run.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3 * 60 * 60);

/// Default number of consecutive failures before retries stop.
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Scheduler timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Wall-clock time of the daily refresh, UTC.
    pub daily_at: NaiveTime,
    /// Delay between a failed run and its retry.
    pub retry_delay: Duration,
    /// Consecutive failures after which retries stop until the next
    /// daily run.
    pub max_consecutive_failures: u32,
}

impl Default for SchedulerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            daily_at: NaiveTime::from_hms_opt(DEFAULT_DAILY_HOUR, 0, 0).unwrap_or_default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// What started a refresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The daily wall-clock time was reached.
    Daily,
    /// The retry timer fired after a failed run.
    Retry,
    /// Requested through a [`SchedulerHandle`].
    Manual,
}

impl core::fmt::Display for Trigger {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match *self {
            Self::Daily => "daily",
            Self::Retry => "retry",
            Self::Manual => "manual",
        })
    }
}

/// Outcome of recording a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry should run after `delay`.
    Scheduled {
        /// Consecutive failures so far.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// The cap was reached; the counter was reset and no retry follows.
    GaveUp,
}

/// Counts consecutive failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTracker {
    /// Consecutive failures.
    consecutive: u32,
    /// Cap.
    max: u32,
    /// Delay before each retry.
    retry_delay: Duration,
}

impl FailureTracker {
    /// Creates a tracker with the given cap and retry delay.
    #[inline]
    #[must_use]
    pub const fn new(max: u32, retry_delay: Duration) -> Self {
        Self {
            consecutive: 0,
            max,
            retry_delay,
        }
    }

    /// Consecutive failures so far.
    #[inline]
    #[must_use]
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Clears the failure count after a successful run.
    #[inline]
    pub const fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Records a failed run and decides whether to retry.
    #[inline]
    pub const fn record_failure(&mut self) -> RetryDecision {
        self.consecutive += 1;
        if self.consecutive >= self.max {
            self.consecutive = 0;
            RetryDecision::GaveUp
        } else {
            RetryDecision::Scheduled {
                attempt: self.consecutive,
                delay: self.retry_delay,
            }
        }
    }
}

/// Cancellable one-shot timer that sends [`Trigger::Retry`] when it
/// fires. Scheduling replaces any pending retry.
#[derive(Debug, Default)]
pub struct RetryTimer {
    /// Sleeping task, if a retry is pending.
    pending: Option<JoinHandle<()>>,
}

impl RetryTimer {
    /// Creates an idle timer.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Sends [`Trigger::Retry`] on `triggers` after `delay`, cancelling
    /// any previously scheduled retry.
    #[inline]
    pub fn schedule(&mut self, delay: Duration, triggers: mpsc::UnboundedSender<Trigger>) {
        self.cancel();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _sent = triggers.send(Trigger::Retry);
        }));
    }

    /// Cancels the pending retry, if any.
    #[inline]
    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    /// Returns `true` while a retry is scheduled and has not fired yet.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for RetryTimer {
    #[inline]
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Result of refreshing every source once.
#[derive(Debug)]
pub struct RefreshReport {
    /// What started the run.
    pub trigger: Trigger,
    /// Keys refreshed successfully.
    pub refreshed: Vec<String>,
    /// Keys that failed, with their error.
    pub failed: Vec<(String, AffiliateError)>,
}

impl RefreshReport {
    /// Returns `true` when every source refreshed.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Sends manual triggers to a running [`RefreshScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    /// Trigger channel.
    triggers: mpsc::UnboundedSender<Trigger>,
}

impl SchedulerHandle {
    /// Requests an immediate refresh. Returns `false` if the scheduler has
    /// stopped.
    #[inline]
    #[must_use]
    pub fn trigger_now(&self) -> bool {
        self.triggers.send(Trigger::Manual).is_ok()
    }
}

/// Time from `now` until the next occurrence of `at` (UTC). When `now`
/// is exactly `at`, the next occurrence is a day later.
#[must_use]
#[inline]
pub fn until_next_daily(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Drives scheduled refreshes of every registered source.
#[derive(Debug)]
pub struct RefreshScheduler<S> {
    /// Catalog cache.
    cache: CacheService<S, Catalog>,
    /// Sources refreshed on every run.
    sources: Vec<SourceRegistration>,
    /// Timing.
    config: SchedulerConfig,
    /// Consecutive failure count.
    failures: FailureTracker,
    /// Pending retry.
    retry: RetryTimer,
    /// Sender side of the trigger channel, handed to handles and the
    /// retry timer.
    trigger_tx: mpsc::UnboundedSender<Trigger>,
    /// Receiver side of the trigger channel.
    trigger_rx: mpsc::UnboundedReceiver<Trigger>,
}

impl<S> RefreshScheduler<S>
where
    S: CacheStore<Catalog> + core::fmt::Debug,
{
    /// Creates a scheduler over `cache` for `sources`.
    #[must_use]
    #[inline]
    pub fn new(
        cache: CacheService<S, Catalog>,
        sources: Vec<SourceRegistration>,
        config: SchedulerConfig,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Self {
            cache,
            sources,
            failures: FailureTracker::new(config.max_consecutive_failures, config.retry_delay),
            config,
            retry: RetryTimer::new(),
            trigger_tx,
            trigger_rx,
        }
    }

    /// Handle for sending manual triggers.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            triggers: self.trigger_tx.clone(),
        }
    }

    /// Consecutive failed runs so far.
    #[inline]
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.failures.consecutive()
    }

    /// Returns `true` while a retry is scheduled.
    #[inline]
    #[must_use]
    pub fn retry_pending(&self) -> bool {
        self.retry.is_pending()
    }

    /// Force-refreshes every source in parallel.
    #[tracing::instrument(skip_all, fields(trigger = %trigger))]
    #[inline]
    pub async fn refresh_all(&self, trigger: Trigger) -> RefreshReport {
        let refreshes = self.sources.iter().map(|registration| {
            let fetch = registration.fetch_fn();
            let key = registration.key().to_owned();
            async move {
                let outcome = self.cache.force_refresh(&key, move || fetch()).await;
                (key, outcome)
            }
        });

        let mut report = RefreshReport {
            trigger,
            refreshed: Vec::new(),
            failed: Vec::new(),
        };
        for (key, outcome) in futures::future::join_all(refreshes).await {
            match outcome {
                Ok(catalog) => {
                    info!(key = %key, merchants = catalog.merchant_count(), "source refreshed");
                    report.refreshed.push(key);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "source refresh failed");
                    report.failed.push((key, err));
                }
            }
        }
        report
    }

    /// Runs one refresh and applies its outcome to the failure counter
    /// and the retry timer.
    #[inline]
    pub async fn run_once(&mut self, trigger: Trigger) -> RefreshReport {
        let report = self.refresh_all(trigger).await;
        if report.is_success() {
            self.failures.reset();
            self.retry.cancel();
            info!(trigger = %trigger, sources = report.refreshed.len(), "refresh run succeeded");
        } else {
            match self.failures.record_failure() {
                RetryDecision::Scheduled { attempt, delay } => {
                    warn!(
                        trigger = %trigger,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "refresh run failed, retry scheduled"
                    );
                    self.retry.schedule(delay, self.trigger_tx.clone());
                }
                RetryDecision::GaveUp => {
                    self.retry.cancel();
                    error!(
                        trigger = %trigger,
                        "refresh failed too many times in a row, waiting for the next daily run"
                    );
                }
            }
        }
        report
    }

    /// Runs until `shutdown` resolves, refreshing on the daily time, on
    /// manual triggers and on retries.
    #[inline]
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = core::pin::pin!(shutdown);
        info!(daily_at = %self.config.daily_at, "refresh scheduler started");
        loop {
            let wait = until_next_daily(Utc::now(), self.config.daily_at);
            let next = tokio::select! {
                () = &mut shutdown => None,
                () = tokio::time::sleep(wait) => Some(Trigger::Daily),
                received = self.trigger_rx.recv() => received,
            };
            let Some(trigger) = next else {
                break;
            };
            let _report = self.run_once(trigger).await;
        }
        self.retry.cancel();
        info!("refresh scheduler stopped");
    }
}
