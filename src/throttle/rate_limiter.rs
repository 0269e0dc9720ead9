//! Sliding-window admission control.
//!
//! The limiter keeps the timestamps of recent admissions covering the trailing `per_seconds`
//! window. A caller is admitted once fewer than `effective_max_calls` timestamps remain in the
//! window (and, optionally, once `min_interval` has passed since the previous admission);
//! otherwise it sleeps until the oldest entry would expire and checks again. It never rejects.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::{
    error::{
        CallError, ConfigError, SafetyMarginSnafu, ZeroCallBudgetSnafu, ZeroWindowSnafu,
    },
    internal_event::{InternalEventHandle, RateLimiterAdmission, RateLimiterErrorRecorded},
};

/// Per-second buckets older than this are pruned from the statistics.
const STATS_RETENTION_SECS: u64 = 3600;

/// Configuration of the sliding-window rate limiter.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `nominal_max_calls` | 15 | Calls the remote service allows per window |
/// | `per_seconds` | 1s | Length of the trailing window |
/// | `safety_margin` | 0.8 | Fraction of the nominal budget actually used |
/// | `min_interval_enabled` | true | Space admissions at least `per_seconds / effective_max_calls` apart |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use batch_throttle::throttle::rate_limiter::RateLimiterSettings;
///
/// let settings = RateLimiterSettings::builder()
///     .nominal_max_calls(10)
///     .per_seconds(Duration::from_secs(1))
///     .safety_margin(0.8)
///     .build();
/// assert_eq!(settings.effective_max_calls(), 8);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterSettings {
    /// The call budget the remote service advertises per window.
    #[builder(default = default_nominal_max_calls())]
    pub(super) nominal_max_calls: u32,

    /// Length of the trailing window the budget applies to.
    #[builder(default = default_per_seconds())]
    pub(super) per_seconds: Duration,

    /// Headroom against clock skew and server-side variance.
    ///
    /// **Range**: 0 < safety_margin <= 1
    #[builder(default = default_safety_margin())]
    pub(super) safety_margin: f64,

    /// Enforce a minimum spacing between admissions even when the window has capacity,
    /// so that a long idle period is not followed by a burst.
    #[builder(default = default_min_interval_enabled())]
    pub(super) min_interval_enabled: bool,
}

const fn default_nominal_max_calls() -> u32 {
    15
}

const fn default_per_seconds() -> Duration {
    Duration::from_secs(1)
}

const fn default_safety_margin() -> f64 {
    0.8
}

const fn default_min_interval_enabled() -> bool {
    true
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            nominal_max_calls: default_nominal_max_calls(),
            per_seconds: default_per_seconds(),
            safety_margin: default_safety_margin(),
            min_interval_enabled: default_min_interval_enabled(),
        }
    }
}

impl RateLimiterSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.nominal_max_calls >= 1, ZeroCallBudgetSnafu);
        ensure!(!self.per_seconds.is_zero(), ZeroWindowSnafu);
        ensure!(
            self.safety_margin > 0.0 && self.safety_margin <= 1.0,
            SafetyMarginSnafu {
                value: self.safety_margin
            }
        );
        Ok(())
    }

    /// `floor(nominal_max_calls * safety_margin)`, never below one.
    pub fn effective_max_calls(&self) -> usize {
        // The epsilon keeps products such as 15 * 0.8 from flooring to 11.
        let effective = (f64::from(self.nominal_max_calls) * self.safety_margin + 1e-9).floor();
        (effective as usize).max(1)
    }

    /// Minimum spacing between admissions, or zero when spacing is disabled.
    pub fn min_interval(&self) -> Duration {
        if self.min_interval_enabled {
            self.per_seconds / self.effective_max_calls() as u32
        } else {
            Duration::ZERO
        }
    }

    pub fn nominal_max_calls(&self) -> u32 {
        self.nominal_max_calls
    }

    pub fn per_seconds(&self) -> Duration {
        self.per_seconds
    }
}

/// Snapshot of the limiter's observability counters.
///
/// None of these feed back into admission.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateLimiterStats {
    /// Admissions per whole second since the limiter was created.
    pub calls_per_second: BTreeMap<u64, u32>,
    pub total_calls: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub max_calls_per_second: u32,
    pub avg_wait_time: Duration,
    pub effective_max_calls: usize,
    /// Whether no one-second bucket exceeded the effective ceiling.
    pub within_limit: bool,
}

#[derive(Debug, Default)]
struct RateWindow {
    timestamps: VecDeque<Instant>,
    last_admitted: Option<Instant>,
}

#[derive(Debug, Default)]
struct CallStats {
    calls_per_second: BTreeMap<u64, u32>,
    total_calls: u64,
    error_count: u64,
    total_wait: Duration,
}

/// Process-wide sliding-window rate limiter.
///
/// Share one instance (behind an `Arc`) between every call site that spends the same credential.
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimiterSettings,
    effective_max_calls: usize,
    min_interval: Duration,
    window: Mutex<RateWindow>,
    stats: Mutex<CallStats>,
    started: Instant,
    admission_event: RateLimiterAdmission,
    error_event: RateLimiterErrorRecorded,
}

impl RateLimiter {
    pub fn new(settings: RateLimiterSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let effective_max_calls = settings.effective_max_calls();

        Ok(Self {
            settings,
            effective_max_calls,
            min_interval: settings.min_interval(),
            window: Mutex::new(RateWindow {
                timestamps: VecDeque::with_capacity(effective_max_calls + 1),
                last_admitted: None,
            }),
            stats: Mutex::new(CallStats::default()),
            started: Instant::now(),
            admission_event: RateLimiterAdmission::register(),
            error_event: RateLimiterErrorRecorded::register(),
        })
    }

    pub fn settings(&self) -> &RateLimiterSettings {
        &self.settings
    }

    pub fn effective_max_calls(&self) -> usize {
        self.effective_max_calls
    }

    /// Waits until one more call can be issued safely, then records it.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let start = Instant::now();
        loop {
            match self.try_admit(Instant::now()) {
                Ok(()) => break,
                Err(retry_at) => sleep_until(retry_at).await,
            }
        }
        self.finish_admission(start)
    }

    /// Like [`acquire`](Self::acquire), but gives up when `token` is cancelled.
    ///
    /// A cancelled wait records nothing in the window and surfaces as [`CallError::Timeout`].
    pub async fn acquire_cancellable(&self, token: &CancellationToken) -> Result<Duration, CallError> {
        let start = Instant::now();
        loop {
            if token.is_cancelled() {
                return Err(CallError::Timeout {
                    waited: start.elapsed(),
                });
            }
            match self.try_admit(Instant::now()) {
                Ok(()) => break,
                Err(retry_at) => {
                    tokio::select! {
                        _ = sleep_until(retry_at) => {}
                        _ = token.cancelled() => {
                            return Err(CallError::Timeout { waited: start.elapsed() });
                        }
                    }
                }
            }
        }
        Ok(self.finish_admission(start))
    }

    /// Counts a failed call for the error-rate statistic.
    pub fn record_error(&self) {
        self.lock_stats().error_count += 1;
        self.error_event.emit(());
    }

    pub fn stats(&self) -> RateLimiterStats {
        let stats = self.lock_stats();
        let max_calls_per_second = stats.calls_per_second.values().copied().max().unwrap_or(0);
        // A one-second bucket can span several windows when the window is shorter than a second.
        let windows_per_second = (1.0 / self.settings.per_seconds.as_secs_f64()).ceil().max(1.0);
        let per_second_ceiling = self.effective_max_calls as f64 * windows_per_second;

        RateLimiterStats {
            calls_per_second: stats.calls_per_second.clone(),
            total_calls: stats.total_calls,
            error_count: stats.error_count,
            error_rate: if stats.total_calls == 0 {
                0.0
            } else {
                stats.error_count as f64 / stats.total_calls as f64
            },
            max_calls_per_second,
            avg_wait_time: if stats.total_calls == 0 {
                Duration::ZERO
            } else {
                stats.total_wait / stats.total_calls.min(u64::from(u32::MAX)) as u32
            },
            effective_max_calls: self.effective_max_calls,
            within_limit: f64::from(max_calls_per_second) <= per_second_ceiling,
        }
    }

    /// Writes the call statistics through `tracing`.
    pub fn log_stats(&self) {
        let stats = self.stats();
        if stats.total_calls == 0 {
            info!(target: "batch_throttle::rate_limiter", "No calls recorded");
            return;
        }

        for (second, count) in &stats.calls_per_second {
            debug!(target: "batch_throttle::rate_limiter", second, calls = count, "Calls per second");
        }
        info!(
            target: "batch_throttle::rate_limiter",
            total_calls = stats.total_calls,
            error_count = stats.error_count,
            error_rate = stats.error_rate,
            max_calls_per_second = stats.max_calls_per_second,
            effective_max_calls = stats.effective_max_calls,
            avg_wait_ms = stats.avg_wait_time.as_millis() as u64,
            within_limit = stats.within_limit,
            "Rate limiter statistics"
        );
    }

    /// Admits and records one call at `now`, or returns the instant worth re-checking at.
    fn try_admit(&self, now: Instant) -> Result<(), Instant> {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let per = self.settings.per_seconds;

        while let Some(&oldest) = window.timestamps.front() {
            if oldest + per <= now {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }

        if window.timestamps.len() >= self.effective_max_calls {
            if let Some(&oldest) = window.timestamps.front() {
                return Err(oldest + per);
            }
        }

        if let Some(last) = window.last_admitted {
            let earliest = last + self.min_interval;
            if earliest > now {
                return Err(earliest);
            }
        }

        window.timestamps.push_back(now);
        window.last_admitted = Some(now);
        Ok(())
    }

    fn finish_admission(&self, start: Instant) -> Duration {
        let now = Instant::now();
        let waited = now.duration_since(start);
        let second = now.duration_since(self.started).as_secs();

        {
            let mut stats = self.lock_stats();
            *stats.calls_per_second.entry(second).or_insert(0) += 1;
            stats.total_calls += 1;
            stats.total_wait += waited;

            if let Some(cutoff) = second.checked_sub(STATS_RETENTION_SECS) {
                stats.calls_per_second = stats.calls_per_second.split_off(&cutoff);
            }
        }

        self.admission_event.emit(waited);
        waited
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, CallStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time;

    use super::*;
    use crate::test_utils::trace_init;

    fn limiter(max_calls: u32, margin: f64, min_interval: bool) -> RateLimiter {
        RateLimiter::new(
            RateLimiterSettings::builder()
                .nominal_max_calls(max_calls)
                .per_seconds(Duration::from_secs(1))
                .safety_margin(margin)
                .min_interval_enabled(min_interval)
                .build(),
        )
        .unwrap()
    }

    fn assert_window_ceiling(mut admitted: Vec<Instant>, per: Duration, ceiling: usize) {
        admitted.sort();
        for (i, &end) in admitted.iter().enumerate() {
            let in_window = admitted[..=i]
                .iter()
                .filter(|&&t| t + per > end)
                .count();
            assert!(
                in_window <= ceiling,
                "{} calls inside the window ending at call {}, ceiling {}",
                in_window,
                i,
                ceiling
            );
        }
    }

    #[test]
    fn effective_ceiling_applies_safety_margin() {
        let settings = RateLimiterSettings::builder()
            .nominal_max_calls(10)
            .safety_margin(0.8)
            .build();
        assert_eq!(settings.effective_max_calls(), 8);

        assert_eq!(RateLimiterSettings::default().effective_max_calls(), 12);

        let tiny = RateLimiterSettings::builder()
            .nominal_max_calls(1)
            .safety_margin(0.1)
            .build();
        assert_eq!(tiny.effective_max_calls(), 1);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let zero = RateLimiterSettings::builder().nominal_max_calls(0).build();
        assert!(matches!(RateLimiter::new(zero), Err(ConfigError::ZeroCallBudget)));

        let margin = RateLimiterSettings::builder().safety_margin(1.5).build();
        assert!(matches!(
            RateLimiter::new(margin),
            Err(ConfigError::SafetyMargin { .. })
        ));

        let window = RateLimiterSettings::builder()
            .per_seconds(Duration::ZERO)
            .build();
        assert!(matches!(RateLimiter::new(window), Err(ConfigError::ZeroWindow)));
    }

    #[test]
    fn partial_settings_deserialize_over_defaults() {
        let settings: RateLimiterSettings =
            serde_json::from_str(r#"{ "nominal_max_calls": 20 }"#).unwrap();
        assert_eq!(settings.nominal_max_calls(), 20);
        assert_eq!(settings.per_seconds(), Duration::from_secs(1));
        assert_eq!(settings.effective_max_calls(), 16);
    }

    #[tokio::test]
    async fn sequential_acquires_respect_effective_ceiling() {
        trace_init();
        time::pause();

        let limiter = limiter(10, 0.8, true);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();

        // 20 calls at 8 per second.
        assert!(elapsed >= Duration::from_secs_f64(20.0 / 8.0 - 1.0), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_secs_f64(20.0 / 8.0 + 1.0), "{:?}", elapsed);
        assert_eq!(limiter.stats().total_calls, 20);
    }

    #[tokio::test]
    async fn window_alone_admits_bursts_up_to_ceiling() {
        time::pause();

        let limiter = limiter(10, 0.8, false);
        let start = Instant::now();
        for _ in 0..8 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The ninth call has to wait for the first one to leave the window.
        let waited = limiter.acquire().await;
        assert!(waited >= Duration::from_secs(1), "{:?}", waited);
        assert!(waited <= Duration::from_millis(1010), "{:?}", waited);
    }

    #[tokio::test]
    async fn concurrent_callers_never_exceed_ceiling() {
        time::pause();

        let limiter = Arc::new(limiter(10, 0.8, false));
        let admitted = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                for _ in 0..9 {
                    limiter.acquire().await;
                    admitted.lock().unwrap().push(Instant::now());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let admitted = admitted.lock().unwrap().clone();
        assert_eq!(admitted.len(), 45);
        assert_window_ceiling(admitted, Duration::from_secs(1), 8);
        assert!(limiter.stats().within_limit);
    }

    #[tokio::test]
    async fn min_interval_spaces_admissions_after_idle() {
        time::pause();

        let limiter = limiter(10, 0.8, true);
        limiter.acquire().await;
        time::advance(Duration::from_secs(30)).await;

        let first = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(Instant::now() - first >= Duration::from_millis(125));
    }

    #[tokio::test]
    async fn cancelled_wait_surfaces_as_timeout_and_records_nothing() {
        time::pause();

        let limiter = limiter(2, 1.0, false);
        limiter.acquire().await;
        limiter.acquire().await;

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = limiter.acquire_cancellable(&token).await;
        assert!(matches!(result, Err(CallError::Timeout { .. })));
        assert_eq!(limiter.stats().total_calls, 2);
    }

    #[tokio::test]
    async fn errors_feed_statistics_only() {
        time::pause();

        let limiter = limiter(10, 1.0, false);
        for _ in 0..4 {
            limiter.acquire().await;
        }
        limiter.record_error();

        let stats = limiter.stats();
        assert_eq!(stats.total_calls, 4);
        assert_eq!(stats.error_count, 1);
        assert!((stats.error_rate - 0.25).abs() < f64::EPSILON);
        assert_eq!(stats.max_calls_per_second, 4);

        // Errors do not consume admission capacity.
        for _ in 0..6 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }
}
