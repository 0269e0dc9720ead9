//! Exponential backoff with jitter, fronting the circuit breaker.
//!
//! `BackoffController` is the single object callers consult about failures: whether a call may
//! be attempted at all ([`CircuitBreaker`]), how to record its outcome, and how long to wait
//! before retrying a rate-limited operation.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::{
    circuit::{CircuitBreaker, CircuitSettings, CircuitState},
    error::{ConfigError, JitterFractionSnafu},
    internal_event::{BackoffComputed, BackoffData, InternalEventHandle},
};

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Proportional jitter.
    ///
    /// A random delay of up to `jitter_fraction` of the computed delay is added on top of it, so
    /// the delay never drops below the exponential schedule.
    #[default]
    Proportional,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the backoff
    /// strategy.
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffSettings {
    /// Delay before the first retry; doubled for every further attempt.
    #[builder(default = default_base_delay())]
    pub(super) base_delay: Duration,

    /// Cap on the exponential delay, applied before jitter.
    #[builder(default = default_max_delay())]
    pub(super) max_delay: Duration,

    /// Fraction of the computed delay used as the jitter range.
    ///
    /// **Range**: 0 <= jitter_fraction <= 1
    #[builder(default = default_jitter_fraction())]
    pub(super) jitter_fraction: f64,

    #[builder(default)]
    pub(super) jitter_mode: JitterMode,

    #[builder(default)]
    pub(super) circuit: CircuitSettings,
}

const fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(32)
}

const fn default_jitter_fraction() -> f64 {
    0.1
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter_fraction: default_jitter_fraction(),
            jitter_mode: JitterMode::default(),
            circuit: CircuitSettings::default(),
        }
    }
}

impl BackoffSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            (0.0..=1.0).contains(&self.jitter_fraction),
            JitterFractionSnafu {
                value: self.jitter_fraction
            }
        );
        self.circuit.validate()
    }

    pub fn circuit(&self) -> &CircuitSettings {
        &self.circuit
    }

    /// `min(base_delay * 2^attempt, max_delay)`, before jitter.
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(62) as i32);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackoffStats {
    pub state: CircuitState,
    pub total_attempts: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub circuit_opens: u64,
    pub avg_backoff_time: Duration,
}

#[derive(Debug)]
pub struct BackoffController {
    settings: BackoffSettings,
    breaker: CircuitBreaker,
    total_attempts: AtomicU64,
    total_failures: AtomicU64,
    backoffs: AtomicU64,
    total_backoff_nanos: AtomicU64,
    backoff_event: BackoffComputed,
}

impl BackoffController {
    pub fn new(settings: BackoffSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            breaker: CircuitBreaker::new(settings.circuit)?,
            settings,
            total_attempts: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            backoffs: AtomicU64::new(0),
            total_backoff_nanos: AtomicU64::new(0),
            backoff_event: BackoffComputed::register(),
        })
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// See [`CircuitBreaker::should_attempt`].
    pub fn should_attempt(&self) -> bool {
        self.breaker.should_attempt()
    }

    /// See [`CircuitBreaker::is_rejecting`].
    pub fn is_rejecting(&self) -> bool {
        self.breaker.is_rejecting()
    }

    pub fn record_outcome(&self, success: bool) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.breaker.record_outcome(success);
    }

    /// Delay to sleep before retry number `attempt` (zero-based), and a human-readable reason.
    pub fn next_backoff(&self, attempt: u32) -> (Duration, Cow<'static, str>) {
        let base = self.settings.exponential_delay(attempt);
        let delay = self.apply_jitter(base);

        self.backoffs.fetch_add(1, Ordering::Relaxed);
        self.total_backoff_nanos
            .fetch_add(delay.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
        self.backoff_event.emit(BackoffData { attempt, delay });

        let reason = match self.settings.jitter_mode {
            JitterMode::None => format!("exponential backoff, attempt {}: {:?}", attempt + 1, base),
            _ => format!(
                "exponential backoff, attempt {}: {:?} jittered to {:?}",
                attempt + 1,
                base,
                delay
            ),
        };
        (delay, Cow::Owned(reason))
    }

    pub fn stats(&self) -> BackoffStats {
        let total_attempts = self.total_attempts.load(Ordering::Relaxed);
        let total_failures = self.total_failures.load(Ordering::Relaxed);
        let backoffs = self.backoffs.load(Ordering::Relaxed);
        let total_backoff = Duration::from_nanos(self.total_backoff_nanos.load(Ordering::Relaxed));

        BackoffStats {
            state: self.breaker.state(),
            total_attempts,
            total_failures,
            success_rate: if total_attempts == 0 {
                1.0
            } else {
                (total_attempts - total_failures) as f64 / total_attempts as f64
            },
            circuit_opens: self.breaker.circuit_opens(),
            avg_backoff_time: if backoffs == 0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(total_backoff.as_secs_f64() / backoffs as f64)
            },
        }
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        match self.settings.jitter_mode {
            JitterMode::None => base,
            JitterMode::Proportional => {
                base.saturating_add(scaled(
                    base,
                    rand::random::<f64>() * self.settings.jitter_fraction,
                ))
            }
            JitterMode::Full => {
                if base.is_zero() {
                    return Duration::ZERO;
                }
                scaled(base, rand::random::<f64>())
            }
        }
    }
}

/// `base * factor`, saturating instead of panicking on overflow.
fn scaled(base: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(mode: JitterMode) -> BackoffController {
        BackoffController::new(
            BackoffSettings::builder()
                .base_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(10))
                .jitter_fraction(0.5)
                .jitter_mode(mode)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn backoff_grows_to_max() {
        let controller = controller(JitterMode::None);
        let delays: Vec<u64> = (0..6)
            .map(|attempt| controller.next_backoff(attempt).0.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);

        // Large attempt numbers saturate instead of overflowing.
        assert_eq!(controller.next_backoff(500).0, Duration::from_secs(10));
    }

    #[test]
    fn unbounded_schedule_saturates() {
        for mode in [JitterMode::None, JitterMode::Proportional, JitterMode::Full] {
            let controller = BackoffController::new(
                BackoffSettings::builder()
                    .base_delay(Duration::from_secs(u64::MAX / 4))
                    .max_delay(Duration::MAX)
                    .jitter_fraction(1.0)
                    .jitter_mode(mode)
                    .build(),
            )
            .unwrap();

            assert_eq!(controller.settings().exponential_delay(40), Duration::MAX);
            assert!(controller.next_backoff(40).0 <= Duration::MAX);
        }
    }

    #[test]
    fn proportional_jitter_stays_in_band() {
        let controller = controller(JitterMode::Proportional);
        for attempt in 0..8 {
            let base = controller.settings().exponential_delay(attempt);
            let (delay, reason) = controller.next_backoff(attempt);
            assert!(
                delay >= base && delay <= base.mul_f64(1.5),
                "attempt {}: {:?} outside [{:?}, {:?}]",
                attempt,
                delay,
                base,
                base.mul_f64(1.5)
            );
            assert!(reason.contains("exponential backoff"));
        }
    }

    #[test]
    fn full_jitter_never_exceeds_schedule() {
        let controller = controller(JitterMode::Full);
        for attempt in 0..8 {
            let base = controller.settings().exponential_delay(attempt);
            assert!(controller.next_backoff(attempt).0 <= base);
        }
    }

    #[test]
    fn stats_track_attempts_and_backoff() {
        let controller = controller(JitterMode::None);
        controller.record_outcome(true);
        controller.record_outcome(true);
        controller.record_outcome(true);
        controller.record_outcome(false);
        controller.next_backoff(0);
        controller.next_backoff(1);

        let stats = controller.stats();
        assert_eq!(stats.total_attempts, 4);
        assert_eq!(stats.total_failures, 1);
        assert!((stats.success_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(stats.avg_backoff_time, Duration::from_millis(1500));
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.circuit_opens, 0);
    }

    #[test]
    fn failures_open_the_shared_circuit() {
        let controller = BackoffController::new(
            BackoffSettings::builder()
                .circuit(CircuitSettings::builder().failure_threshold(2).build())
                .build(),
        )
        .unwrap();

        assert!(controller.should_attempt());
        controller.record_outcome(false);
        controller.record_outcome(false);
        assert!(!controller.should_attempt());
        assert_eq!(controller.stats().circuit_opens, 1);
    }

    #[test]
    fn jitter_fraction_is_validated() {
        let settings = BackoffSettings::builder().jitter_fraction(1.5).build();
        assert!(matches!(
            BackoffController::new(settings),
            Err(ConfigError::JitterFraction { .. })
        ));
    }
}
