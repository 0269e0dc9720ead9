use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Per-item failure classification.
///
/// These never propagate out of [`BatchExecutor::run`](super::executor::BatchExecutor::run);
/// they are captured in each [`ResultItem`](super::executor::ResultItem). On the single-call
/// decorator path they travel boxed inside [`crate::Error`] and are recovered by downcasting.
#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CallError {
    /// The remote call failed for a reason other than rate limiting. Counted, does not abort a batch.
    #[snafu(display("Remote call failed: {}", message))]
    Transient { message: String },

    /// The remote service signalled that the caller exceeded its allowed call rate.
    #[snafu(display("Rate limit exceeded: {}", reason))]
    RateLimited { reason: String },

    /// The call did not complete before its deadline or the run was cancelled.
    #[snafu(display("Call timed out after {:?}", waited))]
    Timeout { waited: Duration },

    /// The circuit breaker is open; the remote call was not attempted.
    #[snafu(display("Circuit open; call rejected without attempting"))]
    CircuitOpen,
}

impl CallError {
    pub const fn outcome(&self) -> CallOutcome {
        match self {
            CallError::Transient { .. } => CallOutcome::Error,
            CallError::RateLimited { .. } => CallOutcome::RateLimited,
            CallError::Timeout { .. } => CallOutcome::Timeout,
            CallError::CircuitOpen => CallOutcome::CircuitOpen,
        }
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, CallError::RateLimited { .. })
    }
}

/// Outcome of a single call, as recorded for statistics and the circuit breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Error,
    RateLimited,
    Timeout,
    CircuitOpen,
}

impl CallOutcome {
    /// Whether this outcome counts against the circuit breaker.
    ///
    /// Circuit rejections are not failures of the remote service and must not keep the breaker open.
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            CallOutcome::Error | CallOutcome::RateLimited | CallOutcome::Timeout
        )
    }
}

/// Invalid settings, reported at construction time.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("nominal_max_calls must be at least 1"))]
    ZeroCallBudget,

    #[snafu(display("per_seconds must be greater than zero"))]
    ZeroWindow,

    #[snafu(display("safety_margin must be in (0, 1], got {}", value))]
    SafetyMargin { value: f64 },

    #[snafu(display("jitter_fraction must be in [0, 1], got {}", value))]
    JitterFraction { value: f64 },

    #[snafu(display("failure_threshold must be at least 1"))]
    ZeroFailureThreshold,

    #[snafu(display("cooldown_multiplier must be at least 1, got {}", value))]
    CooldownMultiplier { value: f64 },

    #[snafu(display(
        "batch size bounds invalid: min {} / initial {} / max {} (need 1 <= min <= initial <= max)",
        min,
        initial,
        max
    ))]
    BatchSizeBounds { min: usize, initial: usize, max: usize },

    #[snafu(display(
        "batch delay bounds invalid: min {:?} / initial {:?} / max {:?}",
        min,
        initial,
        max
    ))]
    BatchDelayBounds {
        min: Duration,
        initial: Duration,
        max: Duration,
    },

    #[snafu(display("target_error_rate must be in (0, 1), got {}", value))]
    TargetErrorRate { value: f64 },

    #[snafu(display(
        "hysteresis band invalid: lower multiplier {} must be below upper multiplier {}",
        lower,
        upper
    ))]
    HysteresisBand { lower: f64, upper: f64 },

    #[snafu(display("{} must be in (0, 1), got {}", name, value))]
    Ratio { name: &'static str, value: f64 },

    #[snafu(display("{} must be at least 1", name))]
    ZeroCount { name: &'static str },

    #[snafu(display("per_batch_timeout must be greater than zero"))]
    ZeroBatchTimeout,
}
