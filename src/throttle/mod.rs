//! Keep the call rate under an external ceiling and run request batches against it.

pub mod backoff;
pub mod circuit;
pub mod engine;
pub mod error;
pub mod executor;
mod future;
pub mod internal_event;
pub mod layer;
pub mod pool;
pub mod rate_limiter;
pub mod retries;
pub mod service;
pub mod stats;
pub mod tuner;

use bon::Builder;
use serde::{Deserialize, Serialize};

pub use self::{
    backoff::BackoffSettings,
    circuit::CircuitSettings,
    engine::ThrottleEngine,
    error::{CallError, CallOutcome, ConfigError},
    executor::{BatchExecutor, ExecutorSettings, RequestItem, ResultItem},
    layer::ThrottleLayer,
    rate_limiter::RateLimiterSettings,
    retries::{RateLimitRetryPolicy, RetryAction, RetryLogic},
    service::ThrottledService,
    tuner::TunerSettings,
};

/// Settings for every component of a [`ThrottleEngine`].
///
/// Each section falls back to its defaults when omitted, so a configuration file only needs to
/// name what it changes:
///
/// ```rust
/// use batch_throttle::throttle::ThrottleSettings;
///
/// let settings: ThrottleSettings = serde_json::from_str(
///     r#"{ "rate_limiter": { "nominal_max_calls": 20 }, "executor": { "max_retries": 5 } }"#,
/// )
/// .unwrap();
/// assert_eq!(settings.rate_limiter.effective_max_calls(), 16);
/// assert_eq!(settings.executor.max_retries(), 5);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThrottleSettings {
    #[builder(default)]
    pub rate_limiter: RateLimiterSettings,

    /// Backoff schedule and the circuit breaker it fronts.
    #[builder(default)]
    pub backoff: BackoffSettings,

    #[builder(default)]
    pub tuner: TunerSettings,

    #[builder(default)]
    pub executor: ExecutorSettings,
}

impl ThrottleSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limiter.validate()?;
        self.backoff.validate()?;
        self.tuner.validate()?;
        self.executor.validate()
    }
}
