use std::sync::Arc;

use super::{
    ThrottleSettings,
    backoff::BackoffController,
    error::ConfigError,
    executor::BatchExecutor,
    layer::ThrottleLayer,
    pool::WorkerPool,
    rate_limiter::RateLimiter,
    retries::{RateLimitRetryPolicy, RetryLogic},
    stats::EngineStats,
    tuner::BatchTuner,
};

/// The long-lived throttle for one credential.
///
/// Construct once at startup and share it (or the executors and layers it hands out) with every
/// call site; they all draw from the same rate window, circuit breaker, tuner and worker pool.
#[derive(Debug)]
pub struct ThrottleEngine {
    settings: ThrottleSettings,
    limiter: Arc<RateLimiter>,
    backoff: Arc<BackoffController>,
    tuner: Arc<BatchTuner>,
    executor: BatchExecutor,
}

impl ThrottleEngine {
    pub fn new(settings: ThrottleSettings) -> Result<Self, ConfigError> {
        settings.validate()?;

        let limiter = Arc::new(RateLimiter::new(settings.rate_limiter)?);
        let backoff = Arc::new(BackoffController::new(settings.backoff)?);
        let tuner = Arc::new(BatchTuner::new(settings.tuner)?);
        let pool = WorkerPool::new(settings.executor.pool_size())?;
        let executor = BatchExecutor::new(
            settings.executor,
            Arc::clone(&limiter),
            Arc::clone(&backoff),
            Arc::clone(&tuner),
            pool,
        )?;

        info!(
            target: "batch_throttle::executor",
            effective_max_calls = limiter.effective_max_calls(),
            per_ms = settings.rate_limiter.per_seconds().as_millis() as u64,
            pool_size = settings.executor.pool_size(),
            max_retries = settings.executor.max_retries(),
            "Throttle engine ready"
        );

        Ok(Self {
            settings,
            limiter,
            backoff,
            tuner,
            executor,
        })
    }

    pub fn settings(&self) -> &ThrottleSettings {
        &self.settings
    }

    /// A handle onto the shared executor.
    pub fn executor(&self) -> BatchExecutor {
        self.executor.clone()
    }

    /// A decorator for single calls, drawing from the same budget as the executor.
    pub fn layer<L: RetryLogic>(&self, logic: L) -> ThrottleLayer<L> {
        ThrottleLayer::new(Arc::clone(&self.limiter), Arc::clone(&self.backoff), logic)
    }

    /// Retries rate-limited single calls, at most `executor.max_retries` times.
    pub fn retry_policy(&self) -> RateLimitRetryPolicy {
        RateLimitRetryPolicy::new(
            Arc::clone(&self.backoff),
            self.settings.executor.max_retries(),
        )
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn backoff(&self) -> &Arc<BackoffController> {
        &self.backoff
    }

    pub fn tuner(&self) -> &Arc<BatchTuner> {
        &self.tuner
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            rate_limiter: self.limiter.stats(),
            backoff: self.backoff.stats(),
            tuner: self.tuner.stats(),
            executor: self.executor.stats(),
        }
    }

    /// Writes a summary of every component through `tracing`.
    pub fn log_stats(&self) {
        self.limiter.log_stats();

        let EngineStats {
            backoff,
            tuner,
            executor,
            ..
        } = self.stats();
        info!(
            target: "batch_throttle::circuit",
            state = ?backoff.state,
            total_attempts = backoff.total_attempts,
            success_rate = backoff.success_rate,
            circuit_opens = backoff.circuit_opens,
            avg_backoff_ms = backoff.avg_backoff_time.as_millis() as u64,
            "Backoff statistics"
        );
        info!(
            target: "batch_throttle::tuner",
            batch_size = tuner.current_batch_size,
            batch_delay_ms = tuner.current_batch_delay.as_millis() as u64,
            adjustments = tuner.adjustment_count,
            total_batches = tuner.total_batches,
            overall_error_rate = tuner.overall_error_rate,
            "Tuner statistics"
        );
        info!(
            target: "batch_throttle::executor",
            runs = executor.runs,
            items = executor.items,
            passes = executor.passes,
            rate_limit_aborts = executor.rate_limit_aborts,
            timeouts = executor.timeouts,
            exhausted_runs = executor.exhausted_runs,
            "Executor statistics"
        );
    }
}
