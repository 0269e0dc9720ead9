use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

use crate::registered_event;
use crate::throttle::{circuit::CircuitState, tuner::BatchParameters};

registered_event! {
    RateLimiterAdmission => {
        // Wait time is a histogram: most admissions are immediate, and the tail is what matters.
        wait: Histogram = histogram!("throttle_rate_limiter_wait_seconds"),
        calls: Counter = counter!("throttle_rate_limiter_calls_total"),
    }

    fn emit(&self, waited: Duration) {
        self.wait.record(waited);
        self.calls.increment(1);
        if !waited.is_zero() {
            trace!(
                target: "batch_throttle::rate_limiter",
                waited_ms = waited.as_millis() as u64,
                "Admission delayed"
            );
        }
    }
}

registered_event! {
    RateLimiterErrorRecorded => {
        errors: Counter = counter!("throttle_rate_limiter_errors_total"),
    }

    fn emit(&self, _data: ()) {
        self.errors.increment(1);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CircuitTransitionData {
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown: Duration,
}

registered_event! {
    CircuitTransition => {
        state: Gauge = gauge!("throttle_circuit_state"),
        opens: Counter = counter!("throttle_circuit_opens_total"),
    }

    fn emit(&self, data: CircuitTransitionData) {
        self.state.set(data.to.as_gauge());
        match data.to {
            CircuitState::Open => {
                self.opens.increment(1);
                warn!(
                    target: "batch_throttle::circuit",
                    from = ?data.from,
                    consecutive_failures = data.consecutive_failures,
                    cooldown_ms = data.cooldown.as_millis() as u64,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(target: "batch_throttle::circuit", "Circuit half-open, allowing one trial call");
            }
            CircuitState::Closed => {
                info!(target: "batch_throttle::circuit", from = ?data.from, "Circuit closed");
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffData {
    pub attempt: u32,
    pub delay: Duration,
}

registered_event! {
    BackoffComputed => {
        delay: Histogram = histogram!("throttle_backoff_delay_seconds"),
    }

    fn emit(&self, data: BackoffData) {
        self.delay.record(data.delay);
        debug!(
            target: "batch_throttle::backoff",
            attempt = data.attempt,
            delay_ms = data.delay.as_millis() as u64,
            "Backoff computed"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BatchAdjustmentData {
    pub previous: BatchParameters,
    pub current: BatchParameters,
    pub error_rate: f64,
    pub adjustment_count: u64,
}

registered_event! {
    BatchParametersAdjusted => {
        batch_size: Histogram = histogram!("throttle_tuner_batch_size"),
        batch_delay: Histogram = histogram!("throttle_tuner_batch_delay_seconds"),
        adjustments: Counter = counter!("throttle_tuner_adjustments_total"),
    }

    fn emit(&self, data: BatchAdjustmentData) {
        self.batch_size.record(data.current.batch_size as f64);
        self.batch_delay.record(data.current.batch_delay);
        self.adjustments.increment(1);

        info!(
            target: "batch_throttle::tuner",
            error_rate = data.error_rate,
            previous_batch_size = data.previous.batch_size,
            batch_size = data.current.batch_size,
            previous_batch_delay_ms = data.previous.batch_delay.as_millis() as u64,
            batch_delay_ms = data.current.batch_delay.as_millis() as u64,
            adjustment_count = data.adjustment_count,
            "Batch parameters adjusted"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BatchCompletedData {
    pub batch_index: usize,
    pub batch_size: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub elapsed: Duration,
    pub rate_limited: bool,
}

registered_event! {
    BatchCompleted => {
        elapsed: Histogram = histogram!("throttle_executor_batch_elapsed_seconds"),
        successes: Counter = counter!("throttle_executor_items_succeeded_total"),
        errors: Counter = counter!("throttle_executor_items_failed_total"),
    }

    fn emit(&self, data: BatchCompletedData) {
        self.elapsed.record(data.elapsed);
        self.successes.increment(data.success_count as u64);
        self.errors.increment(data.error_count as u64);

        let throughput = if data.elapsed.is_zero() {
            0.0
        } else {
            (data.success_count + data.error_count) as f64 / data.elapsed.as_secs_f64()
        };
        debug!(
            target: "batch_throttle::executor",
            batch = data.batch_index,
            batch_size = data.batch_size,
            success = data.success_count,
            errors = data.error_count,
            elapsed_ms = data.elapsed.as_millis() as u64,
            throughput,
            rate_limited = data.rate_limited,
            "Batch finished"
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RunRetryData {
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub unresolved: usize,
}

registered_event! {
    RunRetried => {
        retries: Counter = counter!("throttle_executor_run_retries_total"),
    }

    fn emit(&self, data: RunRetryData) {
        self.retries.increment(1);
        warn!(
            target: "batch_throttle::executor",
            attempt = data.attempt,
            max_retries = data.max_retries,
            delay_ms = data.delay.as_millis() as u64,
            unresolved = data.unresolved,
            "Rate limit hit; retrying unresolved items after backoff"
        );
    }
}
