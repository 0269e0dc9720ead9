//! Concurrent batch dispatch and collection.
//!
//! # Run state machine
//! ```text
//! Running ──(all batches done)──────────────────────────────► Done
//!    │
//!    └──(rate limited)──► RateLimitAbort ──(attempt < max)──► backoff sleep ──► Running
//!                              │
//!                              └──(retries exhausted)──────► Done (unresolved → RateLimited)
//!
//! any state ──(cancelled)──► Cancelled ──► Done (unresolved → Timeout)
//! ```
//!
//! Every pass works through the items that are still unresolved, in input order, so a restart
//! resumes at the first unresolved item instead of re-sending completed work.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio::{
    task::JoinSet,
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use super::{
    backoff::BackoffController,
    error::{CallError, CallOutcome, ConfigError, ZeroBatchTimeoutSnafu, ZeroCountSnafu},
    internal_event::{
        BatchCompleted, BatchCompletedData, InternalEventHandle, RunRetried, RunRetryData,
    },
    pool::WorkerPool,
    rate_limiter::RateLimiter,
    retries::{RetryLogic, classify},
    stats::{ExecutorCounters, ExecutorStats, RunSummary},
    tuner::{BatchOutcome, BatchTuner},
};
use crate::Error;

/// One logical request: an opaque identity and the payload handed to the remote service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestItem<K, P> {
    pub key: K,
    pub payload: P,
}

impl<K, P> RequestItem<K, P> {
    pub fn new(key: K, payload: P) -> Self {
        Self { key, payload }
    }
}

/// The outcome for one [`RequestItem`], at the same position as its input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultItem<K, R> {
    pub key: K,
    pub outcome: Result<R, CallError>,
}

impl<K, R> ResultItem<K, R> {
    pub fn new(key: K, outcome: Result<R, CallError>) -> Self {
        Self { key, outcome }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn call_outcome(&self) -> CallOutcome {
        match &self.outcome {
            Ok(_) => CallOutcome::Success,
            Err(error) => error.outcome(),
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        self.outcome.as_ref().err()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Whole-run restarts allowed after a rate-limit abort.
    #[builder(default = default_max_retries())]
    pub(super) max_retries: u32,

    /// Deadline for collecting one batch, measured from its start.
    #[builder(default = default_per_batch_timeout())]
    pub(super) per_batch_timeout: Duration,

    /// Worker slots shared by every run of the owning engine.
    #[builder(default = default_pool_size())]
    pub(super) pool_size: usize,

    /// Completions between progress events inside a batch.
    #[builder(default = default_progress_interval())]
    pub(super) progress_interval: usize,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_per_batch_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_pool_size() -> usize {
    3
}

const fn default_progress_interval() -> usize {
    10
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            per_batch_timeout: default_per_batch_timeout(),
            pool_size: default_pool_size(),
            progress_interval: default_progress_interval(),
        }
    }
}

impl ExecutorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.per_batch_timeout.is_zero(), ZeroBatchTimeoutSnafu);
        ensure!(self.pool_size >= 1, ZeroCountSnafu { name: "pool_size" });
        ensure!(
            self.progress_interval >= 1,
            ZeroCountSnafu {
                name: "progress_interval"
            }
        );
        Ok(())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn per_batch_timeout(&self) -> Duration {
        self.per_batch_timeout
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Running,
    RateLimitAbort,
    Cancelled,
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BatchEnd {
    Completed,
    RateLimited,
    Cancelled,
}

/// What a worker reports back for its item.
enum Attempt<R> {
    /// Stopped before the remote call (batch aborted while waiting for admission).
    NotStarted,
    Finished(Result<R, CallError>),
}

/// Records a failed outcome if the call is dropped before completing, e.g. when its task is
/// aborted at the batch deadline. Keeps a half-open trial from being held forever.
struct OutcomeGuard<'a> {
    backoff: &'a BackoffController,
    armed: bool,
}

impl OutcomeGuard<'_> {
    fn record(mut self, success: bool) {
        self.armed = false;
        self.backoff.record_outcome(success);
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.backoff.record_outcome(false);
        }
    }
}

struct Worker<L> {
    limiter: Arc<RateLimiter>,
    backoff: Arc<BackoffController>,
    logic: L,
    token: CancellationToken,
}

impl<L: RetryLogic> Worker<L> {
    async fn attempt<S, P>(self, mut remote: S, payload: P) -> Attempt<L::Response>
    where
        S: Service<P, Response = L::Response>,
        S::Error: Into<Error>,
    {
        // An open circuit rejects without touching the shared rate window.
        if self.backoff.is_rejecting() {
            return Attempt::Finished(Err(CallError::CircuitOpen));
        }

        if self.limiter.acquire_cancellable(&self.token).await.is_err() || self.token.is_cancelled() {
            return Attempt::NotStarted;
        }

        // The circuit may have opened while this item waited for admission.
        if !self.backoff.should_attempt() {
            return Attempt::Finished(Err(CallError::CircuitOpen));
        }

        let guard = OutcomeGuard {
            backoff: &self.backoff,
            armed: true,
        };
        let outcome = match remote.ready().await {
            Ok(service) => {
                let result = service.call(payload).await;
                classify(&self.logic, result)
            }
            Err(error) => classify(&self.logic, Err(error)),
        };

        guard.record(outcome.is_ok());
        if outcome.is_err() {
            self.limiter.record_error();
        }
        Attempt::Finished(outcome)
    }
}

struct BatchReport {
    outcome: BatchOutcome,
    end: BatchEnd,
}

/// Dispatches ordered request collections through the shared throttle.
///
/// Cheap to clone; clones share the rate limiter, backoff controller, tuner, worker pool and
/// statistics, so concurrent runs are throttled against one budget.
#[derive(Clone, Debug)]
pub struct BatchExecutor {
    settings: ExecutorSettings,
    limiter: Arc<RateLimiter>,
    backoff: Arc<BackoffController>,
    tuner: Arc<BatchTuner>,
    pool: WorkerPool,
    counters: Arc<ExecutorCounters>,
    batch_event: BatchCompleted,
    retry_event: RunRetried,
}

impl BatchExecutor {
    pub fn new(
        settings: ExecutorSettings,
        limiter: Arc<RateLimiter>,
        backoff: Arc<BackoffController>,
        tuner: Arc<BatchTuner>,
        pool: WorkerPool,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            settings,
            limiter,
            backoff,
            tuner,
            pool,
            counters: Arc::new(ExecutorCounters::default()),
            batch_event: BatchCompleted::register(),
            retry_event: RunRetried::register(),
        })
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    /// Runs every item through `remote`, returning one result per item in input order.
    ///
    /// Per-item failures never escape; they are captured in each [`ResultItem`].
    pub async fn run<S, L, K, P>(
        &self,
        remote: S,
        logic: L,
        items: Vec<RequestItem<K, P>>,
    ) -> Vec<ResultItem<K, L::Response>>
    where
        S: Service<P, Response = L::Response> + Clone + Send + 'static,
        S::Error: Into<Error> + Send,
        S::Future: Send,
        L: RetryLogic,
        L::Response: Send + 'static,
        P: Clone + Send + 'static,
    {
        self.run_with_cancel(remote, logic, items, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but stops early once `cancel` fires; items left unresolved are
    /// returned as [`CallError::Timeout`].
    pub async fn run_with_cancel<S, L, K, P>(
        &self,
        remote: S,
        logic: L,
        items: Vec<RequestItem<K, P>>,
        cancel: CancellationToken,
    ) -> Vec<ResultItem<K, L::Response>>
    where
        S: Service<P, Response = L::Response> + Clone + Send + 'static,
        S::Error: Into<Error> + Send,
        S::Future: Send,
        L: RetryLogic,
        L::Response: Send + 'static,
        P: Clone + Send + 'static,
    {
        let started = Instant::now();
        self.counters.run_started(items.len());

        let mut slots: Vec<Option<Result<L::Response, CallError>>> =
            items.iter().map(|_| None).collect();
        let mut batch_index = 0;
        let mut attempt = 0;
        let mut state = RunState::Running;

        debug!(
            target: "batch_throttle::executor",
            items = items.len(),
            max_retries = self.settings.max_retries,
            "Run started"
        );

        loop {
            state = match state {
                RunState::Running => {
                    self.counters.pass_started();
                    self.run_pass(&remote, &logic, &items, &mut slots, &cancel, &mut batch_index)
                        .await
                }
                RunState::RateLimitAbort => {
                    self.counters.rate_limit_abort();
                    let unresolved = slots.iter().filter(|slot| slot.is_none()).count();

                    if attempt >= self.settings.max_retries {
                        error!(
                            target: "batch_throttle::executor",
                            max_retries = self.settings.max_retries,
                            unresolved,
                            "Rate limit retries exhausted; returning partial results"
                        );
                        self.counters.exhausted();
                        fill_unresolved(&mut slots, || CallError::RateLimited {
                            reason: format!(
                                "rate limit persisted after {} retries",
                                self.settings.max_retries
                            ),
                        });
                        RunState::Done
                    } else {
                        let (delay, _reason) = self.backoff.next_backoff(attempt);
                        attempt += 1;
                        self.retry_event.emit(RunRetryData {
                            attempt,
                            max_retries: self.settings.max_retries,
                            delay,
                            unresolved,
                        });
                        tokio::select! {
                            _ = cancel.cancelled() => RunState::Cancelled,
                            _ = sleep(delay) => RunState::Running,
                        }
                    }
                }
                RunState::Cancelled => {
                    let waited = started.elapsed();
                    let unresolved = fill_unresolved(&mut slots, || CallError::Timeout { waited });
                    self.counters.timed_out(unresolved);
                    warn!(
                        target: "batch_throttle::executor",
                        unresolved,
                        "Run cancelled; unresolved items reported as timeouts"
                    );
                    RunState::Done
                }
                RunState::Done => break,
            };
        }

        let results: Vec<_> = items
            .into_iter()
            .zip(slots)
            .map(|(item, slot)| {
                let outcome = slot.unwrap_or_else(|| {
                    Err(CallError::Timeout {
                        waited: started.elapsed(),
                    })
                });
                ResultItem::new(item.key, outcome)
            })
            .collect();

        let summary = RunSummary::from_results(&results);
        info!(
            target: "batch_throttle::executor",
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            outcomes = ?summary.outcomes,
            retries = attempt,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );
        results
    }

    /// One pass over the unresolved items, batch by batch.
    async fn run_pass<S, L, K, P>(
        &self,
        remote: &S,
        logic: &L,
        items: &[RequestItem<K, P>],
        slots: &mut [Option<Result<L::Response, CallError>>],
        cancel: &CancellationToken,
        batch_index: &mut usize,
    ) -> RunState
    where
        S: Service<P, Response = L::Response> + Clone + Send + 'static,
        S::Error: Into<Error> + Send,
        S::Future: Send,
        L: RetryLogic,
        L::Response: Send + 'static,
        P: Clone + Send + 'static,
    {
        let pending: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index)
            .collect();
        let mut cursor = 0;

        while cursor < pending.len() {
            if cancel.is_cancelled() {
                return RunState::Cancelled;
            }

            let params = self.tuner.current_parameters();
            let end = (cursor + params.batch_size.max(1)).min(pending.len());
            let batch = &pending[cursor..end];
            cursor = end;

            let report = self
                .run_batch(remote, logic, items, batch, slots, cancel)
                .await;
            self.tuner.record_batch(report.outcome);
            self.batch_event.emit(BatchCompletedData {
                batch_index: *batch_index,
                batch_size: report.outcome.batch_size,
                success_count: report.outcome.success_count,
                error_count: report.outcome.error_count,
                elapsed: report.outcome.elapsed,
                rate_limited: report.end == BatchEnd::RateLimited,
            });
            *batch_index += 1;

            match report.end {
                BatchEnd::Completed => {}
                BatchEnd::RateLimited => return RunState::RateLimitAbort,
                BatchEnd::Cancelled => return RunState::Cancelled,
            }

            if cursor < pending.len() && !params.batch_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return RunState::Cancelled,
                    _ = sleep(params.batch_delay) => {}
                }
            }
        }

        RunState::Done
    }

    async fn run_batch<S, L, K, P>(
        &self,
        remote: &S,
        logic: &L,
        items: &[RequestItem<K, P>],
        batch: &[usize],
        slots: &mut [Option<Result<L::Response, CallError>>],
        cancel: &CancellationToken,
    ) -> BatchReport
    where
        S: Service<P, Response = L::Response> + Clone + Send + 'static,
        S::Error: Into<Error> + Send,
        S::Future: Send,
        L: RetryLogic,
        L::Response: Send + 'static,
        P: Clone + Send + 'static,
    {
        let started = Instant::now();
        let deadline = started + self.settings.per_batch_timeout;
        let batch_token = cancel.child_token();

        let mut workers = JoinSet::new();
        let mut in_flight = BTreeSet::new();
        let mut next = 0;
        let mut rate_limited = false;
        let mut timed_out = false;
        let mut cancelled = false;
        let mut completed = 0;
        let mut success_count = 0;
        let mut error_count = 0;

        loop {
            let submitting = !rate_limited && next < batch.len();
            if !submitting && workers.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                Some(joined) = workers.join_next() => match joined {
                    Ok((index, Attempt::NotStarted)) => {
                        in_flight.remove(&index);
                    }
                    Ok((index, Attempt::Finished(result))) => {
                        in_flight.remove(&index);
                        completed += 1;
                        match result {
                            Ok(response) => {
                                success_count += 1;
                                slots[index] = Some(Ok(response));
                            }
                            Err(CallError::RateLimited { reason }) => {
                                error_count += 1;
                                if !rate_limited {
                                    rate_limited = true;
                                    batch_token.cancel();
                                    warn!(
                                        target: "batch_throttle::executor",
                                        %reason,
                                        submitted = next,
                                        batch_size = batch.len(),
                                        "Rate limited; halting batch submission"
                                    );
                                }
                            }
                            Err(error) => {
                                error_count += 1;
                                slots[index] = Some(Err(error));
                            }
                        }

                        if completed % self.settings.progress_interval == 0 {
                            debug!(
                                target: "batch_throttle::executor",
                                completed,
                                batch_size = batch.len(),
                                success = success_count,
                                errors = error_count,
                                "Batch progress"
                            );
                        }
                    }
                    // The item stays in `in_flight` and is resolved below.
                    Err(error) => {
                        warn!(target: "batch_throttle::executor", %error, "Worker task failed");
                    }
                },
                permit = self.pool.acquire(&batch_token), if submitting => {
                    let Some(permit) = permit else {
                        continue;
                    };
                    let index = batch[next];
                    next += 1;
                    in_flight.insert(index);

                    let worker = Worker {
                        limiter: Arc::clone(&self.limiter),
                        backoff: Arc::clone(&self.backoff),
                        logic: logic.clone(),
                        token: batch_token.clone(),
                    };
                    let remote = remote.clone();
                    let payload = items[index].payload.clone();
                    workers.spawn(async move {
                        let attempt = worker.attempt(remote, payload).await;
                        drop(permit);
                        (index, attempt)
                    });
                }
            }
        }

        let waited = started.elapsed();
        if timed_out || cancelled {
            batch_token.cancel();
            workers.abort_all();
            // Let aborted workers unwind so their outcome guards run.
            while workers.join_next().await.is_some() {}

            for &index in &in_flight {
                slots[index] = Some(Err(CallError::Timeout { waited }));
                self.limiter.record_error();
            }
            error_count += in_flight.len();
            let mut timeouts = in_flight.len();

            if timed_out && !rate_limited {
                for &index in &batch[next..] {
                    slots[index] = Some(Err(CallError::Timeout { waited }));
                }
                error_count += batch.len() - next;
                timeouts += batch.len() - next;
            }
            self.counters.timed_out(timeouts);

            if timed_out {
                warn!(
                    target: "batch_throttle::executor",
                    timeouts,
                    timeout_ms = self.settings.per_batch_timeout.as_millis() as u64,
                    "Batch deadline passed; unfinished items marked as timed out"
                );
            }
        } else {
            for &index in &in_flight {
                slots[index] = Some(Err(CallError::Transient {
                    message: "worker task failed".to_owned(),
                }));
            }
            error_count += in_flight.len();
        }

        let end = if cancelled {
            BatchEnd::Cancelled
        } else if rate_limited {
            BatchEnd::RateLimited
        } else {
            BatchEnd::Completed
        };

        BatchReport {
            outcome: BatchOutcome {
                batch_size: batch.len(),
                success_count,
                error_count,
                elapsed: waited,
            },
            end,
        }
    }
}

/// Resolves every open slot with `error()`, returning how many were filled.
fn fill_unresolved<R>(
    slots: &mut [Option<Result<R, CallError>>],
    error: impl Fn() -> CallError,
) -> usize {
    let mut filled = 0;
    for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
        *slot = Some(Err(error()));
        filled += 1;
    }
    filled
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        fmt,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use tokio::time;
    use tower::service_fn;

    use super::*;
    use crate::{
        test_utils::trace_init,
        throttle::{
            backoff::{BackoffSettings, JitterMode},
            circuit::{CircuitSettings, CircuitState},
            rate_limiter::RateLimiterSettings,
            tuner::TunerSettings,
        },
    };

    #[derive(Debug)]
    enum QuoteError {
        RateLimited,
        Server(&'static str),
    }

    impl fmt::Display for QuoteError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                QuoteError::RateLimited => write!(f, "EGW00201: too many requests"),
                QuoteError::Server(code) => write!(f, "server error {}", code),
            }
        }
    }

    impl std::error::Error for QuoteError {}

    #[derive(Clone, Debug)]
    struct QuoteLogic;

    impl RetryLogic for QuoteLogic {
        type Error = QuoteError;
        type Response = String;

        fn is_rate_limited(&self, error: &Self::Error) -> bool {
            matches!(error, QuoteError::RateLimited)
        }
    }

    struct Harness {
        executor: BatchExecutor,
        limiter: Arc<RateLimiter>,
        backoff: Arc<BackoffController>,
    }

    fn harness(
        executor: ExecutorSettings,
        tuner: TunerSettings,
        circuit: CircuitSettings,
    ) -> Harness {
        harness_with_limit(1000, executor, tuner, circuit)
    }

    fn harness_with_limit(
        max_calls: u32,
        executor: ExecutorSettings,
        tuner: TunerSettings,
        circuit: CircuitSettings,
    ) -> Harness {
        let limiter = Arc::new(
            RateLimiter::new(
                RateLimiterSettings::builder()
                    .nominal_max_calls(max_calls)
                    .safety_margin(1.0)
                    .min_interval_enabled(false)
                    .build(),
            )
            .unwrap(),
        );
        let backoff = Arc::new(
            BackoffController::new(
                BackoffSettings::builder()
                    .base_delay(Duration::from_secs(1))
                    .jitter_mode(JitterMode::None)
                    .circuit(circuit)
                    .build(),
            )
            .unwrap(),
        );
        let tuner = BatchTuner::new(tuner).unwrap();
        let pool = WorkerPool::new(executor.pool_size).unwrap();

        Harness {
            executor: BatchExecutor::new(
                executor,
                Arc::clone(&limiter),
                Arc::clone(&backoff),
                Arc::new(tuner),
                pool,
            )
            .unwrap(),
            limiter,
            backoff,
        }
    }

    fn sequential(max_retries: u32) -> Harness {
        harness(
            ExecutorSettings::builder()
                .pool_size(1)
                .max_retries(max_retries)
                .build(),
            TunerSettings::default(),
            CircuitSettings::default(),
        )
    }

    fn items(count: usize) -> Vec<RequestItem<String, String>> {
        (1..=count)
            .map(|i| RequestItem::new(format!("i{}", i), format!("i{}", i)))
            .collect()
    }

    /// Records every call and answers according to `respond`.
    fn recording_service(
        calls: Arc<Mutex<Vec<String>>>,
        respond: impl Fn(&str, usize) -> Result<String, QuoteError> + Clone + Send + 'static,
    ) -> impl Service<
        String,
        Response = String,
        Error = QuoteError,
        Future = impl Future<Output = Result<String, QuoteError>> + Send,
    > + Clone
    + Send
    + 'static {
        service_fn(move |payload: String| {
            let calls = Arc::clone(&calls);
            let respond = respond.clone();
            async move {
                let seen = {
                    let mut calls = calls.lock().unwrap();
                    calls.push(payload.clone());
                    calls.iter().filter(|call| **call == payload).count()
                };
                respond(&payload, seen)
            }
        })
    }

    #[tokio::test]
    async fn results_align_with_input_order() {
        trace_init();
        time::pause();

        let harness = harness(
            ExecutorSettings::builder().pool_size(4).build(),
            TunerSettings::builder()
                .initial_batch_size(4)
                .min_batch_size(1)
                .initial_batch_delay(Duration::from_millis(10))
                .build(),
            CircuitSettings::builder().failure_threshold(100).build(),
        );

        // Later items finish first; every third item fails.
        let remote = service_fn(|payload: (usize, u64)| async move {
            time::sleep(Duration::from_millis(100 - payload.1)).await;
            if payload.0 % 3 == 0 {
                Err(QuoteError::Server("OPSQ0002"))
            } else {
                Ok(format!("price-{}", payload.0))
            }
        });
        let items: Vec<_> = (0..25)
            .map(|i| RequestItem::new(format!("{:06}", i % 7), (i, (i % 4) as u64 * 20)))
            .collect();
        let keys: Vec<String> = items.iter().map(|item| item.key.clone()).collect();

        let results = harness.executor.run(remote, QuoteLogic, items).await;

        assert_eq!(results.len(), 25);
        for (i, (result, key)) in results.iter().zip(&keys).enumerate() {
            assert_eq!(&result.key, key);
            if i % 3 == 0 {
                assert!(matches!(result.error(), Some(CallError::Transient { .. })));
            } else {
                assert_eq!(result.outcome, Ok(format!("price-{}", i)));
            }
        }
    }

    #[tokio::test]
    async fn rate_limit_retries_are_bounded() {
        trace_init();
        time::pause();

        let harness = sequential(2);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let remote = recording_service(Arc::clone(&calls), |payload, _| {
            if payload == "i5" {
                Err(QuoteError::RateLimited)
            } else {
                Ok(format!("ok-{}", payload))
            }
        });

        let results = harness.executor.run(remote, QuoteLogic, items(10)).await;

        assert_eq!(results.len(), 10);
        let stats = harness.executor.stats();
        assert_eq!(stats.passes, 3);
        assert_eq!(stats.rate_limit_aborts, 3);
        assert_eq!(stats.exhausted_runs, 1);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|call| *call == "i5").count(), 3);
        for result in &results[..4] {
            assert!(result.is_success());
        }
        assert!(
            results[4..]
                .iter()
                .all(|result| result.call_outcome() == CallOutcome::RateLimited)
        );
    }

    #[tokio::test]
    async fn rate_limit_halts_batch_and_resumes_at_first_unresolved() {
        trace_init();
        time::pause();

        let harness = sequential(3);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let remote = recording_service(Arc::clone(&calls), |payload, seen| {
            if payload == "i3" && seen == 1 {
                Err(QuoteError::RateLimited)
            } else {
                Ok(format!("ok-{}", payload))
            }
        });

        let start = Instant::now();
        let results = harness.executor.run(remote, QuoteLogic, items(6)).await;

        assert!(results.iter().all(ResultItem::is_success));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["i1", "i2", "i3", "i3", "i4", "i5", "i6"]
        );

        let stats = harness.executor.stats();
        assert_eq!(stats.passes, 2);
        assert_eq!(stats.rate_limit_aborts, 1);
        // Exactly one backoff sleep, of the base delay.
        assert_eq!(harness.backoff.stats().avg_backoff_time, Duration::from_secs(1));
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn rate_limit_abort_skips_remaining_batches() {
        trace_init();
        time::pause();

        // Parameters pinned to two items per batch and half a second between batches.
        let harness = harness(
            ExecutorSettings::builder().pool_size(1).build(),
            TunerSettings::builder()
                .initial_batch_size(2)
                .min_batch_size(2)
                .max_batch_size(2)
                .initial_batch_delay(Duration::from_millis(500))
                .min_batch_delay(Duration::from_millis(500))
                .max_batch_delay(Duration::from_millis(500))
                .build(),
            CircuitSettings::default(),
        );
        let calls = Arc::new(Mutex::new(Vec::new()));
        let remote = recording_service(Arc::clone(&calls), |payload, seen| {
            if payload == "i3" && seen == 1 {
                Err(QuoteError::RateLimited)
            } else {
                Ok(format!("ok-{}", payload))
            }
        });

        let start = Instant::now();
        let results = harness.executor.run(remote, QuoteLogic, items(6)).await;
        let elapsed = start.elapsed();

        assert!(results.iter().all(ResultItem::is_success));
        // i4 is never sent before the restart, and nothing from the third batch is either.
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["i1", "i2", "i3", "i3", "i4", "i5", "i6"]
        );

        // [i1 i2] [i3 -] | backoff | [i3 i4] [i5 i6]
        assert_eq!(harness.executor.tuner.stats().total_batches, 4);
        let stats = harness.executor.stats();
        assert_eq!(stats.passes, 2);
        assert_eq!(stats.rate_limit_aborts, 1);

        // One delay before the aborted batch, one backoff, one delay in the second pass, none
        // after the last batch or the abort.
        let expected =
            Duration::from_millis(500) + Duration::from_secs(1) + Duration::from_millis(500);
        assert!(elapsed >= expected, "{:?}", elapsed);
        assert!(elapsed < expected + Duration::from_millis(50), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn open_circuit_rejections_spend_no_rate_budget() {
        time::pause();

        let harness = harness_with_limit(
            2,
            ExecutorSettings::builder().pool_size(1).build(),
            TunerSettings::default(),
            CircuitSettings::builder().failure_threshold(1).build(),
        );
        let calls = Arc::new(Mutex::new(Vec::new()));
        let remote = recording_service(Arc::clone(&calls), |_, _| Err(QuoteError::Server("500")));

        let start = Instant::now();
        let results = harness.executor.run(remote, QuoteLogic, items(11)).await;

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(results[0].call_outcome(), CallOutcome::Error);
        assert!(
            results[1..]
                .iter()
                .all(|result| result.call_outcome() == CallOutcome::CircuitOpen)
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(harness.limiter.stats().total_calls, 1);
    }

    #[tokio::test]
    async fn items_past_the_deadline_time_out() {
        time::pause();

        let harness = harness(
            ExecutorSettings::builder()
                .pool_size(3)
                .per_batch_timeout(Duration::from_secs(1))
                .build(),
            TunerSettings::default(),
            CircuitSettings::default(),
        );
        let remote = service_fn(|payload: String| async move {
            if payload == "i2" {
                time::sleep(Duration::from_secs(10)).await;
            }
            Ok::<_, QuoteError>(payload)
        });

        let results = harness.executor.run(remote, QuoteLogic, items(3)).await;

        assert!(results[0].is_success());
        assert!(matches!(
            results[1].error(),
            Some(CallError::Timeout { waited }) if *waited >= Duration::from_secs(1)
        ));
        assert!(results[2].is_success());
        assert_eq!(harness.executor.stats().timeouts, 1);
        assert_eq!(harness.backoff.stats().total_failures, 1);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling() {
        time::pause();

        let harness = harness(
            ExecutorSettings::builder().pool_size(1).build(),
            TunerSettings::default(),
            CircuitSettings::builder().failure_threshold(2).build(),
        );
        let calls = Arc::new(Mutex::new(Vec::new()));
        let remote = recording_service(Arc::clone(&calls), |_, _| Err(QuoteError::Server("500")));

        let results = harness.executor.run(remote, QuoteLogic, items(5)).await;

        assert_eq!(calls.lock().unwrap().len(), 2);
        let outcomes: Vec<CallOutcome> = results.iter().map(ResultItem::call_outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                CallOutcome::Error,
                CallOutcome::Error,
                CallOutcome::CircuitOpen,
                CallOutcome::CircuitOpen,
                CallOutcome::CircuitOpen,
            ]
        );
        assert_eq!(harness.backoff.breaker().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn cancellation_resolves_everything_as_timeout() {
        time::pause();

        let harness = sequential(3);
        let started = Arc::new(AtomicUsize::new(0));
        let remote = {
            let started = Arc::clone(&started);
            service_fn(move |payload: String| {
                started.fetch_add(1, Ordering::SeqCst);
                async move {
                    time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, QuoteError>(payload)
                }
            })
        };

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let results = harness
            .executor
            .run_with_cancel(remote, QuoteLogic, items(4), cancel)
            .await;

        assert_eq!(results.len(), 4);
        assert!(
            results
                .iter()
                .all(|result| result.call_outcome() == CallOutcome::Timeout)
        );
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(harness.executor.stats().timeouts, 4);
    }

    #[tokio::test]
    async fn tuner_sees_every_batch() {
        time::pause();

        let harness = harness(
            ExecutorSettings::builder().pool_size(2).build(),
            TunerSettings::builder()
                .initial_batch_size(5)
                .min_batch_size(1)
                .initial_batch_delay(Duration::ZERO)
                .build(),
            CircuitSettings::default(),
        );
        let remote = service_fn(|payload: String| async move { Ok::<_, QuoteError>(payload) });

        let results = harness.executor.run(remote, QuoteLogic, items(12)).await;
        assert!(results.iter().all(ResultItem::is_success));

        let tuner = harness.executor.tuner.stats();
        assert_eq!(tuner.total_items, 12);
        assert_eq!(tuner.total_errors, 0);
        // Batches of 5, 5 and 2; three calm batches grow the size once.
        assert_eq!(tuner.total_batches, 3);
        assert_eq!(tuner.current_batch_size, 6);

        let by_key: HashMap<_, _> = results
            .iter()
            .map(|result| (result.key.as_str(), result.outcome.clone()))
            .collect();
        assert_eq!(by_key["i12"], Ok("i12".to_owned()));
    }

    #[test]
    fn settings_are_validated() {
        let settings = ExecutorSettings::builder()
            .per_batch_timeout(Duration::ZERO)
            .build();
        assert!(matches!(settings.validate(), Err(ConfigError::ZeroBatchTimeout)));

        let settings = ExecutorSettings::builder().progress_interval(0).build();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ZeroCount {
                name: "progress_interval"
            })
        ));
    }
}
