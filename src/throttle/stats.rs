//! Plain aggregates for an external reporting collaborator.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

use super::{
    backoff::BackoffStats,
    error::CallOutcome,
    executor::ResultItem,
    rate_limiter::RateLimiterStats,
    tuner::TunerStats,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub runs: u64,
    pub items: u64,
    /// Passes over unresolved items; the first pass of every run counts.
    pub passes: u64,
    pub rate_limit_aborts: u64,
    pub timeouts: u64,
    /// Runs that gave up with rate-limited items after `max_retries`.
    pub exhausted_runs: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ExecutorCounters {
    runs: AtomicU64,
    items: AtomicU64,
    passes: AtomicU64,
    rate_limit_aborts: AtomicU64,
    timeouts: AtomicU64,
    exhausted_runs: AtomicU64,
}

impl ExecutorCounters {
    pub(crate) fn run_started(&self, items: usize) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.items.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub(crate) fn pass_started(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rate_limit_abort(&self) {
        self.rate_limit_aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn timed_out(&self, items: usize) {
        self.timeouts.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub(crate) fn exhausted(&self) {
        self.exhausted_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            runs: self.runs.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            rate_limit_aborts: self.rate_limit_aborts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            exhausted_runs: self.exhausted_runs.load(Ordering::Relaxed),
        }
    }
}

/// Per-run tally of item outcomes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: BTreeMap<CallOutcome, usize>,
}

impl RunSummary {
    pub fn from_results<K, R>(results: &[ResultItem<K, R>]) -> Self {
        let mut summary = RunSummary {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            let outcome = result.call_outcome();
            if outcome == CallOutcome::Success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            *summary.outcomes.entry(outcome).or_insert(0) += 1;
        }
        summary
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }

    pub fn count(&self, outcome: CallOutcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

/// Everything [`ThrottleEngine::stats`](super::engine::ThrottleEngine::stats) reports.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineStats {
    pub rate_limiter: RateLimiterStats,
    pub backoff: BackoffStats,
    pub tuner: TunerStats,
    pub executor: ExecutorStats,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::throttle::{error::CallError, executor::ResultItem};

    #[test]
    fn summary_counts_outcomes() {
        let results = vec![
            ResultItem::new("005930", Ok(1)),
            ResultItem::new("000660", Ok(2)),
            ResultItem::new(
                "035720",
                Err(CallError::RateLimited {
                    reason: "EGW00201".to_owned(),
                }),
            ),
            ResultItem::new(
                "005380",
                Err(CallError::Timeout {
                    waited: Duration::from_secs(30),
                }),
            ),
        ];

        let summary = RunSummary::from_results(&results);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.count(CallOutcome::RateLimited), 1);
        assert_eq!(summary.count(CallOutcome::CircuitOpen), 0);
        assert!((summary.success_rate() - 0.5).abs() < f64::EPSILON);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["outcomes"]["timeout"], 1);
    }

    #[test]
    fn empty_run_is_fully_successful() {
        let summary = RunSummary::from_results::<&str, ()>(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.success_rate(), 1.0);
    }
}
