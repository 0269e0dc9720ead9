//! Adaptive batch sizing.
//!
//! A discrete-time controller with a hysteresis band around `target_error_rate`: a rolling error
//! rate above the band shrinks the batch and lengthens the inter-batch delay; a rate below the band
//! for `stable_batches` consecutive batches cautiously grows the batch back; anything inside the
//! band holds. The band, not precise tuning, is what damps oscillation.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::{
    error::{
        BatchDelayBoundsSnafu, BatchSizeBoundsSnafu, ConfigError, HysteresisBandSnafu, RatioSnafu,
        TargetErrorRateSnafu, ZeroCountSnafu,
    },
    internal_event::{BatchAdjustmentData, BatchParametersAdjusted, InternalEventHandle},
};

/// Configuration of the batch tuner.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `initial_batch_size` | 50 | Items per batch before any feedback |
/// | `initial_batch_delay` | 1s | Pause between batches before any feedback |
/// | `target_error_rate` | 0.01 | Error rate the controller steers toward |
/// | `min_batch_size` / `max_batch_size` | 5 / 100 | Hard bounds on the batch size |
/// | `min_batch_delay` / `max_batch_delay` | 0 / 5s | Hard bounds on the delay |
/// | `upper_multiplier` | 2.0 | Back off when the rate exceeds `target * upper_multiplier` |
/// | `lower_multiplier` | 0.5 | Reclaim throughput below `target * lower_multiplier` |
/// | `decrease_ratio` | 0.7 | Multiplicative shrink of the batch size |
/// | `increase_ratio` | 1.2 | Multiplicative growth of the batch size (at least +1) |
/// | `delay_step` | 250ms | Additive change of the delay per adjustment |
/// | `window_batches` | 5 | Batches in the rolling error rate |
/// | `stable_batches` | 3 | Consecutive calm batches required before growing |
#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunerSettings {
    #[builder(default = default_initial_batch_size())]
    pub(super) initial_batch_size: usize,
    #[builder(default = default_initial_batch_delay())]
    pub(super) initial_batch_delay: Duration,
    #[builder(default = default_target_error_rate())]
    pub(super) target_error_rate: f64,
    #[builder(default = default_min_batch_size())]
    pub(super) min_batch_size: usize,
    #[builder(default = default_max_batch_size())]
    pub(super) max_batch_size: usize,
    #[builder(default)]
    pub(super) min_batch_delay: Duration,
    #[builder(default = default_max_batch_delay())]
    pub(super) max_batch_delay: Duration,
    #[builder(default = default_upper_multiplier())]
    pub(super) upper_multiplier: f64,
    #[builder(default = default_lower_multiplier())]
    pub(super) lower_multiplier: f64,
    #[builder(default = default_decrease_ratio())]
    pub(super) decrease_ratio: f64,
    #[builder(default = default_increase_ratio())]
    pub(super) increase_ratio: f64,
    #[builder(default = default_delay_step())]
    pub(super) delay_step: Duration,
    #[builder(default = default_window_batches())]
    pub(super) window_batches: usize,
    #[builder(default = default_stable_batches())]
    pub(super) stable_batches: u32,
}

const fn default_initial_batch_size() -> usize {
    50
}

const fn default_initial_batch_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_target_error_rate() -> f64 {
    0.01
}

const fn default_min_batch_size() -> usize {
    5
}

const fn default_max_batch_size() -> usize {
    100
}

const fn default_max_batch_delay() -> Duration {
    Duration::from_secs(5)
}

const fn default_upper_multiplier() -> f64 {
    2.0
}

const fn default_lower_multiplier() -> f64 {
    0.5
}

const fn default_decrease_ratio() -> f64 {
    0.7
}

const fn default_increase_ratio() -> f64 {
    1.2
}

const fn default_delay_step() -> Duration {
    Duration::from_millis(250)
}

const fn default_window_batches() -> usize {
    5
}

const fn default_stable_batches() -> u32 {
    3
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            initial_batch_size: default_initial_batch_size(),
            initial_batch_delay: default_initial_batch_delay(),
            target_error_rate: default_target_error_rate(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            min_batch_delay: Duration::ZERO,
            max_batch_delay: default_max_batch_delay(),
            upper_multiplier: default_upper_multiplier(),
            lower_multiplier: default_lower_multiplier(),
            decrease_ratio: default_decrease_ratio(),
            increase_ratio: default_increase_ratio(),
            delay_step: default_delay_step(),
            window_batches: default_window_batches(),
            stable_batches: default_stable_batches(),
        }
    }
}

impl TunerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.min_batch_size >= 1
                && self.min_batch_size <= self.initial_batch_size
                && self.initial_batch_size <= self.max_batch_size,
            BatchSizeBoundsSnafu {
                min: self.min_batch_size,
                initial: self.initial_batch_size,
                max: self.max_batch_size,
            }
        );
        ensure!(
            self.min_batch_delay <= self.initial_batch_delay
                && self.initial_batch_delay <= self.max_batch_delay,
            BatchDelayBoundsSnafu {
                min: self.min_batch_delay,
                initial: self.initial_batch_delay,
                max: self.max_batch_delay,
            }
        );
        ensure!(
            self.target_error_rate > 0.0 && self.target_error_rate < 1.0,
            TargetErrorRateSnafu {
                value: self.target_error_rate
            }
        );
        ensure!(
            self.lower_multiplier >= 0.0 && self.lower_multiplier < self.upper_multiplier,
            HysteresisBandSnafu {
                lower: self.lower_multiplier,
                upper: self.upper_multiplier,
            }
        );
        ensure!(
            self.decrease_ratio > 0.0 && self.decrease_ratio < 1.0,
            RatioSnafu {
                name: "decrease_ratio",
                value: self.decrease_ratio,
            }
        );
        ensure!(self.window_batches >= 1, ZeroCountSnafu { name: "window_batches" });
        ensure!(self.stable_batches >= 1, ZeroCountSnafu { name: "stable_batches" });
        Ok(())
    }

    pub fn initial_parameters(&self) -> BatchParameters {
        BatchParameters {
            batch_size: self.initial_batch_size,
            batch_delay: self.initial_batch_delay,
        }
    }

    pub fn min_batch_size(&self) -> usize {
        self.min_batch_size
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn target_error_rate(&self) -> f64 {
        self.target_error_rate
    }
}

/// The `(batch_size, batch_delay)` pair, always read and written together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BatchParameters {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

/// Aggregate result of one batch, consumed by [`BatchTuner::record_batch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchOutcome {
    pub batch_size: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub elapsed: Duration,
}

impl BatchOutcome {
    pub fn error_rate(&self) -> Option<f64> {
        let total = self.success_count + self.error_count;
        (total > 0).then(|| self.error_count as f64 / total as f64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjustment {
    /// Batch size shrunk and/or delay grown.
    BackedOff,
    /// Batch size grown and/or delay shrunk.
    Reclaimed,
    Held,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TunerStats {
    pub current_batch_size: usize,
    pub current_batch_delay: Duration,
    pub adjustment_count: u64,
    pub total_batches: u64,
    pub total_items: u64,
    pub total_errors: u64,
    pub overall_error_rate: f64,
    pub recent_error_rate: f64,
}

#[derive(Debug)]
struct TunerState {
    params: BatchParameters,
    recent: VecDeque<(usize, usize)>,
    calm_streak: u32,
    adjustment_count: u64,
    total_batches: u64,
    total_items: u64,
    total_errors: u64,
}

impl TunerState {
    fn recent_error_rate(&self) -> f64 {
        let (success, errors) = self
            .recent
            .iter()
            .fold((0, 0), |(s, e), &(bs, be)| (s + bs, e + be));
        if success + errors == 0 {
            0.0
        } else {
            errors as f64 / (success + errors) as f64
        }
    }
}

#[derive(Debug)]
pub struct BatchTuner {
    settings: TunerSettings,
    state: Mutex<TunerState>,
    adjusted_event: BatchParametersAdjusted,
}

impl BatchTuner {
    pub fn new(settings: TunerSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            settings,
            state: Mutex::new(TunerState {
                params: settings.initial_parameters(),
                recent: VecDeque::with_capacity(settings.window_batches),
                calm_streak: 0,
                adjustment_count: 0,
                total_batches: 0,
                total_items: 0,
                total_errors: 0,
            }),
            adjusted_event: BatchParametersAdjusted::register(),
        })
    }

    pub fn settings(&self) -> &TunerSettings {
        &self.settings
    }

    /// A consistent snapshot of the parameters for the next batch.
    pub fn current_parameters(&self) -> BatchParameters {
        self.lock().params
    }

    /// Feeds one batch into the controller and applies at most one adjustment.
    pub fn record_batch(&self, outcome: BatchOutcome) -> Adjustment {
        let mut state = self.lock();
        state.total_batches += 1;
        state.total_items += (outcome.success_count + outcome.error_count) as u64;
        state.total_errors += outcome.error_count as u64;

        // Nothing was attempted (e.g. aborted before the first call); no signal to act on.
        if outcome.error_rate().is_none() {
            return Adjustment::Held;
        }

        state
            .recent
            .push_back((outcome.success_count, outcome.error_count));
        while state.recent.len() > self.settings.window_batches {
            state.recent.pop_front();
        }

        let error_rate = state.recent_error_rate();
        let upper = self.settings.target_error_rate * self.settings.upper_multiplier;
        let lower = self.settings.target_error_rate * self.settings.lower_multiplier;
        let previous = state.params;

        let (next, adjustment) = if error_rate > upper {
            state.calm_streak = 0;
            (self.backed_off(previous), Adjustment::BackedOff)
        } else if error_rate < lower {
            state.calm_streak += 1;
            if state.calm_streak >= self.settings.stable_batches {
                state.calm_streak = 0;
                (self.reclaimed(previous), Adjustment::Reclaimed)
            } else {
                (previous, Adjustment::Held)
            }
        } else {
            state.calm_streak = 0;
            (previous, Adjustment::Held)
        };

        if next == previous {
            return Adjustment::Held;
        }

        state.params = next;
        state.adjustment_count += 1;
        // The new parameters get a fresh window of observations.
        state.recent.clear();

        self.adjusted_event.emit(BatchAdjustmentData {
            previous,
            current: next,
            error_rate,
            adjustment_count: state.adjustment_count,
        });
        adjustment
    }

    pub fn stats(&self) -> TunerStats {
        let state = self.lock();
        TunerStats {
            current_batch_size: state.params.batch_size,
            current_batch_delay: state.params.batch_delay,
            adjustment_count: state.adjustment_count,
            total_batches: state.total_batches,
            total_items: state.total_items,
            total_errors: state.total_errors,
            overall_error_rate: if state.total_items == 0 {
                0.0
            } else {
                state.total_errors as f64 / state.total_items as f64
            },
            recent_error_rate: state.recent_error_rate(),
        }
    }

    fn backed_off(&self, params: BatchParameters) -> BatchParameters {
        let shrunk = (params.batch_size as f64 * self.settings.decrease_ratio).floor() as usize;
        // Strictly smaller unless already at the floor.
        let shrunk = shrunk.min(params.batch_size.saturating_sub(1));

        BatchParameters {
            batch_size: shrunk.max(self.settings.min_batch_size),
            batch_delay: params
                .batch_delay
                .saturating_add(self.settings.delay_step)
                .min(self.settings.max_batch_delay),
        }
    }

    fn reclaimed(&self, params: BatchParameters) -> BatchParameters {
        let grown = (params.batch_size as f64 * self.settings.increase_ratio).ceil() as usize;
        let grown = grown.max(params.batch_size + 1);

        BatchParameters {
            batch_size: grown.min(self.settings.max_batch_size),
            batch_delay: params
                .batch_delay
                .saturating_sub(self.settings.delay_step)
                .max(self.settings.min_batch_delay),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TunerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
