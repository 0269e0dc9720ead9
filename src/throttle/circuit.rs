//! Circuit breaker guarding the remote service.
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     consecutive_failures >= failure_threshold
//! Open     → HalfOpen: cooldown elapsed (checked lazily on the next attempt)
//! HalfOpen → Closed:   the single trial call succeeds
//! HalfOpen → Open:     the trial fails; cooldown is scaled up, bounded by max_cooldown
//! ```

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio::time::Instant;

use super::{
    error::{ConfigError, CooldownMultiplierSnafu, ZeroFailureThresholdSnafu},
    internal_event::{CircuitTransition, CircuitTransitionData, InternalEventHandle},
};

#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitSettings {
    /// Consecutive failures that open the circuit.
    #[builder(default = default_failure_threshold())]
    pub(super) failure_threshold: u32,

    /// How long the circuit stays open before a trial call is allowed.
    #[builder(default = default_cooldown())]
    pub(super) cooldown: Duration,

    /// Factor applied to the cooldown each time a half-open trial fails.
    #[builder(default = default_cooldown_multiplier())]
    pub(super) cooldown_multiplier: f64,

    /// Upper bound for the scaled cooldown.
    #[builder(default = default_max_cooldown())]
    pub(super) max_cooldown: Duration,
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

const fn default_cooldown_multiplier() -> f64 {
    2.0
}

const fn default_max_cooldown() -> Duration {
    Duration::from_secs(300)
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown: default_max_cooldown(),
        }
    }
}

impl CircuitSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.failure_threshold >= 1, ZeroFailureThresholdSnafu);
        ensure!(
            self.cooldown_multiplier >= 1.0,
            CooldownMultiplierSnafu {
                value: self.cooldown_multiplier
            }
        );
        Ok(())
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub(crate) const fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    circuit_opens: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitSettings,
    circuit: Mutex<Circuit>,
    transition_event: CircuitTransition,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            settings,
            circuit: Mutex::new(Circuit {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown: settings.cooldown,
                trial_in_flight: false,
                circuit_opens: 0,
            }),
            transition_event: CircuitTransition::register(),
        })
    }

    /// Whether a call may be issued now. Never waits.
    ///
    /// While open this returns `false` until the cooldown elapses; the first caller after that
    /// moves the circuit to half-open and is the only one let through until its outcome is recorded.
    pub fn should_attempt(&self) -> bool {
        let mut circuit = self.lock();
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = circuit
                    .opened_at
                    .is_none_or(|opened_at| opened_at.elapsed() >= circuit.cooldown);
                if cooled_down {
                    self.transition(&mut circuit, CircuitState::HalfOpen);
                    circuit.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    false
                } else {
                    circuit.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Whether [`should_attempt`](Self::should_attempt) would refuse right now.
    ///
    /// Unlike `should_attempt` this never claims the half-open trial, so callers can check it
    /// before spending anything else on a call.
    pub fn is_rejecting(&self) -> bool {
        let circuit = self.lock();
        match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => circuit
                .opened_at
                .is_some_and(|opened_at| opened_at.elapsed() < circuit.cooldown),
            CircuitState::HalfOpen => circuit.trial_in_flight,
        }
    }

    pub fn record_outcome(&self, success: bool) {
        let mut circuit = self.lock();
        if success {
            circuit.consecutive_failures = 0;
            if circuit.state != CircuitState::Closed {
                circuit.trial_in_flight = false;
                circuit.cooldown = self.settings.cooldown;
                circuit.opened_at = None;
                self.transition(&mut circuit, CircuitState::Closed);
            }
            return;
        }

        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.settings.failure_threshold {
                    self.open(&mut circuit);
                }
            }
            CircuitState::HalfOpen => {
                circuit.trial_in_flight = false;
                let scaled = Duration::try_from_secs_f64(
                    circuit.cooldown.as_secs_f64() * self.settings.cooldown_multiplier,
                )
                .unwrap_or(self.settings.max_cooldown)
                .min(self.settings.max_cooldown);
                circuit.cooldown = scaled.max(self.settings.cooldown);
                self.open(&mut circuit);
            }
            // Late failures from calls admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn circuit_opens(&self) -> u64 {
        self.lock().circuit_opens
    }

    /// Cooldown currently in force, including any half-open scaling.
    pub fn current_cooldown(&self) -> Duration {
        self.lock().cooldown
    }

    fn open(&self, circuit: &mut Circuit) {
        circuit.opened_at = Some(Instant::now());
        circuit.circuit_opens += 1;
        self.transition(circuit, CircuitState::Open);
    }

    fn transition(&self, circuit: &mut Circuit, to: CircuitState) {
        let from = circuit.state;
        circuit.state = to;
        self.transition_event.emit(CircuitTransitionData {
            from,
            to,
            consecutive_failures: circuit.consecutive_failures,
            cooldown: circuit.cooldown,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Circuit> {
        self.circuit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
