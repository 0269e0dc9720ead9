//! Request throttling and adaptive batch execution for rate-limited remote services.
//!
//! This crate sits between application code and a service that enforces a hard call-rate ceiling.
//! It keeps the aggregate call rate under that ceiling, recovers from rate-limit rejections
//! without losing work, and tunes its own batch size and inter-batch delay from the error rate
//! it observes.
//!
//! # Components
//! 1. **Rate limiter**: sliding-window admission with a safety margin below the nominal ceiling
//! 2. **Backoff controller**: exponential backoff with jitter plus a circuit breaker
//! 3. **Batch tuner**: hysteresis controller converging on a target error rate
//! 4. **Batch executor**: bounded worker pool, per-batch timeouts, whole-run retry on rate limits
//!
//! All four are process-wide: build one [`throttle::ThrottleEngine`] per credential and share it.
//!
//! # Basic Usage
//! ```no_run
//! use batch_throttle::throttle::{
//!     ThrottleEngine, ThrottleSettings,
//!     executor::RequestItem,
//!     retries::RetryLogic,
//! };
//! use tower::service_fn;
//!
//! #[derive(Clone)]
//! struct QuoteLogic;
//!
//! impl RetryLogic for QuoteLogic {
//!     type Error = std::io::Error;
//!     type Response = String;
//!
//!     fn is_rate_limited(&self, error: &Self::Error) -> bool {
//!         error.to_string().contains("EGW00201")
//!     }
//! }
//!
//! # async fn demo() -> Result<(), batch_throttle::throttle::error::ConfigError> {
//! let engine = ThrottleEngine::new(ThrottleSettings::default())?;
//! let remote = service_fn(|symbol: String| async move { Ok::<_, std::io::Error>(symbol) });
//! let items = vec![RequestItem::new("005930", "005930".to_string())];
//!
//! let results = engine.executor().run(remote, QuoteLogic, items).await;
//! assert_eq!(results.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//! See [`throttle::ThrottleSettings`] and the per-component settings it aggregates.
//!
//! # Metrics
//! Emits metrics via the `InternalEventHandle` trait and `tracing` events per component.
pub mod throttle;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
