use std::sync::Arc;

use tower::Layer;

use super::{
    backoff::BackoffController, rate_limiter::RateLimiter, retries::RetryLogic,
    service::ThrottledService,
};

/// Enforces the shared rate limit and circuit breaker on the underlying service.
///
/// Every service produced by one layer (and every layer handed out by one
/// [`ThrottleEngine`](super::engine::ThrottleEngine)) draws from the same budget.
#[derive(Clone, Debug)]
pub struct ThrottleLayer<L> {
    limiter: Arc<RateLimiter>,
    backoff: Arc<BackoffController>,
    logic: L,
}

impl<L> ThrottleLayer<L> {
    pub fn new(limiter: Arc<RateLimiter>, backoff: Arc<BackoffController>, logic: L) -> Self {
        Self {
            limiter,
            backoff,
            logic,
        }
    }
}

impl<S, L: RetryLogic> Layer<S> for ThrottleLayer<L> {
    type Service = ThrottledService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        ThrottledService::new(
            service,
            self.logic.clone(),
            Arc::clone(&self.limiter),
            Arc::clone(&self.backoff),
        )
    }
}
