//! Future types

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use pin_project::{pin_project, pinned_drop};

use super::{
    backoff::BackoffController,
    error::CallError,
    rate_limiter::RateLimiter,
    retries::{RetryLogic, classify},
};
use crate::Error;

/// Future for the `ThrottledService` service.
///
/// Classifies the inner result and records it with the shared circuit breaker. A future dropped
/// before completion counts as a failure so a half-open trial is never left dangling.
#[pin_project(PinnedDrop)]
pub struct ResponseFuture<F, L> {
    /// `None` when the call was rejected by an open circuit.
    #[pin]
    inner: Option<F>,
    logic: L,
    backoff: Arc<BackoffController>,
    limiter: Arc<RateLimiter>,
    outcome_pending: bool,
}

impl<F, L> ResponseFuture<F, L> {
    pub(super) fn new(
        inner: F,
        logic: L,
        backoff: Arc<BackoffController>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            inner: Some(inner),
            logic,
            backoff,
            limiter,
            outcome_pending: true,
        }
    }

    pub(super) fn rejected(logic: L, backoff: Arc<BackoffController>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner: None,
            logic,
            backoff,
            limiter,
            outcome_pending: false,
        }
    }
}

impl<F, L, E> Future for ResponseFuture<F, L>
where
    F: Future<Output = Result<L::Response, E>>,
    E: Into<Error>,
    L: RetryLogic,
{
    type Output = Result<L::Response, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let Some(inner) = this.inner.as_pin_mut() else {
            return Poll::Ready(Err(Box::new(CallError::CircuitOpen)));
        };

        let outcome = classify(this.logic, ready!(inner.poll(cx)));
        *this.outcome_pending = false;
        this.backoff.record_outcome(outcome.is_ok());
        if outcome.is_err() {
            this.limiter.record_error();
        }

        Poll::Ready(outcome.map_err(Into::into))
    }
}

#[pinned_drop]
impl<F, L> PinnedDrop for ResponseFuture<F, L> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.outcome_pending {
            this.backoff.record_outcome(false);
        }
    }
}
