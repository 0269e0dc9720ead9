use std::{
    fmt, mem,
    sync::Arc,
    task::{Context, Poll, ready},
    time::Duration,
};

use futures::future::BoxFuture;
use tower::Service;

use super::{
    backoff::BackoffController, future::ResponseFuture, rate_limiter::RateLimiter,
    retries::RetryLogic,
};
use crate::Error;

enum Admission {
    Idle,
    Waiting(BoxFuture<'static, Duration>),
    Admitted,
    /// The circuit was open at readiness; the next call fails fast without rate admission.
    Rejected,
}

/// Wraps a single remote call in the shared throttle.
///
/// `poll_ready` waits for rate-limiter admission before reporting readiness, unless the circuit
/// breaker is open, in which case it is ready at once and `call` fails fast with
/// [`CallError::CircuitOpen`](super::error::CallError). Errors are boxed
/// [`CallError`](super::error::CallError)s.
pub struct ThrottledService<S, L> {
    inner: S,
    logic: L,
    limiter: Arc<RateLimiter>,
    backoff: Arc<BackoffController>,
    admission: Admission,
}

impl<S, L> ThrottledService<S, L> {
    pub fn new(inner: S, logic: L, limiter: Arc<RateLimiter>, backoff: Arc<BackoffController>) -> Self {
        Self {
            inner,
            logic,
            limiter,
            backoff,
            admission: Admission::Idle,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, L, Req> Service<Req> for ThrottledService<S, L>
where
    S: Service<Req, Response = L::Response>,
    S::Error: Into<Error>,
    L: RetryLogic,
{
    type Response = S::Response;
    type Error = Error;
    type Future = ResponseFuture<S::Future, L>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if let Admission::Idle = self.admission {
            self.admission = if self.backoff.is_rejecting() {
                Admission::Rejected
            } else {
                let limiter = Arc::clone(&self.limiter);
                Admission::Waiting(Box::pin(async move { limiter.acquire().await }))
            };
        }

        match &mut self.admission {
            Admission::Waiting(admission) => {
                ready!(admission.as_mut().poll(cx));
                self.admission = Admission::Admitted;
            }
            Admission::Rejected => return Poll::Ready(Ok(())),
            Admission::Idle | Admission::Admitted => {}
        }

        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Req) -> Self::Future {
        let admission = mem::replace(&mut self.admission, Admission::Idle);
        debug_assert!(
            matches!(admission, Admission::Admitted | Admission::Rejected),
            "poll_ready must be called before call"
        );

        if matches!(admission, Admission::Rejected) || !self.backoff.should_attempt() {
            return ResponseFuture::rejected(
                self.logic.clone(),
                Arc::clone(&self.backoff),
                Arc::clone(&self.limiter),
            );
        }

        ResponseFuture::new(
            self.inner.call(request),
            self.logic.clone(),
            Arc::clone(&self.backoff),
            Arc::clone(&self.limiter),
        )
    }
}

impl<S: Clone, L: Clone> Clone for ThrottledService<S, L> {
    /// Clones start unadmitted; each clone waits for its own admission.
    fn clone(&self) -> Self {
        Self::new(
            self.inner.clone(),
            self.logic.clone(),
            Arc::clone(&self.limiter),
            Arc::clone(&self.backoff),
        )
    }
}

impl<S: fmt::Debug, L: fmt::Debug> fmt::Debug for ThrottledService<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledService")
            .field("inner", &self.inner)
            .field("logic", &self.logic)
            .field(
                "admitted",
                &matches!(self.admission, Admission::Admitted),
            )
            .finish_non_exhaustive()
    }
}
