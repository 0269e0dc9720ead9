use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::FutureExt;
use tokio::time::{Sleep, sleep};
use tower::{retry::Policy, timeout::error::Elapsed};

use super::{backoff::BackoffController, error::CallError};
use crate::Error;

pub enum RetryAction {
    /// The response carries the remote service's rate-limit signal.
    Retry(Cow<'static, str>),
    /// The response is an error that retrying will not fix.
    DontRetry(Cow<'static, str>),
    /// The response is a success.
    Successful,
}

impl RetryAction {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, RetryAction::Retry(_))
    }

    pub const fn is_not_retryable(&self) -> bool {
        matches!(self, RetryAction::DontRetry(_))
    }

    pub const fn is_successful(&self) -> bool {
        matches!(self, RetryAction::Successful)
    }
}

/// Caller-supplied knowledge about the remote service's failure signals.
pub trait RetryLogic: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Response;

    /// Whether an error returned by the service is its distinguished rate-limit signal.
    fn is_rate_limited(&self, error: &Self::Error) -> bool;

    /// When the service call returns an `Ok` response, this function allows implementors to flag
    /// responses that are really failures. Some APIs report rate limiting inside an otherwise
    /// successful envelope (an HTTP 200 whose body carries an error code); return
    /// [`RetryAction::Retry`] for those.
    fn should_retry_response(&self, _response: &Self::Response) -> RetryAction {
        RetryAction::Successful
    }
}

/// Maps a raw service result onto [`CallError`].
///
/// Errors are matched by downcasting: the logic's own error type is asked whether it is a rate-limit
/// signal, a [`CallError`] (from a nested throttled service) passes through unchanged, and anything
/// else, a tower timeout included, is transient.
pub fn classify<L, E>(logic: &L, result: Result<L::Response, E>) -> Result<L::Response, CallError>
where
    L: RetryLogic,
    E: Into<Error>,
{
    match result {
        Ok(response) => match logic.should_retry_response(&response) {
            RetryAction::Successful => Ok(response),
            RetryAction::Retry(reason) => Err(CallError::RateLimited {
                reason: reason.into_owned(),
            }),
            RetryAction::DontRetry(reason) => Err(CallError::Transient {
                message: reason.into_owned(),
            }),
        },
        Err(error) => {
            let error = error.into();
            if let Some(expected) = error.downcast_ref::<L::Error>() {
                if logic.is_rate_limited(expected) {
                    Err(CallError::RateLimited {
                        reason: expected.to_string(),
                    })
                } else {
                    Err(CallError::Transient {
                        message: expected.to_string(),
                    })
                }
            } else if let Some(call_error) = error.downcast_ref::<CallError>() {
                Err(call_error.clone())
            } else if error.downcast_ref::<Elapsed>().is_some() {
                Err(CallError::Transient {
                    message: "request timed out".to_owned(),
                })
            } else {
                Err(CallError::Transient {
                    message: error.to_string(),
                })
            }
        }
    }
}

/// A tower retry policy that retries rate-limited calls only, sleeping
/// [`BackoffController::next_backoff`] between attempts.
///
/// Meant to sit outside a [`ThrottledService`](super::service::ThrottledService), whose errors are
/// boxed [`CallError`]s.
#[derive(Clone, Debug)]
pub struct RateLimitRetryPolicy {
    backoff: Arc<BackoffController>,
    attempt: u32,
    max_retries: u32,
}

pub struct RetryPolicyFuture {
    delay: Pin<Box<Sleep>>,
    policy: RateLimitRetryPolicy,
}

impl RateLimitRetryPolicy {
    pub fn new(backoff: Arc<BackoffController>, max_retries: u32) -> Self {
        Self {
            backoff,
            attempt: 0,
            max_retries,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn build_retry(&self) -> RetryPolicyFuture {
        let (delay, reason) = self.backoff.next_backoff(self.attempt);
        warn!(
            target: "batch_throttle::backoff",
            attempt = self.attempt + 1,
            max_retries = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "Rate limited; retrying call"
        );

        RetryPolicyFuture {
            delay: Box::pin(sleep(delay)),
            policy: Self {
                backoff: Arc::clone(&self.backoff),
                attempt: self.attempt + 1,
                max_retries: self.max_retries,
            },
        }
    }
}

impl<Req, Res> Policy<Req, Res, Error> for RateLimitRetryPolicy
where
    Req: Clone,
{
    type Future = RetryPolicyFuture;

    fn retry(&self, _: &Req, result: Result<&Res, &Error>) -> Option<Self::Future> {
        let error = result.err()?;
        match error.downcast_ref::<CallError>() {
            Some(CallError::RateLimited { reason }) => {
                if self.attempt >= self.max_retries {
                    error!(
                        target: "batch_throttle::backoff",
                        max_retries = self.max_retries,
                        %reason,
                        "Rate limit retries exhausted; giving up on call"
                    );
                    None
                } else {
                    Some(self.build_retry())
                }
            }
            _ => None,
        }
    }

    fn clone_request(&self, request: &Req) -> Option<Req> {
        Some(request.clone())
    }
}

impl Future for RetryPolicyFuture {
    type Output = RateLimitRetryPolicy;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        std::task::ready!(self.delay.poll_unpin(cx));
        Poll::Ready(self.policy.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::{fmt, time::Duration};

    use tokio::time;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};
    use tower::retry::RetryLayer;
    use tower_test::{assert_request_eq, mock};

    use super::*;
    use crate::throttle::backoff::{BackoffSettings, JitterMode};

    #[derive(Clone, Debug)]
    struct QuoteLogic;

    #[derive(Debug)]
    struct QuoteError {
        code: &'static str,
    }

    impl fmt::Display for QuoteError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "quote request failed with {}", self.code)
        }
    }

    impl std::error::Error for QuoteError {}

    impl RetryLogic for QuoteLogic {
        type Error = QuoteError;
        type Response = &'static str;

        fn is_rate_limited(&self, error: &Self::Error) -> bool {
            error.code == "EGW00201"
        }

        fn should_retry_response(&self, response: &Self::Response) -> RetryAction {
            match *response {
                "EGW00201" => RetryAction::Retry("rate limit code in body".into()),
                "EGW00123" => RetryAction::DontRetry("expired token".into()),
                _ => RetryAction::Successful,
            }
        }
    }

    fn policy(max_retries: u32) -> RateLimitRetryPolicy {
        let backoff = BackoffController::new(
            BackoffSettings::builder()
                .base_delay(Duration::from_secs(1))
                .jitter_mode(JitterMode::None)
                .build(),
        )
        .unwrap();
        RateLimitRetryPolicy::new(Arc::new(backoff), max_retries)
    }

    fn rate_limited() -> Error {
        Box::new(CallError::RateLimited {
            reason: "EGW00201".to_owned(),
        })
    }

    #[test]
    fn classify_maps_responses_and_errors() {
        assert_eq!(classify(&QuoteLogic, Ok::<_, QuoteError>("70100")), Ok("70100"));
        assert!(matches!(
            classify(&QuoteLogic, Ok::<_, QuoteError>("EGW00201")),
            Err(CallError::RateLimited { .. })
        ));
        assert_eq!(
            classify(&QuoteLogic, Ok::<_, QuoteError>("EGW00123")),
            Err(CallError::Transient {
                message: "expired token".to_owned()
            })
        );

        assert!(matches!(
            classify(&QuoteLogic, Err(QuoteError { code: "EGW00201" })),
            Err(CallError::RateLimited { .. })
        ));
        assert!(matches!(
            classify(&QuoteLogic, Err(QuoteError { code: "OPSQ0002" })),
            Err(CallError::Transient { .. })
        ));
    }

    #[test]
    fn classify_passes_call_errors_through() {
        assert_eq!(
            classify(&QuoteLogic, Err::<&str, Error>(Box::new(CallError::CircuitOpen))),
            Err(CallError::CircuitOpen)
        );
        assert!(matches!(
            classify(&QuoteLogic, Err::<&str, Error>(Box::new(Elapsed::new()))),
            Err(CallError::Transient { .. })
        ));
    }

    #[tokio::test]
    async fn rate_limited_call_is_retried_after_backoff() {
        time::pause();

        let (mut svc, mut handle) = mock::spawn_layer::<&str, &str, _>(RetryLayer::new(policy(3)));

        assert_ready_ok!(svc.poll_ready());

        let fut = svc.call("005930");
        let mut fut = task::spawn(fut);

        assert_request_eq!(handle, "005930").send_error(rate_limited());

        assert_pending!(fut.poll());

        time::advance(Duration::from_secs(2)).await;
        assert_pending!(fut.poll());

        assert_request_eq!(handle, "005930").send_response("70100");
        assert_eq!(fut.await.unwrap(), "70100");
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let (mut svc, mut handle) = mock::spawn_layer::<&str, &str, _>(RetryLayer::new(policy(3)));

        assert_ready_ok!(svc.poll_ready());

        let mut fut = task::spawn(svc.call("005930"));
        assert_request_eq!(handle, "005930").send_error(CallError::Transient {
            message: "connection reset".to_owned(),
        });
        assert_ready_err!(fut.poll());
    }

    #[tokio::test]
    async fn retries_stop_at_max() {
        time::pause();

        let (mut svc, mut handle) = mock::spawn_layer::<&str, &str, _>(RetryLayer::new(policy(1)));

        assert_ready_ok!(svc.poll_ready());

        let mut fut = task::spawn(svc.call("005930"));
        assert_request_eq!(handle, "005930").send_error(rate_limited());
        assert_pending!(fut.poll());

        time::advance(Duration::from_secs(2)).await;
        assert_pending!(fut.poll());

        assert_request_eq!(handle, "005930").send_error(rate_limited());
        let error = assert_ready_err!(fut.poll());
        assert!(matches!(
            error.downcast_ref::<CallError>(),
            Some(CallError::RateLimited { .. })
        ));
    }
}
