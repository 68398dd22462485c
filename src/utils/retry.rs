use crate::core::BrowserControl;
use crate::errors::{BridgeError, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub base_delay: Duration,
    pub check_alive: bool,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration, check_alive: bool) -> Self {
        Self {
            retries,
            base_delay,
            check_alive,
        }
    }

    /// One retry, no liveness probe. Used for reads inside larger flows.
    pub fn quick() -> Self {
        Self::new(1, Duration::from_millis(150), false)
    }

    pub fn quick_checked() -> Self {
        Self::new(1, Duration::from_millis(150), true)
    }

    fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

enum Step<T> {
    Done(Result<T>),
    Retry(BridgeError),
}

async fn precheck(control: &dyn BrowserControl, name: &str, policy: &RetryPolicy) -> Result<()> {
    if policy.check_alive && !control.is_alive().await {
        warn!(operation = name, "control channel is dead, not retrying");
        return Err(BridgeError::operation(name, &BridgeError::SessionDead));
    }
    Ok(())
}

fn classify<T>(name: &str, attempt: u32, outcome: Result<T>) -> Step<T> {
    match outcome {
        Ok(value) => Step::Done(Ok(value)),
        Err(err) if err.is_terminal() => Step::Done(Err(err)),
        Err(err) => {
            debug!(operation = name, attempt, error = %err, "attempt failed");
            Step::Retry(err)
        }
    }
}

/// Runs `op` with bounded exponential backoff and an optional liveness
/// probe before each attempt. Terminal failures (element gone, an inner
/// operation that already gave up) pass through untouched.
pub async fn with_retry<T, F, Fut>(
    control: &dyn BrowserControl,
    name: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut last_error = BridgeError::SessionDead;
    for attempt in 0..attempts {
        precheck(control, name, &policy).await?;
        match classify(name, attempt, op().await) {
            Step::Done(result) => return result,
            Step::Retry(err) => last_error = err,
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }
    warn!(operation = name, error = %last_error, "retries exhausted");
    Err(BridgeError::operation(name, &last_error))
}

/// Like [`with_retry`], for operations that need exclusive access to state.
pub async fn with_retry_mut<S, T, F>(
    control: &dyn BrowserControl,
    state: &mut S,
    name: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T>
where
    S: Send,
    F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T>>,
{
    let attempts = policy.attempts();
    let mut last_error = BridgeError::SessionDead;
    for attempt in 0..attempts {
        precheck(control, name, &policy).await?;
        match classify(name, attempt, op(state).await) {
            Step::Done(result) => return result,
            Step::Retry(err) => last_error = err,
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }
    warn!(operation = name, error = %last_error, "retries exhausted");
    Err(BridgeError::operation(name, &last_error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBrowser;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(retries: u32, check_alive: bool) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(1), check_alive)
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let browser = MockBrowser::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = with_retry(&browser, "Read", fast(2, true), || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(BridgeError::Timeout("first".into()))
            } else {
                Ok(5)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_error_has_memory() {
        let browser = MockBrowser::new();
        let err = with_retry(&browser, "Scroll", fast(2, false), || async {
            Err::<(), _>(BridgeError::WebDriver("boom".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Scroll failed: WebDriver command failed: boom");
        assert!(err.memory().unwrap().contains("Refresh state and retry"));
    }

    #[tokio::test]
    async fn element_gone_is_not_retried() {
        let browser = MockBrowser::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = with_retry(&browser, "Click", fast(3, false), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BridgeError::element_gone(4))
        })
        .await
        .unwrap_err();
        assert!(err.is_element_gone());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inner_operation_errors_are_not_rewrapped() {
        let browser = MockBrowser::new();
        let err = with_retry(&browser, "ScrollToTextEvent", fast(2, false), || async {
            Err::<(), _>(BridgeError::Operation {
                message: "Text 'x' not found on page".into(),
                memory: "Text 'x' was not found while scrolling.".into(),
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Text 'x' not found on page");
    }

    #[tokio::test]
    async fn dead_channel_short_circuits() {
        let browser = MockBrowser::new();
        browser.set_alive(false);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = with_retry(&browser, "Navigate", fast(3, true), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no longer alive"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mutable_state_is_threaded_through_attempts() {
        let browser = MockBrowser::new();
        let mut counter = 0u32;
        let result = with_retry_mut(&browser, &mut counter, "Count", fast(3, false), |count| {
            Box::pin(async move {
                *count += 1;
                if *count < 3 {
                    Err(BridgeError::Timeout("again".into()))
                } else {
                    Ok(*count)
                }
            })
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(counter, 3);
    }
}
