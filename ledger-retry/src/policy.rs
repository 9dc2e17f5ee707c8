use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;

/// Snapshot handed to a [`RetryPolicy`]'s backoff function on each retry
/// decision.
///
/// `K` is the caller's error-kind classification (an enum with `Copy` +
/// `fmt::Debug`, typically `DriverErrorKind` in `ledger-driver`). This crate
/// stays agnostic to what that taxonomy actually contains.
#[derive(Clone, Debug)]
pub struct RetryContext<K> {
    /// 1-based attempt number, counting only attempts that consume the
    /// policy's retry budget (the mandatory first dead-session retry is
    /// tracked separately by the execute-loop and never appears here).
    pub attempt: u32,
    pub last_exception_kind: K,
    pub transaction_id: Option<String>,
}

/// A boundary policy object: how many times to retry, and how long to wait
/// between attempts. `backoff` is a capability (boxed closure), not a
/// subclass, so callers can plug in anything from a fixed delay to a full
/// jittered exponential curve.
#[derive(Clone)]
pub struct RetryPolicy<K> {
    pub max_retries: u32,
    backoff: Arc<dyn Fn(&RetryContext<K>) -> Duration + Send + Sync>,
}

impl<K> fmt::Debug for RetryPolicy<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<K> RetryPolicy<K> {
    pub fn new(
        max_retries: u32,
        backoff: impl Fn(&RetryContext<K>) -> Duration + Send + Sync + 'static,
    ) -> Self {
        RetryPolicy {
            max_retries,
            backoff: Arc::new(backoff),
        }
    }

    /// Builds a policy whose backoff function is a shared, mutated
    /// [`Backoff`] envelope: every call advances the same exponential curve
    /// regardless of which attempt it is called for. `parking_lot::Mutex`
    /// would pull in an extra dependency this crate doesn't otherwise need,
    /// so a `std::sync::Mutex` guards the shared envelope here.
    pub fn exponential(max_retries: u32, backoff: Backoff) -> Self
    where
        K: Send + Sync + 'static,
    {
        let envelope = std::sync::Mutex::new(backoff);
        RetryPolicy::new(max_retries, move |_ctx| {
            envelope
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .duration()
                .unwrap_or(Duration::ZERO)
        })
    }

    pub fn backoff(&self, ctx: &RetryContext<K>) -> Duration {
        (self.backoff)(ctx)
    }
}

impl<K> Default for RetryPolicy<K>
where
    K: Send + Sync + 'static,
{
    /// Four retries with the default exponential-jitter backoff envelope.
    fn default() -> Self {
        RetryPolicy::exponential(4, Backoff::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug)]
    enum Kind {
        Transient,
    }

    #[test]
    fn fixed_backoff_ignores_context() {
        let policy = RetryPolicy::new(3, |_ctx| Duration::from_millis(10));
        let ctx = RetryContext {
            attempt: 1,
            last_exception_kind: Kind::Transient,
            transaction_id: None,
        };
        assert_eq!(policy.backoff(&ctx), Duration::from_millis(10));
        assert_eq!(policy.max_retries, 3);
    }

    #[test]
    fn default_allows_four_retries() {
        let policy: RetryPolicy<Kind> = RetryPolicy::default();
        assert_eq!(policy.max_retries, 4);
    }
}
