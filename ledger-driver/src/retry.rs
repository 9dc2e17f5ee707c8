//! Execute-loop retry/classification glue: instantiates `ledger_retry`'s
//! generic policy objects with the driver's own error taxonomy, and
//! tracks the retry-budget `attempt` counter the loop needs. The
//! mandatory, budget-exempt first retry after a dead session is tracked on
//! a separate counter so it never inflates `attempt` or the one passed to
//! `policy.backoff()`.

use std::time::Duration;

use ledger_retry::{RetryContext, RetryPolicy};

use crate::error::{DriverError, DriverErrorKind};

pub type DriverRetryContext = RetryContext<DriverErrorKind>;
pub type DriverRetryPolicy = RetryPolicy<DriverErrorKind>;

/// What the execute-loop should do after an attempt failed.
pub(crate) enum Decision {
    /// The session that failed was dead on the very first attempt; retry
    /// at once with a freshly created session, without touching the
    /// policy's retry budget.
    RetryImmediately,
    /// Sleep `duration`, then retry. `replace_session` is set when the
    /// failed session must not be reused (it's dead or its health is now
    /// unknown, e.g. after a commit whose outcome is ambiguous).
    Retry {
        duration: Duration,
        replace_session: bool,
    },
    /// Surface the error to the caller; no further attempts.
    Propagate,
}

/// Per-call retry bookkeeping for one `execute` invocation. Not `Clone` —
/// exactly one `RetryState` exists per in-flight call.
pub(crate) struct RetryState<'a> {
    policy: &'a DriverRetryPolicy,
    /// Counts only attempts that consume the policy's retry budget. Never
    /// incremented by the mandatory first-attempt dead-session retry.
    attempt: u32,
    /// Whether the mandatory, budget-exempt free retry has already been
    /// granted. It is only ever available once, on the very first failure.
    free_retry_used: bool,
}

impl<'a> RetryState<'a> {
    pub fn new(policy: &'a DriverRetryPolicy) -> Self {
        RetryState {
            policy,
            attempt: 0,
            free_retry_used: false,
        }
    }

    /// Classifies `err` and decides whether/how to retry. Mutates internal
    /// bookkeeping; call once per failed attempt, in order.
    pub fn on_error(&mut self, err: &DriverError) -> Decision {
        if err.is_session_invalid() && self.attempt == 0 && !self.free_retry_used {
            self.free_retry_used = true;
            return Decision::RetryImmediately;
        }

        self.attempt += 1;

        if !err.retryable() || self.attempt > self.policy.max_retries {
            return Decision::Propagate;
        }

        let ctx = DriverRetryContext {
            attempt: self.attempt,
            last_exception_kind: err.kind,
            transaction_id: err.transaction_id.clone(),
        };
        let duration = self.policy.backoff(&ctx);
        Decision::Retry {
            duration,
            replace_session: err.session_dead(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: DriverErrorKind) -> DriverError {
        DriverError::new(kind, "test")
    }

    #[test]
    fn first_session_invalid_is_free() {
        let policy = DriverRetryPolicy::new(0, |_ctx| Duration::ZERO);
        let mut state = RetryState::new(&policy);
        match state.on_error(&err(DriverErrorKind::SessionInvalid)) {
            Decision::RetryImmediately => {}
            _ => panic!("expected the mandatory free retry"),
        }
    }

    #[test]
    fn max_retries_zero_still_propagates_non_session_errors() {
        let policy = DriverRetryPolicy::new(0, |_ctx| Duration::ZERO);
        let mut state = RetryState::new(&policy);
        match state.on_error(&err(DriverErrorKind::OccConflict)) {
            Decision::Propagate => {}
            _ => panic!("max_retries=0 must not retry a non-dead-session error"),
        }
    }

    #[test]
    fn retry_bound_is_max_retries_plus_two() {
        let policy = DriverRetryPolicy::new(3, |_ctx| Duration::ZERO);
        let mut state = RetryState::new(&policy);

        // Mandatory free retry: dead session on the first failure, doesn't
        // touch the policy's retry budget.
        assert!(matches!(
            state.on_error(&err(DriverErrorKind::SessionInvalid)),
            Decision::RetryImmediately
        ));
        // Three retries against the policy budget (attempt 1..=3).
        for _ in 0..3 {
            assert!(matches!(
                state.on_error(&err(DriverErrorKind::OccConflict)),
                Decision::Retry { .. }
            ));
        }
        // A fourth budget-consuming attempt exceeds max_retries.
        assert!(matches!(
            state.on_error(&err(DriverErrorKind::OccConflict)),
            Decision::Propagate
        ));
    }

    #[test]
    fn free_retry_does_not_inflate_ctx_attempt() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let policy = DriverRetryPolicy::new(2, move |ctx| {
            seen_clone.lock().unwrap().push(ctx.attempt);
            Duration::ZERO
        });
        let mut state = RetryState::new(&policy);

        assert!(matches!(
            state.on_error(&err(DriverErrorKind::SessionInvalid)),
            Decision::RetryImmediately
        ));
        assert!(matches!(
            state.on_error(&err(DriverErrorKind::OccConflict)),
            Decision::Retry { .. }
        ));

        // The free retry must not have advanced the budget counter that
        // `RetryContext::attempt` reports to the policy's backoff function.
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn free_retry_only_applies_to_the_very_first_failure() {
        let policy = DriverRetryPolicy::new(2, |_ctx| Duration::ZERO);
        let mut state = RetryState::new(&policy);

        // First failure consumes one of the policy's two budgeted retries.
        assert!(matches!(
            state.on_error(&err(DriverErrorKind::OccConflict)),
            Decision::Retry { .. }
        ));
        // A session-invalid failure on a later attempt is not the
        // mandatory free retry (that only applies to the very first
        // failure) and must be classified — and budgeted — normally.
        assert!(matches!(
            state.on_error(&err(DriverErrorKind::SessionInvalid)),
            Decision::Retry { .. }
        ));
        // Budget now exhausted.
        assert!(matches!(
            state.on_error(&err(DriverErrorKind::OccConflict)),
            Decision::Propagate
        ));
    }

    #[test]
    fn non_retryable_error_propagates_immediately() {
        let policy = DriverRetryPolicy::new(5, |_ctx| Duration::ZERO);
        let mut state = RetryState::new(&policy);
        assert!(matches!(
            state.on_error(&err(DriverErrorKind::BadRequest)),
            Decision::Propagate
        ));
    }
}
