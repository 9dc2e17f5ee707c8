//! The driver facade: build-time configuration and the public entry
//! points (`execute`, `get_table_names`) that tie the session pool,
//! transaction state machine, result paging, and retry policy together.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::codec::{DefaultValueCodec, Value, ValueCodec};
use crate::error::{DriverError, DriverErrorKind};
use crate::reader::LedgerResult;
use crate::retry::{Decision, DriverRetryPolicy, RetryState};
use crate::session::{ManagedSession, SessionConfig, SessionManager, SessionPool};
use crate::transaction::{Transaction, TxnExecutor};
use crate::transaction_manager::TransactionManager;
use crate::transport::LedgerTransport;

/// The fixed convenience query behind [`Driver::get_table_names`].
const TABLE_NAMES_STATEMENT: &str =
    "SELECT VALUE name FROM information_schema.user_tables WHERE status = 'ACTIVE'";

/// Build-time configuration for a [`Driver`]: pool sizing and timeouts live
/// in `pool`, everything else is flat. All fields but `pool` and
/// `read_ahead` are required, so construction goes through
/// [`DriverConfig::new`] rather than `Default`.
pub struct DriverConfig {
    pub ledger_name: String,
    pub transport: Arc<dyn LedgerTransport>,
    pub codec: Arc<dyn ValueCodec>,
    pub retry_policy: DriverRetryPolicy,
    /// Read-ahead depth for streaming results; `0` (the default) fetches
    /// pages synchronously on demand.
    pub read_ahead: usize,
    pub pool: SessionConfig,
}

impl DriverConfig {
    /// Starts from the documented defaults: up to 4 retries with an
    /// exponential-jitter backoff envelope, the built-in tagged-binary
    /// codec, synchronous paging, and `SessionConfig::default()`'s pool
    /// sizing.
    pub fn new(ledger_name: impl Into<String>, transport: Arc<dyn LedgerTransport>) -> Self {
        DriverConfig {
            ledger_name: ledger_name.into(),
            transport,
            codec: Arc::new(DefaultValueCodec),
            retry_policy: DriverRetryPolicy::default(),
            read_ahead: 0,
            pool: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InitializeError {
    #[error("ledger name must not be empty")]
    EmptyLedgerName,
}

/// The public entry point for running transactions against one ledger.
/// Safe to share across many tasks (`Arc<Driver>` is the expected shape);
/// `close` is the one operation that should not race with in-flight
/// `execute` calls.
pub struct Driver {
    codec: Arc<dyn ValueCodec>,
    transport: Arc<dyn LedgerTransport>,
    sessions: SessionManager,
    default_policy: DriverRetryPolicy,
    read_ahead: usize,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Result<Self, InitializeError> {
        if config.ledger_name.trim().is_empty() {
            return Err(InitializeError::EmptyLedgerName);
        }
        let pool = SessionPool::new(config.transport.clone(), config.ledger_name, config.pool);
        let sessions = SessionManager::new(pool);
        Ok(Driver {
            codec: config.codec,
            transport: config.transport,
            sessions,
            default_policy: config.retry_policy,
            read_ahead: config.read_ahead,
        })
    }

    /// Closes the driver: further `execute` calls fail with `DriverClosed`,
    /// and every idle pool session is ended. In-flight transactions are
    /// left to finish; their sessions are ended as they're individually
    /// released.
    pub async fn close(&self) {
        self.sessions.close().await;
    }

    /// Runs `closure` in a transaction using the driver's default retry
    /// policy. See [`Driver::execute_with_policy`] for the full algorithm.
    pub async fn execute<T, F, Fut>(&self, closure: F) -> Result<T, DriverError>
    where
        F: Fn(TxnExecutor) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        self.execute_with_policy(closure, &self.default_policy).await
    }

    /// Acquires a session and a permit, starts a transaction, runs
    /// `closure`, and commits. Classifies any failure into
    /// retry/propagate/rotate-session per `policy`, with a mandatory,
    /// budget-exempt first retry after a dead session — idle pool sessions
    /// can expire silently, and a caller must not see a transient failure
    /// on the first request after a period of inactivity.
    ///
    /// `closure` may run more than once, so it must be free of side
    /// effects on its environment. The driver guarantees at most one
    /// successful commit across all attempts, no leaked session permit,
    /// and every transaction it starts is either committed or aborted
    /// before `execute_with_policy` returns.
    pub async fn execute_with_policy<T, F, Fut>(&self, closure: F, policy: &DriverRetryPolicy) -> Result<T, DriverError>
    where
        F: Fn(TxnExecutor) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let mut retry = RetryState::new(policy);
        let mut replace_session = false;

        loop {
            let session = self.acquire_session(replace_session).await?;
            replace_session = false;

            match self.run_attempt(session, &closure).await {
                Ok(value) => return Ok(value),
                Err(err) => match retry.on_error(&err) {
                    Decision::RetryImmediately => {
                        trace!(error = %err, "dead session on first attempt, retrying for free");
                        replace_session = true;
                    }
                    Decision::Retry {
                        duration,
                        replace_session: replace,
                    } => {
                        trace!(error = %err, ?duration, "retrying after backoff");
                        replace_session = replace;
                        if !duration.is_zero() {
                            tokio::time::sleep(duration).await;
                        }
                    }
                    Decision::Propagate => return Err(err),
                },
            }
        }
    }

    /// Runs `closure` against a query statement and returns the fully
    /// buffered rows it produced, committing once the buffer is drained.
    /// This is the dedicated path for the common case the execute-loop's
    /// step 3d describes — a closure that hands back the `LedgerResult` of
    /// a single `txn.execute` call, which must be materialized before
    /// commit since a streaming result cannot outlive its transaction.
    pub async fn execute_query<F, Fut>(&self, closure: F) -> Result<Vec<Value>, DriverError>
    where
        F: Fn(TxnExecutor) -> Fut,
        Fut: Future<Output = Result<LedgerResult, DriverError>>,
    {
        self.execute(move |executor| {
            let closure = &closure;
            async move {
                let result = closure(executor).await?;
                result.buffer().await.map_err(DriverError::from)
            }
        })
        .await
    }

    /// Runs the fixed table-enumeration query and decodes every returned
    /// value as a string, failing with `IncorrectType` on the first value
    /// that isn't one.
    pub async fn get_table_names(&self) -> Result<Vec<String>, DriverError> {
        let values = self
            .execute_query(|executor| async move { executor.execute(TABLE_NAMES_STATEMENT, &[]).await })
            .await?;

        values
            .into_iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    DriverError::new(DriverErrorKind::IncorrectType, "table name value was not a string")
                })
            })
            .collect()
    }

    /// Hands out a session for a caller-driven manual retry loop via
    /// `TransactionManager`, reusing the session across `begin_transaction`
    /// calls the way the pooled execute-loop reuses a session across
    /// retries of the same attempt.
    pub async fn transaction_manager(&self) -> Result<TransactionManager, DriverError> {
        let session = self.sessions.pool().acquire().await?;
        Ok(TransactionManager::new(
            self.transport.clone(),
            self.codec.clone(),
            session,
            self.read_ahead,
        ))
    }

    async fn acquire_session(&self, fresh: bool) -> Result<ManagedSession, DriverError> {
        let session = if fresh {
            self.sessions.pool().acquire_fresh().await
        } else {
            self.sessions.pool().acquire().await
        };
        Ok(session?)
    }

    /// Runs exactly one attempt: begin a transaction on `session`, hand it
    /// to `closure`, commit. Every exit path — success, closure error,
    /// commit error — releases or discards the session depending on
    /// whether it's still believed alive, so a permit is never leaked
    /// regardless of where in the attempt the failure happened.
    async fn run_attempt<T, F, Fut>(&self, session: ManagedSession, closure: &F) -> Result<T, DriverError>
    where
        F: Fn(TxnExecutor) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let txn = match Transaction::begin(self.transport.clone(), self.codec.clone(), session, self.read_ahead).await
        {
            Ok(txn) => txn,
            Err((mut session, err)) => {
                // `start_transaction` never ran to completion, so there is
                // no `Transaction` around to close the session on our
                // behalf — do it here so a session the server just told us
                // is dead never goes back to the idle FIFO.
                if err.is_session_invalid() {
                    session.mark_invalid();
                }
                drop(session);
                return Err(err);
            }
        };

        let txn = Arc::new(Mutex::new(txn));
        let executor = TxnExecutor::new(txn.clone());
        let outcome = closure(executor).await;

        let mut guard = txn.lock().await;
        let result = match outcome {
            Ok(value) => guard.commit().await.map(|()| value),
            Err(closure_err) => {
                guard.no_throw_abort().await;
                Err(closure_err)
            }
        };
        let leftover_session = guard.take_session();
        drop(guard);
        // `ManagedSession::drop` releases the session to the pool if still
        // valid, or discards it (without calling `end_session`) otherwise,
        // regardless of which branch above ran.
        drop(leftover_session);

        result
    }
}
