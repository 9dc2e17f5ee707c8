//! The per-transaction state machine: owns its rolling digest and
//! exclusively owns its session for the duration of the transaction.
//! `Transaction` itself is the internal orchestrator; closures passed to
//! `Driver::execute` see it only through the narrower [`TxnExecutor`] view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::codec::{Value, ValueCodec};
use crate::digest::TransactionDigest;
use crate::error::{DriverError, DriverErrorKind};
use crate::reader::{LedgerResult, StreamingResult};
use crate::session::ManagedSession;
use crate::transport::LedgerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    Aborted,
    Closed,
}

/// Owns one server-side transaction: the session it runs on, the rolling
/// digest of everything executed so far, and the open/committed/aborted/
/// closed state machine.
pub struct Transaction {
    transport: Arc<dyn LedgerTransport>,
    codec: Arc<dyn ValueCodec>,
    session: Option<ManagedSession>,
    transaction_id: String,
    digest: TransactionDigest,
    state: State,
    read_ahead: usize,
    result_parent_closed: Arc<AtomicBool>,
}

impl Transaction {
    pub(crate) async fn begin(
        transport: Arc<dyn LedgerTransport>,
        codec: Arc<dyn ValueCodec>,
        session: ManagedSession,
        read_ahead: usize,
    ) -> Result<Self, (ManagedSession, DriverError)> {
        let resp = match transport.start_transaction(session.token()).await {
            Ok(resp) => resp,
            Err(e) => return Err((session, DriverError::from(e))),
        };
        let digest = TransactionDigest::new(&resp.transaction_id);
        Ok(Transaction {
            transport,
            codec,
            session: Some(session),
            transaction_id: resp.transaction_id,
            digest,
            state: State::Open,
            read_ahead,
            result_parent_closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    fn session(&self) -> Result<&ManagedSession, DriverError> {
        self.session
            .as_ref()
            .ok_or_else(|| DriverError::new(DriverErrorKind::TxnClosed, "transaction is closed"))
    }

    fn require_open(&self) -> Result<(), DriverError> {
        if self.state != State::Open {
            return Err(DriverError::new(DriverErrorKind::TxnClosed, "transaction is closed")
                .with_transaction_id(self.transaction_id.clone()));
        }
        Ok(())
    }

    /// Sends an execute command, advances the rolling digest, and returns a
    /// streaming result over the first page.
    pub async fn execute(
        &mut self,
        statement: &str,
        parameters: &[Value],
    ) -> Result<LedgerResult, DriverError> {
        self.require_open()?;

        let mut encoded = Vec::with_capacity(parameters.len());
        for p in parameters {
            encoded.push(self.codec.encode(p)?);
        }

        let token = self.session()?.token().to_string();
        let resp = self
            .transport
            .execute_statement(&token, &self.transaction_id, statement, &encoded)
            .await
            .map_err(|e| self.classify_and_maybe_close(e.into()))?;

        self.digest.update(statement, &encoded);

        let result = StreamingResult::new(
            self.transport.clone(),
            token,
            self.transaction_id.clone(),
            self.codec.clone(),
            resp.first_page,
            resp.stats,
            self.read_ahead,
            self.result_parent_closed.clone(),
        )?;

        Ok(LedgerResult::Streaming(result))
    }

    /// Sends a commit command carrying the current rolling digest. Fails
    /// with `DigestMismatch` if the server's reported commit digest
    /// disagrees; on any commit failure, best-effort aborts before
    /// propagating.
    pub async fn commit(&mut self) -> Result<(), DriverError> {
        self.require_open()?;
        let token = self.session()?.token().to_string();
        let local_digest = self.digest.current();

        match self
            .transport
            .commit_transaction(&token, &self.transaction_id, local_digest)
            .await
        {
            Ok(resp) => {
                if resp.commit_digest != local_digest {
                    self.close_session();
                    self.state = State::Closed;
                    return Err(DriverError::new(
                        DriverErrorKind::DigestMismatch,
                        "server commit digest does not match the client's rolling digest",
                    )
                    .with_transaction_id(self.transaction_id.clone()));
                }
                self.state = State::Committed;
                self.mark_results_inactive();
                Ok(())
            }
            Err(e) => {
                let err = self.classify_and_maybe_close(e.into());
                self.no_throw_abort().await;
                Err(err)
            }
        }
    }

    /// Sends an abort command. Idempotent: a no-op if already closed.
    /// Session-invalid during abort closes the session and propagates;
    /// other transport errors are logged and swallowed since the caller's
    /// original error (if any) is the primary signal.
    pub async fn abort(&mut self) -> Result<(), DriverError> {
        if self.state != State::Open {
            return Ok(());
        }
        let token = match self.session() {
            Ok(s) => s.token().to_string(),
            Err(_) => return Ok(()),
        };
        let result = self.transport.abort_transaction(&token, &self.transaction_id).await;
        self.state = State::Aborted;
        self.mark_results_inactive();
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = DriverError::from(e);
                if err.is_session_invalid() {
                    self.close_session();
                    Err(err)
                } else {
                    warn!(transaction_id = %self.transaction_id, error = %err, "abort failed, swallowing");
                    Ok(())
                }
            }
        }
    }

    /// Best-effort abort used by the execute-loop's error path: swallows
    /// everything except session-invalid, and never overwrites the
    /// caller's original error.
    pub(crate) async fn no_throw_abort(&mut self) {
        if self.state != State::Open {
            return;
        }
        if let Err(e) = self.abort().await {
            trace!(transaction_id = %self.transaction_id, error = %e, "no_throw_abort observed an error");
        }
    }

    fn classify_and_maybe_close(&mut self, err: DriverError) -> DriverError {
        if err.is_session_invalid() {
            self.close_session();
            self.state = State::Closed;
        }
        err
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.mark_invalid();
        }
    }

    fn mark_results_inactive(&self) {
        self.result_parent_closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_session_alive(&self) -> bool {
        self.session.as_ref().map(|s| s.is_valid()).unwrap_or(false)
    }

    /// Hands the owned session back to the caller once the transaction has
    /// reached a terminal state. The execute-loop uses this to decide
    /// release vs. discard without the `Transaction` itself knowing
    /// anything about the pool.
    pub(crate) fn take_session(&mut self) -> Option<ManagedSession> {
        self.session.take()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.mark_results_inactive();
    }
}

/// The narrow view a user closure receives. Deliberately does not expose
/// `commit` — the execute-loop alone decides when to commit, after the
/// closure returns successfully.
///
/// Wraps a shared, lock-protected handle to the `Transaction` rather than
/// borrowing it: a user closure that captures and clones its `TxnExecutor`
/// (e.g. to call it from a spawned task) needs an owned handle, not a
/// borrow tied to one stack frame.
#[derive(Clone)]
pub struct TxnExecutor {
    txn: Arc<Mutex<Transaction>>,
}

impl TxnExecutor {
    pub(crate) fn new(txn: Arc<Mutex<Transaction>>) -> Self {
        TxnExecutor { txn }
    }

    pub async fn execute(&self, statement: &str, parameters: &[Value]) -> Result<LedgerResult, DriverError> {
        self.txn.lock().await.execute(statement, parameters).await
    }

    pub async fn abort(&self) -> Result<(), DriverError> {
        let mut txn = self.txn.lock().await;
        match txn.abort().await {
            Ok(()) => Err(DriverError::new(DriverErrorKind::Aborted, "transaction aborted by closure")
                .with_transaction_id(txn.transaction_id.clone())),
            Err(e) => Err(e),
        }
    }

    pub async fn transaction_id(&self) -> String {
        self.txn.lock().await.transaction_id().to_string()
    }
}
