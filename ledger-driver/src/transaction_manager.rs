//! A manual-retry-loop API: callers who want to drive their own retry
//! loop — inspecting intermediate state between attempts, or implementing
//! a retry policy the boundary object in `ledger-retry` can't express —
//! still get session-reuse-across-attempts behavior without going through
//! [`crate::client::Driver::execute`].
//!
//! A session is held across `begin_transaction` calls, and on a failed
//! `begin` the session is handed back so the next attempt doesn't have to
//! fetch a new one.

use std::sync::Arc;

use crate::codec::ValueCodec;
use crate::error::DriverError;
use crate::session::ManagedSession;
use crate::transaction::Transaction;
use crate::transport::LedgerTransport;

/// Holds one session and, once `begin_transaction` has been called, the
/// transaction currently running on it. Unlike [`crate::client::Driver::execute`],
/// nothing here classifies errors or retries automatically — the caller
/// drives that loop itself and calls `begin_transaction` again after
/// handling a failure.
pub struct TransactionManager {
    transport: Arc<dyn LedgerTransport>,
    codec: Arc<dyn ValueCodec>,
    read_ahead: usize,
    session: Option<ManagedSession>,
    transaction: Option<Transaction>,
}

impl TransactionManager {
    pub(crate) fn new(
        transport: Arc<dyn LedgerTransport>,
        codec: Arc<dyn ValueCodec>,
        session: ManagedSession,
        read_ahead: usize,
    ) -> Self {
        TransactionManager {
            transport,
            codec,
            read_ahead,
            session: Some(session),
            transaction: None,
        }
    }

    /// Returns the currently running transaction, if `begin_transaction`
    /// has been called and the previous one hasn't been replaced yet.
    pub fn transaction(&mut self) -> Option<&mut Transaction> {
        self.transaction.as_mut()
    }

    /// Begins a new transaction, reusing the session of the previous one
    /// (if any) rather than returning it to the pool and fetching another.
    /// This preserves whatever lock priority or session affinity the server
    /// grants a session across attempts.
    ///
    /// The previous transaction, if still open, is left as-is: callers are
    /// expected to have already committed or aborted it before beginning
    /// the next attempt.
    pub async fn begin_transaction(&mut self) -> Result<&mut Transaction, DriverError> {
        let session = if let Some(txn) = self.transaction.as_mut() {
            txn.take_session().expect("transaction should still own its session")
        } else {
            self.session.take().expect("manager should hold a session before the first begin")
        };

        match Transaction::begin(self.transport.clone(), self.codec.clone(), session, self.read_ahead).await {
            Ok(txn) => {
                self.transaction = Some(txn);
                Ok(self.transaction.as_mut().unwrap())
            }
            Err((session, err)) => {
                self.session = Some(session);
                Err(err)
            }
        }
    }
}
