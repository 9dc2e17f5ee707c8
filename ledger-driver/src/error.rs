//! Layered error taxonomy: a low-level error per module seam, all funneled
//! into the top-level [`DriverError`] the execute-loop classifies against.

use thiserror::Error;

use crate::codec::CodecError;
use crate::reader::ResultError;
use crate::transport::{TransportError, TransportErrorKind};

/// The error taxonomy, with its retry/session-dead semantics attached as
/// accessor methods rather than scattered through the execute-loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    SessionInvalid,
    OccConflict,
    CapacityExceeded,
    TransientTransport,
    ServerRetryable,
    BadRequest,
    DigestMismatch,
    TxnClosed,
    DriverClosed,
    NoSessionAvailable,
    IncorrectType,
    Aborted,
    Interrupted,
}

impl DriverErrorKind {
    pub fn retryable(self) -> bool {
        use DriverErrorKind::*;
        matches!(
            self,
            SessionInvalid | OccConflict | CapacityExceeded | TransientTransport | ServerRetryable
        )
    }

    pub fn session_dead(self) -> bool {
        matches!(self, DriverErrorKind::SessionInvalid | DriverErrorKind::DigestMismatch)
    }

    pub fn is_session_invalid(self) -> bool {
        matches!(self, DriverErrorKind::SessionInvalid)
    }
}

/// The user-visible error type. Carries enough classification for the
/// execute-loop to decide retry vs propagate without re-deriving it from a
/// `source` chain.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub message: String,
    pub transaction_id: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        DriverError {
            kind,
            message: message.into(),
            transaction_id: None,
            source: None,
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn session_dead(&self) -> bool {
        self.kind.session_dead()
    }

    pub fn is_session_invalid(&self) -> bool {
        self.kind.is_session_invalid()
    }
}

impl From<TransportError> for DriverError {
    fn from(e: TransportError) -> Self {
        let kind = match e.kind {
            TransportErrorKind::SessionInvalid => DriverErrorKind::SessionInvalid,
            TransportErrorKind::OccConflict => DriverErrorKind::OccConflict,
            TransportErrorKind::CapacityExceeded => DriverErrorKind::CapacityExceeded,
            TransportErrorKind::TransientTransport => DriverErrorKind::TransientTransport,
            TransportErrorKind::ServerRetryable => DriverErrorKind::ServerRetryable,
            TransportErrorKind::BadRequest => DriverErrorKind::BadRequest,
        };
        DriverError::new(kind, e.message)
    }
}

impl From<CodecError> for DriverError {
    fn from(e: CodecError) -> Self {
        DriverError::new(DriverErrorKind::IncorrectType, e.to_string())
    }
}

/// Unwraps a result-iteration failure down to the same taxonomy the
/// execute-loop classifies everything else against. A `ResultError` that
/// already wraps a `DriverError` (the common case: the read-ahead worker or
/// a synchronous page fetch hit a transport error) passes it through
/// unchanged so its `kind`/`retryable`/`transaction_id` survive.
impl From<ResultError> for DriverError {
    fn from(e: ResultError) -> Self {
        let message = e.to_string();
        match e {
            ResultError::Driver(driver_err) => driver_err,
            ResultError::AlreadyIterated | ResultError::IterationExhausted => {
                DriverError::new(DriverErrorKind::BadRequest, message)
            }
            ResultError::ResultParentInactive => DriverError::new(DriverErrorKind::TxnClosed, message),
        }
    }
}

/// Errors raised purely by session-pool bookkeeping, before any
/// transaction exists to attach a `transaction_id` to.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session became available within the acquisition timeout")]
    NoSessionAvailable,
    #[error("driver is closed")]
    DriverClosed,
    #[error("transport error while managing a session: {0}")]
    Transport(#[from] TransportError),
}

impl From<SessionError> for DriverError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NoSessionAvailable => {
                DriverError::new(DriverErrorKind::NoSessionAvailable, e.to_string())
            }
            SessionError::DriverClosed => DriverError::new(DriverErrorKind::DriverClosed, e.to_string()),
            SessionError::Transport(t) => DriverError::from(t),
        }
    }
}
