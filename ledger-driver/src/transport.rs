//! The injected RPC boundary. The core never speaks a wire protocol itself;
//! it calls six operations on a [`LedgerTransport`] implementation supplied
//! by the caller — a real network client in production, an in-memory fake
//! in tests.

use async_trait::async_trait;
use thiserror::Error;

/// A single parameter or result value in its wire binary form, already
/// passed through a [`crate::codec::ValueCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedValue(pub Vec<u8>);

/// One page of a (possibly multi-page) result.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub values: Vec<EncodedValue>,
    pub next_page_token: Option<String>,
}

/// Per-call IO/timing figures, when the transport can report them. Folded
/// into a [`crate::reader::ResultStats`] accumulator by the result reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub io_count: u64,
    pub processing: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct StartSessionResponse {
    pub session_token: String,
}

#[derive(Debug, Clone)]
pub struct StartTransactionResponse {
    pub transaction_id: String,
}

#[derive(Debug, Clone)]
pub struct ExecuteStatementResponse {
    pub first_page: Page,
    pub stats: Option<Stats>,
}

#[derive(Debug, Clone)]
pub struct FetchPageResponse {
    pub page: Page,
    pub stats: Option<Stats>,
}

#[derive(Debug, Clone)]
pub struct CommitResponse {
    pub commit_digest: [u8; 32],
}

/// The service-classified shape of a transport failure. `ledger-driver`
/// refines this into its own [`crate::error::DriverErrorKind`] at the
/// execute-loop boundary; the transport layer only needs to say which of
/// these six buckets a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    SessionInvalid,
    OccConflict,
    CapacityExceeded,
    TransientTransport,
    ServerRetryable,
    BadRequest,
}

#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }
}

/// The six operations the core drives. Each is a single request/response;
/// all are `async` from the caller's perspective, and none assumes any
/// particular transport (gRPC, HTTP, an in-process channel for tests, ...).
#[async_trait]
pub trait LedgerTransport: Send + Sync + 'static {
    async fn start_session(&self, ledger_name: &str) -> Result<StartSessionResponse, TransportError>;

    async fn start_transaction(
        &self,
        session_token: &str,
    ) -> Result<StartTransactionResponse, TransportError>;

    async fn execute_statement(
        &self,
        session_token: &str,
        transaction_id: &str,
        statement: &str,
        parameters: &[EncodedValue],
    ) -> Result<ExecuteStatementResponse, TransportError>;

    async fn fetch_page(
        &self,
        session_token: &str,
        transaction_id: &str,
        page_token: &str,
    ) -> Result<FetchPageResponse, TransportError>;

    async fn commit_transaction(
        &self,
        session_token: &str,
        transaction_id: &str,
        commit_digest: [u8; 32],
    ) -> Result<CommitResponse, TransportError>;

    async fn abort_transaction(
        &self,
        session_token: &str,
        transaction_id: &str,
    ) -> Result<(), TransportError>;

    async fn end_session(&self, session_token: &str) -> Result<(), TransportError>;
}
