//! Client-side driver for a server-hosted journaled ledger database.
//!
//! The driver runs caller-supplied transaction closures against a ledger
//! while transparently managing session acquisition, transaction lifecycle
//! (start / execute / commit with digest verification / abort), retry with
//! configurable backoff, dead-session replacement, and a fair bounded
//! session pool. The wire transport and value codec are both injected
//! boundaries — see [`transport::LedgerTransport`] and [`codec::ValueCodec`].
//!
//! The entry point is [`client::Driver`]:
//!
//! ```ignore
//! let transport: std::sync::Arc<dyn transport::LedgerTransport> = todo!();
//! let driver = client::Driver::new(client::DriverConfig::new("my-ledger", transport))?;
//! let rows = driver
//!     .execute_query(|txn| async move { txn.execute("SELECT VALUE 1", &[]).await })
//!     .await?;
//! ```

pub mod client;
pub mod codec;
pub mod digest;
pub mod error;
pub mod reader;
pub mod retry;
pub mod session;
pub mod transaction;
pub mod transaction_manager;
pub mod transport;

pub use client::{Driver, DriverConfig, InitializeError};
pub use codec::{DefaultValueCodec, Value, ValueCodec};
pub use error::{DriverError, DriverErrorKind};
pub use reader::{LedgerResult, ResultError, ResultIterator, ResultStats};
pub use retry::{DriverRetryContext, DriverRetryPolicy};
pub use transaction::{Transaction, TxnExecutor};
pub use transaction_manager::TransactionManager;
pub use transport::LedgerTransport;
