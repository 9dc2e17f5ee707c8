//! Retry-policy boundary objects shared by `ledger-driver`.
//!
//! This crate has no knowledge of the ledger's own error taxonomy; it only
//! provides the generic shapes (`Backoff`, `RetryPolicy`, `RetryContext`)
//! that the driver's execute-loop plugs its own error-kind enum into.

mod backoff;
mod policy;

pub use backoff::Backoff;
pub use policy::{RetryContext, RetryPolicy};
