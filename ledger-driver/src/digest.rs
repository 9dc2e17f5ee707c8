//! The rolling 256-bit transaction digest.
//!
//! `dot` is the commutative fold operator used both between a statement's
//! hash and its folded parameter hash, and between the running digest and
//! each statement's entry hash. The client and server replay the identical
//! sequence of `update` calls, and a mismatch at commit is the only way a
//! `DigestMismatch` is raised.

use sha2::{Digest as _, Sha256};

use crate::transport::EncodedValue;

pub type DigestBytes = [u8; 32];

pub fn h(bytes: &[u8]) -> DigestBytes {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Sorts the two operands lexicographically, concatenates, and hashes the
/// 64 resulting bytes. Commutative in its two inputs.
pub fn dot(a: DigestBytes, b: DigestBytes) -> DigestBytes {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&lo);
    buf[32..].copy_from_slice(&hi);
    h(&buf)
}

/// Per-transaction rolling digest. Starts as `H(transaction_id)`; every
/// executed statement folds in one more entry.
#[derive(Clone, Debug)]
pub struct TransactionDigest {
    current: DigestBytes,
}

impl TransactionDigest {
    pub fn new(transaction_id: &str) -> Self {
        TransactionDigest {
            current: h(transaction_id.as_bytes()),
        }
    }

    /// Folds one more `(statement, parameters)` entry into the digest, in
    /// the exact order `execute` was called.
    pub fn update(&mut self, statement: &str, parameters: &[EncodedValue]) {
        let stmt_hash = h(statement.as_bytes());
        let params_hash = parameters
            .iter()
            .map(|p| h(&p.0))
            .reduce(dot);

        let entry_hash = match params_hash {
            Some(params_hash) => dot(stmt_hash, params_hash),
            None => stmt_hash,
        };

        self.current = dot(self.current, entry_hash);
    }

    pub fn current(&self) -> DigestBytes {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_is_commutative() {
        let a = h(b"a");
        let b = h(b"b");
        assert_eq!(dot(a, b), dot(b, a));
    }

    #[test]
    fn no_params_entry_is_just_the_statement_hash() {
        let mut d = TransactionDigest::new("txn-1");
        let mut expected = h(b"txn-1");
        expected = dot(expected, h(b"SELECT 1"));
        d.update("SELECT 1", &[]);
        assert_eq!(d.current(), expected);
    }

    #[test]
    fn sequence_matters_even_though_dot_does_not() {
        let mut d1 = TransactionDigest::new("txn-1");
        d1.update("INSERT a", &[EncodedValue(vec![1])]);
        d1.update("INSERT b", &[EncodedValue(vec![2])]);

        let mut d2 = TransactionDigest::new("txn-1");
        d2.update("INSERT b", &[EncodedValue(vec![2])]);
        d2.update("INSERT a", &[EncodedValue(vec![1])]);

        assert_ne!(d1.current(), d2.current());
    }

    #[test]
    fn parameter_folding_is_order_independent_within_one_statement() {
        let mut d1 = TransactionDigest::new("txn-1");
        d1.update("INSERT", &[EncodedValue(vec![1]), EncodedValue(vec![2])]);

        let mut d2 = TransactionDigest::new("txn-1");
        d2.update("INSERT", &[EncodedValue(vec![2]), EncodedValue(vec![1])]);

        assert_eq!(d1.current(), d2.current());
    }
}
