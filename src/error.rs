//! Error types for the ledger harness

use crate::ledger::LedgerError;
use crate::tx::Role;
use crate::types::{Address, KeyId, TransactionId};

use thiserror::Error;

/// Failures while linking contract sources or ordering a deployment
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Unresolved placeholder {placeholder}: no binding supplied")]
    UnresolvedPlaceholder { placeholder: String },

    #[error("Binding {binding} does not match any placeholder in the template")]
    UnusedBinding { binding: String },

    #[error("Binding {slot} has kind {found}, template expects {expected}")]
    BindingTypeMismatch {
        slot: String,
        expected: String,
        found: String,
    },

    #[error("Malformed template at byte {position}: {message}")]
    MalformedTemplate { position: usize, message: String },

    #[error("Cyclic dependency between contracts: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Contract {contract} depends on unknown contract {dependency}")]
    UnknownDependency { contract: String, dependency: String },

    #[error("Contract {0} is declared more than once")]
    DuplicateContract(String),
}

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Missing required field: {field}")]
    MissingRequiredField { field: &'static str },

    #[error("Authorizer {address} listed more than once")]
    DuplicateAuthorizer { address: Address },

    #[error("Incomplete signatures: no signer available for {role} {address}")]
    IncompleteSignatures { role: Role, address: Address },

    #[error("Sequence conflict for key {key}: ledger expects {expected}, transaction used {provided}")]
    SequenceConflict {
        key: KeyId,
        expected: u64,
        provided: u64,
    },

    #[error("Sequence numbers exhausted for key {key} after {attempts} attempts")]
    SequenceExhausted { key: KeyId, attempts: u32 },

    #[error("Transaction rejected by ledger: {reason}")]
    Submission { reason: String },

    #[error("Signer error for key {key}: {message}")]
    Signer { key: KeyId, message: String },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Deployment of contract {contract} failed: {source}")]
    Deployment {
        contract: String,
        source: Box<HarnessError>,
    },

    #[error("Transaction {id} failed: {reason}")]
    TransactionFailed { id: TransactionId, reason: String },

    #[error("Transaction {id} expired before inclusion")]
    TransactionExpired { id: TransactionId },

    #[error("Transaction {id} outcome unknown, reconcile with a ledger query")]
    OutcomeUnknown { id: TransactionId },

    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Check if error is retryable.
    ///
    /// Only sequence conflicts are; they are recovered by resyncing the allocator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarnessError::SequenceConflict { .. })
    }

    /// Check if error came from linking sources or ordering contracts
    pub fn is_link_error(&self) -> bool {
        match self {
            HarnessError::Link(_) => true,
            HarnessError::Deployment { source, .. } => source.is_link_error(),
            _ => false,
        }
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_sequence_conflicts_are_retryable() {
        let key = KeyId::new(Address::from_index(1), 0);
        let conflict = HarnessError::SequenceConflict {
            key,
            expected: 4,
            provided: 3,
        };
        assert!(conflict.is_retryable());

        let rejected = HarnessError::Submission {
            reason: "insufficient storage".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(!HarnessError::SequenceExhausted { key, attempts: 3 }.is_retryable());
    }

    #[test]
    fn test_cycle_message_lists_members() {
        let err = LinkError::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency between contracts: A -> B -> A");
    }
}
