//! Transaction construction, signing and submission with sequence management

mod builder;
mod sender;
mod sequence;
mod signing;
mod submission;

pub use builder::{
    ProposalKey, Transaction, TransactionBuilder, TransactionSignature, DEFAULT_GAS_LIMIT,
    TRANSACTION_DOMAIN_TAG,
};
pub use sender::{Submission, TransactionRequest, TransactionSender};
pub use sequence::{ReleaseReason, Reservation, SequenceNumberAllocator, SequenceSnapshot};
pub use signing::{Role, SignedTransaction, SignerAssignment, SigningCoordinator, SigningPlan};
pub use submission::{
    ExecutionResult, PollPolicy, SubmissionClient, SubmissionHandle, TransactionOutcome,
    TransactionState,
};
