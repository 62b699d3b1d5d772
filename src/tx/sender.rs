//! Transaction sender with sequence-conflict recovery
//!
//! Every attempt takes a fresh reservation, anchors to the latest block,
//! signs, and submits. A sequence conflict releases the reservation,
//! resyncs the key, and retries with backoff; any other failure is final.

use super::builder::{Transaction, TransactionBuilder};
use super::sequence::{ReleaseReason, Reservation, SequenceNumberAllocator};
use super::signing::SigningCoordinator;
use super::submission::{SubmissionClient, SubmissionHandle};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::ledger::LedgerClient;
use crate::link::ResolvedScript;
use crate::signer::Signer;
use crate::types::{Address, BlockId, KeyId, Value};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything needed to build a transaction except its sequence number and anchor
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub script: ResolvedScript,
    pub arguments: Vec<Value>,
    pub proposer: KeyId,
    pub payer: Address,
    pub authorizers: Vec<Address>,
    pub gas_limit: u64,
    pub required_authorizers: usize,
}

impl TransactionRequest {
    fn builder(&self, sequence_number: u64, reference_block: BlockId) -> TransactionBuilder {
        TransactionBuilder::new(self.script.clone())
            .arguments(self.arguments.iter().cloned())
            .proposer(self.proposer, sequence_number)
            .payer(self.payer)
            .authorizers(self.authorizers.iter().copied())
            .gas_limit(self.gas_limit)
            .require_authorizers(self.required_authorizers)
            .reference_block(reference_block)
    }

    /// Build with placeholder sequence and anchor to surface shape errors early
    fn probe(&self) -> HarnessResult<Transaction> {
        self.builder(0, BlockId::default()).build()
    }
}

/// Accepted submission and the reservation it consumed
#[derive(Debug, Clone)]
pub struct Submission {
    pub handle: SubmissionHandle,
    pub reservation: Reservation,
    /// Attempts made, including the accepted one
    pub attempts: u32,
}

impl Submission {
    /// Sequence conflicts recovered on the way
    pub fn resyncs(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Sends transactions for any proposal key
pub struct TransactionSender {
    ledger: Arc<dyn LedgerClient>,
    allocator: Arc<SequenceNumberAllocator>,
    signer: Arc<dyn Signer>,
    submission: Arc<SubmissionClient>,
    config: HarnessConfig,
}

impl TransactionSender {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        allocator: Arc<SequenceNumberAllocator>,
        signer: Arc<dyn Signer>,
        submission: Arc<SubmissionClient>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            ledger,
            allocator,
            signer,
            submission,
            config,
        }
    }

    /// Send with conflict recovery, up to `max_sequence_attempts` attempts
    pub async fn send(&self, request: &TransactionRequest) -> HarnessResult<Submission> {
        // Shape and signer coverage are checked before any reservation is taken
        let probe = request.probe()?;
        SigningCoordinator::plan(&probe, self.signer.as_ref())?;

        let max_attempts = self.config.max_sequence_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.resync_backoff_ms);

        for attempt in 1..=max_attempts {
            let reservation = self.allocator.allocate(request.proposer).await?;

            match self.try_send(request, &reservation).await {
                Ok(handle) => {
                    self.allocator.mark_submitted(&reservation, handle.id).await;
                    info!(
                        "Transaction {} sent with sequence {} (attempt {}/{})",
                        handle.id, reservation.sequence_number, attempt, max_attempts
                    );
                    return Ok(Submission {
                        handle,
                        reservation,
                        attempts: attempt,
                    });
                }
                Err(HarnessError::SequenceConflict {
                    key,
                    expected,
                    provided,
                }) => {
                    warn!(
                        "Sequence conflict for key {} (attempt {}/{}): ledger expects {}, used {}",
                        key, attempt, max_attempts, expected, provided
                    );
                    self.allocator
                        .release(&reservation, ReleaseReason::SequenceConflict)
                        .await;

                    if attempt < max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        self.allocator.resync(key).await?;
                    }
                }
                Err(e @ HarnessError::Submission { .. }) => {
                    self.allocator
                        .release(&reservation, ReleaseReason::Rejected)
                        .await;
                    return Err(e);
                }
                Err(e) => {
                    self.allocator
                        .release(&reservation, ReleaseReason::Unsent)
                        .await;
                    return Err(e);
                }
            }
        }

        Err(HarnessError::SequenceExhausted {
            key: request.proposer,
            attempts: max_attempts,
        })
    }

    async fn try_send(
        &self,
        request: &TransactionRequest,
        reservation: &Reservation,
    ) -> HarnessResult<SubmissionHandle> {
        let anchor = self.ledger.latest_block().await?;
        let tx = request
            .builder(reservation.sequence_number, anchor.id)
            .build()?;
        debug!(
            "Built transaction for key {} at sequence {}, anchored to block {}",
            reservation.key, reservation.sequence_number, anchor.height
        );

        let signed = SigningCoordinator::sign(tx, self.signer.as_ref()).await?;
        self.submission.submit(&signed).await
    }
}
