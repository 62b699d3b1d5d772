//! Submission of signed transactions and polling for their outcome

use super::builder::ProposalKey;
use super::signing::SignedTransaction;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::events::LedgerEvent;
use crate::ledger::{LedgerClient, LedgerError, TransactionResult, TransactionStatus};
use crate::types::TransactionId;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Execution result of a sealed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Success {
        events: Vec<LedgerEvent>,
    },
    /// Sealed, but execution failed; the sequence number is still consumed
    Failure {
        reason: String,
        events: Vec<LedgerEvent>,
    },
}

/// Final answer to "what happened to this transaction"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Sealed(ExecutionResult),
    Expired,
    /// No terminal status within the wait, or polling was cancelled
    Unknown,
}

impl TransactionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransactionOutcome::Sealed(ExecutionResult::Success { .. }))
    }

    pub fn events(&self) -> &[LedgerEvent] {
        match self {
            TransactionOutcome::Sealed(ExecutionResult::Success { events })
            | TransactionOutcome::Sealed(ExecutionResult::Failure { events, .. }) => events,
            _ => &[],
        }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            TransactionOutcome::Sealed(ExecutionResult::Success { .. }) => "success",
            TransactionOutcome::Sealed(ExecutionResult::Failure { .. }) => "failure",
            TransactionOutcome::Expired => "expired",
            TransactionOutcome::Unknown => "unknown",
        }
    }
}

/// Lifecycle of a transaction as tracked by the harness
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    Built,
    Signed,
    Submitted,
    Sealed(ExecutionResult),
    Expired,
    Unknown,
}

impl From<TransactionOutcome> for TransactionState {
    fn from(outcome: TransactionOutcome) -> Self {
        match outcome {
            TransactionOutcome::Sealed(result) => TransactionState::Sealed(result),
            TransactionOutcome::Expired => TransactionState::Expired,
            TransactionOutcome::Unknown => TransactionState::Unknown,
        }
    }
}

/// Handle to a submitted transaction
#[derive(Debug, Clone)]
pub struct SubmissionHandle {
    pub id: TransactionId,
    pub proposal_key: ProposalKey,
    pub submitted_at: DateTime<Utc>,
    state: TransactionState,
}

impl SubmissionHandle {
    pub fn state(&self) -> &TransactionState {
        &self.state
    }
}

/// Backoff schedule for status polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_wait: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.poll_initial_interval_ms),
            max_interval: Duration::from_millis(config.poll_max_interval_ms),
            max_wait: Duration::from_secs(config.poll_max_wait_secs),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

/// Submits signed transactions and tracks them to a terminal outcome
pub struct SubmissionClient {
    ledger: Arc<dyn LedgerClient>,
    policy: PollPolicy,
}

impl SubmissionClient {
    pub fn new(ledger: Arc<dyn LedgerClient>, policy: PollPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Hand a signed transaction to the ledger.
    ///
    /// A sequence mismatch becomes [`HarnessError::SequenceConflict`]; any
    /// other rejection is reported with the ledger's reason.
    pub async fn submit(&self, tx: &SignedTransaction) -> HarnessResult<SubmissionHandle> {
        let id = match self.ledger.send_transaction(tx).await {
            Ok(id) => id,
            Err(LedgerError::SequenceMismatch {
                key,
                expected,
                provided,
            }) => {
                crate::metrics::record_sequence_conflict();
                return Err(HarnessError::SequenceConflict {
                    key,
                    expected,
                    provided,
                });
            }
            Err(e) => {
                error!("Ledger rejected transaction from {}: {}", tx.proposal_key.key, e);
                let reason = match e {
                    LedgerError::Rejected(reason) => reason,
                    other => other.to_string(),
                };
                return Err(HarnessError::Submission { reason });
            }
        };

        crate::metrics::record_tx_submitted();
        debug!(
            "Submitted transaction {} (key {}, sequence {})",
            id, tx.proposal_key.key, tx.proposal_key.sequence_number
        );

        Ok(SubmissionHandle {
            id,
            proposal_key: tx.proposal_key,
            submitted_at: Utc::now(),
            state: TransactionState::Submitted,
        })
    }

    /// Poll until the transaction is terminal or `max_wait` elapses
    pub async fn poll(&self, handle: &mut SubmissionHandle, max_wait: Duration) -> TransactionOutcome {
        self.poll_until(handle, max_wait, std::future::pending()).await
    }

    /// Poll until the transaction is terminal, `max_wait` elapses, or `cancel` fires.
    ///
    /// Timeout and cancellation both report [`TransactionOutcome::Unknown`]:
    /// the transaction may still seal later.
    pub async fn poll_until<F>(
        &self,
        handle: &mut SubmissionHandle,
        max_wait: Duration,
        cancel: F,
    ) -> TransactionOutcome
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();

        let outcome = tokio::select! {
            result = timeout(max_wait, self.wait_terminal(handle.id)) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("Transaction {} not terminal after {:?}", handle.id, max_wait);
                    TransactionOutcome::Unknown
                }
            },
            _ = cancel => {
                info!("Stopped polling transaction {}", handle.id);
                TransactionOutcome::Unknown
            }
        };

        crate::metrics::record_poll_latency(started.elapsed().as_secs_f64());
        crate::metrics::record_tx_outcome(&outcome);

        handle.state = outcome.clone().into();
        outcome
    }

    /// One status check; anything not yet terminal reads as [`TransactionOutcome::Unknown`]
    pub async fn check(&self, handle: &mut SubmissionHandle) -> HarnessResult<TransactionOutcome> {
        let result = self.ledger.transaction_result(handle.id).await?;
        let outcome = terminal_outcome(result).unwrap_or(TransactionOutcome::Unknown);
        if outcome != TransactionOutcome::Unknown {
            crate::metrics::record_tx_outcome(&outcome);
        }
        handle.state = outcome.clone().into();
        Ok(outcome)
    }

    async fn wait_terminal(&self, id: TransactionId) -> TransactionOutcome {
        let mut interval = self.policy.initial_interval;

        loop {
            match self.ledger.transaction_result(id).await {
                Ok(result) => {
                    let status = result.status;
                    match terminal_outcome(result) {
                        Some(outcome) => return outcome,
                        None => debug!("Transaction {} is {:?}", id, status),
                    }
                }
                Err(LedgerError::TransactionNotFound(_)) => {
                    debug!("Transaction {} not yet visible", id);
                }
                Err(e) => warn!("Status check for {} failed: {}", id, e),
            }

            sleep(interval).await;
            interval = (interval * 2).min(self.policy.max_interval);
        }
    }
}

fn terminal_outcome(result: TransactionResult) -> Option<TransactionOutcome> {
    match result.status {
        TransactionStatus::Sealed => Some(TransactionOutcome::Sealed(match result.error_message {
            Some(reason) => ExecutionResult::Failure {
                reason,
                events: result.events,
            },
            None => ExecutionResult::Success {
                events: result.events,
            },
        })),
        TransactionStatus::Expired => Some(TransactionOutcome::Expired),
        _ => None,
    }
}
