//! The harness: deploy, execute and query operations
//!
//! Every transaction flows through the same pipeline: the allocator reserves a
//! sequence number, the builder assembles it, the signing coordinator attaches
//! payload and envelope signatures, and the submission client tracks it to an
//! outcome. Sealed transactions confirm their reservation, expired ones release
//! it, and unknown outcomes leave it outstanding until [`Harness::reconcile`].

mod deploy;

pub use deploy::DeployedContract;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::ledger::LedgerClient;
use crate::link::{self, Bindings};
use crate::signer::Signer;
use crate::tx::{
    PollPolicy, ReleaseReason, Reservation, SequenceNumberAllocator, SubmissionClient,
    SubmissionHandle, TransactionOutcome, TransactionRequest, TransactionSender,
};
use crate::types::{Address, KeyId, TransactionId, Value};

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A transaction to run: a script template, its bindings and arguments, and
/// the accounts playing each role
#[derive(Debug, Clone)]
pub struct Operation {
    pub template: String,
    pub bindings: Bindings,
    pub arguments: Vec<Value>,
    pub proposer: KeyId,
    pub payer: Option<Address>,
    pub authorizers: Vec<Address>,
    pub gas_limit: Option<u64>,
    pub required_authorizers: usize,
    /// Overrides the configured poll deadline
    pub max_wait: Option<Duration>,
}

impl Operation {
    pub fn new(template: impl Into<String>, proposer: KeyId) -> Self {
        Self {
            template: template.into(),
            bindings: Bindings::new(),
            arguments: Vec::new(),
            proposer,
            payer: None,
            authorizers: Vec::new(),
            gas_limit: None,
            required_authorizers: 0,
            max_wait: None,
        }
    }

    pub fn bindings(mut self, bindings: Bindings) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn argument(mut self, value: impl Into<Value>) -> Self {
        self.arguments.push(value.into());
        self
    }

    pub fn arguments(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.arguments.extend(values);
        self
    }

    pub fn payer(mut self, payer: Address) -> Self {
        self.payer = Some(payer);
        self
    }

    pub fn authorizer(mut self, authorizer: Address) -> Self {
        self.authorizers.push(authorizer);
        self
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn require_authorizers(mut self, count: usize) -> Self {
        self.required_authorizers = count;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

/// What happened to one executed operation
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub id: TransactionId,
    pub outcome: TransactionOutcome,
    pub proposer: KeyId,
    pub sequence_number: u64,
    /// Submission attempts, including the accepted one
    pub attempts: u32,
    handle: SubmissionHandle,
}

impl ExecutionReport {
    /// Sequence conflicts recovered before the transaction was accepted
    pub fn resyncs(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    fn reservation(&self) -> Reservation {
        Reservation {
            key: self.proposer,
            sequence_number: self.sequence_number,
        }
    }
}

/// Entry point for deployments and operational traffic
pub struct Harness {
    ledger: Arc<dyn LedgerClient>,
    allocator: Arc<SequenceNumberAllocator>,
    submission: Arc<SubmissionClient>,
    sender: TransactionSender,
    service_key: KeyId,
    config: HarnessConfig,
}

impl Harness {
    /// `service_key` proposes and pays for deployments
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        signer: Arc<dyn Signer>,
        service_key: KeyId,
        config: HarnessConfig,
    ) -> Self {
        let allocator = Arc::new(SequenceNumberAllocator::new(ledger.clone()));
        let submission = Arc::new(SubmissionClient::new(
            ledger.clone(),
            PollPolicy::from_config(&config),
        ));
        let sender = TransactionSender::new(
            ledger.clone(),
            allocator.clone(),
            signer,
            submission.clone(),
            config.clone(),
        );

        Self {
            ledger,
            allocator,
            submission,
            sender,
            service_key,
            config,
        }
    }

    pub fn service_key(&self) -> KeyId {
        self.service_key
    }

    pub fn allocator(&self) -> &SequenceNumberAllocator {
        &self.allocator
    }

    /// Run one operation to an outcome.
    ///
    /// Returns an error only if the transaction never reached the ledger;
    /// sealed failures, expiry and unknown outcomes are reported in
    /// [`ExecutionReport::outcome`].
    pub async fn execute(&self, operation: &Operation) -> HarnessResult<ExecutionReport> {
        self.execute_until(operation, std::future::pending()).await
    }

    /// Like [`Harness::execute`], but stops waiting when `cancel` completes
    pub async fn execute_until<F>(
        &self,
        operation: &Operation,
        cancel: F,
    ) -> HarnessResult<ExecutionReport>
    where
        F: Future<Output = ()>,
    {
        let request = self.request(operation)?;
        let mut submission = self.sender.send(&request).await?;

        let max_wait = operation
            .max_wait
            .unwrap_or(self.submission.policy().max_wait);
        let outcome = self
            .submission
            .poll_until(&mut submission.handle, max_wait, cancel)
            .await;
        self.settle(&submission.reservation, &outcome).await;

        info!(
            "Transaction {} from {} (sequence {}): {}",
            submission.handle.id,
            submission.reservation.key,
            submission.reservation.sequence_number,
            outcome.label()
        );

        Ok(ExecutionReport {
            id: submission.handle.id,
            outcome,
            proposer: submission.reservation.key,
            sequence_number: submission.reservation.sequence_number,
            attempts: submission.attempts,
            handle: submission.handle,
        })
    }

    /// Run operations concurrently; results are in input order
    pub async fn execute_all(&self, operations: &[Operation]) -> Vec<HarnessResult<ExecutionReport>> {
        join_all(operations.iter().map(|op| self.execute(op))).await
    }

    /// Check again on a report whose outcome was unknown.
    ///
    /// A terminal status settles the reservation the transaction holds.
    pub async fn reconcile(&self, report: &mut ExecutionReport) -> HarnessResult<()> {
        if report.outcome != TransactionOutcome::Unknown {
            return Ok(());
        }

        let outcome = self.submission.check(&mut report.handle).await?;
        if outcome != TransactionOutcome::Unknown {
            info!(
                "Reconciled transaction {}: {}",
                report.id,
                outcome.label()
            );
            self.settle(&report.reservation(), &outcome).await;
            report.outcome = outcome;
        }
        Ok(())
    }

    /// Run a read-only script
    pub async fn query(
        &self,
        template: &str,
        bindings: &Bindings,
        arguments: &[Value],
    ) -> HarnessResult<Value> {
        let script = link::resolve(template, bindings)?;
        Ok(self
            .ledger
            .execute_script(script.as_bytes(), arguments)
            .await?)
    }

    fn request(&self, operation: &Operation) -> HarnessResult<TransactionRequest> {
        let payer = operation
            .payer
            .ok_or(HarnessError::MissingRequiredField { field: "payer" })?;

        Ok(TransactionRequest {
            script: link::resolve(&operation.template, &operation.bindings)?,
            arguments: operation.arguments.clone(),
            proposer: operation.proposer,
            payer,
            authorizers: operation.authorizers.clone(),
            gas_limit: operation
                .gas_limit
                .unwrap_or(self.config.default_gas_limit),
            required_authorizers: operation.required_authorizers,
        })
    }

    async fn settle(&self, reservation: &Reservation, outcome: &TransactionOutcome) {
        match outcome {
            TransactionOutcome::Sealed(_) => self.allocator.confirm(reservation).await,
            TransactionOutcome::Expired => {
                self.allocator
                    .release(reservation, ReleaseReason::Expired)
                    .await
            }
            TransactionOutcome::Unknown => warn!(
                "Sequence {} of key {} stays reserved until the outcome is known",
                reservation.sequence_number, reservation.key
            ),
        }
    }
}
