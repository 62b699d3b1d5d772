//! Ledger module - the query/submit capability the harness consumes
//!
//! This module provides:
//! - The [`LedgerClient`] trait implemented by ledger backends
//! - Account, key, block and transaction-result types returned by the ledger
//! - An in-process [`Emulator`] backend

pub mod emulator;

pub use emulator::{
    EmittedEvents, Emulator, EmulatorConfig, LedgerStore, TransactionContext, SERVICE_ADDRESS,
};

use crate::events::LedgerEvent;
use crate::tx::SignedTransaction;
use crate::types::{hex_bytes, Address, BlockId, KeyId, TransactionId, Value};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors reported by a ledger backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Invalid sequence number for key {key}: expected {expected}, got {provided}")]
    SequenceMismatch {
        key: KeyId,
        expected: u64,
        provided: u64,
    },

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Account {0} not found")]
    AccountNotFound(Address),

    #[error("Account key {0} not found")]
    KeyNotFound(KeyId),

    #[error("Transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("Script execution failed: {0}")]
    ScriptFailed(String),

    #[error("Ledger connection error: {0}")]
    Connection(String),
}

/// Signature algorithms an account key can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureAlgorithm {
    EcdsaP256,
    EcdsaSecp256k1,
    Ed25519,
}

/// Hash algorithms an account key can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA2_256")]
    Sha2_256,
    #[serde(rename = "SHA3_256")]
    Sha3_256,
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignatureAlgorithm::EcdsaP256 => "ECDSA_P256",
            SignatureAlgorithm::EcdsaSecp256k1 => "ECDSA_SECP256K1",
            SignatureAlgorithm::Ed25519 => "ED25519",
        })
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlgorithm::Sha2_256 => "SHA2_256",
            HashAlgorithm::Sha3_256 => "SHA3_256",
        })
    }
}

/// One key of an on-ledger account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountKey {
    pub index: u32,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub sign_algo: SignatureAlgorithm,
    pub hash_algo: HashAlgorithm,
    pub weight: u32,
    /// Next sequence number the ledger will accept for this key
    pub sequence_number: u64,
    pub revoked: bool,
}

/// Full weight; a single key with this weight can authorize alone
pub const KEY_WEIGHT_THRESHOLD: u32 = 1000;

/// On-ledger account state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub keys: Vec<AccountKey>,
    /// Deployed contracts: name -> source
    pub contracts: BTreeMap<String, String>,
}

impl Account {
    pub fn key(&self, index: u32) -> Option<&AccountKey> {
        self.keys.iter().find(|k| k.index == index)
    }
}

/// A sealed block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub height: u64,
    pub timestamp: DateTime<Utc>,
}

/// Status of a transaction as reported by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Unknown,
    Pending,
    Finalized,
    Executed,
    Sealed,
    Expired,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Sealed | TransactionStatus::Expired)
    }
}

/// Result of a transaction status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub status: TransactionStatus,
    /// Execution error, present only for sealed transactions that failed
    pub error_message: Option<String>,
    pub events: Vec<LedgerEvent>,
}

impl TransactionResult {
    pub fn pending() -> Self {
        Self {
            status: TransactionStatus::Pending,
            error_message: None,
            events: Vec::new(),
        }
    }
}

/// Query and submit capability of a ledger node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a signed transaction, returning its identifier
    async fn send_transaction(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<TransactionId, LedgerError>;

    /// Fetch account state, including keys and their sequence numbers
    async fn get_account(&self, address: Address) -> Result<Account, LedgerError>;

    /// Latest sealed block, used as the reference anchor of new transactions
    async fn latest_block(&self) -> Result<Block, LedgerError>;

    /// Current status of a submitted transaction
    async fn transaction_result(
        &self,
        id: TransactionId,
    ) -> Result<TransactionResult, LedgerError>;

    /// Execute a read-only script against current state
    async fn execute_script(
        &self,
        script: &[u8],
        arguments: &[Value],
    ) -> Result<Value, LedgerError>;
}

/// Sequence number the ledger currently observes for a key
pub async fn current_sequence_number(
    ledger: &dyn LedgerClient,
    key: KeyId,
) -> Result<u64, LedgerError> {
    let account = ledger.get_account(key.address).await?;
    account
        .key(key.key_index)
        .map(|k| k.sequence_number)
        .ok_or(LedgerError::KeyNotFound(key))
}
