//! Provides an [`Emulator`] backend that runs a ledger in memory.
//!
//! The emulator enforces what the harness depends on: proposal-key sequence
//! numbers, payload and envelope signatures, reference-block expiry and
//! delayed sealing. It does not interpret contract code. The built-in
//! deployment scripts create accounts and store contract sources; every
//! other script is dispatched to a handler registered for a marker string
//! contained in the script.
//!
//! # Differences with a real ledger
//!
//! * A block is committed for every sealed transaction and by
//!   [`Emulator::advance_blocks`]; nothing else advances the chain.
//!
//! * A pending transaction seals on a status query, once it has been queried
//!   `seal_after_polls` times and its sequence number is the key's current one.

use super::{
    Account, AccountKey, Block, LedgerClient, LedgerError, TransactionResult, TransactionStatus,
    KEY_WEIGHT_THRESHOLD,
};
use crate::events::{account_event_payload, LedgerEvent, ACCOUNT_CONTRACT_ADDED, ACCOUNT_CREATED};
use crate::link::NewAccountKey;
use crate::signer;
use crate::templates;
use crate::tx::{SignedTransaction, Transaction, TransactionSignature};
use crate::types::{Address, BlockId, KeyId, TransactionId, UFix64, Value};

use async_trait::async_trait;
use chrono::Utc;
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Address of the account that pays for and proposes deployments
pub const SERVICE_ADDRESS: Address = Address::from_index(0xf8d6e0586b0aa222);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorConfig {
    /// Blocks after its reference block before a transaction expires
    pub expiry_window: u64,
    /// Status queries before a pending transaction may seal; `None` never seals
    pub seal_after_polls: Option<u32>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            expiry_window: 600,
            seal_after_polls: Some(0),
        }
    }
}

/// Contract-level state that transaction handlers read and write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStore(BTreeMap<String, Value>);

impl LedgerStore {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Fixed-point amount stored at `key`, zero when absent
    pub fn ufix64(&self, key: &str) -> UFix64 {
        self.get(key).and_then(Value::as_ufix64).unwrap_or(UFix64::ZERO)
    }
}

/// What a transaction handler sees of the transaction being executed
#[derive(Debug, Clone)]
pub struct TransactionContext<'a> {
    pub id: TransactionId,
    pub script: &'a str,
    pub arguments: &'a [Value],
    pub proposer: KeyId,
    pub payer: Address,
    pub authorizers: &'a [Address],
    pub block_height: u64,
}

/// Events as (type, payload)
pub type EmittedEvents = Vec<(String, Value)>;

type TransactionHandler =
    Arc<dyn Fn(&mut LedgerStore, &TransactionContext<'_>) -> Result<EmittedEvents, String> + Send + Sync>;
type ScriptHandler = Arc<dyn Fn(&LedgerStore, &[Value]) -> Result<Value, String> + Send + Sync>;

struct PendingTransaction {
    transaction: Transaction,
    reference_height: u64,
    polls_left: Option<u32>,
}

/// Mutable state of the emulator.
struct EmulatorState {
    blocks: Vec<Block>,
    accounts: BTreeMap<Address, Account>,
    next_address: u64,
    pending: HashMap<TransactionId, PendingTransaction>,
    results: HashMap<TransactionId, TransactionResult>,
    store: LedgerStore,
    transaction_handlers: Vec<(String, TransactionHandler)>,
    script_handlers: Vec<(String, ScriptHandler)>,
    received: usize,
}

/// In-memory [`LedgerClient`] implementation
#[derive(Clone)]
pub struct Emulator {
    config: EmulatorConfig,
    service_key: KeyId,
    state: Arc<Mutex<EmulatorState>>,
}

impl Emulator {
    /// Start a chain whose service account holds `service_key` at index 0
    pub fn new(config: EmulatorConfig, service_key: NewAccountKey) -> Self {
        let mut state = EmulatorState {
            blocks: Vec::new(),
            accounts: BTreeMap::new(),
            next_address: 1,
            pending: HashMap::new(),
            results: HashMap::new(),
            store: LedgerStore::default(),
            transaction_handlers: Vec::new(),
            script_handlers: Vec::new(),
            received: 0,
        };
        state.commit_block();
        state.insert_account(SERVICE_ADDRESS, vec![service_key]);

        Emulator {
            config,
            service_key: KeyId::new(SERVICE_ADDRESS, 0),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn service_key(&self) -> KeyId {
        self.service_key
    }

    /// Create an account directly, outside any transaction
    pub fn create_account(&self, keys: Vec<NewAccountKey>) -> Address {
        let mut state = self.state();
        let address = state.new_account(keys);
        state.commit_block();
        address
    }

    /// Commit `count` empty blocks
    pub fn advance_blocks(&self, count: u64) {
        let mut state = self.state();
        for _ in 0..count {
            state.commit_block();
        }
    }

    /// Register a handler for transactions whose script contains `marker`
    pub fn on_transaction<F>(&self, marker: impl Into<String>, handler: F)
    where
        F: Fn(&mut LedgerStore, &TransactionContext<'_>) -> Result<EmittedEvents, String>
            + Send
            + Sync
            + 'static,
    {
        self.state()
            .transaction_handlers
            .push((marker.into(), Arc::new(handler)));
    }

    /// Register a handler for read-only scripts containing `marker`
    pub fn on_script<F>(&self, marker: impl Into<String>, handler: F)
    where
        F: Fn(&LedgerStore, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.state()
            .script_handlers
            .push((marker.into(), Arc::new(handler)));
    }

    pub fn update_store<R>(&self, f: impl FnOnce(&mut LedgerStore) -> R) -> R {
        f(&mut self.state().store)
    }

    pub fn store(&self) -> LedgerStore {
        self.state().store.clone()
    }

    pub fn account(&self, address: Address) -> Option<Account> {
        self.state().accounts.get(&address).cloned()
    }

    /// Transactions handed to the emulator, accepted or not
    pub fn received_transactions(&self) -> usize {
        self.state().received
    }

    pub fn height(&self) -> u64 {
        self.state().tip().map_or(0, |b| b.height)
    }

    fn submit(&self, signed: &SignedTransaction) -> Result<TransactionId, LedgerError> {
        let tx = signed.transaction();
        let id = signed
            .id()
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;

        let mut state = self.state();
        state.received += 1;

        let tip = state.tip_height();
        let reference_height = state
            .height_of(&tx.reference_block)
            .ok_or_else(|| LedgerError::Rejected(format!("unknown reference block {}", tx.reference_block)))?;
        if tip - reference_height > self.config.expiry_window {
            return Err(LedgerError::Rejected(format!(
                "reference block {} has expired",
                tx.reference_block
            )));
        }

        if state.pending.contains_key(&id) || state.results.contains_key(&id) {
            return Err(LedgerError::Rejected(format!("duplicate transaction {}", id)));
        }

        let proposer = tx.proposal_key.key;
        let key = state.key(proposer)?;
        if key.revoked {
            return Err(LedgerError::Rejected(format!("proposal key {} is revoked", proposer)));
        }

        let provided = tx.proposal_key.sequence_number;
        let in_flight = state
            .pending
            .values()
            .any(|p| p.transaction.proposal_key == tx.proposal_key);
        if provided < key.sequence_number || in_flight {
            return Err(LedgerError::SequenceMismatch {
                key: proposer,
                expected: key.sequence_number,
                provided,
            });
        }

        state.check_signatures(tx)?;

        debug!(
            "Emulator accepted transaction {} (key {}, sequence {})",
            id, proposer, provided
        );
        state.pending.insert(
            id,
            PendingTransaction {
                transaction: tx.clone(),
                reference_height,
                polls_left: self.config.seal_after_polls,
            },
        );

        Ok(id)
    }

    fn status(&self, id: TransactionId) -> Result<TransactionResult, LedgerError> {
        let mut state = self.state();
        if let Some(result) = state.results.get(&id) {
            return Ok(result.clone());
        }

        let tip = state.tip_height();
        let pending = state
            .pending
            .get_mut(&id)
            .ok_or(LedgerError::TransactionNotFound(id))?;

        if tip - pending.reference_height > self.config.expiry_window {
            state.pending.remove(&id);
            let result = TransactionResult {
                status: TransactionStatus::Expired,
                error_message: None,
                events: Vec::new(),
            };
            state.results.insert(id, result.clone());
            info!("Emulator expired transaction {}", id);
            return Ok(result);
        }

        match pending.polls_left.as_mut() {
            None => return Ok(TransactionResult::pending()),
            Some(left) if *left > 0 => {
                *left -= 1;
                return Ok(TransactionResult::pending());
            }
            Some(_) => {}
        }

        let proposal_key = pending.transaction.proposal_key;
        if state.key(proposal_key.key)?.sequence_number != proposal_key.sequence_number {
            // Waits for its predecessor
            return Ok(TransactionResult::pending());
        }

        let Some(pending) = state.pending.remove(&id) else {
            return Err(LedgerError::TransactionNotFound(id));
        };
        let result = state.execute(id, pending.transaction);
        state.results.insert(id, result.clone());
        Ok(result)
    }

    fn run_script(&self, script: &[u8], arguments: &[Value]) -> Result<Value, LedgerError> {
        let script = String::from_utf8_lossy(script);
        let state = self.state();
        let handler = state
            .script_handlers
            .iter()
            .find(|(marker, _)| script.contains(marker.as_str()))
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| LedgerError::ScriptFailed("no handler for script".to_string()))?;
        handler(&state.store, arguments).map_err(LedgerError::ScriptFailed)
    }
}

impl EmulatorState {
    fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    fn tip_height(&self) -> u64 {
        self.tip().map_or(0, |b| b.height)
    }

    fn height_of(&self, id: &BlockId) -> Option<u64> {
        self.blocks.iter().find(|b| b.id == *id).map(|b| b.height)
    }

    fn commit_block(&mut self) -> Block {
        let parent = self.tip().map(|b| b.id).unwrap_or_default();
        let height = self.blocks.len() as u64;

        let mut hasher = Sha3_256::new();
        hasher.update(parent.0);
        hasher.update(height.to_be_bytes());
        let mut id = [0u8; 32];
        id.copy_from_slice(&hasher.finalize());

        let block = Block {
            id: BlockId(id),
            height,
            timestamp: Utc::now(),
        };
        self.blocks.push(block.clone());
        block
    }

    fn insert_account(&mut self, address: Address, keys: Vec<NewAccountKey>) {
        let keys = keys
            .into_iter()
            .enumerate()
            .map(|(index, key)| AccountKey {
                index: index as u32,
                public_key: key.public_key,
                sign_algo: key.sign_algo,
                hash_algo: key.hash_algo,
                weight: key.weight,
                sequence_number: 0,
                revoked: false,
            })
            .collect();

        self.accounts.insert(
            address,
            Account {
                address,
                keys,
                contracts: BTreeMap::new(),
            },
        );
    }

    fn new_account(&mut self, keys: Vec<NewAccountKey>) -> Address {
        let address = Address::from_index(self.next_address);
        self.next_address += 1;
        self.insert_account(address, keys);
        address
    }

    fn key(&self, key: KeyId) -> Result<&AccountKey, LedgerError> {
        self.accounts
            .get(&key.address)
            .ok_or(LedgerError::AccountNotFound(key.address))?
            .key(key.key_index)
            .ok_or(LedgerError::KeyNotFound(key))
    }

    /// Verify every signature and sum their weights per address
    fn signature_weights(
        &self,
        signatures: &[TransactionSignature],
        message: &[u8],
    ) -> Result<BTreeMap<Address, u32>, LedgerError> {
        let mut weights = BTreeMap::new();
        for signature in signatures {
            let key = self.key(signature.signer())?;
            if key.revoked {
                return Err(LedgerError::Rejected(format!(
                    "signature from revoked key {}",
                    signature.signer()
                )));
            }
            if !signer::verify(key, message, &signature.signature) {
                return Err(LedgerError::Rejected(format!(
                    "invalid signature from {}",
                    signature.signer()
                )));
            }
            *weights.entry(signature.address).or_insert(0) += key.weight;
        }
        Ok(weights)
    }

    fn check_signatures(&self, tx: &Transaction) -> Result<(), LedgerError> {
        let encoding = |e: crate::error::HarnessError| LedgerError::Rejected(e.to_string());
        let payload = self.signature_weights(
            tx.payload_signatures(),
            &tx.payload_message().map_err(encoding)?,
        )?;
        let envelope = self.signature_weights(
            tx.envelope_signatures(),
            &tx.envelope_message().map_err(encoding)?,
        )?;

        let proposer = tx.proposal_key.key;
        let proposer_signed = tx
            .payload_signatures()
            .iter()
            .chain(tx.envelope_signatures())
            .any(|s| s.signer() == proposer);
        if !proposer_signed {
            return Err(LedgerError::Rejected(format!(
                "missing signature from proposal key {}",
                proposer
            )));
        }

        for authorizer in tx.authorizers.iter().filter(|a| **a != tx.payer) {
            if payload.get(authorizer).copied().unwrap_or(0) < KEY_WEIGHT_THRESHOLD {
                return Err(LedgerError::Rejected(format!(
                    "insufficient payload signatures from authorizer {}",
                    authorizer
                )));
            }
        }

        if envelope.get(&tx.payer).copied().unwrap_or(0) < KEY_WEIGHT_THRESHOLD {
            return Err(LedgerError::Rejected(format!(
                "insufficient envelope signatures from payer {}",
                tx.payer
            )));
        }

        Ok(())
    }

    /// Seal a transaction; its sequence number is consumed even if execution fails
    fn execute(&mut self, id: TransactionId, tx: Transaction) -> TransactionResult {
        let proposer = tx.proposal_key.key;
        if let Some(key) = self
            .accounts
            .get_mut(&proposer.address)
            .and_then(|a| a.keys.iter_mut().find(|k| k.index == proposer.key_index))
        {
            key.sequence_number += 1;
        }
        let block_height = self.commit_block().height;

        let script = tx.script_text();
        let outcome = if script == templates::CREATE_ACCOUNT {
            self.create_account_with_contract(&tx)
        } else if script == templates::ADD_CONTRACT {
            self.add_contract(&tx)
        } else {
            let handler = self
                .transaction_handlers
                .iter()
                .find(|(marker, _)| script.contains(marker.as_str()))
                .map(|(_, handler)| handler.clone());

            match handler {
                Some(handler) => {
                    let context = TransactionContext {
                        id,
                        script: &script,
                        arguments: &tx.arguments,
                        proposer,
                        payer: tx.payer,
                        authorizers: &tx.authorizers,
                        block_height,
                    };
                    let snapshot = self.store.clone();
                    let result = handler(&mut self.store, &context);
                    if result.is_err() {
                        self.store = snapshot;
                    }
                    result
                }
                None => Err("no handler for transaction script".to_string()),
            }
        };

        match outcome {
            Ok(events) => {
                info!("Emulator sealed transaction {} at height {}", id, block_height);
                TransactionResult {
                    status: TransactionStatus::Sealed,
                    error_message: None,
                    events: events
                        .into_iter()
                        .enumerate()
                        .map(|(index, (event_type, payload))| LedgerEvent {
                            event_type,
                            transaction_id: id,
                            event_index: index as u32,
                            payload,
                        })
                        .collect(),
                }
            }
            Err(reason) => {
                info!("Emulator sealed failed transaction {}: {}", id, reason);
                TransactionResult {
                    status: TransactionStatus::Sealed,
                    error_message: Some(reason),
                    events: Vec::new(),
                }
            }
        }
    }

    fn create_account_with_contract(&mut self, tx: &Transaction) -> Result<EmittedEvents, String> {
        let keys = match tx.arguments.first() {
            Some(Value::Array(keys)) => keys
                .iter()
                .map(templates::decode_account_key)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?,
            _ => return Err("expected [AccountKey] as first argument".to_string()),
        };
        let (name, code) = contract_arguments(&tx.arguments[1..])?;

        let address = self.new_account(keys);
        if let Some(account) = self.accounts.get_mut(&address) {
            account.contracts.insert(name.clone(), code);
        }

        Ok(vec![
            (ACCOUNT_CREATED.to_string(), account_event_payload(address, None)),
            (
                ACCOUNT_CONTRACT_ADDED.to_string(),
                account_event_payload(address, Some(&name)),
            ),
        ])
    }

    fn add_contract(&mut self, tx: &Transaction) -> Result<EmittedEvents, String> {
        let address = *tx
            .authorizers
            .first()
            .ok_or_else(|| "adding a contract needs an authorizer".to_string())?;
        let (name, code) = contract_arguments(&tx.arguments)?;

        let account = self
            .accounts
            .get_mut(&address)
            .ok_or_else(|| format!("account {} not found", address))?;
        if account.contracts.contains_key(&name) {
            return Err(format!("contract {} already exists on {}", name, address));
        }
        account.contracts.insert(name.clone(), code);

        Ok(vec![(
            ACCOUNT_CONTRACT_ADDED.to_string(),
            account_event_payload(address, Some(&name)),
        )])
    }
}

/// Contract name and hex-encoded source
fn contract_arguments(arguments: &[Value]) -> Result<(String, String), String> {
    let name = arguments
        .first()
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| "expected contract name".to_string())?;
    let code = arguments
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| "expected contract code".to_string())?;
    let code = hex::decode(code).map_err(|e| format!("contract code is not hex: {}", e))?;
    let code = String::from_utf8(code).map_err(|e| format!("contract code is not UTF-8: {}", e))?;
    Ok((name.to_string(), code))
}

#[async_trait]
impl LedgerClient for Emulator {
    async fn send_transaction(
        &self,
        transaction: &SignedTransaction,
    ) -> Result<TransactionId, LedgerError> {
        self.submit(transaction)
    }

    async fn get_account(&self, address: Address) -> Result<Account, LedgerError> {
        self.account(address)
            .ok_or(LedgerError::AccountNotFound(address))
    }

    async fn latest_block(&self) -> Result<Block, LedgerError> {
        self.state()
            .tip()
            .cloned()
            .ok_or_else(|| LedgerError::Connection("no blocks committed".to_string()))
    }

    async fn transaction_result(
        &self,
        id: TransactionId,
    ) -> Result<TransactionResult, LedgerError> {
        self.status(id)
    }

    async fn execute_script(
        &self,
        script: &[u8],
        arguments: &[Value],
    ) -> Result<Value, LedgerError> {
        self.run_script(script, arguments)
    }
}
