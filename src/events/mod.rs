//! Ledger event types and parsing
//!
//! Only the account-lifecycle events the deployer depends on are decoded;
//! contract-defined events pass through as [`HarnessEvent::Other`].

use crate::types::{Address, TransactionId, Value};

use serde::{Deserialize, Serialize};

/// Emitted when a new account is created
pub const ACCOUNT_CREATED: &str = "ledger.AccountCreated";
/// Emitted when a contract is added to an account
pub const ACCOUNT_CONTRACT_ADDED: &str = "ledger.AccountContractAdded";

/// Raw event as returned with a transaction result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_type: String,
    pub transaction_id: TransactionId,
    pub event_index: u32,
    pub payload: Value,
}

/// Decoded events the harness acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessEvent {
    AccountCreated { address: Address },
    AccountContractAdded { address: Address, contract: String },
    Other { event_type: String },
}

impl HarnessEvent {
    /// Get event name
    pub fn name(&self) -> &str {
        match self {
            HarnessEvent::AccountCreated { .. } => ACCOUNT_CREATED,
            HarnessEvent::AccountContractAdded { .. } => ACCOUNT_CONTRACT_ADDED,
            HarnessEvent::Other { event_type } => event_type,
        }
    }
}

impl From<&LedgerEvent> for HarnessEvent {
    fn from(event: &LedgerEvent) -> Self {
        let address = event.payload.field("address").and_then(Value::as_address);

        match (event.event_type.as_str(), address) {
            (ACCOUNT_CREATED, Some(address)) => HarnessEvent::AccountCreated { address },
            (ACCOUNT_CONTRACT_ADDED, Some(address)) => {
                match event.payload.field("contract").and_then(Value::as_str) {
                    Some(contract) => HarnessEvent::AccountContractAdded {
                        address,
                        contract: contract.to_string(),
                    },
                    None => HarnessEvent::Other {
                        event_type: event.event_type.clone(),
                    },
                }
            }
            _ => HarnessEvent::Other {
                event_type: event.event_type.clone(),
            },
        }
    }
}

/// Address of the first account created by a transaction
pub fn created_account(events: &[LedgerEvent]) -> Option<Address> {
    events.iter().find_map(|e| match HarnessEvent::from(e) {
        HarnessEvent::AccountCreated { address } => Some(address),
        _ => None,
    })
}

/// Build the payload of an account-lifecycle event
pub(crate) fn account_event_payload(address: Address, contract: Option<&str>) -> Value {
    let mut fields = vec![("address".to_string(), Value::Address(address))];
    if let Some(contract) = contract {
        fields.push(("contract".to_string(), Value::String(contract.to_string())));
    }
    Value::Struct {
        id: "AccountEvent".to_string(),
        fields,
    }
}
