//! Unsigned transactions and the builder that assembles them
//!
//! A transaction carries a resolved script, typed arguments, a reference block,
//! a gas limit, a proposal key with its sequence number, a payer, and the
//! ordered list of authorizers. Signing happens in two phases over the
//! canonical payload and envelope messages defined here.

use crate::error::{HarnessError, HarnessResult};
use crate::link::ResolvedScript;
use crate::types::{hex_bytes, Address, BlockId, KeyId, TransactionId, Value};

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::HashSet;

/// Gas limit used when an operation does not set one
pub const DEFAULT_GAS_LIMIT: u64 = 100;

/// Domain separation tag prepended to every signed message
pub const TRANSACTION_DOMAIN_TAG: [u8; 32] = domain_tag(b"LEDGER-V0.0-transaction");

const fn domain_tag(tag: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut i = 0;
    while i < tag.len() && i < 32 {
        out[i] = tag[i];
        i += 1;
    }
    out
}

/// Key proposing a transaction and the sequence number it consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalKey {
    pub key: KeyId,
    pub sequence_number: u64,
}

/// One signature attached to a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub address: Address,
    pub key_index: u32,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl TransactionSignature {
    pub fn signer(&self) -> KeyId {
        KeyId::new(self.address, self.key_index)
    }
}

/// Transaction before submission.
///
/// Signature lists are only filled in by the signing coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub script: Vec<u8>,
    pub arguments: Vec<Value>,
    pub reference_block: BlockId,
    pub gas_limit: u64,
    pub proposal_key: ProposalKey,
    pub payer: Address,
    pub authorizers: Vec<Address>,
    pub(crate) payload_signatures: Vec<TransactionSignature>,
    pub(crate) envelope_signatures: Vec<TransactionSignature>,
}

#[derive(Serialize)]
struct PayloadForm<'a> {
    #[serde(with = "hex_bytes")]
    script: &'a [u8],
    arguments: &'a [Value],
    reference_block: &'a BlockId,
    gas_limit: u64,
    proposal_key: &'a ProposalKey,
    payer: &'a Address,
    authorizers: &'a [Address],
}

#[derive(Serialize)]
struct EnvelopeForm<'a> {
    payload: PayloadForm<'a>,
    payload_signatures: &'a [TransactionSignature],
}

#[derive(Serialize)]
struct IdentityForm<'a> {
    payload: PayloadForm<'a>,
    payload_signatures: &'a [TransactionSignature],
    envelope_signatures: &'a [TransactionSignature],
}

impl Transaction {
    pub fn payload_signatures(&self) -> &[TransactionSignature] {
        &self.payload_signatures
    }

    pub fn envelope_signatures(&self) -> &[TransactionSignature] {
        &self.envelope_signatures
    }

    pub fn script_text(&self) -> String {
        String::from_utf8_lossy(&self.script).into_owned()
    }

    fn payload_form(&self) -> PayloadForm<'_> {
        PayloadForm {
            script: &self.script,
            arguments: &self.arguments,
            reference_block: &self.reference_block,
            gas_limit: self.gas_limit,
            proposal_key: &self.proposal_key,
            payer: &self.payer,
            authorizers: &self.authorizers,
        }
    }

    /// Message signed by the proposer and non-payer authorizers
    pub fn payload_message(&self) -> HarnessResult<Vec<u8>> {
        let mut message = TRANSACTION_DOMAIN_TAG.to_vec();
        message.extend(serde_json::to_vec(&self.payload_form())?);
        Ok(message)
    }

    /// Message signed by the payer; covers the payload signatures
    pub fn envelope_message(&self) -> HarnessResult<Vec<u8>> {
        let mut message = TRANSACTION_DOMAIN_TAG.to_vec();
        message.extend(serde_json::to_vec(&EnvelopeForm {
            payload: self.payload_form(),
            payload_signatures: &self.payload_signatures,
        })?);
        Ok(message)
    }

    /// Identifier of the fully signed transaction
    pub fn id(&self) -> HarnessResult<TransactionId> {
        let encoded = serde_json::to_vec(&IdentityForm {
            payload: self.payload_form(),
            payload_signatures: &self.payload_signatures,
            envelope_signatures: &self.envelope_signatures,
        })?;
        let mut id = [0u8; 32];
        id.copy_from_slice(&Sha3_256::digest(&encoded));
        Ok(TransactionId(id))
    }
}

/// Fluent builder for [`Transaction`]
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    script: ResolvedScript,
    arguments: Vec<Value>,
    proposal_key: Option<ProposalKey>,
    payer: Option<Address>,
    authorizers: Vec<Address>,
    gas_limit: u64,
    reference_block: Option<BlockId>,
    required_authorizers: usize,
}

impl TransactionBuilder {
    /// Start a transaction around a script with every slot resolved
    pub fn new(script: ResolvedScript) -> Self {
        Self {
            script,
            arguments: Vec::new(),
            proposal_key: None,
            payer: None,
            authorizers: Vec::new(),
            gas_limit: DEFAULT_GAS_LIMIT,
            reference_block: None,
            required_authorizers: 0,
        }
    }

    pub fn argument(mut self, value: impl Into<Value>) -> Self {
        self.arguments.push(value.into());
        self
    }

    pub fn arguments(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.arguments.extend(values);
        self
    }

    pub fn proposer(mut self, key: KeyId, sequence_number: u64) -> Self {
        self.proposal_key = Some(ProposalKey {
            key,
            sequence_number,
        });
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

    pub fn authorizers(mut self, authorizers: impl IntoIterator<Item = Address>) -> Self {
        self.authorizers.extend(authorizers);
        self
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn reference_block(mut self, block: BlockId) -> Self {
        self.reference_block = Some(block);
        self
    }

    /// Minimum number of authorizers the script needs
    pub fn require_authorizers(mut self, count: usize) -> Self {
        self.required_authorizers = count;
        self
    }

    pub fn build(self) -> HarnessResult<Transaction> {
        let proposal_key = self
            .proposal_key
            .ok_or(HarnessError::MissingRequiredField { field: "proposer" })?;
        let payer = self
            .payer
            .ok_or(HarnessError::MissingRequiredField { field: "payer" })?;
        let reference_block = self
            .reference_block
            .ok_or(HarnessError::MissingRequiredField {
                field: "reference_block",
            })?;

        if self.authorizers.len() < self.required_authorizers {
            return Err(HarnessError::MissingRequiredField {
                field: "authorizer",
            });
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = self.authorizers.iter().find(|a| !seen.insert(**a)) {
            return Err(HarnessError::DuplicateAuthorizer {
                address: *duplicate,
            });
        }

        Ok(Transaction {
            script: self.script.into_bytes(),
            arguments: self.arguments,
            reference_block,
            gas_limit: self.gas_limit,
            proposal_key,
            payer,
            authorizers: self.authorizers,
            payload_signatures: Vec::new(),
            envelope_signatures: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> ResolvedScript {
        ResolvedScript::from_source("transaction(amount: UFix64) { execute {} }").unwrap()
    }

    fn proposer() -> KeyId {
        KeyId::new(Address::from_index(1), 0)
    }

    fn complete() -> TransactionBuilder {
        TransactionBuilder::new(script())
            .argument(Value::ufix64("50.0").unwrap())
            .proposer(proposer(), 7)
            .payer(Address::from_index(2))
            .authorizer(Address::from_index(1))
            .reference_block(BlockId([9; 32]))
    }

    #[test]
    fn test_build_complete_transaction() {
        let tx = complete().gas_limit(9999).build().unwrap();
        assert_eq!(tx.proposal_key.sequence_number, 7);
        assert_eq!(tx.gas_limit, 9999);
        assert_eq!(tx.authorizers, vec![Address::from_index(1)]);
        assert!(tx.payload_signatures().is_empty());
    }

    #[test]
    fn test_default_gas_limit() {
        assert_eq!(complete().build().unwrap().gas_limit, DEFAULT_GAS_LIMIT);
    }

    #[test]
    fn test_missing_fields() {
        let err = TransactionBuilder::new(script())
            .payer(Address::from_index(2))
            .reference_block(BlockId::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, HarnessError::MissingRequiredField { field: "proposer" }));

        let err = TransactionBuilder::new(script())
            .proposer(proposer(), 0)
            .reference_block(BlockId::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, HarnessError::MissingRequiredField { field: "payer" }));

        let err = TransactionBuilder::new(script())
            .proposer(proposer(), 0)
            .payer(Address::from_index(2))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::MissingRequiredField {
                field: "reference_block"
            }
        ));
    }

    #[test]
    fn test_required_authorizers() {
        let err = TransactionBuilder::new(script())
            .proposer(proposer(), 0)
            .payer(Address::from_index(2))
            .reference_block(BlockId::default())
            .require_authorizers(1)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::MissingRequiredField {
                field: "authorizer"
            }
        ));
    }

    #[test]
    fn test_duplicate_authorizer() {
        let err = complete()
            .authorizer(Address::from_index(3))
            .authorizer(Address::from_index(1))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::DuplicateAuthorizer { address } if address == Address::from_index(1)
        ));
    }

    #[test]
    fn test_messages_are_domain_tagged_and_distinct() {
        let mut tx = complete().build().unwrap();
        let payload = tx.payload_message().unwrap();
        assert_eq!(&payload[..23], b"LEDGER-V0.0-transaction");
        assert!(payload[23..32].iter().all(|b| *b == 0));

        let envelope_before = tx.envelope_message().unwrap();
        tx.payload_signatures.push(TransactionSignature {
            address: Address::from_index(1),
            key_index: 0,
            signature: vec![1, 2, 3],
        });
        assert_ne!(tx.envelope_message().unwrap(), envelope_before);
        // The payload does not cover signatures
        assert_eq!(tx.payload_message().unwrap(), payload);
    }

    #[test]
    fn test_id_changes_with_sequence_number() {
        let a = complete().build().unwrap();
        let b = complete().proposer(proposer(), 8).build().unwrap();
        assert_eq!(a.id().unwrap(), a.clone().id().unwrap());
        assert_ne!(a.id().unwrap(), b.id().unwrap());
    }
}
