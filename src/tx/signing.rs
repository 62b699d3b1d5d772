//! Two-phase signing: payload signatures first, then the payer's envelope
//!
//! Roles are grouped by address, so an account that is both proposer and
//! authorizer signs the payload once, and an account that is also the payer
//! signs only the envelope.

use super::builder::{Transaction, TransactionSignature};
use crate::error::{HarnessError, HarnessResult};
use crate::signer::Signer;
use crate::types::{Address, KeyId, TransactionId};

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use tracing::debug;

/// Part an account plays in a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Proposer,
    Authorizer,
    Payer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Proposer => "proposer",
            Role::Authorizer => "authorizer",
            Role::Payer => "payer",
        })
    }
}

/// Key that signs on behalf of one address, and the roles it covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerAssignment {
    pub key: KeyId,
    pub roles: BTreeSet<Role>,
}

/// Which keys sign which message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningPlan {
    /// Payload signers, in order of first appearance
    pub payload: Vec<SignerAssignment>,
    pub envelope: SignerAssignment,
}

impl SigningPlan {
    pub fn signature_count(&self) -> usize {
        self.payload.len() + 1
    }
}

/// Transaction carrying all required signatures; cannot be modified further
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction(Transaction);

impl SignedTransaction {
    pub fn transaction(&self) -> &Transaction {
        &self.0
    }

    pub fn into_inner(self) -> Transaction {
        self.0
    }

    pub fn id(&self) -> HarnessResult<TransactionId> {
        self.0.id()
    }

    #[cfg(test)]
    pub(crate) fn unchecked(tx: Transaction) -> Self {
        Self(tx)
    }
}

impl Deref for SignedTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.0
    }
}

/// Decides who signs what, then collects the signatures
pub struct SigningCoordinator;

impl SigningCoordinator {
    /// Work out the signing plan, failing if any role has no usable key
    pub fn plan(tx: &Transaction, signer: &dyn Signer) -> HarnessResult<SigningPlan> {
        let proposer = tx.proposal_key.key;

        let mut groups: Vec<(Address, BTreeSet<Role>)> = Vec::new();
        let mut add = |address: Address, role: Role| {
            match groups.iter_mut().find(|(a, _)| *a == address) {
                Some((_, roles)) => {
                    roles.insert(role);
                }
                None => groups.push((address, BTreeSet::from([role]))),
            }
        };
        add(proposer.address, Role::Proposer);
        for authorizer in &tx.authorizers {
            add(*authorizer, Role::Authorizer);
        }
        add(tx.payer, Role::Payer);

        let mut payload = Vec::new();
        let mut envelope = None;

        for (address, roles) in groups {
            // Roles are non-empty by construction
            let role = roles.iter().next().copied().unwrap_or(Role::Authorizer);

            let key = if address == proposer.address {
                signer.can_sign(&proposer).then_some(proposer)
            } else {
                signer.key_for(&address).filter(|key| signer.can_sign(key))
            }
            .ok_or(HarnessError::IncompleteSignatures { role, address })?;

            let assignment = SignerAssignment { key, roles };
            if assignment.roles.contains(&Role::Payer) {
                envelope = Some(assignment);
            } else {
                payload.push(assignment);
            }
        }

        // The payer's group always exists; it signs the payload too when it proposes
        let envelope = envelope.ok_or(HarnessError::IncompleteSignatures {
            role: Role::Payer,
            address: tx.payer,
        })?;
        if envelope.roles.contains(&Role::Proposer) {
            payload.insert(0, envelope.clone());
        }

        Ok(SigningPlan { payload, envelope })
    }

    /// Collect payload then envelope signatures
    pub async fn sign(mut tx: Transaction, signer: &dyn Signer) -> HarnessResult<SignedTransaction> {
        let plan = Self::plan(&tx, signer)?;

        let payload_message = tx.payload_message()?;
        let mut payload_signatures = Vec::with_capacity(plan.payload.len());
        for assignment in &plan.payload {
            payload_signatures.push(Self::signature(signer, assignment.key, &payload_message).await?);
        }
        tx.payload_signatures = payload_signatures;

        let envelope_message = tx.envelope_message()?;
        tx.envelope_signatures = vec![Self::signature(signer, plan.envelope.key, &envelope_message).await?];

        debug!(
            "Signed transaction proposed by {} ({} payload, 1 envelope signature)",
            tx.proposal_key.key,
            plan.payload.len()
        );

        Ok(SignedTransaction(tx))
    }

    async fn signature(
        signer: &dyn Signer,
        key: KeyId,
        message: &[u8],
    ) -> HarnessResult<TransactionSignature> {
        let signature = signer
            .sign(&key, message)
            .await
            .map_err(|e| HarnessError::Signer {
                key,
                message: e.to_string(),
            })?;

        Ok(TransactionSignature {
            address: key.address,
            key_index: key.key_index,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::HashAlgorithm;
    use crate::link::ResolvedScript;
    use crate::signer::{KeyringSigner, MockSigner};
    use crate::tx::TransactionBuilder;
    use crate::types::BlockId;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn address(i: u64) -> Address {
        Address::from_index(i)
    }

    fn key(i: u64) -> KeyId {
        KeyId::new(address(i), 0)
    }

    fn tx(proposer: u64, payer: u64, authorizers: &[u64]) -> Transaction {
        TransactionBuilder::new(ResolvedScript::from_source("transaction {}").unwrap())
            .proposer(key(proposer), 0)
            .payer(address(payer))
            .authorizers(authorizers.iter().map(|a| address(*a)))
            .reference_block(BlockId::default())
            .build()
            .unwrap()
    }

    fn keyring(accounts: &[u64]) -> KeyringSigner {
        let keyring = KeyringSigner::new();
        for a in accounts {
            keyring.add_key(key(*a), KeyringSigner::generate_key(), HashAlgorithm::Sha3_256);
        }
        keyring
    }

    fn signers(signatures: &[TransactionSignature]) -> Vec<Address> {
        signatures.iter().map(|s| s.address).collect()
    }

    #[tokio::test]
    async fn test_distinct_payer_signs_envelope_only() {
        // P proposes, authorizers {P, R}, Q pays
        let signed = SigningCoordinator::sign(tx(1, 2, &[1, 3]), &keyring(&[1, 2, 3]))
            .await
            .unwrap();

        assert_eq!(signers(signed.payload_signatures()), vec![address(1), address(3)]);
        assert_eq!(signers(signed.envelope_signatures()), vec![address(2)]);
    }

    #[tokio::test]
    async fn test_single_account_in_every_role() {
        let signed = SigningCoordinator::sign(tx(1, 1, &[1]), &keyring(&[1]))
            .await
            .unwrap();

        assert_eq!(signers(signed.payload_signatures()), vec![address(1)]);
        assert_eq!(signers(signed.envelope_signatures()), vec![address(1)]);
    }

    #[tokio::test]
    async fn test_payer_authorizer_does_not_sign_payload() {
        // Proposer 1, payer 2 also authorizes
        let signed = SigningCoordinator::sign(tx(1, 2, &[2]), &keyring(&[1, 2]))
            .await
            .unwrap();

        assert_eq!(signers(signed.payload_signatures()), vec![address(1)]);
        assert_eq!(signers(signed.envelope_signatures()), vec![address(2)]);
    }

    #[test]
    fn test_missing_authorizer_key_fails_before_signing() {
        let err = SigningCoordinator::plan(&tx(1, 2, &[3]), &keyring(&[1, 2])).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::IncompleteSignatures { role: Role::Authorizer, address: a } if a == address(3)
        ));

        let err = SigningCoordinator::plan(&tx(1, 2, &[]), &keyring(&[1])).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::IncompleteSignatures { role: Role::Payer, .. }
        ));
    }

    #[tokio::test]
    async fn test_payload_signed_before_envelope() {
        let mut signer = MockSigner::new();
        signer.expect_can_sign().returning(|_| true);
        signer
            .expect_key_for()
            .returning(|address| Some(KeyId::new(*address, 0)));

        let mut order = Sequence::new();
        signer
            .expect_sign()
            .with(eq(key(1)), mockall::predicate::always())
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(vec![1]));
        signer
            .expect_sign()
            .with(eq(key(2)), mockall::predicate::always())
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(vec![2]));

        let signed = SigningCoordinator::sign(tx(1, 2, &[1]), &signer).await.unwrap();
        assert_eq!(signed.payload_signatures()[0].signature, vec![1]);
        assert_eq!(signed.envelope_signatures()[0].signature, vec![2]);
    }

    #[tokio::test]
    async fn test_signer_failure_is_reported_with_key() {
        let mut signer = MockSigner::new();
        signer.expect_can_sign().returning(|_| true);
        signer
            .expect_key_for()
            .returning(|address| Some(KeyId::new(*address, 0)));
        signer
            .expect_sign()
            .returning(|_, _| Err(crate::signer::SignerError::Backend("hsm offline".into())));

        let err = SigningCoordinator::sign(tx(1, 1, &[]), &signer).await.unwrap_err();
        assert!(matches!(err, HarnessError::Signer { key: k, .. } if k == key(1)));
    }
}
