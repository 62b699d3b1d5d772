//! Signer capability and a local Ed25519 keyring implementation
//!
//! The harness never touches private key material directly: it asks a
//! [`Signer`] for a signature over an opaque message. [`KeyringSigner`] keeps
//! keys in memory and pre-hashes messages with each key's hash algorithm.

use crate::ledger::{AccountKey, HashAlgorithm, SignatureAlgorithm};
use crate::types::{Address, KeyId};

use async_trait::async_trait;
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::Sha256;
use sha3::{Digest, Sha3_256};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("No key {0} in keyring")]
    UnknownKey(KeyId),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signing backend error: {0}")]
    Backend(String),
}

/// External signing capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    /// Key this signer uses for `address`, if it holds one
    fn key_for(&self, address: &Address) -> Option<KeyId>;

    /// Whether this signer holds `key`
    fn can_sign(&self, key: &KeyId) -> bool;

    /// Sign an opaque message with `key`
    async fn sign(&self, key: &KeyId, message: &[u8]) -> Result<Vec<u8>, SignerError>;
}

/// Hash `message` with the algorithm an account key declares
pub fn digest(hash_algo: HashAlgorithm, message: &[u8]) -> Vec<u8> {
    match hash_algo {
        HashAlgorithm::Sha2_256 => Sha256::digest(message).to_vec(),
        HashAlgorithm::Sha3_256 => Sha3_256::digest(message).to_vec(),
    }
}

/// Verify a signature made by [`KeyringSigner`] against an account key
pub fn verify(key: &AccountKey, message: &[u8], signature: &[u8]) -> bool {
    if key.sign_algo != SignatureAlgorithm::Ed25519 {
        return false;
    }

    let Ok(public_key) = <[u8; 32]>::try_from(key.public_key.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    verifying_key
        .verify(&digest(key.hash_algo, message), &signature)
        .is_ok()
}

struct KeyEntry {
    signing_key: SigningKey,
    hash_algo: HashAlgorithm,
}

/// In-memory Ed25519 keyring
#[derive(Default)]
pub struct KeyringSigner {
    keys: DashMap<KeyId, KeyEntry>,
}

impl KeyringSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh signing key
    pub fn generate_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    /// Public key bytes as stored on the ledger
    pub fn public_key_of(signing_key: &SigningKey) -> Vec<u8> {
        signing_key.verifying_key().to_bytes().to_vec()
    }

    pub fn add_key(&self, key: KeyId, signing_key: SigningKey, hash_algo: HashAlgorithm) {
        debug!("Added key {} to keyring", key);
        self.keys.insert(
            key,
            KeyEntry {
                signing_key,
                hash_algo,
            },
        );
    }

    /// Add a key from a hex-encoded 32-byte secret
    pub fn add_key_hex(
        &self,
        key: KeyId,
        secret_hex: &str,
        hash_algo: HashAlgorithm,
    ) -> Result<(), SignerError> {
        let mut secret = [0u8; 32];
        hex::decode_to_slice(secret_hex.trim().trim_start_matches("0x"), &mut secret)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        self.add_key(key, SigningKey::from_bytes(&secret), hash_algo);
        Ok(())
    }

    pub fn public_key(&self, key: &KeyId) -> Option<Vec<u8>> {
        self.keys
            .get(key)
            .map(|entry| Self::public_key_of(&entry.signing_key))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl Signer for KeyringSigner {
    fn key_for(&self, address: &Address) -> Option<KeyId> {
        self.keys
            .iter()
            .map(|entry| *entry.key())
            .filter(|key| key.address == *address)
            .min()
    }

    fn can_sign(&self, key: &KeyId) -> bool {
        self.keys.contains_key(key)
    }

    async fn sign(&self, key: &KeyId, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        let entry = self.keys.get(key).ok_or(SignerError::UnknownKey(*key))?;
        let hashed = digest(entry.hash_algo, message);
        Ok(entry.signing_key.sign(&hashed).to_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::KEY_WEIGHT_THRESHOLD;

    fn account_key(public_key: Vec<u8>, hash_algo: HashAlgorithm) -> AccountKey {
        AccountKey {
            index: 0,
            public_key,
            sign_algo: SignatureAlgorithm::Ed25519,
            hash_algo,
            weight: KEY_WEIGHT_THRESHOLD,
            sequence_number: 0,
            revoked: false,
        }
    }

    #[test]
    fn test_signatures_verify_against_account_key() {
        let keyring = KeyringSigner::new();
        let key = KeyId::new(Address::from_index(1), 0);
        let signing_key = KeyringSigner::generate_key();
        let public = KeyringSigner::public_key_of(&signing_key);
        keyring.add_key(key, signing_key, HashAlgorithm::Sha3_256);

        let signature = tokio_test::block_on(keyring.sign(&key, b"payload")).unwrap();

        let on_ledger = account_key(public.clone(), HashAlgorithm::Sha3_256);
        assert!(verify(&on_ledger, b"payload", &signature));
        assert!(!verify(&on_ledger, b"tampered", &signature));

        // Same key, different declared hash algorithm
        let wrong_hash = account_key(public, HashAlgorithm::Sha2_256);
        assert!(!verify(&wrong_hash, b"payload", &signature));
    }

    #[test]
    fn test_key_for_prefers_lowest_index() {
        let keyring = KeyringSigner::new();
        let address = Address::from_index(4);
        keyring.add_key(KeyId::new(address, 3), KeyringSigner::generate_key(), HashAlgorithm::Sha3_256);
        keyring.add_key(KeyId::new(address, 1), KeyringSigner::generate_key(), HashAlgorithm::Sha3_256);

        assert_eq!(keyring.key_for(&address), Some(KeyId::new(address, 1)));
        assert_eq!(keyring.key_for(&Address::from_index(5)), None);
    }

    #[tokio::test]
    async fn test_unknown_key_and_bad_hex() {
        let keyring = KeyringSigner::new();
        let key = KeyId::new(Address::from_index(1), 0);
        assert_eq!(
            keyring.sign(&key, b"m").await,
            Err(SignerError::UnknownKey(key))
        );
        assert!(keyring
            .add_key_hex(key, "not-hex", HashAlgorithm::Sha3_256)
            .is_err());
        assert!(keyring
            .add_key_hex(key, &"11".repeat(32), HashAlgorithm::Sha3_256)
            .is_ok());
        assert!(keyring.can_sign(&key));
    }
}
