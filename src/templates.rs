//! Built-in transaction scripts used for contract deployment

use crate::error::{HarnessError, HarnessResult};
use crate::ledger::{HashAlgorithm, SignatureAlgorithm};
use crate::link::NewAccountKey;
use crate::types::Value;

/// Creates an account with the given keys and deploys one contract to it.
///
/// Arguments: `[AccountKey]`, contract name, hex-encoded contract source.
pub const CREATE_ACCOUNT: &str = r#"transaction(publicKeys: [AccountKey], contractName: String, code: String) {
    prepare(signer: AuthAccount) {
        let account = AuthAccount(payer: signer)
        for key in publicKeys {
            account.keys.add(publicKey: key.publicKey, hashAlgorithm: key.hashAlgorithm, weight: key.weight)
        }
        account.contracts.add(name: contractName, code: code.decodeHex())
    }
}
"#;

/// Adds a contract to the authorizing account.
///
/// Arguments: contract name, hex-encoded contract source.
pub const ADD_CONTRACT: &str = r#"transaction(name: String, code: String) {
    prepare(signer: AuthAccount) {
        signer.contracts.add(name: name, code: code.decodeHex())
    }
}
"#;

const ACCOUNT_KEY: &str = "AccountKey";

/// Encode a key for the `publicKeys` argument of [`CREATE_ACCOUNT`]
pub fn encode_account_key(key: &NewAccountKey) -> Value {
    Value::Struct {
        id: ACCOUNT_KEY.to_string(),
        fields: vec![
            ("publicKey".to_string(), Value::String(hex::encode(&key.public_key))),
            (
                "signatureAlgorithm".to_string(),
                Value::String(key.sign_algo.to_string()),
            ),
            (
                "hashAlgorithm".to_string(),
                Value::String(key.hash_algo.to_string()),
            ),
            ("weight".to_string(), Value::UInt64(key.weight as u64)),
        ],
    }
}

/// Decode a key produced by [`encode_account_key`]
pub fn decode_account_key(value: &Value) -> HarnessResult<NewAccountKey> {
    let invalid = |what: &str| HarnessError::InvalidValue(format!("account key: {}", what));

    match value {
        Value::Struct { id, .. } if id == ACCOUNT_KEY => {}
        other => return Err(invalid(&format!("expected struct, got {}", other.type_name()))),
    }

    let public_key = value
        .field("publicKey")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing publicKey"))?;
    let public_key = hex::decode(public_key).map_err(|e| invalid(&e.to_string()))?;

    let sign_algo = match value.field("signatureAlgorithm").and_then(Value::as_str) {
        Some("ECDSA_P256") => SignatureAlgorithm::EcdsaP256,
        Some("ECDSA_SECP256K1") => SignatureAlgorithm::EcdsaSecp256k1,
        Some("ED25519") => SignatureAlgorithm::Ed25519,
        _ => return Err(invalid("unknown signatureAlgorithm")),
    };
    let hash_algo = match value.field("hashAlgorithm").and_then(Value::as_str) {
        Some("SHA2_256") => HashAlgorithm::Sha2_256,
        Some("SHA3_256") => HashAlgorithm::Sha3_256,
        _ => return Err(invalid("unknown hashAlgorithm")),
    };
    let weight = value
        .field("weight")
        .and_then(Value::as_u64)
        .and_then(|w| u32::try_from(w).ok())
        .ok_or_else(|| invalid("missing weight"))?;

    Ok(NewAccountKey {
        public_key,
        sign_algo,
        hash_algo,
        weight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ResolvedScript;

    #[test]
    fn test_builtin_scripts_have_no_slots() {
        assert!(ResolvedScript::from_source(CREATE_ACCOUNT).is_ok());
        assert!(ResolvedScript::from_source(ADD_CONTRACT).is_ok());
    }

    #[test]
    fn test_account_key_encoding() {
        let key = NewAccountKey::ed25519(vec![0xab; 32], HashAlgorithm::Sha3_256);
        let encoded = encode_account_key(&key);
        assert_eq!(
            encoded.field("signatureAlgorithm"),
            Some(&Value::String("ED25519".to_string()))
        );
        assert_eq!(decode_account_key(&encoded).unwrap(), key);
        assert!(decode_account_key(&Value::UInt64(1)).is_err());
    }
}
