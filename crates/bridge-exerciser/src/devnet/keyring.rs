//! secp256k1 key store implementing [`TransferSigner`].

use crate::{
    chain::{ChainError, TransferSigner},
    types::{Address, TransferSignature},
};
use async_trait::async_trait;
use k256::ecdsa::{Signature, SigningKey, signature::Signer};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Address of a public key: `prefix` followed by the hex of the first 20 bytes
/// of the SHA-256 of the compressed SEC1 key.
pub fn address_for(prefix: &str, public_key: &[u8]) -> Address {
    let digest = Sha256::digest(public_key);
    Address::new(format!("{prefix}{}", hex::encode(&digest[..20])))
}

/// Keys owned by the exerciser for one chain.
pub struct Keyring {
    prefix: String,
    keys: RwLock<HashMap<Address, SigningKey>>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("prefix", &self.prefix)
            .field("keys", &self.keys.read().len())
            .finish()
    }
}

impl Keyring {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Deterministic key from a label. Labels hashing to an invalid scalar are
    /// rehashed until a valid key is found.
    pub fn derive(&self, label: &str) -> Address {
        let mut seed = Sha256::digest(label.as_bytes());
        loop {
            if let Ok(key) = SigningKey::from_slice(&seed) {
                return self.insert(key);
            }
            seed = Sha256::digest(seed);
        }
    }

    fn insert(&self, key: SigningKey) -> Address {
        let public_key = key.verifying_key().to_encoded_point(true);
        let address = address_for(&self.prefix, public_key.as_bytes());
        self.keys.write().insert(address.clone(), key);
        address
    }
}

#[async_trait]
impl TransferSigner for Keyring {
    async fn sign(
        &self,
        signer: &Address,
        sign_bytes: &[u8],
    ) -> Result<TransferSignature, ChainError> {
        let keys = self.keys.read();
        let key = keys
            .get(signer)
            .ok_or_else(|| ChainError::MissingKey(signer.clone()))?;

        let signature: Signature = key.sign(sign_bytes);
        Ok(TransferSignature {
            public_key: key.verifying_key().to_encoded_point(true).as_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{VerifyingKey, signature::Verifier};

    #[tokio::test]
    async fn test_signature_verifies_against_address() {
        let keyring = Keyring::new("dst1");
        let address = keyring.derive("sender-0");
        assert!(address.as_str().starts_with("dst1"));
        assert_eq!(address.as_str().len(), 4 + 40);

        let sig = keyring.sign(&address, b"payload").await.unwrap();
        assert_eq!(address_for("dst1", &sig.public_key), address);

        let key = VerifyingKey::from_sec1_bytes(&sig.public_key).unwrap();
        let signature = Signature::from_slice(&sig.signature).unwrap();
        assert!(key.verify(b"payload", &signature).is_ok());
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = Keyring::new("dst1").derive("receiver-1");
        let b = Keyring::new("dst1").derive("receiver-1");
        assert_eq!(a, b);
        assert_ne!(a, Keyring::new("dst1").derive("receiver-2"));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let keyring = Keyring::new("dst1");
        let err = keyring.sign(&Address::from("dst1nobody"), b"x").await.unwrap_err();
        assert_eq!(err, ChainError::MissingKey(Address::from("dst1nobody")));
    }
}
