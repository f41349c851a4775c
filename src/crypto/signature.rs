//! Detached ML-DSA-65 signatures.
//!
//! Messages are hashed with SHA3-256 before signing, and structured values
//! are bincode-serialized first so signatures are stable across peers.

use crate::crypto::hash_data;
use crate::crypto::keys::{SigPublicKey, SigSecretKey};
use crate::error::{Result, WeftError};
use pqcrypto_mldsa::mldsa65;
use pqcrypto_traits::sign::DetachedSignature as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A detached signature over a message hash.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// Signs a message with a secret signing key.
pub fn sign_bytes(secret: &SigSecretKey, message: &[u8]) -> Result<Signature> {
    let secret_key = secret.as_mldsa65()?;
    let digest = hash_data(message);
    let signature = mldsa65::detached_sign(&digest, &secret_key);
    Ok(Signature(signature.as_bytes().to_vec()))
}

/// Verifies a signature produced by [`sign_bytes`].
pub fn verify_bytes(public: &SigPublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    let public_key = public.as_mldsa65()?;
    let detached = mldsa65::DetachedSignature::from_bytes(&signature.0)
        .map_err(|_| WeftError::auth("Failed to reconstruct signature"))?;
    let digest = hash_data(message);
    mldsa65::verify_detached_signature(&detached, &digest, &public_key)
        .map_err(|_| WeftError::auth("Signature verification failed"))
}

/// Signs a serializable value (bincode form).
pub fn sign_data<T: Serialize>(secret: &SigSecretKey, data: &T) -> Result<Signature> {
    let serialized = bincode::serialize(data)
        .map_err(|e| WeftError::serialization(format!("Failed to serialize for signing: {}", e)))?;
    sign_bytes(secret, &serialized)
}

/// Verifies a signature over a serializable value.
pub fn verify_data_signature<T: Serialize>(
    public: &SigPublicKey,
    data: &T,
    signature: &Signature,
) -> Result<()> {
    let serialized = bincode::serialize(data).map_err(|e| {
        WeftError::serialization(format!("Failed to serialize for verification: {}", e))
    })?;
    verify_bytes(public, &serialized, signature)
}
