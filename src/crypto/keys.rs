//! Key material and identifier derivation.
//!
//! Three keypair roles exist in the system:
//!
//! - [`IdentityKeyPair`]: a peer's long-lived ML-DSA-65 signing keypair. The
//!   peer id is the base58 SHA3-256 digest of the public key.
//! - [`WrapKeyPair`]: an ML-KEM-768 keypair used as the target of hybrid
//!   envelope encryption (cafes publish one so queued requests can be
//!   encrypted to them).
//! - [`ThreadKey`]: a thread's keypair. The thread id derives from the public
//!   half; the symmetric content key that encrypts every non-MERGE block
//!   derives from the secret half. Sharing the thread key IS membership.

use crate::crypto::base58_digest;
use crate::error::{Result, WeftError};
use base64::{engine::general_purpose, Engine as _};
use hkdf::Hkdf;
use pqcrypto_mldsa::mldsa65;
use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{PublicKey as _, SecretKey as _};
use pqcrypto_traits::sign::{PublicKey as _, SecretKey as _};
use serde::{Deserialize, Serialize};
use sha3::Sha3_512;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// A peer identifier: the base58 SHA3-256 digest of a signing public key.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Derives the peer id for a signing public key.
    pub fn from_public_key(key: &SigPublicKey) -> Self {
        Self(base58_digest(key.as_bytes()))
    }

    /// Wraps an already-derived id string.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// A thread identifier: the base58 SHA3-256 digest of the thread public key.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(String);

impl ThreadId {
    /// Derives the thread id for a thread public key.
    pub fn from_public_key(key: &SigPublicKey) -> Self {
        Self(base58_digest(key.as_bytes()))
    }

    /// Wraps an already-derived id string.
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

/// An ML-DSA-65 public signing key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigPublicKey(Vec<u8>);

impl SigPublicKey {
    /// Validates the length and wraps raw public key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != mldsa65::public_key_bytes() {
            return Err(WeftError::key("Invalid ML-DSA-65 public key length"));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn as_mldsa65(&self) -> Result<mldsa65::PublicKey> {
        mldsa65::PublicKey::from_bytes(&self.0)
            .map_err(|_| WeftError::key("Failed to reconstruct ML-DSA-65 public key"))
    }
}

impl fmt::Debug for SigPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigPublicKey({} bytes)", self.0.len())
    }
}

/// An ML-DSA-65 secret signing key. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SigSecretKey(Vec<u8>);

impl SigSecretKey {
    /// Validates the length and wraps raw secret key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != mldsa65::secret_key_bytes() {
            return Err(WeftError::key("Invalid ML-DSA-65 secret key length"));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn as_mldsa65(&self) -> Result<mldsa65::SecretKey> {
        mldsa65::SecretKey::from_bytes(&self.0)
            .map_err(|_| WeftError::key("Failed to reconstruct ML-DSA-65 secret key"))
    }
}

impl fmt::Debug for SigSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigSecretKey(..)")
    }
}

/// An ML-KEM-768 public key for envelope encryption.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapPublicKey(Vec<u8>);

impl WrapPublicKey {
    /// Validates the length and wraps raw public key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != mlkem768::public_key_bytes() {
            return Err(WeftError::key("Invalid ML-KEM-768 public key length"));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses a base64 encoded public key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| WeftError::key(format!("Invalid base64 wrap key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Returns the base64 encoding of the key bytes.
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.0)
    }

    pub(crate) fn as_mlkem768(&self) -> Result<mlkem768::PublicKey> {
        mlkem768::PublicKey::from_bytes(&self.0)
            .map_err(|_| WeftError::key("Failed to reconstruct ML-KEM-768 public key"))
    }
}

impl fmt::Debug for WrapPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrapPublicKey({} bytes)", self.0.len())
    }
}

/// An ML-KEM-768 secret key. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct WrapSecretKey(Vec<u8>);

impl WrapSecretKey {
    /// Validates the length and wraps raw secret key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != mlkem768::secret_key_bytes() {
            return Err(WeftError::key("Invalid ML-KEM-768 secret key length"));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn as_mlkem768(&self) -> Result<mlkem768::SecretKey> {
        mlkem768::SecretKey::from_bytes(&self.0)
            .map_err(|_| WeftError::key("Failed to reconstruct ML-KEM-768 secret key"))
    }
}

impl fmt::Debug for WrapSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrapSecretKey(..)")
    }
}

/// A peer's long-lived signing keypair.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    public: SigPublicKey,
    secret: SigSecretKey,
}

impl IdentityKeyPair {
    /// Generates a fresh ML-DSA-65 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = mldsa65::keypair();
        Self {
            public: SigPublicKey(pk.as_bytes().to_vec()),
            secret: SigSecretKey(sk.as_bytes().to_vec()),
        }
    }

    pub fn public(&self) -> &SigPublicKey {
        &self.public
    }

    pub fn secret(&self) -> &SigSecretKey {
        &self.secret
    }

    /// The peer id derived from the public key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public)
    }

    /// Encodes the keypair as base64 for the identity file.
    pub fn to_base64(&self) -> Result<String> {
        let bytes = bincode::serialize(self)
            .map_err(|e| WeftError::serialization(format!("Failed to encode identity: {}", e)))?;
        Ok(general_purpose::STANDARD.encode(bytes))
    }

    /// Decodes a keypair from its base64 identity file form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| WeftError::key(format!("Invalid base64 identity: {}", e)))?;
        let pair: Self = bincode::deserialize(&bytes)
            .map_err(|e| WeftError::key(format!("Failed to decode identity: {}", e)))?;
        SigPublicKey::from_bytes(pair.public.as_bytes())?;
        SigSecretKey::from_bytes(pair.secret.as_bytes())?;
        Ok(pair)
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("peer_id", &self.peer_id().as_str())
            .finish()
    }
}

/// An ML-KEM-768 keypair for receiving envelope-encrypted data.
#[derive(Clone, Serialize, Deserialize)]
pub struct WrapKeyPair {
    public: WrapPublicKey,
    secret: WrapSecretKey,
}

impl WrapKeyPair {
    /// Generates a fresh ML-KEM-768 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = mlkem768::keypair();
        Self {
            public: WrapPublicKey(pk.as_bytes().to_vec()),
            secret: WrapSecretKey(sk.as_bytes().to_vec()),
        }
    }

    pub fn public(&self) -> &WrapPublicKey {
        &self.public
    }

    pub fn secret(&self) -> &WrapSecretKey {
        &self.secret
    }
}

impl fmt::Debug for WrapKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapKeyPair").finish()
    }
}

/// A thread's keypair.
///
/// The public half names the thread; the secret half derives the symmetric
/// content key. Every member of a thread holds the full key.
#[derive(Clone, Serialize, Deserialize)]
pub struct ThreadKey {
    public: SigPublicKey,
    secret: SigSecretKey,
}

impl ThreadKey {
    /// Generates a fresh thread keypair.
    pub fn generate() -> Self {
        let (pk, sk) = mldsa65::keypair();
        Self {
            public: SigPublicKey(pk.as_bytes().to_vec()),
            secret: SigSecretKey(sk.as_bytes().to_vec()),
        }
    }

    pub fn public(&self) -> &SigPublicKey {
        &self.public
    }

    /// The thread id derived from the public key.
    pub fn thread_id(&self) -> ThreadId {
        ThreadId::from_public_key(&self.public)
    }

    /// Derives the 32-byte AES-256-GCM content key from the thread secret.
    ///
    /// HKDF-SHA3-512 over the secret key bytes; deterministic, so every
    /// holder of the thread key derives the same content key.
    pub fn content_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        let hk = Hkdf::<Sha3_512>::new(Some(b"weft-v1 thread"), self.secret.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(b"weft-v1 thread content key", key.as_mut())
            .map_err(|_| WeftError::key("Content key derivation failed"))?;
        Ok(key)
    }

    /// Serializes the keypair for the thread record.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| WeftError::serialization(format!("Failed to encode thread key: {}", e)))
    }

    /// Deserializes a keypair from a thread record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: Self = bincode::deserialize(bytes)
            .map_err(|e| WeftError::key(format!("Failed to decode thread key: {}", e)))?;
        SigPublicKey::from_bytes(key.public.as_bytes())?;
        SigSecretKey::from_bytes(key.secret.as_bytes())?;
        Ok(key)
    }
}

impl fmt::Debug for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadKey")
            .field("thread_id", &self.thread_id().as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation_and_id() {
        let identity = IdentityKeyPair::generate();
        let id = identity.peer_id();
        assert!(!id.is_empty());
        assert_eq!(id, PeerId::from_public_key(identity.public()));

        let other = IdentityKeyPair::generate();
        assert_ne!(id, other.peer_id());
    }

    #[test]
    fn test_identity_base64_roundtrip() {
        let identity = IdentityKeyPair::generate();
        let encoded = identity.to_base64().unwrap();
        let restored = IdentityKeyPair::from_base64(&encoded).unwrap();
        assert_eq!(identity.peer_id(), restored.peer_id());
        assert_eq!(identity.secret().as_bytes(), restored.secret().as_bytes());
    }

    #[test]
    fn test_thread_key_content_key_is_shared() {
        let key = ThreadKey::generate();
        let restored = ThreadKey::from_bytes(&key.to_bytes().unwrap()).unwrap();

        assert_eq!(key.thread_id(), restored.thread_id());
        assert_eq!(*key.content_key().unwrap(), *restored.content_key().unwrap());
    }

    #[test]
    fn test_thread_keys_are_distinct() {
        let a = ThreadKey::generate();
        let b = ThreadKey::generate();
        assert_ne!(a.thread_id(), b.thread_id());
        assert_ne!(*a.content_key().unwrap(), *b.content_key().unwrap());
    }

    #[test]
    fn test_wrap_key_base64_roundtrip() {
        let pair = WrapKeyPair::generate();
        let encoded = pair.public().to_base64();
        let restored = WrapPublicKey::from_base64(&encoded).unwrap();
        assert_eq!(pair.public(), &restored);
    }

    #[test]
    fn test_bad_key_lengths_rejected() {
        assert!(SigPublicKey::from_bytes(&[0u8; 16]).is_err());
        assert!(SigSecretKey::from_bytes(&[0u8; 16]).is_err());
        assert!(WrapPublicKey::from_bytes(&[0u8; 16]).is_err());
        assert!(WrapSecretKey::from_bytes(&[0u8; 16]).is_err());
    }
}
