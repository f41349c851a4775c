//! Cryptographic primitives for weft.
//!
//! This module provides the operations the thread protocol is built on:
//!
//! - **ML-DSA-65**: detached signatures for peer and thread identities
//! - **ML-KEM-768**: key encapsulation for envelope encryption
//! - **AES-256-GCM**: authenticated symmetric encryption of block content
//! - **SHA3-256**: content hashing and id derivation

use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};

pub mod encryption;
pub mod keys;
pub mod signature;

pub use encryption::{
    decrypt_envelope, decrypt_symmetric, encrypt_envelope, encrypt_symmetric, SYM_KEY_BYTES,
    SYM_NONCE_BYTES,
};
pub use keys::{
    IdentityKeyPair, PeerId, SigPublicKey, SigSecretKey, ThreadId, ThreadKey, WrapKeyPair,
    WrapPublicKey, WrapSecretKey,
};
pub use signature::{sign_bytes, sign_data, verify_bytes, verify_data_signature, Signature};

/// Cryptographic hash function using SHA3-256.
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Base58 form of the SHA3-256 digest of `data`.
///
/// Peer ids, thread ids, and block ids all use this derivation, so every
/// identifier in the system shares one compact text form.
pub fn base58_digest(data: &[u8]) -> String {
    bs58::encode(hash_data(data)).into_string()
}

/// Fills a buffer with cryptographically secure random bytes.
pub fn secure_random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
