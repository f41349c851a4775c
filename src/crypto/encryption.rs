//! Symmetric and hybrid envelope encryption.
//!
//! Block content is encrypted with AES-256-GCM under the thread content key,
//! with a random 12-byte nonce prepended to the ciphertext. Data addressed to
//! a specific peer (cafe requests, offline deliveries) uses a hybrid scheme:
//! ML-KEM-768 encapsulation, HKDF-SHA3-512 key derivation with the KEM
//! ciphertext bound into the salt, then AES-256-GCM.

use crate::crypto::keys::{WrapPublicKey, WrapSecretKey};
use crate::error::{Result, WeftError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{Ciphertext as _, SharedSecret as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::Sha3_512;
use zeroize::Zeroizing;

/// AES-256-GCM key size in bytes.
pub const SYM_KEY_BYTES: usize = 32;

/// AES-GCM nonce size in bytes.
pub const SYM_NONCE_BYTES: usize = 12;

/// Domain separator bound into the envelope key derivation salt.
const ENVELOPE_SALT_PREFIX: &[u8] = b"weft-v1-";

/// Encrypts `plaintext` with AES-256-GCM under `key`.
///
/// A random nonce is generated per call and prepended to the ciphertext, so
/// the output is `nonce || ciphertext+tag`.
pub fn encrypt_symmetric(key: &[u8; SYM_KEY_BYTES], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; SYM_NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| WeftError::auth("AES-GCM encryption failed"))?;

    let mut out = Vec::with_capacity(SYM_NONCE_BYTES + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts data produced by [`encrypt_symmetric`].
pub fn decrypt_symmetric(key: &[u8; SYM_KEY_BYTES], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < SYM_NONCE_BYTES {
        return Err(WeftError::auth("Ciphertext shorter than nonce"));
    }
    let (nonce_bytes, ciphertext) = data.split_at(SYM_NONCE_BYTES);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| WeftError::auth("AES-GCM decryption failed"))
}

/// Derives the AEAD key and nonce from a KEM shared secret.
///
/// The KEM ciphertext is bound into the HKDF salt so a swapped encapsulation
/// cannot be combined with a different payload.
fn derive_envelope_aead(
    shared_secret: &[u8],
    kem_ciphertext: &[u8],
) -> Result<(Zeroizing<[u8; SYM_KEY_BYTES]>, [u8; SYM_NONCE_BYTES])> {
    let mut salt = Vec::with_capacity(ENVELOPE_SALT_PREFIX.len() + kem_ciphertext.len());
    salt.extend_from_slice(ENVELOPE_SALT_PREFIX);
    salt.extend_from_slice(kem_ciphertext);

    let hk = Hkdf::<Sha3_512>::new(Some(&salt), shared_secret);

    let mut key = Zeroizing::new([0u8; SYM_KEY_BYTES]);
    hk.expand(b"weft-v1 envelope key", key.as_mut())
        .map_err(|_| WeftError::key("Envelope key derivation failed"))?;

    let mut nonce = [0u8; SYM_NONCE_BYTES];
    hk.expand(b"weft-v1 envelope nonce", &mut nonce)
        .map_err(|_| WeftError::key("Envelope nonce derivation failed"))?;

    Ok((key, nonce))
}

/// Encrypts `plaintext` to a peer's wrap key.
///
/// Output is `kem_ciphertext || aead_ciphertext`. Only the holder of the
/// matching [`WrapSecretKey`] can decapsulate and decrypt.
pub fn encrypt_envelope(recipient: &WrapPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let public_key = recipient.as_mlkem768()?;
    let (shared_secret, kem_ciphertext) = mlkem768::encapsulate(&public_key);

    let (key, nonce_bytes) =
        derive_envelope_aead(shared_secret.as_bytes(), kem_ciphertext.as_bytes())?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| WeftError::auth("Envelope encryption failed"))?;

    let mut out =
        Vec::with_capacity(kem_ciphertext.as_bytes().len() + ciphertext.len());
    out.extend_from_slice(kem_ciphertext.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts data produced by [`encrypt_envelope`].
pub fn decrypt_envelope(secret: &WrapSecretKey, data: &[u8]) -> Result<Vec<u8>> {
    let kem_len = mlkem768::ciphertext_bytes();
    if data.len() < kem_len {
        return Err(WeftError::auth("Envelope shorter than KEM ciphertext"));
    }
    let (kem_bytes, ciphertext) = data.split_at(kem_len);

    let kem_ciphertext = mlkem768::Ciphertext::from_bytes(kem_bytes)
        .map_err(|_| WeftError::auth("Failed to reconstruct KEM ciphertext"))?;
    let secret_key = secret.as_mlkem768()?;
    let shared_secret = mlkem768::decapsulate(&kem_ciphertext, &secret_key);

    let (key, nonce_bytes) = derive_envelope_aead(shared_secret.as_bytes(), kem_bytes)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
        .map_err(|_| WeftError::auth("Envelope decryption failed"))
}
