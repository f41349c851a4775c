//! Block wire format and content addressing.
//!
//! A thread is a Merkle-DAG of blocks. Each block is serialized with bincode
//! into a canonical byte form, encrypted (except MERGE), and stored in the
//! content-addressed store; its id is the SHA3-256 hash of the exact stored
//! bytes. Byte-identical re-publication therefore yields the identical id.

use crate::crypto::keys::{PeerId, SigPublicKey, ThreadId};
use crate::crypto::signature::{sign_bytes, verify_bytes, Signature};
use crate::crypto::{hash_data, IdentityKeyPair};
use crate::error::{Result, WeftError};
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;

pub mod payload;

pub use payload::{
    decode_payload, encode_payload, AnnouncePayload, CommentPayload, FilesPayload, FlagPayload,
    IgnorePayload, JoinPayload, LikePayload, MessagePayload,
};

/// A 32-byte SHA3-256 content hash identifying a block.
///
/// The hash is computed over the exact ciphertext bytes stored in the CAS.
/// The text form is base58.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Computes the id of stored block bytes.
    pub fn compute(stored_bytes: &[u8]) -> Self {
        Self(hash_data(stored_bytes))
    }

    /// Creates a BlockId from raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the base58 string representation.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Parses a BlockId from a base58 string.
    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| WeftError::malformed("Invalid base58 block id"))?;
        if bytes.len() != 32 {
            return Err(WeftError::malformed("Block id must be exactly 32 bytes"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns a short form for display (first 8 bytes, hex).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}...)", self.short())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// Type discriminator for thread blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    /// A peer joined the thread.
    Join = 0,
    /// A peer announced itself (or re-announced its current state).
    Announce = 1,
    /// A peer left the thread.
    Leave = 2,
    /// A text message.
    Message = 3,
    /// A files record referencing stored content.
    Files = 4,
    /// A comment targeting another block.
    Comment = 5,
    /// A like targeting another block.
    Like = 6,
    /// User intent to hide a target block at presentation time.
    Ignore = 7,
    /// User intent to flag a target block for review.
    Flag = 8,
    /// Reconciliation of concurrent branches. Stored cleartext.
    Merge = 9,
}

impl BlockType {
    /// Returns true if a block of this type must carry a payload.
    ///
    /// MERGE blocks never have one; LEAVE blocks need none (the header's
    /// author says who left).
    pub fn requires_payload(&self) -> bool {
        !matches!(self, BlockType::Merge | BlockType::Leave)
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::Join => "JOIN",
            BlockType::Announce => "ANNOUNCE",
            BlockType::Leave => "LEAVE",
            BlockType::Message => "MESSAGE",
            BlockType::Files => "FILES",
            BlockType::Comment => "COMMENT",
            BlockType::Like => "LIKE",
            BlockType::Ignore => "IGNORE",
            BlockType::Flag => "FLAG",
            BlockType::Merge => "MERGE",
        };
        write!(f, "{}", name)
    }
}

/// Block header: creation time, parent ids, and author.
///
/// An empty parent list marks a genesis block. Field order is part of the
/// wire format; do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Creation time in milliseconds since the Unix epoch. Advisory only;
    /// ordering comes from the DAG.
    pub date_ms: u64,
    /// Parent block ids: 0 for genesis, 1 for a linear append, >= 2 for MERGE.
    pub parents: Vec<BlockId>,
    /// Peer id of the author. Empty for deterministic MERGE blocks.
    pub author: PeerId,
}

/// One node in a thread's DAG.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadBlock {
    pub header: BlockHeader,
    pub block_type: BlockType,
    /// Bincode-encoded typed payload; the type is implied by `block_type`.
    pub payload: Option<Vec<u8>>,
}

impl ThreadBlock {
    /// Serializes the block into its canonical byte form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| WeftError::serialization(format!("Failed to serialize block: {}", e)))
    }

    /// Deserializes a block from its canonical byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| WeftError::malformed(format!("Failed to decode block: {}", e)))
    }

    /// Checks the payload rule: only MERGE and LEAVE may omit it.
    pub fn check_payload(&self) -> Result<()> {
        let missing = self.payload.as_ref().map_or(true, |p| p.is_empty());
        if missing && self.block_type.requires_payload() {
            return Err(WeftError::malformed(format!(
                "nil payload for {} block",
                self.block_type
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ThreadBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadBlock")
            .field("type", &self.block_type)
            .field("parents", &self.header.parents)
            .field("author", &self.header.author)
            .field("payload_len", &self.payload.as_ref().map(|p| p.len()))
            .finish()
    }
}

/// Transport wrapper carrying a block between peers.
///
/// Signed by the sending peer's identity key; receivers verify the signature
/// and that the claimed sender id matches the signing key before handling
/// the block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub thread_id: ThreadId,
    pub hash: BlockId,
    pub ciphertext: Vec<u8>,
    pub sender: PeerId,
    pub sender_key: SigPublicKey,
    pub signature: Signature,
}

impl Envelope {
    /// Creates and signs an envelope with the local identity key.
    pub fn seal(
        identity: &IdentityKeyPair,
        thread_id: ThreadId,
        hash: BlockId,
        ciphertext: Vec<u8>,
    ) -> Result<Self> {
        let sender = identity.peer_id();
        let signing = Self::signing_bytes(&thread_id, &hash, &ciphertext, &sender);
        let signature = sign_bytes(identity.secret(), &signing)?;
        Ok(Self {
            thread_id,
            hash,
            ciphertext,
            sender,
            sender_key: identity.public().clone(),
            signature,
        })
    }

    /// Verifies sender identity and signature.
    pub fn verify(&self) -> Result<()> {
        let derived = PeerId::from_public_key(&self.sender_key);
        let matches: bool = derived
            .as_str()
            .as_bytes()
            .ct_eq(self.sender.as_str().as_bytes())
            .into();
        if !matches {
            return Err(WeftError::auth("Envelope sender does not match signing key"));
        }

        let signing =
            Self::signing_bytes(&self.thread_id, &self.hash, &self.ciphertext, &self.sender);
        verify_bytes(&self.sender_key, &signing, &self.signature)
    }

    fn signing_bytes(
        thread_id: &ThreadId,
        hash: &BlockId,
        ciphertext: &[u8],
        sender: &PeerId,
    ) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            thread_id.as_str().len() + 32 + ciphertext.len() + sender.as_str().len(),
        );
        bytes.extend_from_slice(thread_id.as_str().as_bytes());
        bytes.extend_from_slice(hash.as_bytes());
        bytes.extend_from_slice(ciphertext);
        bytes.extend_from_slice(sender.as_str().as_bytes());
        bytes
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
