//! Typed block payloads.
//!
//! The payload carried by a [`ThreadBlock`](crate::block::ThreadBlock) is a
//! bincode-encoded value of the type implied by the block type. COMMENT,
//! LIKE, IGNORE, and FLAG payloads reference a target block; JOIN and
//! ANNOUNCE carry the peer's contact card so receivers can route envelopes
//! (and offline mail) to it.

use crate::block::BlockId;
use crate::crypto::keys::PeerId;
use crate::error::{Result, WeftError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encodes a typed payload into block payload bytes.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    bincode::serialize(payload)
        .map_err(|e| WeftError::serialization(format!("Failed to encode payload: {}", e)))
}

/// Decodes block payload bytes into a typed payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| WeftError::malformed(format!("Failed to decode payload: {}", e)))
}

/// JOIN: a peer entered the thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    /// The joining peer.
    pub peer: PeerId,
    /// Display name, if the peer shared one.
    pub username: String,
    /// Cafe inboxes where the peer receives offline mail.
    pub inboxes: Vec<String>,
}

/// ANNOUNCE: a peer re-states its contact card and drives re-sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub peer: PeerId,
    pub username: String,
    pub inboxes: Vec<String>,
}

/// MESSAGE: a short text entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub body: String,
}

/// FILES: content added to the thread.
///
/// `target` is the CAS id of the stored file node (the content itself never
/// travels inside a block).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesPayload {
    pub target: BlockId,
    /// Optional caption.
    pub body: String,
}

/// COMMENT on a target block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentPayload {
    pub target: BlockId,
    pub body: String,
}

/// LIKE of a target block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikePayload {
    pub target: BlockId,
}

/// IGNORE: hide a target block at presentation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnorePayload {
    pub target: BlockId,
}

/// FLAG: mark a target block for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagPayload {
    pub target: BlockId,
}
