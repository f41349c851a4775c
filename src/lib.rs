//! # weft
//!
//! A peer-to-peer node core for collaborative, encrypted **threads**:
//! shared, append-only logs distributed over a content-addressed store.
//! Each thread is a Merkle-DAG of signed, encrypted blocks; concurrent
//! updates are reconciled by explicit cleartext MERGE blocks, so peers that
//! exchange all blocks converge on the same HEAD.
//!
//! ## Model
//!
//! - Peers hold long-lived ML-DSA-65 identity keypairs; envelopes between
//!   peers are signed and verified against the sender's peer id.
//! - A thread is named by a keypair; possession of the thread key is
//!   membership. Block content is AES-256-GCM encrypted under a key derived
//!   from the thread secret.
//! - Block ids are SHA3-256 hashes of the exact bytes stored in the CAS,
//!   so re-publication deduplicates and receives are idempotent.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft::{
//!     BlockStoreIndex, CafeSender, Envelope, IdentityKeyPair, MemoryCas, NodeRuntime,
//!     PeerId, PeerSender, ThreadKind, DEFAULT_ENVELOPE_TTL_MS,
//! };
//!
//! struct Transport;
//!
//! impl PeerSender for Transport {
//!     fn send(&self, _peer: &PeerId, _envelope: &Envelope) -> weft::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! impl CafeSender for Transport {
//!     fn deliver(&self, _cafe: &PeerId, _ciphertext: &[u8]) -> weft::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> weft::Result<()> {
//! let node = Arc::new(NodeRuntime::new(
//!     IdentityKeyPair::generate(),
//!     Arc::new(MemoryCas::new()),
//!     Arc::new(BlockStoreIndex::open("data/index")?),
//!     Arc::new(Transport),
//!     Arc::new(Transport),
//!     vec![],
//!     DEFAULT_ENVELOPE_TTL_MS,
//! ));
//!
//! let thread = node.add_thread("holidays", ThreadKind::Open, None)?;
//! thread.add_message("hello")?;
//! node.seed_node()?;
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod cas;
pub mod config;
pub mod crypto;
pub mod error;
pub mod node;
pub mod outbox;
pub mod store;
pub mod thread;
pub mod update;

pub use block::{
    BlockHeader, BlockId, BlockType, Envelope, ThreadBlock, AnnouncePayload, CommentPayload,
    FilesPayload, FlagPayload, IgnorePayload, JoinPayload, LikePayload, MessagePayload,
};
pub use cas::{CasClient, MemoryCas};
pub use config::{load_or_create_identity, CafeConfig, NodeConfig};
pub use crypto::{IdentityKeyPair, PeerId, ThreadId, ThreadKey, WrapKeyPair, WrapPublicKey};
pub use error::{Result, WeftError};
pub use node::NodeRuntime;
pub use outbox::{
    CafeOutbox, CafePeer, CafeRequest, CafeSender, PeerSender, ThreadsOutbox,
    DEFAULT_ENVELOPE_TTL_MS,
};
pub use store::{
    BlockRow, BlockStoreIndex, ContactRow, PointerRow, ThreadKind, ThreadPeerRow, ThreadRecord,
    ThreadState,
};
pub use thread::{Commit, Head, Thread, ThreadContext, ThreadInfo};
pub use update::{StatusEvent, ThreadUpdate, UpdateBus};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
