//! Queue of requests bound for cafe (pinning/relay) nodes.
//!
//! Requests are persisted in the store so they survive restarts, and are
//! encrypted per cafe with the hybrid envelope scheme, so cafes never see
//! request plaintext. A cafe's ack dequeues the request; failures leave it
//! for the next flush.

use crate::block::{current_timestamp_millis, BlockId, Envelope};
use crate::crypto::encryption::encrypt_envelope;
use crate::crypto::keys::{PeerId, ThreadId, WrapPublicKey};
use crate::error::{Result, WeftError};
use crate::store::{BlockStoreIndex, PointerRow};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A cafe node: its peer id and the public key requests are wrapped under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CafePeer {
    pub id: PeerId,
    pub wrap_key: WrapPublicKey,
}

/// A queued cafe request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CafeRequest {
    /// Ask the cafe to fetch and pin a block.
    Store(BlockId),
    /// Ask the cafe to snapshot a thread's current state.
    StoreThread(ThreadId),
    /// Leave an envelope at the cafe for an offline peer.
    Deliver { peer: PeerId, envelope: Envelope },
}

/// Transport seam for cafe delivery. `ciphertext` is the encrypted request.
pub trait CafeSender: Send + Sync {
    fn deliver(&self, cafe: &PeerId, ciphertext: &[u8]) -> Result<()>;
}

/// Persistent queue of cafe requests with a flusher.
pub struct CafeOutbox {
    index: Arc<BlockStoreIndex>,
    cafes: Mutex<Vec<CafePeer>>,
    sender: Arc<dyn CafeSender>,
}

impl CafeOutbox {
    pub fn new(
        index: Arc<BlockStoreIndex>,
        cafes: Vec<CafePeer>,
        sender: Arc<dyn CafeSender>,
    ) -> Self {
        Self {
            index,
            cafes: Mutex::new(cafes),
            sender,
        }
    }

    /// Enqueues a request.
    pub fn add(&self, request: CafeRequest) -> Result<()> {
        let bytes = bincode::serialize(&request)
            .map_err(|e| WeftError::serialization(format!("Failed to encode request: {}", e)))?;
        self.index.push_cafe_request(&bytes)?;
        Ok(())
    }

    /// Enqueues an offline delivery (the long-term path for envelopes that
    /// outlived their direct-delivery TTL).
    pub fn add_delivery(&self, peer: PeerId, envelope: Envelope) -> Result<()> {
        self.add(CafeRequest::Deliver { peer, envelope })
    }

    /// Replaces the configured cafe set.
    pub fn set_cafes(&self, cafes: Vec<CafePeer>) {
        *self.cafes.lock().expect("cafe lock poisoned") = cafes;
    }

    /// Number of queued requests.
    pub fn pending(&self) -> Result<usize> {
        Ok(self.index.cafe_request_entries()?.len())
    }

    /// Attempts delivery of every queued request to every configured cafe.
    ///
    /// A request is dequeued once every cafe has acked it. With no cafes
    /// configured the queue is drained as a no-op: blocks are already pinned
    /// locally, and there is nowhere to send.
    ///
    /// Returns the number of requests dequeued.
    pub fn flush(&self) -> Result<usize> {
        let cafes = self.cafes.lock().expect("cafe lock poisoned").clone();
        let entries = self.index.cafe_request_entries()?;
        if entries.is_empty() {
            return Ok(0);
        }

        if cafes.is_empty() {
            debug!(dropped = entries.len(), "no cafes configured, draining queue");
            for (key, _) in &entries {
                self.index.remove_cafe_request(key)?;
            }
            return Ok(0);
        }

        let mut flushed = 0usize;
        for (key, bytes) in entries {
            let mut acked = true;
            for cafe in &cafes {
                match self.send_to_cafe(cafe, &bytes) {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(cafe = %cafe.id, "cafe delivery failed: {}", e);
                        acked = false;
                    }
                }
            }
            if acked {
                // An offline delivery that reached the cafes leaves a pointer
                // so the sender knows where the peer's mail is waiting.
                if let Ok(CafeRequest::Deliver { peer, .. }) =
                    bincode::deserialize::<CafeRequest>(&bytes)
                {
                    for cafe in &cafes {
                        self.index.add_pointer(&PointerRow {
                            id: uuid::Uuid::new_v4().to_string(),
                            peer: peer.clone(),
                            cafe_inbox: cafe.id.as_str().to_string(),
                            date_ms: current_timestamp_millis(),
                        })?;
                    }
                }
                self.index.remove_cafe_request(&key)?;
                flushed += 1;
            }
        }

        debug!(flushed, "cafe outbox flushed");
        Ok(flushed)
    }

    fn send_to_cafe(&self, cafe: &CafePeer, request_bytes: &[u8]) -> Result<()> {
        let ciphertext = encrypt_envelope(&cafe.wrap_key, request_bytes)?;
        self.sender.deliver(&cafe.id, &ciphertext)
    }
}

impl std::fmt::Debug for CafeOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CafeOutbox")
            .field("cafes", &self.cafes.lock().expect("cafe lock poisoned").len())
            .finish()
    }
}
