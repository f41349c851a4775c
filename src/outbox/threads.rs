//! Per-peer FIFO outbox for direct envelope delivery.
//!
//! Every enqueued envelope is retried with bounded exponential backoff until
//! it is delivered or outlives its TTL, at which point it is handed to the
//! cafe outbox's offline delivery path. Order is preserved per peer: a
//! failing head envelope blocks the rest of that peer's queue, never another
//! peer's.

use crate::block::{current_timestamp_millis, Envelope};
use crate::crypto::keys::PeerId;
use crate::error::Result;
use crate::outbox::cafe::CafeOutbox;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Default time an envelope may wait for direct delivery before moving to
/// the offline path (one day).
pub const DEFAULT_ENVELOPE_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// First retry delay; doubles per attempt.
const RETRY_BASE_MS: u64 = 500;

/// Retry delay ceiling (one hour).
const RETRY_MAX_MS: u64 = 60 * 60 * 1000;

/// Transport seam for direct peer delivery.
pub trait PeerSender: Send + Sync {
    fn send(&self, peer: &PeerId, envelope: &Envelope) -> Result<()>;
}

#[derive(Debug, Clone)]
struct QueuedEnvelope {
    envelope: Envelope,
    queued_ms: u64,
    attempts: u32,
    next_attempt_ms: u64,
}

/// Per-peer FIFO of envelopes awaiting delivery.
pub struct ThreadsOutbox {
    queues: Mutex<HashMap<PeerId, VecDeque<QueuedEnvelope>>>,
    // Serializes flush runs so concurrent flushers cannot reorder a peer's
    // queue; enqueues stay independent.
    flush_lock: Mutex<()>,
    sender: Arc<dyn PeerSender>,
    cafe: Arc<CafeOutbox>,
    ttl_ms: u64,
}

impl ThreadsOutbox {
    pub fn new(sender: Arc<dyn PeerSender>, cafe: Arc<CafeOutbox>, ttl_ms: u64) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
            sender,
            cafe,
            ttl_ms,
        }
    }

    /// Enqueues an envelope for a peer.
    pub fn add(&self, peer: &PeerId, envelope: Envelope) -> Result<()> {
        let mut queues = self.queues.lock().expect("outbox lock poisoned");
        queues.entry(peer.clone()).or_default().push_back(QueuedEnvelope {
            envelope,
            queued_ms: current_timestamp_millis(),
            attempts: 0,
            next_attempt_ms: 0,
        });
        Ok(())
    }

    /// Number of queued envelopes for one peer.
    pub fn pending(&self, peer: &PeerId) -> usize {
        self.queues
            .lock()
            .expect("outbox lock poisoned")
            .get(peer)
            .map_or(0, |q| q.len())
    }

    /// Total queued envelopes across peers.
    pub fn total_pending(&self) -> usize {
        self.queues
            .lock()
            .expect("outbox lock poisoned")
            .values()
            .map(|q| q.len())
            .sum()
    }

    /// Attempts delivery for every due envelope. Safe to interrupt and
    /// re-run; delivered envelopes are removed, failures back off in place.
    ///
    /// Returns the number of envelopes delivered.
    pub fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().expect("flush lock poisoned");
        let now = current_timestamp_millis();
        let peers: Vec<PeerId> = {
            let queues = self.queues.lock().expect("outbox lock poisoned");
            queues.keys().cloned().collect()
        };

        let mut delivered = 0usize;
        for peer in peers {
            delivered += self.flush_peer(&peer, now)?;
        }
        Ok(delivered)
    }

    fn flush_peer(&self, peer: &PeerId, now: u64) -> Result<usize> {
        let mut delivered = 0usize;
        loop {
            // Take the head entry under the lock, then deliver off-lock so a
            // slow transport cannot stall enqueues.
            let head = {
                let mut queues = self.queues.lock().expect("outbox lock poisoned");
                let queue = match queues.get_mut(peer) {
                    Some(q) => q,
                    None => return Ok(delivered),
                };
                match queue.front() {
                    Some(entry) if entry.next_attempt_ms <= now => queue.pop_front(),
                    _ => {
                        if queue.is_empty() {
                            queues.remove(peer);
                        }
                        return Ok(delivered);
                    }
                }
            };
            let mut entry = match head {
                Some(entry) => entry,
                None => return Ok(delivered),
            };

            if now.saturating_sub(entry.queued_ms) > self.ttl_ms {
                debug!(peer = %peer, "envelope expired, moving to offline delivery");
                self.cafe.add_delivery(peer.clone(), entry.envelope)?;
                continue;
            }

            match self.sender.send(peer, &entry.envelope) {
                Ok(()) => {
                    delivered += 1;
                }
                Err(e) => {
                    warn!(peer = %peer, attempts = entry.attempts + 1, "delivery failed: {}", e);
                    entry.attempts += 1;
                    entry.next_attempt_ms = now + retry_delay(entry.attempts);
                    let mut queues = self.queues.lock().expect("outbox lock poisoned");
                    queues.entry(peer.clone()).or_default().push_front(entry);
                    return Ok(delivered);
                }
            }
        }
    }
}

fn retry_delay(attempts: u32) -> u64 {
    RETRY_BASE_MS
        .saturating_mul(1u64 << attempts.saturating_sub(1).min(24))
        .min(RETRY_MAX_MS)
}

impl std::fmt::Debug for ThreadsOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadsOutbox")
            .field("pending", &self.total_pending())
            .finish()
    }
}
