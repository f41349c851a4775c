//! Outbound delivery queues.
//!
//! [`ThreadsOutbox`] holds per-peer FIFOs of signed envelopes for direct
//! delivery; [`CafeOutbox`] holds store/pin and offline-delivery requests
//! bound for trusted cafe nodes. Both flush through narrow sender traits so
//! the transport stays out of the engine.

mod cafe;
mod threads;

pub use cafe::{CafeOutbox, CafePeer, CafeRequest, CafeSender};
pub use threads::{PeerSender, ThreadsOutbox, DEFAULT_ENVELOPE_TTL_MS};
