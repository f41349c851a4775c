//! Content-addressed store interface.
//!
//! The engine never talks to a concrete store or DHT; it holds a
//! [`CasClient`] handle injected at node bootstrap. `put` must be
//! content-addressed: identical bytes yield the identical id, which is what
//! makes block re-publication deduplicate.

use crate::block::BlockId;
use crate::error::{Result, WeftError};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Capability interface over the content-addressed store.
pub trait CasClient: Send + Sync {
    /// Stores bytes and returns their content id. `pin` requests that the
    /// store retain the bytes locally.
    fn put(&self, data: &[u8], pin: bool) -> Result<BlockId>;

    /// Fetches bytes by content id. Returns `NotFound` for unknown ids.
    fn get(&self, id: &BlockId) -> Result<Vec<u8>>;

    /// Publishes `id` as the node's current root under the name layer and
    /// returns the published name.
    fn publish(&self, id: &BlockId) -> Result<String>;
}

/// In-memory [`CasClient`] used by tests and by embedders that bring no
/// store of their own.
///
/// Sharing one `MemoryCas` between several engines models a common network:
/// anything one peer puts, another can get.
#[derive(Default)]
pub struct MemoryCas {
    objects: Mutex<HashMap<BlockId, Vec<u8>>>,
    pinned: Mutex<HashSet<BlockId>>,
    published: Mutex<Vec<BlockId>>,
}

impl MemoryCas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if an object with this id is stored.
    pub fn contains(&self, id: &BlockId) -> bool {
        self.objects.lock().expect("cas lock poisoned").contains_key(id)
    }

    /// Returns true if the object is pinned.
    pub fn is_pinned(&self, id: &BlockId) -> bool {
        self.pinned.lock().expect("cas lock poisoned").contains(id)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("cas lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The history of published roots, oldest first.
    pub fn published(&self) -> Vec<BlockId> {
        self.published.lock().expect("cas lock poisoned").clone()
    }

    /// Removes an object, simulating a store that dropped it.
    pub fn remove(&self, id: &BlockId) {
        self.objects.lock().expect("cas lock poisoned").remove(id);
        self.pinned.lock().expect("cas lock poisoned").remove(id);
    }
}

impl CasClient for MemoryCas {
    fn put(&self, data: &[u8], pin: bool) -> Result<BlockId> {
        let id = BlockId::compute(data);
        self.objects
            .lock()
            .expect("cas lock poisoned")
            .insert(id, data.to_vec());
        if pin {
            self.pinned.lock().expect("cas lock poisoned").insert(id);
        }
        Ok(id)
    }

    fn get(&self, id: &BlockId) -> Result<Vec<u8>> {
        match self.objects.lock().expect("cas lock poisoned").get(id) {
            Some(data) => Ok(data.clone()),
            None => {
                debug!(id = %id.short(), "cas miss");
                Err(WeftError::not_found(format!("object {}", id.short())))
            }
        }
    }

    fn publish(&self, id: &BlockId) -> Result<String> {
        self.published.lock().expect("cas lock poisoned").push(*id);
        Ok(id.to_base58())
    }
}
