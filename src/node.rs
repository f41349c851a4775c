//! Node runtime: the one value that owns the identity, store, CAS handle,
//! outboxes, and update bus, constructs thread engines, and publishes the
//! node root to the name layer.
//!
//! Publishing is coalesced through an explicit state machine (Idle,
//! Publishing, PublishingAgain): overlapping publishes collapse so only the
//! latest root reaches the name system, and status events fire only on the
//! idle transitions, never once per queued publish.

use crate::block::BlockId;
use crate::cas::CasClient;
use crate::crypto::keys::{IdentityKeyPair, PeerId, ThreadId, ThreadKey};
use crate::error::{Result, WeftError};
use crate::outbox::{CafeOutbox, CafePeer, CafeSender, PeerSender, ThreadsOutbox};
use crate::store::{BlockStoreIndex, ThreadKind, ThreadRecord, ThreadState};
use crate::thread::{Thread, ThreadContext};
use crate::update::{StatusEvent, ThreadUpdate, UpdateBus};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many times a root re-add is attempted before the seed cycle fails.
const SEED_ADD_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishPhase {
    Idle,
    Publishing,
    PublishingAgain,
}

#[derive(Debug)]
struct CoalescerState {
    phase: PublishPhase,
    latest: Option<BlockId>,
}

/// Collapses overlapping publish requests into at most one in-flight
/// publish plus one queued re-run carrying the newest root.
#[derive(Debug)]
struct PublishCoalescer {
    state: Mutex<CoalescerState>,
}

impl PublishCoalescer {
    fn new() -> Self {
        Self {
            state: Mutex::new(CoalescerState {
                phase: PublishPhase::Idle,
                latest: None,
            }),
        }
    }

    /// Registers a publish request. Returns true if the caller becomes the
    /// runner; false if an existing runner will pick the root up.
    fn begin(&self, root: BlockId) -> bool {
        let mut state = self.state.lock().expect("publish lock poisoned");
        state.latest = Some(root);
        match state.phase {
            PublishPhase::Idle => {
                state.phase = PublishPhase::Publishing;
                true
            }
            PublishPhase::Publishing | PublishPhase::PublishingAgain => {
                state.phase = PublishPhase::PublishingAgain;
                false
            }
        }
    }

    /// The newest requested root.
    fn target(&self) -> Option<BlockId> {
        self.state.lock().expect("publish lock poisoned").latest
    }

    /// Ends one publish round. Returns true when another round is needed
    /// because a newer root arrived mid-flight.
    fn finish_round(&self) -> bool {
        let mut state = self.state.lock().expect("publish lock poisoned");
        match state.phase {
            PublishPhase::PublishingAgain => {
                state.phase = PublishPhase::Publishing;
                true
            }
            _ => {
                state.phase = PublishPhase::Idle;
                state.latest = None;
                false
            }
        }
    }
}

/// Runs publish rounds until no newer root is pending, emitting status
/// events only on the idle-edge transitions.
fn run_publish(
    publisher: &PublishCoalescer,
    cas: &dyn CasClient,
    updates: &UpdateBus,
    root: BlockId,
) {
    if !publisher.begin(root) {
        debug!(root = %root.short(), "publish coalesced onto in-flight run");
        return;
    }
    updates.publish_status(StatusEvent::Publishing);

    let mut ok = true;
    loop {
        let target = match publisher.target() {
            Some(target) => target,
            None => break,
        };
        ok = match cas.publish(&target) {
            Ok(name) => {
                debug!(root = %target.short(), name, "root published");
                true
            }
            Err(e) => {
                // Not an error for upstream; the next seed cycle retries.
                warn!(root = %target.short(), "publish failed: {}", e);
                false
            }
        };
        if !publisher.finish_round() {
            break;
        }
    }

    updates.publish_status(if ok {
        StatusEvent::PublishComplete
    } else {
        StatusEvent::PublishFailed
    });
}

/// The running node.
pub struct NodeRuntime {
    identity: Arc<IdentityKeyPair>,
    cas: Arc<dyn CasClient>,
    index: Arc<BlockStoreIndex>,
    peer_outbox: Arc<ThreadsOutbox>,
    cafe_outbox: Arc<CafeOutbox>,
    updates: Arc<UpdateBus>,
    seed_lock: Mutex<()>,
    root: Mutex<Option<BlockId>>,
    publisher: Arc<PublishCoalescer>,
}

impl NodeRuntime {
    /// Wires up a node from its collaborators.
    pub fn new(
        identity: IdentityKeyPair,
        cas: Arc<dyn CasClient>,
        index: Arc<BlockStoreIndex>,
        peer_sender: Arc<dyn PeerSender>,
        cafe_sender: Arc<dyn CafeSender>,
        cafes: Vec<CafePeer>,
        envelope_ttl_ms: u64,
    ) -> Self {
        let cafe_outbox = Arc::new(CafeOutbox::new(index.clone(), cafes, cafe_sender));
        let peer_outbox = Arc::new(ThreadsOutbox::new(
            peer_sender,
            cafe_outbox.clone(),
            envelope_ttl_ms,
        ));
        Self {
            identity: Arc::new(identity),
            cas,
            index,
            peer_outbox,
            cafe_outbox,
            updates: Arc::new(UpdateBus::new()),
            seed_lock: Mutex::new(()),
            root: Mutex::new(None),
            publisher: Arc::new(PublishCoalescer::new()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn index(&self) -> &Arc<BlockStoreIndex> {
        &self.index
    }

    pub fn cafe_outbox(&self) -> &Arc<CafeOutbox> {
        &self.cafe_outbox
    }

    pub fn peer_outbox(&self) -> &Arc<ThreadsOutbox> {
        &self.peer_outbox
    }

    /// Subscribes to thread updates.
    pub fn subscribe(&self) -> Receiver<ThreadUpdate> {
        self.updates.subscribe()
    }

    /// Subscribes to node status events.
    pub fn subscribe_status(&self) -> Receiver<StatusEvent> {
        self.updates.subscribe_status()
    }

    fn thread_context(&self) -> ThreadContext {
        ThreadContext {
            identity: self.identity.clone(),
            cas: self.cas.clone(),
            index: self.index.clone(),
            peer_outbox: self.peer_outbox.clone(),
            cafe_outbox: self.cafe_outbox.clone(),
            updates: self.updates.clone(),
        }
    }

    /// Creates a new thread with a fresh key, owned by this node.
    pub fn add_thread(
        &self,
        name: &str,
        kind: ThreadKind,
        schema_id: Option<String>,
    ) -> Result<Thread> {
        self.adopt_thread(
            ThreadKey::generate(),
            name,
            kind,
            schema_id,
            self.peer_id(),
        )
    }

    /// Registers a thread whose key was shared by another peer (accepting an
    /// invite). `initiator` names the thread's creator.
    pub fn adopt_thread(
        &self,
        secret: ThreadKey,
        name: &str,
        kind: ThreadKind,
        schema_id: Option<String>,
        initiator: PeerId,
    ) -> Result<Thread> {
        let record = ThreadRecord {
            id: secret.thread_id(),
            key: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            state: ThreadState::Joined,
            initiator,
            schema_id,
            secret: secret.to_bytes()?,
            head: vec![],
        };
        self.index.add_thread(&record)?;
        info!(thread = %record.id, name, "thread added");
        Thread::new(&record, self.thread_context())
    }

    /// Builds the engine for a known thread.
    pub fn thread(&self, id: &ThreadId) -> Result<Thread> {
        let record = self
            .index
            .thread(id)?
            .ok_or_else(|| WeftError::not_found(format!("thread {}", id.as_str())))?;
        Thread::new(&record, self.thread_context())
    }

    /// Reconstructs engines for every persisted thread (startup).
    pub fn threads(&self) -> Result<Vec<Thread>> {
        let ctx = self.thread_context();
        self.index
            .threads()?
            .into_iter()
            .map(|record| Thread::new(&record, ctx.clone()))
            .collect()
    }

    /// Leaves a thread and purges its local rows. Indexed blocks remain.
    pub fn remove_thread(&self, id: &ThreadId) -> Result<BlockId> {
        let thread = self.thread(id)?;
        let hash = thread.leave()?;
        self.index.delete_thread_peers(id)?;
        self.index.delete_thread(id)?;
        info!(thread = %id, "thread removed");
        Ok(hash)
    }

    /// Flushes both outboxes once. Idempotent and safe to interrupt.
    pub fn flush_outboxes(&self) -> Result<()> {
        self.peer_outbox.flush()?;
        self.cafe_outbox.flush()?;
        Ok(())
    }

    // ---- seeding and publishing ---------------------------------------

    /// Serialized snapshot of every thread's id and HEAD: the node root
    /// that gets published under the node's name.
    fn root_manifest(&self) -> Result<Vec<u8>> {
        let mut entries: Vec<(String, Vec<BlockId>)> = self
            .index
            .threads()?
            .into_iter()
            .map(|record| (record.id.as_str().to_string(), record.head))
            .collect();
        entries.sort();
        bincode::serialize(&entries)
            .map_err(|e| WeftError::serialization(format!("Failed to encode root: {}", e)))
    }

    /// Re-adds the node root to the CAS and publishes the new root id.
    ///
    /// Seeding is serialized by a dedicated lock; the add is retried a few
    /// times before the cycle fails. Publishing happens in the background
    /// and absorbs its own errors.
    pub fn seed_node(&self) -> Result<BlockId> {
        let root = {
            let _guard = self.seed_lock.lock().expect("seed lock poisoned");
            let manifest = self.root_manifest()?;

            let mut stored = None;
            let mut last_err = None;
            for attempt in 1..=SEED_ADD_ATTEMPTS {
                match self.cas.put(&manifest, true) {
                    Ok(id) => {
                        stored = Some(id);
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, "root add failed: {}", e);
                        last_err = Some(e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            let root = stored.ok_or_else(|| {
                last_err.unwrap_or_else(|| WeftError::transient("root add failed"))
            })?;
            *self.root.lock().expect("root lock poisoned") = Some(root);
            root
        };

        self.publish(root);
        Ok(root)
    }

    /// The most recently seeded root, if any.
    pub fn root(&self) -> Option<BlockId> {
        *self.root.lock().expect("root lock poisoned")
    }

    /// Requests a background publish of `root`. Overlapping requests
    /// coalesce onto the newest root.
    pub fn publish(&self, root: BlockId) {
        let publisher = Arc::clone(&self.publisher);
        let cas = Arc::clone(&self.cas);
        let updates = Arc::clone(&self.updates);
        std::thread::spawn(move || run_publish(&publisher, cas.as_ref(), &updates, root));
    }

    /// Runs the publish loop on the calling thread.
    pub fn publish_blocking(&self, root: BlockId) {
        run_publish(&self.publisher, self.cas.as_ref(), &self.updates, root);
    }
}

impl std::fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("peer_id", &self.peer_id().as_str())
            .finish()
    }
}
