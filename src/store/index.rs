//! The local block store index.
//!
//! Maps block id -> block metadata, thread id -> thread record (including
//! HEAD), plus thread peer rosters, contacts, offline-delivery pointers, and
//! the persisted cafe request queue.
//!
//! Column families:
//! - `blocks`: `{block_id}` -> [`BlockRow`] (append-only, idempotent add)
//! - `threads`: `{thread_id}` -> [`ThreadRecord`]
//! - `thread_peers`: `{thread_id}:{peer_id}` -> [`ThreadPeerRow`]
//! - `contacts`: `{peer_id}` -> [`ContactRow`]
//! - `cafe_requests`: `{date_ms be}{nonce}` -> raw request bytes (FIFO)
//! - `pointers`: `{pointer_id}` -> [`PointerRow`]

use crate::block::{current_timestamp_millis, BlockId, BlockType};
use crate::crypto::keys::{PeerId, ThreadId};
use crate::error::Result;
use crate::store::rocksdb::{composite_key, DbConfig, DbHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const CF_BLOCKS: &str = "blocks";
const CF_THREADS: &str = "threads";
const CF_THREAD_PEERS: &str = "thread_peers";
const CF_CONTACTS: &str = "contacts";
const CF_CAFE_REQUESTS: &str = "cafe_requests";
const CF_POINTERS: &str = "pointers";

const COLUMN_FAMILIES: &[&str] = &[
    CF_BLOCKS,
    CF_THREADS,
    CF_THREAD_PEERS,
    CF_CONTACTS,
    CF_CAFE_REQUESTS,
    CF_POINTERS,
];

/// Governs whether JOIN blocks for additional peers are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadKind {
    /// Anyone holding the thread key may join and write.
    Open,
    /// Single-writer; joins beyond the owner are rejected.
    Private,
    /// Only the owner writes content; others follow.
    ReadOnly,
}

impl fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadKind::Open => write!(f, "open"),
            ThreadKind::Private => write!(f, "private"),
            ThreadKind::ReadOnly => write!(f, "read_only"),
        }
    }
}

/// Lifecycle state of a locally known thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    /// Reconstructed from storage, not yet joined.
    Loaded,
    /// Actively participating.
    Joined,
    /// Left; awaiting purge.
    Left,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Loaded => write!(f, "loaded"),
            ThreadState::Joined => write!(f, "joined"),
            ThreadState::Left => write!(f, "left"),
        }
    }
}

/// Indexed metadata for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub id: BlockId,
    pub thread_id: ThreadId,
    pub author_id: PeerId,
    pub block_type: BlockType,
    pub date_ms: u64,
    pub parents: Vec<BlockId>,
    /// Referenced block for COMMENT/LIKE/IGNORE/FLAG, stored content for
    /// FILES.
    pub target: Option<BlockId>,
    /// Short text indexed for display.
    pub body: String,
}

/// Persisted thread state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub id: ThreadId,
    /// Application-supplied opaque tag, usually a UUID.
    pub key: String,
    pub name: String,
    pub kind: ThreadKind,
    pub state: ThreadState,
    /// The peer that created the thread. READONLY threads accept content
    /// blocks only from it.
    pub initiator: PeerId,
    /// Optional id of a schema describing accepted file payloads.
    pub schema_id: Option<String>,
    /// Encoded thread keypair ([`crate::crypto::ThreadKey::to_bytes`]).
    pub secret: Vec<u8>,
    /// Current HEAD tips; empty before the first block.
    pub head: Vec<BlockId>,
}

/// A peer known to participate in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPeerRow {
    pub id: PeerId,
    pub thread_id: ThreadId,
    /// Set once this node has sent the peer the current HEAD.
    pub welcomed: bool,
}

/// Contact card for a peer, shared across threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRow {
    pub id: PeerId,
    pub username: String,
    /// Cafe inboxes for offline delivery.
    pub inboxes: Vec<String>,
    pub added_ms: u64,
}

/// An offline-delivery pointer: where a queued message for a peer was left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerRow {
    pub id: String,
    pub peer: PeerId,
    pub cafe_inbox: String,
    pub date_ms: u64,
}

/// The local index over blocks, threads, peers, and queues.
#[derive(Debug)]
pub struct BlockStoreIndex {
    db: DbHandle,
    queue_seq: AtomicU64,
}

impl BlockStoreIndex {
    /// Opens (or creates) the index at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = DbHandle::open(path, &DbConfig::default(), COLUMN_FAMILIES)?;
        Ok(Self {
            db,
            queue_seq: AtomicU64::new(0),
        })
    }

    // ---- blocks -------------------------------------------------------

    /// Adds a block row. Idempotent: re-adding an existing id is a no-op
    /// success, and returns `false`.
    pub fn add_block(&self, row: &BlockRow) -> Result<bool> {
        if self.db.exists(CF_BLOCKS, row.id.as_bytes())? {
            debug!(id = %row.id.short(), "block already indexed");
            return Ok(false);
        }
        self.db.put(CF_BLOCKS, row.id.as_bytes(), row)?;
        Ok(true)
    }

    /// Looks up a block row by id.
    pub fn block(&self, id: &BlockId) -> Result<Option<BlockRow>> {
        self.db.get(CF_BLOCKS, id.as_bytes())
    }

    /// Counts blocks in a thread, optionally restricted to one type.
    pub fn block_count(&self, thread_id: &ThreadId, kind: Option<BlockType>) -> Result<usize> {
        let mut count = 0usize;
        let mut scan_err = None;
        self.db.iterate_all(CF_BLOCKS, |_, value| {
            match bincode::deserialize::<BlockRow>(value) {
                Ok(row) => {
                    if &row.thread_id == thread_id && kind.map_or(true, |k| k == row.block_type) {
                        count += 1;
                    }
                }
                Err(e) => scan_err = Some(e),
            }
            true
        })?;
        if let Some(e) = scan_err {
            return Err(crate::error::WeftError::serialization(format!(
                "Corrupt block row: {}",
                e
            )));
        }
        Ok(count)
    }

    /// Lists every block row of a thread.
    pub fn blocks_by_thread(&self, thread_id: &ThreadId) -> Result<Vec<BlockRow>> {
        let mut rows = Vec::new();
        self.db.iterate_all(CF_BLOCKS, |_, value| {
            if let Ok(row) = bincode::deserialize::<BlockRow>(value) {
                if &row.thread_id == thread_id {
                    rows.push(row);
                }
            }
            true
        })?;
        Ok(rows)
    }

    // ---- threads ------------------------------------------------------

    /// Stores a thread record, replacing any existing one.
    pub fn add_thread(&self, record: &ThreadRecord) -> Result<()> {
        self.db.put(CF_THREADS, record.id.as_str().as_bytes(), record)
    }

    /// Looks up a thread record.
    pub fn thread(&self, id: &ThreadId) -> Result<Option<ThreadRecord>> {
        self.db.get(CF_THREADS, id.as_str().as_bytes())
    }

    /// Lists all thread records.
    pub fn threads(&self) -> Result<Vec<ThreadRecord>> {
        let mut records = Vec::new();
        self.db.iterate_all(CF_THREADS, |_, value| {
            if let Ok(record) = bincode::deserialize::<ThreadRecord>(value) {
                records.push(record);
            }
            true
        })?;
        Ok(records)
    }

    /// Replaces a thread's HEAD tips. Last writer wins; callers serialize
    /// through the engine's per-thread lock.
    pub fn update_head(&self, id: &ThreadId, head: &[BlockId]) -> Result<()> {
        let mut record = self.thread(id)?.ok_or_else(|| {
            crate::error::WeftError::not_found(format!("thread {}", id.as_str()))
        })?;
        record.head = head.to_vec();
        self.add_thread(&record)
    }

    /// Updates a thread's lifecycle state.
    pub fn update_thread_state(&self, id: &ThreadId, state: ThreadState) -> Result<()> {
        let mut record = self.thread(id)?.ok_or_else(|| {
            crate::error::WeftError::not_found(format!("thread {}", id.as_str()))
        })?;
        record.state = state;
        self.add_thread(&record)
    }

    /// Removes a thread record. Block rows are retained.
    pub fn delete_thread(&self, id: &ThreadId) -> Result<()> {
        self.db.delete(CF_THREADS, id.as_str().as_bytes())
    }

    // ---- thread peers -------------------------------------------------

    /// Records a peer in a thread. Returns `false` (keeping the existing
    /// welcomed flag) if the peer is already present.
    pub fn add_thread_peer(&self, row: &ThreadPeerRow) -> Result<bool> {
        let key = composite_key(row.thread_id.as_str().as_bytes(), row.id.as_str().as_bytes());
        if self.db.exists(CF_THREAD_PEERS, &key)? {
            return Ok(false);
        }
        self.db.put(CF_THREAD_PEERS, &key, row)?;
        Ok(true)
    }

    /// Lists peers of a thread.
    pub fn thread_peers(&self, thread_id: &ThreadId) -> Result<Vec<ThreadPeerRow>> {
        let mut rows = Vec::new();
        let prefix = composite_key(thread_id.as_str().as_bytes(), b"");
        self.db.prefix_iterate(CF_THREAD_PEERS, &prefix, |_, value| {
            if let Ok(row) = bincode::deserialize::<ThreadPeerRow>(value) {
                rows.push(row);
            }
            true
        })?;
        Ok(rows)
    }

    /// Lists peers of a thread that have not been welcomed yet.
    pub fn unwelcomed_thread_peers(&self, thread_id: &ThreadId) -> Result<Vec<ThreadPeerRow>> {
        Ok(self
            .thread_peers(thread_id)?
            .into_iter()
            .filter(|p| !p.welcomed)
            .collect())
    }

    /// Marks a single peer as welcomed.
    pub fn welcome_thread_peer(&self, thread_id: &ThreadId, peer: &PeerId) -> Result<()> {
        let key = composite_key(thread_id.as_str().as_bytes(), peer.as_str().as_bytes());
        if let Some(mut row) = self.db.get::<ThreadPeerRow>(CF_THREAD_PEERS, &key)? {
            row.welcomed = true;
            self.db.put(CF_THREAD_PEERS, &key, &row)?;
        }
        Ok(())
    }

    /// Removes one peer from a thread (LEAVE).
    pub fn delete_thread_peer(&self, thread_id: &ThreadId, peer: &PeerId) -> Result<()> {
        let key = composite_key(thread_id.as_str().as_bytes(), peer.as_str().as_bytes());
        self.db.delete(CF_THREAD_PEERS, &key)
    }

    /// Removes every peer row of a thread (purge).
    pub fn delete_thread_peers(&self, thread_id: &ThreadId) -> Result<usize> {
        let peers = self.thread_peers(thread_id)?;
        for peer in &peers {
            self.delete_thread_peer(thread_id, &peer.id)?;
        }
        Ok(peers.len())
    }

    // ---- contacts -----------------------------------------------------

    /// Inserts or refreshes a contact card.
    pub fn add_or_update_contact(&self, row: &ContactRow) -> Result<()> {
        self.db.put(CF_CONTACTS, row.id.as_str().as_bytes(), row)
    }

    /// Looks up a contact card.
    pub fn contact(&self, id: &PeerId) -> Result<Option<ContactRow>> {
        self.db.get(CF_CONTACTS, id.as_str().as_bytes())
    }

    // ---- cafe request queue -------------------------------------------

    /// Appends raw request bytes to the cafe queue and returns the queue
    /// key. Keys sort in enqueue order: timestamp, then a process-local
    /// sequence number to order same-millisecond pushes, then a nonce.
    pub fn push_cafe_request(&self, request: &[u8]) -> Result<Vec<u8>> {
        let seq = self.queue_seq.fetch_add(1, Ordering::SeqCst);
        let mut key = Vec::with_capacity(8 + 8 + 16);
        key.extend_from_slice(&current_timestamp_millis().to_be_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        self.db.put_raw(CF_CAFE_REQUESTS, &key, request)?;
        Ok(key)
    }

    /// Lists queued cafe requests in enqueue order as `(key, bytes)` pairs.
    pub fn cafe_request_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        self.db.iterate_all(CF_CAFE_REQUESTS, |key, value| {
            entries.push((key.to_vec(), value.to_vec()));
            true
        })?;
        Ok(entries)
    }

    /// Removes an acked cafe request.
    pub fn remove_cafe_request(&self, key: &[u8]) -> Result<()> {
        self.db.delete(CF_CAFE_REQUESTS, key)
    }

    // ---- pointers -----------------------------------------------------

    /// Records an offline-delivery pointer.
    pub fn add_pointer(&self, row: &PointerRow) -> Result<()> {
        self.db.put(CF_POINTERS, row.id.as_bytes(), row)
    }

    /// Lists every pointer.
    pub fn pointers(&self) -> Result<Vec<PointerRow>> {
        let mut rows = Vec::new();
        self.db.iterate_all(CF_POINTERS, |_, value| {
            if let Ok(row) = bincode::deserialize::<PointerRow>(value) {
                rows.push(row);
            }
            true
        })?;
        Ok(rows)
    }

    /// Removes a delivered pointer.
    pub fn remove_pointer(&self, id: &str) -> Result<()> {
        self.db.delete(CF_POINTERS, id.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_index() -> (BlockStoreIndex, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let index = BlockStoreIndex::open(dir.path().join("index")).expect("Failed to open index");
        (index, dir)
    }

    fn make_id(tag: u8) -> BlockId {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        BlockId::from_bytes(bytes)
    }

    fn make_block_row(tag: u8, thread: &ThreadId, block_type: BlockType) -> BlockRow {
        BlockRow {
            id: make_id(tag),
            thread_id: thread.clone(),
            author_id: PeerId::from_string("author".to_string()),
            block_type,
            date_ms: 1000 + tag as u64,
            parents: vec![],
            target: None,
            body: String::new(),
        }
    }

    fn make_thread_record(id: &ThreadId) -> ThreadRecord {
        ThreadRecord {
            id: id.clone(),
            key: "app-key".to_string(),
            name: "holidays".to_string(),
            kind: ThreadKind::Open,
            state: ThreadState::Joined,
            initiator: PeerId::from_string("author".to_string()),
            schema_id: None,
            secret: vec![1, 2, 3],
            head: vec![],
        }
    }

    #[test]
    fn test_add_block_is_idempotent() {
        let (index, _dir) = open_index();
        let thread = ThreadId::from_string("t1".to_string());
        let row = make_block_row(1, &thread, BlockType::Message);

        assert!(index.add_block(&row).unwrap());
        assert!(!index.add_block(&row).unwrap(), "re-add must be a no-op");
        assert_eq!(index.block_count(&thread, None).unwrap(), 1);
    }

    #[test]
    fn test_block_lookup() {
        let (index, _dir) = open_index();
        let thread = ThreadId::from_string("t1".to_string());
        let row = make_block_row(1, &thread, BlockType::Message);
        index.add_block(&row).unwrap();

        let loaded = index.block(&row.id).unwrap().unwrap();
        assert_eq!(loaded, row);
        assert!(index.block(&make_id(9)).unwrap().is_none());
    }

    #[test]
    fn test_block_count_filters_by_type() {
        let (index, _dir) = open_index();
        let thread = ThreadId::from_string("t1".to_string());
        let other = ThreadId::from_string("t2".to_string());
        index.add_block(&make_block_row(1, &thread, BlockType::Message)).unwrap();
        index.add_block(&make_block_row(2, &thread, BlockType::Files)).unwrap();
        index.add_block(&make_block_row(3, &other, BlockType::Message)).unwrap();

        assert_eq!(index.block_count(&thread, None).unwrap(), 2);
        assert_eq!(index.block_count(&thread, Some(BlockType::Files)).unwrap(), 1);
        assert_eq!(index.block_count(&other, None).unwrap(), 1);
    }

    #[test]
    fn test_thread_head_update() {
        let (index, _dir) = open_index();
        let id = ThreadId::from_string("t1".to_string());
        index.add_thread(&make_thread_record(&id)).unwrap();

        index.update_head(&id, &[make_id(1)]).unwrap();
        let record = index.thread(&id).unwrap().unwrap();
        assert_eq!(record.head, vec![make_id(1)]);

        index.update_head(&id, &[make_id(2), make_id(3)]).unwrap();
        let record = index.thread(&id).unwrap().unwrap();
        assert_eq!(record.head, vec![make_id(2), make_id(3)]);
    }

    #[test]
    fn test_update_head_unknown_thread_fails() {
        let (index, _dir) = open_index();
        let id = ThreadId::from_string("missing".to_string());
        assert!(index.update_head(&id, &[make_id(1)]).is_err());
    }

    #[test]
    fn test_thread_peers_and_welcome() {
        let (index, _dir) = open_index();
        let thread = ThreadId::from_string("t1".to_string());
        let peer = PeerId::from_string("p1".to_string());

        let row = ThreadPeerRow {
            id: peer.clone(),
            thread_id: thread.clone(),
            welcomed: false,
        };
        assert!(index.add_thread_peer(&row).unwrap());
        assert!(!index.add_thread_peer(&row).unwrap());

        assert_eq!(index.unwelcomed_thread_peers(&thread).unwrap().len(), 1);
        index.welcome_thread_peer(&thread, &peer).unwrap();
        assert!(index.unwelcomed_thread_peers(&thread).unwrap().is_empty());
        assert_eq!(index.thread_peers(&thread).unwrap().len(), 1);
    }

    #[test]
    fn test_add_thread_peer_keeps_welcomed_flag() {
        let (index, _dir) = open_index();
        let thread = ThreadId::from_string("t1".to_string());
        let peer = PeerId::from_string("p1".to_string());

        index
            .add_thread_peer(&ThreadPeerRow {
                id: peer.clone(),
                thread_id: thread.clone(),
                welcomed: false,
            })
            .unwrap();
        index.welcome_thread_peer(&thread, &peer).unwrap();

        // A later JOIN observation must not reset the flag.
        index
            .add_thread_peer(&ThreadPeerRow {
                id: peer.clone(),
                thread_id: thread.clone(),
                welcomed: false,
            })
            .unwrap();
        assert!(index.unwelcomed_thread_peers(&thread).unwrap().is_empty());
    }

    #[test]
    fn test_delete_thread_peers() {
        let (index, _dir) = open_index();
        let thread = ThreadId::from_string("t1".to_string());
        for tag in 0..3 {
            index
                .add_thread_peer(&ThreadPeerRow {
                    id: PeerId::from_string(format!("p{}", tag)),
                    thread_id: thread.clone(),
                    welcomed: false,
                })
                .unwrap();
        }
        assert_eq!(index.delete_thread_peers(&thread).unwrap(), 3);
        assert!(index.thread_peers(&thread).unwrap().is_empty());
    }

    #[test]
    fn test_contacts() {
        let (index, _dir) = open_index();
        let peer = PeerId::from_string("p1".to_string());
        index
            .add_or_update_contact(&ContactRow {
                id: peer.clone(),
                username: "ada".to_string(),
                inboxes: vec![],
                added_ms: 1,
            })
            .unwrap();
        index
            .add_or_update_contact(&ContactRow {
                id: peer.clone(),
                username: "ada l.".to_string(),
                inboxes: vec!["cafe".to_string()],
                added_ms: 2,
            })
            .unwrap();

        let contact = index.contact(&peer).unwrap().unwrap();
        assert_eq!(contact.username, "ada l.");
        assert_eq!(contact.inboxes, vec!["cafe".to_string()]);
    }

    #[test]
    fn test_cafe_queue_fifo() {
        let (index, _dir) = open_index();
        let k1 = index.push_cafe_request(b"first").unwrap();
        let k2 = index.push_cafe_request(b"second").unwrap();
        assert!(k1 < k2);

        let entries = index.cafe_request_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, b"first");
        assert_eq!(entries[1].1, b"second");

        index.remove_cafe_request(&k1).unwrap();
        assert_eq!(index.cafe_request_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_pointers() {
        let (index, _dir) = open_index();
        let row = PointerRow {
            id: "ptr-1".to_string(),
            peer: PeerId::from_string("p1".to_string()),
            cafe_inbox: "cafe".to_string(),
            date_ms: 7,
        };
        index.add_pointer(&row).unwrap();
        assert_eq!(index.pointers().unwrap(), vec![row]);
        index.remove_pointer("ptr-1").unwrap();
        assert!(index.pointers().unwrap().is_empty());
    }

    #[test]
    fn test_thread_delete_retains_blocks() {
        let (index, _dir) = open_index();
        let id = ThreadId::from_string("t1".to_string());
        index.add_thread(&make_thread_record(&id)).unwrap();
        index.add_block(&make_block_row(1, &id, BlockType::Message)).unwrap();

        index.delete_thread(&id).unwrap();
        assert!(index.thread(&id).unwrap().is_none());
        assert_eq!(index.block_count(&id, None).unwrap(), 1);
    }
}
