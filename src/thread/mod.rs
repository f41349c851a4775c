//! The thread engine.
//!
//! A [`Thread`] is one shared, append-only log: a Merkle-DAG of encrypted,
//! signed blocks. The engine commits local blocks (encrypt, store, index,
//! post), receives blocks from peers (verify, decrypt, validate, traverse
//! parents), and reconciles HEAD under concurrent writers by committing
//! cleartext MERGE blocks.
//!
//! Every read-modify-write step runs under the thread's own mutex, so HEAD
//! transitions form a total order per thread. Collaborators (CAS, index,
//! outboxes, update bus) are held by handle; threads never own each other.

use crate::block::{
    current_timestamp_millis, decode_payload, encode_payload, AnnouncePayload, BlockHeader,
    BlockId, BlockType, CommentPayload, Envelope, FilesPayload, FlagPayload, IgnorePayload,
    JoinPayload, LikePayload, MessagePayload, ThreadBlock,
};
use crate::cas::CasClient;
use crate::crypto::encryption::{decrypt_symmetric, encrypt_symmetric};
use crate::crypto::keys::{IdentityKeyPair, PeerId, ThreadId, ThreadKey};
use crate::error::{Result, WeftError};
use crate::outbox::{CafeOutbox, CafeRequest, ThreadsOutbox};
use crate::store::{
    BlockRow, BlockStoreIndex, ContactRow, ThreadKind, ThreadPeerRow, ThreadRecord, ThreadState,
};
use crate::update::{ThreadUpdate, UpdateBus};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

mod head;

pub use head::Head;

/// Collaborator handles injected at node bootstrap.
#[derive(Clone)]
pub struct ThreadContext {
    pub identity: Arc<IdentityKeyPair>,
    pub cas: Arc<dyn CasClient>,
    pub index: Arc<BlockStoreIndex>,
    pub peer_outbox: Arc<ThreadsOutbox>,
    pub cafe_outbox: Arc<CafeOutbox>,
    pub updates: Arc<UpdateBus>,
}

/// The result of committing a block: its id, the exact bytes stored in the
/// CAS, and the header it was built with.
#[derive(Debug, Clone)]
pub struct Commit {
    pub hash: BlockId,
    pub ciphertext: Vec<u8>,
    pub header: BlockHeader,
}

/// Summary of a thread's current state.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub key: String,
    pub name: String,
    pub kind: ThreadKind,
    pub state: ThreadState,
    pub head: Vec<BlockRow>,
    pub peer_count: usize,
    pub block_count: usize,
    pub file_count: usize,
}

/// One collaborative encrypted thread.
pub struct Thread {
    id: ThreadId,
    key: String,
    name: String,
    kind: ThreadKind,
    initiator: PeerId,
    schema_id: Option<String>,
    secret: ThreadKey,
    ctx: ThreadContext,
    mux: Mutex<()>,
}

impl Thread {
    /// Builds an engine for a persisted thread record.
    pub fn new(record: &ThreadRecord, ctx: ThreadContext) -> Result<Self> {
        let secret = ThreadKey::from_bytes(&record.secret)?;
        if secret.thread_id() != record.id {
            return Err(WeftError::key("Thread key does not match thread id"));
        }
        Ok(Self {
            id: record.id.clone(),
            key: record.key.clone(),
            name: record.name.clone(),
            kind: record.kind,
            initiator: record.initiator.clone(),
            schema_id: record.schema_id.clone(),
            secret,
            ctx,
            mux: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &ThreadId {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn schema_id(&self) -> Option<&str> {
        self.schema_id.as_deref()
    }

    fn local_peer(&self) -> PeerId {
        self.ctx.identity.peer_id()
    }

    fn record(&self) -> Result<ThreadRecord> {
        self.ctx
            .index
            .thread(&self.id)?
            .ok_or_else(|| WeftError::not_found(format!("thread {}", self.id.as_str())))
    }

    /// Current HEAD tips.
    pub fn head(&self) -> Result<Head> {
        Ok(Head::from_tips(self.record()?.head))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Result<ThreadState> {
        Ok(self.record()?.state)
    }

    /// Locally known peers of this thread.
    pub fn peers(&self) -> Result<Vec<ThreadPeerRow>> {
        self.ctx.index.thread_peers(&self.id)
    }

    /// Reports a summary of the thread.
    pub fn info(&self) -> Result<ThreadInfo> {
        let record = self.record()?;
        let mut head = Vec::new();
        for tip in &record.head {
            if let Some(row) = self.ctx.index.block(tip)? {
                head.push(row);
            }
        }
        Ok(ThreadInfo {
            id: record.id.clone(),
            key: record.key.clone(),
            name: record.name.clone(),
            kind: record.kind,
            state: record.state,
            head,
            peer_count: self.peers()?.len() + 1,
            block_count: self.ctx.index.block_count(&self.id, None)?,
            file_count: self.ctx.index.block_count(&self.id, Some(BlockType::Files))?,
        })
    }

    /// Encrypts data with the thread content key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        encrypt_symmetric(&self.secret.content_key()?, plaintext)
    }

    /// Decrypts data with the thread content key.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        decrypt_symmetric(&self.secret.content_key()?, ciphertext)
    }

    // ---- commit pipeline ----------------------------------------------

    /// Builds a header whose parents capture the current HEAD.
    fn new_header(&self) -> Result<BlockHeader> {
        let head = self.head()?;
        Ok(BlockHeader {
            date_ms: current_timestamp_millis(),
            parents: head.tips().to_vec(),
            author: self.local_peer(),
        })
    }

    /// Serializes, encrypts, and stores a new block. The default encryption
    /// is the thread content key; callers may override (MERGE commits store
    /// cleartext through their own path).
    fn commit_block(
        &self,
        block_type: BlockType,
        payload: Option<Vec<u8>>,
        encrypt: Option<&(dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync)>,
    ) -> Result<Commit> {
        let header = self.new_header()?;
        let block = ThreadBlock {
            header: header.clone(),
            block_type,
            payload,
        };
        let plaintext = block.to_bytes()?;
        let ciphertext = match encrypt {
            Some(f) => f(&plaintext)?,
            None => self.encrypt(&plaintext)?,
        };
        let hash = self.store_block(&ciphertext)?;
        Ok(Commit {
            hash,
            ciphertext,
            header,
        })
    }

    /// Puts block bytes into the CAS (pinned) and queues a cafe pin request.
    fn store_block(&self, bytes: &[u8]) -> Result<BlockId> {
        let hash = self.ctx.cas.put(bytes, true)?;
        self.ctx.cafe_outbox.add(CafeRequest::Store(hash))?;
        Ok(hash)
    }

    /// Indexes a block row and fans out an update. Idempotent: an existing
    /// row is left untouched and no update is emitted.
    fn index_row(
        &self,
        hash: BlockId,
        header: &BlockHeader,
        block_type: BlockType,
        target: Option<BlockId>,
        body: &str,
    ) -> Result<bool> {
        let row = BlockRow {
            id: hash,
            thread_id: self.id.clone(),
            author_id: header.author.clone(),
            block_type,
            date_ms: header.date_ms,
            parents: header.parents.clone(),
            target,
            body: body.to_string(),
        };
        let added = self.ctx.index.add_block(&row)?;
        if added {
            self.ctx.updates.publish(ThreadUpdate {
                block: row,
                thread_id: self.id.clone(),
                thread_name: self.name.clone(),
            });
        }
        Ok(added)
    }

    /// Persists new HEAD tips and queues a thread snapshot for the cafes.
    fn update_head(&self, head: &Head) -> Result<()> {
        self.ctx.index.update_head(&self.id, head.tips())?;
        self.ctx
            .cafe_outbox
            .add(CafeRequest::StoreThread(self.id.clone()))?;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.kind == ThreadKind::ReadOnly && self.local_peer() != self.initiator {
            return Err(WeftError::malformed(
                "read-only thread accepts content from its initiator only",
            ));
        }
        Ok(())
    }

    // ---- local operations ---------------------------------------------

    /// Commits a JOIN for `peer` and records it in the roster.
    pub fn join(&self, peer: PeerId, username: &str, inboxes: Vec<String>) -> Result<BlockId> {
        if self.kind == ThreadKind::Private && peer != self.local_peer() {
            return Err(WeftError::malformed("joins not allowed to a private thread"));
        }

        let _guard = self.mux.lock().expect("thread lock poisoned");
        let payload = encode_payload(&JoinPayload {
            peer: peer.clone(),
            username: username.to_string(),
            inboxes: inboxes.clone(),
        })?;
        let commit = self.commit_block(BlockType::Join, Some(payload), None)?;
        self.index_row(commit.hash, &commit.header, BlockType::Join, None, username)?;
        if peer != self.local_peer() {
            self.add_or_update_peer(&peer, username, inboxes)?;
        }
        self.update_head(&Head::single(commit.hash))?;
        self.post(&commit, &self.peers_except(&peer)?)?;
        Ok(commit.hash)
    }

    /// Commits an ANNOUNCE of the local peer's contact card.
    pub fn announce(&self, username: &str, inboxes: Vec<String>) -> Result<BlockId> {
        let _guard = self.mux.lock().expect("thread lock poisoned");
        let payload = encode_payload(&AnnouncePayload {
            peer: self.local_peer(),
            username: username.to_string(),
            inboxes,
        })?;
        let commit = self.commit_block(BlockType::Announce, Some(payload), None)?;
        self.index_row(commit.hash, &commit.header, BlockType::Announce, None, username)?;
        self.update_head(&Head::single(commit.hash))?;
        self.post(&commit, &self.peers()?)?;
        Ok(commit.hash)
    }

    /// Commits a LEAVE and marks the thread left. The caller purges.
    pub fn leave(&self) -> Result<BlockId> {
        let _guard = self.mux.lock().expect("thread lock poisoned");
        let commit = self.commit_block(BlockType::Leave, None, None)?;
        self.index_row(commit.hash, &commit.header, BlockType::Leave, None, "")?;
        self.update_head(&Head::single(commit.hash))?;
        self.post(&commit, &self.peers()?)?;
        self.ctx.index.update_thread_state(&self.id, ThreadState::Left)?;
        Ok(commit.hash)
    }

    /// Commits a MESSAGE.
    pub fn add_message(&self, body: &str) -> Result<BlockId> {
        self.check_writable()?;
        let _guard = self.mux.lock().expect("thread lock poisoned");
        let payload = encode_payload(&MessagePayload {
            body: body.to_string(),
        })?;
        let commit = self.commit_block(BlockType::Message, Some(payload), None)?;
        self.index_row(commit.hash, &commit.header, BlockType::Message, None, body)?;
        self.update_head(&Head::single(commit.hash))?;
        self.post(&commit, &self.peers()?)?;
        Ok(commit.hash)
    }

    /// Commits a FILES block referencing stored content.
    pub fn add_files(&self, target: BlockId, caption: &str) -> Result<BlockId> {
        self.check_writable()?;
        if self.schema_id.is_none() {
            return Err(WeftError::config("thread schema required to add files"));
        }

        let _guard = self.mux.lock().expect("thread lock poisoned");
        let payload = encode_payload(&FilesPayload {
            target,
            body: caption.to_string(),
        })?;
        let commit = self.commit_block(BlockType::Files, Some(payload), None)?;
        self.index_row(
            commit.hash,
            &commit.header,
            BlockType::Files,
            Some(target),
            caption,
        )?;
        self.update_head(&Head::single(commit.hash))?;
        self.post(&commit, &self.peers()?)?;
        Ok(commit.hash)
    }

    /// Commits a COMMENT on a target block. Annotations are open to every
    /// member, read-only threads included.
    pub fn add_comment(&self, target: BlockId, body: &str) -> Result<BlockId> {
        let _guard = self.mux.lock().expect("thread lock poisoned");
        let payload = encode_payload(&CommentPayload {
            target,
            body: body.to_string(),
        })?;
        let commit = self.commit_block(BlockType::Comment, Some(payload), None)?;
        self.index_row(
            commit.hash,
            &commit.header,
            BlockType::Comment,
            Some(target),
            body,
        )?;
        self.update_head(&Head::single(commit.hash))?;
        self.post(&commit, &self.peers()?)?;
        Ok(commit.hash)
    }

    /// Commits a LIKE of a target block.
    pub fn add_like(&self, target: BlockId) -> Result<BlockId> {
        self.annotate(BlockType::Like, target)
    }

    /// Commits an IGNORE of a target block (applied at presentation time).
    pub fn ignore(&self, target: BlockId) -> Result<BlockId> {
        self.annotate(BlockType::Ignore, target)
    }

    /// Commits a FLAG of a target block.
    pub fn flag(&self, target: BlockId) -> Result<BlockId> {
        self.annotate(BlockType::Flag, target)
    }

    fn annotate(&self, block_type: BlockType, target: BlockId) -> Result<BlockId> {
        let _guard = self.mux.lock().expect("thread lock poisoned");
        let payload = match block_type {
            BlockType::Like => encode_payload(&LikePayload { target })?,
            BlockType::Ignore => encode_payload(&IgnorePayload { target })?,
            BlockType::Flag => encode_payload(&FlagPayload { target })?,
            _ => return Err(WeftError::malformed("not an annotation type")),
        };
        let commit = self.commit_block(block_type, Some(payload), None)?;
        self.index_row(commit.hash, &commit.header, block_type, Some(target), "")?;
        self.update_head(&Head::single(commit.hash))?;
        self.post(&commit, &self.peers()?)?;
        Ok(commit.hash)
    }

    // ---- receive path -------------------------------------------------

    /// Handles an envelope from a peer: verify, decrypt, validate, traverse
    /// unknown ancestors, then advance or merge HEAD.
    pub fn receive(&self, envelope: &Envelope) -> Result<()> {
        envelope.verify()?;
        if envelope.thread_id != self.id {
            return Err(WeftError::not_found(format!(
                "thread {}",
                envelope.thread_id.as_str()
            )));
        }

        {
            let _guard = self.mux.lock().expect("thread lock poisoned");
            let block = match self.handle_block(&envelope.hash, &envelope.ciphertext)? {
                Some(block) => block,
                // Already indexed; nothing to do.
                None => return Ok(()),
            };
            self.dispatch(envelope.hash, &block)?;
            self.follow_parents(&block.header.parents)?;
            self.handle_head(envelope.hash, &block.header.parents)?;
        }

        // Welcomes are at-least-once and run off-lock; failures retry on the
        // next receive or announce cycle.
        if let Err(e) = self.send_welcome() {
            warn!(thread = %self.id, "welcome failed: {}", e);
        }
        Ok(())
    }

    /// Decrypts and validates an incoming block, re-storing its exact bytes.
    ///
    /// Returns `None` when the block is already indexed (idempotent
    /// receive). A block that fails thread-key decryption is retried as a
    /// cleartext MERGE; anything else fails authentication.
    fn handle_block(&self, hash: &BlockId, ciphertext: &[u8]) -> Result<Option<ThreadBlock>> {
        if self.ctx.index.block(hash)?.is_some() {
            debug!(block = %hash.short(), "already indexed, skipping");
            return Ok(None);
        }

        let block = match self.decrypt(ciphertext) {
            Ok(plaintext) => ThreadBlock::from_bytes(&plaintext)?,
            Err(decrypt_err) => match ThreadBlock::from_bytes(ciphertext) {
                Ok(block) if block.block_type == BlockType::Merge => block,
                _ => return Err(decrypt_err),
            },
        };

        block.check_payload()?;

        if BlockId::compute(ciphertext) != *hash {
            return Err(WeftError::malformed("block bytes do not match id"));
        }

        // Re-put ensures local pinning; the block only counts as received
        // once this succeeds.
        self.store_block(ciphertext)?;
        Ok(Some(block))
    }

    fn dispatch(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        match block.block_type {
            BlockType::Merge => self.handle_merge_block(hash, block),
            BlockType::Ignore => self.handle_annotation_block(hash, block),
            BlockType::Flag => self.handle_annotation_block(hash, block),
            BlockType::Join => self.handle_join_block(hash, block),
            BlockType::Announce => self.handle_announce_block(hash, block),
            BlockType::Leave => self.handle_leave_block(hash, block),
            BlockType::Message => self.handle_message_block(hash, block),
            BlockType::Files => self.handle_files_block(hash, block),
            BlockType::Comment => self.handle_comment_block(hash, block),
            BlockType::Like => self.handle_annotation_block(hash, block),
        }
    }

    /// Follows every parent branch, processing unknown ancestors. A failing
    /// branch is logged and abandoned; its siblings still run, so one bad
    /// branch cannot block reconciliation of the rest.
    fn follow_parents(&self, parents: &[BlockId]) -> Result<()> {
        for parent in parents {
            if let Err(e) = self.follow_parent(parent) {
                warn!(parent = %parent.short(), "failed to follow parent: {}", e);
            }
        }
        Ok(())
    }

    fn follow_parent(&self, parent: &BlockId) -> Result<()> {
        let ciphertext = match self.ctx.cas.get(parent) {
            Ok(bytes) => bytes,
            // A later announce re-drives traversal of missing ancestors.
            Err(e) if e.is_not_found() => {
                warn!(parent = %parent.short(), "parent not in store, skipping branch");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let block = match self.handle_block(parent, &ciphertext)? {
            Some(block) => block,
            // Known subtree below this point.
            None => return Ok(()),
        };
        self.dispatch(*parent, &block)?;
        self.follow_parents(&block.header.parents)
    }

    // ---- per-type handlers --------------------------------------------
    //
    // Handlers index rows and may update rosters or enqueue outbox work.
    // They never touch HEAD; that is handle_head's job alone.

    fn handle_merge_block(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        self.index_row(hash, &block.header, BlockType::Merge, None, "")?;
        Ok(())
    }

    fn handle_join_block(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        let payload: JoinPayload = decode_payload(block.payload.as_deref().unwrap_or_default())?;
        if payload.peer != self.local_peer() {
            self.add_or_update_peer(&payload.peer, &payload.username, payload.inboxes.clone())?;
        }
        self.index_row(hash, &block.header, BlockType::Join, None, &payload.username)?;
        Ok(())
    }

    fn handle_announce_block(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        let payload: AnnouncePayload =
            decode_payload(block.payload.as_deref().unwrap_or_default())?;
        if payload.peer != self.local_peer() {
            self.add_or_update_peer(&payload.peer, &payload.username, payload.inboxes.clone())?;
        }
        self.index_row(
            hash,
            &block.header,
            BlockType::Announce,
            None,
            &payload.username,
        )?;
        Ok(())
    }

    fn handle_leave_block(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        self.ctx
            .index
            .delete_thread_peer(&self.id, &block.header.author)?;
        self.index_row(hash, &block.header, BlockType::Leave, None, "")?;
        Ok(())
    }

    fn handle_message_block(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        self.check_author(&block.header.author)?;
        let payload: MessagePayload =
            decode_payload(block.payload.as_deref().unwrap_or_default())?;
        self.index_row(hash, &block.header, BlockType::Message, None, &payload.body)?;
        Ok(())
    }

    fn handle_files_block(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        self.check_author(&block.header.author)?;
        let payload: FilesPayload = decode_payload(block.payload.as_deref().unwrap_or_default())?;
        self.index_row(
            hash,
            &block.header,
            BlockType::Files,
            Some(payload.target),
            &payload.body,
        )?;
        Ok(())
    }

    fn handle_comment_block(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        let payload: CommentPayload =
            decode_payload(block.payload.as_deref().unwrap_or_default())?;
        self.index_row(
            hash,
            &block.header,
            BlockType::Comment,
            Some(payload.target),
            &payload.body,
        )?;
        Ok(())
    }

    fn handle_annotation_block(&self, hash: BlockId, block: &ThreadBlock) -> Result<()> {
        let bytes = block.payload.as_deref().unwrap_or_default();
        let target = match block.block_type {
            BlockType::Like => decode_payload::<LikePayload>(bytes)?.target,
            BlockType::Ignore => decode_payload::<IgnorePayload>(bytes)?.target,
            BlockType::Flag => decode_payload::<FlagPayload>(bytes)?.target,
            _ => return Err(WeftError::malformed("not an annotation type")),
        };
        self.index_row(hash, &block.header, block.block_type, Some(target), "")?;
        Ok(())
    }

    fn check_author(&self, author: &PeerId) -> Result<()> {
        if self.kind == ThreadKind::ReadOnly && *author != self.initiator {
            return Err(WeftError::malformed(
                "read-only thread accepts content from its initiator only",
            ));
        }
        Ok(())
    }

    // ---- HEAD reconciliation ------------------------------------------

    /// Fast-forwards HEAD onto `inbound` when possible, otherwise commits a
    /// MERGE over the current tips and the inbound block.
    ///
    /// Returns the merge hash when a merge was required.
    fn handle_head(&self, inbound: BlockId, parents: &[BlockId]) -> Result<Option<BlockId>> {
        let head = self.head()?;
        if let Some(next) = head.fast_forward(inbound, parents) {
            debug!(thread = %self.id, head = %next, "fast-forwarded");
            self.update_head(&next)?;
            return Ok(None);
        }
        let merged = self.merge(inbound)?;
        Ok(Some(merged))
    }

    /// Commits a cleartext MERGE over `{current tips, inbound}`.
    ///
    /// Merge headers are deterministic: parents are sorted and deduplicated,
    /// the date is the newest parent date, and the author is empty. Peers
    /// merging the same tips therefore produce byte-identical blocks and
    /// converge on the same merge id.
    fn merge(&self, inbound: BlockId) -> Result<BlockId> {
        let head = self.head()?;
        let parents = head.merge_parents(inbound);

        let mut date_ms = 0u64;
        for parent in &parents {
            if let Some(row) = self.ctx.index.block(parent)? {
                date_ms = date_ms.max(row.date_ms);
            }
        }

        let header = BlockHeader {
            date_ms,
            parents,
            author: PeerId::default(),
        };
        let block = ThreadBlock {
            header: header.clone(),
            block_type: BlockType::Merge,
            payload: None,
        };
        // Stored cleartext so a peer holding only one branch can still learn
        // the parent set without the thread key.
        let bytes = block.to_bytes()?;
        let hash = self.store_block(&bytes)?;
        self.index_row(hash, &header, BlockType::Merge, None, "")?;
        self.update_head(&Head::single(hash))?;

        info!(thread = %self.id, merge = %hash.short(), "merged concurrent branches");
        Ok(hash)
    }

    // ---- welcome and posting ------------------------------------------

    /// Sends the current HEAD to every unwelcomed peer, marking each
    /// welcomed only once its envelopes are queued. At-least-once: repeats
    /// are harmless because receives are idempotent.
    pub fn send_welcome(&self) -> Result<()> {
        let peers = self.ctx.index.unwelcomed_thread_peers(&self.id)?;
        if peers.is_empty() {
            return Ok(());
        }

        let head = self.head()?;
        if head.is_empty() {
            return Ok(());
        }

        let mut tips = Vec::with_capacity(head.len());
        for tip in head.tips() {
            tips.push((*tip, self.ctx.cas.get(tip)?));
        }

        for peer in &peers {
            let mut queued = true;
            for (tip, ciphertext) in &tips {
                let envelope = Envelope::seal(
                    &self.ctx.identity,
                    self.id.clone(),
                    *tip,
                    ciphertext.clone(),
                )?;
                if let Err(e) = self.ctx.peer_outbox.add(&peer.id, envelope) {
                    warn!(peer = %peer.id, "failed to queue welcome: {}", e);
                    queued = false;
                    break;
                }
            }
            if queued {
                self.ctx.index.welcome_thread_peer(&self.id, &peer.id)?;
                debug!(peer = %peer.id, head = %head, "welcome sent");
            }
        }

        self.spawn_flush();
        Ok(())
    }

    /// Posts a committed block to thread peers. With no peers, storage still
    /// proceeds: the cafe queue is flushed and nothing else happens.
    fn post(&self, commit: &Commit, peers: &[ThreadPeerRow]) -> Result<()> {
        if peers.is_empty() {
            if let Err(e) = self.ctx.cafe_outbox.flush() {
                warn!(thread = %self.id, "cafe flush failed: {}", e);
            }
            return Ok(());
        }

        let envelope = Envelope::seal(
            &self.ctx.identity,
            self.id.clone(),
            commit.hash,
            commit.ciphertext.clone(),
        )?;
        for peer in peers {
            self.ctx.peer_outbox.add(&peer.id, envelope.clone())?;
        }

        self.spawn_flush();
        Ok(())
    }

    fn spawn_flush(&self) {
        let outbox = Arc::clone(&self.ctx.peer_outbox);
        std::thread::spawn(move || {
            if let Err(e) = outbox.flush() {
                warn!("outbox flush failed: {}", e);
            }
        });
    }

    fn peers_except(&self, excluded: &PeerId) -> Result<Vec<ThreadPeerRow>> {
        Ok(self
            .peers()?
            .into_iter()
            .filter(|p| &p.id != excluded)
            .collect())
    }

    /// Records a thread peer and refreshes its contact card.
    fn add_or_update_peer(&self, peer: &PeerId, username: &str, inboxes: Vec<String>) -> Result<()> {
        self.ctx.index.add_thread_peer(&ThreadPeerRow {
            id: peer.clone(),
            thread_id: self.id.clone(),
            welcomed: false,
        })?;
        self.ctx.index.add_or_update_contact(&ContactRow {
            id: peer.clone(),
            username: username.to_string(),
            inboxes,
            added_ms: current_timestamp_millis(),
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id.as_str())
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::MemoryCas;
    use crate::outbox::{CafeSender, PeerSender, DEFAULT_ENVELOPE_TTL_MS};
    use tempfile::TempDir;

    struct NullPeerSender;

    impl PeerSender for NullPeerSender {
        fn send(&self, _peer: &PeerId, _envelope: &Envelope) -> Result<()> {
            Ok(())
        }
    }

    struct NullCafeSender;

    impl CafeSender for NullCafeSender {
        fn deliver(&self, _cafe: &PeerId, _ciphertext: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        thread: Thread,
        cas: Arc<MemoryCas>,
        index: Arc<BlockStoreIndex>,
        _dir: TempDir,
    }

    fn make_context(
        dir: &TempDir,
        cas: Arc<MemoryCas>,
        identity: Arc<IdentityKeyPair>,
        label: &str,
    ) -> (ThreadContext, Arc<BlockStoreIndex>) {
        let index = Arc::new(BlockStoreIndex::open(dir.path().join(label)).unwrap());
        let cafe = Arc::new(CafeOutbox::new(index.clone(), vec![], Arc::new(NullCafeSender)));
        let peer_outbox = Arc::new(ThreadsOutbox::new(
            Arc::new(NullPeerSender),
            cafe.clone(),
            DEFAULT_ENVELOPE_TTL_MS,
        ));
        let ctx = ThreadContext {
            identity,
            cas,
            index: index.clone(),
            peer_outbox,
            cafe_outbox: cafe,
            updates: Arc::new(UpdateBus::new()),
        };
        (ctx, index)
    }

    fn make_fixture_with(key: &ThreadKey, kind: ThreadKind, label: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let cas = Arc::new(MemoryCas::new());
        let identity = Arc::new(IdentityKeyPair::generate());
        let (ctx, index) = make_context(&dir, cas.clone(), identity.clone(), label);

        let record = ThreadRecord {
            id: key.thread_id(),
            key: "app-key".to_string(),
            name: "holidays".to_string(),
            kind,
            state: ThreadState::Joined,
            initiator: identity.peer_id(),
            schema_id: Some("schema-1".to_string()),
            secret: key.to_bytes().unwrap(),
            head: vec![],
        };
        index.add_thread(&record).unwrap();

        Fixture {
            thread: Thread::new(&record, ctx).unwrap(),
            cas,
            index,
            _dir: dir,
        }
    }

    fn make_fixture() -> Fixture {
        make_fixture_with(&ThreadKey::generate(), ThreadKind::Open, "index")
    }

    #[test]
    fn test_message_commit_advances_head() {
        let fx = make_fixture();
        let h1 = fx.thread.add_message("hi").unwrap();

        assert_eq!(fx.thread.head().unwrap(), Head::single(h1));
        assert_eq!(fx.index.block_count(fx.thread.id(), None).unwrap(), 1);

        let row = fx.index.block(&h1).unwrap().unwrap();
        assert_eq!(row.block_type, BlockType::Message);
        assert_eq!(row.body, "hi");
        assert!(row.parents.is_empty(), "genesis block has no parents");

        let h2 = fx.thread.add_message("again").unwrap();
        assert_eq!(fx.thread.head().unwrap(), Head::single(h2));
        let row2 = fx.index.block(&h2).unwrap().unwrap();
        assert_eq!(row2.parents, vec![h1]);
    }

    #[test]
    fn test_committed_block_is_encrypted_in_cas() {
        let fx = make_fixture();
        let h1 = fx.thread.add_message("secret text").unwrap();

        let stored = fx.cas.get(&h1).unwrap();
        assert!(ThreadBlock::from_bytes(&stored).is_err(), "stored bytes are not cleartext");

        let plaintext = fx.thread.decrypt(&stored).unwrap();
        let block = ThreadBlock::from_bytes(&plaintext).unwrap();
        assert_eq!(block.block_type, BlockType::Message);
    }

    #[test]
    fn test_receive_rejects_foreign_ciphertext() {
        let fx = make_fixture();
        let other = make_fixture_with(&ThreadKey::generate(), ThreadKind::Open, "other");
        let h1 = other.thread.add_message("for another thread").unwrap();
        let ciphertext = other.cas.get(&h1).unwrap();

        let result = fx.thread.handle_block(&h1, &ciphertext);
        assert!(matches!(result, Err(WeftError::Auth(_))));
        assert!(fx.index.block(&h1).unwrap().is_none());
    }

    #[test]
    fn test_handle_block_accepts_cleartext_merge_only() {
        let fx = make_fixture();

        let merge = ThreadBlock {
            header: BlockHeader {
                date_ms: 9,
                parents: vec![BlockId::compute(b"a"), BlockId::compute(b"b")],
                author: PeerId::default(),
            },
            block_type: BlockType::Merge,
            payload: None,
        };
        let bytes = merge.to_bytes().unwrap();
        let hash = BlockId::compute(&bytes);
        let parsed = fx.thread.handle_block(&hash, &bytes).unwrap().unwrap();
        assert_eq!(parsed.block_type, BlockType::Merge);

        // A cleartext MESSAGE is not grantable the same exception.
        let message = ThreadBlock {
            header: merge.header.clone(),
            block_type: BlockType::Message,
            payload: Some(encode_payload(&MessagePayload { body: "x".into() }).unwrap()),
        };
        let bytes = message.to_bytes().unwrap();
        let hash = BlockId::compute(&bytes);
        assert!(matches!(
            fx.thread.handle_block(&hash, &bytes),
            Err(WeftError::Auth(_))
        ));
    }

    #[test]
    fn test_handle_block_rejects_nil_payload() {
        let fx = make_fixture();
        let block = ThreadBlock {
            header: BlockHeader {
                date_ms: 1,
                parents: vec![],
                author: fx.thread.local_peer(),
            },
            block_type: BlockType::Message,
            payload: None,
        };
        let ciphertext = fx.thread.encrypt(&block.to_bytes().unwrap()).unwrap();
        let hash = BlockId::compute(&ciphertext);

        assert!(matches!(
            fx.thread.handle_block(&hash, &ciphertext),
            Err(WeftError::Malformed(_))
        ));
    }

    #[test]
    fn test_handle_block_rejects_wrong_hash() {
        let fx = make_fixture();
        let block = ThreadBlock {
            header: BlockHeader {
                date_ms: 1,
                parents: vec![],
                author: fx.thread.local_peer(),
            },
            block_type: BlockType::Message,
            payload: Some(encode_payload(&MessagePayload { body: "x".into() }).unwrap()),
        };
        let ciphertext = fx.thread.encrypt(&block.to_bytes().unwrap()).unwrap();
        let wrong = BlockId::compute(b"not these bytes");

        assert!(matches!(
            fx.thread.handle_block(&wrong, &ciphertext),
            Err(WeftError::Malformed(_))
        ));
    }

    #[test]
    fn test_merge_is_deterministic_across_peers() {
        // Two members of the same thread in the same concurrent state build
        // byte-identical merges.
        let key = ThreadKey::generate();
        let a = make_fixture_with(&key, ThreadKind::Open, "a");
        let b = make_fixture_with(&key, ThreadKind::Open, "b");

        let tip_a = BlockId::compute(b"branch-a");
        let tip_b = BlockId::compute(b"branch-b");

        a.index.update_head(a.thread.id(), &[tip_a]).unwrap();
        b.index.update_head(b.thread.id(), &[tip_a]).unwrap();

        let merge_a = a.thread.merge(tip_b).unwrap();
        let merge_b = b.thread.merge(tip_b).unwrap();
        assert_eq!(merge_a, merge_b);
    }

    #[test]
    fn test_private_thread_rejects_foreign_join() {
        let fx = make_fixture_with(&ThreadKey::generate(), ThreadKind::Private, "index");
        let result = fx.thread.join(
            PeerId::from_string("other-peer".to_string()),
            "eve",
            vec![],
        );
        assert!(matches!(result, Err(WeftError::Malformed(_))));

        // The owner may still join its own private thread.
        fx.thread
            .join(fx.thread.local_peer(), "me", vec![])
            .unwrap();
    }

    #[test]
    fn test_read_only_thread_rejects_foreign_content() {
        let key = ThreadKey::generate();
        let owner = make_fixture_with(&key, ThreadKind::ReadOnly, "owner");
        owner.thread.add_message("from the owner").unwrap();

        // A follower is any member whose identity is not the initiator.
        let dir = TempDir::new().unwrap();
        let cas = Arc::new(MemoryCas::new());
        let identity = Arc::new(IdentityKeyPair::generate());
        let (ctx, index) = make_context(&dir, cas, identity, "follower");
        let record = ThreadRecord {
            id: key.thread_id(),
            key: "k".to_string(),
            name: "feed".to_string(),
            kind: ThreadKind::ReadOnly,
            state: ThreadState::Joined,
            initiator: owner.thread.local_peer(),
            schema_id: None,
            secret: key.to_bytes().unwrap(),
            head: vec![],
        };
        index.add_thread(&record).unwrap();
        let follower = Thread::new(&record, ctx).unwrap();

        assert!(matches!(
            follower.add_message("not allowed"),
            Err(WeftError::Malformed(_))
        ));
    }

    #[test]
    fn test_files_require_schema() {
        let key = ThreadKey::generate();
        let dir = TempDir::new().unwrap();
        let cas = Arc::new(MemoryCas::new());
        let identity = Arc::new(IdentityKeyPair::generate());
        let (ctx, index) = make_context(&dir, cas, identity.clone(), "index");

        let record = ThreadRecord {
            id: key.thread_id(),
            key: "k".to_string(),
            name: "no-schema".to_string(),
            kind: ThreadKind::Open,
            state: ThreadState::Joined,
            initiator: identity.peer_id(),
            schema_id: None,
            secret: key.to_bytes().unwrap(),
            head: vec![],
        };
        index.add_thread(&record).unwrap();
        let thread = Thread::new(&record, ctx).unwrap();

        let result = thread.add_files(BlockId::compute(b"photo"), "caption");
        assert!(matches!(result, Err(WeftError::Config(_))));
    }

    #[test]
    fn test_join_records_peer_and_contact() {
        let fx = make_fixture();
        let peer = PeerId::from_string("friend".to_string());
        fx.thread
            .join(peer.clone(), "ada", vec!["cafe-inbox".to_string()])
            .unwrap();

        let peers = fx.thread.peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, peer);
        assert!(!peers[0].welcomed);

        let contact = fx.index.contact(&peer).unwrap().unwrap();
        assert_eq!(contact.username, "ada");
        assert_eq!(contact.inboxes, vec!["cafe-inbox".to_string()]);
    }

    #[test]
    fn test_leave_marks_thread_left() {
        let fx = make_fixture();
        fx.thread.add_message("hi").unwrap();
        fx.thread.leave().unwrap();
        assert_eq!(fx.thread.state().unwrap(), ThreadState::Left);
    }

    #[test]
    fn test_info_counts() {
        let fx = make_fixture();
        let h1 = fx.thread.add_message("hi").unwrap();
        fx.thread.add_files(BlockId::compute(b"photo"), "pic").unwrap();
        fx.thread.add_comment(h1, "nice").unwrap();

        let info = fx.thread.info().unwrap();
        assert_eq!(info.block_count, 3);
        assert_eq!(info.file_count, 1);
        assert_eq!(info.peer_count, 1);
        assert_eq!(info.head.len(), 1);
        assert_eq!(info.head[0].block_type, BlockType::Comment);
    }

    #[test]
    fn test_annotation_commits_reference_target() {
        let fx = make_fixture();
        let h1 = fx.thread.add_message("hi").unwrap();
        let like = fx.thread.add_like(h1).unwrap();
        let flag = fx.thread.flag(h1).unwrap();
        let ignore = fx.thread.ignore(h1).unwrap();

        for id in [like, flag, ignore] {
            assert_eq!(fx.index.block(&id).unwrap().unwrap().target, Some(h1));
        }
    }
}
