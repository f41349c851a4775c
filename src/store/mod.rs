//! Local persistence: a RocksDB-backed index of blocks, threads, peers,
//! contacts, pointers, and the cafe request queue.

mod index;
mod rocksdb;

pub use index::{
    BlockRow, BlockStoreIndex, ContactRow, PointerRow, ThreadKind, ThreadPeerRow, ThreadRecord,
    ThreadState,
};
pub use rocksdb::{composite_key, DbConfig, DbHandle};
