//! Keel - the storage and concurrency core of a disk-oriented RDBMS
//!
//! This crate implements the substrate a relational engine sits on: pages on
//! disk, a buffer pool caching them in memory, an ordered index, and the
//! machinery that keeps concurrent transactions consistent.
//!
//! # Architecture
//!
//! - **Storage layer** (`storage`): durable bytes
//!   - `DiskManager`: allocates, reads and writes fixed-size pages in a file
//!   - `DiskScheduler`: background worker feeding disk I/O from a queue
//!   - `TablePage`/`TableHeap`: slotted tuple storage with two-phase deletes
//!   - `HeaderPage`: page 0, mapping index names to root pages
//!
//! - **Buffer pool** (`buffer`): bounded page cache
//!   - `BufferPoolManager`: pins, fetches, flushes and evicts pages
//!   - `LruReplacer`: picks eviction victims in first-unpin order
//!   - `ReadPageGuard`/`WritePageGuard`: RAII pin + page latch
//!
//! - **Index** (`index`): concurrent B+tree
//!   - `BPlusTree`: insert/remove/lookup/scan with latch crabbing
//!   - `BTreeIndex`: executor-facing wrapper with transactional undo
//!
//! - **Concurrency** (`concurrency`): pessimistic transactions
//!   - `LockManager`: row S/X locks, upgrades, deadlock detection
//!   - `TransactionManager`: begin/commit/abort with write-set rollback
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keel::buffer::BufferPoolManager;
//! use keel::concurrency::{LockManager, TransactionManager};
//! use keel::index::BPlusTree;
//! use keel::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("demo.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, disk_manager));
//! let txn_mgr = TransactionManager::new(Arc::new(LockManager::new()));
//!
//! let tree: BPlusTree<i64> = BPlusTree::new("demo_index", Arc::clone(&bpm), 32, 32).unwrap();
//! let txn = txn_mgr.begin();
//! tree.insert(42, keel::common::RecordId::new(
//!     keel::common::PageId::new(1),
//!     keel::common::SlotId::new(0),
//! ), &txn).unwrap();
//! txn_mgr.commit(&txn).unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{FrameId, KeelError, PageId, RecordId, Result, SlotId, TxnId};
