use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{PageId, RecordId, TxnId};
use crate::index::BTreeIndex;
use crate::storage::table::{TableHeap, Tuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking lifecycle. A transaction grows while it only acquires
/// locks and shrinks from its first release onward; committed and aborted
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Delete,
    Update,
}

/// Undo record for a table mutation, applied in reverse order on abort.
pub struct TableWriteRecord {
    pub rid: RecordId,
    pub op: WriteOp,
    /// Pre-image for deletes and updates
    pub old_tuple: Option<Tuple>,
    pub table: Arc<TableHeap>,
}

impl TableWriteRecord {
    pub fn insert(rid: RecordId, table: Arc<TableHeap>) -> Self {
        Self {
            rid,
            op: WriteOp::Insert,
            old_tuple: None,
            table,
        }
    }

    pub fn delete(rid: RecordId, old_tuple: Tuple, table: Arc<TableHeap>) -> Self {
        Self {
            rid,
            op: WriteOp::Delete,
            old_tuple: Some(old_tuple),
            table,
        }
    }

    pub fn update(rid: RecordId, old_tuple: Tuple, table: Arc<TableHeap>) -> Self {
        Self {
            rid,
            op: WriteOp::Update,
            old_tuple: Some(old_tuple),
            table,
        }
    }
}

/// Undo record for an index mutation.
pub struct IndexWriteRecord {
    pub key: i64,
    pub rid: RecordId,
    pub op: WriteOp,
    pub index: Arc<BTreeIndex>,
}

impl IndexWriteRecord {
    pub fn insert(key: i64, rid: RecordId, index: Arc<BTreeIndex>) -> Self {
        Self {
            key,
            rid,
            op: WriteOp::Insert,
            index,
        }
    }

    pub fn delete(key: i64, rid: RecordId, index: Arc<BTreeIndex>) -> Self {
        Self {
            key,
            rid,
            op: WriteOp::Delete,
            index,
        }
    }
}

/// A transaction: identity, isolation level, 2PL state, the row locks it
/// holds, and the undo records accumulated by executors.
///
/// Shared as `Arc<Transaction>` because the deadlock detector aborts victims
/// from its own thread; every mutable field sits behind a lock.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<RecordId>>,
    exclusive_lock_set: Mutex<HashSet<RecordId>>,
    table_write_set: Mutex<Vec<TableWriteRecord>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
    /// Pages emptied by B+tree merges, reclaimed once latches are released
    deleted_page_set: Mutex<Vec<PageId>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            table_write_set: Mutex::new(Vec::new()),
            index_write_set: Mutex::new(Vec::new()),
            deleted_page_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn holds_shared(&self, rid: RecordId) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn holds_exclusive(&self, rid: RecordId) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub fn shared_lock_count(&self) -> usize {
        self.shared_lock_set.lock().len()
    }

    pub fn exclusive_lock_count(&self) -> usize {
        self.exclusive_lock_set.lock().len()
    }

    pub(crate) fn add_shared_lock(&self, rid: RecordId) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive_lock(&self, rid: RecordId) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared_lock(&self, rid: RecordId) -> bool {
        self.shared_lock_set.lock().remove(&rid)
    }

    pub(crate) fn remove_exclusive_lock(&self, rid: RecordId) -> bool {
        self.exclusive_lock_set.lock().remove(&rid)
    }

    /// Every RID this transaction holds any lock on.
    pub(crate) fn locked_rids(&self) -> Vec<RecordId> {
        let mut rids: Vec<RecordId> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    pub fn append_table_write(&self, record: TableWriteRecord) {
        self.table_write_set.lock().push(record);
    }

    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    pub(crate) fn take_table_writes(&self) -> Vec<TableWriteRecord> {
        std::mem::take(&mut *self.table_write_set.lock())
    }

    pub(crate) fn take_index_writes(&self) -> Vec<IndexWriteRecord> {
        std::mem::take(&mut *self.index_write_set.lock())
    }

    pub fn append_deleted_page(&self, page_id: PageId) {
        self.deleted_page_set.lock().push(page_id);
    }

    pub fn take_deleted_pages(&self) -> Vec<PageId> {
        std::mem::take(&mut *self.deleted_page_set.lock())
    }
}
