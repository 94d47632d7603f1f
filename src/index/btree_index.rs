use std::sync::Arc;

use crate::buffer::BufferPoolManager;
use crate::common::{RecordId, Result};
use crate::concurrency::{IndexWriteRecord, Transaction};

use super::{BPlusTree, IndexIterator};

/// What the executors know about an index: its name, the table it belongs
/// to, and which tuple attributes form the key.
#[derive(Debug, Clone)]
pub struct IndexMetadata {
    name: String,
    table_name: String,
    key_attrs: Vec<u32>,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>, key_attrs: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            key_attrs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn key_attrs(&self) -> &[u32] {
        &self.key_attrs
    }
}

/// Executor-facing index wrapper over the B+tree.
///
/// Mutations append undo records to the transaction's index write set so an
/// abort can reverse them; the raw `undo_*` entry points below apply those
/// reversals without recording anything further.
pub struct BTreeIndex {
    metadata: IndexMetadata,
    tree: BPlusTree<i64>,
}

impl BTreeIndex {
    pub fn new(
        metadata: IndexMetadata,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        let tree = BPlusTree::new(
            metadata.name().to_owned(),
            bpm,
            leaf_max_size,
            internal_max_size,
        )?;
        Ok(Self { metadata, tree })
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Adds `key -> rid`. Returns false on duplicate key.
    pub fn insert_entry(self: &Arc<Self>, key: i64, rid: RecordId, txn: &Transaction) -> Result<bool> {
        let inserted = self.tree.insert(key, rid, txn)?;
        if inserted {
            txn.append_index_write(IndexWriteRecord::insert(key, rid, Arc::clone(self)));
        }
        Ok(inserted)
    }

    /// Drops the entry for `key`; a missing key is a no-op.
    pub fn delete_entry(self: &Arc<Self>, key: i64, rid: RecordId, txn: &Transaction) -> Result<()> {
        self.tree.remove(key, txn)?;
        txn.append_index_write(IndexWriteRecord::delete(key, rid, Arc::clone(self)));
        Ok(())
    }

    /// Collects the RIDs stored under `key` into `result`.
    pub fn scan_key(&self, key: i64, result: &mut Vec<RecordId>, txn: &Transaction) -> Result<bool> {
        self.tree.get_value(key, result, txn)
    }

    /// Range scan starting at the first key >= `key`.
    pub fn scan_from(&self, key: i64, txn: &Transaction) -> Result<IndexIterator<i64>> {
        self.tree.iter_from(key, txn)
    }

    pub fn scan_all(&self, txn: &Transaction) -> Result<IndexIterator<i64>> {
        self.tree.iter(txn)
    }

    /// Reverses an insert during abort, without recording new undo.
    pub(crate) fn undo_insert(&self, key: i64, txn: &Transaction) -> Result<()> {
        self.tree.remove(key, txn)
    }

    /// Reverses a delete during abort, without recording new undo.
    pub(crate) fn undo_delete(&self, key: i64, rid: RecordId, txn: &Transaction) -> Result<()> {
        self.tree.insert(key, rid, txn)?;
        Ok(())
    }
}
