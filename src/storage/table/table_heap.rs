use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::buffer::BufferPoolManager;
use crate::common::{KeelError, PageId, RecordId, Result, SlotId, PAGE_SIZE};
use crate::concurrency::{TableWriteRecord, Transaction};
use crate::storage::page::{TablePage, TablePageRef};

use super::Tuple;

/// Tuples larger than this can never fit in a fresh page
const MAX_TUPLE_SIZE: usize = PAGE_SIZE - 16;

/// TableHeap is an unordered collection of tuples stored as a singly linked
/// list of table pages.
///
/// Mutations are transactional: each one appends the matching undo record to
/// the transaction's write set, and deletes are two-phase (`mark_delete` at
/// execution time, `apply_delete` at commit) so an abort can put the tuple
/// back. Row locks are the caller's business; the heap only latches pages.
pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    first_page_id: PageId,
    /// Last page known to have had free space, to avoid rescanning the chain
    insert_hint: Mutex<PageId>,
}

impl TableHeap {
    /// Creates a heap with one empty page.
    pub fn new(bpm: Arc<BufferPoolManager>) -> Result<Self> {
        let first_page_id = {
            let mut guard = bpm
                .new_page_write()?
                .ok_or(KeelError::BufferPoolFull)?;
            let page_id = guard.page_id();
            TablePage::new(guard.data_mut()).init(page_id);
            page_id
        };

        Ok(Self {
            bpm,
            first_page_id,
            insert_hint: Mutex::new(first_page_id),
        })
    }

    /// Re-opens a heap whose first page already exists on disk.
    pub fn open(bpm: Arc<BufferPoolManager>, first_page_id: PageId) -> Self {
        Self {
            bpm,
            first_page_id,
            insert_hint: Mutex::new(first_page_id),
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Inserts a tuple, extending the page chain when the tail is full.
    pub fn insert_tuple(self: &Arc<Self>, data: &[u8], txn: &Transaction) -> Result<RecordId> {
        if data.len() > MAX_TUPLE_SIZE {
            return Err(KeelError::TupleTooLarge {
                tuple_size: data.len(),
                available: MAX_TUPLE_SIZE,
            });
        }

        let mut page_id = *self.insert_hint.lock();
        loop {
            let mut guard = self
                .bpm
                .fetch_page_write(page_id)?
                .ok_or(KeelError::BufferPoolFull)?;
            let mut page = TablePage::new(guard.data_mut());

            if page.can_insert(data.len()) {
                let slot_id = page.insert_tuple(data)?;
                let rid = RecordId::new(page_id, slot_id);
                *self.insert_hint.lock() = page_id;
                trace!("txn {} inserted {}", txn.id(), rid);
                txn.append_table_write(TableWriteRecord::insert(rid, Arc::clone(self)));
                return Ok(rid);
            }

            match page.next_page_id() {
                Some(next) => page_id = next,
                None => {
                    let mut new_guard = self
                        .bpm
                        .new_page_write()?
                        .ok_or(KeelError::BufferPoolFull)?;
                    let new_page_id = new_guard.page_id();
                    TablePage::new(new_guard.data_mut()).init(new_page_id);
                    page.set_next_page_id(Some(new_page_id));
                    page_id = new_page_id;
                }
            }
        }
    }

    /// Reads a live tuple.
    pub fn get_tuple(&self, rid: RecordId, txn: &Transaction) -> Result<Tuple> {
        trace!("txn {} reads {}", txn.id(), rid);
        let guard = self
            .bpm
            .fetch_page_read(rid.page_id)?
            .ok_or(KeelError::BufferPoolFull)?;
        let page = TablePageRef::new(guard.data());
        if page.is_deleted(rid.slot_id) {
            return Err(KeelError::TupleNotFound(rid));
        }
        Ok(Tuple::with_rid(page.get_tuple(rid.slot_id)?.to_vec(), rid))
    }

    /// Tombstones a tuple; the payload survives until commit so an abort can
    /// resurrect it. Returns false if the tuple is already gone.
    pub fn mark_delete(self: &Arc<Self>, rid: RecordId, txn: &Transaction) -> Result<bool> {
        let mut guard = self
            .bpm
            .fetch_page_write(rid.page_id)?
            .ok_or(KeelError::BufferPoolFull)?;
        let mut page = TablePage::new(guard.data_mut());

        if page.is_deleted(rid.slot_id) {
            return Ok(false);
        }
        let old_tuple = Tuple::with_rid(page.get_tuple(rid.slot_id)?.to_vec(), rid);
        page.mark_delete(rid.slot_id)?;
        trace!("txn {} marked {} deleted", txn.id(), rid);
        txn.append_table_write(TableWriteRecord::delete(rid, old_tuple, Arc::clone(self)));
        Ok(true)
    }

    /// Physically removes a tuple. Called at commit for tombstoned tuples
    /// and at abort for tuples the aborting transaction inserted.
    pub fn apply_delete(&self, rid: RecordId) -> Result<()> {
        let mut guard = self
            .bpm
            .fetch_page_write(rid.page_id)?
            .ok_or(KeelError::BufferPoolFull)?;
        TablePage::new(guard.data_mut()).apply_delete(rid.slot_id)
    }

    /// Clears a tombstone set by `mark_delete`. Called at abort.
    pub fn rollback_delete(&self, rid: RecordId) -> Result<()> {
        let mut guard = self
            .bpm
            .fetch_page_write(rid.page_id)?
            .ok_or(KeelError::BufferPoolFull)?;
        TablePage::new(guard.data_mut()).rollback_delete(rid.slot_id)
    }

    /// Overwrites a tuple in place. Only same-size updates are supported;
    /// callers fall back to delete+insert otherwise. Returns false when the
    /// sizes differ or the tuple is gone.
    pub fn update_tuple(self: &Arc<Self>, rid: RecordId, new_data: &[u8], txn: &Transaction) -> Result<bool> {
        let mut guard = self
            .bpm
            .fetch_page_write(rid.page_id)?
            .ok_or(KeelError::BufferPoolFull)?;
        let mut page = TablePage::new(guard.data_mut());

        if page.is_deleted(rid.slot_id) {
            return Ok(false);
        }
        let old = page.get_tuple(rid.slot_id)?.to_vec();
        if old.len() != new_data.len() {
            return Ok(false);
        }
        page.update_tuple(rid.slot_id, new_data)?;
        trace!("txn {} updated {}", txn.id(), rid);
        txn.append_table_write(TableWriteRecord::update(
            rid,
            Tuple::with_rid(old, rid),
            Arc::clone(self),
        ));
        Ok(true)
    }

    /// Restores a previous tuple image. Called at abort to undo an update.
    pub fn restore_tuple(&self, rid: RecordId, old_tuple: &Tuple) -> Result<()> {
        let mut guard = self
            .bpm
            .fetch_page_write(rid.page_id)?
            .ok_or(KeelError::BufferPoolFull)?;
        TablePage::new(guard.data_mut()).update_tuple(rid.slot_id, old_tuple.data())
    }

    /// Forward scan over live tuples in slot order, page by page.
    pub fn iter(self: &Arc<Self>) -> TableIterator {
        TableIterator {
            heap: Arc::clone(self),
            page_id: Some(self.first_page_id),
            next_slot: 0,
        }
    }
}

pub struct TableIterator {
    heap: Arc<TableHeap>,
    page_id: Option<PageId>,
    next_slot: usize,
}

impl Iterator for TableIterator {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let page_id = self.page_id?;
            let guard = match self.heap.bpm.fetch_page_read(page_id) {
                Ok(Some(guard)) => guard,
                Ok(None) => return Some(Err(KeelError::BufferPoolFull)),
                Err(e) => return Some(Err(e)),
            };
            let page = TablePageRef::new(guard.data());

            while self.next_slot < page.slot_count() {
                let slot = SlotId::new(self.next_slot as u16);
                self.next_slot += 1;
                if !page.is_deleted(slot) {
                    let rid = RecordId::new(page_id, slot);
                    return match page.get_tuple(slot) {
                        Ok(data) => Some(Ok(Tuple::with_rid(data.to_vec(), rid))),
                        Err(e) => Some(Err(e)),
                    };
                }
            }

            self.page_id = page.next_page_id();
            self.next_slot = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::IsolationLevel;
    use crate::storage::disk::DiskManager;
    use tempfile::tempdir;

    fn setup() -> (Arc<TableHeap>, Arc<BufferPoolManager>, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let dm = Arc::new(DiskManager::new(temp_dir.path().join("heap.db")).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(32, dm));
        let heap = Arc::new(TableHeap::new(Arc::clone(&bpm)).unwrap());
        (heap, bpm, temp_dir)
    }

    fn txn() -> Transaction {
        Transaction::new(0, IsolationLevel::RepeatableRead)
    }

    #[test]
    fn test_heap_insert_and_get() {
        let (heap, _bpm, _dir) = setup();
        let txn = txn();

        let rid = heap.insert_tuple(b"payload", &txn).unwrap();
        let tuple = heap.get_tuple(rid, &txn).unwrap();
        assert_eq!(tuple.data(), b"payload");
        assert_eq!(tuple.rid(), Some(rid));
    }

    #[test]
    fn test_heap_spans_pages() {
        let (heap, _bpm, _dir) = setup();
        let txn = txn();

        let big = vec![1u8; 1000];
        let rids: Vec<_> = (0..20)
            .map(|_| heap.insert_tuple(&big, &txn).unwrap())
            .collect();

        let distinct_pages: std::collections::HashSet<_> =
            rids.iter().map(|rid| rid.page_id).collect();
        assert!(distinct_pages.len() > 1);

        let scanned: Vec<_> = heap.iter().map(|t| t.unwrap()).collect();
        assert_eq!(scanned.len(), 20);
    }

    #[test]
    fn test_heap_delete_cycle() {
        let (heap, _bpm, _dir) = setup();
        let txn = txn();

        let rid = heap.insert_tuple(b"row", &txn).unwrap();
        assert!(heap.mark_delete(rid, &txn).unwrap());
        assert!(heap.get_tuple(rid, &txn).is_err());

        heap.rollback_delete(rid).unwrap();
        assert_eq!(heap.get_tuple(rid, &txn).unwrap().data(), b"row");
    }

    #[test]
    fn test_heap_update_same_size_only() {
        let (heap, _bpm, _dir) = setup();
        let txn = txn();

        let rid = heap.insert_tuple(b"aaaa", &txn).unwrap();
        assert!(heap.update_tuple(rid, b"bbbb", &txn).unwrap());
        assert!(!heap.update_tuple(rid, b"ccccc", &txn).unwrap());
        assert_eq!(heap.get_tuple(rid, &txn).unwrap().data(), b"bbbb");
    }
}
