use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{KeelError, RecordId, Result};

use super::btree_page::LeafNodeRef;
use super::IndexKey;

/// Forward iterator over a B+tree's leaf chain.
///
/// Holds the current leaf pinned and read-latched; advancing past the last
/// slot releases it before the next sibling is taken, so the iterator never
/// owns two latches at once and cannot wedge against a structural writer.
/// It holds no tree-wide latch: entries observed during concurrent splits or
/// merges follow whatever leaf chain was linked at the time.
pub struct IndexIterator<K: IndexKey> {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    index: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> IndexIterator<K> {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, guard: ReadPageGuard, index: usize) -> Self {
        Self {
            bpm,
            guard: Some(guard),
            index,
            _marker: PhantomData,
        }
    }

    pub(crate) fn empty(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            index: 0,
            _marker: PhantomData,
        }
    }
}

impl<K: IndexKey> Iterator for IndexIterator<K> {
    type Item = Result<(K, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guard = self.guard.as_ref()?;
            let leaf = LeafNodeRef::<K>::new(guard.data());

            if self.index < leaf.size() {
                let item = (leaf.key_at(self.index), leaf.rid_at(self.index));
                self.index += 1;
                return Some(Ok(item));
            }

            let next_page_id = leaf.next_page_id();
            self.guard = None;
            self.index = 0;

            match next_page_id {
                None => return None,
                Some(page_id) => match self.bpm.fetch_page_read(page_id) {
                    Ok(Some(next_guard)) => self.guard = Some(next_guard),
                    Ok(None) => return Some(Err(KeelError::BufferPoolFull)),
                    Err(e) => return Some(Err(e)),
                },
            }
        }
    }
}
