use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::common::{KeelError, PageId, RecordId, Result, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::concurrency::Transaction;
use crate::storage::page::HeaderPage;

use super::btree_page::{
    internal_capacity, leaf_capacity, set_parent_raw, InternalNode, InternalNodeRef, LeafNode,
    LeafNodeRef, NodeRef,
};
use super::{IndexIterator, IndexKey};

/// Concurrent B+tree index over the buffer pool.
///
/// Keys map to RIDs; duplicates are rejected. Readers crab down the tree
/// holding at most two read latches. Writers descend with write latches and
/// release the ancestor path as soon as the current node is safe: a node
/// that can absorb an insert without splitting, or a delete without merging.
/// The `root` lock is the tree latch: it guards the root page id and
/// serialises creation, replacement and removal of the root itself.
///
/// The root pointer is persisted in the header page under the index name, so
/// a tree can be re-opened from an existing database file.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    leaf_max_size: usize,
    internal_max_size: usize,
    root: RwLock<PageId>,
    _marker: std::marker::PhantomData<K>,
}

/// Latches a writer holds on the way down: the tree latch plus the
/// write-latched ancestor path, root-most first.
struct Context<'a> {
    tree_latch: Option<RwLockWriteGuard<'a, PageId>>,
    path: Vec<WritePageGuard>,
}

impl Context<'_> {
    /// Drops every latch above the node on top of the path.
    fn release_ancestors(&mut self) {
        self.tree_latch = None;
        if self.path.len() > 1 {
            let keep = self.path.pop().unwrap();
            self.path.clear();
            self.path.push(keep);
        }
    }

    fn at_root(&self) -> bool {
        self.tree_latch.is_some() && self.path.len() == 1
    }
}

impl<K: IndexKey> BPlusTree<K> {
    pub fn new(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(
            (2..=leaf_capacity::<K>()).contains(&leaf_max_size),
            "leaf_max_size out of range"
        );
        assert!(
            (2..=internal_capacity::<K>()).contains(&internal_max_size),
            "internal_max_size out of range"
        );

        let index_name = index_name.into();
        let root = Self::load_or_register_root(&bpm, &index_name)?;

        Ok(Self {
            index_name,
            bpm,
            leaf_max_size,
            internal_max_size,
            root: RwLock::new(root),
            _marker: std::marker::PhantomData,
        })
    }

    /// Reads the persisted root pointer, creating the header page and the
    /// index record on first use.
    fn load_or_register_root(bpm: &Arc<BufferPoolManager>, name: &str) -> Result<PageId> {
        if bpm.disk_manager().num_pages() == 0 {
            let mut guard = bpm.new_page_write()?.ok_or(KeelError::BufferPoolFull)?;
            assert_eq!(guard.page_id(), HEADER_PAGE_ID);
            let mut header = HeaderPage::new(guard.data_mut());
            header.init();
            header.insert_record(name, INVALID_PAGE_ID);
            return Ok(INVALID_PAGE_ID);
        }

        let mut guard = bpm
            .fetch_page_write(HEADER_PAGE_ID)?
            .ok_or(KeelError::BufferPoolFull)?;
        let mut header = HeaderPage::new(guard.data_mut());
        match header.get_root_id(name) {
            Some(root) => Ok(root),
            None => {
                header.insert_record(name, INVALID_PAGE_ID);
                Ok(INVALID_PAGE_ID)
            }
        }
    }

    fn update_root_record(&self, root: PageId) -> Result<()> {
        let mut guard = self
            .bpm
            .fetch_page_write(HEADER_PAGE_ID)?
            .ok_or(KeelError::BufferPoolFull)?;
        HeaderPage::new(guard.data_mut()).update_record(&self.index_name, root);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self.root.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root.read()
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    fn leaf_min_size(&self) -> usize {
        (self.leaf_max_size + 1) / 2
    }

    fn internal_min_size(&self) -> usize {
        self.internal_max_size / 2
    }

    /// Inserts a key/RID pair. Returns false if the key is already present.
    pub fn insert(&self, key: K, rid: RecordId, txn: &Transaction) -> Result<bool> {
        trace!("txn {} insert {:?} -> {}", txn.id(), key, rid);
        let mut tree_latch = self.root.write();

        if *tree_latch == INVALID_PAGE_ID {
            let mut guard = self
                .bpm
                .new_page_write()?
                .ok_or(KeelError::BufferPoolFull)?;
            let page_id = guard.page_id();
            let mut leaf = LeafNode::<K>::init(guard.data_mut(), page_id, self.leaf_max_size);
            leaf.insert(key, rid);
            *tree_latch = page_id;
            drop(guard);
            self.update_root_record(page_id)?;
            debug!("{}: started new tree at {}", self.index_name, page_id);
            return Ok(true);
        }

        let root_id = *tree_latch;
        let mut ctx = Context {
            tree_latch: Some(tree_latch),
            path: Vec::new(),
        };
        let guard = self
            .bpm
            .fetch_page_write(root_id)?
            .ok_or(KeelError::BufferPoolFull)?;
        ctx.path.push(guard);
        self.release_if_safe(&mut ctx, Operation::Insert);

        loop {
            let (is_leaf, child_id) = {
                let guard = ctx.path.last().unwrap();
                let node = NodeRef::new(guard.data());
                if node.is_leaf() {
                    (true, INVALID_PAGE_ID)
                } else {
                    (false, InternalNodeRef::<K>::new(guard.data()).lookup(key))
                }
            };
            if is_leaf {
                break;
            }
            let child = self
                .bpm
                .fetch_page_write(child_id)?
                .ok_or(KeelError::BufferPoolFull)?;
            ctx.path.push(child);
            self.release_if_safe(&mut ctx, Operation::Insert);
        }

        let mut leaf_guard = ctx.path.pop().unwrap();
        if LeafNodeRef::<K>::new(leaf_guard.data()).lookup(key).is_some() {
            return Ok(false);
        }

        let new_size = LeafNode::<K>::new(leaf_guard.data_mut()).insert(key, rid);
        if new_size <= self.leaf_max_size {
            return Ok(true);
        }

        self.split_leaf(&mut ctx, leaf_guard)?;
        Ok(true)
    }

    fn split_leaf(&self, ctx: &mut Context<'_>, mut leaf_guard: WritePageGuard) -> Result<()> {
        let mut sibling_guard = self
            .bpm
            .new_page_write()?
            .ok_or(KeelError::BufferPoolFull)?;
        let sibling_id = sibling_guard.page_id();

        let separator = {
            let mut leaf = LeafNode::<K>::new(leaf_guard.data_mut());
            let mut sibling =
                LeafNode::<K>::init(sibling_guard.data_mut(), sibling_id, self.leaf_max_size);
            sibling.set_parent_page_id(leaf.parent_page_id());
            leaf.move_half_to(&mut sibling);
            sibling.key_at(0)
        };
        trace!(
            "{}: split leaf {} -> {}",
            self.index_name,
            leaf_guard.page_id(),
            sibling_id
        );

        self.insert_into_parent(ctx, leaf_guard, separator, sibling_guard)
    }

    /// Installs (separator, right) above a freshly split pair, growing the
    /// tree by one level if the split reached the root.
    fn insert_into_parent(
        &self,
        ctx: &mut Context<'_>,
        mut left_guard: WritePageGuard,
        separator: K,
        mut right_guard: WritePageGuard,
    ) -> Result<()> {
        let left_id = left_guard.page_id();
        let right_id = right_guard.page_id();

        if ctx.path.is_empty() {
            // left was the root; the tree latch is still held
            let mut root_guard = self
                .bpm
                .new_page_write()?
                .ok_or(KeelError::BufferPoolFull)?;
            let new_root_id = root_guard.page_id();
            InternalNode::<K>::init(root_guard.data_mut(), new_root_id, self.internal_max_size)
                .populate_new_root(left_id, separator, right_id);
            set_parent_raw(left_guard.data_mut(), Some(new_root_id));
            set_parent_raw(right_guard.data_mut(), Some(new_root_id));
            drop(left_guard);
            drop(right_guard);
            drop(root_guard);

            **ctx.tree_latch.as_mut().expect("root split holds the tree latch") = new_root_id;
            self.update_root_record(new_root_id)?;
            debug!("{}: new root {}", self.index_name, new_root_id);
            return Ok(());
        }

        let mut parent_guard = ctx.path.pop().unwrap();
        let parent_id = parent_guard.page_id();
        set_parent_raw(right_guard.data_mut(), Some(parent_id));

        let new_size = InternalNode::<K>::new(parent_guard.data_mut())
            .insert_node_after(left_id, separator, right_id);
        drop(left_guard);
        drop(right_guard);

        if new_size <= self.internal_max_size {
            return Ok(());
        }

        // parent overflowed in turn
        let mut sibling_guard = self
            .bpm
            .new_page_write()?
            .ok_or(KeelError::BufferPoolFull)?;
        let sibling_id = sibling_guard.page_id();
        let (promoted, moved_children) = {
            let mut parent = InternalNode::<K>::new(parent_guard.data_mut());
            let mut sibling = InternalNode::<K>::init(
                sibling_guard.data_mut(),
                sibling_id,
                self.internal_max_size,
            );
            sibling.set_parent_page_id(parent.parent_page_id());
            let promoted = parent.move_half_to(&mut sibling);
            (promoted, sibling.children())
        };
        for child_id in moved_children {
            let mut child = self
                .bpm
                .fetch_page_write(child_id)?
                .ok_or(KeelError::BufferPoolFull)?;
            set_parent_raw(child.data_mut(), Some(sibling_id));
        }
        trace!(
            "{}: split internal {} -> {}",
            self.index_name,
            parent_id,
            sibling_id
        );

        self.insert_into_parent(ctx, parent_guard, promoted, sibling_guard)
    }

    /// Removes a key if present; absent keys are a no-op. Underflowing nodes
    /// borrow from the left sibling first, then the right, and merge when
    /// neither can spare an entry.
    pub fn remove(&self, key: K, txn: &Transaction) -> Result<()> {
        trace!("txn {} remove {:?}", txn.id(), key);
        let tree_latch = self.root.write();
        if *tree_latch == INVALID_PAGE_ID {
            return Ok(());
        }

        let root_id = *tree_latch;
        let mut ctx = Context {
            tree_latch: Some(tree_latch),
            path: Vec::new(),
        };
        let guard = self
            .bpm
            .fetch_page_write(root_id)?
            .ok_or(KeelError::BufferPoolFull)?;
        ctx.path.push(guard);
        self.release_if_safe(&mut ctx, Operation::Delete);

        loop {
            let (is_leaf, child_id) = {
                let guard = ctx.path.last().unwrap();
                let node = NodeRef::new(guard.data());
                if node.is_leaf() {
                    (true, INVALID_PAGE_ID)
                } else {
                    (false, InternalNodeRef::<K>::new(guard.data()).lookup(key))
                }
            };
            if is_leaf {
                break;
            }
            let child = self
                .bpm
                .fetch_page_write(child_id)?
                .ok_or(KeelError::BufferPoolFull)?;
            ctx.path.push(child);
            self.release_if_safe(&mut ctx, Operation::Delete);
        }

        let mut leaf_guard = ctx.path.pop().unwrap();
        let leaf_id = leaf_guard.page_id();
        let (removed, size) = {
            let mut leaf = LeafNode::<K>::new(leaf_guard.data_mut());
            let removed = leaf.remove(key);
            (removed, leaf.size())
        };
        if !removed {
            return Ok(());
        }

        if ctx.tree_latch.is_some() && ctx.path.is_empty() {
            // the leaf is the root
            if size == 0 {
                **ctx.tree_latch.as_mut().unwrap() = INVALID_PAGE_ID;
                drop(leaf_guard);
                self.update_root_record(INVALID_PAGE_ID)?;
                txn.append_deleted_page(leaf_id);
                debug!("{}: tree emptied", self.index_name);
            }
        } else if !ctx.path.is_empty() && size < self.leaf_min_size() {
            self.resolve_underflow(&mut ctx, leaf_guard, txn)?;
        }

        drop(ctx);
        for page_id in txn.take_deleted_pages() {
            self.bpm.delete_page(page_id)?;
        }
        Ok(())
    }

    /// Fixes an underflowing non-root node, walking upward while merges keep
    /// shrinking the parents.
    fn resolve_underflow(
        &self,
        ctx: &mut Context<'_>,
        mut node_guard: WritePageGuard,
        txn: &Transaction,
    ) -> Result<()> {
        loop {
            let node_id = node_guard.page_id();
            let is_leaf = NodeRef::new(node_guard.data()).is_leaf();
            let mut parent_guard = ctx.path.pop().expect("underflowing node has a latched parent");
            let parent_id = parent_guard.page_id();

            let (node_index, parent_size) = {
                let parent = InternalNodeRef::<K>::new(parent_guard.data());
                (
                    parent
                        .child_index(node_id)
                        .expect("node is a child of its parent"),
                    parent.size(),
                )
            };

            // redistribution from the left sibling first
            let mut left_guard = if node_index > 0 {
                let left_id =
                    InternalNodeRef::<K>::new(parent_guard.data()).child_at(node_index - 1);
                Some(
                    self.bpm
                        .fetch_page_write(left_id)?
                        .ok_or(KeelError::BufferPoolFull)?,
                )
            } else {
                None
            };

            if let Some(left) = left_guard.as_mut() {
                if NodeRef::new(left.data()).size() > self.min_size(is_leaf) {
                    self.steal_from_left(&mut parent_guard, left, &mut node_guard, node_index)?;
                    return Ok(());
                }
            }

            // then from the right sibling
            let mut right_guard = if node_index < parent_size {
                let right_id =
                    InternalNodeRef::<K>::new(parent_guard.data()).child_at(node_index + 1);
                Some(
                    self.bpm
                        .fetch_page_write(right_id)?
                        .ok_or(KeelError::BufferPoolFull)?,
                )
            } else {
                None
            };

            if let Some(right) = right_guard.as_mut() {
                if NodeRef::new(right.data()).size() > self.min_size(is_leaf) {
                    self.steal_from_right(&mut parent_guard, &mut node_guard, right, node_index)?;
                    return Ok(());
                }
            }

            // neither sibling can spare an entry: merge
            let merged_into = if let Some(mut left) = left_guard {
                self.merge(&mut parent_guard, &mut left, &mut node_guard, node_index, txn)?;
                drop(node_guard);
                let merged_into = left.page_id();
                drop(left);
                merged_into
            } else {
                let mut right = right_guard.expect("a non-root node has at least one sibling");
                let right_index = node_index + 1;
                self.merge(&mut parent_guard, &mut node_guard, &mut right, right_index, txn)?;
                drop(right);
                let merged_into = node_guard.page_id();
                drop(node_guard);
                merged_into
            };

            let parent_size = InternalNodeRef::<K>::new(parent_guard.data()).size();
            if ctx.tree_latch.is_some() && ctx.path.is_empty() {
                // parent is the root
                if parent_size == 0 {
                    drop(parent_guard);
                    **ctx.tree_latch.as_mut().unwrap() = merged_into;
                    let mut new_root = self
                        .bpm
                        .fetch_page_write(merged_into)?
                        .ok_or(KeelError::BufferPoolFull)?;
                    set_parent_raw(new_root.data_mut(), None);
                    drop(new_root);
                    self.update_root_record(merged_into)?;
                    txn.append_deleted_page(parent_id);
                    debug!("{}: root collapsed to {}", self.index_name, merged_into);
                }
                return Ok(());
            }
            if parent_size >= self.internal_min_size() || ctx.path.is_empty() {
                return Ok(());
            }
            node_guard = parent_guard;
        }
    }

    fn min_size(&self, is_leaf: bool) -> usize {
        if is_leaf {
            self.leaf_min_size()
        } else {
            self.internal_min_size()
        }
    }

    /// Moves the left sibling's last entry into `node` and refreshes the
    /// separator at `node_index`.
    fn steal_from_left(
        &self,
        parent_guard: &mut WritePageGuard,
        left_guard: &mut WritePageGuard,
        node_guard: &mut WritePageGuard,
        node_index: usize,
    ) -> Result<()> {
        let node_id = node_guard.page_id();
        if NodeRef::new(node_guard.data()).is_leaf() {
            let mut left = LeafNode::<K>::new(left_guard.data_mut());
            let mut node = LeafNode::<K>::new(node_guard.data_mut());
            left.move_last_to_front_of(&mut node);
            InternalNode::<K>::new(parent_guard.data_mut()).set_key_at(node_index, node.key_at(0));
        } else {
            let moved_child = {
                let mut parent = InternalNode::<K>::new(parent_guard.data_mut());
                let separator = parent.key_at(node_index);
                let mut left = InternalNode::<K>::new(left_guard.data_mut());
                let mut node = InternalNode::<K>::new(node_guard.data_mut());
                let promoted = left.move_last_to_front_of(&mut node, separator);
                parent.set_key_at(node_index, promoted);
                node.child_at(0)
            };
            let mut child = self
                .bpm
                .fetch_page_write(moved_child)?
                .ok_or(KeelError::BufferPoolFull)?;
            set_parent_raw(child.data_mut(), Some(node_id));
        }
        Ok(())
    }

    /// Moves the right sibling's first entry into `node` and refreshes the
    /// separator at `node_index + 1`.
    fn steal_from_right(
        &self,
        parent_guard: &mut WritePageGuard,
        node_guard: &mut WritePageGuard,
        right_guard: &mut WritePageGuard,
        node_index: usize,
    ) -> Result<()> {
        let node_id = node_guard.page_id();
        if NodeRef::new(node_guard.data()).is_leaf() {
            let mut node = LeafNode::<K>::new(node_guard.data_mut());
            let mut right = LeafNode::<K>::new(right_guard.data_mut());
            right.move_first_to_end_of(&mut node);
            InternalNode::<K>::new(parent_guard.data_mut())
                .set_key_at(node_index + 1, right.key_at(0));
        } else {
            let moved_child = {
                let mut parent = InternalNode::<K>::new(parent_guard.data_mut());
                let separator = parent.key_at(node_index + 1);
                let mut node = InternalNode::<K>::new(node_guard.data_mut());
                let mut right = InternalNode::<K>::new(right_guard.data_mut());
                let promoted = right.move_first_to_end_of(&mut node, separator);
                parent.set_key_at(node_index + 1, promoted);
                node.child_at(node.size())
            };
            let mut child = self
                .bpm
                .fetch_page_write(moved_child)?
                .ok_or(KeelError::BufferPoolFull)?;
            set_parent_raw(child.data_mut(), Some(node_id));
        }
        Ok(())
    }

    /// Merges the child at `right_index` into its left neighbour and drops
    /// its slot from the parent. The emptied page is registered on the
    /// transaction for deletion once all latches are released.
    fn merge(
        &self,
        parent_guard: &mut WritePageGuard,
        left_guard: &mut WritePageGuard,
        right_guard: &mut WritePageGuard,
        right_index: usize,
        txn: &Transaction,
    ) -> Result<()> {
        let left_id = left_guard.page_id();
        let right_id = right_guard.page_id();

        if NodeRef::new(right_guard.data()).is_leaf() {
            let mut left = LeafNode::<K>::new(left_guard.data_mut());
            let mut right = LeafNode::<K>::new(right_guard.data_mut());
            right.move_all_to(&mut left);
        } else {
            let moved_children = {
                let separator =
                    InternalNodeRef::<K>::new(parent_guard.data()).key_at(right_index);
                let mut left = InternalNode::<K>::new(left_guard.data_mut());
                let mut right = InternalNode::<K>::new(right_guard.data_mut());
                let moved = right.children();
                right.move_all_to(&mut left, separator);
                moved
            };
            for child_id in moved_children {
                let mut child = self
                    .bpm
                    .fetch_page_write(child_id)?
                    .ok_or(KeelError::BufferPoolFull)?;
                set_parent_raw(child.data_mut(), Some(left_id));
            }
        }

        InternalNode::<K>::new(parent_guard.data_mut()).remove_at(right_index);
        txn.append_deleted_page(right_id);
        trace!("{}: merged {} into {}", self.index_name, right_id, left_id);
        Ok(())
    }

    /// Appends the RID stored under `key` to `result`. Returns whether the
    /// key was found.
    pub fn get_value(&self, key: K, result: &mut Vec<RecordId>, txn: &Transaction) -> Result<bool> {
        trace!("txn {} lookup {:?}", txn.id(), key);
        let tree_latch = self.root.read();
        if *tree_latch == INVALID_PAGE_ID {
            return Ok(false);
        }

        let mut guard = self
            .bpm
            .fetch_page_read(*tree_latch)?
            .ok_or(KeelError::BufferPoolFull)?;
        drop(tree_latch);

        loop {
            let node = NodeRef::new(guard.data());
            if node.is_leaf() {
                break;
            }
            let child_id = InternalNodeRef::<K>::new(guard.data()).lookup(key);
            let child = self
                .bpm
                .fetch_page_read(child_id)?
                .ok_or(KeelError::BufferPoolFull)?;
            guard = child;
        }

        match LeafNodeRef::<K>::new(guard.data()).lookup(key) {
            Some(rid) => {
                result.push(rid);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Full-scan iterator from the leftmost leaf.
    pub fn iter(&self, txn: &Transaction) -> Result<IndexIterator<K>> {
        trace!("txn {} full scan", txn.id());
        self.scan_from(None)
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn iter_from(&self, key: K, txn: &Transaction) -> Result<IndexIterator<K>> {
        trace!("txn {} scan from {:?}", txn.id(), key);
        self.scan_from(Some(key))
    }

    fn scan_from(&self, key: Option<K>) -> Result<IndexIterator<K>> {
        let tree_latch = self.root.read();
        if *tree_latch == INVALID_PAGE_ID {
            return Ok(IndexIterator::empty(Arc::clone(&self.bpm)));
        }

        let mut guard = self
            .bpm
            .fetch_page_read(*tree_latch)?
            .ok_or(KeelError::BufferPoolFull)?;
        drop(tree_latch);

        loop {
            let node = NodeRef::new(guard.data());
            if node.is_leaf() {
                break;
            }
            let internal = InternalNodeRef::<K>::new(guard.data());
            let child_id = match key {
                Some(key) => internal.lookup(key),
                None => internal.first_child(),
            };
            let child = self
                .bpm
                .fetch_page_read(child_id)?
                .ok_or(KeelError::BufferPoolFull)?;
            guard = child;
        }

        let start = match key {
            Some(key) => LeafNodeRef::<K>::new(guard.data()).lower_bound(key),
            None => 0,
        };
        Ok(IndexIterator::new(Arc::clone(&self.bpm), guard, start))
    }

    /// Releases the latched ancestors once the node on top of the path is
    /// proven safe for the operation.
    fn release_if_safe(&self, ctx: &mut Context<'_>, op: Operation) {
        let safe = {
            let guard = ctx.path.last().unwrap();
            let node = NodeRef::new(guard.data());
            let max = if node.is_leaf() {
                self.leaf_max_size
            } else {
                self.internal_max_size
            };
            match op {
                Operation::Insert => node.size() < max,
                Operation::Delete => {
                    if ctx.at_root() {
                        node.size() > 1
                    } else {
                        node.size() > self.min_size(node.is_leaf())
                    }
                }
            }
        };
        if safe {
            ctx.release_ancestors();
        }
    }
}

#[derive(Clone, Copy)]
enum Operation {
    Insert,
    Delete,
}
