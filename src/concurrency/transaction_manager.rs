use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::{Result, TxnId};

use super::{
    IsolationLevel, LockManager, Transaction, TransactionState, WriteOp,
};

/// Creates transactions and drives their lifecycle.
///
/// Commit applies the deferred deletes accumulated in the write set and
/// releases locks. Abort replays the write set backwards - deleting inserted
/// tuples, restoring updated ones, resurrecting deleted ones, and reversing
/// index entries - and only then releases locks, so rolled-back values stay
/// invisible to other transactions throughout.
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    next_txn_id: AtomicU32,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            next_txn_id: AtomicU32::new(0),
            txn_map: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a REPEATABLE_READ transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        self.begin_with_isolation(IsolationLevel::RepeatableRead)
    }

    pub fn begin_with_isolation(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.txn_map.lock().insert(id, Arc::clone(&txn));
        debug!("txn {} began ({:?})", id, isolation_level);
        txn
    }

    pub fn get_transaction(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().get(&id).cloned()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Makes the transaction's writes final and releases its locks.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        // tombstoned tuples become free slots now
        for record in txn.take_table_writes() {
            if record.op == WriteOp::Delete {
                record.table.apply_delete(record.rid)?;
            }
        }
        txn.take_index_writes();

        self.lock_manager.release_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.txn_map.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Undoes every write in reverse order, then releases locks.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        for record in txn.take_table_writes().into_iter().rev() {
            match record.op {
                WriteOp::Insert => record.table.apply_delete(record.rid)?,
                WriteOp::Delete => record.table.rollback_delete(record.rid)?,
                WriteOp::Update => {
                    let old_tuple = record
                        .old_tuple
                        .as_ref()
                        .expect("update record carries its pre-image");
                    record.table.restore_tuple(record.rid, old_tuple)?;
                }
            }
        }

        for record in txn.take_index_writes().into_iter().rev() {
            match record.op {
                WriteOp::Insert => record.index.undo_insert(record.key, txn)?,
                WriteOp::Delete => record.index.undo_delete(record.key, record.rid, txn)?,
                WriteOp::Update => {}
            }
        }

        self.lock_manager.release_locks(txn);
        txn.set_state(TransactionState::Aborted);
        self.txn_map.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_ids_are_dense() {
        let tm = TransactionManager::new(Arc::new(LockManager::new()));
        for expected in 0..5 {
            assert_eq!(tm.begin().id(), expected);
        }
    }

    #[test]
    fn test_commit_transitions_state() {
        let tm = TransactionManager::new(Arc::new(LockManager::new()));
        let txn = tm.begin();

        tm.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(tm.get_transaction(txn.id()).is_none());
    }
}
