use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::{AbortReason, CycleDetectionInterval, KeelError, RecordId, Result, TxnId};

use super::{IsolationLevel, Transaction, TransactionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
    /// Kept so the deadlock detector can abort the owner from its thread
    txn: Arc<Transaction>,
}

impl LockRequest {
    fn new(txn: &Arc<Transaction>, mode: LockMode) -> Self {
        Self {
            txn_id: txn.id(),
            mode,
            granted: false,
            txn: Arc::clone(txn),
        }
    }
}

#[derive(Default)]
struct LockRequestQueue {
    /// FIFO arrival order; grants may overtake per the isolation rules
    requests: Vec<LockRequest>,
    /// At most one transaction may be upgrading S -> X on a RID
    upgrading: Option<TxnId>,
}

struct RidLock {
    queue: Mutex<LockRequestQueue>,
    cv: Condvar,
}

struct LmState {
    /// Coarse map mutex, held only to locate or create a queue
    table: Mutex<HashMap<RecordId, Arc<RidLock>>>,
    /// Edges injected through the testing API, unioned with the lock-table
    /// snapshot during cycle search
    waits_for: Mutex<BTreeMap<TxnId, BTreeSet<TxnId>>>,
}

/// Row-granularity lock manager implementing two-phase locking with shared
/// and exclusive modes, lock upgrades, and background deadlock detection.
///
/// Grant rules: an exclusive lock needs the queue to itself; a shared lock
/// is blocked by any granted exclusive and, outside READ_COMMITTED, by any
/// exclusive request ahead of it in the queue (so writers cannot starve).
/// A READ_COMMITTED reader overtakes pending writers.
///
/// State-machine violations abort the calling transaction: the call returns
/// `KeelError::TransactionAborted` and the transaction is left in the
/// Aborted state for the caller to observe. The owner must still run the
/// transaction manager's abort to undo writes and drop locks.
pub struct LockManager {
    state: Arc<LmState>,
    shutdown: Arc<AtomicBool>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    pub fn new() -> Self {
        let state = Arc::new(LmState {
            table: Mutex::new(HashMap::new()),
            waits_for: Mutex::new(BTreeMap::new()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let state_clone = Arc::clone(&state);
        let shutdown_clone = Arc::clone(&shutdown);
        let detector = thread::spawn(move || {
            while !shutdown_clone.load(Ordering::Relaxed) {
                thread::sleep(CycleDetectionInterval::get());
                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }
                Self::run_detection(&state_clone);
            }
        });

        Self {
            state,
            shutdown,
            detector: Some(detector),
        }
    }

    fn entry(&self, rid: RecordId) -> Arc<RidLock> {
        let mut table = self.state.table.lock();
        Arc::clone(table.entry(rid).or_insert_with(|| {
            Arc::new(RidLock {
                queue: Mutex::new(LockRequestQueue::default()),
                cv: Condvar::new(),
            })
        }))
    }

    fn abort(&self, txn: &Transaction, reason: AbortReason) -> Result<bool> {
        txn.set_state(TransactionState::Aborted);
        warn!("txn {} aborted: {:?}", txn.id(), reason);
        Err(KeelError::TransactionAborted {
            txn_id: txn.id(),
            reason,
        })
    }

    fn aborted_while_waiting(txn: &Transaction) -> KeelError {
        KeelError::TransactionAborted {
            txn_id: txn.id(),
            reason: AbortReason::Deadlock,
        }
    }

    /// Acquires a shared lock, blocking until grantable. Aborts the
    /// transaction under READ_UNCOMMITTED or when REPEATABLE_READ has begun
    /// shrinking.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: RecordId) -> Result<bool> {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return self.abort(txn, AbortReason::LockSharedOnReadUncommitted);
        }
        if txn.state() == TransactionState::Shrinking
            && txn.isolation_level() == IsolationLevel::RepeatableRead
        {
            return self.abort(txn, AbortReason::LockOnShrinking);
        }
        if txn.state() == TransactionState::Aborted {
            return Err(Self::aborted_while_waiting(txn));
        }
        if txn.holds_shared(rid) || txn.holds_exclusive(rid) {
            return Ok(true);
        }

        let entry = self.entry(rid);
        let mut queue = entry.queue.lock();
        queue.requests.push(LockRequest::new(txn, LockMode::Shared));

        loop {
            if txn.state() == TransactionState::Aborted {
                queue
                    .requests
                    .retain(|r| !(r.txn_id == txn.id() && !r.granted));
                entry.cv.notify_all();
                return Err(Self::aborted_while_waiting(txn));
            }
            if Self::can_grant_shared(&queue, txn.id(), txn.isolation_level()) {
                Self::grant(&mut queue, txn.id());
                txn.add_shared_lock(rid);
                debug!("txn {} S-locked {}", txn.id(), rid);
                return Ok(true);
            }
            entry.cv.wait(&mut queue);
        }
    }

    /// Acquires an exclusive lock, blocking until the queue is clear. A
    /// transaction already holding the shared lock is routed through
    /// `lock_upgrade`.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: RecordId) -> Result<bool> {
        if txn.state() == TransactionState::Shrinking {
            return self.abort(txn, AbortReason::LockOnShrinking);
        }
        if txn.state() == TransactionState::Aborted {
            return Err(Self::aborted_while_waiting(txn));
        }
        if txn.holds_exclusive(rid) {
            return Ok(true);
        }
        if txn.holds_shared(rid) {
            return self.lock_upgrade(txn, rid);
        }

        let entry = self.entry(rid);
        let mut queue = entry.queue.lock();
        queue.requests.push(LockRequest::new(txn, LockMode::Exclusive));

        loop {
            if txn.state() == TransactionState::Aborted {
                queue
                    .requests
                    .retain(|r| !(r.txn_id == txn.id() && !r.granted));
                entry.cv.notify_all();
                return Err(Self::aborted_while_waiting(txn));
            }
            if Self::can_grant_exclusive(&queue, txn.id()) {
                Self::grant(&mut queue, txn.id());
                txn.add_exclusive_lock(rid);
                debug!("txn {} X-locked {}", txn.id(), rid);
                return Ok(true);
            }
            entry.cv.wait(&mut queue);
        }
    }

    /// Upgrades a held shared lock to exclusive. At most one transaction may
    /// upgrade per RID; a second concurrent upgrader is aborted.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: RecordId) -> Result<bool> {
        if txn.state() == TransactionState::Shrinking
            && txn.isolation_level() == IsolationLevel::RepeatableRead
        {
            return self.abort(txn, AbortReason::LockOnShrinking);
        }
        if txn.holds_exclusive(rid) {
            return Ok(true);
        }
        if !txn.holds_shared(rid) {
            return self.abort(txn, AbortReason::UpgradeConflict);
        }

        let entry = self.entry(rid);
        let mut queue = entry.queue.lock();
        if queue.upgrading.is_some() {
            return self.abort(txn, AbortReason::UpgradeConflict);
        }
        queue.upgrading = Some(txn.id());

        loop {
            if txn.state() == TransactionState::Aborted {
                queue.upgrading = None;
                entry.cv.notify_all();
                return Err(Self::aborted_while_waiting(txn));
            }
            let sole_holder = queue
                .requests
                .iter()
                .filter(|r| r.granted)
                .all(|r| r.txn_id == txn.id());
            if sole_holder {
                let request = queue
                    .requests
                    .iter_mut()
                    .find(|r| r.txn_id == txn.id() && r.granted)
                    .expect("upgrader holds a granted shared request");
                request.mode = LockMode::Exclusive;
                queue.upgrading = None;
                txn.remove_shared_lock(rid);
                txn.add_exclusive_lock(rid);
                debug!("txn {} upgraded lock on {}", txn.id(), rid);
                return Ok(true);
            }
            entry.cv.wait(&mut queue);
        }
    }

    /// Releases a held lock and applies the 2PL phase transition for the
    /// transaction's isolation level. Releasing a lock that is not held
    /// aborts the transaction.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: RecordId) -> Result<bool> {
        let held_shared = txn.holds_shared(rid);
        let held_exclusive = txn.holds_exclusive(rid);
        if !held_shared && !held_exclusive {
            return self.abort(txn, AbortReason::UnlockOnNonHeld);
        }

        if txn.state() == TransactionState::Growing {
            match txn.isolation_level() {
                IsolationLevel::RepeatableRead => txn.set_state(TransactionState::Shrinking),
                IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                    // shared locks come and go freely; only an exclusive
                    // release ends the growing phase
                    if held_exclusive {
                        txn.set_state(TransactionState::Shrinking);
                    }
                }
            }
        }

        self.remove_requests(txn, rid);
        debug!("txn {} unlocked {}", txn.id(), rid);
        Ok(true)
    }

    /// Drops every lock the transaction still holds, without phase
    /// transitions. Used by commit and abort.
    pub(crate) fn release_locks(&self, txn: &Arc<Transaction>) {
        for rid in txn.locked_rids() {
            self.remove_requests(txn, rid);
        }
    }

    fn remove_requests(&self, txn: &Arc<Transaction>, rid: RecordId) {
        let entry = {
            let table = self.state.table.lock();
            table.get(&rid).cloned()
        };
        if let Some(entry) = entry {
            let mut queue = entry.queue.lock();
            queue.requests.retain(|r| r.txn_id != txn.id());
            if queue.upgrading == Some(txn.id()) {
                queue.upgrading = None;
            }
            entry.cv.notify_all();
        }
        txn.remove_shared_lock(rid);
        txn.remove_exclusive_lock(rid);
    }

    fn grant(queue: &mut LockRequestQueue, txn_id: TxnId) {
        let request = queue
            .requests
            .iter_mut()
            .find(|r| r.txn_id == txn_id && !r.granted)
            .expect("waiting request present");
        request.granted = true;
    }

    fn can_grant_shared(queue: &LockRequestQueue, txn_id: TxnId, isolation: IsolationLevel) -> bool {
        if queue.upgrading.is_some() && queue.upgrading != Some(txn_id) {
            return false;
        }
        let my_index = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn_id && !r.granted)
            .expect("waiting request present");

        for (index, request) in queue.requests.iter().enumerate() {
            if request.txn_id == txn_id || request.mode == LockMode::Shared {
                continue;
            }
            if request.granted {
                return false;
            }
            // a pending writer ahead of us blocks new readers, except under
            // READ_COMMITTED where late readers overtake
            if isolation != IsolationLevel::ReadCommitted && index < my_index {
                return false;
            }
        }
        true
    }

    fn can_grant_exclusive(queue: &LockRequestQueue, txn_id: TxnId) -> bool {
        if queue.upgrading.is_some() {
            return false;
        }
        let my_index = queue
            .requests
            .iter()
            .position(|r| r.txn_id == txn_id && !r.granted)
            .expect("waiting request present");

        for (index, request) in queue.requests.iter().enumerate() {
            if request.txn_id == txn_id {
                continue;
            }
            if request.granted || index < my_index {
                return false;
            }
        }
        true
    }

    // ---- wait-for graph ----

    pub fn add_edge(&self, from: TxnId, to: TxnId) {
        self.state
            .waits_for
            .lock()
            .entry(from)
            .or_default()
            .insert(to);
    }

    pub fn remove_edge(&self, from: TxnId, to: TxnId) {
        let mut waits_for = self.state.waits_for.lock();
        if let Some(targets) = waits_for.get_mut(&from) {
            targets.remove(&to);
            if targets.is_empty() {
                waits_for.remove(&from);
            }
        }
    }

    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        self.state
            .waits_for
            .lock()
            .iter()
            .flat_map(|(&from, targets)| targets.iter().map(move |&to| (from, to)))
            .collect()
    }

    /// Searches the current wait-for graph (manual edges unioned with a
    /// lock-table snapshot) and returns the youngest member of a cycle.
    pub fn has_cycle(&self) -> Option<TxnId> {
        let (graph, _, _) = Self::build_graph(&self.state);
        Self::find_cycle(&graph).map(|cycle| cycle.into_iter().max().unwrap())
    }

    /// Wait-for edges derived from the lock table: one edge per waiting
    /// request toward each holder it waits on, plus upgrader edges.
    #[allow(clippy::type_complexity)]
    fn build_graph(
        state: &LmState,
    ) -> (
        BTreeMap<TxnId, BTreeSet<TxnId>>,
        HashMap<TxnId, Arc<Transaction>>,
        HashMap<TxnId, Vec<Arc<RidLock>>>,
    ) {
        let mut graph = state.waits_for.lock().clone();
        let mut txns: HashMap<TxnId, Arc<Transaction>> = HashMap::new();
        let mut wait_queues: HashMap<TxnId, Vec<Arc<RidLock>>> = HashMap::new();

        let entries: Vec<Arc<RidLock>> = state.table.lock().values().cloned().collect();
        for entry in entries {
            let queue = entry.queue.lock();
            let holders: Vec<TxnId> = queue
                .requests
                .iter()
                .filter(|r| r.granted)
                .map(|r| r.txn_id)
                .collect();

            for request in &queue.requests {
                txns.insert(request.txn_id, Arc::clone(&request.txn));
                let waiting_as_upgrader = queue.upgrading == Some(request.txn_id);
                if request.granted && !waiting_as_upgrader {
                    continue;
                }
                wait_queues
                    .entry(request.txn_id)
                    .or_default()
                    .push(Arc::clone(&entry));
                for &holder in &holders {
                    if holder != request.txn_id {
                        graph.entry(request.txn_id).or_default().insert(holder);
                    }
                }
            }
        }

        (graph, txns, wait_queues)
    }

    /// Deterministic cycle search: transactions are visited in ascending id
    /// order, neighbours likewise.
    fn find_cycle(graph: &BTreeMap<TxnId, BTreeSet<TxnId>>) -> Option<Vec<TxnId>> {
        let mut finished: BTreeSet<TxnId> = BTreeSet::new();
        for &start in graph.keys() {
            if finished.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if let Some(cycle) = Self::dfs(start, graph, &mut finished, &mut path, &mut on_path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs(
        node: TxnId,
        graph: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        finished: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        path.push(node);
        on_path.insert(node);

        if let Some(neighbours) = graph.get(&node) {
            for &next in neighbours {
                if on_path.contains(&next) {
                    let start = path.iter().position(|&n| n == next).unwrap();
                    return Some(path[start..].to_vec());
                }
                if finished.contains(&next) {
                    continue;
                }
                if let Some(cycle) = Self::dfs(next, graph, finished, path, on_path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_path.remove(&node);
        finished.insert(node);
        None
    }

    /// One detector pass: snapshot the graph, abort the youngest transaction
    /// of every cycle, wake its waiting threads, repeat until acyclic.
    fn run_detection(state: &LmState) {
        let (mut graph, txns, wait_queues) = Self::build_graph(state);

        while let Some(cycle) = Self::find_cycle(&graph) {
            let victim = cycle.into_iter().max().unwrap();
            debug!("deadlock detected, aborting txn {}", victim);

            if let Some(txn) = txns.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            if let Some(entries) = wait_queues.get(&victim) {
                for entry in entries {
                    let _queue = entry.queue.lock();
                    entry.cv.notify_all();
                }
            }

            graph.remove(&victim);
            for targets in graph.values_mut() {
                targets.remove(&victim);
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PageId, SlotId};

    fn rid(page: u32, slot: u16) -> RecordId {
        RecordId::new(PageId::new(page), SlotId::new(slot))
    }

    #[test]
    fn test_edge_list_round_trip() {
        let lock_mgr = LockManager::new();

        lock_mgr.add_edge(0, 1);
        lock_mgr.add_edge(2, 3);
        assert_eq!(lock_mgr.edge_list().len(), 2);

        lock_mgr.remove_edge(0, 1);
        assert_eq!(lock_mgr.edge_list(), vec![(2, 3)]);
    }

    #[test]
    fn test_cycle_victim_is_youngest() {
        let lock_mgr = LockManager::new();

        lock_mgr.add_edge(0, 1);
        lock_mgr.add_edge(1, 0);
        assert_eq!(lock_mgr.has_cycle(), Some(1));

        lock_mgr.remove_edge(1, 0);
        assert_eq!(lock_mgr.has_cycle(), None);
    }

    #[test]
    fn test_shared_then_exclusive_same_txn_upgrades() {
        let lock_mgr = LockManager::new();
        let txn = Arc::new(Transaction::new(0, IsolationLevel::RepeatableRead));
        let rid = rid(0, 0);

        assert!(lock_mgr.lock_shared(&txn, rid).unwrap());
        assert!(lock_mgr.lock_exclusive(&txn, rid).unwrap());
        assert_eq!(txn.shared_lock_count(), 0);
        assert_eq!(txn.exclusive_lock_count(), 1);
    }

    #[test]
    fn test_unlock_non_held_aborts() {
        let lock_mgr = LockManager::new();
        let txn = Arc::new(Transaction::new(0, IsolationLevel::RepeatableRead));

        let result = lock_mgr.unlock(&txn, rid(0, 0));
        assert!(matches!(
            result,
            Err(KeelError::TransactionAborted {
                reason: AbortReason::UnlockOnNonHeld,
                ..
            })
        ));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }
}
