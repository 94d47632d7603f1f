//! Integration tests for transaction commit and rollback across the table
//! heap and the index

use std::sync::Arc;

use keel::buffer::BufferPoolManager;
use keel::common::RecordId;
use keel::concurrency::{LockManager, TransactionManager, TransactionState};
use keel::index::{BTreeIndex, IndexMetadata};
use keel::storage::disk::DiskManager;
use keel::storage::table::TableHeap;
use tempfile::{tempdir, TempDir};

struct Fixture {
    txn_mgr: TransactionManager,
    heap: Arc<TableHeap>,
    index: Arc<BTreeIndex>,
    _dir: TempDir,
}

fn setup() -> Fixture {
    let dir = tempdir().unwrap();
    let dm = Arc::new(DiskManager::new(dir.path().join("txn.db")).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(64, dm));

    let index = Arc::new(
        BTreeIndex::new(
            IndexMetadata::new("accounts_pk", "accounts", vec![0]),
            Arc::clone(&bpm),
            16,
            16,
        )
        .unwrap(),
    );
    let heap = Arc::new(TableHeap::new(Arc::clone(&bpm)).unwrap());
    let txn_mgr = TransactionManager::new(Arc::new(LockManager::new()));

    Fixture {
        txn_mgr,
        heap,
        index,
        _dir: dir,
    }
}

fn row(key: i64, balance: i64) -> Vec<u8> {
    let mut data = Vec::with_capacity(16);
    data.extend_from_slice(&key.to_le_bytes());
    data.extend_from_slice(&balance.to_le_bytes());
    data
}

fn insert_row(f: &Fixture, txn: &Arc<keel::concurrency::Transaction>, key: i64, balance: i64) -> RecordId {
    let rid = f.heap.insert_tuple(&row(key, balance), txn).unwrap();
    assert!(f.index.insert_entry(key, rid, txn).unwrap());
    rid
}

#[test]
fn test_aborted_insert_leaves_no_trace() {
    let f = setup();

    let txn1 = f.txn_mgr.begin();
    for key in [200, 201, 202] {
        insert_row(&f, &txn1, key, key * 10);
    }
    f.txn_mgr.abort(&txn1).unwrap();
    assert_eq!(txn1.state(), TransactionState::Aborted);

    // neither the heap nor the index shows the rows
    let txn2 = f.txn_mgr.begin();
    assert_eq!(f.heap.iter().filter(|t| t.is_ok()).count(), 0);
    for key in [200, 201, 202] {
        let mut rids = Vec::new();
        assert!(!f.index.scan_key(key, &mut rids, &txn2).unwrap());
    }
    f.txn_mgr.commit(&txn2).unwrap();
}

#[test]
fn test_committed_insert_is_visible() {
    let f = setup();

    let txn1 = f.txn_mgr.begin();
    let rid = insert_row(&f, &txn1, 7, 700);
    f.txn_mgr.commit(&txn1).unwrap();

    let txn2 = f.txn_mgr.begin();
    let tuple = f.heap.get_tuple(rid, &txn2).unwrap();
    assert_eq!(tuple.key_at(0), Some(7));
    assert_eq!(tuple.key_at(8), Some(700));

    let mut rids = Vec::new();
    assert!(f.index.scan_key(7, &mut rids, &txn2).unwrap());
    assert_eq!(rids, vec![rid]);
    f.txn_mgr.commit(&txn2).unwrap();
}

#[test]
fn test_aborted_delete_resurrects_the_row() {
    let f = setup();

    let txn1 = f.txn_mgr.begin();
    let rid = insert_row(&f, &txn1, 42, 1000);
    f.txn_mgr.commit(&txn1).unwrap();

    let txn2 = f.txn_mgr.begin();
    assert!(f.heap.mark_delete(rid, &txn2).unwrap());
    f.index.delete_entry(42, rid, &txn2).unwrap();
    // the tombstone is already in effect for the deleter
    assert!(f.heap.get_tuple(rid, &txn2).is_err());
    f.txn_mgr.abort(&txn2).unwrap();

    let txn3 = f.txn_mgr.begin();
    let tuple = f.heap.get_tuple(rid, &txn3).unwrap();
    assert_eq!(tuple.key_at(8), Some(1000));
    let mut rids = Vec::new();
    assert!(f.index.scan_key(42, &mut rids, &txn3).unwrap());
    assert_eq!(rids, vec![rid]);
    f.txn_mgr.commit(&txn3).unwrap();
}

#[test]
fn test_committed_delete_removes_the_row() {
    let f = setup();

    let txn1 = f.txn_mgr.begin();
    let rid = insert_row(&f, &txn1, 42, 1000);
    f.txn_mgr.commit(&txn1).unwrap();

    let txn2 = f.txn_mgr.begin();
    assert!(f.heap.mark_delete(rid, &txn2).unwrap());
    f.index.delete_entry(42, rid, &txn2).unwrap();
    f.txn_mgr.commit(&txn2).unwrap();

    let txn3 = f.txn_mgr.begin();
    assert!(f.heap.get_tuple(rid, &txn3).is_err());
    assert!(!f.index.scan_key(42, &mut Vec::new(), &txn3).unwrap());
    f.txn_mgr.commit(&txn3).unwrap();
}

#[test]
fn test_aborted_update_restores_old_image() {
    let f = setup();

    let txn1 = f.txn_mgr.begin();
    let rid = insert_row(&f, &txn1, 200, 1000);
    f.txn_mgr.commit(&txn1).unwrap();

    let txn2 = f.txn_mgr.begin();
    assert!(f.heap.update_tuple(rid, &row(200, 750), &txn2).unwrap());
    assert_eq!(f.heap.get_tuple(rid, &txn2).unwrap().key_at(8), Some(750));
    f.txn_mgr.abort(&txn2).unwrap();

    let txn3 = f.txn_mgr.begin();
    assert_eq!(f.heap.get_tuple(rid, &txn3).unwrap().key_at(8), Some(1000));
    f.txn_mgr.commit(&txn3).unwrap();
}

#[test]
fn test_abort_undoes_in_reverse_order() {
    let f = setup();

    // committed baseline
    let txn1 = f.txn_mgr.begin();
    let rid = insert_row(&f, &txn1, 1, 100);
    f.txn_mgr.commit(&txn1).unwrap();

    // one transaction updates the row twice, then deletes it
    let txn2 = f.txn_mgr.begin();
    assert!(f.heap.update_tuple(rid, &row(1, 200), &txn2).unwrap());
    assert!(f.heap.update_tuple(rid, &row(1, 300), &txn2).unwrap());
    assert!(f.heap.mark_delete(rid, &txn2).unwrap());
    f.txn_mgr.abort(&txn2).unwrap();

    // rollback must land on the original image, not an intermediate one
    let txn3 = f.txn_mgr.begin();
    assert_eq!(f.heap.get_tuple(rid, &txn3).unwrap().key_at(8), Some(100));
    f.txn_mgr.commit(&txn3).unwrap();
}

#[test]
fn test_scan_sees_only_surviving_rows() {
    let f = setup();

    let txn1 = f.txn_mgr.begin();
    let keep = insert_row(&f, &txn1, 1, 10);
    let doomed = insert_row(&f, &txn1, 2, 20);
    f.txn_mgr.commit(&txn1).unwrap();

    let txn2 = f.txn_mgr.begin();
    assert!(f.heap.mark_delete(doomed, &txn2).unwrap());
    f.index.delete_entry(2, doomed, &txn2).unwrap();
    f.txn_mgr.commit(&txn2).unwrap();

    let txn3 = f.txn_mgr.begin();
    let tuples: Vec<_> = f.heap.iter().map(|t| t.unwrap()).collect();
    assert_eq!(tuples.len(), 1);
    assert_eq!(tuples[0].rid(), Some(keep));

    let keys: Vec<i64> = f
        .index
        .scan_all(&txn3)
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(keys, vec![1]);
    f.txn_mgr.commit(&txn3).unwrap();
}
