use std::sync::Arc;

use keel::buffer::BufferPoolManager;
use keel::common::{DEFAULT_INTERNAL_MAX_SIZE, DEFAULT_LEAF_MAX_SIZE};
use keel::concurrency::{LockManager, TransactionManager};
use keel::index::BPlusTree;
use keel::storage::disk::DiskManager;
use keel::storage::table::TableHeap;

fn main() {
    env_logger::init();

    println!("Keel - storage and concurrency core");
    println!("===================================\n");

    let db_path = "demo.db";

    let disk_manager = Arc::new(DiskManager::new(db_path).expect("Failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    let bpm = Arc::new(BufferPoolManager::new(64, Arc::clone(&disk_manager)));
    println!("Created buffer pool manager with 64 frames");

    let lock_manager = Arc::new(LockManager::new());
    let txn_mgr = TransactionManager::new(Arc::clone(&lock_manager));

    // An index shares the pool with the table heap
    let tree: BPlusTree<i64> = BPlusTree::new(
        "demo_index",
        Arc::clone(&bpm),
        DEFAULT_LEAF_MAX_SIZE,
        DEFAULT_INTERNAL_MAX_SIZE,
    )
    .expect("Failed to create index");
    let heap = Arc::new(TableHeap::new(Arc::clone(&bpm)).expect("Failed to create table heap"));

    let txn = txn_mgr.begin();
    println!("\nBegan transaction {}", txn.id());

    let rows: [&[u8]; 3] = [b"first row", b"second row", b"third row"];
    for (i, row) in rows.iter().enumerate() {
        let rid = heap.insert_tuple(row, &txn).expect("insert failed");
        tree.insert(i as i64, rid, &txn).expect("index insert failed");
        println!("Inserted tuple {:?} at {}", String::from_utf8_lossy(row), rid);
    }

    let mut rids = Vec::new();
    tree.get_value(1, &mut rids, &txn).expect("lookup failed");
    let tuple = heap.get_tuple(rids[0], &txn).expect("fetch failed");
    println!(
        "\nIndex lookup for key 1 found {:?} at {}",
        String::from_utf8_lossy(tuple.data()),
        rids[0]
    );

    println!("\nScanning the index:");
    for entry in tree.iter(&txn).expect("scan failed") {
        let (key, rid) = entry.expect("scan entry failed");
        println!("  key {} -> {}", key, rid);
    }

    txn_mgr.commit(&txn).expect("commit failed");
    println!("\nCommitted transaction {}", txn.id());

    bpm.flush_all_pages().expect("flush failed");
    disk_manager.shut_down().expect("shutdown failed");

    std::fs::remove_file(db_path).ok();
    std::fs::remove_file(format!("{}.log", db_path)).ok();
    println!("Demo completed successfully!");
}
