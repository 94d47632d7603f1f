//! Integration tests for the disk manager

use keel::common::{PageId, PAGE_SIZE};
use keel::storage::disk::DiskManager;
use tempfile::tempdir;

#[test]
fn test_creates_db_and_log_files() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let _dm = DiskManager::new(&db_path).unwrap();

    assert!(db_path.exists());
    assert!(temp_dir.path().join("test.db.log").exists());
}

#[test]
fn test_page_ids_are_dense() {
    let temp_dir = tempdir().unwrap();
    let dm = DiskManager::new(temp_dir.path().join("dense.db")).unwrap();

    let ids: Vec<u32> = (0..8).map(|_| dm.allocate_page().as_u32()).collect();
    assert_eq!(ids, (0..8).collect::<Vec<_>>());
}

#[test]
fn test_write_read_cycle() {
    let temp_dir = tempdir().unwrap();
    let dm = DiskManager::new(temp_dir.path().join("rw.db")).unwrap();

    let page_id = dm.allocate_page();
    let mut buf = [0u8; PAGE_SIZE];
    buf[0] = 0xDE;
    buf[PAGE_SIZE / 2] = 0x00;
    buf[PAGE_SIZE - 1] = 0xEF;
    dm.write_page(page_id, &buf).unwrap();

    let mut read_buf = [0xAAu8; PAGE_SIZE];
    dm.read_page(page_id, &mut read_buf).unwrap();
    assert_eq!(&read_buf[..], &buf[..]);
}

#[test]
fn test_short_read_zero_fills() {
    let temp_dir = tempdir().unwrap();
    let dm = DiskManager::new(temp_dir.path().join("short.db")).unwrap();

    // nothing written yet: any page reads as zeroes
    let mut buf = [0x55u8; PAGE_SIZE];
    dm.read_page(PageId::new(3), &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn test_reopen_resumes_allocation() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("resume.db");

    {
        let dm = DiskManager::new(&db_path).unwrap();
        for _ in 0..3 {
            let page_id = dm.allocate_page();
            dm.write_page(page_id, &[7u8; PAGE_SIZE]).unwrap();
        }
    }

    let dm = DiskManager::new(&db_path).unwrap();
    assert_eq!(dm.num_pages(), 3);
    assert_eq!(dm.allocate_page(), PageId::new(3));
}

#[test]
fn test_shutdown_stops_io() {
    let temp_dir = tempdir().unwrap();
    let dm = DiskManager::new(temp_dir.path().join("down.db")).unwrap();

    let page_id = dm.allocate_page();
    dm.write_page(page_id, &[1u8; PAGE_SIZE]).unwrap();
    dm.shut_down().unwrap();

    let mut buf = [0u8; PAGE_SIZE];
    assert!(dm.read_page(page_id, &mut buf).is_err());
    assert!(dm.write_page(page_id, &buf).is_err());
}
