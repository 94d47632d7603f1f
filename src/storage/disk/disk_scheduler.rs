use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::common::{KeelError, PageId, Result, PAGE_SIZE};

use super::DiskManager;

type PageBuf = Box<[u8; PAGE_SIZE]>;

/// A disk I/O request handed to the worker thread. Buffers are owned by the
/// message: writes carry the page image in, reads carry it back out through
/// the completion channel.
enum DiskRequest {
    Read {
        page_id: PageId,
        done: Sender<Result<PageBuf>>,
    },
    Write {
        page_id: PageId,
        data: PageBuf,
        done: Sender<Result<()>>,
    },
}

/// DiskScheduler funnels page I/O through a single background worker fed
/// from a bounded queue. The buffer pool issues synchronous requests and
/// blocks on the per-request completion channel.
pub struct DiskScheduler {
    disk_manager: Arc<DiskManager>,
    request_sender: Sender<DiskRequest>,
    shutdown: Arc<AtomicBool>,
    worker_handle: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Creates the scheduler and spawns its worker thread.
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = bounded::<DiskRequest>(128);
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_dm = Arc::clone(&disk_manager);
        let worker_shutdown = Arc::clone(&shutdown);
        let worker_handle = thread::spawn(move || {
            Self::worker_loop(worker_dm, receiver, worker_shutdown);
        });

        Self {
            disk_manager,
            request_sender: sender,
            shutdown,
            worker_handle: Some(worker_handle),
        }
    }

    /// Reads a page through the worker, blocking until it completes.
    pub fn schedule_read_sync(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (done, result) = bounded(1);
        self.submit(DiskRequest::Read { page_id, done })?;

        let buf = Self::completion(page_id, result.recv())??;
        data.copy_from_slice(&buf[..]);
        Ok(())
    }

    /// Writes a page through the worker, blocking until it completes.
    pub fn schedule_write_sync(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let mut buf: PageBuf = Box::new([0u8; PAGE_SIZE]);
        buf.copy_from_slice(data);

        let (done, result) = bounded(1);
        self.submit(DiskRequest::Write {
            page_id,
            data: buf,
            done,
        })?;

        Self::completion(page_id, result.recv())?
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    fn submit(&self, request: DiskRequest) -> Result<()> {
        self.request_sender
            .send(request)
            .map_err(|_| KeelError::DiskScheduler("worker queue closed".to_string()))
    }

    fn completion<T>(
        page_id: PageId,
        received: std::result::Result<T, crossbeam_channel::RecvError>,
    ) -> Result<T> {
        received.map_err(|_| {
            KeelError::DiskScheduler(format!("worker dropped request for {}", page_id))
        })
    }

    /// Drains the queue until shutdown is signalled, then finishes whatever
    /// is still enqueued so no caller is left waiting.
    fn worker_loop(
        disk_manager: Arc<DiskManager>,
        receiver: Receiver<DiskRequest>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                while let Ok(request) = receiver.try_recv() {
                    Self::serve(&disk_manager, request);
                }
                return;
            }
            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => Self::serve(&disk_manager, request),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn serve(disk_manager: &DiskManager, request: DiskRequest) {
        match request {
            DiskRequest::Read { page_id, done } => {
                let mut buf: PageBuf = Box::new([0u8; PAGE_SIZE]);
                let outcome = disk_manager
                    .read_page(page_id, &mut buf[..])
                    .map(move |_| buf);
                let _ = done.send(outcome);
            }
            DiskRequest::Write {
                page_id,
                data,
                done,
            } => {
                let _ = done.send(disk_manager.write_page(page_id, &data[..]));
            }
        }
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}
