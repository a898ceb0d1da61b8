//! Write coalescing.
//!
//! Successive writes to the same key within the batch window collapse to the
//! latest value; every caller (including the oldest) still observes the
//! outcome of the flush that carried its key. A background task flushes when
//! the window elapses; hitting the batch-size threshold flushes immediately.
//! Explicit `flush()` and `destroy()` drain whatever is pending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::error::StorageError;

/// Destination of coalesced writes. Implemented by the storage core, which
/// also owns quota recovery.
#[async_trait]
pub trait WriteSink: Send + Sync + 'static {
    /// Persist the batch. Keys are unique within one call.
    async fn write_many(&self, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError>;
}

/// The coalescer was destroyed; no further writes are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerDestroyed;

type WaiterResult = Result<(), StorageError>;

struct PendingWrite {
    raw: Vec<u8>,
    waiters: Vec<oneshot::Sender<WaiterResult>>,
}

#[derive(Default)]
struct Pending {
    writes: HashMap<String, PendingWrite>,
    /// Insertion order of first appearance, so flushed batches stay FIFO.
    order: Vec<String>,
}

struct Inner {
    sink: Arc<dyn WriteSink>,
    pending: Mutex<Pending>,
    /// Wakes the flusher when the first write of a batch arrives.
    work: Notify,
    /// Forces an immediate flush (batch full, explicit flush, destroy).
    flush_now: Notify,
    window_ms: u64,
    max_batch: usize,
    destroyed: AtomicBool,
}

/// Collapses bursts of same-key writes into single backend operations.
pub struct WriteCoalescer {
    inner: Arc<Inner>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WriteCoalescer {
    /// Creates the coalescer and spawns its flush task.
    #[must_use]
    pub fn new(sink: Arc<dyn WriteSink>, window_ms: u64, max_batch: usize) -> Self {
        let inner = Arc::new(Inner {
            sink,
            pending: Mutex::new(Pending::default()),
            work: Notify::new(),
            flush_now: Notify::new(),
            window_ms: window_ms.max(1),
            max_batch: max_batch.max(1),
            destroyed: AtomicBool::new(false),
        });

        let task = tokio::spawn(run_flusher(inner.clone()));

        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queues a write. The returned receiver resolves when the flush carrying
    /// this key completes.
    ///
    /// # Errors
    ///
    /// Returns [`CoalescerDestroyed`] after `destroy()`.
    pub fn enqueue(
        &self,
        key: String,
        raw: Vec<u8>,
    ) -> Result<oneshot::Receiver<WaiterResult>, CoalescerDestroyed> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(CoalescerDestroyed);
        }

        let (tx, rx) = oneshot::channel();
        let batch_full;
        let first_in_batch;
        {
            let mut pending = self.inner.pending.lock();
            first_in_batch = pending.writes.is_empty();
            match pending.writes.get_mut(&key) {
                Some(write) => {
                    // Latest value wins; earlier waiters ride along.
                    write.raw = raw;
                    write.waiters.push(tx);
                }
                None => {
                    pending.order.push(key.clone());
                    pending.writes.insert(key, PendingWrite { raw, waiters: vec![tx] });
                }
            }
            batch_full = pending.writes.len() >= self.inner.max_batch;
        }

        if first_in_batch {
            self.inner.work.notify_one();
        }
        if batch_full {
            self.inner.flush_now.notify_one();
        }
        Ok(rx)
    }

    /// Number of distinct keys waiting to be flushed.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().writes.len()
    }

    /// The queued (not yet flushed) value for `key`, if any. Keeps reads
    /// coherent with writes that have not reached the backend yet.
    #[must_use]
    pub fn pending_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.pending.lock().writes.get(key).map(|w| w.raw.clone())
    }

    /// Flushes everything currently pending and waits for the backend.
    pub async fn flush(&self) {
        flush_once(&self.inner).await;
    }

    /// Flushes pending writes, then rejects all future ones.
    pub async fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        flush_once(&self.inner).await;
        self.inner.work.notify_one();
        self.inner.flush_now.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

async fn run_flusher(inner: Arc<Inner>) {
    loop {
        inner.work.notified().await;
        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
        loop {
            tokio::select! {
                () = inner.flush_now.notified() => {}
                () = tokio::time::sleep(Duration::from_millis(inner.window_ms)) => {}
            }
            flush_once(&inner).await;
            if inner.pending.lock().writes.is_empty() {
                break;
            }
        }
        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
    }
}

async fn flush_once(inner: &Inner) {
    let (writes, waiters) = {
        let mut pending = inner.pending.lock();
        let order = std::mem::take(&mut pending.order);
        let mut writes = Vec::with_capacity(order.len());
        let mut waiters = Vec::new();
        for key in order {
            if let Some(write) = pending.writes.remove(&key) {
                writes.push((key, write.raw));
                waiters.extend(write.waiters);
            }
        }
        (writes, waiters)
    };

    if writes.is_empty() {
        return;
    }

    debug!(batch = writes.len(), "flushing coalesced writes");
    let result = inner.sink.write_many(writes).await;
    match result {
        Ok(()) => {
            for tx in waiters {
                let _ = tx.send(Ok(()));
            }
        }
        Err(err) => {
            for tx in waiters {
                let _ = tx.send(Err(clone_storage_error(&err)));
            }
        }
    }
}

/// `StorageError` is not `Clone` (it can wrap `std::io::Error`); rebuild an
/// equivalent error for each waiter.
fn clone_storage_error(err: &StorageError) -> StorageError {
    match err {
        StorageError::QuotaExceeded => StorageError::QuotaExceeded,
        StorageError::BackendUnavailable { reason } => {
            StorageError::BackendUnavailable { reason: reason.clone() }
        }
        StorageError::Corrupted { key } => StorageError::Corrupted { key: key.clone() },
        other => StorageError::BackendUnavailable { reason: other.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as SyncMutex;

    use super::*;

    /// Sink that records every flushed batch.
    #[derive(Default)]
    struct RecordingSink {
        batches: SyncMutex<Vec<Vec<(String, Vec<u8>)>>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl WriteSink for RecordingSink {
        async fn write_many(&self, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::QuotaExceeded);
            }
            self.batches.lock().push(writes);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_writes_collapse_to_latest() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = WriteCoalescer::new(sink.clone(), 50, 100);

        let rx1 = coalescer.enqueue("k".into(), b"one".to_vec()).unwrap();
        let rx2 = coalescer.enqueue("k".into(), b"two".to_vec()).unwrap();
        let rx3 = coalescer.enqueue("k".into(), b"three".to_vec()).unwrap();

        // All three waiters resolve, including the oldest.
        rx1.await.unwrap().unwrap();
        rx2.await.unwrap().unwrap();
        rx3.await.unwrap().unwrap();

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![("k".to_string(), b"three".to_vec())]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_without_waiting_for_window() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = WriteCoalescer::new(sink.clone(), 60_000, 2);

        let rx_a = coalescer.enqueue("a".into(), vec![1]).unwrap();
        let rx_b = coalescer.enqueue("b".into(), vec![2]).unwrap();

        rx_a.await.unwrap().unwrap();
        rx_b.await.unwrap().unwrap();
        assert_eq!(sink.batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_raw_exposes_unflushed_value() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = WriteCoalescer::new(sink, 60_000, 100);

        let _rx = coalescer.enqueue("k".into(), b"v".to_vec()).unwrap();
        assert_eq!(coalescer.pending_raw("k"), Some(b"v".to_vec()));
        assert_eq!(coalescer.pending_raw("other"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_drains_pending() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = WriteCoalescer::new(sink.clone(), 60_000, 100);

        let rx = coalescer.enqueue("k".into(), vec![9]).unwrap();
        coalescer.flush().await;
        rx.await.unwrap().unwrap();

        assert_eq!(coalescer.pending_len(), 0);
        assert_eq!(sink.batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_propagates_to_all_waiters() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let coalescer = WriteCoalescer::new(sink, 10, 100);

        let rx1 = coalescer.enqueue("k".into(), vec![1]).unwrap();
        let rx2 = coalescer.enqueue("k".into(), vec![2]).unwrap();

        assert!(matches!(rx1.await.unwrap(), Err(StorageError::QuotaExceeded)));
        assert!(matches!(rx2.await.unwrap(), Err(StorageError::QuotaExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_flushes_then_rejects() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = WriteCoalescer::new(sink.clone(), 60_000, 100);

        let rx = coalescer.enqueue("k".into(), vec![1]).unwrap();
        coalescer.destroy().await;
        rx.await.unwrap().unwrap();
        assert_eq!(sink.batches.lock().len(), 1);

        assert_eq!(
            coalescer.enqueue("k".into(), vec![2]).unwrap_err(),
            CoalescerDestroyed
        );
    }
}
