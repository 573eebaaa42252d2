//! Pooled, reference-counted byte buffers with independent reader and writer views.
//!
//! A [`BufferPool`] amortizes allocation of transient I/O buffers across a high-traffic
//! server. Buffers are handed out as [`Buffer`] handles; [`Buffer::reader`] and
//! [`Buffer::writer`] produce additional handles onto the same underlying storage, each
//! holding a share of the buffer's reference count. When the last handle referencing a
//! buffer is dropped, its storage is reset (cursors and length zeroed, bytes left as-is)
//! and returned to the pool's free list.
//!
//! Reference counting is provided by `Arc` rather than hand-rolled atomics: an `Arc` clone
//! *is* a cheap, lock-free increment of a shared count, which is exactly what the pooled
//! handle design calls for.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace};

/// Errors returned by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is bounded and at capacity; no buffer could be acquired.
    #[error("buffer pool exhausted")]
    ResourceExhausted,
}

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Capacity new buffers are allocated with.
    pub default_capacity: usize,
    /// Maximum number of buffers live at once. `None` means unbounded.
    pub capacity: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            default_capacity: 4096,
            capacity: None,
        }
    }
}

struct PoolInner {
    free_vecs: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    permits: Option<(Sender<()>, Receiver<()>)>,
    default_capacity: usize,
    in_use: AtomicUsize,
}

/// A pool of reusable byte buffers.
///
/// Cloning a `BufferPool` is cheap; all clones share the same free list and permit budget.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a new pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        let permits = config.capacity.map(|cap| {
            let (tx, rx) = bounded(cap);
            for _ in 0..cap {
                let _ = tx.send(());
            }
            (tx, rx)
        });

        BufferPool {
            inner: Arc::new(PoolInner {
                free_vecs: unbounded(),
                permits,
                default_capacity: config.default_capacity,
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquires a buffer, blocking if the pool is bounded and exhausted.
    pub fn acquire(&self) -> Buffer {
        if let Some((_, rx)) = &self.inner.permits {
            let _ = rx.recv();
        }
        self.acquire_unchecked()
    }

    /// Acquires a buffer, blocking for at most `timeout` if the pool is bounded and exhausted.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Buffer, PoolError> {
        if let Some((_, rx)) = &self.inner.permits {
            match rx.recv_timeout(timeout) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => return Err(PoolError::ResourceExhausted),
                Err(RecvTimeoutError::Disconnected) => return Err(PoolError::ResourceExhausted),
            }
        }
        Ok(self.acquire_unchecked())
    }

    /// Acquires a buffer without blocking, failing immediately if the pool is exhausted.
    pub fn try_acquire(&self) -> Result<Buffer, PoolError> {
        if let Some((_, rx)) = &self.inner.permits {
            rx.try_recv().map_err(|_| PoolError::ResourceExhausted)?;
        }
        Ok(self.acquire_unchecked())
    }

    fn acquire_unchecked(&self) -> Buffer {
        let storage = self
            .inner
            .free_vecs
            .1
            .try_recv()
            .unwrap_or_else(|_| Vec::with_capacity(self.inner.default_capacity));

        self.inner.in_use.fetch_add(1, Ordering::Relaxed);
        trace!("buffer acquired, live={}", self.inner.in_use.load(Ordering::Relaxed));

        Buffer {
            data: Arc::new(BufferData {
                storage: RwLock::new(storage),
                committed_len: AtomicUsize::new(0),
                shared: AtomicUsize::new(0),
                pool: self.inner.clone(),
            }),
        }
    }

    /// Number of buffers currently checked out of the pool.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }
}

impl PoolInner {
    fn recycle(&self, mut storage: Vec<u8>) {
        storage.clear();
        let _ = self.free_vecs.0.send(storage);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        if let Some((tx, _)) = &self.permits {
            let _ = tx.send(());
        }
        debug!("buffer returned to pool");
    }
}

const SHARED_FLAG: usize = 1;

struct BufferData {
    storage: RwLock<Vec<u8>>,
    /// Highest write position readers on a shared buffer are allowed to observe.
    committed_len: AtomicUsize,
    shared: AtomicUsize,
    pool: Arc<PoolInner>,
}

impl Drop for BufferData {
    fn drop(&mut self) {
        let storage = std::mem::take(&mut *self.storage.write().unwrap());
        self.pool.recycle(storage);
    }
}

/// A handle onto pooled buffer storage.
///
/// Acquiring a [`Reader`] or [`Writer`] from a `Buffer` clones the underlying `Arc`,
/// contributing to the buffer's reference count; dropping (or calling [`Buffer::release`] on)
/// the last outstanding handle returns the storage to its pool.
pub struct Buffer {
    data: Arc<BufferData>,
}

impl Buffer {
    /// Marks this buffer as shared: a writer may append while readers concurrently observe
    /// the bytes already committed. Buffers are exclusive-write by default, in which case the
    /// caller must guarantee no concurrent readers are active while writing.
    pub fn mark_shared(&self) {
        self.data.shared.store(SHARED_FLAG, Ordering::Release);
    }

    /// Whether this buffer has been marked shared.
    pub fn is_shared(&self) -> bool {
        self.data.shared.load(Ordering::Acquire) == SHARED_FLAG
    }

    /// Returns a new reader view onto this buffer, incrementing its reference count.
    pub fn reader(&self) -> Reader {
        Reader {
            data: self.data.clone(),
            cursor: 0,
        }
    }

    /// Returns a new writer view onto this buffer, incrementing its reference count.
    pub fn writer(&self) -> Writer {
        Writer {
            data: self.data.clone(),
            cursor: self.data.committed_len.load(Ordering::Acquire),
        }
    }

    /// Total capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.storage.read().unwrap().capacity()
    }

    /// Number of bytes committed so far.
    pub fn len(&self) -> usize {
        self.data.committed_len.load(Ordering::Acquire)
    }

    /// Whether the buffer currently holds no committed bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of handles (readers, writers, and this buffer itself) currently referencing the
    /// same underlying storage. Exposed for testing the pool's reference-counting invariant.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Consumes this handle, releasing its share of the buffer's reference count.
    pub fn release(self) {
        drop(self)
    }
}

/// A read-only view onto a [`Buffer`]'s storage, with its own read cursor.
pub struct Reader {
    data: Arc<BufferData>,
    cursor: usize,
}

impl Reader {
    /// Reads up to `out.len()` bytes starting at this reader's cursor, never observing bytes
    /// beyond the buffer's highest committed write position. Returns the number of bytes read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let committed = self.data.committed_len.load(Ordering::Acquire);
        let storage = self.data.storage.read().unwrap();
        let available = committed.saturating_sub(self.cursor);
        let n = available.min(out.len());
        out[..n].copy_from_slice(&storage[self.cursor..self.cursor + n]);
        self.cursor += n;
        n
    }

    /// Bytes remaining to be read before reaching the highest committed write position.
    pub fn remaining(&self) -> usize {
        self.data
            .committed_len
            .load(Ordering::Acquire)
            .saturating_sub(self.cursor)
    }

    /// Current read cursor position.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Number of handles currently referencing the same underlying storage.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Consumes this handle, releasing its share of the buffer's reference count.
    pub fn release(self) {
        drop(self)
    }
}

/// A write-only view onto a [`Buffer`]'s storage, with its own write cursor.
pub struct Writer {
    data: Arc<BufferData>,
    cursor: usize,
}

impl Writer {
    /// Appends `bytes` at this writer's cursor, extending the buffer's committed length.
    ///
    /// On a buffer marked [`Buffer::mark_shared`], the extension is published atomically with
    /// respect to concurrent readers: a reader will never observe a length update before the
    /// bytes it covers have been written. On a non-shared buffer, the caller must guarantee
    /// exclusive write access for the duration of the call.
    pub fn write(&mut self, bytes: &[u8]) {
        let mut storage = self.data.storage.write().unwrap();
        let end = self.cursor + bytes.len();
        if storage.len() < end {
            storage.resize(end, 0);
        }
        storage[self.cursor..end].copy_from_slice(bytes);
        drop(storage);

        self.cursor = end;
        // Release ordering: any reader that observes the new committed_len via Acquire is
        // guaranteed to see the bytes written above.
        self.data.committed_len.store(end, Ordering::Release);
    }

    /// Current write cursor position.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Number of handles currently referencing the same underlying storage.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Consumes this handle, releasing its share of the buffer's reference count.
    pub fn release(self) {
        drop(self)
    }
}
