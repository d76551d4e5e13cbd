//! Reference-counted byte buffers and the per-loop buffer pool.
//!
//! [`IoBuffer`] is the message carrier of the engine: a growable byte
//! container with big-endian cursored primitives, shared between the
//! request table, socket write queues and handlers through an atomic
//! reference count. `acquire()` and `release()` are the only mutators of
//! the count; when it reaches zero the storage returns to the pool that
//! vended it (or is freed).
//!
//! Concurrent acquire/release is legal. Concurrent *mutation* is not:
//! cursor and content writes require the caller to be the only party
//! touching the buffer at that moment. Shared readers use the `&self`
//! accessors only.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::socket::AsyncSocket;

struct Core {
    /// Backing storage; `storage.len()` is the buffer capacity.
    storage: Vec<u8>,
    position: usize,
    limit: usize,
    /// Socket the enclosing frame arrived on, stamped by server read
    /// handlers so the actor layer can address its response.
    origin: Option<AsyncSocket>,
}

struct Inner {
    refs: AtomicUsize,
    pool: Option<Weak<PoolShared>>,
    cell: UnsafeCell<Core>,
}

// Safety: `cell` is only written through `&mut IoBuffer`, and the buffer
// contract requires mutation to happen while the handle is the sole
// logical reference (or externally serialized). The refcount and pool
// backref are atomics/immutable. Shared handles read through `&self`.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

/// Refcounted byte container with `position`/`limit` cursors.
///
/// Invariant: `0 <= position <= limit <= capacity`.
pub struct IoBuffer {
    inner: Arc<Inner>,
}

impl PartialEq for IoBuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl IoBuffer {
    /// Create an unpooled buffer in write mode (`limit == capacity`).
    pub fn with_capacity(capacity: usize) -> IoBuffer {
        IoBuffer::build(vec![0u8; capacity], capacity, None)
    }

    /// Create an unpooled buffer in accumulation mode (`limit == 0`),
    /// used as a socket receive buffer: bytes land between `limit` and
    /// `capacity`, handlers consume between `position` and `limit`.
    pub(crate) fn for_accumulation(capacity: usize) -> IoBuffer {
        let mut buf = IoBuffer::with_capacity(capacity);
        buf.core_mut().limit = 0;
        buf
    }

    fn build(storage: Vec<u8>, limit: usize, pool: Option<Weak<PoolShared>>) -> IoBuffer {
        IoBuffer {
            inner: Arc::new(Inner {
                refs: AtomicUsize::new(1),
                pool,
                cell: UnsafeCell::new(Core {
                    storage,
                    position: 0,
                    limit,
                    origin: None,
                }),
            }),
        }
    }

    fn core(&self) -> &Core {
        // Safety: see `Inner`; shared handles only read.
        unsafe { &*self.inner.cell.get() }
    }

    fn core_mut(&mut self) -> &mut Core {
        // Safety: see `Inner`; the caller is the sole mutator.
        unsafe { &mut *self.inner.cell.get() }
    }

    // ── Reference counting ───────────────────────────────────────────

    /// Take an additional reference. Pairs with exactly one
    /// [`release`](Self::release) (or drop).
    pub fn acquire(&self) -> IoBuffer {
        self.inner.refs.fetch_add(1, Ordering::Relaxed);
        IoBuffer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Drop one reference. At zero the storage returns to its pool.
    pub fn release(self) {
        drop(self);
    }

    /// Current reference count (quiescence checks in tests).
    pub fn refs(&self) -> usize {
        self.inner.refs.load(Ordering::Acquire)
    }

    // ── Cursors ──────────────────────────────────────────────────────

    pub fn capacity(&self) -> usize {
        self.core().storage.len()
    }

    pub fn position(&self) -> usize {
        self.core().position
    }

    pub fn limit(&self) -> usize {
        self.core().limit
    }

    /// Bytes available between `position` and `limit`.
    pub fn remaining(&self) -> usize {
        let c = self.core();
        c.limit - c.position
    }

    pub fn set_position(&mut self, position: usize) {
        let c = self.core_mut();
        assert!(position <= c.limit, "position {position} beyond limit {}", c.limit);
        c.position = position;
    }

    /// Switch from write mode to read mode: `limit = position`, `position = 0`.
    pub fn flip(&mut self) {
        let c = self.core_mut();
        c.limit = c.position;
        c.position = 0;
    }

    /// Reset to write mode over the full capacity.
    pub fn clear(&mut self) {
        let c = self.core_mut();
        c.position = 0;
        c.limit = c.storage.len();
        c.origin = None;
    }

    /// Discard consumed bytes: moves `[position, limit)` to the front and
    /// reopens the tail for accumulation.
    pub fn compact(&mut self) {
        let c = self.core_mut();
        let len = c.limit - c.position;
        if c.position > 0 {
            c.storage.copy_within(c.position..c.limit, 0);
        }
        c.position = 0;
        c.limit = len;
    }

    // ── Writes (relative, big-endian) ────────────────────────────────

    fn ensure_writable(&mut self, extra: usize) {
        let c = self.core_mut();
        let needed = c.position + extra;
        if needed > c.storage.len() {
            let grown = (c.storage.len() * 2).max(needed).max(64);
            let was_full = c.limit == c.storage.len();
            c.storage.resize(grown, 0);
            if was_full {
                c.limit = grown;
            }
        }
        if needed > c.limit {
            // Write mode keeps the limit at capacity; accumulation mode
            // never writes through this path.
            c.limit = c.storage.len();
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.ensure_writable(1);
        let c = self.core_mut();
        c.storage[c.position] = v;
        c.position += 1;
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_bytes(&mut self, src: &[u8]) {
        self.ensure_writable(src.len());
        let c = self.core_mut();
        c.storage[c.position..c.position + src.len()].copy_from_slice(src);
        c.position += src.len();
    }

    // ── Reads (relative, big-endian) ─────────────────────────────────

    pub fn read_u8(&mut self) -> u8 {
        let c = self.core_mut();
        assert!(c.limit - c.position >= 1, "buffer underflow");
        let v = c.storage[c.position];
        c.position += 1;
        v
    }

    pub fn read_i32(&mut self) -> i32 {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b);
        i32::from_be_bytes(b)
    }

    pub fn read_i64(&mut self) -> i64 {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b);
        i64::from_be_bytes(b)
    }

    pub fn read_bytes(&mut self, dst: &mut [u8]) {
        let c = self.core_mut();
        assert!(c.limit - c.position >= dst.len(), "buffer underflow");
        dst.copy_from_slice(&c.storage[c.position..c.position + dst.len()]);
        c.position += dst.len();
    }

    // ── Absolute access ──────────────────────────────────────────────

    pub fn get_i32(&self, index: usize) -> i32 {
        let c = self.core();
        let mut b = [0u8; 4];
        b.copy_from_slice(&c.storage[index..index + 4]);
        i32::from_be_bytes(b)
    }

    pub fn get_i64(&self, index: usize) -> i64 {
        let c = self.core();
        let mut b = [0u8; 8];
        b.copy_from_slice(&c.storage[index..index + 8]);
        i64::from_be_bytes(b)
    }

    pub fn set_i32(&mut self, index: usize, v: i32) {
        let c = self.core_mut();
        c.storage[index..index + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn set_i64(&mut self, index: usize, v: i64) {
        let c = self.core_mut();
        c.storage[index..index + 8].copy_from_slice(&v.to_be_bytes());
    }

    /// Readable bytes, `[position, limit)`.
    pub fn as_read_slice(&self) -> &[u8] {
        let c = self.core();
        &c.storage[c.position..c.limit]
    }

    // ── Accumulation support (socket receive path) ───────────────────

    /// Make at least `min` spare bytes available past `limit`, compacting
    /// consumed bytes first and growing as a last resort.
    pub(crate) fn ensure_spare(&mut self, min: usize) {
        if self.capacity() - self.limit() >= min {
            return;
        }
        self.compact();
        let c = self.core_mut();
        if c.storage.len() - c.limit < min {
            let grown = (c.storage.len() * 2).max(c.limit + min);
            c.storage.resize(grown, 0);
        }
    }

    /// Spare region past `limit`, for the kernel to fill.
    pub(crate) fn spare_mut(&mut self) -> (*mut u8, usize) {
        let c = self.core_mut();
        let len = c.storage.len() - c.limit;
        // Safety: limit <= storage.len() by invariant.
        (unsafe { c.storage.as_mut_ptr().add(c.limit) }, len)
    }

    /// Account `n` freshly received bytes.
    pub(crate) fn advance_limit(&mut self, n: usize) {
        let c = self.core_mut();
        debug_assert!(c.limit + n <= c.storage.len());
        c.limit += n;
    }

    // ── Origin socket ────────────────────────────────────────────────

    /// Socket the frame arrived on, if stamped by the read handler.
    pub fn socket(&self) -> Option<AsyncSocket> {
        self.core().origin.clone()
    }

    pub fn set_socket(&mut self, socket: AsyncSocket) {
        self.core_mut().origin = Some(socket);
    }
}

impl Default for IoBuffer {
    fn default() -> Self {
        IoBuffer::with_capacity(0)
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("position", &self.position())
            .field("limit", &self.limit())
            .field("capacity", &self.capacity())
            .field("refs", &self.refs())
            .finish()
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        let pool = match self.inner.pool.as_ref().and_then(Weak::upgrade) {
            Some(p) => p,
            None => return,
        };
        // Last logical reference: the Arc is unique, so the storage can be
        // extracted and handed back to the free list.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            let core = inner.cell.get_mut();
            core.origin = None;
            core.position = 0;
            let storage = std::mem::take(&mut core.storage);
            core.limit = 0;
            pool.recycle(storage);
        }
    }
}

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    outstanding: AtomicUsize,
}

impl PoolShared {
    fn recycle(&self, storage: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.free.lock().unwrap().push(storage);
    }
}

/// Free-list pool of buffer storage. One pool per loop by contract: every
/// buffer it vends must complete its acquire/release cycle on that loop.
pub struct IoBufferPool {
    shared: Arc<PoolShared>,
}

impl IoBufferPool {
    pub fn new(buffer_capacity: usize) -> IoBufferPool {
        IoBufferPool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                buffer_capacity,
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Vend a buffer with refcount 1 in write mode.
    pub fn allocate(&self) -> IoBuffer {
        let storage = self
            .shared
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.shared.buffer_capacity]);
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let limit = storage.len();
        IoBuffer::build(storage, limit, Some(Arc::downgrade(&self.shared)))
    }

    /// Buffers vended and not yet fully released.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Storages sitting in the free list.
    pub fn pooled(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let mut buf = IoBuffer::with_capacity(64);
        buf.write_i32(-1);
        buf.write_i64(1000);
        buf.write_u8(7);
        buf.flip();
        assert_eq!(buf.remaining(), 13);
        assert_eq!(buf.read_i32(), -1);
        assert_eq!(buf.read_i64(), 1000);
        assert_eq!(buf.read_u8(), 7);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = IoBuffer::with_capacity(4);
        buf.write_i64(42);
        buf.write_i64(43);
        assert!(buf.capacity() >= 16);
        buf.flip();
        assert_eq!(buf.read_i64(), 42);
        assert_eq!(buf.read_i64(), 43);
    }

    #[test]
    fn absolute_set_get() {
        let mut buf = IoBuffer::with_capacity(32);
        buf.write_i32(0);
        buf.write_i32(0);
        buf.write_i64(0);
        buf.set_i32(0, 16);
        buf.set_i64(8, 99);
        assert_eq!(buf.get_i32(0), 16);
        assert_eq!(buf.get_i64(8), 99);
    }

    #[test]
    fn clear_resets_cursors() {
        let mut buf = IoBuffer::with_capacity(16);
        buf.write_i32(5);
        buf.flip();
        buf.clear();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.limit(), buf.capacity());
    }

    #[test]
    fn compact_preserves_unconsumed() {
        let mut buf = IoBuffer::for_accumulation(16);
        let (ptr, len) = buf.spare_mut();
        assert!(len >= 6);
        unsafe { std::ptr::copy_nonoverlapping(b"abcdef".as_ptr(), ptr, 6) };
        buf.advance_limit(6);
        let mut b = [0u8; 2];
        buf.read_bytes(&mut b);
        assert_eq!(&b, b"ab");
        buf.compact();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.as_read_slice(), b"cdef");
    }

    #[test]
    fn acquire_release_pairs() {
        let buf = IoBuffer::with_capacity(8);
        assert_eq!(buf.refs(), 1);
        let second = buf.acquire();
        assert_eq!(buf.refs(), 2);
        second.release();
        assert_eq!(buf.refs(), 1);
    }

    #[test]
    fn pool_recycles_at_zero() {
        let pool = IoBufferPool::new(128);
        let buf = pool.allocate();
        assert_eq!(pool.outstanding(), 1);
        let extra = buf.acquire();
        buf.release();
        assert_eq!(pool.outstanding(), 1, "still referenced");
        extra.release();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.pooled(), 1);

        let again = pool.allocate();
        assert_eq!(pool.pooled(), 0, "storage reused");
        assert_eq!(again.capacity(), 128);
    }

    #[test]
    fn pool_counts_across_threads() {
        let pool = IoBufferPool::new(32);
        let buf = pool.allocate();
        let held = buf.acquire();
        std::thread::spawn(move || buf.release()).join().unwrap();
        assert_eq!(pool.outstanding(), 1);
        held.release();
        assert_eq!(pool.outstanding(), 0);
    }
}
