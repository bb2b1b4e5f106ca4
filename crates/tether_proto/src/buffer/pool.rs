//! See [`BufferPool`].

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use tracing::trace;
use web_time::Instant;

use super::{Buffer, BufferNotify, BufferState};
use crate::ty::FrameHeader;

/// Smallest buffer size a pool will be configured with.
pub const MIN_BUFFER_SIZE: usize = 128;
/// Largest buffer size a pool will be configured with.
pub const MAX_BUFFER_SIZE: usize = 16384;
/// Default buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Default cap on the total bytes a pool may have live at once.
pub const DEFAULT_MAX_TOTAL_BYTES: usize = 1_024_000;

/// Identity of a [`BufferPool`], used as the non-owning back reference on
/// buffers it hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// A recycling pool of fixed-size [`Buffer`]s.
///
/// Acquire returns a recycled buffer from the retain list, or allocates a
/// fresh one when the list is empty. Release returns a buffer to the retain
/// list only if it originated here, its capacity still matches the configured
/// size, and the list has room; otherwise the storage is abandoned.
///
/// The pool is single-threaded: callers must serialize access. There is no
/// ambient or process-wide pool; every message writer is handed its pool
/// explicitly.
pub struct BufferPool {
    id: PoolId,
    buffer_size: usize,
    max_total_bytes: usize,
    retain: Vec<Buffer>,
    retain_cap: usize,
    outstanding: usize,
    allocations: u64,
    notify: Option<Arc<dyn BufferNotify>>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("buffer_size", &self.buffer_size)
            .field("retained", &self.retain.len())
            .field("retain_cap", &self.retain_cap)
            .field("outstanding", &self.outstanding)
            .field("allocations", &self.allocations)
            .finish_non_exhaustive()
    }
}

const fn retain_cap_for(buffer_size: usize, max_total_bytes: usize) -> usize {
    let cap = max_total_bytes / buffer_size;
    if cap < 5 { 5 } else { cap }
}

const fn clamp_buffer_size(size: usize) -> usize {
    if size < MIN_BUFFER_SIZE {
        MIN_BUFFER_SIZE
    } else if size > MAX_BUFFER_SIZE {
        MAX_BUFFER_SIZE
    } else {
        size
    }
}

impl BufferPool {
    /// Creates a pool of `buffer_size`-byte buffers retaining at most
    /// `max_total_bytes` worth of storage. `buffer_size` is clamped to
    /// [[`MIN_BUFFER_SIZE`], [`MAX_BUFFER_SIZE`]].
    #[must_use]
    pub fn new(buffer_size: usize, max_total_bytes: usize) -> Self {
        let buffer_size = clamp_buffer_size(buffer_size);
        Self {
            id: PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            buffer_size,
            max_total_bytes,
            retain: Vec::new(),
            retain_cap: retain_cap_for(buffer_size, max_total_bytes),
            outstanding: 0,
            allocations: 0,
            notify: None,
        }
    }

    /// Installs the observer fired on every state transition of buffers this
    /// pool hands out.
    pub fn set_notify(&mut self, notify: Arc<dyn BufferNotify>) {
        self.notify = Some(notify);
    }

    /// This pool's identity.
    #[must_use]
    pub const fn id(&self) -> PoolId {
        self.id
    }

    /// The configured buffer size.
    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Payload bytes a single buffer can carry after its header.
    #[must_use]
    pub const fn usable_payload(&self) -> usize {
        self.buffer_size - FrameHeader::LEN
    }

    /// Number of buffers currently on the retain list.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.retain.len()
    }

    /// Total fresh allocations made over this pool's lifetime.
    #[must_use]
    pub const fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Returns a buffer in state [`BufferState::Acquired`] (recycled) or
    /// [`BufferState::Created`] (fresh), with `byte_count` equal to the
    /// header size and the header zeroed.
    pub fn acquire(&mut self, now: Instant, reason: &str) -> Buffer {
        self.outstanding += 1;
        if let Some(mut buf) = self.retain.pop() {
            buf.set_state(now, BufferState::Acquired, reason);
            buf
        } else {
            self.allocations += 1;
            trace!(pool = ?self.id, size = self.buffer_size, reason, "allocating buffer");
            Buffer::with_capacity(self.buffer_size, Some(self.id), self.notify.clone())
        }
    }

    /// Like [`BufferPool::acquire`], but refuses to grow past the pool's
    /// total byte cap. Returns [`None`] when the pool cannot supply a buffer;
    /// an active message write receiving this fails with an out-of-memory
    /// kind.
    pub fn try_acquire(&mut self, now: Instant, reason: &str) -> Option<Buffer> {
        let live = (self.outstanding + self.retain.len() + 1) * self.buffer_size;
        if self.retain.is_empty() && live > self.max_total_bytes {
            trace!(pool = ?self.id, reason, "pool exhausted");
            return None;
        }
        Some(self.acquire(now, reason))
    }

    /// Returns a buffer to the pool. Idempotent and tolerant of [`None`].
    ///
    /// The buffer is pooled only if it originated here, its capacity matches
    /// the configured size, and the retain list has room; otherwise its
    /// storage is abandoned.
    pub fn release(&mut self, now: Instant, buffer: Option<Buffer>, reason: &str) {
        let Some(mut buffer) = buffer else {
            return;
        };
        if buffer.state() == BufferState::Released {
            return;
        }
        let ours = buffer.pool_id() == Some(self.id);
        if ours {
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        if ours && buffer.capacity() == self.buffer_size && self.retain.len() < self.retain_cap {
            buffer.clear(now, reason);
            self.retain.push(buffer);
        } else {
            trace!(pool = ?self.id, ours, reason, "abandoning buffer");
            buffer.set_state(now, BufferState::Released, reason);
        }
    }

    /// Releases every pooled buffer. Used when reconfiguring the buffer size.
    pub fn drain(&mut self, now: Instant) {
        for mut buf in self.retain.drain(..) {
            buf.set_state(now, BufferState::Released, "pool drained");
        }
    }

    /// Drains the pool and reconfigures the buffer size, clamped to
    /// [[`MIN_BUFFER_SIZE`], [`MAX_BUFFER_SIZE`]]. Must not be called while a
    /// session using this pool is active.
    pub fn set_buffer_size(&mut self, now: Instant, new_size: usize) {
        self.drain(now);
        self.buffer_size = clamp_buffer_size(new_size);
        self.retain_cap = retain_cap_for(self.buffer_size, self.max_total_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn acquire_release_does_not_leak() {
        let mut pool = BufferPool::new(1024, 1_024_000);
        for _ in 0..1000 {
            let buf = pool.acquire(now(), "test");
            assert_eq!(FrameHeader::LEN, buf.byte_count());
            assert_eq!(FrameHeader::default(), *buf.header());
            pool.release(now(), Some(buf), "test");
        }
        assert_eq!(1, pool.allocations());
        assert!(pool.retained() <= retain_cap_for(1024, 1_024_000));
    }

    #[test]
    fn recycled_buffer_is_clean() {
        let mut pool = BufferPool::new(1024, 1_024_000);
        let mut buf = pool.acquire(now(), "test");
        buf.header_mut().purpose = crate::ty::Purpose::Message;
        buf.append_payload(&[1, 2, 3]);
        pool.release(now(), Some(buf), "test");

        let buf = pool.acquire(now(), "test");
        assert_eq!(BufferState::Acquired, buf.state());
        assert_eq!(FrameHeader::default(), *buf.header());
        assert_eq!(FrameHeader::LEN, buf.byte_count());
    }

    #[test]
    fn foreign_buffer_abandoned() {
        let mut a = BufferPool::new(1024, 1_024_000);
        let mut b = BufferPool::new(1024, 1_024_000);
        let buf = a.acquire(now(), "test");
        b.release(now(), Some(buf), "test");
        assert_eq!(0, b.retained());
    }

    #[test]
    fn release_tolerates_none() {
        let mut pool = BufferPool::new(1024, 1_024_000);
        pool.release(now(), None, "test");
    }

    #[test]
    fn retain_list_bounded() {
        let mut pool = BufferPool::new(1024, 10 * 1024);
        let bufs = (0..30).map(|_| pool.acquire(now(), "test")).collect::<Vec<_>>();
        for buf in bufs {
            pool.release(now(), Some(buf), "test");
        }
        assert_eq!(10, pool.retained());
    }

    #[test]
    fn size_clamped() {
        let pool = BufferPool::new(1, 1_024_000);
        assert_eq!(MIN_BUFFER_SIZE, pool.buffer_size());
        let pool = BufferPool::new(1 << 20, 1_024_000);
        assert_eq!(MAX_BUFFER_SIZE, pool.buffer_size());
    }

    #[test]
    fn set_buffer_size_drains() {
        let mut pool = BufferPool::new(1024, 1_024_000);
        let buf = pool.acquire(now(), "test");
        pool.release(now(), Some(buf), "test");
        assert_eq!(1, pool.retained());
        pool.set_buffer_size(now(), 2048);
        assert_eq!(0, pool.retained());
        assert_eq!(2048, pool.buffer_size());
    }

    #[test]
    fn try_acquire_respects_cap() {
        let mut pool = BufferPool::new(1024, 2048);
        let a = pool.try_acquire(now(), "test").unwrap();
        let b = pool.try_acquire(now(), "test").unwrap();
        assert!(pool.try_acquire(now(), "test").is_none());
        pool.release(now(), Some(a), "test");
        pool.release(now(), Some(b), "test");
        assert!(pool.try_acquire(now(), "test").is_some());
    }
}
