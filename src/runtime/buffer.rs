//! Buffer memory management.
//!
//! Socket reads and TLS record processing need scratch buffers on the hot
//! path. A [`BufferArena`] preallocates one large region and hands
//! out its remainder; whatever the caller does not use is recycled back as
//! the new remainder. Once every segment carved from a region has been
//! dropped, `bytes` lets the next allocation reuse it in place.
//!
//! ## Thread affinity
//!
//! - [`BufferArena`] is unsynchronized and owned by exactly one dispatcher.
//! - [`SharedMemoryManager`] wraps an arena in a mutex for pools shared
//!   across threads (TLS buffers, client-side connections).

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

/// Default arena size.
pub const DEFAULT_PREALLOCATION_SIZE: usize = 64 * 1024;

/// Below this remainder size the arena is refilled instead of recycled.
pub const DEFAULT_MIN_PREALLOCATED_SIZE: usize = 4 * 1024;

/// Source of writable scratch buffers.
pub trait MemoryManager: Send {
    /// Acquire an initialized buffer of at least `min_size` bytes.
    ///
    /// The buffer may be larger than requested; its full length is usable.
    /// Contents are unspecified.
    fn acquire(&mut self, min_size: usize) -> BytesMut;

    /// Give an unused buffer back.
    fn recycle(&mut self, buf: BytesMut);

    /// Split off the first `used` bytes as an immutable segment and recycle
    /// the rest.
    fn extract_and_recycle(&mut self, mut buf: BytesMut, used: usize) -> Bytes {
        let used = used.min(buf.len());
        let data = buf.split_to(used).freeze();
        self.recycle(buf);
        data
    }
}

/// Arena statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Number of times a fresh region was allocated.
    pub refills: u64,
    /// Number of buffers handed out.
    pub acquired: u64,
}

/// Unsynchronized buffer arena.
///
/// With preallocation disabled every acquire is a plain allocation of
/// exactly the requested size (growable mode).
#[derive(Debug)]
pub struct BufferArena {
    /// Remaining preallocated region.
    cached: BytesMut,
    preallocation_size: usize,
    min_preallocated_size: usize,
    preallocate: bool,
    stats: ArenaStats,
}

impl BufferArena {
    /// Create a preallocating arena.
    ///
    /// # Arguments
    /// * `preallocation_size` - Size of each region allocated from the heap
    /// * `min_preallocated_size` - Remainders smaller than this are dropped
    pub fn new(preallocation_size: usize, min_preallocated_size: usize) -> Self {
        let min_preallocated_size = min_preallocated_size.max(1);
        Self {
            cached: BytesMut::new(),
            preallocation_size: preallocation_size.max(min_preallocated_size),
            min_preallocated_size,
            preallocate: true,
            stats: ArenaStats::default(),
        }
    }

    /// Create an arena that allocates every buffer on demand.
    pub fn unpooled() -> Self {
        Self {
            preallocate: false,
            ..Self::new(DEFAULT_PREALLOCATION_SIZE, DEFAULT_MIN_PREALLOCATED_SIZE)
        }
    }

    /// Bytes currently held in the preallocated remainder.
    pub fn available(&self) -> usize {
        self.cached.len()
    }

    pub fn preallocation_size(&self) -> usize {
        self.preallocation_size
    }

    pub fn is_preallocating(&self) -> bool {
        self.preallocate
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    fn refill(&mut self, min_size: usize) {
        let size = self.preallocation_size.max(min_size);
        // Reuse the previous region in place when nothing references it.
        self.cached.clear();
        self.cached.reserve(size);
        self.cached.resize(size, 0);
        self.stats.refills += 1;
    }
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new(DEFAULT_PREALLOCATION_SIZE, DEFAULT_MIN_PREALLOCATED_SIZE)
    }
}

impl MemoryManager for BufferArena {
    fn acquire(&mut self, min_size: usize) -> BytesMut {
        self.stats.acquired += 1;
        if !self.preallocate {
            return BytesMut::zeroed(min_size);
        }
        if self.cached.len() < min_size.max(1) {
            self.refill(min_size);
        }
        // Hand out the whole remainder; the unused tail comes back on recycle.
        let len = self.cached.len();
        self.cached.split_to(len)
    }

    fn recycle(&mut self, buf: BytesMut) {
        if !self.preallocate || buf.len() < self.min_preallocated_size {
            return;
        }
        if buf.len() > self.cached.len() {
            self.cached = buf;
        }
    }
}

/// Mutex-guarded arena shared across threads.
#[derive(Debug, Clone, Default)]
pub struct SharedMemoryManager {
    inner: Arc<Mutex<BufferArena>>,
}

impl SharedMemoryManager {
    pub fn new(arena: BufferArena) -> Self {
        Self {
            inner: Arc::new(Mutex::new(arena)),
        }
    }

    pub fn stats(&self) -> ArenaStats {
        self.inner.lock().stats()
    }
}

impl MemoryManager for SharedMemoryManager {
    fn acquire(&mut self, min_size: usize) -> BytesMut {
        self.inner.lock().acquire(min_size)
    }

    fn recycle(&mut self, buf: BytesMut) {
        self.inner.lock().recycle(buf)
    }
}
