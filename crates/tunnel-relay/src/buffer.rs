//! Fixed-size packet buffers and the lock-free pool that recycles them.
//!
//! Every packet moving through the relay lives in exactly one [`PacketBuf`]. Buffers are moved
//! (never shared) between the capture side, the reactors and the device writer, and are handed
//! back with [`BufferPool::release`] once written out. Because `release` takes the buffer by
//! value, use-after-release and double-release do not type-check.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;

/// Capacity of a single packet buffer.
pub const BUFFER_SIZE: usize = 16 * 1024;

pub struct PacketBuf {
    data: Box<[u8]>,
    len: usize,
}

impl PacketBuf {
    fn new() -> Self {
        Self {
            data: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks the first `len` bytes as the packet contents (clamped to the capacity).
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len(), "length exceeds buffer capacity");
        self.len = len.min(self.data.len());
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The packet bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole backing storage, for writing headers and receiving payloads in place.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replaces the contents with `bytes`, truncated to the capacity. Returns the bytes copied.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }

    /// Address of the backing storage; stable for the life of the buffer.
    pub fn storage_addr(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl std::fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// Recycles [`PacketBuf`]s so the hot path does not allocate per packet.
///
/// `acquire`/`release` are safe to call concurrently from any thread without external locking.
#[derive(Default)]
pub struct BufferPool {
    free: SegQueue<PacketBuf>,
    allocations: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops a pooled buffer, allocating a new one only when the pool is empty. The returned
    /// buffer is always cleared.
    pub fn acquire(&self) -> PacketBuf {
        let mut buf = match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                PacketBuf::new()
            }
        };
        buf.clear();
        buf
    }

    pub fn release(&self, mut buf: PacketBuf) {
        buf.clear();
        self.free.push(buf);
    }

    /// Total number of buffers ever allocated by this pool.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of buffers currently idle in the pool.
    pub fn pooled(&self) -> usize {
        self.free.len()
    }

    /// Drops every idle buffer.
    pub fn clear(&self) {
        while self.free.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_only_when_empty() {
        let pool = BufferPool::new();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.allocations(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.pooled(), 2);

        let _a = pool.acquire();
        let _b = pool.acquire();
        assert_eq!(pool.allocations(), 2);
        let _c = pool.acquire();
        assert_eq!(pool.allocations(), 3);
    }

    #[test]
    fn acquired_buffers_are_cleared() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        assert_eq!(buf.capacity(), BUFFER_SIZE);
        buf.fill_from(b"stale");
        pool.release(buf);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(buf.as_slice(), b"");
    }

    #[test]
    fn fill_from_truncates_to_capacity() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        let big = vec![0xaa; BUFFER_SIZE + 10];
        assert_eq!(buf.fill_from(&big), BUFFER_SIZE);
        assert_eq!(buf.len(), BUFFER_SIZE);
    }

    #[test]
    fn clear_drops_idle_buffers() {
        let pool = BufferPool::new();
        pool.release(pool.acquire());
        assert_eq!(pool.pooled(), 1);
        pool.clear();
        assert_eq!(pool.pooled(), 0);
    }
}
