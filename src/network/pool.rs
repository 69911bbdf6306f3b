use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::trace;

use super::packet::Packet;
use crate::service::{global_config, PacketConfig};

static GLOBAL_POOL: OnceCell<PacketPool> = OnceCell::new();

/// Counters since the pool was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Packets served from a fresh allocation.
    pub allocated: u64,
    /// Packets served from a pooled buffer.
    pub reused: u64,
    /// Released buffers dropped because the pool was full or they were too big.
    pub discarded: u64,
}

/// Size class of a buffer: the index of its highest set bit.
fn size_class(capacity: usize) -> usize {
    (usize::BITS - 1 - capacity.max(1).leading_zeros()) as usize
}

/// Released buffers bucketed by size class, so acquire and release touch a
/// bounded number of buckets no matter how many buffers are pooled.
struct FreeList {
    buckets: Vec<Vec<Vec<u8>>>,
    len: usize,
}

impl FreeList {
    fn new() -> Self {
        FreeList {
            buckets: (0..usize::BITS).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    /// The smallest-class buffer holding `min_capacity`. Within its own class
    /// only the most recently released buffer is considered; every buffer in
    /// a higher class fits.
    fn take(&mut self, min_capacity: usize) -> Option<Vec<u8>> {
        let class = size_class(min_capacity);
        let own_class = &mut self.buckets[class];
        let buf = if own_class.last().is_some_and(|buf| buf.len() >= min_capacity) {
            own_class.pop()
        } else {
            self.buckets[class + 1..]
                .iter_mut()
                .find_map(|bucket| bucket.pop())
        };
        if buf.is_some() {
            self.len -= 1;
        }
        buf
    }

    fn push(&mut self, buf: Vec<u8>) {
        self.buckets[size_class(buf.len())].push(buf);
        self.len += 1;
    }
}

struct PoolInner {
    free: Mutex<FreeList>,
    default_capacity: usize,
    max_packets: usize,
    max_packet_capacity: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// Free list of packet buffers shared by every connection.
///
/// Acquire and release each take the lock once. The pool never holds a
/// buffer that a live `Packet` owns: acquire moves the buffer out of the
/// list, and only the packet's drop moves it back.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    pub fn new(config: &PacketConfig) -> Self {
        PacketPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(FreeList::new()),
                default_capacity: config.default_capacity.max(1),
                max_packets: config.pool_max_packets,
                max_packet_capacity: config.pool_max_packet_capacity,
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide pool, sized from the installed config on first use.
    pub fn global() -> PacketPool {
        GLOBAL_POOL
            .get_or_init(|| PacketPool::new(&global_config().packet))
            .clone()
    }

    /// An empty packet with at least the default capacity.
    pub fn acquire(&self) -> Packet {
        self.acquire_with_capacity(self.inner.default_capacity)
    }

    /// An empty packet able to hold `min_capacity` bytes without growing.
    ///
    /// Takes a pooled buffer of the smallest size class that is large enough,
    /// or allocates a new one.
    pub fn acquire_with_capacity(&self, min_capacity: usize) -> Packet {
        let pooled = self.inner.free.lock().take(min_capacity);
        let buf = match pooled {
            Some(buf) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; min_capacity.max(self.inner.default_capacity)]
            }
        };
        Packet::from_pool(buf, self.clone())
    }

    pub(crate) fn put(&self, buf: Vec<u8>) {
        if buf.is_empty() || buf.len() > self.inner.max_packet_capacity {
            trace!(capacity = buf.len(), "discard packet buffer");
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut free = self.inner.free.lock();
        if free.len >= self.inner.max_packets {
            drop(free);
            self.inner.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        free.push(buf);
    }

    /// Number of buffers waiting for reuse.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("available", &self.available())
            .field("default_capacity", &self.inner.default_capacity)
            .field("max_packets", &self.inner.max_packets)
            .field("max_packet_capacity", &self.inner.max_packet_capacity)
            .finish()
    }
}
