//! Sharded, fixed-capacity connection pool
//!
//! The pool is an array of ring buffers, each behind its own mutex. A caller-supplied
//! hint picks the first shard to try; `offer` and `poll` probe the remaining shards in
//! order when that one is full or empty. Nothing blocks: a full pool rejects the
//! offer and hands the connection back, an empty pool yields `None`.
//!
//! ```text
//!   hint % shards
//!        │
//!  ┌─────▼─────┐ ┌───────────┐ ┌───────────┐ ┌─────┐
//!  │ ring (n)  │ │ ring (n)  │ │ ring (n)  │ │ rem │   n = max / shards
//!  └───────────┘ └───────────┘ └───────────┘ └─────┘
//! ```

use crate::connection::Connection;
use crate::error::{Error, Result};
use parking_lot::Mutex;

/// What the pool needs from the things it holds
pub trait Pooled: Send {
    /// Unused for longer than its idle timeout
    fn is_idle(&self) -> bool;

    fn close(&mut self);
}

impl Pooled for Connection {
    fn is_idle(&self) -> bool {
        Connection::is_idle(self)
    }

    fn close(&mut self) {
        Connection::close(self)
    }
}

// ============================================================================
// Ring buffer shard
// ============================================================================

/// Fixed-size LIFO ring. Occupied slots are `tail+1 ..= head`; `full` settles the
/// `head == tail` ambiguity.
struct Ring<C> {
    head: usize,
    tail: usize,
    full: bool,
    data: Vec<Option<C>>,
}

impl<C: Pooled> Ring<C> {
    fn new(size: usize) -> Self {
        let mut data = Vec::with_capacity(size);
        data.resize_with(size, || None);
        Self {
            head: 0,
            tail: 0,
            full: false,
            data,
        }
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty() || (!self.full && self.head == self.tail)
    }

    fn offer(&mut self, conn: C) -> std::result::Result<(), C> {
        if self.full || self.data.is_empty() {
            return Err(conn);
        }
        self.head = (self.head + 1) % self.size();
        self.data[self.head] = Some(conn);
        if self.head == self.tail {
            self.full = true;
        }
        Ok(())
    }

    /// Most recently offered connection
    fn poll(&mut self) -> Option<C> {
        if self.is_empty() {
            return None;
        }
        let conn = self.data[self.head].take();
        self.full = false;
        self.head = if self.head == 0 {
            self.size() - 1
        } else {
            self.head - 1
        };
        conn
    }

    /// Close the oldest connection if it is idle
    fn drop_idle_tail(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }
        let idx = (self.tail + 1) % self.size();
        match self.data[idx].as_ref() {
            Some(conn) if conn.is_idle() => {}
            _ => return false,
        }
        if let Some(mut conn) = self.data[idx].take() {
            conn.close();
        }
        self.tail = idx;
        self.full = false;
        true
    }

    fn len(&self) -> usize {
        if self.full {
            self.size()
        } else if self.head < self.tail {
            self.size() - (self.tail - self.head)
        } else {
            self.head - self.tail
        }
    }

    /// Close everything and refuse further offers
    fn cleanup(&mut self) {
        for mut conn in self.data.drain(..).flatten() {
            conn.close();
        }
        self.head = 0;
        self.tail = 0;
        self.full = true;
    }
}

// ============================================================================
// Connection Heap
// ============================================================================

/// Per-node connection pool
pub struct ConnectionHeap<C: Pooled = Connection> {
    shards: Vec<Mutex<Ring<C>>>,
    min_size: usize,
    max_size: usize,
}

impl<C: Pooled> ConnectionHeap<C> {
    /// One shard per CPU (at most `max_size` shards)
    pub fn new(min_size: usize, max_size: usize) -> Result<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_shards(min_size, max_size, cpus)
    }

    /// Pool with an explicit shard count
    pub fn with_shards(min_size: usize, max_size: usize, shard_count: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(Error::parameter("connection pool size must be greater than 0"));
        }
        if min_size > max_size {
            return Err(Error::parameter(format!(
                "minimum pool size {} exceeds maximum {}",
                min_size, max_size
            )));
        }

        let count = shard_count.clamp(1, max_size);
        let per_shard = max_size / count;
        let mut shards: Vec<_> = (0..count).map(|_| Mutex::new(Ring::new(per_shard))).collect();

        let remainder = max_size - count * per_shard;
        if remainder > 0 {
            shards.push(Mutex::new(Ring::new(remainder)));
        }

        Ok(Self {
            shards,
            min_size,
            max_size,
        })
    }

    /// Return a connection, starting at the hinted shard. Hands the connection back
    /// when every shard is full; the caller must close it.
    pub fn offer(&self, conn: C, hint: u8) -> std::result::Result<(), C> {
        let n = self.shards.len();
        let start = hint as usize % n;
        let mut conn = conn;
        for i in start..start + n {
            match self.shards[i % n].lock().offer(conn) {
                Ok(()) => return Ok(()),
                Err(back) => conn = back,
            }
        }
        Err(conn)
    }

    /// Lease a connection, starting at the hinted shard
    pub fn poll(&self, hint: u8) -> Option<C> {
        let n = self.shards.len();
        let start = hint as usize % n;
        (start..start + n).find_map(|i| self.shards[i % n].lock().poll())
    }

    /// Close idle connections from the shard tails without going below the minimum
    /// size. Returns how many were closed.
    pub fn drop_idle(&self) -> usize {
        let mut remaining = self.len();
        let mut dropped = 0;
        for shard in &self.shards {
            let mut ring = shard.lock();
            while remaining > self.min_size && ring.drop_idle_tail() {
                remaining -= 1;
                dropped += 1;
            }
        }
        dropped
    }

    /// Close every pooled connection and disable the pool
    pub fn cleanup(&self) {
        for shard in &self.shards {
            shard.lock().cleanup();
        }
    }

    /// Pooled connections across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl<C: Pooled> std::fmt::Debug for ConnectionHeap<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHeap")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .finish()
    }
}
