//! A pooled lender of byte buffers.
//!
//! Buffers are grouped in power of two buckets. A buffer taken from the manager is owned by the
//! borrower until it is handed back through [`BufferManager::return_buffer`]; handing the same
//! allocation back twice, or never handing it back, are both bugs of the borrower. The manager
//! counts takes and returns so tests can assert the balance.

use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::trace;

const MIN_BUCKET_SIZE: usize = 128;

#[derive(Debug)]
pub struct BufferManager {
    max_pool_size: usize,
    max_buffer_size: usize,
    pooled_bytes: AtomicUsize,
    buckets: Mutex<HashMap<usize, Vec<BytesMut>>>,
    taken: AtomicU64,
    returned: AtomicU64,
}

impl BufferManager {
    /// Creates a manager that keeps at most `max_pool_size` bytes of idle buffers, none of them
    /// larger than `max_buffer_size`.
    pub fn new(max_pool_size: usize, max_buffer_size: usize) -> Self {
        Self {
            max_pool_size,
            max_buffer_size,
            pooled_bytes: AtomicUsize::new(0),
            buckets: Mutex::new(HashMap::new()),
            taken: AtomicU64::new(0),
            returned: AtomicU64::new(0),
        }
    }

    /// Takes a zero filled buffer of exactly `size` bytes.
    pub fn take_buffer(&self, size: usize) -> BytesMut {
        self.taken.fetch_add(1, Ordering::Relaxed);

        let bucket = bucket_size(size);
        let pooled = match self.buckets.lock() {
            Ok(mut buckets) => buckets.get_mut(&bucket).and_then(Vec::pop),
            Err(_) => None,
        };

        match pooled {
            Some(mut buffer) => {
                self.pooled_bytes.fetch_sub(buffer.capacity(), Ordering::Relaxed);
                buffer.clear();
                buffer.resize(size, 0);
                buffer
            }
            None => {
                let mut buffer = BytesMut::with_capacity(bucket);
                buffer.resize(size, 0);
                buffer
            }
        }
    }

    /// Hands a buffer back to the pool. Buffers that would overflow the pool are dropped.
    pub fn return_buffer(&self, buffer: BytesMut) {
        self.returned.fetch_add(1, Ordering::Relaxed);

        let capacity = buffer.capacity();
        if capacity > self.max_buffer_size.max(MIN_BUCKET_SIZE) || capacity < MIN_BUCKET_SIZE {
            trace!(capacity, "drop buffer which doesn't fit the pool");
            return;
        }

        if self.pooled_bytes.load(Ordering::Relaxed) + capacity > self.max_pool_size {
            trace!(capacity, "pool is full, drop buffer");
            return;
        }

        // a buffer belongs to the largest bucket it can fully serve
        let bucket = bucket_floor(capacity);
        if let Ok(mut buckets) = self.buckets.lock() {
            self.pooled_bytes.fetch_add(capacity, Ordering::Relaxed);
            buckets.entry(bucket).or_default().push(buffer);
        }
    }

    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }

    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::Relaxed)
    }

    /// Number of buffers currently lent out.
    pub fn outstanding(&self) -> i64 {
        self.taken() as i64 - self.returned() as i64
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new(512 * 1024, 64 * 1024)
    }
}

fn bucket_size(size: usize) -> usize {
    size.max(MIN_BUCKET_SIZE).next_power_of_two()
}

fn bucket_floor(capacity: usize) -> usize {
    let ceil = capacity.next_power_of_two();
    if ceil == capacity { capacity } else { ceil >> 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let manager = BufferManager::new(4096, 1024);
        let buffer = manager.take_buffer(300);
        assert_eq!(buffer.len(), 300);
        let ptr = buffer.as_ptr();
        manager.return_buffer(buffer);

        let buffer = manager.take_buffer(500);
        assert_eq!(buffer.len(), 500);
        assert_eq!(buffer.as_ptr(), ptr);
        assert!(buffer.iter().all(|b| *b == 0));
        manager.return_buffer(buffer);

        assert_eq!(manager.taken(), 2);
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn oversized_buffers_are_not_pooled() {
        let manager = BufferManager::new(4096, 1024);
        let buffer = manager.take_buffer(2048);
        manager.return_buffer(buffer);

        let buffer = manager.take_buffer(2048);
        assert_eq!(buffer.len(), 2048);
        manager.return_buffer(buffer);
        assert_eq!(manager.outstanding(), 0);
    }
}
