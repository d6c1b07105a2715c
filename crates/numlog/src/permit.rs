//! Fixed-capacity admission slots for connection handling.
//!
//! Permits live in a bounded channel. Acquiring receives one and suspends
//! while the pool is drained; dropping a permit sends it back. A slot is
//! therefore released exactly once on every exit path, handler panics
//! included.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

struct Slot;

pub struct PermitPool {
    available_rx: Mutex<mpsc::Receiver<Slot>>,
    available_tx: mpsc::Sender<Slot>,
    available_count: Arc<AtomicUsize>,
    capacity: usize,
}

impl PermitPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (available_tx, available_rx) = mpsc::channel(capacity);
        for _ in 0..capacity {
            // Channel capacity equals the permit count, this cannot fail.
            let _ = available_tx.try_send(Slot);
        }

        Self {
            available_rx: Mutex::new(available_rx),
            available_tx,
            available_count: Arc::new(AtomicUsize::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot. Returns `None` only once the pool itself is
    /// gone, which a live borrow rules out.
    pub async fn acquire(&self) -> Option<Permit> {
        let mut rx = self.available_rx.lock().await;
        let slot = rx.recv().await?;
        self.available_count.fetch_sub(1, Ordering::Release);

        Some(Permit {
            slot: Some(slot),
            pool_tx: self.available_tx.clone(),
            available_count: Arc::clone(&self.available_count),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.available_count.load(Ordering::Acquire)
    }
}

/// One unit of permission to actively service a connection. Returns to the
/// pool on drop.
pub struct Permit {
    slot: Option<Slot>,
    pool_tx: mpsc::Sender<Slot>,
    available_count: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if self.pool_tx.try_send(slot).is_ok() {
                self.available_count.fetch_add(1, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn acquire_drains_the_pool() {
        let pool = PermitPool::new(2);

        let first = pool.acquire().await;
        assert!(first.is_some());
        let second = pool.acquire().await;
        assert!(second.is_some());
        assert_eq!(pool.available(), 0);

        let starved = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(starved.is_err());
    }

    #[tokio::test]
    async fn dropping_a_permit_frees_a_slot() {
        let pool = PermitPool::new(1);

        let held = pool.acquire().await;
        drop(held);

        let reacquired = tokio::time::timeout(Duration::from_millis(500), pool.acquire()).await;
        assert!(reacquired.unwrap().is_some());
    }

    #[tokio::test]
    async fn available_tracks_outstanding_permits() {
        let pool = PermitPool::new(3);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available(), 3);

        let held = pool.acquire().await;
        assert_eq!(pool.available(), 2);

        drop(held);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn zero_capacity_still_admits_one_at_a_time() {
        let pool = PermitPool::new(0);
        assert_eq!(pool.capacity(), 1);
        assert!(pool.acquire().await.is_some());
    }
}
