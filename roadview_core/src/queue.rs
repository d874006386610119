//! Bounded drop-oldest queue used for worker results.
//!
//! Producers never block: when the channel is full the oldest buffered item
//! is discarded to make room, favoring freshness over completeness.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Fixed-capacity MPSC queue with a drop-oldest overflow policy.
///
/// Backed by a bounded crossbeam channel. The producer side keeps its own
/// `Receiver` so it can evict the oldest item instead of waiting.
#[derive(Debug)]
pub struct ResultQueue<T> {
    /// `None` once the queue has been closed.
    tx: Mutex<Option<Sender<T>>>,
    rx: Receiver<T>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> ResultQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<Sender<T>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends an item without blocking.
    ///
    /// Returns the item that did not make it into the queue: the evicted
    /// oldest one when full, or `item` itself once the queue is closed.
    pub fn push(&self, item: T) -> Option<T> {
        let guard = self.sender();
        let Some(tx) = guard.as_ref() else {
            return Some(item);
        };
        let mut item = item;
        let mut evicted = None;
        loop {
            match tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Ok(oldest) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        evicted = Some(oldest);
                    }
                }
                Err(TrySendError::Disconnected(back)) => return Some(back),
            }
        }
    }

    /// Removes and returns everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// Pops the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed
    /// and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drops the sending half. Buffered items stay readable and a waiting
    /// consumer wakes up; later pushes are rejected.
    pub fn close(&self) {
        self.sender().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of items discarded by the overflow policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_push_when_full_drops_oldest() {
        let q = ResultQueue::new(3);
        for i in 0..3 {
            assert!(q.push(i).is_none());
        }
        assert_eq!(q.push(3), Some(0));
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.drain(), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_pop_timeout_returns_none_when_empty() {
        let q: ResultQueue<u32> = ResultQueue::new(2);
        let start = Instant::now();
        assert!(q.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_pop_wakes_on_push_from_other_thread() {
        let q = Arc::new(ResultQueue::new(2));
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                q.push(7u32);
            })
        };
        assert_eq!(q.pop_timeout(Duration::from_secs(5)), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn test_close_wakes_consumer() {
        let q: Arc<ResultQueue<u32>> = Arc::new(ResultQueue::new(2));
        let closer = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                q.close();
            })
        };
        let start = Instant::now();
        assert!(q.pop_timeout(Duration::from_secs(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(q.is_closed());
        closer.join().unwrap();
    }

    #[test]
    fn test_close_keeps_buffered_items_and_rejects_new_ones() {
        let q = ResultQueue::new(4);
        q.push(1u32);
        q.push(2);
        q.close();
        assert_eq!(q.push(3), Some(3));
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), Some(1));
        assert_eq!(q.drain(), vec![2]);
        assert!(q.pop_timeout(Duration::from_secs(5)).is_none());
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn test_zero_capacity_becomes_one() {
        let q = ResultQueue::new(0);
        assert_eq!(q.capacity(), 1);
        q.push("a");
        q.push("b");
        assert_eq!(q.drain(), vec!["b"]);
    }

    proptest! {
        #[test]
        fn prop_full_queue_keeps_newest(capacity in 1usize..16, pushes in 1usize..64) {
            let q = ResultQueue::new(capacity);
            for i in 0..pushes {
                q.push(i);
            }
            let items = q.drain();
            prop_assert_eq!(items.len(), pushes.min(capacity));
            prop_assert_eq!(*items.last().unwrap(), pushes - 1);
            prop_assert_eq!(items[0], pushes - pushes.min(capacity));
            prop_assert_eq!(q.dropped() as usize, pushes.saturating_sub(capacity));
        }
    }
}
