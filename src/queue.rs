//! Bounded event queue with a single timed reader.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A bounded queue filled from interrupt-side code and drained by one
/// reader at a time.
///
/// `push` never blocks: when the queue is full the new item is dropped and
/// counted as an overrun.
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
    reader: Mutex<()>,
    capacity: usize,
    overruns: AtomicU64,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            reader: Mutex::new(()),
            capacity,
            overruns: AtomicU64::new(0),
        }
    }

    /// Returns false if the item was dropped.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.len() >= self.capacity {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        items.push_back(item);
        drop(items);
        self.ready.notify_one();
        true
    }

    /// Takes the oldest item, waiting up to `timeout` for one to arrive.
    /// `None` waits forever.
    ///
    /// Concurrent readers queue up behind each other; only one waits on the
    /// queue at a time.
    pub fn read(&self, timeout: Option<Duration>) -> Option<T> {
        let _reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            items = match deadline {
                None => self.ready.wait(items).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let left = deadline.checked_duration_since(Instant::now())?;
                    self.ready
                        .wait_timeout(items, left)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn overruns_are_counted() {
        let q = EventQueue::new(2);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(!q.push(3));
        assert_eq!(q.overruns(), 1);
        assert_eq!(q.read(Some(Duration::ZERO)), Some(1));
        assert_eq!(q.read(Some(Duration::ZERO)), Some(2));
        assert_eq!(q.read(Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn reader_wakes_on_push() {
        let q = Arc::new(EventQueue::new(4));
        let writer = q.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.push(42u32);
        });
        assert_eq!(q.read(Some(Duration::from_secs(5))), Some(42));
        t.join().unwrap();
    }
}
