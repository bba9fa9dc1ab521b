// packages/engine/src/ipc/call_id.rs
//! Bounded call-id pool
//!
//! A FIFO of `max_call_id` integer ids. An id is either in the pool or
//! in flight, never both: `acquire` blocks when every id is out, and
//! `get_result` returns the id after the payload is consumed. The pool
//! is the front-end's capacity bound on concurrent exchanges.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// FIFO pool of call-ids with blocking acquisition
pub struct CallIdPool {
    free: Mutex<VecDeque<i32>>,
    available: Condvar,
    capacity: usize,
}

impl CallIdPool {
    /// Create a pool holding ids `0..max_call_id`
    pub fn new(max_call_id: usize) -> Self {
        Self {
            free: Mutex::new((0..max_call_id as i32).collect()),
            available: Condvar::new(),
            capacity: max_call_id,
        }
    }

    /// Pop the oldest free id, blocking while the pool is exhausted
    pub fn acquire(&self) -> i32 {
        let mut free = self.free.lock();
        loop {
            if let Some(id) = free.pop_front() {
                return id;
            }
            self.available.wait(&mut free);
        }
    }

    /// Return an id to the pool, waking one blocked acquirer
    pub fn release(&self, call_id: i32) {
        let mut free = self.free.lock();
        debug_assert!(
            !free.contains(&call_id),
            "call id {} released twice",
            call_id
        );
        free.push_back(call_id);
        drop(free);
        self.available.notify_one();
    }

    /// Number of ids currently free
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let pool = CallIdPool::new(3);
        assert_eq!(pool.acquire(), 0);
        assert_eq!(pool.acquire(), 1);
        pool.release(0);
        assert_eq!(pool.acquire(), 2);
        // Recycled id comes back after the ids that were still free.
        assert_eq!(pool.acquire(), 0);
    }

    #[test]
    fn test_exhaustion_blocks_until_release() {
        let pool = Arc::new(CallIdPool::new(2));
        let a = pool.acquire();
        let _b = pool.acquire();
        assert_eq!(pool.free_count(), 0);

        let blocked = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        pool.release(a);
        assert_eq!(blocked.join().unwrap(), a);
    }

    #[test]
    fn test_concurrent_churn_conserves_ids() {
        let pool = Arc::new(CallIdPool::new(8));
        let mut handles = vec![];
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let id = pool.acquire();
                    pool.release(id);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.free_count(), 8);
    }
}
