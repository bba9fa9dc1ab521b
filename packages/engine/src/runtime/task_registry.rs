// packages/engine/src/runtime/task_registry.rs
//! Registry of outstanding `reply` tasks
//!
//! `reply` returns a placeholder immediately; the registry tracks the
//! in-flight work. Each task holds its eventual result behind a
//! mutex+condvar pair so `update_placeholder` can block until the
//! owning worker posts the callback result.
//!
//! Task ids are assigned monotonically in enqueue order and looked up
//! positionally: `task_id - front.task_id` indexes the FIFO. Eviction
//! is lazy: the next enqueuer try-locks the queue and pops *finished*
//! entries from the front while the FIFO is over `max_tasks` or the
//! front entry is older than `max_timeout_secs`. An unfinished head
//! stops the trim so a concurrent waiter is never dropped.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

struct TaskState {
    finished: bool,
    result: Vec<u8>,
}

/// One outstanding `reply`
pub struct Task {
    task_id: u64,
    state: Mutex<TaskState>,
    finished_cv: Condvar,
}

impl Task {
    fn new(task_id: u64) -> Self {
        Self {
            task_id,
            state: Mutex::new(TaskState {
                finished: false,
                result: Vec::new(),
            }),
            finished_cv: Condvar::new(),
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Store the result and wake every waiter. Called once, by the
    /// thread that collected the worker's callback result.
    pub fn complete(&self, result: Vec<u8>) {
        let mut state = self.state.lock();
        state.result = result;
        state.finished = true;
        drop(state);
        self.finished_cv.notify_all();
    }

    /// Block until `complete`, then return the stored bytes
    pub fn wait_result(&self) -> Vec<u8> {
        let mut state = self.state.lock();
        while !state.finished {
            self.finished_cv.wait(&mut state);
        }
        state.result.clone()
    }
}

struct TaskQueue {
    entries: VecDeque<(u64, Arc<Task>)>,
    next_task_id: u64,
}

/// Bounded FIFO of tasks with lazy age/size eviction
pub struct TaskRegistry {
    queue: Mutex<TaskQueue>,
    max_tasks: usize,
    max_timeout: Duration,
}

impl TaskRegistry {
    pub fn new(max_tasks: usize, max_timeout_secs: u64) -> Self {
        Self {
            queue: Mutex::new(TaskQueue {
                entries: VecDeque::new(),
                next_task_id: 0,
            }),
            max_tasks: max_tasks.max(1),
            max_timeout: Duration::from_secs(max_timeout_secs.max(1)),
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn trim_front(&self, queue: &mut TaskQueue, now: u64) {
        while let Some((enqueued_at, task)) = queue.entries.front() {
            let over_capacity = queue.entries.len() >= self.max_tasks;
            let expired = now.saturating_sub(*enqueued_at) > self.max_timeout.as_secs();
            if !(over_capacity || expired) {
                break;
            }
            if !task.is_finished() {
                break;
            }
            debug!(task_id = task.task_id(), "evicting finished task");
            queue.entries.pop_front();
        }
    }

    /// Register a new task. `collect` runs on a detached thread and its
    /// return value completes the task, unblocking any waiter.
    pub fn enqueue<F>(&self, collect: F) -> u64
    where
        F: FnOnce() -> Vec<u8> + Send + 'static,
    {
        let now = Self::now_secs();
        // Opportunistic trim; skipped when another caller holds the queue.
        if let Some(mut queue) = self.queue.try_lock() {
            self.trim_front(&mut queue, now);
        }

        let task = {
            let mut queue = self.queue.lock();
            let task = Arc::new(Task::new(queue.next_task_id));
            queue.next_task_id += 1;
            queue.entries.push_back((now, Arc::clone(&task)));
            task
        };

        let task_id = task.task_id();
        std::thread::spawn(move || {
            let result = collect();
            task.complete(result);
        });
        task_id
    }

    /// Block until the task finishes and return its bytes; `None` when
    /// the id was evicted or never assigned.
    pub fn wait_result(&self, task_id: u64) -> Option<Vec<u8>> {
        let task = {
            let queue = self.queue.lock();
            let front_id = queue.entries.front().map(|(_, t)| t.task_id())?;
            let idx = task_id.checked_sub(front_id)? as usize;
            let (_, task) = queue.entries.get(idx)?;
            Arc::clone(task)
        };
        Some(task.wait_result())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ids_are_monotonic() {
        let registry = TaskRegistry::new(16, 60);
        let a = registry.enqueue(|| b"a".to_vec());
        let b = registry.enqueue(|| b"b".to_vec());
        assert_eq!((a, b), (0, 1));
    }

    #[test]
    fn test_wait_returns_collected_result() {
        let registry = TaskRegistry::new(16, 60);
        let id = registry.enqueue(|| {
            std::thread::sleep(Duration::from_millis(30));
            b"late".to_vec()
        });
        assert_eq!(registry.wait_result(id).unwrap(), b"late");
    }

    #[test]
    fn test_unknown_id_is_none() {
        let registry = TaskRegistry::new(16, 60);
        assert!(registry.wait_result(5).is_none());
        registry.enqueue(|| vec![]);
        assert!(registry.wait_result(99).is_none());
    }

    #[test]
    fn test_size_eviction_drops_oldest() {
        let registry = TaskRegistry::new(2, 3600);
        let first = registry.enqueue(|| b"0".to_vec());
        registry.wait_result(first).unwrap();
        registry.enqueue(|| b"1".to_vec());

        // Third enqueue trims the finished head (len >= max_tasks).
        registry.enqueue(|| b"2".to_vec());
        assert!(registry.wait_result(first).is_none());
        assert!(registry.wait_result(1).is_some());
    }

    #[test]
    fn test_timeout_eviction() {
        let registry = TaskRegistry::new(1000, 1);
        let first = registry.enqueue(|| b"old".to_vec());
        registry.wait_result(first).unwrap();

        std::thread::sleep(Duration::from_secs(2));
        registry.enqueue(|| b"new".to_vec());
        assert!(registry.wait_result(first).is_none());
    }

    #[test]
    fn test_unfinished_head_blocks_trim() {
        let registry = TaskRegistry::new(1, 3600);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let first = registry.enqueue(move || {
            let _ = rx.recv();
            b"slow".to_vec()
        });

        // Over capacity, but the unfinished head must survive.
        registry.enqueue(|| b"fast".to_vec());
        assert_eq!(registry.len(), 2);

        tx.send(()).unwrap();
        assert_eq!(registry.wait_result(first).unwrap(), b"slow");
    }

    #[test]
    fn test_concurrent_waiters_all_wake() {
        let registry = Arc::new(TaskRegistry::new(16, 60));
        let id = registry.enqueue(|| {
            std::thread::sleep(Duration::from_millis(50));
            b"shared".to_vec()
        });

        let mut handles = vec![];
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || registry.wait_result(id)));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), b"shared");
        }
    }
}
