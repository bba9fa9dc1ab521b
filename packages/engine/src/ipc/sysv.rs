// packages/engine/src/ipc/sysv.rs
//! Per-call completion semaphores
//!
//! One binary semaphore per call-id, laid out as a handful of System-V
//! semaphore sets of `SEM_SLOTS_PER_SET` slots each. Call-id `c` lives
//! at set `c / SEM_SLOTS_PER_SET`, slot `c % SEM_SLOTS_PER_SET`.
//! `set_result` posts the slot exactly once; `get_result` waits on it.
//! Compared to a named POSIX semaphore per call this keeps allocation
//! out of the call path entirely.
//!
//! Sets are created by the parent (keyed via `ftok` on the parent log
//! file), survive fork, and are removed at parent teardown. The post is
//! the barrier that publishes the result payload to the reader.

use crate::utils::errors::{EngineError, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Dense array of completion semaphores addressed by call-id
pub struct CompletionSemaphores {
    sem_ids: Vec<libc::c_int>,
    slots_per_set: usize,
    capacity: usize,
}

impl CompletionSemaphores {
    /// Create (or re-open and zero) enough sets to cover `capacity`
    /// call-ids, keyed off `anchor` which must be an existing file.
    pub fn create(anchor: &Path, capacity: usize, slots_per_set: usize) -> Result<Self> {
        let canchor = CString::new(anchor.as_os_str().as_bytes())
            .map_err(|_| EngineError::Semaphore("ftok anchor path contains NUL".into()))?;

        let num_sets = capacity.div_ceil(slots_per_set);
        let mut sem_ids = Vec::with_capacity(num_sets);
        for set in 0..num_sets {
            let slots = slots_per_set.min(capacity - set * slots_per_set);
            // proj_id must be non-zero; offset by one.
            let key = unsafe { libc::ftok(canchor.as_ptr(), (set + 1) as libc::c_int) };
            if key == -1 {
                return Err(EngineError::Semaphore(format!(
                    "ftok({}, {}) failed: {}",
                    anchor.display(),
                    set + 1,
                    std::io::Error::last_os_error()
                )));
            }
            let sem_id =
                unsafe { libc::semget(key, slots as libc::c_int, libc::IPC_CREAT | 0o666) };
            if sem_id == -1 {
                return Err(EngineError::Semaphore(format!(
                    "semget(set {}) failed: {}",
                    set,
                    std::io::Error::last_os_error()
                )));
            }
            // A re-opened set may carry counts from a crashed run; zero it.
            let zeros = vec![0 as libc::c_ushort; slots];
            let rc = unsafe { libc::semctl(sem_id, 0, libc::SETALL, zeros.as_ptr()) };
            if rc == -1 {
                return Err(EngineError::Semaphore(format!(
                    "semctl(SETALL, set {}) failed: {}",
                    set,
                    std::io::Error::last_os_error()
                )));
            }
            sem_ids.push(sem_id);
        }

        Ok(Self {
            sem_ids,
            slots_per_set,
            capacity,
        })
    }

    fn locate(&self, call_id: i32) -> Result<(libc::c_int, u16)> {
        let idx = call_id as usize;
        if call_id < 0 || idx >= self.capacity {
            return Err(EngineError::Semaphore(format!(
                "call id {} outside completion range 0..{}",
                call_id, self.capacity
            )));
        }
        Ok((
            self.sem_ids[idx / self.slots_per_set],
            (idx % self.slots_per_set) as u16,
        ))
    }

    fn semop(&self, call_id: i32, delta: i16) -> Result<()> {
        let (sem_id, slot) = self.locate(call_id)?;
        let mut op = libc::sembuf {
            sem_num: slot,
            sem_op: delta,
            sem_flg: 0,
        };
        loop {
            let rc = unsafe { libc::semop(sem_id, &mut op, 1) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(EngineError::Semaphore(format!(
                "semop(call {}, {:+}) failed: {}",
                call_id, delta, err
            )));
        }
    }

    /// Post the completion slot for `call_id` (exactly once per exchange)
    pub fn post(&self, call_id: i32) -> Result<()> {
        self.semop(call_id, 1)
    }

    /// Block until the completion slot for `call_id` has been posted
    pub fn wait(&self, call_id: i32) -> Result<()> {
        self.semop(call_id, -1)
    }

    /// Remove every set from the system. Parent-teardown only.
    pub fn remove(&self) {
        for &sem_id in &self.sem_ids {
            unsafe {
                libc::semctl(sem_id, 0, libc::IPC_RMID);
            }
        }
    }

    pub fn set_count(&self) -> usize {
        self.sem_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_set_layout() {
        let anchor = tempfile::NamedTempFile::new().unwrap();
        let sems = CompletionSemaphores::create(anchor.path(), 25, 10).unwrap();
        assert_eq!(sems.set_count(), 3);
        sems.remove();
    }

    #[test]
    fn test_post_unblocks_waiter() {
        let anchor = tempfile::NamedTempFile::new().unwrap();
        let sems = Arc::new(CompletionSemaphores::create(anchor.path(), 16, 8).unwrap());

        // Slot 11 lives in the second set.
        let waiter = {
            let sems = Arc::clone(&sems);
            std::thread::spawn(move || sems.wait(11))
        };
        std::thread::sleep(Duration::from_millis(50));
        sems.post(11).unwrap();
        waiter.join().unwrap().unwrap();
        sems.remove();
    }

    #[test]
    fn test_out_of_range_rejected() {
        let anchor = tempfile::NamedTempFile::new().unwrap();
        let sems = CompletionSemaphores::create(anchor.path(), 4, 8).unwrap();
        assert!(sems.post(4).is_err());
        assert!(sems.post(-1).is_err());
        sems.remove();
    }

    #[test]
    fn test_recreate_zeroes_counts() {
        let anchor = tempfile::NamedTempFile::new().unwrap();
        let sems = CompletionSemaphores::create(anchor.path(), 8, 8).unwrap();
        sems.post(3).unwrap();

        // Same anchor reopens the same kernel set; creation must reset it.
        let fresh = Arc::new(CompletionSemaphores::create(anchor.path(), 8, 8).unwrap());
        let blocked = {
            let fresh = Arc::clone(&fresh);
            std::thread::spawn(move || fresh.wait(3))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());
        fresh.post(3).unwrap();
        blocked.join().unwrap().unwrap();
        fresh.remove();
    }
}
