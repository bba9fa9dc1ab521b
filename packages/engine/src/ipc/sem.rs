// packages/engine/src/ipc/sem.rs
//! Named POSIX semaphores
//!
//! One available/ready pair per worker carries the command-slot
//! handshake between the front-end and each child process. The
//! semaphores are opened by the parent before forking; children inherit
//! the open handles. Only the creating process unlinks the names.

use crate::utils::errors::{EngineError, Result};
use std::ffi::CString;

/// A named POSIX semaphore shared across fork
pub struct PosixSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

// The underlying sem_t lives in the kernel / shared mapping; the handle
// itself is a stable pointer valid in every thread of the process.
unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl PosixSemaphore {
    /// Create a fresh semaphore with the given initial value.
    ///
    /// Any leftover object under the same name (e.g. from a crashed
    /// previous run) is unlinked first so the count starts clean.
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let cname = cstring(name)?;
        unsafe {
            libc::sem_unlink(cname.as_ptr());
            let sem = libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o666 as libc::c_uint,
                initial as libc::c_uint,
            );
            if sem == libc::SEM_FAILED {
                return Err(EngineError::Semaphore(format!(
                    "sem_open({}) failed: {}",
                    name,
                    std::io::Error::last_os_error()
                )));
            }
            Ok(Self {
                name: name.to_string(),
                sem,
            })
        }
    }

    /// Block until the semaphore can be decremented
    pub fn wait(&self) -> Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(EngineError::Semaphore(format!(
                "sem_wait({}) failed: {}",
                self.name, err
            )));
        }
    }

    /// Try to decrement without blocking; `Ok(false)` when the count is zero
    pub fn try_wait(&self) -> Result<bool> {
        let rc = unsafe { libc::sem_trywait(self.sem) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(EngineError::Semaphore(format!(
                "sem_trywait({}) failed: {}",
                self.name, err
            ))),
        }
    }

    /// Increment the semaphore, waking one waiter
    pub fn post(&self) -> Result<()> {
        let rc = unsafe { libc::sem_post(self.sem) };
        if rc != 0 {
            return Err(EngineError::Semaphore(format!(
                "sem_post({}) failed: {}",
                self.name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Remove the name from the system; ignores an already-missing name
    pub fn unlink(&self) {
        if let Ok(cname) = cstring(&self.name) {
            unsafe {
                libc::sem_unlink(cname.as_ptr());
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PosixSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

fn cstring(name: &str) -> Result<CString> {
    CString::new(name)
        .map_err(|_| EngineError::Semaphore(format!("semaphore name {:?} contains NUL", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn unique_name(tag: &str) -> String {
        format!("/apiary_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_post_then_wait() {
        let name = unique_name("post_wait");
        let sem = PosixSemaphore::create(&name, 0).unwrap();
        sem.post().unwrap();
        sem.wait().unwrap();
        assert!(!sem.try_wait().unwrap());
        sem.unlink();
    }

    #[test]
    fn test_initial_value() {
        let name = unique_name("initial");
        let sem = PosixSemaphore::create(&name, 2).unwrap();
        assert!(sem.try_wait().unwrap());
        assert!(sem.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());
        sem.unlink();
    }

    #[test]
    fn test_wait_crosses_threads() {
        let name = unique_name("threads");
        let sem = Arc::new(PosixSemaphore::create(&name, 0).unwrap());

        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.wait())
        };
        std::thread::sleep(Duration::from_millis(50));
        sem.post().unwrap();
        waiter.join().unwrap().unwrap();
        sem.unlink();
    }

    #[test]
    fn test_create_resets_stale_count() {
        let name = unique_name("stale");
        let old = PosixSemaphore::create(&name, 0).unwrap();
        old.post().unwrap();
        old.post().unwrap();
        drop(old);

        // Re-creating under the same name must not inherit the stale 2.
        let fresh = PosixSemaphore::create(&name, 0).unwrap();
        assert!(!fresh.try_wait().unwrap());
        fresh.unlink();
    }
}
