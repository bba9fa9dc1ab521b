// packages/engine/src/runtime/process_manager.rs
//! Worker process lifecycle
//!
//! Forks one child per worker shard at startup. Children inherit every
//! named IPC handle through fork, enter the command loop, and never
//! return. Teardown runs only in the parent: SIGINT each child, reap
//! it, then let `IpcShared::teardown` unlink the named objects.

use crate::ipc::IpcShared;
use crate::runtime::agent_host::AgentHost;
use crate::runtime::worker;
use crate::utils::errors::{EngineError, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::sync::Arc;
use tracing::{info, warn};

/// Parent-side handle on the forked worker pool
pub struct WorkerProcessManager {
    children: Vec<Pid>,
    main_pid: Pid,
}

impl WorkerProcessManager {
    /// Fork `num_workers` children. Each child builds its host through
    /// `host_factory` *after* the fork (host runtimes rarely survive
    /// forking) and enters the command loop.
    ///
    /// Must be called before any async runtime or extra threads exist:
    /// fork only carries the calling thread into the child.
    pub fn spawn<F>(shared: &Arc<IpcShared>, host_factory: F) -> Result<Self>
    where
        F: Fn() -> Arc<dyn AgentHost>,
    {
        let main_pid = getpid();
        let num_workers = shared.config.runtime.num_workers;
        let mut children = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => children.push(child),
                Ok(ForkResult::Child) => {
                    worker::child_main(worker_id, Arc::clone(shared), host_factory(), main_pid)
                }
                Err(errno) => {
                    // Children forked so far are reaped by the caller's
                    // teardown path.
                    return Err(EngineError::Process(format!(
                        "fork of worker {} failed: {}",
                        worker_id, errno
                    )));
                }
            }
        }

        Ok(Self { children, main_pid })
    }

    /// A manager with no children, for in-process worker threads
    pub fn without_children() -> Self {
        Self {
            children: Vec::new(),
            main_pid: getpid(),
        }
    }

    /// True in the process that forked the pool
    pub fn is_main(&self) -> bool {
        getpid() == self.main_pid
    }

    pub fn child_pids(&self) -> &[Pid] {
        &self.children
    }

    /// Interrupt and reap every child. Parent-only; no-op elsewhere.
    pub fn shutdown(&mut self) {
        if !self.is_main() {
            return;
        }
        for &child in &self.children {
            if let Err(errno) = kill(child, Signal::SIGINT) {
                warn!("SIGINT to worker {} failed: {}", child, errno);
            }
        }
        for &child in &self.children {
            match waitpid(child, None) {
                Ok(status) => info!("worker {} exited: {:?}", child, status),
                Err(errno) => warn!("waitpid({}) failed: {}", child, errno),
            }
        }
        self.children.clear();
    }
}

impl Drop for WorkerProcessManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_manager_is_main() {
        let mut manager = WorkerProcessManager::without_children();
        assert!(manager.is_main());
        assert!(manager.child_pids().is_empty());
        // Shutdown with no children is a no-op.
        manager.shutdown();
    }
}
