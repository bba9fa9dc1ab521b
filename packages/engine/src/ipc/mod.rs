// packages/engine/src/ipc/mod.rs
//! Shared-memory IPC between the front-end and worker shards
//!
//! - **shm**: command region, small-object pool, named payload segments
//! - **sem**: named POSIX semaphores (per-worker available/ready pair)
//! - **sysv**: System-V completion semaphore sets addressed by call-id
//! - **call_id**: bounded FIFO pool of call-ids
//!
//! `IpcShared` owns every named object and is created by the parent in
//! startup order before forking; children inherit the open handles.

pub mod call_id;
pub mod sem;
pub mod shm;
pub mod sysv;

use crate::utils::config::{EngineConfig, SEM_SLOTS_PER_SET};
use crate::utils::errors::Result;
use call_id::CallIdPool;
use sem::PosixSemaphore;
use shm::{CommandBoard, PayloadKind, PayloadStore};
use sysv::CompletionSemaphores;
use tracing::debug;

pub use shm::unlink_segment;

/// Handshake semaphores for one worker shard
pub struct WorkerLink {
    /// Posted by the worker when its command slot may be written
    pub available: PosixSemaphore,

    /// Posted by the front-end when a command has been written
    pub ready: PosixSemaphore,
}

/// The per-call exchange machinery: payload tiers, completion
/// semaphores, and the bounded id pool.
pub struct IpcChannel {
    payloads: PayloadStore,
    completion: CompletionSemaphores,
    call_ids: CallIdPool,
}

impl IpcChannel {
    /// Take a call-id, blocking while all `max_call_id` are in flight
    pub fn alloc_call_id(&self) -> i32 {
        self.call_ids.acquire()
    }

    /// Write the argument payload for a call
    pub fn set_args(&self, call_id: i32, payload: &[u8]) -> Result<()> {
        self.payloads.write(PayloadKind::Args, call_id, payload)
    }

    /// Read and consume the argument payload for a call
    pub fn get_args(&self, call_id: i32) -> Result<Vec<u8>> {
        self.payloads.read(PayloadKind::Args, call_id)
    }

    /// Publish the result payload and post the completion semaphore.
    /// Exactly one `set_result` per allocated call-id.
    pub fn set_result(&self, call_id: i32, payload: &[u8]) -> Result<()> {
        self.payloads.write(PayloadKind::Result, call_id, payload)?;
        self.completion.post(call_id)
    }

    /// Block for the result of a call, then recycle its id.
    /// Exactly one `get_result` per allocated call-id.
    pub fn get_result(&self, call_id: i32) -> Result<Vec<u8>> {
        self.completion.wait(call_id)?;
        let payload = self.payloads.read(PayloadKind::Result, call_id);
        self.call_ids.release(call_id);
        payload
    }

    pub fn free_call_ids(&self) -> usize {
        self.call_ids.free_count()
    }
}

/// Every named IPC object of one server, created by the parent in
/// startup order and inherited across fork.
pub struct IpcShared {
    pub config: EngineConfig,
    pub board: CommandBoard,
    pub channel: IpcChannel,
    pub links: Vec<WorkerLink>,
    creator_pid: u32,
}

impl IpcShared {
    /// Parent startup: log directory, `ftok` anchor, command region,
    /// small-object pool, call-id pool, completion sets, then the
    /// per-worker semaphore pairs.
    pub fn create(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;
        let anchor = config.parent_log_path();
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&anchor)?;

        let port = config.server.port;
        let num_workers = config.runtime.num_workers;

        let board = CommandBoard::create(port, num_workers)?;
        let payloads = PayloadStore::create(port, &config.ipc)?;
        let call_ids = CallIdPool::new(config.ipc.max_call_id);
        let completion =
            CompletionSemaphores::create(&anchor, config.ipc.max_call_id, SEM_SLOTS_PER_SET)?;

        let mut links = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            links.push(WorkerLink {
                available: PosixSemaphore::create(&format!("/avail_{}_{}", port, worker_id), 0)?,
                ready: PosixSemaphore::create(&format!("/func_{}_{}", port, worker_id), 0)?,
            });
        }

        Ok(Self {
            config,
            board,
            channel: IpcChannel {
                payloads,
                completion,
                call_ids,
            },
            links,
            creator_pid: std::process::id(),
        })
    }

    /// True only in the process that created the named objects
    pub fn is_creator(&self) -> bool {
        std::process::id() == self.creator_pid
    }

    /// Unlink every named object and remove the semaphore sets,
    /// including possibly-dangling per-call segments. No-op outside the
    /// creating process: children must never unlink shared names.
    pub fn teardown(&self) {
        if !self.is_creator() {
            return;
        }
        debug!("tearing down named IPC objects");
        self.board.unlink();
        for link in &self.links {
            link.available.unlink();
            link.ready.unlink();
        }
        self.channel.completion.remove();
        for call_id in 0..self.config.ipc.max_call_id as i32 {
            unlink_segment(&self.channel.payloads.segment_name(PayloadKind::Args, call_id));
            unlink_segment(
                &self
                    .channel
                    .payloads
                    .segment_name(PayloadKind::Result, call_id),
            );
        }
        self.channel.payloads.unlink();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::config::{IpcConfig, RuntimeConfig};
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;

    pub(crate) fn test_config(num_workers: usize) -> EngineConfig {
        static NEXT: AtomicU16 = AtomicU16::new(0);
        let port = 46_000
            + (std::process::id() % 5_000) as u16
            + NEXT.fetch_add(3, Ordering::Relaxed);

        let mut config = EngineConfig::default();
        config.server.port = port;
        config.server.host = "127.0.0.1".into();
        config.runtime = RuntimeConfig {
            num_workers,
            max_tasks: 64,
            max_task_timeout_secs: 60,
        };
        config.ipc = IpcConfig {
            max_call_id: 32,
            small_obj_size: 64,
        };
        config.log_dir = std::env::temp_dir().join(format!("apiary-test-{}", port));
        config
    }

    #[test]
    fn test_set_then_get_result_recycles_id() {
        let shared = IpcShared::create(test_config(1)).unwrap();
        let id = shared.channel.alloc_call_id();
        assert_eq!(shared.channel.free_call_ids(), 31);

        shared.channel.set_result(id, b"done").unwrap();
        assert_eq!(shared.channel.get_result(id).unwrap(), b"done");
        assert_eq!(shared.channel.free_call_ids(), 32);
        shared.teardown();
    }

    #[test]
    fn test_get_result_blocks_until_set() {
        let shared = Arc::new(IpcShared::create(test_config(1)).unwrap());
        let id = shared.channel.alloc_call_id();

        let waiter = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || shared.channel.get_result(id).unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());

        let big = vec![9u8; 500]; // past small_obj_size, named-segment path
        shared.channel.set_result(id, &big).unwrap();
        assert_eq!(waiter.join().unwrap(), big);
        shared.teardown();
    }

    #[test]
    fn test_args_do_not_recycle_id() {
        let shared = IpcShared::create(test_config(1)).unwrap();
        let id = shared.channel.alloc_call_id();
        shared.channel.set_args(id, b"payload").unwrap();
        assert_eq!(shared.channel.get_args(id).unwrap(), b"payload");
        assert_eq!(shared.channel.free_call_ids(), 31);
        shared.teardown();
    }
}
