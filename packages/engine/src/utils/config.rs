// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! All knobs come from environment variables with defaults, loaded once
//! at startup and normalized (worker-count clamping, minimum bounds)
//! before anything is forked. Two variable names are fixed by the
//! external interface contract rather than the engine's own prefix:
//! `AGENTSCOPE_MAX_CALL_ID` and `AGENTSCOPE_USE_CPP_LOGGER`.

use crate::utils::errors::{EngineError, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Bytes of header (occupied flag + length) in front of each small-object slot
pub const SMALL_SLOT_HEADER: usize = 8;

/// Bytes reserved in the command region for each worker
pub const CALL_SLOT_SIZE: usize = 1024;

/// Binary semaphores per System-V semaphore set
pub const SEM_SLOTS_PER_SET: usize = 10_000;

/// Listening address and identity of the front-end
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host (default: 127.0.0.1)
    pub host: String,

    /// Bind port; also keys every named IPC object (default: 8180)
    pub port: u16,

    /// Server identity reported by `server_info`
    pub server_id: String,
}

/// Worker pool and task registry sizing
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker child processes, clamped to available parallelism
    pub num_workers: usize,

    /// Upper bound on the task FIFO (default: 8192)
    pub max_tasks: usize,

    /// Tasks older than this are eligible for eviction (default: 7200)
    pub max_task_timeout_secs: u64,
}

/// Shared-memory channel sizing
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Bounded pool of call-ids; also the number of small-object slots
    /// and completion semaphore slots (default: 10000)
    pub max_call_id: usize,

    /// Payloads up to this many bytes use the pooled small-object slot;
    /// larger payloads go through a named segment (default: 1024)
    pub small_obj_size: usize,
}

impl IpcConfig {
    /// Full size of one small-object slot including its header, rounded
    /// up so every slot's header stays naturally aligned
    pub fn small_slot_size(&self) -> usize {
        (self.small_obj_size + SMALL_SLOT_HEADER).next_multiple_of(8)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub ipc: IpcConfig,

    /// Directory for the parent log (the `ftok` anchor) and per-worker logs
    pub log_dir: PathBuf,

    /// Verbose per-process IPC logging
    pub verbose_ipc_log: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8180,
                server_id: format!("engine-{}", uuid::Uuid::new_v4()),
            },
            runtime: RuntimeConfig {
                num_workers: 4,
                max_tasks: 8192,
                max_task_timeout_secs: 7200,
            },
            ipc: IpcConfig {
                max_call_id: 10_000,
                small_obj_size: 1024,
            },
            log_dir: PathBuf::from("./logs"),
            verbose_ipc_log: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to defaults
    pub fn load() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            server: ServerConfig {
                host: env_or("APIARY_HOST", defaults.server.host)?,
                port: env_or("APIARY_PORT", defaults.server.port)?,
                server_id: env_or("APIARY_SERVER_ID", defaults.server.server_id)?,
            },
            runtime: RuntimeConfig {
                num_workers: env_or("APIARY_NUM_WORKERS", defaults.runtime.num_workers)?,
                max_tasks: env_or("APIARY_MAX_TASKS", defaults.runtime.max_tasks)?,
                max_task_timeout_secs: env_or(
                    "APIARY_MAX_TASK_TIMEOUT_SECS",
                    defaults.runtime.max_task_timeout_secs,
                )?,
            },
            ipc: IpcConfig {
                max_call_id: env_or("AGENTSCOPE_MAX_CALL_ID", defaults.ipc.max_call_id)?,
                small_obj_size: env_or("APIARY_SMALL_OBJ_SIZE", defaults.ipc.small_obj_size)?,
            },
            log_dir: PathBuf::from(env_or(
                "APIARY_LOG_DIR",
                defaults.log_dir.display().to_string(),
            )?),
            verbose_ipc_log: std::env::var("AGENTSCOPE_USE_CPP_LOGGER")
                .map(|v| v == "True")
                .unwrap_or(false),
        };

        config.normalized()
    }

    /// Apply bounds: at least one worker, no more than the machine offers,
    /// and non-zero capacities everywhere
    pub fn normalized(mut self) -> Result<Self> {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.runtime.num_workers = self.runtime.num_workers.clamp(1, parallelism);
        self.runtime.max_tasks = self.runtime.max_tasks.max(1);
        self.runtime.max_task_timeout_secs = self.runtime.max_task_timeout_secs.max(1);

        if self.ipc.max_call_id == 0 {
            return Err(EngineError::Config("max_call_id must be non-zero".into()));
        }
        if self.ipc.small_obj_size == 0 {
            return Err(EngineError::Config(
                "small_obj_size must be non-zero".into(),
            ));
        }
        Ok(self)
    }

    /// Path of the parent log file, `<log_dir>/<port>.log`
    pub fn parent_log_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.server.port))
    }

    /// Path of one worker's log file, `<log_dir>/<port>-<i>.log`
    pub fn worker_log_path(&self, worker_id: usize) -> PathBuf {
        self.log_dir
            .join(format!("{}-{}.log", self.server.port, worker_id))
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| EngineError::Config(format!("invalid {}={:?}: {}", name, raw, e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.ipc.max_call_id, 10_000);
        assert_eq!(config.ipc.small_obj_size, 1024);
        assert_eq!(config.ipc.small_slot_size(), 1024 + SMALL_SLOT_HEADER);
        let odd = IpcConfig {
            max_call_id: 16,
            small_obj_size: 13,
        };
        assert_eq!(odd.small_slot_size() % 8, 0);
        assert!(odd.small_slot_size() >= 13 + SMALL_SLOT_HEADER);
        assert_eq!(config.runtime.max_tasks, 8192);
    }

    #[test]
    fn test_normalize_clamps_workers() {
        let mut config = EngineConfig::default();
        config.runtime.num_workers = 0;
        let config = config.normalized().unwrap();
        assert_eq!(config.runtime.num_workers, 1);

        let mut config = EngineConfig::default();
        config.runtime.num_workers = 1_000_000;
        let config = config.normalized().unwrap();
        let parallelism = std::thread::available_parallelism().unwrap().get();
        assert_eq!(config.runtime.num_workers, parallelism);
    }

    #[test]
    fn test_normalize_rejects_zero_capacities() {
        let mut config = EngineConfig::default();
        config.ipc.max_call_id = 0;
        assert!(config.normalized().is_err());
    }

    #[test]
    fn test_log_paths_embed_port() {
        let mut config = EngineConfig::default();
        config.server.port = 9005;
        assert!(config
            .parent_log_path()
            .to_string_lossy()
            .ends_with("9005.log"));
        assert!(config
            .worker_log_path(3)
            .to_string_lossy()
            .ends_with("9005-3.log"));
    }
}
