// packages/engine/src/lib.rs
//! Apiary Engine Library
//!
//! A multi-process agent execution server: stateful agents live in
//! forked worker shards behind a shared-memory command channel, fronted
//! by a thin RPC façade.
//!
//! # Architecture
//!
//! The engine is structured into these modules:
//!
//! - **ipc**: shared-memory segments, semaphores, and the call-id pool
//! - **runtime**: worker shards, front-end dispatch, and the task registry
//! - **rpc**: the HTTP façade and its wire frames
//! - **observability**: tracing setup for the parent and the workers
//! - **utils**: configuration and the engine error type

// Public module exports
pub mod ipc;
pub mod observability;
pub mod rpc;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use ipc::IpcShared;
pub use runtime::agent_host::{Agent, AgentHost, EchoHost};
pub use runtime::dispatch::Dispatcher;
pub use runtime::process_manager::WorkerProcessManager;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
