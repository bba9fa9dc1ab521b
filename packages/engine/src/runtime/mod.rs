// packages/engine/src/runtime/mod.rs
//! Agent execution runtime
//!
//! - **agent_host**: the opaque-agent seam supplied by the embedder
//! - **agent_pool**: per-worker map of resident agents
//! - **routing_table**: front-end agent-id → worker-id ownership map
//! - **task_registry**: outstanding `reply` tasks and their eviction
//! - **worker**: the shard command loop and per-function handlers
//! - **process_manager**: fork and teardown of the worker children
//! - **dispatch**: front-end dispatch over the shared-memory channel
//!
//! # Architecture
//!
//! ```text
//! RPC thread ──► Dispatcher ──► routing table ──► owning worker
//!                   │                                  │
//!                   │  call-id + args (shm)            │ ready sem
//!                   └──────────► IpcChannel ◄──────────┘
//!                                    │
//!                    completion sem  │  result (shm)
//!                                    ▼
//!                              get_result / task registry
//! ```

pub mod agent_host;
pub mod agent_pool;
pub mod dispatch;
pub mod process_manager;
pub mod routing_table;
pub mod task_registry;
pub mod worker;

pub use agent_host::{Agent, AgentHost, EchoHost};
pub use agent_pool::AgentPool;
pub use dispatch::{Dispatcher, Outcome};
pub use process_manager::WorkerProcessManager;
pub use routing_table::RoutingTable;
pub use task_registry::{Task, TaskRegistry};
pub use worker::{FunctionId, WorkerContext};
