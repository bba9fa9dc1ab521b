// packages/engine/src/rpc/mod.rs
//! RPC surface
//!
//! - **messages**: shared-memory frames and HTTP body types
//! - **server**: the axum façade mapping service methods to dispatch

pub mod messages;
pub mod server;

pub use messages::GeneralResponse;
pub use server::router;
