// packages/engine/src/main.rs
//! Apiary Engine
//!
//! Multi-process agent execution server. Startup order matters: the
//! named IPC objects are created and the worker children forked before
//! any async runtime or extra threads exist, then the parent builds the
//! tokio runtime and serves the RPC façade.

use anyhow::Result;
use apiary_engine::observability;
use apiary_engine::rpc;
use apiary_engine::runtime::agent_host::{AgentHost, EchoHost};
use apiary_engine::runtime::dispatch::Dispatcher;
use apiary_engine::runtime::process_manager::WorkerProcessManager;
use apiary_engine::utils::config::EngineConfig;
use apiary_engine::IpcShared;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> Result<()> {
    let config = EngineConfig::load()?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    // Named IPC objects first, then the fork; children never return.
    let shared = Arc::new(IpcShared::create(config)?);
    let mut workers =
        WorkerProcessManager::spawn(&shared, || Arc::new(EchoHost) as Arc<dyn AgentHost>)?;

    // Parent-only from here on.
    let _log_guard = observability::init_tracing(&shared.config)?;
    info!(
        "starting apiary-engine v{} on {} with {} workers",
        apiary_engine::VERSION,
        addr,
        workers.child_pids().len()
    );

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&shared)));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(serve(addr, dispatcher));

    info!("shutting down worker pool");
    workers.shutdown();
    shared.teardown();

    match served {
        Ok(()) => {
            info!("server stopped gracefully");
            Ok(())
        }
        Err(err) => {
            error!("server error: {}", err);
            Err(err)
        }
    }
}

async fn serve(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let app = rpc::server::router(dispatcher);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    Ok(())
}
