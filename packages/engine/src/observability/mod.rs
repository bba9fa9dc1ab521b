// packages/engine/src/observability/mod.rs
//! Tracing initialization
//!
//! The parent process logs to stdout and `<log_dir>/<port>.log`. Worker
//! children redirect their stdout/stderr to `<log_dir>/<port>-<i>.log`
//! before initializing, so their subscriber only needs stdout. The
//! verbose flag drops the default filter from `info` to `debug`.

use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Initialize the parent-process subscriber.
///
/// Returns the appender guard; dropping it stops the background log
/// writer, so the caller must hold it for the life of the process.
pub fn init_tracing(config: &EngineConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;
    let appender = tracing_appender::rolling::never(
        &config.log_dir,
        format!("{}.log", config.server.port),
    );
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(default_filter(config.verbose_ipc_log))
        .with_writer(file_writer.and(std::io::stdout))
        .init();

    Ok(guard)
}

/// Initialize a worker-child subscriber writing to the (redirected) stdout.
pub fn init_worker_tracing(verbose: bool) {
    // The child forked before the parent installed its subscriber, so the
    // global default is still free here. Ignore a second initialization
    // (only possible in tests driving worker loops in-process).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter(verbose))
        .with_writer(std::io::stdout)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(default_filter(false).to_string(), "info");
        assert_eq!(default_filter(true).to_string(), "debug");
    }
}
