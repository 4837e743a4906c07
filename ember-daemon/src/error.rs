use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::DaemonState;

/// Error surface for the daemon lifecycle, connector, protocol and clients.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("service wiring error: {0}")]
    Service(#[from] ember_core::ServiceError),

    #[error("daemon registry error: {0}")]
    Registry(#[from] ember_core::RegistryError),

    #[error("executor error: {0}")]
    Executor(#[from] ember_core::ExecutorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connector could not acquire its endpoint.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon is {actual:?}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: DaemonState,
    },

    /// In-flight commands outlived the stop grace period and were abandoned.
    #[error("{abandoned} command(s) still running after the {grace:?} grace period; abandoned")]
    ShutdownTimeout { abandoned: usize, grace: Duration },

    /// A single command failed; reported to its client only.
    #[error("command failed: {0}")]
    CommandExecution(String),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("no compatible daemon is running (registry: {registry_dir})")]
    DaemonNotRunning { registry_dir: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
