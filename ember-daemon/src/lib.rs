//! Resident daemon: lifecycle coordinator, TCP connector, command executer
//! and the client side of the line protocol.

pub mod activity;
pub mod connector;
mod error;
pub mod executer;
pub mod lifecycle;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
pub mod services;

use std::path::Path;
use std::time::Duration;

use ember_core::registry::{probe, DaemonRegistry};
use ember_core::{DaemonContext, DaemonRegistryEntry};

pub use activity::{CommandGuard, CommandTracker};
pub use connector::{Connection, Connector, TcpConnector};
pub use error::DaemonError;
pub use executer::{CommandExecuter, DaemonCommandExecuter};
pub use lifecycle::{
    init_tracing, start_blocking, Daemon, DaemonState, StartParameters, StopHandle, StopReason,
    StopReport,
};
pub use protocol::{
    request_build, request_status, request_stop, send_request, Command, DaemonRequest,
    DaemonResponse,
};
pub use services::{register_daemon_services, CommandPool, ServiceOverrides};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Find a live daemon whose configuration matches `params`.
///
/// Entries are tried newest first; unreachable ones are skipped, not
/// removed.
pub fn discover(params: &StartParameters) -> Result<Option<DaemonRegistryEntry>, DaemonError> {
    let fingerprint = DaemonContext::builder(&params.registry_dir)
        .options(params.options.clone())
        .build()
        .fingerprint();
    let registry = DaemonRegistry::new(&params.registry_dir);
    let mut candidates = registry.find_compatible(&fingerprint)?;
    candidates.reverse();
    Ok(candidates
        .into_iter()
        .find(|entry| probe(entry, PROBE_TIMEOUT)))
}

/// Any live daemon advertised in `registry_dir`, newest first.
pub fn discover_any(registry_dir: &Path) -> Result<Option<DaemonRegistryEntry>, DaemonError> {
    let mut entries = DaemonRegistry::new(registry_dir).all()?;
    entries.reverse();
    Ok(entries.into_iter().find(|entry| probe(entry, PROBE_TIMEOUT)))
}
