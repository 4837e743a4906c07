use std::path::{Path, PathBuf};
use std::time::Duration;

use ember_core::registry::ember_root_at;

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";

pub const DEFAULT_BIND: &str = "127.0.0.1:0";
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub fn logs_dir(home: &Path) -> PathBuf {
    ember_root_at(home).join("logs")
}

pub fn stdout_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(DAEMON_STDERR_LOG)
}
