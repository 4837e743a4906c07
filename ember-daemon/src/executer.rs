//! Per-connection command handling.

use std::path::PathBuf;
use std::process::Command as Process;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use ember_core::{AuthToken, DaemonContext};

use crate::activity::CommandTracker;
use crate::connector::Connection;
use crate::error::DaemonError;
use crate::lifecycle::{StopHandle, StopReason};
use crate::protocol::{Command, DaemonRequest, DaemonResponse};

/// Runs the commands arriving on one connection.
///
/// Implementations report every failure over the connection; nothing is
/// returned to, or panics into, the caller. Each command should hold
/// [`Connection::begin_command`] while it runs: an open connection between
/// commands does not hold off the idle timeout.
///
/// [`Connection::begin_command`]: crate::connector::Connection::begin_command
pub trait CommandExecuter: Send + Sync {
    fn execute(&self, connection: Connection);
}

/// Handles `status`, `stop` and `build` requests.
pub struct DaemonCommandExecuter {
    context: Arc<DaemonContext>,
    token: Arc<AuthToken>,
    stop: Arc<StopHandle>,
    tracker: Arc<CommandTracker>,
    started: Instant,
}

impl DaemonCommandExecuter {
    pub fn new(
        context: Arc<DaemonContext>,
        token: Arc<AuthToken>,
        stop: Arc<StopHandle>,
        tracker: Arc<CommandTracker>,
    ) -> Self {
        Self {
            context,
            token,
            stop,
            tracker,
            started: Instant::now(),
        }
    }

    fn handle(&self, command: Command) -> Result<Value, DaemonError> {
        match command {
            Command::Status => Ok(self.status()),
            Command::Stop => {
                self.stop.request_stop(StopReason::Requested);
                Ok(json!({ "stopping": true }))
            }
            Command::Build { program, args, cwd } => run_build(&program, &args, cwd),
        }
    }

    fn status(&self) -> Value {
        json!({
            "daemon_id": self.context.daemon_id().to_string(),
            "pid": self.context.pid(),
            "version": self.context.version(),
            "registry_dir": self.context.registry_dir().display().to_string(),
            "idle_timeout_ms": self.context.idle_timeout().map(|t| t.as_millis() as u64),
            "uptime_ms": self.started.elapsed().as_millis() as u64,
            "active_commands": self.tracker.in_flight(),
        })
    }
}

impl CommandExecuter for DaemonCommandExecuter {
    fn execute(&self, mut connection: Connection) {
        let peer = connection.peer();
        loop {
            let line = match connection.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(peer = %peer, error = %err, "connection read failed");
                    break;
                }
            };

            let request: DaemonRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(err) => {
                    if !reply(&mut connection, DaemonResponse::error(format!("invalid request: {err}"))) {
                        break;
                    }
                    continue;
                }
            };

            if !self.token.verify(&request.token) {
                tracing::warn!(peer = %peer, "rejected request with bad token");
                let _ = reply(&mut connection, DaemonResponse::error("unauthorized"));
                break;
            }

            let _command = connection.begin_command();
            let name = request.command.name();
            let is_stop = matches!(request.command, Command::Stop);
            tracing::debug!(peer = %peer, command = name, "handling command");
            let response = match self.handle(request.command) {
                Ok(data) => DaemonResponse::ok(data),
                Err(err) => {
                    tracing::warn!(peer = %peer, command = name, error = %err, "command failed");
                    DaemonResponse::error(err.to_string())
                }
            };
            if !reply(&mut connection, response) || is_stop {
                break;
            }
        }
    }
}

fn reply(connection: &mut Connection, response: DaemonResponse) -> bool {
    match connection.write_response(&response) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(peer = %connection.peer(), error = %err, "connection write failed");
            false
        }
    }
}

fn run_build(program: &str, args: &[String], cwd: Option<PathBuf>) -> Result<Value, DaemonError> {
    let mut process = Process::new(program);
    process.args(args);
    if let Some(dir) = &cwd {
        process.current_dir(dir);
    }
    let started = Instant::now();
    let output = process
        .output()
        .map_err(|err| DaemonError::CommandExecution(format!("failed to run {program}: {err}")))?;
    Ok(json!({
        "program": program,
        "exit_code": output.status.code(),
        "success": output.status.success(),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
        "duration_ms": started.elapsed().as_millis() as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_of_missing_program_is_a_command_error() {
        let err = run_build("ember-definitely-not-a-program", &[], None).unwrap_err();
        assert!(matches!(err, DaemonError::CommandExecution(_)), "got: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn build_captures_output_and_exit_code() {
        let result = run_build("sh", &["-c".to_string(), "echo hi; exit 3".to_string()], None).unwrap();
        assert_eq!(result["exit_code"], 3);
        assert_eq!(result["success"], false);
        assert_eq!(result["stdout"], "hi\n");
    }

    #[cfg(unix)]
    #[test]
    fn build_runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let result = run_build("pwd", &[], Some(dir.path().to_path_buf())).unwrap();
        let printed = result["stdout"].as_str().unwrap().trim().to_string();
        assert_eq!(PathBuf::from(printed).canonicalize().unwrap(), canonical);
    }
}
