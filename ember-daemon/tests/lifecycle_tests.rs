//! Daemon lifecycle integration tests: bind failures, registry entries,
//! idle timeout, graceful stop and the line protocol.

use std::fs;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use assert_fs::prelude::*;
use ember_core::{AuthToken, DaemonRegistry, DaemonRegistryEntry, ServiceRegistry};
use ember_daemon::{
    discover, request_build, request_status, request_stop, CommandExecuter, Connection, Daemon,
    DaemonError, DaemonState, StartParameters, StopReason,
};
use predicates::prelude::predicate;

fn params(dir: &Path) -> StartParameters {
    let mut params = StartParameters::new(dir);
    params.idle_check_interval = Duration::from_millis(20);
    params.grace_period = Duration::from_secs(2);
    params
}

fn entries(dir: &Path) -> Vec<DaemonRegistryEntry> {
    DaemonRegistry::new(dir).all().expect("read registry")
}

fn only_entry(dir: &Path) -> DaemonRegistryEntry {
    let mut all = entries(dir);
    assert_eq!(all.len(), 1, "expected exactly one entry: {all:?}");
    all.remove(0)
}

fn file_names(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(read) => {
            let mut names: Vec<String> = read
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
        Err(_) => Vec::new(),
    }
}

/// Runs one command per connection that sleeps for a fixed time, counting
/// starts and finishes.
struct SleepingExecuter {
    sleep: Duration,
    started: mpsc::SyncSender<()>,
    finished: Arc<AtomicUsize>,
}

impl CommandExecuter for SleepingExecuter {
    fn execute(&self, connection: Connection) {
        let _command = connection.begin_command();
        let _ = self.started.try_send(());
        thread::sleep(self.sleep);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

fn sleeping(sleep: Duration) -> (Arc<SleepingExecuter>, mpsc::Receiver<()>, Arc<AtomicUsize>) {
    let (started, started_rx) = mpsc::sync_channel(8);
    let finished = Arc::new(AtomicUsize::new(0));
    let executer = Arc::new(SleepingExecuter {
        sleep,
        started,
        finished: finished.clone(),
    });
    (executer, started_rx, finished)
}

// ---------------------------------------------------------------------------
// 1. Startup and the registry entry
// ---------------------------------------------------------------------------

#[test]
fn bind_failure_stops_without_publishing() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let taken = TcpListener::bind("127.0.0.1:0").expect("bind");
    let mut params = params(dir.path());
    params.bind_address = taken.local_addr().unwrap();

    let mut daemon = Daemon::new(params);
    let err = daemon.start().unwrap_err();

    assert!(matches!(err, DaemonError::Bind { .. }), "got: {err}");
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert_eq!(
        daemon.transitions(),
        vec![
            DaemonState::Created,
            DaemonState::Starting,
            DaemonState::Stopping,
            DaemonState::Stopped
        ]
    );
    assert!(matches!(daemon.stop_reason(), Some(StopReason::BindFailed(_))));
    assert!(file_names(dir.path()).is_empty());
}

#[test]
fn entry_is_published_while_running_and_removed_on_stop() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut daemon = Daemon::new(params(dir.path()));
    let address = daemon.start().expect("start");
    assert_eq!(daemon.state(), DaemonState::Running);

    let entry = only_entry(dir.path());
    assert_eq!(entry.address, address);
    assert_eq!(entry.pid, Some(std::process::id()));
    let entry_file = format!("daemon-{}.yaml", entry.daemon_id.0.simple());
    assert_eq!(file_names(dir.path()), vec![entry_file.clone()]);
    dir.child(&entry_file)
        .assert(predicate::str::contains(address.to_string()));

    let report = daemon.stop().expect("stop");
    assert_eq!(report.reason, StopReason::Requested);
    assert_eq!(report.address, Some(address));
    assert!(report.shutdown_timeout.is_none());
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert!(file_names(dir.path()).is_empty(), "no other mutation expected");
}

#[test]
fn stop_leaves_other_daemons_entries_alone() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut first = Daemon::new(params(dir.path()));
    let mut second = Daemon::new(params(dir.path()));
    first.start().expect("start first");
    let second_address = second.start().expect("start second");
    assert_eq!(entries(dir.path()).len(), 2);

    first.stop().expect("stop first");
    assert_eq!(only_entry(dir.path()).address, second_address);
    second.stop().expect("stop second");
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn start_twice_is_rejected() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut daemon = Daemon::new(params(dir.path()));
    daemon.start().expect("start");
    let err = daemon.start().unwrap_err();
    assert!(
        matches!(err, DaemonError::InvalidState { actual: DaemonState::Running, .. }),
        "got: {err}"
    );
    daemon.stop().expect("stop");
}

#[test]
fn dropping_a_running_daemon_cleans_up() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    {
        let mut daemon = Daemon::new(params(dir.path()));
        daemon.start().expect("start");
        assert_eq!(entries(dir.path()).len(), 1);
    }
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn daemon_services_resolve_through_parent_registry() {
    struct BuildCache(&'static str);

    let dir = assert_fs::TempDir::new().expect("tempdir");
    let parent = Arc::new(ServiceRegistry::new("process"));
    parent
        .register_instance(Arc::new(BuildCache("shared")))
        .unwrap();

    let mut daemon = Daemon::new(params(dir.path())).with_parent(parent.clone());
    daemon.start().expect("start");
    let services = daemon.services().expect("running").clone();
    assert_eq!(services.get::<BuildCache>().unwrap().0, "shared");

    daemon.stop().expect("stop");
    assert!(services.is_closed());
    assert!(!parent.is_closed());
    assert!(parent.get::<BuildCache>().is_ok());
}

// ---------------------------------------------------------------------------
// 2. Idle timeout
// ---------------------------------------------------------------------------

#[test]
fn idle_timeout_zero_keeps_daemon_running() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut params = params(dir.path());
    params.idle_timeout_ms = Some(0);
    let mut daemon = Daemon::new(params);
    daemon.start().expect("start");
    let entry = only_entry(dir.path());

    for _ in 0..3 {
        request_status(&entry).expect("status");
        thread::sleep(Duration::from_millis(150));
        assert_eq!(daemon.state(), DaemonState::Running);
    }

    let report = daemon.stop().expect("stop");
    assert_eq!(report.reason, StopReason::Requested);
    assert!(!daemon.transitions().contains(&DaemonState::IdleTimedOut));
}

#[test]
fn idle_timeout_fires_only_after_quiet_period() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let idle = Duration::from_millis(600);
    let mut params = params(dir.path());
    params.idle_timeout_ms = Some(idle.as_millis() as i64);
    let mut daemon = Daemon::new(params);
    daemon.start().expect("start");
    let entry = only_entry(dir.path());

    thread::sleep(Duration::from_millis(300));
    request_status(&entry).expect("status");
    let last_activity = Instant::now();

    // 700ms after start but only 400ms after the last command
    thread::sleep(Duration::from_millis(400));
    assert_eq!(daemon.state(), DaemonState::Running);

    let report = daemon.wait().expect("wait");
    assert_eq!(report.reason, StopReason::IdleTimeout);
    assert!(last_activity.elapsed() >= idle);
    assert_eq!(
        daemon.transitions(),
        vec![
            DaemonState::Created,
            DaemonState::Starting,
            DaemonState::Running,
            DaemonState::IdleTimedOut,
            DaemonState::Stopping,
            DaemonState::Stopped
        ]
    );
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn idle_timeout_waits_for_running_command() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let (executer, started, finished) = sleeping(Duration::from_millis(500));
    let mut params = params(dir.path());
    params.idle_timeout_ms = Some(100);
    let mut daemon = Daemon::new(params).with_command_executer(executer);
    let address = daemon.start().expect("start");

    let _client = TcpStream::connect(address).expect("connect");
    started.recv_timeout(Duration::from_secs(2)).expect("command started");

    let report = daemon.wait().expect("wait");
    assert_eq!(report.reason, StopReason::IdleTimeout);
    assert_eq!(finished.load(Ordering::SeqCst), 1, "idle expiry must not cut a command short");
    assert!(report.shutdown_timeout.is_none());
}

#[test]
fn silent_connection_does_not_hold_off_idle_timeout() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut params = params(dir.path());
    params.idle_timeout_ms = Some(100);
    let mut daemon = Daemon::new(params);
    let address = daemon.start().expect("start");

    let _client = TcpStream::connect(address).expect("connect");
    let begun = Instant::now();
    let report = daemon.wait().expect("wait");

    assert_eq!(report.reason, StopReason::IdleTimeout);
    assert!(begun.elapsed() < Duration::from_secs(2), "took {:?}", begun.elapsed());
    assert!(report.shutdown_timeout.is_none(), "an idle client is not a running command");
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn status_counts_only_the_running_command() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut daemon = Daemon::new(params(dir.path()));
    let address = daemon.start().expect("start");
    let entry = only_entry(dir.path());

    let _silent = TcpStream::connect(address).expect("connect");
    let _another = TcpStream::connect(address).expect("connect");
    thread::sleep(Duration::from_millis(50));
    let status = request_status(&entry).expect("status");
    assert_eq!(status["active_commands"], 1);

    daemon.stop().expect("stop");
}

// ---------------------------------------------------------------------------
// 3. Graceful stop
// ---------------------------------------------------------------------------

#[test]
fn stop_waits_for_command_within_grace_period() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let (executer, started, finished) = sleeping(Duration::from_millis(300));
    let mut daemon = Daemon::new(params(dir.path())).with_command_executer(executer);
    let address = daemon.start().expect("start");

    let _client = TcpStream::connect(address).expect("connect");
    started.recv_timeout(Duration::from_secs(2)).expect("command started");

    let report = daemon.stop().expect("stop");
    assert!(report.shutdown_timeout.is_none());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn stop_abandons_command_that_outlives_grace_period() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let (executer, started, finished) = sleeping(Duration::from_secs(3));
    let mut params = params(dir.path());
    params.grace_period = Duration::from_millis(100);
    let mut daemon = Daemon::new(params).with_command_executer(executer);
    let address = daemon.start().expect("start");

    let _client = TcpStream::connect(address).expect("connect");
    started.recv_timeout(Duration::from_secs(2)).expect("command started");

    let begun = Instant::now();
    let report = daemon.stop().expect("stop");
    assert!(begun.elapsed() < Duration::from_secs(2), "stop must not wait for the command");
    match report.shutdown_timeout {
        Some(DaemonError::ShutdownTimeout { abandoned, grace }) => {
            assert_eq!(abandoned, 1);
            assert_eq!(grace, Duration::from_millis(100));
        }
        other => panic!("expected shutdown timeout, got {other:?}"),
    }
    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn stop_ends_silent_connections_without_waiting_for_grace() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut params = params(dir.path());
    params.grace_period = Duration::from_secs(5);
    let mut daemon = Daemon::new(params);
    let address = daemon.start().expect("start");

    let mut client = TcpStream::connect(address).expect("connect");
    thread::sleep(Duration::from_millis(50));

    let begun = Instant::now();
    let report = daemon.stop().expect("stop");
    assert!(begun.elapsed() < Duration::from_secs(2), "stop took {:?}", begun.elapsed());
    assert!(report.shutdown_timeout.is_none(), "got: {:?}", report.shutdown_timeout);

    // the daemon closed the connection
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");
    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).expect("read"), 0);
}

#[test]
fn stop_handle_works_from_another_thread() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut daemon = Daemon::new(params(dir.path()));
    daemon.start().expect("start");
    let handle = daemon.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.request_stop(StopReason::Signal);
    });
    let report = daemon.wait().expect("wait");
    stopper.join().unwrap();
    assert_eq!(report.reason, StopReason::Signal);
}

// ---------------------------------------------------------------------------
// 4. Protocol
// ---------------------------------------------------------------------------

#[test]
fn status_reports_daemon_identity() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut daemon = Daemon::new(params(dir.path()));
    daemon.start().expect("start");
    let entry = only_entry(dir.path());

    let status = request_status(&entry).expect("status");
    assert_eq!(status["daemon_id"], entry.daemon_id.to_string());
    assert_eq!(status["pid"], std::process::id());
    assert_eq!(status["idle_timeout_ms"], 3 * 60 * 60 * 1000);

    daemon.stop().expect("stop");
}

#[test]
fn wrong_token_is_rejected() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut daemon = Daemon::new(params(dir.path()));
    daemon.start().expect("start");
    let mut entry = only_entry(dir.path());
    entry.token = AuthToken::from("not-the-token");

    let err = request_status(&entry).unwrap_err();
    assert!(err.to_string().contains("unauthorized"), "got: {err}");
    assert_eq!(daemon.state(), DaemonState::Running);
    daemon.stop().expect("stop");
}

#[test]
fn stop_command_ends_the_daemon() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut daemon = Daemon::new(params(dir.path()));
    daemon.start().expect("start");
    let entry = only_entry(dir.path());

    request_stop(&entry).expect("stop request");
    let report = daemon.wait().expect("wait");
    assert_eq!(report.reason, StopReason::Requested);
    assert!(entries(dir.path()).is_empty());

    let err = request_status(&entry).unwrap_err();
    assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
}

#[cfg(unix)]
#[test]
fn build_runs_program_and_returns_output() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let mut daemon = Daemon::new(params(dir.path()));
    daemon.start().expect("start");
    let entry = only_entry(dir.path());

    let result = request_build(
        &entry,
        "sh",
        vec!["-c".to_string(), "echo built".to_string()],
        None,
    )
    .expect("build");
    assert_eq!(result["success"], true);
    assert_eq!(result["stdout"], "built\n");

    let err = request_build(&entry, "ember-no-such-tool", vec![], None).unwrap_err();
    assert!(err.to_string().contains("ember-no-such-tool"), "got: {err}");
    assert_eq!(daemon.state(), DaemonState::Running, "command errors stay with the client");

    daemon.stop().expect("stop");
}

#[test]
fn discover_finds_compatible_live_daemon() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let params = params(dir.path());
    assert!(discover(&params).expect("discover").is_none());

    let mut daemon = Daemon::new(params.clone());
    let address: SocketAddr = daemon.start().expect("start");
    let found = discover(&params).expect("discover").expect("found");
    assert_eq!(found.address, address);

    let mut other = params.clone();
    other.options.insert("profile".to_string(), "release".to_string());
    assert!(discover(&other).expect("discover").is_none());

    daemon.stop().expect("stop");
}
