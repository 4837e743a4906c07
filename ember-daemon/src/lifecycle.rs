//! Daemon lifecycle: wire services, bind, serve, watch for idleness, stop.
//!
//! The thread that calls [`Daemon::start`] owns the lifecycle. Pool threads
//! only ever *request* a stop through a [`StopHandle`]; the teardown itself
//! runs on the owning thread inside [`Daemon::wait`].

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use ember_core::{
    AuthToken, ConcurrencyPolicy, DaemonContext, DaemonId, DaemonRegistry, DaemonRegistryEntry,
    ExecutorError, ExecutorFactory, ExecutorPool, IdleTimeout, ServiceRegistry,
};

use crate::activity::CommandTracker;
use crate::connector::Connector;
use crate::error::DaemonError;
use crate::log_rotation::DaemonLogFiles;
use crate::executer::CommandExecuter;
use crate::paths::{DEFAULT_GRACE_PERIOD, DEFAULT_IDLE_CHECK_INTERVAL};
use crate::services::{register_daemon_services, CommandPool, ServiceOverrides};

pub const DAEMON_SCOPE: &str = "daemon";
pub const ACCEPT_POOL: &str = "daemon-accept";
pub const TIMER_POOL: &str = "daemon-timer";

const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(5);

/// Read once when the daemon starts.
#[derive(Debug, Clone)]
pub struct StartParameters {
    pub registry_dir: PathBuf,
    /// Milliseconds; unset → 3 hours, zero or negative → never.
    pub idle_timeout_ms: Option<i64>,
    pub bind_address: SocketAddr,
    pub grace_period: Duration,
    pub idle_check_interval: Duration,
    pub options: BTreeMap<String, String>,
    /// Directory holding `daemon.log`/`daemon-err.log`; rotated when set.
    pub log_dir: Option<PathBuf>,
    /// Stop on Ctrl-C / SIGTERM.
    pub handle_signals: bool,
}

impl StartParameters {
    pub fn new(registry_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry_dir: registry_dir.into(),
            idle_timeout_ms: None,
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            grace_period: DEFAULT_GRACE_PERIOD,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            options: BTreeMap::new(),
            log_dir: None,
            handle_signals: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Created,
    Starting,
    Running,
    IdleTimedOut,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    IdleTimeout,
    Signal,
    BindFailed(String),
    StartupFailed(String),
    AcceptFailed(String),
}

/// Outcome of one daemon run.
#[derive(Debug)]
pub struct StopReport {
    pub reason: StopReason,
    pub address: Option<SocketAddr>,
    /// Set when in-flight commands outlived the grace period.
    pub shutdown_timeout: Option<DaemonError>,
}

/// Cloneable handle for requesting a stop from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: mpsc::UnboundedSender<StopReason>,
}

impl StopHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StopReason>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn request_stop(&self, reason: StopReason) {
        tracing::debug!(?reason, "stop requested");
        if self.sender.send(reason).is_err() {
            tracing::debug!("daemon already stopped");
        }
    }
}

/// Current state plus every state entered so far.
#[derive(Debug)]
struct StateTracker {
    history: Mutex<Vec<DaemonState>>,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            history: Mutex::new(vec![DaemonState::Created]),
        }
    }

    fn current(&self) -> DaemonState {
        lock(&self.history)
            .last()
            .copied()
            .unwrap_or(DaemonState::Created)
    }

    fn history(&self) -> Vec<DaemonState> {
        lock(&self.history).clone()
    }

    fn enter(&self, state: DaemonState) {
        let mut history = lock(&self.history);
        if history.last() != Some(&state) {
            tracing::debug!(?state, "daemon state changed");
            history.push(state);
        }
    }

    /// Move `from → to` only if currently in `from`.
    fn advance(&self, from: DaemonState, to: DaemonState) -> bool {
        let mut history = lock(&self.history);
        if history.last() == Some(&from) {
            tracing::debug!(state = ?to, "daemon state changed");
            history.push(to);
            true
        } else {
            false
        }
    }
}

/// Whatever `start` managed to set up, so a partial start tears down cleanly.
struct Session {
    services: Arc<ServiceRegistry>,
    connector: Option<Arc<dyn Connector>>,
    commands: Option<Arc<ExecutorPool>>,
    registry: Option<Arc<DaemonRegistry>>,
    published: Option<DaemonId>,
    address: Option<SocketAddr>,
}

impl Session {
    fn new(services: Arc<ServiceRegistry>) -> Self {
        Self {
            services,
            connector: None,
            commands: None,
            registry: None,
            published: None,
            address: None,
        }
    }
}

/// One daemon process's lifecycle.
pub struct Daemon {
    params: StartParameters,
    parent: Option<Arc<ServiceRegistry>>,
    overrides: ServiceOverrides,
    states: Arc<StateTracker>,
    stop: StopHandle,
    stop_rx: mpsc::UnboundedReceiver<StopReason>,
    session: Option<Session>,
    stop_reason: Option<StopReason>,
}

impl Daemon {
    pub fn new(params: StartParameters) -> Self {
        let (stop, stop_rx) = StopHandle::channel();
        Self {
            params,
            parent: None,
            overrides: ServiceOverrides::default(),
            states: Arc::new(StateTracker::new()),
            stop,
            stop_rx,
            session: None,
            stop_reason: None,
        }
    }

    /// Resolve services missing from the daemon scope through `parent`.
    pub fn with_parent(mut self, parent: Arc<ServiceRegistry>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.overrides.connector = Some(connector);
        self
    }

    pub fn with_command_executer(mut self, executer: Arc<dyn CommandExecuter>) -> Self {
        self.overrides.command_executer = Some(executer);
        self
    }

    pub fn params(&self) -> &StartParameters {
        &self.params
    }

    pub fn state(&self) -> DaemonState {
        self.states.current()
    }

    /// Every state entered so far, oldest first.
    pub fn transitions(&self) -> Vec<DaemonState> {
        self.states.history()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Bound address while running.
    pub fn address(&self) -> Option<SocketAddr> {
        self.session.as_ref().and_then(|s| s.address)
    }

    /// Why the daemon stopped, once it has.
    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    /// The daemon-scope service registry while running.
    pub fn services(&self) -> Option<&Arc<ServiceRegistry>> {
        self.session.as_ref().map(|s| &s.services)
    }

    /// Wire services, bind, publish the registry entry and start serving.
    ///
    /// On any failure the daemon ends up `Stopped` with nothing published.
    pub fn start(&mut self) -> Result<SocketAddr, DaemonError> {
        let current = self.state();
        if current != DaemonState::Created {
            return Err(DaemonError::InvalidState {
                expected: "created",
                actual: current,
            });
        }
        self.states.enter(DaemonState::Starting);

        let services = match &self.parent {
            Some(parent) => parent.create_child(DAEMON_SCOPE),
            None => Arc::new(ServiceRegistry::new(DAEMON_SCOPE)),
        };
        let mut session = Session::new(services);

        match self.boot(&mut session) {
            Ok(address) => {
                self.states.enter(DaemonState::Running);
                tracing::info!(address = %address, registry_dir = %self.params.registry_dir.display(), "daemon running");
                self.session = Some(session);
                Ok(address)
            }
            Err(err) => {
                let reason = match &err {
                    DaemonError::Bind { .. } => StopReason::BindFailed(err.to_string()),
                    other => StopReason::StartupFailed(other.to_string()),
                };
                tracing::error!(error = %err, "daemon failed to start");
                let (_, teardown) = self.teardown(session, reason);
                if let Some(teardown_err) = teardown {
                    tracing::warn!(error = %teardown_err, "cleanup after failed start reported an error");
                }
                Err(err)
            }
        }
    }

    fn boot(&self, session: &mut Session) -> Result<SocketAddr, DaemonError> {
        let services = Arc::clone(&session.services);
        register_daemon_services(&services, &self.params, self.stop.clone(), self.overrides.clone())?;
        services.validate()?;

        // Created first so its pools are released last.
        let executors = services.get::<ExecutorFactory>()?;
        let context = services.get::<DaemonContext>()?;
        let idle = services.get::<IdleTimeout>()?;
        let tracker = services.get::<CommandTracker>()?;
        let registry = services.get::<DaemonRegistry>()?;
        let token = services.get::<AuthToken>()?;
        let commands = services.get::<CommandPool>()?.0.clone();
        session.commands = Some(Arc::clone(&commands));
        let connector = services.get::<dyn Connector>()?;
        session.connector = Some(Arc::clone(&connector));
        let executer = services.get::<dyn CommandExecuter>()?;

        let address = connector.bind()?;
        session.address = Some(address);

        let accept = executors.new_pool(ACCEPT_POOL, ConcurrencyPolicy::Single)?;
        {
            let connector = Arc::clone(&connector);
            let commands = Arc::clone(&commands);
            let tracker = Arc::clone(&tracker);
            let stop = self.stop.clone();
            accept.execute(move || accept_loop(connector, executer, commands, tracker, stop))?;
        }

        let timer = executors.new_pool(TIMER_POOL, ConcurrencyPolicy::Single)?;
        timer.spawn(watch_idle(IdleWatch {
            idle,
            tracker,
            states: Arc::clone(&self.states),
            stop: self.stop.clone(),
            check_every: self.params.idle_check_interval,
            log_dir: self.params.log_dir.clone(),
        }))?;
        if self.params.handle_signals {
            timer.spawn(forward_signals(self.stop.clone()))?;
        }

        let entry = DaemonRegistryEntry {
            daemon_id: context.daemon_id(),
            address,
            fingerprint: context.fingerprint(),
            registry_dir: context.registry_dir().to_path_buf(),
            pid: context.pid(),
            token: (*token).clone(),
            started_at: Utc::now(),
        };
        registry.store(&entry)?;
        session.registry = Some(registry);
        session.published = Some(entry.daemon_id);
        tracing::info!(daemon_id = %entry.daemon_id, fingerprint = %entry.fingerprint, "published daemon registry entry");

        Ok(address)
    }

    /// Block until a stop is requested (explicitly, by a signal or by the
    /// idle watcher), then tear down on this thread.
    ///
    /// In-flight commands that outlive the grace period are reported in
    /// [`StopReport::shutdown_timeout`]; other teardown failures are returned
    /// as the error after every teardown step has been attempted.
    pub fn wait(&mut self) -> Result<StopReport, DaemonError> {
        let Some(session) = self.session.take() else {
            return Err(DaemonError::InvalidState {
                expected: "running",
                actual: self.state(),
            });
        };
        let reason = self
            .stop_rx
            .blocking_recv()
            .unwrap_or(StopReason::Requested);
        let address = session.address;
        let (shutdown_timeout, teardown_error) = self.teardown(session, reason.clone());
        match teardown_error {
            Some(err) => Err(err),
            None => Ok(StopReport {
                reason,
                address,
                shutdown_timeout,
            }),
        }
    }

    /// Request a stop and wait for the teardown.
    pub fn stop(&mut self) -> Result<StopReport, DaemonError> {
        self.stop.request_stop(StopReason::Requested);
        self.wait()
    }

    /// Start, then wait for the daemon to stop.
    pub fn run(mut self) -> Result<StopReport, DaemonError> {
        self.start()?;
        self.wait()
    }

    /// Returns the grace-period overrun (if any) and the first other
    /// teardown failure.
    fn teardown(&mut self, session: Session, reason: StopReason) -> (Option<DaemonError>, Option<DaemonError>) {
        if reason == StopReason::IdleTimeout {
            self.states.advance(DaemonState::Running, DaemonState::IdleTimedOut);
        }
        self.states.enter(DaemonState::Stopping);
        tracing::info!(?reason, "daemon stopping");

        let mut shutdown_timeout = None;
        let mut first_error: Option<DaemonError> = None;

        if let Some(connector) = &session.connector {
            connector.close();
        }

        if let Some(commands) = &session.commands {
            match commands.shutdown() {
                Ok(()) => {}
                Err(ExecutorError::Abandoned { abandoned, .. }) => {
                    let err = DaemonError::ShutdownTimeout {
                        abandoned,
                        grace: self.params.grace_period,
                    };
                    tracing::warn!(error = %err, "abandoning in-flight commands");
                    shutdown_timeout = Some(err);
                }
                Err(err) => {
                    first_error.get_or_insert(err.into());
                }
            }
        }

        if let (Some(registry), Some(daemon_id)) = (&session.registry, session.published) {
            match registry.remove_daemon(&daemon_id) {
                Ok(_) => tracing::debug!(daemon_id = %daemon_id, "removed daemon registry entry"),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to remove daemon registry entry");
                    first_error.get_or_insert(err.into());
                }
            }
        }

        if let Err(err) = session.services.close() {
            first_error.get_or_insert(err.into());
        }

        self.states.enter(DaemonState::Stopped);
        tracing::info!(?reason, "daemon stopped");
        self.stop_reason = Some(reason);
        (shutdown_timeout, first_error)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let (_, err) = self.teardown(session, StopReason::Requested);
            if let Some(err) = err {
                tracing::warn!(error = %err, "daemon teardown on drop failed");
            }
        }
    }
}

fn accept_loop(
    connector: Arc<dyn Connector>,
    executer: Arc<dyn CommandExecuter>,
    commands: Arc<ExecutorPool>,
    tracker: Arc<CommandTracker>,
    stop: StopHandle,
) {
    loop {
        let mut connection = match connector.accept() {
            Ok(Some(connection)) => connection,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(error = %err, "accept failed");
                stop.request_stop(StopReason::AcceptFailed(err.to_string()));
                break;
            }
        };
        let peer = connection.peer();
        tracing::debug!(peer = %peer, "accepted connection");
        tracker.touch();
        connection.track_commands(Arc::clone(&tracker));
        let executer = Arc::clone(&executer);
        let submitted = commands.execute(move || executer.execute(connection));
        if let Err(err) = submitted {
            tracing::debug!(peer = %peer, error = %err, "command pool closed; leaving accept loop");
            break;
        }
    }
    tracing::debug!("accept loop finished");
}

struct IdleWatch {
    idle: Arc<IdleTimeout>,
    tracker: Arc<CommandTracker>,
    states: Arc<StateTracker>,
    stop: StopHandle,
    check_every: Duration,
    log_dir: Option<PathBuf>,
}

async fn watch_idle(watch: IdleWatch) {
    let mut interval = tokio::time::interval(watch.check_every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    let mut last_rotation = Instant::now();

    loop {
        interval.tick().await;

        if let Some(log_dir) = &watch.log_dir {
            if last_rotation.elapsed() >= LOG_ROTATION_INTERVAL {
                last_rotation = Instant::now();
                let log_dir = log_dir.clone();
                // rotate_logs logs its own failures
                let _ = tokio::task::spawn_blocking(move || crate::log_rotation::rotate_logs(&log_dir)).await;
            }
        }

        if watch.tracker.in_flight() > 0 || !watch.idle.is_expired() {
            continue;
        }
        if watch.states.advance(DaemonState::Running, DaemonState::IdleTimedOut) {
            let idle_for = watch.idle.idle_for_at(Instant::now());
            tracing::info!(idle_ms = idle_for.as_millis() as u64, "idle timeout expired");
            watch.stop.request_stop(StopReason::IdleTimeout);
            break;
        }
        if watch.states.current() != DaemonState::Starting {
            break;
        }
    }
}

async fn forward_signals(stop: StopHandle) {
    match wait_for_signal().await {
        Ok(signal) => {
            tracing::info!(signal, "received signal, stopping daemon");
            stop.request_stop(StopReason::Signal);
        }
        Err(err) => tracing::warn!(error = %err, "signal handler unavailable"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "ctrl-c"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}

/// Install the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default `info` filter.
///
/// With a `log_dir`, events go to `daemon.log` (warnings and errors to
/// `daemon-err.log`) in that directory instead of stdout. If the directory
/// cannot be created the subscriber falls back to stdout.
pub fn init_tracing(json: bool, log_dir: Option<&Path>) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);

    let files = match log_dir.map(DaemonLogFiles::create) {
        Some(Ok(files)) => Some(files),
        Some(Err(err)) => {
            eprintln!("warning: daemon logs go to stdout: {err}");
            None
        }
        None => None,
    };

    let _ = match (json, files) {
        (true, Some(files)) => builder.json().with_ansi(false).with_writer(files).try_init(),
        (false, Some(files)) => builder.with_ansi(false).with_writer(files).try_init(),
        (true, None) => builder.json().try_init(),
        (false, None) => builder.try_init(),
    };
}

/// Run a daemon in the foreground until it stops.
pub fn start_blocking(params: StartParameters, log_json: bool) -> Result<StopReport, DaemonError> {
    init_tracing(log_json, params.log_dir.as_deref());
    Daemon::new(params).run()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
