//! `ember daemon`: foreground daemon, discovery and client commands.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use ember_core::registry::{default_registry_dir, probe, DaemonRegistry};
use ember_core::DaemonRegistryEntry;
use ember_daemon::paths::{logs_dir, stderr_log_path, stdout_log_path, DEFAULT_BIND};
use ember_daemon::{
    discover_any, request_build, request_status, request_stop, start_blocking, DaemonError,
    StartParameters,
};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run a daemon in the foreground until stopped or idle.
    Start(StartArgs),
    /// Ask the running daemon to stop.
    Stop(StopArgs),
    /// Query the running daemon's status.
    Status(RegistryArgs),
    /// List advertised daemons and whether they answer.
    List(ListArgs),
    /// Remove entries of daemons that no longer answer.
    Prune(RegistryArgs),
    /// Run a program through the running daemon.
    Build(BuildArgs),
    /// Print recent daemon log lines.
    Logs(LogsArgs),
}

#[derive(Args, Debug)]
pub struct RegistryArgs {
    /// Daemon registry directory [default: ~/.ember/registry].
    #[arg(long, env = "EMBER_REGISTRY_DIR")]
    pub registry_dir: Option<PathBuf>,
}

impl RegistryArgs {
    fn resolve(&self) -> Result<PathBuf> {
        match &self.registry_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_registry_dir().context("could not determine registry directory"),
        }
    }
}

#[derive(Args, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Stop after this many idle milliseconds; 0 or less never stops.
    #[arg(long, env = "EMBER_IDLE_TIMEOUT_MS", allow_hyphen_values = true)]
    pub idle_timeout_ms: Option<i64>,

    /// Address to listen on.
    #[arg(long, env = "EMBER_BIND", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// How long a stop waits for running commands.
    #[arg(long, default_value_t = 10_000)]
    pub grace_ms: u64,

    /// How often the idle timeout is checked.
    #[arg(long, default_value_t = 1_000)]
    pub idle_check_ms: u64,

    /// Daemon option `key=value`; part of the compatibility fingerprint.
    #[arg(long = "opt", value_parser = parse_option)]
    pub options: Vec<(String, String)>,

    /// Directory of the rotated daemon logs [default: ~/.ember/logs].
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Stop every live daemon in the registry.
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Working directory for the program.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Program to run.
    pub program: String,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Directory of the daemon logs [default: ~/.ember/logs].
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only the stderr log file.
    #[arg(long)]
    pub stderr_only: bool,
}

pub fn run(command: DaemonCommand, log_json: bool) -> Result<()> {
    match command {
        DaemonCommand::Start(args) => start(args, log_json),
        DaemonCommand::Stop(args) => stop(args),
        DaemonCommand::Status(args) => status(&args.resolve()?),
        DaemonCommand::List(args) => list(&args.registry.resolve()?, args.json),
        DaemonCommand::Prune(args) => prune(&args.resolve()?),
        DaemonCommand::Build(args) => build(args),
        DaemonCommand::Logs(args) => logs(args),
    }
}

fn start(args: StartArgs, log_json: bool) -> Result<()> {
    let log_dir = match args.log_dir {
        Some(dir) => dir,
        None => logs_dir(&dirs::home_dir().context("could not determine home directory")?),
    };
    let mut params = StartParameters::new(args.registry.resolve()?);
    params.idle_timeout_ms = args.idle_timeout_ms;
    params.bind_address = args.bind;
    params.grace_period = Duration::from_millis(args.grace_ms);
    params.idle_check_interval = Duration::from_millis(args.idle_check_ms.max(1));
    params.options = args.options.into_iter().collect::<BTreeMap<_, _>>();
    println!("daemon logs: {}", log_dir.display());
    params.log_dir = Some(log_dir);
    params.handle_signals = true;

    let report = start_blocking(params, log_json).context("daemon exited with error")?;
    if let Some(timeout) = report.shutdown_timeout {
        eprintln!("{} {timeout}", "warning:".yellow().bold());
    }
    Ok(())
}

fn stop(args: StopArgs) -> Result<()> {
    let registry_dir = args.registry.resolve()?;
    if args.all {
        let live: Vec<DaemonRegistryEntry> = DaemonRegistry::new(&registry_dir)
            .all()
            .context("failed to read daemon registry")?
            .into_iter()
            .filter(|entry| probe(entry, PROBE_TIMEOUT))
            .collect();
        if live.is_empty() {
            println!("no daemon is running");
        }
        for entry in live {
            request_stop(&entry).with_context(|| format!("failed to stop daemon at {}", entry.address))?;
            println!("daemon {} stop requested", entry.address);
        }
        return Ok(());
    }

    match discover_any(&registry_dir).context("failed to read daemon registry")? {
        Some(entry) => match request_stop(&entry) {
            Ok(()) => println!("daemon {} stop requested", entry.address),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("no daemon is running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        None => println!("no daemon is running"),
    }
    Ok(())
}

fn status(registry_dir: &Path) -> Result<()> {
    let status = match discover_any(registry_dir).context("failed to read daemon registry")? {
        Some(entry) => match request_status(&entry) {
            Ok(mut status) => {
                if let Some(fields) = status.as_object_mut() {
                    fields.insert("running".to_string(), true.into());
                    fields.insert("address".to_string(), entry.address.to_string().into());
                }
                status
            }
            Err(DaemonError::DaemonNotRunning { .. }) => not_running(registry_dir),
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        None => not_running(registry_dir),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("failed to render daemon status JSON")?
    );
    Ok(())
}

fn not_running(registry_dir: &Path) -> serde_json::Value {
    serde_json::json!({
        "running": false,
        "registry_dir": registry_dir.display().to_string(),
    })
}

#[derive(Serialize)]
struct ListedDaemon {
    daemon_id: String,
    address: String,
    pid: Option<u32>,
    fingerprint: String,
    started_at: String,
    live: bool,
}

#[derive(Tabled)]
struct ListRow {
    #[tabled(rename = "daemon")]
    daemon: String,
    #[tabled(rename = "address")]
    address: String,
    #[tabled(rename = "pid")]
    pid: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "started")]
    started: String,
}

fn list(registry_dir: &Path, json: bool) -> Result<()> {
    let daemons: Vec<ListedDaemon> = DaemonRegistry::new(registry_dir)
        .all()
        .context("failed to read daemon registry")?
        .into_iter()
        .map(|entry| ListedDaemon {
            daemon_id: entry.daemon_id.to_string(),
            address: entry.address.to_string(),
            pid: entry.pid,
            fingerprint: entry.fingerprint.to_string(),
            started_at: entry.started_at.to_rfc3339(),
            live: probe(&entry, PROBE_TIMEOUT),
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&daemons).context("failed to render daemon list JSON")?
        );
        return Ok(());
    }

    if daemons.is_empty() {
        println!("no daemons registered in {}", registry_dir.display());
        return Ok(());
    }

    let rows: Vec<ListRow> = daemons
        .into_iter()
        .map(|daemon| ListRow {
            daemon: daemon.daemon_id.chars().take(8).collect(),
            address: daemon.address,
            pid: daemon.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            state: if daemon.live {
                "live".green().bold().to_string()
            } else {
                "stale".yellow().bold().to_string()
            },
            started: daemon.started_at,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn prune(registry_dir: &Path) -> Result<()> {
    let pruned = DaemonRegistry::new(registry_dir)
        .prune_stale(PROBE_TIMEOUT)
        .context("failed to prune daemon registry")?;
    for entry in &pruned {
        println!("removed stale entry {} ({})", entry.daemon_id, entry.address);
    }
    println!("pruned {} stale entr{}", pruned.len(), if pruned.len() == 1 { "y" } else { "ies" });
    Ok(())
}

fn build(args: BuildArgs) -> Result<()> {
    let registry_dir = args.registry.resolve()?;
    let Some(entry) = discover_any(&registry_dir).context("failed to read daemon registry")? else {
        bail!(
            "no daemon is running in {}; start one with `ember daemon start`",
            registry_dir.display()
        );
    };
    let result = request_build(&entry, &args.program, args.args, args.cwd)
        .with_context(|| format!("build of '{}' failed", args.program))?;

    if let Some(stdout) = result["stdout"].as_str() {
        print!("{stdout}");
    }
    if let Some(stderr) = result["stderr"].as_str() {
        eprint!("{stderr}");
    }
    if result["success"].as_bool() != Some(true) {
        let code = result["exit_code"].as_i64().unwrap_or(1);
        std::io::stdout().flush().context("flush stdout")?;
        std::process::exit(i32::try_from(code).unwrap_or(1));
    }
    Ok(())
}

fn logs(args: LogsArgs) -> Result<()> {
    let log_dir = match args.log_dir {
        Some(dir) => dir,
        None => logs_dir(&dirs::home_dir().context("could not determine home directory")?),
    };
    if !args.stderr_only {
        print_tail(&stdout_log_path(&log_dir), args.lines).context("failed to read daemon log")?;
    }
    print_tail(&stderr_log_path(&log_dir), args.lines).context("failed to read daemon stderr log")?;
    Ok(())
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line);
        }
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}
