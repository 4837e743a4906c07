//! Ember: resident build daemon CLI.
//!
//! # Usage
//!
//! ```text
//! ember daemon start [--registry-dir <dir>] [--idle-timeout-ms <ms>] [--bind <addr>] [--opt k=v]...
//! ember daemon stop|status|prune [--registry-dir <dir>]
//! ember daemon list [--json]
//! ember daemon build -- <program> [args...]
//! ember daemon logs [--lines <n>] [--stderr-only]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::daemon::DaemonCommand;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "ember",
    version,
    about = "Run and talk to resident build daemons",
    long_about = None,
)]
struct Cli {
    /// Emit daemon logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start, inspect and stop build daemons.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command, cli.log_json),
    }
}
