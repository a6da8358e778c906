//! tach - time every line of a command's output
//!
//! tach runs a command, captures its standard output and standard error as
//! they are produced, and shows how long each line took before the next one
//! appeared. The line currently being written keeps a live running timer.
//!
//! # Usage
//!
//! ```text
//! tach make -j8             # time each line of a build
//! tach -p ./script.sh       # plain pipes instead of pseudo-terminals
//! tach -l cargo test        # no idle refresh (slow terminals, logs)
//! ```
//!
//! On exit, or on Ctrl+C, tach prints the total run time, the number of
//! lines, and the longest single line:
//!
//! ```text
//! Total:      3.201442 across 57 lines
//! Max:        1.029311
//! ```
//!
//! # Files
//!
//! - `~/.tach/config.toml` - optional defaults (see [`config`])
//! - `~/.tach/tach.log`    - log file, written only when `TACH_LOG` is set

mod clock;
mod config;
mod linebuf;
mod monitor;
mod process;
mod render;
mod signals;

use std::env;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::monitor::{Monitor, Settings};
use crate::process::ChannelKind;
use crate::render::{Palette, Renderer};
use crate::signals::Notifier;

/// sysexits(3) codes
const EX_USAGE: u8 = 64;
const EX_OSERR: u8 = 71;

/// Run a command and timestamp every line of its output
#[derive(Parser, Debug)]
#[command(name = "tach", version)]
struct Cli {
    /// Disable the idle refresh of the running timestamp
    #[arg(short = 'l')]
    slow: bool,

    /// Use plain pipes instead of pseudo-terminals for the command's output
    #[arg(short = 'p')]
    pipes: bool,

    /// Command to run, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<OsString>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EX_USAGE),
            };
        }
    };

    init_logging();
    info!("tach {} starting", env!("CARGO_PKG_VERSION"));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("tach: {:#}", e);
            ExitCode::from(EX_OSERR)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load();

    // Flags can only switch options on
    let kind = if cli.pipes || config.pipes {
        ChannelKind::Pipe
    } else {
        ChannelKind::Pty
    };
    let settings = Settings {
        slow: cli.slow || config.slow,
        refresh: config.refresh(),
        fast_threshold: config.fast_threshold(),
    };
    debug!(?settings, command = ?cli.command, "launching");

    // Routed before spawning so an early exit of the child is not missed
    let notifier = Notifier::install().context("failed to install signal handlers")?;
    let mut child = process::spawn(&cli.command, kind)
        .with_context(|| match cli.command.first() {
            Some(program) => program.to_string_lossy().into_owned(),
            None => String::from("command"),
        })?;
    info!(pid = child.pid(), kind = ?child.kind(), "child started");

    let renderer = Renderer::new(io::stdout().lock(), Palette::from_style(&config.style));
    let monitor = Monitor::new(renderer, MonotonicClock, settings, render::terminal_capacity());
    let summary = monitor::run(monitor, &mut child, &notifier, render::terminal_capacity)?;

    info!(
        lines = summary.lines,
        total = ?summary.total,
        max = ?summary.max,
        "finished"
    );
    Ok(())
}

/// Log to a file when `TACH_LOG` holds a filter directive; the terminal
/// belongs to the display.
fn init_logging() {
    let Some(directive) = env::var_os("TACH_LOG") else {
        return;
    };
    let filter = EnvFilter::try_new(directive.to_string_lossy())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let log_path = env::var_os("TACH_LOG_FILE")
        .map(PathBuf::from)
        .or_else(|| config::home_dir().map(|home| home.join(".tach").join("tach.log")))
        .unwrap_or_else(|| PathBuf::from("tach.log"));

    // Create log directory if needed
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    // Open log file (append mode)
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}
