// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `servdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "servdag",
    version,
    about = "Supervise a stack of game-server services with dependency-ordered \
             start/stop, health monitoring and database backup/restore.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Servdag.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Servdag.toml")]
    pub config: String,

    /// Register services but do not start them; the monitor still runs and
    /// services can be started individually later.
    #[arg(long)]
    pub no_autostart: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SERVDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the resolved services and start order, but
    /// don't spawn any processes.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
