// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [config]
/// monitor_interval_ms = 1000
/// shutdown_grace_secs = 10
/// log_dir = "logs"
/// backup_dir = "backup"
///
/// [database]
/// service = "mysql"
/// host = "localhost"
/// port = 3306
/// user = "root"
///
/// [service.mysql]
/// exec = "/opt/mysql/bin/mysqld"
/// args = ["--console"]
/// startup_grace_secs = 10
///
/// [service.world]
/// exec = "/opt/core/worldserver"
/// depends_on = ["mysql"]
/// startup_grace_secs = 120
/// auto_restart = true
/// max_restart_attempts = 3
/// restart_backoff_secs = 5
/// ready_pattern = "World initialized"
/// ```
///
/// All sections except `[service.*]` are optional and have reasonable
/// defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Global behaviour config from `[config]`.
    #[serde(default)]
    pub config: ConfigSection,

    /// Database connection / tool parameters from `[database]`.
    #[serde(default)]
    pub database: DatabaseSection,

    /// All managed services from `[service.<id>]`.
    ///
    /// Keys are the *service ids* (e.g. `"mysql"`, `"auth"`, `"world"`).
    #[serde(default)]
    pub service: BTreeMap<String, ServiceConfig>,
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// How often the health monitor polls process liveness, in milliseconds.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// How long a cooperative shutdown may take before the process is
    /// forcibly killed, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Directory for per-service and per-job log files (append-only).
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Directory where backup files are written.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backup")
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            log_dir: default_log_dir(),
            backup_dir: default_backup_dir(),
        }
    }
}

/// `[database]` section: connection parameters and external tool commands
/// used by the backup/restore engine.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    /// Id of the managed service that runs the database engine, if any.
    ///
    /// Lifecycle operations on this service share the maintenance lock with
    /// backup/restore jobs.
    #[serde(default)]
    pub service: Option<String>,

    /// Dump tool executable (mysqldump-compatible).
    #[serde(default = "default_dump_tool")]
    pub dump_tool: String,

    /// Client tool executable (mysql-compatible), used for restore and for
    /// listing databases.
    #[serde(default = "default_client_tool")]
    pub client_tool: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Extra arguments passed to the dump tool for every database.
    #[serde(default = "default_dump_args")]
    pub dump_args: Vec<String>,
}

fn default_dump_tool() -> String {
    "mysqldump".to_string()
}

fn default_client_tool() -> String {
    "mysql".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3306
}

fn default_user() -> String {
    "root".to_string()
}

fn default_dump_args() -> Vec<String> {
    vec![
        "--single-transaction".to_string(),
        "--routines".to_string(),
        "--triggers".to_string(),
    ]
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            service: None,
            dump_tool: default_dump_tool(),
            client_tool: default_client_tool(),
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: None,
            dump_args: default_dump_args(),
        }
    }
}

/// `[service.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Human-readable name for status displays; defaults to the id.
    #[serde(default)]
    pub display_name: Option<String>,

    /// Path to the service executable.
    pub exec: PathBuf,

    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process; defaults to the executable's
    /// directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Time after launch during which the service is presumed still starting.
    /// Once this elapses without a crash, the service is considered Running.
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,

    /// Services that must be Running before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Relaunch automatically after an unexpected exit.
    #[serde(default)]
    pub auto_restart: bool,

    /// Restart attempts per incident before the service is left terminal.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// Base backoff between restart attempts; the effective delay grows with
    /// the attempt count.
    #[serde(default = "default_restart_backoff_secs")]
    pub restart_backoff_secs: u64,

    /// Optional regex matched against the child's stdout; a match confirms
    /// readiness before the grace timer elapses.
    #[serde(default)]
    pub ready_pattern: Option<String>,
}

fn default_startup_grace_secs() -> u64 {
    10
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_restart_backoff_secs() -> u64 {
    5
}

impl ServiceConfig {
    /// Effective display name, falling back to the id.
    pub fn effective_display_name(&self, id: &str) -> String {
        self.display_name.clone().unwrap_or_else(|| id.to_string())
    }
}
