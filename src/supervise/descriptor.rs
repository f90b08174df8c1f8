// src/supervise/descriptor.rs

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::model::ServiceConfig;

/// Static definition of one managed service, immutable after registration.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub id: String,
    pub display_name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Time after launch during which the service is presumed still starting.
    pub startup_grace: Duration,
    /// Services that must be Running before this one starts.
    pub depends_on: Vec<String>,
    pub auto_restart: bool,
    /// Restart attempts per incident before the service is left terminal.
    pub max_restart_attempts: u32,
    /// Base backoff between restart attempts; the effective delay grows with
    /// the attempt count (capped, see monitor).
    pub restart_backoff: Duration,
    /// Optional stdout pattern that confirms readiness before the grace
    /// timer elapses.
    pub ready_pattern: Option<Regex>,
}

impl ServiceDescriptor {
    /// Build a descriptor from its `[service.<id>]` config section.
    pub fn from_config(id: &str, cfg: &ServiceConfig) -> Result<Self> {
        let ready_pattern = cfg
            .ready_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("compiling ready_pattern for service '{id}'"))?;

        let working_dir = cfg
            .working_dir
            .clone()
            .or_else(|| cfg.exec.parent().map(|p| p.to_path_buf()));

        Ok(Self {
            id: id.to_string(),
            display_name: cfg.effective_display_name(id),
            executable: cfg.exec.clone(),
            args: cfg.args.clone(),
            working_dir,
            startup_grace: Duration::from_secs(cfg.startup_grace_secs),
            depends_on: cfg.depends_on.clone(),
            auto_restart: cfg.auto_restart,
            max_restart_attempts: cfg.max_restart_attempts,
            restart_backoff: Duration::from_secs(cfg.restart_backoff_secs),
            ready_pattern,
        })
    }
}
