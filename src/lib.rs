// src/lib.rs

pub mod backup;
pub mod cli;
pub mod config;
pub mod errors;
pub mod logging;
pub mod monitor;
pub mod supervise;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::backup::engine::ToolSettings;
use crate::backup::{BackupRestoreEngine, MaintenanceLock};
use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::config::validate::DisabledService;
use crate::monitor::events::{EventHub, TracingSink};
use crate::monitor::HealthMonitor;
use crate::supervise::{ServiceDescriptor, Supervisor};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and validation
/// - the supervisor and its dependency graph
/// - the health monitor loop
/// - the backup/restore engine (shares the maintenance lock with the
///   supervisor's database-service lifecycle)
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let (cfg, disabled) = load_and_validate(&args.config)?;

    if args.dry_run {
        print_dry_run(&cfg, &disabled);
        return Ok(());
    }

    for d in &disabled {
        warn!(service = %d.id, reason = %d.reason, "service disabled");
    }

    let descriptors = build_descriptors(&cfg, &disabled)?;

    let events = Arc::new(EventHub::new(
        Arc::new(TracingSink),
        cfg.config.log_dir.clone(),
    ));
    let maintenance = MaintenanceLock::new();

    let supervisor = Arc::new(Supervisor::new(
        descriptors,
        Arc::clone(&events),
        maintenance.clone(),
        cfg.database.service.clone(),
        Duration::from_secs(cfg.config.shutdown_grace_secs),
    )?);

    let engine = Arc::new(BackupRestoreEngine::new(
        ToolSettings::from(&cfg.database),
        Arc::clone(&events),
        maintenance,
        Arc::clone(&supervisor),
    ));

    let monitor = HealthMonitor::new(
        Arc::clone(&supervisor),
        Duration::from_millis(cfg.config.monitor_interval_ms),
    );
    let monitor_task = tokio::spawn(monitor.run());

    if args.no_autostart {
        info!("autostart disabled; services registered but not started");
    } else {
        for failure in supervisor.start_all().await {
            warn!(
                service = %failure.service_id,
                error = %failure.error,
                "service failed to start"
            );
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; stopping all services");

    monitor_task.abort();
    engine.cancel_active().await;

    for failure in supervisor.stop_all().await {
        warn!(
            service = %failure.service_id,
            error = %failure.error,
            "service failed to stop"
        );
    }

    Ok(())
}

/// Build descriptors for every configured service that was not disabled
/// during validation.
fn build_descriptors(
    cfg: &ConfigFile,
    disabled: &[DisabledService],
) -> Result<Vec<ServiceDescriptor>> {
    let mut descriptors = Vec::new();
    for (id, svc) in cfg.service.iter() {
        if disabled.iter().any(|d| &d.id == id) {
            continue;
        }
        descriptors.push(ServiceDescriptor::from_config(id, svc)?);
    }
    Ok(descriptors)
}

/// Simple dry-run output: print services, dependencies and the start order.
fn print_dry_run(cfg: &ConfigFile, disabled: &[DisabledService]) {
    println!("servdag dry-run");
    println!(
        "  config.monitor_interval_ms = {}",
        cfg.config.monitor_interval_ms
    );
    println!(
        "  config.shutdown_grace_secs = {}",
        cfg.config.shutdown_grace_secs
    );
    println!("  config.log_dir = {:?}", cfg.config.log_dir);
    println!("  config.backup_dir = {:?}", cfg.config.backup_dir);
    if let Some(ref db) = cfg.database.service {
        println!("  database.service = {db}");
    }
    println!();

    println!("services ({}):", cfg.service.len());
    for (id, svc) in cfg.service.iter() {
        println!("  - {id} ({})", svc.effective_display_name(id));
        println!("      exec: {:?}", svc.exec);
        if !svc.args.is_empty() {
            println!("      args: {:?}", svc.args);
        }
        if !svc.depends_on.is_empty() {
            println!("      depends_on: {:?}", svc.depends_on);
        }
        println!("      startup_grace_secs: {}", svc.startup_grace_secs);
        if svc.auto_restart {
            println!(
                "      auto_restart: true (max {} attempts, backoff {}s)",
                svc.max_restart_attempts, svc.restart_backoff_secs
            );
        }
        if let Some(ref pattern) = svc.ready_pattern {
            println!("      ready_pattern: {pattern}");
        }
        if let Some(d) = disabled.iter().find(|d| &d.id == id) {
            println!("      DISABLED: {}", d.reason);
        }
    }

    match crate::supervise::DependencyGraph::new(
        cfg.service
            .iter()
            .map(|(id, svc)| (id.as_str(), svc.depends_on.as_slice())),
    ) {
        Ok(graph) => println!("\nstart order: {:?}", graph.start_order()),
        Err(e) => println!("\nstart order unavailable: {e}"),
    }
}
