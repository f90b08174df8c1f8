// src/config/validate.rs

use anyhow::{anyhow, Result};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::ConfigFile;

/// A service whose registration failed a per-service check.
///
/// Per-service failures do not abort the whole configuration; the supervisor
/// simply refuses to manage the named service.
#[derive(Debug, Clone)]
pub struct DisabledService {
    pub id: String,
    pub reason: String,
}

/// Run semantic validation against a loaded configuration.
///
/// Configuration-level failures (no services, bad global values, unknown or
/// cyclic dependencies, invalid ready patterns) are hard errors. Per-service
/// resource failures (missing executable) disable just that service and are
/// returned for the caller to report.
pub fn validate_config(cfg: &ConfigFile) -> Result<Vec<DisabledService>> {
    ensure_has_services(cfg)?;
    validate_global_config(cfg)?;
    validate_dependencies(cfg)?;
    validate_dag(cfg)?;
    validate_ready_patterns(cfg)?;
    Ok(check_executables(cfg))
}

fn ensure_has_services(cfg: &ConfigFile) -> Result<()> {
    if cfg.service.is_empty() {
        return Err(anyhow!(
            "config must contain at least one [service.<id>] section"
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &ConfigFile) -> Result<()> {
    if cfg.config.monitor_interval_ms == 0 {
        return Err(anyhow!("[config].monitor_interval_ms must be >= 1 (got 0)"));
    }

    if let Some(ref db_service) = cfg.database.service {
        if !cfg.service.contains_key(db_service) {
            return Err(anyhow!(
                "[database].service refers to unknown service '{}'",
                db_service
            ));
        }
    }

    Ok(())
}

fn validate_dependencies(cfg: &ConfigFile) -> Result<()> {
    for (id, svc) in cfg.service.iter() {
        for dep in svc.depends_on.iter() {
            if !cfg.service.contains_key(dep) {
                return Err(anyhow!(
                    "service '{}' has unknown dependency '{}' in `depends_on`",
                    id,
                    dep
                ));
            }
            if dep == id {
                return Err(anyhow!(
                    "service '{}' cannot depend on itself in `depends_on`",
                    id
                ));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &ConfigFile) -> Result<()> {
    // Edge direction: dependency -> dependent.
    // For:
    //   [service.world]
    //   depends_on = ["mysql"]
    // we add edge mysql -> world.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for id in cfg.service.keys() {
        graph.add_node(id.as_str());
    }

    for (id, svc) in cfg.service.iter() {
        for dep in svc.depends_on.iter() {
            graph.add_edge(dep.as_str(), id.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = cycle.node_id();
            Err(anyhow!(
                "cycle detected in service dependencies involving '{}'",
                node
            ))
        }
    }
}

fn validate_ready_patterns(cfg: &ConfigFile) -> Result<()> {
    for (id, svc) in cfg.service.iter() {
        if let Some(ref pattern) = svc.ready_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                anyhow!("service '{}' has invalid ready_pattern: {}", id, e)
            })?;
        }
    }
    Ok(())
}

/// Check that each service's executable exists and is a file.
///
/// Failures here do not abort validation; a missing executable disables that
/// service and the rest of the stack is unaffected.
fn check_executables(cfg: &ConfigFile) -> Vec<DisabledService> {
    let mut disabled = Vec::new();

    for (id, svc) in cfg.service.iter() {
        if !svc.exec.is_file() {
            disabled.push(DisabledService {
                id: id.clone(),
                reason: format!("executable not found: {:?}", svc.exec),
            });
        }
    }

    disabled
}
