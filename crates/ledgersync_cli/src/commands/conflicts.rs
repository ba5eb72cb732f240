//! Conflict comparison and resolution commands.

use super::{check_format, load_batch};
use ledgersync_engine::ReconciliationEngine;
use ledgersync_protocol::{ConflictReport, EntityType, ResolutionStrategy, StableId};
use std::path::Path;

/// Runs the conflicts command.
pub fn run(
    entity_type: &str,
    local: &Path,
    remote: &Path,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    check_format(format)?;
    let report = compare(entity_type, local, remote)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Runs the resolve command.
pub fn resolve(
    entity_type: &str,
    local: &Path,
    remote: &Path,
    id: &str,
    strategy: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let strategy: ResolutionStrategy = strategy.parse()?;
    let engine = ReconciliationEngine::default();
    let entity_type = EntityType::from(entity_type.to_string());
    let report = engine.detect_conflicts(&entity_type, &load_batch(local)?, &load_batch(remote)?);

    let conflict = report
        .find(&StableId::new(id))
        .ok_or_else(|| format!("No conflict for stable id {id}"))?;
    let record = engine.resolve_conflict(conflict, strategy);

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn compare(
    entity_type: &str,
    local: &Path,
    remote: &Path,
) -> Result<ConflictReport, Box<dyn std::error::Error>> {
    let entity_type = EntityType::from(entity_type.to_string());
    let engine = ReconciliationEngine::default();
    Ok(engine.detect_conflicts(&entity_type, &load_batch(local)?, &load_batch(remote)?))
}

fn print_report(report: &ConflictReport) {
    println!("{} conflicts: {}", report.entity_type, report.total_conflicts);
    let groups = [
        ("Modified locally", &report.conflicts_by_kind.modified_locally),
        ("Missing remotely", &report.conflicts_by_kind.missing_remotely),
        ("Renamed", &report.conflicts_by_kind.renamed),
        ("Missing locally", &report.conflicts_by_kind.missing_locally),
    ];
    for (label, entries) in groups {
        if entries.is_empty() {
            continue;
        }
        println!("  {label}:");
        for entry in entries {
            match (&entry.local_name, &entry.remote_name) {
                (Some(local), Some(remote)) if local != remote => {
                    println!("    - {} {} -> {}", entry.stable_id, remote, local)
                }
                _ => println!(
                    "    - {} {}",
                    entry.stable_id,
                    entry.name.as_deref().unwrap_or("Unknown")
                ),
            }
        }
    }
    if report.skipped_without_id > 0 {
        println!("  Skipped without stable id: {}", report.skipped_without_id);
    }
}
