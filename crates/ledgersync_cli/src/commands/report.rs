//! Report command implementation.

use super::load_batch;
use ledgersync_engine::ReconciliationEngine;
use ledgersync_protocol::EntityType;
use std::path::{Path, PathBuf};

/// Runs the report command.
pub fn run(
    entity_type: &str,
    local: &Path,
    remote: Option<&Path>,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = export(entity_type, local, remote, output)?;
    println!("Report written to {}", path.display());
    Ok(())
}

fn export(
    entity_type: &str,
    local: &Path,
    remote: Option<&Path>,
    output: &Path,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let entity_type = EntityType::from(entity_type.to_string());
    let local = load_batch(local)?;

    let engine = ReconciliationEngine::default();
    let result = engine.verify(&entity_type, &local);
    println!(
        "Verification: {}/{} valid ({}%)",
        result.valid_records, result.total_records, result.pass_ratio
    );

    if let Some(remote) = remote {
        let report = engine.detect_conflicts(&entity_type, &local, &load_batch(remote)?);
        println!("Conflicts: {}", report.total_conflicts);
    }

    std::fs::create_dir_all(output)?;
    Ok(engine.export_report(output)?)
}
