//! CLI command implementations.

pub mod conflicts;
pub mod report;
pub mod rules;
pub mod settings;
pub mod verify;

use ledgersync_protocol::Record;
use std::path::Path;

/// Reads a JSON array of records.
pub fn load_batch(path: &Path) -> Result<Vec<Record>, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    Ok(Record::parse_batch(&json)?)
}

/// Checks an output format argument.
pub fn check_format(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "text" | "json" => Ok(()),
        other => Err(format!("Unknown format '{other}' (expected text or json)").into()),
    }
}
