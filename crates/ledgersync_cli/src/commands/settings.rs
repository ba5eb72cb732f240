//! Settings command implementation.

use ledgersync_engine::AppSettings;
use std::path::Path;

/// Runs the settings command.
pub fn run(file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = match file {
        Some(path) => AppSettings::load(path)?,
        None => AppSettings::from_json("{}")?,
    };
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
