//! Verify command implementation.

use super::{check_format, load_batch};
use ledgersync_engine::ReconciliationEngine;
use ledgersync_protocol::{EntityType, VerificationResult};
use std::path::Path;

/// Runs the verify command.
pub fn run(entity_type: &str, input: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    check_format(format)?;
    let entity_type = EntityType::from(entity_type.to_string());
    let records = load_batch(input)?;

    let engine = ReconciliationEngine::default();
    let result = engine.verify(&entity_type, &records);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Verifying {} {} records from {:?}", records.len(), entity_type, input);
        println!();
        print_result(&result);
        println!();
    }

    if result.passed() {
        if format == "text" {
            println!("✓ Verification passed");
        }
        Ok(())
    } else {
        if format == "text" {
            println!("✗ Verification failed");
        }
        Err("Verification failed".into())
    }
}

fn print_result(result: &VerificationResult) {
    println!("  Total records:   {}", result.total_records);
    println!("  Valid records:   {}", result.valid_records);
    println!("  Invalid records: {}", result.invalid_records);
    println!("  Pass ratio:      {}%", result.pass_ratio);

    if !result.missing_field_records.is_empty() {
        println!("  Missing fields:");
        for missing in &result.missing_field_records {
            println!(
                "    - #{} {}: {}",
                missing.index,
                missing.record,
                missing.fields.join(", ")
            );
        }
    }

    if !result.failed_validations.is_empty() {
        println!("  Failed validations:");
        for failed in &result.failed_validations {
            println!("    - #{} {}: {}", failed.index, failed.record, failed.reason);
        }
    }

    if !result.duplicates.is_empty() {
        println!("  Duplicates (not counted as invalid):");
        for duplicate in &result.duplicates {
            println!(
                "    - #{} id={} name={}",
                duplicate.index,
                duplicate
                    .stable_id
                    .as_ref()
                    .map(|id| id.as_str())
                    .unwrap_or("-"),
                duplicate.name.as_deref().unwrap_or("-")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn batch_file(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn valid_batch_passes() {
        let file = batch_file(r#"[{"alterID": 1, "name": "Cash", "accountType": "Asset"}]"#);
        assert!(run("Ledger", file.path(), "json").is_ok());
    }

    #[test]
    fn invalid_batch_fails() {
        let file = batch_file(r#"[{"alterID": 1, "name": "Cash"}]"#);
        assert!(run("Ledger", file.path(), "text").is_err());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let file = batch_file("[]");
        assert!(run("Ledger", file.path(), "yaml").is_err());
    }
}
