//! Reconciliation engine with a bounded audit log.
//!
//! Wraps the pure verification and conflict detection of
//! `ledgersync_protocol` and records every result so it can be reported and
//! exported later.

use crate::error::SyncResult;
use ledgersync_protocol::{
    detect_conflicts, now_millis, resolve_conflict, ConflictEntry, ConflictReport, EntityType,
    Record, ResolutionRecord, ResolutionStrategy, RuleSet, VerificationResult, VerificationRule,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Entries of each log included in a generated report.
pub const REPORT_ENTRY_LIMIT: usize = 50;

/// One entry of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entry", rename_all = "camelCase")]
pub enum AuditEntry {
    /// A verification result.
    Verification(VerificationResult),
    /// A conflict report.
    Conflicts(ConflictReport),
    /// A resolution decision.
    Resolution(ResolutionRecord),
}

/// Report document built from the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    /// Verification results currently held.
    pub total_verifications: usize,
    /// Conflict reports currently held.
    pub total_conflict_reports: usize,
    /// Conflicts across the held conflict reports.
    pub total_conflicts: usize,
    /// Resolution decisions currently held.
    pub total_resolutions: usize,
    /// Most recent verification results, oldest first.
    pub verification_history: Vec<VerificationResult>,
    /// Most recent conflict reports, oldest first.
    pub conflict_log: Vec<ConflictReport>,
    /// Most recent resolution decisions, oldest first.
    pub resolution_log: Vec<ResolutionRecord>,
    /// Generation time (Unix millis).
    pub generated_at: u64,
}

#[derive(Debug, Default)]
struct AuditLog {
    verifications: VecDeque<VerificationResult>,
    conflicts: VecDeque<ConflictReport>,
    resolutions: VecDeque<ResolutionRecord>,
}

fn push_bounded<T>(log: &mut VecDeque<T>, entry: T, limit: usize) {
    log.push_back(entry);
    while log.len() > limit {
        log.pop_front();
    }
}

fn tail<T: Clone>(log: &VecDeque<T>, limit: usize) -> Vec<T> {
    log.iter()
        .skip(log.len().saturating_sub(limit))
        .cloned()
        .collect()
}

/// Validates record batches, detects divergence and records both.
pub struct ReconciliationEngine {
    rules: RwLock<RuleSet>,
    log: Mutex<AuditLog>,
    audit_limit: usize,
}

impl ReconciliationEngine {
    /// Creates an engine with the default rule table.
    pub fn new(audit_limit: usize) -> Self {
        Self::with_rules(RuleSet::default(), audit_limit)
    }

    /// Creates an engine with a custom rule table.
    pub fn with_rules(rules: RuleSet, audit_limit: usize) -> Self {
        Self {
            rules: RwLock::new(rules),
            log: Mutex::new(AuditLog::default()),
            audit_limit,
        }
    }

    /// Replaces the rule for one entity type.
    pub fn set_rule(&self, entity_type: EntityType, rule: VerificationRule) {
        self.rules.write().set_rule(entity_type, rule);
    }

    /// Returns a copy of the rule table.
    pub fn rules(&self) -> RuleSet {
        self.rules.read().clone()
    }

    /// Verifies a batch and records the result.
    pub fn verify(&self, entity_type: &EntityType, records: &[Record]) -> VerificationResult {
        let result = self.rules.read().verify(entity_type, records);
        info!(
            entity_type = %entity_type,
            status = ?result.status,
            pass_ratio = result.pass_ratio,
            "verification finished"
        );
        push_bounded(
            &mut self.log.lock().verifications,
            result.clone(),
            self.audit_limit,
        );
        result
    }

    /// Compares local and remote records and records the report.
    pub fn detect_conflicts(
        &self,
        entity_type: &EntityType,
        local: &[Record],
        remote: &[Record],
    ) -> ConflictReport {
        let report = detect_conflicts(entity_type, local, remote);
        if report.has_conflicts() {
            warn!(
                entity_type = %entity_type,
                conflicts = report.total_conflicts,
                "conflicts detected"
            );
        }
        push_bounded(
            &mut self.log.lock().conflicts,
            report.clone(),
            self.audit_limit,
        );
        report
    }

    /// Records an operator decision for a conflict. No store is touched.
    pub fn resolve_conflict(
        &self,
        conflict: &ConflictEntry,
        strategy: ResolutionStrategy,
    ) -> ResolutionRecord {
        let record = resolve_conflict(conflict, strategy);
        info!(
            stable_id = %record.stable_id,
            strategy = %strategy,
            "conflict resolution recorded"
        );
        push_bounded(
            &mut self.log.lock().resolutions,
            record.clone(),
            self.audit_limit,
        );
        record
    }

    /// Recorded verification results, oldest first.
    pub fn verification_history(&self) -> Vec<VerificationResult> {
        self.log.lock().verifications.iter().cloned().collect()
    }

    /// Recorded conflict reports, oldest first.
    pub fn conflict_history(&self) -> Vec<ConflictReport> {
        self.log.lock().conflicts.iter().cloned().collect()
    }

    /// Recorded resolution decisions, oldest first.
    pub fn resolution_history(&self) -> Vec<ResolutionRecord> {
        self.log.lock().resolutions.iter().cloned().collect()
    }

    /// Builds a report over the audit log.
    pub fn generate_report(&self) -> ReconciliationReport {
        let log = self.log.lock();
        ReconciliationReport {
            total_verifications: log.verifications.len(),
            total_conflict_reports: log.conflicts.len(),
            total_conflicts: log.conflicts.iter().map(|r| r.total_conflicts).sum(),
            total_resolutions: log.resolutions.len(),
            verification_history: tail(&log.verifications, REPORT_ENTRY_LIMIT),
            conflict_log: tail(&log.conflicts, REPORT_ENTRY_LIMIT),
            resolution_log: tail(&log.resolutions, REPORT_ENTRY_LIMIT),
            generated_at: now_millis(),
        }
    }

    /// Writes the report to `reconciliation_<millis>.json` in `dir`.
    pub fn export_report(&self, dir: impl AsRef<Path>) -> SyncResult<PathBuf> {
        let report = self.generate_report();
        let path = dir
            .as_ref()
            .join(format!("reconciliation_{}.json", report.generated_at));
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)?;
        info!(path = %path.display(), "reconciliation report exported");
        Ok(path)
    }

    /// Renders one audit entry as a timestamped JSON document.
    pub fn export_entry(&self, entry: &AuditEntry) -> SyncResult<String> {
        let document = serde_json::json!({
            "exportedAt": now_millis(),
            "record": entry,
        });
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Empties every audit log.
    pub fn clear_history(&self) {
        let mut log = self.log.lock();
        log.verifications.clear();
        log.conflicts.clear();
        log.resolutions.clear();
        info!("reconciliation history cleared");
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new(100)
    }
}
