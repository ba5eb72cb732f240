//! Integrity verification of extracted record batches.
//!
//! Each entity type has a rule made of a required-field table and a
//! record predicate. A record that misses a required field or fails the
//! predicate is invalid. Duplicates (same stable id and name) are reported
//! on their own and do not make a record invalid.

use crate::now_millis;
use crate::record::{EntityType, Record, StableId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Predicate applied to records that carry every required field.
pub type RecordPredicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Verification rule for one entity type.
#[derive(Clone)]
pub struct VerificationRule {
    /// Fields that must be present and non-null.
    pub required_fields: Vec<String>,
    /// Entity-specific validity check.
    pub predicate: RecordPredicate,
}

impl VerificationRule {
    /// Creates a rule with the given required fields and the default predicate.
    pub fn new<I, S>(required_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_fields: required_fields.into_iter().map(Into::into).collect(),
            predicate: Arc::new(default_predicate),
        }
    }

    /// Replaces the predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Returns the required fields absent from the record.
    pub fn missing_fields(&self, record: &Record) -> Vec<String> {
        self.required_fields
            .iter()
            .filter(|field| !record.has_field(field))
            .cloned()
            .collect()
    }
}

impl Default for VerificationRule {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl fmt::Debug for VerificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationRule")
            .field("required_fields", &self.required_fields)
            .finish_non_exhaustive()
    }
}

/// Non-blank name and a present stable id.
fn default_predicate(record: &Record) -> bool {
    let named = record.name().is_some_and(|name| !name.trim().is_empty());
    named && record.stable_id().is_some()
}

/// Per-entity-type rule table.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: HashMap<EntityType, VerificationRule>,
    fallback: VerificationRule,
}

impl RuleSet {
    /// Creates an empty rule table; every type uses the fallback rule.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
            fallback: VerificationRule::default(),
        }
    }

    /// Sets the rule for an entity type.
    pub fn set_rule(&mut self, entity_type: EntityType, rule: VerificationRule) {
        self.rules.insert(entity_type, rule);
    }

    /// Sets the rule for an entity type, returning the table.
    pub fn with_rule(mut self, entity_type: EntityType, rule: VerificationRule) -> Self {
        self.set_rule(entity_type, rule);
        self
    }

    /// Returns the rule applied to an entity type.
    pub fn rule_for(&self, entity_type: &EntityType) -> &VerificationRule {
        self.rules.get(entity_type).unwrap_or(&self.fallback)
    }

    /// Returns the entity types with a dedicated rule, sorted by name.
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<_> = self.rules.keys().cloned().collect();
        types.sort();
        types
    }

    /// Verifies a batch of records.
    pub fn verify(&self, entity_type: &EntityType, records: &[Record]) -> VerificationResult {
        let start = Instant::now();
        let rule = self.rule_for(entity_type);

        let mut result = VerificationResult {
            entity_type: entity_type.clone(),
            total_records: records.len(),
            valid_records: 0,
            invalid_records: 0,
            duplicates: Vec::new(),
            missing_field_records: Vec::new(),
            failed_validations: Vec::new(),
            status: VerificationStatus::Passed,
            pass_ratio: 0,
            timestamp: now_millis(),
            duration_ms: 0,
        };

        let mut seen: HashSet<(Option<StableId>, Option<String>)> = HashSet::new();

        for (index, record) in records.iter().enumerate() {
            let key = (record.stable_id(), record.name().map(str::to_string));
            if !seen.insert(key.clone()) {
                result.duplicates.push(DuplicateRecord {
                    index,
                    stable_id: key.0,
                    name: key.1,
                });
            }

            let missing = rule.missing_fields(record);
            if !missing.is_empty() {
                result.missing_field_records.push(MissingFieldRecord {
                    index,
                    fields: missing,
                    record: display_name(record),
                });
                result.invalid_records += 1;
            } else if !(rule.predicate)(record) {
                result.failed_validations.push(FailedValidation {
                    index,
                    record: display_name(record),
                    reason: "entity validation failed".into(),
                });
                result.invalid_records += 1;
            } else {
                result.valid_records += 1;
            }
        }

        result.status = if result.invalid_records == 0 {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        };
        result.pass_ratio = pass_ratio(result.valid_records, result.total_records);
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }
}

impl Default for RuleSet {
    /// The standard rule table for accounting masters.
    fn default() -> Self {
        Self::empty()
            .with_rule(
                EntityType::Group,
                VerificationRule::new(["name", "groupName", "alterID"]),
            )
            .with_rule(
                EntityType::Ledger,
                VerificationRule::new(["name", "alterID", "accountType"]),
            )
            .with_rule(
                EntityType::StockItem,
                VerificationRule::new(["name", "alterID", "unitName"]),
            )
            .with_rule(
                EntityType::VoucherType,
                VerificationRule::new(["name", "alterID"]),
            )
    }
}

fn display_name(record: &Record) -> String {
    record.name().unwrap_or("Unknown").to_string()
}

/// Whole-number percentage of valid records; 0 for an empty batch.
fn pass_ratio(valid: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((valid as f64 / total as f64) * 100.0).round() as u32
}

/// Outcome of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// No invalid records.
    Passed,
    /// At least one invalid record.
    Failed,
}

/// A record sharing its stable id and name with an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateRecord {
    /// Position in the batch.
    pub index: usize,
    /// Stable id, if any.
    pub stable_id: Option<StableId>,
    /// Name, if any.
    pub name: Option<String>,
}

/// A record missing one or more required fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingFieldRecord {
    /// Position in the batch.
    pub index: usize,
    /// Missing field names.
    pub fields: Vec<String>,
    /// Record name, or "Unknown".
    pub record: String,
}

/// A record that has every required field but fails the entity predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedValidation {
    /// Position in the batch.
    pub index: usize,
    /// Record name, or "Unknown".
    pub record: String,
    /// Why the record was rejected.
    pub reason: String,
}

/// Result of verifying one batch. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    /// Entity type of the batch.
    pub entity_type: EntityType,
    /// Number of records examined.
    pub total_records: usize,
    /// Records passing every check.
    pub valid_records: usize,
    /// Records failing a check.
    pub invalid_records: usize,
    /// Duplicate `(stable id, name)` occurrences.
    pub duplicates: Vec<DuplicateRecord>,
    /// Records missing required fields.
    pub missing_field_records: Vec<MissingFieldRecord>,
    /// Records failing the entity predicate.
    pub failed_validations: Vec<FailedValidation>,
    /// Overall outcome.
    pub status: VerificationStatus,
    /// Percentage of valid records, 0 when the batch is empty.
    pub pass_ratio: u32,
    /// When the verification ran (Unix millis).
    pub timestamp: u64,
    /// How long the verification took.
    pub duration_ms: u64,
}

impl VerificationResult {
    /// Returns true if the batch passed.
    pub fn passed(&self) -> bool {
        self.status == VerificationStatus::Passed
    }

    /// Returns a copy with the timing fields zeroed, for comparing outcomes.
    pub fn without_timing(&self) -> Self {
        Self {
            timestamp: 0,
            duration_ms: 0,
            ..self.clone()
        }
    }
}
