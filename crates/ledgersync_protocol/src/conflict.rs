//! Conflict detection and resolution.
//!
//! Local records come from the accounting engine, remote records from the
//! backend store. Both sides are indexed by stable id and classified by
//! membership:
//!
//! | local | remote | content | kind               |
//! |-------|--------|---------|--------------------|
//! | yes   | yes    | equal   | (no conflict)      |
//! | yes   | yes    | differs, names differ | `Renamed` |
//! | yes   | yes    | differs, names equal  | `ModifiedLocally` |
//! | yes   | no     | -       | `MissingRemotely`  |
//! | no    | yes    | -       | `MissingLocally`   |
//!
//! Conflicts are reported, never merged. A resolution only records the
//! operator's decision; applying it is the ingestion side's job.

use crate::error::ProtocolError;
use crate::now_millis;
use crate::record::{EntityType, Record, StableId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Category of a single divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// Present on both sides, same name, different content.
    ModifiedLocally,
    /// Present only locally; needs a push.
    MissingRemotely,
    /// Present on both sides with different names.
    Renamed,
    /// Present only remotely; deleted from the accounting engine.
    MissingLocally,
}

/// One divergent stable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    /// Stable id the conflict is about.
    pub stable_id: StableId,
    /// Category.
    pub kind: ConflictKind,
    /// Name on the side(s) that hold the record; the local one when both do.
    pub name: Option<String>,
    /// Local name, when the record exists locally.
    pub local_name: Option<String>,
    /// Remote name, when the record exists remotely.
    pub remote_name: Option<String>,
    /// Local content hash (hex).
    pub local_hash: Option<String>,
    /// Remote content hash (hex).
    pub remote_hash: Option<String>,
}

impl ConflictEntry {
    fn new(
        stable_id: StableId,
        kind: ConflictKind,
        local: Option<&Record>,
        remote: Option<&Record>,
    ) -> Self {
        let local_name = local.and_then(|r| r.name()).map(str::to_string);
        let remote_name = remote.and_then(|r| r.name()).map(str::to_string);
        Self {
            stable_id,
            kind,
            name: local_name.clone().or_else(|| remote_name.clone()),
            local_name,
            remote_name,
            local_hash: local.map(Record::content_hash_hex),
            remote_hash: remote.map(Record::content_hash_hex),
        }
    }

    /// Returns true if the record exists on both sides.
    pub fn is_update_conflict(&self) -> bool {
        self.local_hash.is_some() && self.remote_hash.is_some()
    }
}

/// Conflicts grouped by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictsByKind {
    /// Same name, different content.
    pub modified_locally: Vec<ConflictEntry>,
    /// Local only.
    pub missing_remotely: Vec<ConflictEntry>,
    /// Different names.
    pub renamed: Vec<ConflictEntry>,
    /// Remote only.
    pub missing_locally: Vec<ConflictEntry>,
}

impl ConflictsByKind {
    fn push(&mut self, entry: ConflictEntry) {
        match entry.kind {
            ConflictKind::ModifiedLocally => self.modified_locally.push(entry),
            ConflictKind::MissingRemotely => self.missing_remotely.push(entry),
            ConflictKind::Renamed => self.renamed.push(entry),
            ConflictKind::MissingLocally => self.missing_locally.push(entry),
        }
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.modified_locally.len()
            + self.missing_remotely.len()
            + self.renamed.len()
            + self.missing_locally.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over every entry.
    pub fn iter(&self) -> impl Iterator<Item = &ConflictEntry> {
        self.modified_locally
            .iter()
            .chain(&self.missing_remotely)
            .chain(&self.renamed)
            .chain(&self.missing_locally)
    }
}

/// Overall outcome of conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    /// Both sides agree.
    NoConflicts,
    /// At least one divergence.
    ConflictsFound,
}

/// Result of comparing local and remote records of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    /// Entity type compared.
    pub entity_type: EntityType,
    /// Divergences by category.
    pub conflicts_by_kind: ConflictsByKind,
    /// Number of divergences.
    pub total_conflicts: usize,
    /// Overall outcome.
    pub status: ConflictStatus,
    /// Records ignored because they carry no stable id.
    pub skipped_without_id: usize,
    /// When detection ran (Unix millis).
    pub timestamp: u64,
}

impl ConflictReport {
    /// Returns true if any divergence was found.
    pub fn has_conflicts(&self) -> bool {
        self.status == ConflictStatus::ConflictsFound
    }

    /// Finds the entry for a stable id.
    pub fn find(&self, stable_id: &StableId) -> Option<&ConflictEntry> {
        self.conflicts_by_kind
            .iter()
            .find(|entry| &entry.stable_id == stable_id)
    }
}

/// Compares local and remote records of one entity type.
///
/// When a side holds the same stable id more than once, the last record
/// wins.
pub fn detect_conflicts(
    entity_type: &EntityType,
    local_records: &[Record],
    remote_records: &[Record],
) -> ConflictReport {
    let (local, skipped_local) = index_by_id(local_records);
    let (remote, skipped_remote) = index_by_id(remote_records);

    let mut conflicts = ConflictsByKind::default();

    for (id, local_record) in &local {
        match remote.get(id) {
            Some(remote_record) => {
                if local_record.content_hash() == remote_record.content_hash() {
                    continue;
                }
                let kind = if local_record.name() != remote_record.name() {
                    ConflictKind::Renamed
                } else {
                    ConflictKind::ModifiedLocally
                };
                conflicts.push(ConflictEntry::new(
                    id.clone(),
                    kind,
                    Some(*local_record),
                    Some(*remote_record),
                ));
            }
            None => conflicts.push(ConflictEntry::new(
                id.clone(),
                ConflictKind::MissingRemotely,
                Some(*local_record),
                None,
            )),
        }
    }

    for (id, remote_record) in &remote {
        if !local.contains_key(id) {
            conflicts.push(ConflictEntry::new(
                id.clone(),
                ConflictKind::MissingLocally,
                None,
                Some(*remote_record),
            ));
        }
    }

    let total_conflicts = conflicts.len();
    ConflictReport {
        entity_type: entity_type.clone(),
        conflicts_by_kind: conflicts,
        total_conflicts,
        status: if total_conflicts == 0 {
            ConflictStatus::NoConflicts
        } else {
            ConflictStatus::ConflictsFound
        },
        skipped_without_id: skipped_local + skipped_remote,
        timestamp: now_millis(),
    }
}

/// Indexes records by stable id, counting the ones without an id.
fn index_by_id(records: &[Record]) -> (BTreeMap<StableId, &Record>, usize) {
    let mut map = BTreeMap::new();
    let mut skipped = 0;
    for record in records {
        match record.stable_id() {
            Some(id) => {
                map.insert(id, record);
            }
            None => skipped += 1,
        }
    }
    (map, skipped)
}

/// Operator decision for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    /// Keep the accounting engine's version.
    UseLocal,
    /// Keep the backend's version.
    UseRemote,
    /// Merge both versions.
    Merge,
    /// Leave the conflict in place.
    Skip,
}

impl ResolutionStrategy {
    /// Returns the strategy's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::UseLocal => "useLocal",
            ResolutionStrategy::UseRemote => "useRemote",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Skip => "skip",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "useLocal" => Ok(ResolutionStrategy::UseLocal),
            "useRemote" => Ok(ResolutionStrategy::UseRemote),
            "merge" => Ok(ResolutionStrategy::Merge),
            "skip" => Ok(ResolutionStrategy::Skip),
            other => Err(ProtocolError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Record of an explicit resolution decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRecord {
    /// Stable id of the resolved conflict.
    pub stable_id: StableId,
    /// Category of the resolved conflict.
    pub kind: ConflictKind,
    /// Chosen strategy.
    pub strategy: ResolutionStrategy,
    /// When the decision was recorded (Unix millis).
    pub timestamp: u64,
    /// Whether the decision was accepted.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
}

/// Records an operator decision for a conflict. No store is touched.
pub fn resolve_conflict(conflict: &ConflictEntry, strategy: ResolutionStrategy) -> ResolutionRecord {
    let name = conflict
        .name
        .clone()
        .unwrap_or_else(|| conflict.stable_id.to_string());
    let message = match strategy {
        ResolutionStrategy::UseLocal => format!("Using local version of {name}"),
        ResolutionStrategy::UseRemote => format!("Using remote version of {name}"),
        ResolutionStrategy::Merge => format!("Merged versions of {name}"),
        ResolutionStrategy::Skip => format!("Skipped conflict for {name}"),
    };
    ResolutionRecord {
        stable_id: conflict.stable_id.clone(),
        kind: conflict.kind,
        strategy,
        timestamp: now_millis(),
        success: true,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rec(id: u64, name: &str) -> Record {
        Record::named(id, name)
    }

    #[test]
    fn identical_sides_have_no_conflicts() {
        let records = vec![rec(1, "A"), rec(2, "B")];
        let report = detect_conflicts(&EntityType::Ledger, &records, &records);
        assert_eq!(report.total_conflicts, 0);
        assert_eq!(report.status, ConflictStatus::NoConflicts);
        assert!(!report.has_conflicts());
    }

    #[test]
    fn rename_and_membership_scenario() {
        let local = vec![rec(1, "A"), rec(2, "B"), rec(3, "C")];
        let remote = vec![rec(2, "B2"), rec(3, "C"), rec(4, "D")];

        let report = detect_conflicts(&EntityType::Ledger, &local, &remote);
        assert_eq!(report.total_conflicts, 3);
        assert_eq!(report.status, ConflictStatus::ConflictsFound);

        let by_kind = &report.conflicts_by_kind;
        assert_eq!(by_kind.missing_remotely.len(), 1);
        assert_eq!(by_kind.missing_remotely[0].stable_id, StableId::from(1));
        assert_eq!(by_kind.renamed.len(), 1);
        assert_eq!(by_kind.renamed[0].local_name.as_deref(), Some("B"));
        assert_eq!(by_kind.renamed[0].remote_name.as_deref(), Some("B2"));
        assert_eq!(by_kind.missing_locally.len(), 1);
        assert_eq!(by_kind.missing_locally[0].stable_id, StableId::from(4));
        assert!(by_kind.modified_locally.is_empty());
    }

    #[test]
    fn same_name_different_content_is_modified() {
        let local = vec![rec(1, "Cash").with("openingBalance", 100)];
        let remote = vec![rec(1, "Cash").with("openingBalance", 90)];
        let report = detect_conflicts(&EntityType::Ledger, &local, &remote);
        assert_eq!(report.conflicts_by_kind.modified_locally.len(), 1);
        assert!(report.conflicts_by_kind.modified_locally[0].is_update_conflict());
    }

    #[test]
    fn field_order_does_not_matter() {
        let local = vec![Record::new().with("name", "Cash").with("alterID", 1)];
        let remote = vec![Record::new().with("alterID", 1).with("name", "Cash")];
        let report = detect_conflicts(&EntityType::Ledger, &local, &remote);
        assert_eq!(report.total_conflicts, 0);
    }

    #[test]
    fn records_without_id_are_skipped() {
        let local = vec![Record::new().with("name", "Orphan"), rec(1, "A")];
        let remote = vec![rec(1, "A")];
        let report = detect_conflicts(&EntityType::Ledger, &local, &remote);
        assert_eq!(report.total_conflicts, 0);
        assert_eq!(report.skipped_without_id, 1);
    }

    #[test]
    fn find_entry() {
        let report = detect_conflicts(&EntityType::Unit, &[rec(5, "Nos")], &[]);
        let entry = report.find(&StableId::from(5)).unwrap();
        assert_eq!(entry.kind, ConflictKind::MissingRemotely);
        assert!(report.find(&StableId::from(6)).is_none());
    }

    #[test]
    fn resolution_records_decision() {
        let report = detect_conflicts(&EntityType::Ledger, &[], &[rec(9, "Old")]);
        let entry = &report.conflicts_by_kind.missing_locally[0];

        let record = resolve_conflict(entry, ResolutionStrategy::UseRemote);
        assert!(record.success);
        assert_eq!(record.stable_id, StableId::from(9));
        assert_eq!(record.kind, ConflictKind::MissingLocally);
        assert_eq!(record.message, "Using remote version of Old");

        let record = resolve_conflict(entry, ResolutionStrategy::Skip);
        assert_eq!(record.message, "Skipped conflict for Old");
    }

    #[test]
    fn strategy_names() {
        for strategy in [
            ResolutionStrategy::UseLocal,
            ResolutionStrategy::UseRemote,
            ResolutionStrategy::Merge,
            ResolutionStrategy::Skip,
        ] {
            assert_eq!(strategy.as_str().parse::<ResolutionStrategy>().unwrap(), strategy);
        }
        assert!(matches!(
            "keepBoth".parse::<ResolutionStrategy>(),
            Err(ProtocolError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = detect_conflicts(&EntityType::Ledger, &[rec(1, "A")], &[]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "CONFLICTS_FOUND");
        assert_eq!(json["totalConflicts"], 1);
        assert_eq!(json["conflictsByKind"]["missingRemotely"][0]["stableId"], "1");
    }

    proptest! {
        #[test]
        fn self_comparison_is_clean(ids in prop::collection::btree_set(0u64..500, 0..50)) {
            let records: Vec<Record> = ids.iter().map(|id| rec(*id, &format!("N{id}"))).collect();
            let report = detect_conflicts(&EntityType::Group, &records, &records);
            prop_assert_eq!(report.total_conflicts, 0);
            prop_assert_eq!(report.status, ConflictStatus::NoConflicts);
        }

        #[test]
        fn disjoint_sides_count_every_id(
            local_ids in prop::collection::btree_set(0u64..1000, 0..40),
            remote_ids in prop::collection::btree_set(1000u64..2000, 0..40),
        ) {
            let local: Vec<Record> = local_ids.iter().map(|id| rec(*id, "L")).collect();
            let remote: Vec<Record> = remote_ids.iter().map(|id| rec(*id, "R")).collect();
            let report = detect_conflicts(&EntityType::Group, &local, &remote);
            prop_assert_eq!(report.total_conflicts, local_ids.len() + remote_ids.len());
            prop_assert_eq!(report.conflicts_by_kind.missing_remotely.len(), local_ids.len());
            prop_assert_eq!(report.conflicts_by_kind.missing_locally.len(), remote_ids.len());
        }
    }
}
