//! # ledgersync protocol
//!
//! Data model and pure reconciliation logic for ledgersync.
//!
//! This crate provides:
//! - `Record`, `StableId` and `EntityType` for extracted accounting masters
//! - Per-entity verification rules and `VerificationResult`
//! - Local/remote divergence detection (`ConflictReport`) and explicit
//!   resolution records
//! - Sync run, request and lifecycle event types
//! - Session authority wire messages and user notifications
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod notification;
mod record;
mod run;
mod session;
mod verify;

pub use conflict::{
    detect_conflicts, resolve_conflict, ConflictEntry, ConflictKind, ConflictReport,
    ConflictStatus, ConflictsByKind, ResolutionRecord, ResolutionStrategy,
};
pub use error::{ProtocolError, ProtocolResult};
pub use notification::{Notification, NotificationKind};
pub use record::{EntityType, MasterData, Record, StableId, Tenant, TenantRecordSet};
pub use run::{ProgressUpdate, RunState, SyncEvent, SyncRequest, SyncRun, TriggerType};
pub use session::{InboundMessage, OutboundMessage, SessionTicket};
pub use verify::{
    DuplicateRecord, FailedValidation, MissingFieldRecord, RecordPredicate, RuleSet,
    VerificationResult, VerificationRule, VerificationStatus,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time as Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
