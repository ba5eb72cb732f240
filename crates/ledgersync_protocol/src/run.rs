//! Sync runs, queued requests and lifecycle events.

use crate::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What asked for a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Once per launch, after authentication.
    Startup,
    /// Fixed-period background trigger.
    Interval,
    /// User action.
    Manual,
    /// A request drained from the wait queue.
    Queued,
}

impl TriggerType {
    /// Returns the trigger's name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Startup => "startup",
            TriggerType::Interval => "interval",
            TriggerType::Manual => "manual",
            TriggerType::Queued => "queued",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Not yet admitted.
    Idle,
    /// Admitted and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with a run-level failure.
    Failed,
}

impl RunState {
    /// Returns true for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// One admitted, end-to-end execution of the orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    /// Run identifier.
    pub id: Uuid,
    /// Trigger that caused the run.
    pub trigger_type: TriggerType,
    /// Lifecycle state.
    pub state: RunState,
    /// Admission time (Unix millis).
    pub started_at: u64,
    /// Completion time (Unix millis), once terminal.
    pub finished_at: Option<u64>,
    /// Tenants to process.
    pub total_tenants: usize,
    /// Tenants processed so far.
    pub processed_tenants: usize,
    /// Tenant being processed.
    pub current_tenant: Option<String>,
    /// Final message, once terminal.
    pub message: Option<String>,
}

impl SyncRun {
    /// Creates a running run.
    pub fn start(trigger_type: TriggerType, total_tenants: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_type,
            state: RunState::Running,
            started_at: now_millis(),
            finished_at: None,
            total_tenants,
            processed_tenants: 0,
            current_tenant: None,
            message: None,
        }
    }

    /// Progress as a percentage, 0 when the total is unknown.
    pub fn progress_percent(&self) -> f64 {
        if self.total_tenants == 0 {
            0.0
        } else {
            self.processed_tenants as f64 / self.total_tenants as f64 * 100.0
        }
    }

    /// Milliseconds between admission and completion (or now).
    pub fn duration_ms(&self) -> u64 {
        self.finished_at
            .unwrap_or_else(now_millis)
            .saturating_sub(self.started_at)
    }

    /// Moves the run into a terminal state.
    pub fn finish(&mut self, success: bool, message: impl Into<String>) {
        self.state = if success {
            RunState::Completed
        } else {
            RunState::Failed
        };
        self.finished_at = Some(now_millis());
        self.message = Some(message.into());
    }
}

/// A trigger that fired while a run was active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Trigger that fired.
    pub trigger_type: TriggerType,
    /// When it fired (Unix millis).
    pub requested_at: u64,
    /// Trigger-specific data.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SyncRequest {
    /// Creates a request stamped with the current time.
    pub fn new(trigger_type: TriggerType, payload: serde_json::Value) -> Self {
        Self {
            trigger_type,
            requested_at: now_millis(),
            payload,
        }
    }
}

/// Progress snapshot of the active run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Run identifier.
    pub run_id: Uuid,
    /// Trigger of the run.
    pub trigger_type: TriggerType,
    /// Tenants processed so far.
    pub processed: usize,
    /// Tenants to process.
    pub total: usize,
    /// Tenant label last reported.
    pub current_tenant: Option<String>,
    /// Percentage complete.
    pub percent: f64,
}

/// Lifecycle event published by the state guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SyncEvent {
    /// A run was admitted.
    Started(SyncRun),
    /// The active run made progress.
    Progress(ProgressUpdate),
    /// The active run finished.
    Ended(SyncRun),
    /// A trigger was queued behind the active run.
    Queued(SyncRequest),
    /// The wait queue changed size.
    QueueUpdated {
        /// New queue depth.
        depth: usize,
    },
    /// The head of the queue should run now.
    ProcessNext(SyncRequest),
}

impl SyncEvent {
    /// Returns the event name.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Started(_) => "started",
            SyncEvent::Progress(_) => "progress",
            SyncEvent::Ended(_) => "ended",
            SyncEvent::Queued(_) => "queued",
            SyncEvent::QueueUpdated { .. } => "queue-updated",
            SyncEvent::ProcessNext(_) => "process-next",
        }
    }
}
