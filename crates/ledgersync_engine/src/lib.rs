//! # ledgersync engine
//!
//! Sync orchestration and consistency core for ledgersync.
//!
//! This crate provides:
//! - Sync state guard (single-flight admission, progress, FIFO wait queue)
//! - Reconciliation engine with a bounded audit log and report export
//! - Sync orchestrator (tenant-by-tenant extract → verify → ingest)
//! - Startup, interval and manual triggers
//! - Session guard enforcing one active device per account
//! - HTTP backend client over an abstract HTTP client
//! - In-memory collaborators for tests and embedding
//!
//! ## Architecture
//!
//! ```text
//! trigger → StateGuard (admit or queue) → Orchestrator
//!     → per tenant: Extractor → ReconciliationEngine → Ingestor → progress
//!     → end of run → queued request drained → Notifier
//! ```
//!
//! ## Key Invariants
//!
//! - At most one run is active per process
//! - Queued requests are drained strictly in arrival order
//! - An admitted run always ends; stopping the scheduler never strands it
//! - Tenants are processed sequentially, in directory order
//! - A tenant failure never aborts the run; an authentication failure does
//! - Conflicts are reported, never resolved automatically
//! - Only the session authority decides whether a session is valid

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collaborators;
mod config;
mod error;
mod http;
pub mod memory;
mod orchestrator;
mod reconcile;
mod scheduler;
mod service;
mod session;
mod state;

pub use collaborators::{
    AuthProvider, CredentialStore, Extractor, Ingestor, LogoutHook, Notifier, PushOutcome,
    RestartHook, SessionChannel, SessionCheck, SessionConnector, StatusPoller, SyncKind,
    TenantDirectory,
};
pub use config::{AppSettings, RetryConfig, SchedulerConfig, SessionConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::{BackendClient, HttpClient, HttpResponse};
pub use orchestrator::{
    Collaborators, Orchestrator, RunOutcome, RunSummary, TenantOutcome, TenantStatus,
};
pub use reconcile::{AuditEntry, ReconciliationEngine, ReconciliationReport, REPORT_ENTRY_LIMIT};
pub use scheduler::Scheduler;
pub use service::{ServiceStatus, SyncService, SyncServiceBuilder};
pub use session::{session_url, SessionCollaborators, SessionGuard, SessionState, SessionStatus};
pub use state::{GuardStatus, StateGuard};
