//! Collaborator seams.
//!
//! The engine reaches the accounting engine, the backend, the session
//! authority and the user only through these traits. In-memory
//! implementations live in [`crate::memory`].

use crate::error::SyncResult;
use async_trait::async_trait;
use ledgersync_protocol::{EntityType, MasterData, Notification, Record, SessionTicket, Tenant};
use serde::{Deserialize, Serialize};

/// Kind of extraction and ingestion requested for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncKind {
    /// Everything, on a tenant's first sync.
    Initial,
    /// Changes since the last sync.
    Incremental,
}

impl SyncKind {
    /// Returns `Initial` for a first sync.
    pub fn for_first_sync(first_sync: bool) -> Self {
        if first_sync {
            SyncKind::Initial
        } else {
            SyncKind::Incremental
        }
    }

    /// Returns true for `Initial`.
    pub fn is_initial(&self) -> bool {
        matches!(self, SyncKind::Initial)
    }
}

/// Backend acknowledgement of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    /// Whether the backend accepted the batch.
    pub success: bool,
    /// Records accepted.
    #[serde(default)]
    pub count: usize,
}

/// Reads master data from the local accounting engine.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetches per-entity-type records for a tenant.
    async fn fetch_master_data(
        &self,
        tenant: &str,
        local_port: u16,
        kind: SyncKind,
    ) -> SyncResult<MasterData>;

    /// Returns true if the accounting engine answers on `local_port`.
    async fn probe(&self, local_port: u16) -> bool;
}

/// Writes records to, and reads them back from, the backend.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Pushes one entity type's records for a tenant. Never retried.
    async fn push_records(
        &self,
        tenant: &Tenant,
        entity_type: &EntityType,
        records: &[Record],
        kind: SyncKind,
    ) -> SyncResult<PushOutcome>;

    /// Fetches the backend's records of one entity type for a tenant.
    async fn fetch_remote_records(
        &self,
        tenant: &Tenant,
        entity_type: &EntityType,
    ) -> SyncResult<Vec<Record>>;
}

/// Lists the tenants of the current user.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Returns the tenants in processing order.
    async fn list_tenants(&self) -> SyncResult<Vec<Tenant>>;
}

/// Supplies the current credentials.
pub trait AuthProvider: Send + Sync {
    /// Returns the current ticket, if logged in.
    fn ticket(&self) -> Option<SessionTicket>;

    /// Returns true if a complete ticket is available.
    fn is_authenticated(&self) -> bool {
        self.ticket().is_some_and(|ticket| ticket.is_complete())
    }
}

/// Local storage of credentials and cached session data.
pub trait CredentialStore: Send + Sync {
    /// Removes every cached credential and session artifact.
    fn purge(&self) -> SyncResult<()>;
}

/// Push-only sink for user notifications.
pub trait Notifier: Send + Sync {
    /// Shows a notification.
    fn notify(&self, notification: Notification);
}

/// Application-level logout.
#[async_trait]
pub trait LogoutHook: Send + Sync {
    /// Logs the user out.
    async fn logout(&self, reason: &str) -> SyncResult<()>;
}

/// Last-resort recovery when logout is unavailable.
pub trait RestartHook: Send + Sync {
    /// Restarts the application.
    fn restart(&self);
}

/// Opens channels to the session authority.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connects to `url`, which already carries the credentials.
    async fn connect(&self, url: &str) -> SyncResult<Box<dyn SessionChannel>>;
}

/// An open, bidirectional text channel to the session authority.
#[async_trait]
pub trait SessionChannel: Send {
    /// Sends a text frame.
    async fn send(&mut self, text: String) -> SyncResult<()>;

    /// Waits for the next text frame. `None` means the channel was lost.
    ///
    /// Must be cancel-safe.
    async fn recv(&mut self) -> Option<String>;

    /// Closes the channel.
    async fn close(&mut self);
}

/// Session validity as reported by a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCheck {
    /// The session is still valid.
    Valid,
    /// The authority invalidated the session.
    Invalidated(String),
}

/// Polls the session authority when no channel can be held open.
#[async_trait]
pub trait StatusPoller: Send + Sync {
    /// Asks the authority whether the session is still valid.
    async fn check_session(&self, ticket: &SessionTicket) -> SyncResult<SessionCheck>;
}
