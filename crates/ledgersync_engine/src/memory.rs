//! In-memory collaborators for tests and embedding.

use crate::collaborators::{
    AuthProvider, CredentialStore, Extractor, Ingestor, LogoutHook, Notifier, PushOutcome,
    RestartHook, SessionChannel, SessionCheck, SessionConnector, StatusPoller, SyncKind,
    TenantDirectory,
};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use ledgersync_protocol::{
    EntityType, MasterData, Notification, NotificationKind, Record, SessionTicket, Tenant,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Extractor serving fixed master data per tenant.
#[derive(Default)]
pub struct MemoryExtractor {
    data: RwLock<BTreeMap<String, MasterData>>,
    failing: RwLock<HashSet<String>>,
    unreachable: AtomicBool,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<(String, SyncKind)>>,
}

impl MemoryExtractor {
    /// Creates an empty, reachable extractor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the master data of a tenant.
    pub fn set_master_data(&self, tenant: impl Into<String>, data: MasterData) {
        self.data.write().insert(tenant.into(), data);
    }

    /// Adds one batch to a tenant's master data.
    pub fn add_batch(&self, tenant: impl Into<String>, entity_type: EntityType, records: Vec<Record>) {
        self.data
            .write()
            .entry(tenant.into())
            .or_default()
            .insert(entity_type, records);
    }

    /// Makes extraction for a tenant fail.
    pub fn fail_tenant(&self, tenant: impl Into<String>) {
        self.failing.write().insert(tenant.into());
    }

    /// Sets whether the probe succeeds.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Delays every extraction by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Returns every extraction request made so far.
    pub fn calls(&self) -> Vec<(String, SyncKind)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Extractor for MemoryExtractor {
    async fn fetch_master_data(
        &self,
        tenant: &str,
        _local_port: u16,
        kind: SyncKind,
    ) -> SyncResult<MasterData> {
        self.calls.lock().push((tenant.to_string(), kind));

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SyncError::Extraction("accounting engine unreachable".into()));
        }
        if self.failing.read().contains(tenant) {
            return Err(SyncError::Extraction(format!("failed to read {tenant}")));
        }
        Ok(self.data.read().get(tenant).cloned().unwrap_or_default())
    }

    async fn probe(&self, _local_port: u16) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}

/// One push received by [`MemoryIngestor`].
#[derive(Debug, Clone, PartialEq)]
pub struct PushedBatch {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Entity type of the batch.
    pub entity_type: EntityType,
    /// Number of records pushed.
    pub count: usize,
    /// Requested sync kind.
    pub kind: SyncKind,
}

/// Backend store held in memory.
///
/// Pushed records are upserted by stable id.
#[derive(Default)]
pub struct MemoryIngestor {
    store: RwLock<BTreeMap<(String, EntityType), Vec<Record>>>,
    pushes: Mutex<Vec<PushedBatch>>,
    rejected: RwLock<HashSet<EntityType>>,
    unauthorized: AtomicBool,
    fetches: AtomicUsize,
}

impl MemoryIngestor {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored records of a tenant's entity type.
    pub fn set_remote_records(
        &self,
        tenant_id: impl Into<String>,
        entity_type: EntityType,
        records: Vec<Record>,
    ) {
        self.store
            .write()
            .insert((tenant_id.into(), entity_type), records);
    }

    /// Returns the stored records of a tenant's entity type.
    pub fn remote_records(&self, tenant_id: &str, entity_type: &EntityType) -> Vec<Record> {
        self.store
            .read()
            .get(&(tenant_id.to_string(), entity_type.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Makes pushes of an entity type fail.
    pub fn reject_entity_type(&self, entity_type: EntityType) {
        self.rejected.write().insert(entity_type);
    }

    /// Makes every call fail with an authentication error.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    /// Returns every accepted push so far.
    pub fn pushes(&self) -> Vec<PushedBatch> {
        self.pushes.lock().clone()
    }

    /// Returns the number of remote fetches so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_auth(&self) -> SyncResult<()> {
        if self.unauthorized.load(Ordering::SeqCst) {
            Err(SyncError::AuthenticationFailed("401 Unauthorized".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Ingestor for MemoryIngestor {
    async fn push_records(
        &self,
        tenant: &Tenant,
        entity_type: &EntityType,
        records: &[Record],
        kind: SyncKind,
    ) -> SyncResult<PushOutcome> {
        self.check_auth()?;
        if self.rejected.read().contains(entity_type) {
            return Err(SyncError::Ingestion(format!("{entity_type} rejected")));
        }

        let mut store = self.store.write();
        let stored = store
            .entry((tenant.id.clone(), entity_type.clone()))
            .or_default();
        for record in records {
            let id = record.stable_id();
            match stored
                .iter_mut()
                .find(|existing| id.is_some() && existing.stable_id() == id)
            {
                Some(existing) => *existing = record.clone(),
                None => stored.push(record.clone()),
            }
        }

        self.pushes.lock().push(PushedBatch {
            tenant_id: tenant.id.clone(),
            entity_type: entity_type.clone(),
            count: records.len(),
            kind,
        });
        Ok(PushOutcome {
            success: true,
            count: records.len(),
        })
    }

    async fn fetch_remote_records(
        &self,
        tenant: &Tenant,
        entity_type: &EntityType,
    ) -> SyncResult<Vec<Record>> {
        self.check_auth()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.remote_records(&tenant.id, entity_type))
    }
}

/// Tenant directory with a fixed list.
#[derive(Default)]
pub struct StaticDirectory {
    tenants: RwLock<Vec<Tenant>>,
    error: RwLock<Option<String>>,
}

impl StaticDirectory {
    /// Creates a directory listing `tenants`.
    pub fn new(tenants: Vec<Tenant>) -> Self {
        Self {
            tenants: RwLock::new(tenants),
            error: RwLock::new(None),
        }
    }

    /// Replaces the tenant list.
    pub fn set_tenants(&self, tenants: Vec<Tenant>) {
        *self.tenants.write() = tenants;
    }

    /// Makes listing fail with `message`, or succeed again with `None`.
    pub fn set_error(&self, message: Option<String>) {
        *self.error.write() = message;
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn list_tenants(&self) -> SyncResult<Vec<Tenant>> {
        if let Some(message) = self.error.read().clone() {
            return Err(SyncError::Directory(message));
        }
        Ok(self.tenants.read().clone())
    }
}

/// Credentials held in memory. Purging logs the user out.
#[derive(Default)]
pub struct StaticAuth {
    ticket: RwLock<Option<SessionTicket>>,
    purges: AtomicUsize,
}

impl StaticAuth {
    /// Creates a provider holding `ticket`.
    pub fn new(ticket: SessionTicket) -> Self {
        Self {
            ticket: RwLock::new(Some(ticket)),
            purges: AtomicUsize::new(0),
        }
    }

    /// Creates a provider with no credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Replaces the ticket.
    pub fn set_ticket(&self, ticket: Option<SessionTicket>) {
        *self.ticket.write() = ticket;
    }

    /// Returns how many times credentials were purged.
    pub fn purge_count(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }
}

impl AuthProvider for StaticAuth {
    fn ticket(&self) -> Option<SessionTicket> {
        self.ticket.read().clone()
    }
}

impl CredentialStore for StaticAuth {
    fn purge(&self) -> SyncResult<()> {
        *self.ticket.write() = None;
        self.purges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Notifier that keeps every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every notification so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Returns the notifications of one kind.
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

/// Logout hook that counts calls and can be made to fail.
#[derive(Default)]
pub struct RecordingLogout {
    reasons: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingLogout {
    /// Creates a succeeding hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hook whose logout always fails.
    pub fn failing() -> Self {
        let hook = Self::default();
        hook.fail.store(true, Ordering::SeqCst);
        hook
    }

    /// Returns the reasons passed so far.
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

#[async_trait]
impl LogoutHook for RecordingLogout {
    async fn logout(&self, reason: &str) -> SyncResult<()> {
        self.reasons.lock().push(reason.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        Ok(())
    }
}

/// Restart hook that counts calls.
#[derive(Default)]
pub struct RecordingRestart {
    restarts: AtomicUsize,
}

impl RecordingRestart {
    /// Creates a hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many restarts were requested.
    pub fn count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl RestartHook for RecordingRestart {
    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test side of a [`ScriptedConnector`] channel.
#[derive(Clone)]
pub struct ChannelHandle {
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Delivers a frame to the guard. Returns false once disconnected.
    pub fn push(&self, text: impl Into<String>) -> bool {
        match self.inbound.lock().as_ref() {
            Some(tx) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }

    /// Drops the connection from the authority's side.
    pub fn disconnect(&self) {
        self.inbound.lock().take();
    }

    /// Returns the frames the guard sent.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Returns true once the guard closed the channel.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedChannel {
    inbound: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SessionChannel for ScriptedChannel {
    async fn send(&mut self, text: String) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.inbound.close();
    }
}

enum Scripted {
    Accept(ScriptedChannel),
    Refuse(String),
}

/// Connector that plays back a script of connection outcomes.
///
/// Once the script is exhausted every connection attempt is refused.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Scripted>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    /// Creates a connector that refuses every attempt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an accepted connection and returns its test handle.
    pub fn accept(&self) -> ChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.script.lock().push_back(Scripted::Accept(ScriptedChannel {
            inbound: rx,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        }));
        ChannelHandle {
            inbound: Arc::new(Mutex::new(Some(tx))),
            sent,
            closed,
        }
    }

    /// Queues a refused connection.
    pub fn refuse(&self, message: impl Into<String>) {
        self.script
            .lock()
            .push_back(Scripted::Refuse(message.into()));
    }

    /// Returns every URL a connection was attempted with.
    pub fn attempts(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> SyncResult<Box<dyn SessionChannel>> {
        self.urls.lock().push(url.to_string());
        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Accept(channel)) => Ok(Box::new(channel)),
            Some(Scripted::Refuse(message)) => Err(SyncError::transport_retryable(message)),
            None => Err(SyncError::transport_retryable("connection refused")),
        }
    }
}

/// Status poller answering from a settable value.
pub struct MemoryStatusPoller {
    answer: RwLock<SessionCheck>,
    polls: AtomicUsize,
}

impl MemoryStatusPoller {
    /// Creates a poller reporting a valid session.
    pub fn new() -> Self {
        Self {
            answer: RwLock::new(SessionCheck::Valid),
            polls: AtomicUsize::new(0),
        }
    }

    /// Sets the next answers.
    pub fn set_answer(&self, answer: SessionCheck) {
        *self.answer.write() = answer;
    }

    /// Returns the number of polls so far.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStatusPoller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusPoller for MemoryStatusPoller {
    async fn check_session(&self, _ticket: &SessionTicket) -> SyncResult<SessionCheck> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ingestor_upserts_by_stable_id() {
        let ingestor = MemoryIngestor::new();
        let tenant = Tenant::new("c1", "Acme Ltd");

        ingestor
            .push_records(
                &tenant,
                &EntityType::Ledger,
                &[Record::named(1, "Cash"), Record::named(2, "Bank")],
                SyncKind::Initial,
            )
            .await
            .unwrap();
        ingestor
            .push_records(
                &tenant,
                &EntityType::Ledger,
                &[Record::named(2, "Bank of Acme")],
                SyncKind::Incremental,
            )
            .await
            .unwrap();

        let stored = ingestor
            .fetch_remote_records(&tenant, &EntityType::Ledger)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].name(), Some("Bank of Acme"));
        assert_eq!(ingestor.pushes().len(), 2);
        assert_eq!(ingestor.fetch_count(), 1);
    }

    #[tokio::test]
    async fn ingestor_auth_failure() {
        let ingestor = MemoryIngestor::new();
        ingestor.set_unauthorized(true);
        let err = ingestor
            .push_records(
                &Tenant::new("c1", "Acme"),
                &EntityType::Group,
                &[],
                SyncKind::Initial,
            )
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn extractor_failure_modes() {
        let extractor = MemoryExtractor::new();
        extractor.add_batch("Acme", EntityType::Group, vec![Record::named(1, "Assets")]);
        extractor.fail_tenant("Globex");

        let data = extractor
            .fetch_master_data("Acme", 9000, SyncKind::Initial)
            .await
            .unwrap();
        assert_eq!(data.len(), 1);
        assert!(extractor
            .fetch_master_data("Globex", 9000, SyncKind::Initial)
            .await
            .is_err());

        extractor.set_reachable(false);
        assert!(!extractor.probe(9000).await);
        assert_eq!(extractor.calls().len(), 2);
    }

    #[test]
    fn purge_clears_ticket() {
        let auth = StaticAuth::new(SessionTicket::new("t", "d", "u"));
        assert!(auth.is_authenticated());
        auth.purge().unwrap();
        assert!(!auth.is_authenticated());
        assert_eq!(auth.purge_count(), 1);
    }

    #[tokio::test]
    async fn scripted_connector_plays_script() {
        let connector = ScriptedConnector::new();
        connector.refuse("down");
        let handle = connector.accept();

        assert!(connector.connect("ws://a").await.is_err());
        let mut channel = connector.connect("ws://b").await.unwrap();
        assert!(connector.connect("ws://c").await.is_err());

        assert!(handle.push("hello"));
        assert_eq!(channel.recv().await.as_deref(), Some("hello"));
        channel.send("ping".into()).await.unwrap();
        assert_eq!(handle.sent(), vec!["ping".to_string()]);

        handle.disconnect();
        assert_eq!(channel.recv().await, None);

        channel.close().await;
        assert!(handle.is_closed());
        assert_eq!(connector.attempts().len(), 3);
    }
}
