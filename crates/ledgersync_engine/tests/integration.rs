//! Integration tests for the sync service over an in-memory backend.

use async_trait::async_trait;
use ledgersync_engine::memory::{
    MemoryExtractor, MemoryStatusPoller, RecordingLogout, RecordingNotifier, ScriptedConnector,
    StaticAuth,
};
use ledgersync_engine::{
    AppSettings, BackendClient, HttpClient, HttpResponse, RetryConfig, RunOutcome, SchedulerConfig,
    SessionState, SyncError, SyncService, TenantStatus,
};
use ledgersync_protocol::{
    EntityType, NotificationKind, Record, RunState, SessionTicket, SyncEvent, TriggerType,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const BACKEND: &str = "http://backend.test";

/// Backend holding companies and pushed records in memory.
#[derive(Default)]
struct FakeBackend {
    companies: Mutex<Vec<Value>>,
    store: Mutex<HashMap<(String, String), Vec<Value>>>,
    posts: Mutex<Vec<(String, Value, Vec<(String, String)>)>>,
    unauthorized: AtomicBool,
}

impl FakeBackend {
    fn with_companies(companies: Vec<Value>) -> Arc<Self> {
        let backend = Self::default();
        *backend.companies.lock() = companies;
        Arc::new(backend)
    }

    fn posts(&self) -> Vec<(String, Value, Vec<(String, String)>)> {
        self.posts.lock().clone()
    }

    fn seed(&self, path: &str, cmp_id: &str, records: Vec<Value>) {
        self.store
            .lock()
            .insert((path.to_string(), cmp_id.to_string()), records);
    }
}

struct FakeHttp(Arc<FakeBackend>);

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get(&self, url: &str, _headers: &[(String, String)]) -> Result<HttpResponse, String> {
        let url = Url::parse(url).map_err(|e| e.to_string())?;
        if url.path() == "/companies" {
            let companies = self.0.companies.lock().clone();
            return Ok(HttpResponse::json(&json!({"success": true, "data": companies})));
        }

        let cmp_id = url
            .query_pairs()
            .find(|(key, _)| key == "cmpId")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();
        let records = self
            .0
            .store
            .lock()
            .get(&(url.path().to_string(), cmp_id))
            .cloned()
            .unwrap_or_default();
        Ok(HttpResponse::json(&json!({"success": true, "data": records})))
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, String> {
        if self.0.unauthorized.load(Ordering::SeqCst) {
            return Ok(HttpResponse::new(401, "unauthorized"));
        }

        let url = Url::parse(url).map_err(|e| e.to_string())?;
        let payload: Value = serde_json::from_slice(&body).map_err(|e| e.to_string())?;
        let cmp_id = payload["cmpId"].as_str().unwrap_or_default().to_string();
        let records: Vec<Value> = payload
            .as_object()
            .and_then(|object| object.values().find_map(|v| v.as_array().cloned()))
            .unwrap_or_default();

        let count = records.len();
        {
            let mut store = self.0.store.lock();
            let stored = store
                .entry((url.path().to_string(), cmp_id))
                .or_default();
            for record in records {
                match stored
                    .iter_mut()
                    .find(|existing| existing["alterID"] == record["alterID"])
                {
                    Some(existing) => *existing = record,
                    None => stored.push(record),
                }
            }
        }

        self.0
            .posts
            .lock()
            .push((url.path().to_string(), payload, headers.to_vec()));
        Ok(HttpResponse::json(
            &json!({"success": true, "count": count, "message": "stored"}),
        ))
    }
}

fn settings() -> AppSettings {
    let mut settings = AppSettings::new(BACKEND);
    settings.sync = settings
        .sync
        .clone()
        .with_inter_tenant_delay(Duration::ZERO)
        .with_reconciliation_delay(Duration::ZERO)
        .with_queue_grace_delay(Duration::ZERO)
        .with_read_retry(RetryConfig::no_retry());
    settings.scheduler = SchedulerConfig::new()
        .with_sync_on_startup(false)
        .with_background_enabled(false);
    settings.session = settings
        .session
        .clone()
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_reconnect(RetryConfig::constant(1, Duration::from_millis(5)))
        .with_poll_interval(Duration::from_millis(15));
    settings
}

fn ledger(id: u64, name: &str) -> Record {
    Record::named(id, name).with("accountType", "Asset")
}

struct World {
    backend: Arc<FakeBackend>,
    extractor: Arc<MemoryExtractor>,
    auth: Arc<StaticAuth>,
    notifier: Arc<RecordingNotifier>,
    service: SyncService,
}

fn world() -> World {
    let backend = FakeBackend::with_companies(vec![
        json!({"id": 11, "name": "Acme Traders"}),
        json!({"id": "c-22", "name": "Globex", "lastSyncDate": "2024-03-01"}),
    ]);
    let extractor = Arc::new(MemoryExtractor::new());
    extractor.add_batch(
        "Acme Traders",
        EntityType::Ledger,
        vec![ledger(1, "Cash"), ledger(2, "Bank")],
    );
    extractor.add_batch(
        "Globex",
        EntityType::Group,
        vec![Record::named(5, "Assets").with("groupName", "Primary")],
    );

    let auth = Arc::new(StaticAuth::new(SessionTicket::new("tok", "dev-1", "user-9")));
    let notifier = Arc::new(RecordingNotifier::new());
    let settings = settings();
    let client = BackendClient::new(BACKEND, FakeHttp(backend.clone()), auth.clone())
        .with_config(&settings.sync);

    let service = SyncService::builder(settings)
        .with_extractor(extractor.clone())
        .with_backend(Arc::new(client))
        .with_auth_store(auth.clone())
        .with_notifier(notifier.clone())
        .build()
        .unwrap();

    World {
        backend,
        extractor,
        auth,
        notifier,
        service,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn full_run_pushes_every_tenant() {
    let w = world();
    let outcome = w.service.trigger_manual().await.unwrap();
    let summary = outcome.summary().unwrap();

    assert_eq!(summary.total_tenants(), 2);
    assert_eq!(summary.synced_tenants(), 2);
    assert_eq!(summary.records_pushed(), 3);
    assert_eq!(summary.tenants[0].tenant_id, "11");

    let posts = w.backend.posts();
    assert_eq!(posts.len(), 2);

    let (path, payload, headers) = &posts[0];
    assert_eq!(path, "/sync/ledgers");
    assert_eq!(payload["cmpId"], "11");
    assert_eq!(payload["userId"], "user-9");
    assert_eq!(payload["syncType"], "INITIAL");
    assert_eq!(payload["ledger"].as_array().unwrap().len(), 2);
    assert!(headers
        .iter()
        .any(|(name, value)| name == "Authorization" && value == "Bearer tok"));
    assert!(headers
        .iter()
        .any(|(name, value)| name == "X-Device-Token" && value == "dev-1"));

    let (path, payload, _) = &posts[1];
    assert_eq!(path, "/sync/groups");
    assert_eq!(payload["syncType"], "INCREMENTAL");

    // The reconciliation pass found the backend in step with the local engine.
    assert_eq!(summary.reconciliation.len(), 2);
    assert_eq!(summary.total_conflicts(), 0);

    let run = &w.service.history(1)[0];
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.processed_tenants, 2);
    assert_eq!(w.notifier.of_kind(NotificationKind::Success).len(), 1);
}

#[tokio::test]
async fn reconciliation_reports_divergence() {
    let w = world();
    w.backend.seed(
        "/sync/ledgers",
        "11",
        vec![json!({"alterID": 3, "name": "Petty Cash", "accountType": "Asset"})],
    );
    w.extractor.add_batch(
        "Globex",
        EntityType::Group,
        vec![Record::named(5, "Assets Renamed").with("groupName", "Primary")],
    );
    w.backend.seed(
        "/sync/groups",
        "c-22",
        vec![json!({"alterID": 6, "name": "Old", "groupName": "Primary"})],
    );

    let outcome = w.service.trigger_manual().await.unwrap();
    let summary = outcome.summary().unwrap();

    // Acme: id 3 exists only remotely. Globex: id 6 exists only remotely.
    assert_eq!(summary.total_conflicts(), 2);
    let acme = &summary.reconciliation[0];
    assert_eq!(acme.conflicts_by_kind.missing_locally.len(), 1);

    let report = w.service.reconciler().generate_report();
    assert_eq!(report.total_conflicts, 2);
    assert!(w
        .notifier
        .of_kind(NotificationKind::Warning)
        .iter()
        .any(|n| n.title == "Conflicts Detected"));

    let dir = tempfile::tempdir().unwrap();
    let path = w.service.export_report(dir.path()).unwrap();
    let exported: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(exported["totalConflicts"], 2);
}

#[tokio::test]
async fn tenant_failure_does_not_abort_the_run() {
    let w = world();
    w.extractor.fail_tenant("Acme Traders");

    let outcome = w.service.trigger_manual().await.unwrap();
    let summary = outcome.summary().unwrap();
    assert!(matches!(summary.tenants[0].status, TenantStatus::Failed(_)));
    assert_eq!(summary.tenants[1].status, TenantStatus::Synced);
    assert_eq!(w.backend.posts().len(), 1);
    assert_eq!(w.service.history(1)[0].state, RunState::Completed);
}

#[tokio::test]
async fn unauthorized_push_fails_the_run() {
    let w = world();
    w.backend.unauthorized.store(true, Ordering::SeqCst);

    let err = w.service.trigger_manual().await.unwrap_err();
    assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    assert_eq!(w.service.history(1)[0].state, RunState::Failed);
    assert!(!w.service.status().sync.in_progress);

    // Aborted at the first tenant.
    assert_eq!(w.extractor.calls().len(), 1);
    let errors = w.notifier.of_kind(NotificationKind::Error);
    assert!(errors[0].message.contains("log in again"));
}

#[tokio::test]
async fn queued_triggers_drain_in_arrival_order() {
    let w = world();
    let mut events = w.service.subscribe();
    w.service.start();

    let state = w.service.orchestrator().state().clone();
    assert!(state.start_sync(TriggerType::Startup, 0));

    assert!(w.service.trigger_manual().await.unwrap().is_queued());
    let outcome = w
        .service
        .orchestrator()
        .run_sync(TriggerType::Interval)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Queued));
    assert_eq!(w.service.queue_depth(), 2);

    let queued = w.notifier.of_kind(NotificationKind::Warning);
    assert_eq!(queued[1].message, "Sync queued. 2 request(s) waiting");

    state.end_sync(true, "startup finished");
    assert!(wait_until(|| w.service.history(10).len() == 3).await);
    assert_eq!(w.service.queue_depth(), 0);

    let mut released = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ProcessNext(request) = event {
            released.push(request.trigger_type);
        }
    }
    assert_eq!(released, vec![TriggerType::Manual, TriggerType::Interval]);

    let triggers: Vec<_> = w
        .service
        .history(10)
        .iter()
        .map(|run| run.trigger_type)
        .collect();
    assert_eq!(
        triggers,
        vec![TriggerType::Queued, TriggerType::Queued, TriggerType::Startup]
    );
    w.service.shutdown();
}

#[tokio::test]
async fn session_invalidation_ends_authenticated_state() {
    let backend = FakeBackend::with_companies(vec![json!({"id": 1, "name": "Acme"})]);
    let auth = Arc::new(StaticAuth::new(SessionTicket::new("tok", "dev-1", "user-9")));
    let connector = Arc::new(ScriptedConnector::new());
    let channel = connector.accept();
    let logout = Arc::new(RecordingLogout::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let service = SyncService::builder(settings())
        .with_extractor(Arc::new(MemoryExtractor::new()))
        .with_backend(Arc::new(BackendClient::new(
            BACKEND,
            FakeHttp(backend),
            auth.clone(),
        )))
        .with_auth_store(auth.clone())
        .with_notifier(notifier.clone())
        .with_session(connector.clone(), Arc::new(MemoryStatusPoller::new()))
        .with_logout_hook(logout.clone())
        .build()
        .unwrap();
    service.start();

    assert!(wait_until(|| service.status().session.is_some_and(|s| s.connected)).await);
    assert!(connector.attempts()[0].starts_with("ws://backend.test/session?token=tok"));

    channel.push(r#"{"type":"SESSION_INVALIDATED"}"#);
    assert!(wait_until(|| !logout.reasons().is_empty()).await);

    let session = service.status().session.unwrap();
    assert_eq!(session.state, SessionState::LoggedOut);
    assert!(!session.authenticated);
    assert_eq!(auth.purge_count(), 1);
    assert_eq!(
        notifier.of_kind(NotificationKind::Error)[0].message,
        "You have been logged in from another device"
    );

    // Credentials are gone, so sync refuses to run.
    let err = service.trigger_manual().await.unwrap_err();
    assert!(matches!(err, SyncError::NotAuthenticated));
    service.shutdown();
}

#[tokio::test]
async fn lost_session_falls_back_to_polling() {
    let w = world();
    let connector = Arc::new(ScriptedConnector::new());
    let channel = connector.accept();
    let poller = Arc::new(MemoryStatusPoller::new());

    let client = BackendClient::new(BACKEND, FakeHttp(w.backend.clone()), w.auth.clone());
    let service = SyncService::builder(settings())
        .with_extractor(w.extractor.clone())
        .with_backend(Arc::new(client))
        .with_auth_store(w.auth.clone())
        .with_session(connector.clone(), poller.clone())
        .build()
        .unwrap();
    service.start();

    assert!(wait_until(|| service.status().session.is_some_and(|s| s.connected)).await);
    channel.disconnect();

    assert!(wait_until(|| service.status().session.is_some_and(|s| s.polling)).await);
    let session = service.status().session.unwrap();
    assert!(!session.heartbeat_active);
    assert_eq!(session.reconnect_attempts, 1);
    assert!(wait_until(|| poller.poll_count() > 0).await);

    // Monitoring continues; the session itself is still valid.
    assert!(session.authenticated);
    service.shutdown();
}
