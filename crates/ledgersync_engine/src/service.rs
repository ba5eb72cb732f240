//! Composition root.
//!
//! [`SyncService`] wires the state guard, reconciliation engine,
//! orchestrator, scheduler and session guard of one process and gives them a
//! single start/shutdown lifecycle.

use crate::collaborators::{
    AuthProvider, CredentialStore, Extractor, Ingestor, LogoutHook, Notifier, RestartHook,
    SessionConnector, StatusPoller, TenantDirectory,
};
use crate::config::{AppSettings, SchedulerConfig};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{Collaborators, Orchestrator, RunOutcome};
use crate::reconcile::ReconciliationEngine;
use crate::scheduler::Scheduler;
use crate::session::{SessionCollaborators, SessionGuard, SessionStatus};
use crate::state::GuardStatus;
use ledgersync_protocol::{Notification, NotificationKind, SyncEvent, SyncRun};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Notifier that writes to the log. Used when none is supplied.
struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Error => {
                error!(title = %notification.title, "{}", notification.message)
            }
            NotificationKind::Warning => {
                warn!(title = %notification.title, "{}", notification.message)
            }
            NotificationKind::Info | NotificationKind::Success => {
                info!(title = %notification.title, "{}", notification.message)
            }
        }
    }
}

/// Snapshot returned by [`SyncService::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Sync admission state.
    pub sync: GuardStatus,
    /// Session guard state, if session monitoring is configured.
    pub session: Option<SessionStatus>,
    /// Whether the interval trigger is enabled.
    pub background_enabled: bool,
    /// Whether the trigger tasks are running.
    pub scheduler_running: bool,
}

/// Builder for [`SyncService`].
pub struct SyncServiceBuilder {
    settings: AppSettings,
    extractor: Option<Arc<dyn Extractor>>,
    ingestor: Option<Arc<dyn Ingestor>>,
    directory: Option<Arc<dyn TenantDirectory>>,
    auth: Option<Arc<dyn AuthProvider>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    connector: Option<Arc<dyn SessionConnector>>,
    poller: Option<Arc<dyn StatusPoller>>,
    logout: Option<Arc<dyn LogoutHook>>,
    restart: Option<Arc<dyn RestartHook>>,
    reconciler: Option<Arc<ReconciliationEngine>>,
}

impl SyncServiceBuilder {
    /// Creates a builder with `settings` and no collaborators.
    pub fn new(settings: AppSettings) -> Self {
        Self {
            settings,
            extractor: None,
            ingestor: None,
            directory: None,
            auth: None,
            credentials: None,
            notifier: None,
            connector: None,
            poller: None,
            logout: None,
            restart: None,
            reconciler: None,
        }
    }

    /// Sets the extraction collaborator.
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Sets the ingestion collaborator.
    pub fn with_ingestor(mut self, ingestor: Arc<dyn Ingestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    /// Sets the tenant directory.
    pub fn with_directory(mut self, directory: Arc<dyn TenantDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Uses one backend for both ingestion and the tenant directory.
    pub fn with_backend<B>(mut self, backend: Arc<B>) -> Self
    where
        B: Ingestor + TenantDirectory + 'static,
    {
        self.ingestor = Some(backend.clone() as Arc<dyn Ingestor>);
        self.directory = Some(backend as Arc<dyn TenantDirectory>);
        self
    }

    /// Sets the credential source.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets the local credential cache.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Uses one store as both credential source and credential cache.
    pub fn with_auth_store<A>(mut self, store: Arc<A>) -> Self
    where
        A: AuthProvider + CredentialStore + 'static,
    {
        self.auth = Some(store.clone() as Arc<dyn AuthProvider>);
        self.credentials = Some(store as Arc<dyn CredentialStore>);
        self
    }

    /// Sets the notification sink. Defaults to the log.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Enables session monitoring over `connector`, polling through `poller`.
    pub fn with_session(
        mut self,
        connector: Arc<dyn SessionConnector>,
        poller: Arc<dyn StatusPoller>,
    ) -> Self {
        self.connector = Some(connector);
        self.poller = Some(poller);
        self
    }

    /// Sets the logout hook run on session invalidation.
    pub fn with_logout_hook(mut self, hook: Arc<dyn LogoutHook>) -> Self {
        self.logout = Some(hook);
        self
    }

    /// Sets the restart hook used when logout is unavailable.
    pub fn with_restart_hook(mut self, hook: Arc<dyn RestartHook>) -> Self {
        self.restart = Some(hook);
        self
    }

    /// Shares a reconciliation engine, e.g. one with custom rules.
    pub fn with_reconciler(mut self, reconciler: Arc<ReconciliationEngine>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Builds the service. Nothing runs until [`SyncService::start`].
    pub fn build(self) -> SyncResult<SyncService> {
        let extractor = self.extractor.ok_or_else(|| missing("extractor"))?;
        let ingestor = self.ingestor.ok_or_else(|| missing("ingestor"))?;
        let directory = self.directory.ok_or_else(|| missing("tenant directory"))?;
        let auth = self.auth.ok_or_else(|| missing("auth provider"))?;
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(LogNotifier) as Arc<dyn Notifier>);
        let settings = self.settings;

        let reconciler = self
            .reconciler
            .unwrap_or_else(|| Arc::new(ReconciliationEngine::new(settings.sync.audit_limit)));

        let orchestrator = Arc::new(
            Orchestrator::new(
                settings.sync.clone(),
                Collaborators {
                    extractor,
                    ingestor,
                    directory,
                    auth: Arc::clone(&auth),
                    notifier: Arc::clone(&notifier),
                },
            )
            .with_reconciler(reconciler),
        );

        let scheduler = Scheduler::new(
            Arc::clone(&orchestrator),
            Arc::clone(&auth),
            settings.scheduler.clone(),
        );

        let session = match (self.connector, self.poller) {
            (Some(connector), Some(poller)) => {
                let credentials = self
                    .credentials
                    .ok_or_else(|| missing("credential store"))?;
                Some(SessionGuard::new(
                    settings.session.clone(),
                    SessionCollaborators {
                        auth,
                        credentials,
                        connector,
                        poller,
                        notifier,
                        logout: self.logout,
                        restart: self.restart,
                    },
                ))
            }
            _ => {
                info!("no session connector configured, session monitoring disabled");
                None
            }
        };

        Ok(SyncService {
            settings,
            orchestrator,
            scheduler,
            session,
        })
    }
}

fn missing(what: &str) -> SyncError {
    SyncError::Config(format!("{what} is required"))
}

/// The sync core of one process.
pub struct SyncService {
    settings: AppSettings,
    orchestrator: Arc<Orchestrator>,
    scheduler: Scheduler,
    session: Option<SessionGuard>,
}

impl SyncService {
    /// Starts building a service.
    pub fn builder(settings: AppSettings) -> SyncServiceBuilder {
        SyncServiceBuilder::new(settings)
    }

    /// Starts session monitoring and the triggers.
    pub fn start(&self) {
        if let Some(session) = &self.session {
            session.start();
        }
        self.scheduler.start();
        info!(backend = %self.settings.backend_url, "sync service started");
    }

    /// Stops the triggers and session monitoring and drops queued requests.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        if let Some(session) = &self.session {
            session.stop();
        }
        self.orchestrator.state().clear_queue();
        info!("sync service shut down");
    }

    /// Runs a manual sync.
    pub async fn trigger_manual(&self) -> SyncResult<RunOutcome> {
        self.scheduler.trigger_manual().await
    }

    /// Subscribes to run lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.orchestrator.state().subscribe()
    }

    /// Returns a snapshot of the service.
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            sync: self.orchestrator.state().status(),
            session: self.session.as_ref().map(SessionGuard::status),
            background_enabled: self.scheduler.background_enabled(),
            scheduler_running: self.scheduler.is_running(),
        }
    }

    /// Returns the number of queued requests.
    pub fn queue_depth(&self) -> usize {
        self.orchestrator.state().queue_depth()
    }

    /// Returns the most recent finished runs, newest first.
    pub fn history(&self, limit: usize) -> Vec<SyncRun> {
        self.orchestrator.state().history(limit)
    }

    /// Writes a reconciliation report into `dir`.
    pub fn export_report(&self, dir: impl AsRef<Path>) -> SyncResult<PathBuf> {
        self.orchestrator.reconciler().export_report(dir)
    }

    /// Enables or disables the interval trigger.
    pub fn set_background_enabled(&self, enabled: bool) {
        self.scheduler.set_background_enabled(enabled);
    }

    /// Applies changed trigger settings.
    pub fn apply_scheduler_config(&self, config: SchedulerConfig) {
        self.scheduler.restart(config);
    }

    /// Returns the settings the service was built with.
    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    /// Returns the orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Returns the reconciliation engine.
    pub fn reconciler(&self) -> &Arc<ReconciliationEngine> {
        self.orchestrator.reconciler()
    }

    /// Returns the session guard, if configured.
    pub fn session(&self) -> Option<&SessionGuard> {
        self.session.as_ref()
    }
}
