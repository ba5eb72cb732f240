//! Sync orchestrator.
//!
//! One run walks the tenant list in order. Per tenant it extracts master
//! data, verifies each batch, pushes it to the backend and reports progress.
//!
//! ## Failure handling
//!
//! - A failing tenant is logged and the run moves on to the next one.
//! - A failing entity type marks its tenant failed; the other entity types
//!   of that tenant are still pushed.
//! - An authentication failure anywhere ends the run as failed.
//! - Verification failures and conflicts are reported, never fatal.

use crate::collaborators::{AuthProvider, Extractor, Ingestor, Notifier, SyncKind, TenantDirectory};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::ReconciliationEngine;
use crate::state::StateGuard;
use ledgersync_protocol::{
    ConflictReport, EntityType, MasterData, Notification, Record, Tenant, TriggerType,
    VerificationResult,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The collaborators a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Local accounting engine.
    pub extractor: Arc<dyn Extractor>,
    /// Backend record store.
    pub ingestor: Arc<dyn Ingestor>,
    /// Tenant listing.
    pub directory: Arc<dyn TenantDirectory>,
    /// Current credentials.
    pub auth: Arc<dyn AuthProvider>,
    /// User notifications.
    pub notifier: Arc<dyn Notifier>,
}

/// How one tenant fared in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum TenantStatus {
    /// Every batch was pushed.
    Synced,
    /// Extraction returned nothing.
    NoNewData,
    /// Extraction or at least one push failed.
    Failed(String),
}

/// Result of one tenant within a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantOutcome {
    /// Tenant identifier.
    pub tenant_id: String,
    /// Tenant label.
    pub tenant: String,
    /// Extraction kind used.
    pub kind: SyncKind,
    /// Outcome.
    pub status: TenantStatus,
    /// Records the backend accepted.
    pub records_pushed: usize,
    /// Verification result per pushed batch.
    pub verifications: Vec<VerificationResult>,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: Option<Uuid>,
    /// Trigger of the run.
    pub trigger_type: TriggerType,
    /// Per-tenant results, in processing order.
    pub tenants: Vec<TenantOutcome>,
    /// Conflict reports of the reconciliation pass.
    pub reconciliation: Vec<ConflictReport>,
}

impl RunSummary {
    /// Number of tenants processed.
    pub fn total_tenants(&self) -> usize {
        self.tenants.len()
    }

    /// Number of tenants that did not fail.
    pub fn synced_tenants(&self) -> usize {
        self.tenants
            .iter()
            .filter(|t| !matches!(t.status, TenantStatus::Failed(_)))
            .count()
    }

    /// Number of failed tenants.
    pub fn failed_tenants(&self) -> usize {
        self.total_tenants() - self.synced_tenants()
    }

    /// Records accepted by the backend across all tenants.
    pub fn records_pushed(&self) -> usize {
        self.tenants.iter().map(|t| t.records_pushed).sum()
    }

    /// Conflicts found by the reconciliation pass.
    pub fn total_conflicts(&self) -> usize {
        self.reconciliation.iter().map(|r| r.total_conflicts).sum()
    }
}

/// Outcome of [`Orchestrator::run_sync`].
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Another run was active; the request was queued.
    Queued,
    /// The run was admitted and finished.
    Completed(RunSummary),
}

impl RunOutcome {
    /// Returns true if the request was queued.
    pub fn is_queued(&self) -> bool {
        matches!(self, RunOutcome::Queued)
    }

    /// Returns the summary of a completed run.
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            RunOutcome::Completed(summary) => Some(summary),
            RunOutcome::Queued => None,
        }
    }
}

/// Runs sync end to end under the state guard.
pub struct Orchestrator {
    config: SyncConfig,
    state: StateGuard,
    reconciler: Arc<ReconciliationEngine>,
    collaborators: Collaborators,
    synced_this_process: Mutex<HashSet<String>>,
}

impl Orchestrator {
    /// Creates an orchestrator with its own state guard and reconciliation engine.
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Self {
        let state = StateGuard::from_config(&config);
        let reconciler = Arc::new(ReconciliationEngine::new(config.audit_limit));
        Self {
            config,
            state,
            reconciler,
            collaborators,
            synced_this_process: Mutex::new(HashSet::new()),
        }
    }

    /// Uses a shared state guard.
    pub fn with_state(mut self, state: StateGuard) -> Self {
        self.state = state;
        self
    }

    /// Uses a shared reconciliation engine.
    pub fn with_reconciler(mut self, reconciler: Arc<ReconciliationEngine>) -> Self {
        self.reconciler = reconciler;
        self
    }

    /// Returns the state guard.
    pub fn state(&self) -> &StateGuard {
        &self.state
    }

    /// Returns the reconciliation engine.
    pub fn reconciler(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciler
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns true if the local accounting engine answers.
    pub async fn probe(&self) -> bool {
        self.collaborators.extractor.probe(self.config.local_port).await
    }

    /// Runs a sync, or queues it if a run is active.
    pub async fn run_sync(&self, trigger: TriggerType) -> SyncResult<RunOutcome> {
        self.run_sync_with(trigger, serde_json::Value::Null).await
    }

    /// Runs a sync, attaching `payload` to the request if it gets queued.
    pub async fn run_sync_with(
        &self,
        trigger: TriggerType,
        payload: serde_json::Value,
    ) -> SyncResult<RunOutcome> {
        if !self.state.start_sync_with(trigger, 0, payload) {
            let depth = self.state.queue_depth();
            self.notify(Notification::warning(
                "Sync Queued",
                format!("Sync queued. {depth} request(s) waiting"),
            ));
            return Ok(RunOutcome::Queued);
        }

        self.run_admitted(trigger).await.map(RunOutcome::Completed)
    }

    /// Admits the request released from the wait queue and runs it.
    ///
    /// Returns `None` if a run is active or nothing has been released.
    pub async fn run_next(&self) -> Option<SyncResult<RunOutcome>> {
        let request = self.state.start_next()?;
        info!(
            origin = %request.trigger_type,
            requested_at = request.requested_at,
            "running queued sync"
        );
        Some(
            self.run_admitted(TriggerType::Queued)
                .await
                .map(RunOutcome::Completed),
        )
    }

    async fn run_admitted(&self, trigger: TriggerType) -> SyncResult<RunSummary> {
        let admission = Admission::new(&self.state);
        let run_id = self.state.status().active.map(|run| run.id);
        let result = self.execute(trigger, run_id).await;

        match result {
            Ok((mut summary, extracted)) => {
                let total = summary.total_tenants();
                let synced = summary.synced_tenants();
                admission.end(true, format!("{synced}/{total} tenants synced"));

                let mut text = format!("Synced {synced} of {total} companies");
                if summary.failed_tenants() > 0 {
                    text.push_str(&format!(", {} failed", summary.failed_tenants()));
                }
                self.notify(Notification::success("Sync Complete", text));

                if self.config.reconcile_after_run && synced > 0 {
                    tokio::time::sleep(self.config.reconciliation_delay).await;
                    summary.reconciliation = self.reconcile_all(&extracted).await;
                }
                Ok(summary)
            }
            Err(err) => {
                error!(trigger = %trigger, error = %err, "sync run failed");
                admission.end(false, err.to_string());
                if err.is_auth_failure() {
                    self.notify(Notification::error(
                        "Session Expired",
                        "Authentication failed. Please log in again.",
                    ));
                } else {
                    self.notify(Notification::error("Sync Failed", err.to_string()));
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        trigger: TriggerType,
        run_id: Option<Uuid>,
    ) -> SyncResult<(RunSummary, Vec<(Tenant, SyncKind, MasterData)>)> {
        if !self.collaborators.auth.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }

        let tenants = self.collaborators.directory.list_tenants().await?;
        self.state.set_total(tenants.len());
        info!(trigger = %trigger, tenants = tenants.len(), "sync run admitted");

        let mut summary = RunSummary {
            run_id,
            trigger_type: trigger,
            tenants: Vec::with_capacity(tenants.len()),
            reconciliation: Vec::new(),
        };
        let mut extracted = Vec::new();

        for (index, tenant) in tenants.iter().enumerate() {
            let kind = self.sync_kind(tenant);
            let outcome = match self.sync_tenant(tenant, kind).await {
                Ok((outcome, data)) => {
                    if let Some(data) = data {
                        extracted.push((tenant.clone(), kind, data));
                    }
                    outcome
                }
                Err(err) if err.is_auth_failure() => return Err(err),
                Err(err) => {
                    warn!(tenant = %tenant.name, error = %err, "tenant sync failed");
                    TenantOutcome {
                        tenant_id: tenant.id.clone(),
                        tenant: tenant.name.clone(),
                        kind,
                        status: TenantStatus::Failed(err.to_string()),
                        records_pushed: 0,
                        verifications: Vec::new(),
                    }
                }
            };
            summary.tenants.push(outcome);
            self.state.update_progress(index + 1, Some(&tenant.name));

            if index + 1 < tenants.len() && !self.config.inter_tenant_delay.is_zero() {
                tokio::time::sleep(self.config.inter_tenant_delay).await;
            }
        }

        Ok((summary, extracted))
    }

    fn sync_kind(&self, tenant: &Tenant) -> SyncKind {
        let first_sync = tenant.last_sync_date.is_none()
            && !self.synced_this_process.lock().contains(&tenant.id);
        SyncKind::for_first_sync(first_sync)
    }

    /// Syncs one tenant. Returns the extracted data when there was any.
    async fn sync_tenant(
        &self,
        tenant: &Tenant,
        kind: SyncKind,
    ) -> SyncResult<(TenantOutcome, Option<MasterData>)> {
        let mut outcome = TenantOutcome {
            tenant_id: tenant.id.clone(),
            tenant: tenant.name.clone(),
            kind,
            status: TenantStatus::Synced,
            records_pushed: 0,
            verifications: Vec::new(),
        };

        let data = self
            .collaborators
            .extractor
            .fetch_master_data(&tenant.name, self.config.local_port, kind)
            .await?;

        if data.values().all(Vec::is_empty) {
            info!(tenant = %tenant.name, "no new data");
            outcome.status = TenantStatus::NoNewData;
            self.synced_this_process.lock().insert(tenant.id.clone());
            return Ok((outcome, None));
        }

        let mut failures = Vec::new();
        for (entity_type, records) in &data {
            if records.is_empty() {
                continue;
            }

            let result = self.reconciler.verify(entity_type, records);
            if !result.passed() {
                self.notify(Notification::warning(
                    "Verification Failed",
                    format!(
                        "{}: {} invalid of {} {} records",
                        tenant.name, result.invalid_records, result.total_records, entity_type
                    ),
                ));
            }

            let to_push = if self.config.skip_invalid_records && !result.passed() {
                valid_subset(records, &result)
            } else {
                records.clone()
            };
            outcome.verifications.push(result);

            if to_push.is_empty() {
                debug!(tenant = %tenant.name, entity_type = %entity_type, "nothing valid to push");
                continue;
            }

            match self
                .collaborators
                .ingestor
                .push_records(tenant, entity_type, &to_push, kind)
                .await
            {
                Ok(pushed) => {
                    debug!(
                        tenant = %tenant.name,
                        entity_type = %entity_type,
                        count = pushed.count,
                        "records pushed"
                    );
                    outcome.records_pushed += pushed.count;
                }
                Err(err) if err.is_auth_failure() => return Err(err),
                Err(err) => {
                    warn!(
                        tenant = %tenant.name,
                        entity_type = %entity_type,
                        error = %err,
                        "push failed"
                    );
                    failures.push(format!("{entity_type}: {err}"));
                }
            }
        }

        if failures.is_empty() {
            self.synced_this_process.lock().insert(tenant.id.clone());
            info!(tenant = %tenant.name, records = outcome.records_pushed, "tenant synced");
        } else {
            outcome.status = TenantStatus::Failed(failures.join("; "));
        }
        Ok((outcome, Some(data)))
    }

    async fn reconcile_all(
        &self,
        extracted: &[(Tenant, SyncKind, MasterData)],
    ) -> Vec<ConflictReport> {
        let mut reports = Vec::new();
        for (tenant, kind, data) in extracted {
            // Incremental batches hold only changes; compare against a full read.
            let result = if kind.is_initial() {
                self.reconcile_batches(tenant, data).await
            } else {
                self.reconcile_tenant(tenant).await
            };
            match result {
                Ok(mut tenant_reports) => reports.append(&mut tenant_reports),
                Err(err) if err.is_auth_failure() => {
                    warn!(error = %err, "reconciliation stopped");
                    break;
                }
                Err(err) => {
                    warn!(tenant = %tenant.name, error = %err, "reconciliation failed");
                }
            }
        }

        let conflicts: usize = reports.iter().map(|r| r.total_conflicts).sum();
        if conflicts > 0 {
            self.notify(Notification::warning(
                "Conflicts Detected",
                format!("Reconciliation found {conflicts} conflict(s)"),
            ));
        }
        reports
    }

    /// Compares a full extraction of one tenant with the backend's records.
    pub async fn reconcile_tenant(&self, tenant: &Tenant) -> SyncResult<Vec<ConflictReport>> {
        let data = self
            .collaborators
            .extractor
            .fetch_master_data(&tenant.name, self.config.local_port, SyncKind::Initial)
            .await?;
        self.reconcile_batches(tenant, &data).await
    }

    async fn reconcile_batches(
        &self,
        tenant: &Tenant,
        data: &MasterData,
    ) -> SyncResult<Vec<ConflictReport>> {
        let mut reports = Vec::new();
        for (entity_type, local) in data {
            if local.is_empty() {
                continue;
            }
            let remote = self.fetch_remote(tenant, entity_type).await?;
            let report = self
                .reconciler
                .detect_conflicts(entity_type, local, &remote);
            if report.has_conflicts() {
                info!(
                    tenant = %tenant.name,
                    entity_type = %entity_type,
                    conflicts = report.total_conflicts,
                    "reconciliation found conflicts"
                );
            }
            reports.push(report);
        }
        Ok(reports)
    }

    async fn fetch_remote(&self, tenant: &Tenant, entity_type: &EntityType) -> SyncResult<Vec<Record>> {
        self.collaborators
            .ingestor
            .fetch_remote_records(tenant, entity_type)
            .await
    }

    fn notify(&self, notification: Notification) {
        self.collaborators.notifier.notify(notification);
    }
}

/// Ends the admitted run as failed if its future is dropped before it ends.
struct Admission<'a> {
    state: &'a StateGuard,
    ended: bool,
}

impl<'a> Admission<'a> {
    fn new(state: &'a StateGuard) -> Self {
        Self { state, ended: false }
    }

    fn end(mut self, success: bool, message: String) {
        self.ended = true;
        self.state.end_sync(success, message);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.ended {
            warn!("sync run dropped before it ended");
            self.state.end_sync(false, "sync cancelled");
        }
    }
}

fn valid_subset(records: &[Record], result: &VerificationResult) -> Vec<Record> {
    let invalid: HashSet<usize> = result
        .missing_field_records
        .iter()
        .map(|r| r.index)
        .chain(result.failed_validations.iter().map(|r| r.index))
        .collect();
    records
        .iter()
        .enumerate()
        .filter(|(index, _)| !invalid.contains(index))
        .map(|(_, record)| record.clone())
        .collect()
}
