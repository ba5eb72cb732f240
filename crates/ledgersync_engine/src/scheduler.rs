//! Sync triggers.
//!
//! Startup, interval and manual triggers all go through
//! [`Orchestrator::run_sync`], so they share its single-flight admission.
//! A fourth task drains the wait queue: on every [`SyncEvent::ProcessNext`]
//! it admits the released request as a `queued` run.
//!
//! Trigger tasks run each sync on a task of its own. Stopping the scheduler
//! ends the timer loops; an admitted run always reaches `end_sync`.

use crate::collaborators::AuthProvider;
use crate::config::SchedulerConfig;
use crate::error::SyncResult;
use crate::orchestrator::{Orchestrator, RunOutcome};
use ledgersync_protocol::{SyncEvent, TriggerType};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Owns the trigger tasks of one process.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    auth: Arc<dyn AuthProvider>,
    config: RwLock<SchedulerConfig>,
    background_enabled: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates a stopped scheduler.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        auth: Arc<dyn AuthProvider>,
        config: SchedulerConfig,
    ) -> Self {
        let background_enabled = Arc::new(AtomicBool::new(config.background_enabled));
        Self {
            orchestrator,
            auth,
            config: RwLock::new(config),
            background_enabled,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current configuration.
    pub fn config(&self) -> SchedulerConfig {
        self.config.read().clone()
    }

    /// Returns true while the trigger tasks are running.
    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|task| !task.is_finished())
    }

    /// Spawns the startup trigger, the interval trigger and the queue drainer.
    ///
    /// Must be called within a tokio runtime. Calling it while running is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("scheduler already running");
            return;
        }

        let config = self.config.read().clone();

        // Subscribe before anything can be admitted.
        let events = self.orchestrator.state().subscribe();
        tasks.push(tokio::spawn(drain_queue(
            Arc::clone(&self.orchestrator),
            events,
        )));

        if config.sync_on_startup {
            tasks.push(tokio::spawn(startup_trigger(
                Arc::clone(&self.orchestrator),
                Arc::clone(&self.auth),
            )));
        } else {
            debug!("startup sync disabled");
        }

        tasks.push(tokio::spawn(interval_trigger(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.auth),
            Arc::clone(&self.background_enabled),
            config,
        )));

        info!(tasks = tasks.len(), "scheduler started");
    }

    /// Aborts every trigger task. An in-flight run finishes on its own task.
    pub fn stop(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in &tasks {
            task.abort();
        }
        info!("scheduler stopped");
    }

    /// Stops, applies `config` and starts again.
    pub fn restart(&self, config: SchedulerConfig) {
        self.stop();
        self.background_enabled
            .store(config.background_enabled, Ordering::SeqCst);
        *self.config.write() = config;
        self.start();
    }

    /// Enables or disables the interval trigger without restarting.
    pub fn set_background_enabled(&self, enabled: bool) {
        self.background_enabled.store(enabled, Ordering::SeqCst);
        self.config.write().background_enabled = enabled;
        info!(enabled, "background sync toggled");
    }

    /// Returns true if the interval trigger is enabled.
    pub fn background_enabled(&self) -> bool {
        self.background_enabled.load(Ordering::SeqCst)
    }

    /// Runs a manual sync and waits for it, or queues it behind the active run.
    pub async fn trigger_manual(&self) -> SyncResult<RunOutcome> {
        info!("manual sync requested");
        self.orchestrator.run_sync(TriggerType::Manual).await
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn startup_trigger(orchestrator: Arc<Orchestrator>, auth: Arc<dyn AuthProvider>) {
    if !auth.is_authenticated() {
        info!("not authenticated, skipping startup sync");
        return;
    }
    info!("running startup sync");
    run_detached(&orchestrator, TriggerType::Startup).await;
}

async fn interval_trigger(
    orchestrator: Arc<Orchestrator>,
    auth: Arc<dyn AuthProvider>,
    enabled: Arc<AtomicBool>,
    config: SchedulerConfig,
) {
    tokio::time::sleep(config.warmup_delay).await;

    // tokio rejects a zero period
    let period = config.interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !enabled.load(Ordering::SeqCst) {
            debug!("background sync disabled, tick skipped");
            continue;
        }
        if !auth.is_authenticated() {
            debug!("not authenticated, tick skipped");
            continue;
        }
        if !orchestrator.probe().await {
            debug!("accounting engine unreachable, tick skipped");
            continue;
        }

        run_detached(&orchestrator, TriggerType::Interval).await;
    }
}

async fn drain_queue(orchestrator: Arc<Orchestrator>, mut events: broadcast::Receiver<SyncEvent>) {
    // Requests may be waiting from before a restart.
    drain_next(&orchestrator).await;

    loop {
        match events.recv().await {
            Ok(SyncEvent::ProcessNext(request)) => {
                debug!(origin = %request.trigger_type, "queued sync announced");
                drain_next(&orchestrator).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Announcements may be among the skipped events; the guard
                // still holds the released request.
                warn!(skipped, "queue drainer lagged behind sync events");
                drain_next(&orchestrator).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_detached(orchestrator: &Arc<Orchestrator>, trigger: TriggerType) {
    let orchestrator = Arc::clone(orchestrator);
    let run = tokio::spawn(async move { orchestrator.run_sync(trigger).await });
    match run.await {
        Ok(result) => report(trigger, result),
        Err(err) => warn!(trigger = %trigger, error = %err, "sync task did not complete"),
    }
}

async fn drain_next(orchestrator: &Arc<Orchestrator>) {
    let orchestrator = Arc::clone(orchestrator);
    let run = tokio::spawn(async move { orchestrator.run_next().await });
    match run.await {
        Ok(Some(result)) => report(TriggerType::Queued, result),
        Ok(None) => debug!("nothing to drain"),
        Err(err) => warn!(error = %err, "queued sync task did not complete"),
    }
}

fn report(trigger: TriggerType, result: SyncResult<RunOutcome>) {
    match result {
        Ok(RunOutcome::Queued) => debug!(trigger = %trigger, "sync queued"),
        Ok(RunOutcome::Completed(summary)) => info!(
            trigger = %trigger,
            synced = summary.synced_tenants(),
            total = summary.total_tenants(),
            "scheduled sync finished"
        ),
        // Already logged and surfaced by the orchestrator.
        Err(err) => debug!(trigger = %trigger, error = %err, "scheduled sync failed"),
    }
}
