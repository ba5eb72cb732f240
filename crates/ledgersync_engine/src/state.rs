//! Sync state guard: single-flight admission, progress and the wait queue.
//!
//! At most one run is active at a time. Triggers that arrive while a run is
//! active are queued in arrival order. Once the active run ends the head is
//! released and announced through [`SyncEvent::ProcessNext`]. A released
//! request is held apart from the queue until [`StateGuard::start_next`]
//! admits it, so later requests can never overtake it.

use crate::config::SyncConfig;
use ledgersync_protocol::{ProgressUpdate, SyncEvent, SyncRequest, SyncRun, TriggerType};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Snapshot returned by [`StateGuard::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardStatus {
    /// Whether a run is active.
    pub in_progress: bool,
    /// The active run, if any.
    pub active: Option<SyncRun>,
    /// Number of queued requests.
    pub queue_depth: usize,
    /// Request released from the queue and awaiting admission.
    pub released: Option<SyncRequest>,
    /// The most recently finished run.
    pub last_run: Option<SyncRun>,
}

#[derive(Debug, Default)]
struct GuardInner {
    active: Option<SyncRun>,
    queue: VecDeque<SyncRequest>,
    released: Option<SyncRequest>,
    history: VecDeque<SyncRun>,
}

/// Mutual-exclusion lock, progress tracker and FIFO wait queue for sync runs.
///
/// Cloning yields another handle to the same guard.
#[derive(Clone)]
pub struct StateGuard {
    inner: Arc<Mutex<GuardInner>>,
    events: broadcast::Sender<SyncEvent>,
    history_limit: usize,
    grace_delay: Duration,
}

impl StateGuard {
    /// Creates a guard keeping `history_limit` finished runs.
    pub fn new(history_limit: usize, grace_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(GuardInner::default())),
            events,
            history_limit,
            grace_delay,
        }
    }

    /// Creates a guard from the sync configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.history_limit, config.queue_grace_delay)
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Requests admission of a run.
    ///
    /// Returns true if the run was admitted. Otherwise the trigger is queued
    /// and false is returned.
    pub fn start_sync(&self, trigger: TriggerType, total: usize) -> bool {
        self.start_sync_with(trigger, total, serde_json::Value::Null)
    }

    /// Requests admission, attaching `payload` to the request if it is queued.
    pub fn start_sync_with(
        &self,
        trigger: TriggerType,
        total: usize,
        payload: serde_json::Value,
    ) -> bool {
        let mut inner = self.inner.lock();

        if inner.active.is_some() {
            let request = SyncRequest::new(trigger, payload);
            inner.queue.push_back(request.clone());
            let depth = inner.queue.len();
            info!(trigger = %trigger, depth, "sync already in progress, request queued");
            self.emit(SyncEvent::Queued(request));
            self.emit(SyncEvent::QueueUpdated { depth });
            return false;
        }

        let run = SyncRun::start(trigger, total);
        info!(run_id = %run.id, trigger = %trigger, total, "sync started");
        inner.active = Some(run.clone());
        self.emit(SyncEvent::Started(run));
        true
    }

    /// Admits the released request as a `queued` run.
    ///
    /// Returns `None` if a run is active or nothing has been released.
    pub fn start_next(&self) -> Option<SyncRequest> {
        let mut inner = self.inner.lock();
        if inner.active.is_some() {
            return None;
        }
        let request = inner.released.take()?;

        let run = SyncRun::start(TriggerType::Queued, 0);
        info!(
            run_id = %run.id,
            origin = %request.trigger_type,
            "queued sync started"
        );
        inner.active = Some(run.clone());
        self.emit(SyncEvent::Started(run));
        Some(request)
    }

    /// Sets the tenant count of the active run.
    pub fn set_total(&self, total: usize) {
        let mut inner = self.inner.lock();
        match inner.active.as_mut() {
            Some(run) => run.total_tenants = total,
            None => warn!(total, "set_total called with no active sync"),
        }
    }

    /// Records progress of the active run.
    pub fn update_progress(&self, processed: usize, current_tenant: Option<&str>) {
        let mut inner = self.inner.lock();
        let Some(run) = inner.active.as_mut() else {
            warn!(processed, "update_progress called with no active sync");
            return;
        };

        run.processed_tenants = processed;
        if let Some(label) = current_tenant {
            run.current_tenant = Some(label.to_string());
        }

        let update = ProgressUpdate {
            run_id: run.id,
            trigger_type: run.trigger_type,
            processed,
            total: run.total_tenants,
            current_tenant: run.current_tenant.clone(),
            percent: run.progress_percent(),
        };
        debug!(processed, total = update.total, "sync progress");
        self.emit(SyncEvent::Progress(update));
    }

    /// Ends the active run.
    ///
    /// The finished run is moved into history. If requests are waiting, the
    /// head of the queue is released after the grace delay.
    pub fn end_sync(&self, success: bool, message: impl Into<String>) {
        let queued = {
            let mut inner = self.inner.lock();
            let Some(mut run) = inner.active.take() else {
                warn!("end_sync called with no active sync");
                return;
            };

            run.finish(success, message);
            info!(
                run_id = %run.id,
                success,
                processed = run.processed_tenants,
                total = run.total_tenants,
                duration_ms = run.duration_ms(),
                "sync ended"
            );

            inner.history.push_back(run.clone());
            while inner.history.len() > self.history_limit {
                inner.history.pop_front();
            }
            self.emit(SyncEvent::Ended(run));
            !inner.queue.is_empty() || inner.released.is_some()
        };

        if queued {
            self.schedule_process_next();
        }
    }

    /// Returns true if a run is active.
    pub fn is_sync_in_progress(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    /// Returns a snapshot of the guard.
    pub fn status(&self) -> GuardStatus {
        let inner = self.inner.lock();
        GuardStatus {
            in_progress: inner.active.is_some(),
            active: inner.active.clone(),
            queue_depth: inner.queue.len(),
            released: inner.released.clone(),
            last_run: inner.history.back().cloned(),
        }
    }

    /// Returns the number of queued requests.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Returns up to `limit` finished runs, newest first.
    pub fn history(&self, limit: usize) -> Vec<SyncRun> {
        self.inner
            .lock()
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drops all queued requests, including a released one.
    pub fn clear_queue(&self) {
        let mut inner = self.inner.lock();
        inner.released = None;
        if inner.queue.is_empty() {
            return;
        }
        inner.queue.clear();
        self.emit(SyncEvent::QueueUpdated { depth: 0 });
    }

    fn schedule_process_next(&self) {
        if self.grace_delay.is_zero() {
            self.process_next();
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let guard = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(guard.grace_delay).await;
                    guard.process_next();
                });
            }
            Err(_) => self.process_next(),
        }
    }

    /// Releases the head of the queue if no run is active.
    ///
    /// A run admitted during the grace delay keeps the queue intact; it is
    /// drained when that run ends. A request released earlier and not yet
    /// admitted is announced again instead of releasing another one.
    fn process_next(&self) {
        let mut inner = self.inner.lock();
        if inner.active.is_some() {
            debug!("run admitted during grace delay, queue left intact");
            return;
        }
        if inner.released.is_none() {
            let Some(request) = inner.queue.pop_front() else {
                return;
            };
            inner.released = Some(request);
            self.emit(SyncEvent::QueueUpdated {
                depth: inner.queue.len(),
            });
        }
        let Some(request) = inner.released.clone() else {
            return;
        };
        info!(
            trigger = %request.trigger_type,
            depth = inner.queue.len(),
            "processing queued sync request"
        );
        self.emit(SyncEvent::ProcessNext(request));
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

impl Default for StateGuard {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_protocol::RunState;
    use proptest::prelude::*;

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn guard() -> StateGuard {
        StateGuard::new(50, Duration::ZERO)
    }

    #[test]
    fn admits_first_and_queues_rest_in_order() {
        let guard = guard();
        assert!(guard.start_sync(TriggerType::Startup, 3));

        let triggers = [
            TriggerType::Interval,
            TriggerType::Manual,
            TriggerType::Interval,
            TriggerType::Manual,
        ];
        for trigger in triggers {
            assert!(!guard.start_sync(trigger, 0));
        }

        assert_eq!(guard.queue_depth(), 4);
        let status = guard.status();
        assert!(status.in_progress);
        assert_eq!(
            status.active.map(|run| run.trigger_type),
            Some(TriggerType::Startup)
        );

        let queued: Vec<_> = guard
            .inner
            .lock()
            .queue
            .iter()
            .map(|request| request.trigger_type)
            .collect();
        assert_eq!(queued, triggers);
    }

    #[test]
    fn end_sync_releases_exactly_one_request() {
        let guard = guard();
        let mut rx = guard.subscribe();

        guard.start_sync(TriggerType::Startup, 1);
        guard.start_sync(TriggerType::Interval, 0);
        guard.start_sync(TriggerType::Manual, 0);
        drain(&mut rx);

        guard.end_sync(true, "done");

        let events = drain(&mut rx);
        let process_next: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SyncEvent::ProcessNext(request) => Some(request.trigger_type),
                _ => None,
            })
            .collect();
        assert_eq!(process_next, vec![TriggerType::Interval]);
        assert_eq!(guard.queue_depth(), 1);
        assert_eq!(
            guard.status().released.map(|request| request.trigger_type),
            Some(TriggerType::Interval)
        );
        assert!(!guard.is_sync_in_progress());
        assert_eq!(events[0].name(), "ended");
    }

    #[test]
    fn lifecycle_events_are_ordered() {
        let guard = guard();
        let mut rx = guard.subscribe();

        guard.start_sync(TriggerType::Manual, 2);
        guard.update_progress(1, Some("Acme Ltd"));
        guard.update_progress(2, Some("Globex"));
        guard.end_sync(true, "2/2");

        let names: Vec<_> = drain(&mut rx).iter().map(SyncEvent::name).collect();
        assert_eq!(names, vec!["started", "progress", "progress", "ended"]);
    }

    #[test]
    fn progress_reports_percentage() {
        let guard = guard();
        let mut rx = guard.subscribe();

        guard.start_sync(TriggerType::Manual, 0);
        guard.set_total(4);
        guard.update_progress(1, Some("Acme Ltd"));

        let progress = drain(&mut rx).into_iter().find_map(|event| match event {
            SyncEvent::Progress(update) => Some(update),
            _ => None,
        });
        let progress = progress.unwrap();
        assert_eq!(progress.total, 4);
        assert_eq!(progress.percent, 25.0);
        assert_eq!(progress.current_tenant.as_deref(), Some("Acme Ltd"));
    }

    #[test]
    fn misuse_is_a_noop() {
        let guard = guard();
        let mut rx = guard.subscribe();

        guard.update_progress(1, None);
        guard.end_sync(false, "nothing running");
        guard.set_total(3);

        assert!(drain(&mut rx).is_empty());
        assert!(guard.history(10).is_empty());
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let guard = StateGuard::new(3, Duration::ZERO);
        for i in 0..5 {
            guard.start_sync(TriggerType::Manual, 0);
            guard.end_sync(i % 2 == 0, format!("run {i}"));
        }

        let history = guard.history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message.as_deref(), Some("run 4"));
        assert_eq!(history[2].message.as_deref(), Some("run 2"));
        assert_eq!(history[1].state, RunState::Failed);
        assert_eq!(guard.status().last_run.unwrap().message.as_deref(), Some("run 4"));
    }

    #[test]
    fn clear_queue_empties_waiting_requests() {
        let guard = guard();
        guard.start_sync(TriggerType::Startup, 0);
        guard.start_sync(TriggerType::Interval, 0);
        guard.clear_queue();
        assert_eq!(guard.queue_depth(), 0);

        guard.end_sync(true, "done");
        assert!(!guard.is_sync_in_progress());

        guard.start_sync(TriggerType::Startup, 0);
        guard.start_sync(TriggerType::Manual, 0);
        guard.end_sync(true, "done");
        assert!(guard.status().released.is_some());
        guard.clear_queue();
        assert!(guard.start_next().is_none());
    }

    #[tokio::test]
    async fn grace_delay_defers_process_next() {
        let guard = StateGuard::new(50, Duration::from_millis(20));
        let mut rx = guard.subscribe();

        guard.start_sync(TriggerType::Startup, 0);
        guard.start_sync(TriggerType::Manual, 0);
        guard.end_sync(true, "done");

        assert_eq!(guard.queue_depth(), 1);

        let request = loop {
            match rx.recv().await.unwrap() {
                SyncEvent::ProcessNext(request) => break request,
                _ => continue,
            }
        };
        assert_eq!(request.trigger_type, TriggerType::Manual);
        assert_eq!(guard.queue_depth(), 0);

        let admitted = guard.start_next().unwrap();
        assert_eq!(admitted, request);
        assert!(guard.status().released.is_none());
        assert_eq!(
            guard.status().active.map(|run| run.trigger_type),
            Some(TriggerType::Queued)
        );
    }

    #[test]
    fn start_next_waits_for_active_run() {
        let guard = guard();
        assert!(guard.start_next().is_none());

        guard.start_sync(TriggerType::Startup, 0);
        guard.start_sync(TriggerType::Manual, 0);
        assert!(guard.start_next().is_none());
        assert_eq!(guard.queue_depth(), 1);
    }

    #[test]
    fn competing_trigger_cannot_overtake_queue_head() {
        let guard = guard();
        let mut rx = guard.subscribe();

        guard.start_sync(TriggerType::Startup, 0);
        guard.start_sync(TriggerType::Manual, 0);
        guard.start_sync(TriggerType::Interval, 0);
        guard.end_sync(true, "startup done");

        let announced = drain(&mut rx).into_iter().find_map(|event| match event {
            SyncEvent::ProcessNext(request) => Some(request.trigger_type),
            _ => None,
        });
        assert_eq!(announced, Some(TriggerType::Manual));

        // A new trigger wins admission before the released request runs.
        assert!(guard.start_sync(TriggerType::Interval, 0));
        assert!(guard.start_next().is_none());
        assert_eq!(guard.queue_depth(), 1);
        guard.end_sync(true, "interval done");

        let announced: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::ProcessNext(request) => Some(request.trigger_type),
                _ => None,
            })
            .collect();
        assert_eq!(announced, vec![TriggerType::Manual]);

        let order: Vec<_> = std::iter::from_fn(|| {
            let request = guard.start_next()?;
            guard.end_sync(true, "queued done");
            Some(request.trigger_type)
        })
        .collect();
        assert_eq!(order, vec![TriggerType::Manual, TriggerType::Interval]);
    }

    #[tokio::test]
    async fn run_admitted_during_grace_keeps_queue() {
        let guard = StateGuard::new(50, Duration::from_millis(20));

        guard.start_sync(TriggerType::Startup, 0);
        guard.start_sync(TriggerType::Interval, 0);
        guard.end_sync(true, "done");
        assert!(guard.start_sync(TriggerType::Manual, 0));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(guard.queue_depth(), 1);
    }

    fn trigger_strategy() -> impl Strategy<Value = TriggerType> {
        prop_oneof![
            Just(TriggerType::Startup),
            Just(TriggerType::Interval),
            Just(TriggerType::Manual),
        ]
    }

    proptest! {
        #[test]
        fn queue_preserves_call_order(triggers in prop::collection::vec(trigger_strategy(), 0..30)) {
            let guard = guard();
            prop_assert!(guard.start_sync(TriggerType::Startup, 1));
            for trigger in &triggers {
                prop_assert!(!guard.start_sync(*trigger, 0));
            }
            prop_assert_eq!(guard.queue_depth(), triggers.len());

            let mut rx = guard.subscribe();
            let mut released = Vec::new();
            for _ in 0..triggers.len() {
                guard.end_sync(true, "done");
                let next = drain(&mut rx).into_iter().find_map(|event| match event {
                    SyncEvent::ProcessNext(request) => Some(request.trigger_type),
                    _ => None,
                });
                let Some(next) = next else {
                    return Err(TestCaseError::fail("no process-next after end_sync"));
                };
                released.push(next);
                prop_assert_eq!(guard.start_next().map(|request| request.trigger_type), Some(next));
            }
            prop_assert_eq!(released, triggers);
            prop_assert_eq!(guard.queue_depth(), 0);
        }
    }
}
