//! Session guard: one live session per user account.
//!
//! A supervising task holds a channel to the session authority and sends a
//! heartbeat on a fixed period. When the channel is lost it reconnects with a
//! constant delay up to a ceiling, then falls back to status polling for the
//! rest of the process. An invalidation pushed by the authority (the account
//! logged in on another device) ends the session:
//!
//! 1. heartbeat stopped and channel closed
//! 2. cached credentials purged
//! 3. the user notified
//! 4. application logout, or a restart if logout is unavailable
//!
//! Malformed frames are logged and ignored. Only an invalidation is fatal.

use crate::collaborators::{
    AuthProvider, CredentialStore, LogoutHook, Notifier, RestartHook, SessionChannel, SessionCheck,
    SessionConnector, StatusPoller,
};
use crate::config::SessionConfig;
use crate::error::{SyncError, SyncResult};
use ledgersync_protocol::{now_millis, InboundMessage, Notification, OutboundMessage, SessionTicket};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Connection state of the session guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// No channel; either stopped or waiting to reconnect.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Channel open, heartbeat running.
    Connected,
    /// Reconnects exhausted; the authority is polled instead.
    PollingFallback,
    /// The session was invalidated. Terminal until the next start.
    LoggedOut,
}

/// Snapshot returned by [`SessionGuard::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// Whether a channel is open.
    pub connected: bool,
    /// Whether heartbeats are being sent.
    pub heartbeat_active: bool,
    /// Reconnect attempts since the last successful connection.
    pub reconnect_attempts: u32,
    /// Whether the polling fallback is active.
    pub polling: bool,
    /// Whether the session was invalidated.
    pub logged_out: bool,
    /// Whether complete credentials are present.
    pub authenticated: bool,
}

#[derive(Debug, Clone)]
struct Monitor {
    state: SessionState,
    heartbeat_active: bool,
    reconnect_attempts: u32,
}

impl Monitor {
    fn idle() -> Self {
        Self {
            state: SessionState::Disconnected,
            heartbeat_active: false,
            reconnect_attempts: 0,
        }
    }
}

/// Collaborators of the session guard.
#[derive(Clone)]
pub struct SessionCollaborators {
    /// Current credentials.
    pub auth: Arc<dyn AuthProvider>,
    /// Local credential cache, purged on invalidation.
    pub credentials: Arc<dyn CredentialStore>,
    /// Opens channels to the authority.
    pub connector: Arc<dyn SessionConnector>,
    /// Used once reconnects are exhausted.
    pub poller: Arc<dyn StatusPoller>,
    /// User notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Application logout, tried first.
    pub logout: Option<Arc<dyn LogoutHook>>,
    /// Restart, used when logout is missing or fails.
    pub restart: Option<Arc<dyn RestartHook>>,
}

struct Supervisor {
    config: SessionConfig,
    collaborators: SessionCollaborators,
    monitor: Arc<RwLock<Monitor>>,
}

enum ChannelEnd {
    Lost,
    Invalidated(String),
}

/// Enforces a single active device per account.
pub struct SessionGuard {
    config: SessionConfig,
    collaborators: SessionCollaborators,
    monitor: Arc<RwLock<Monitor>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionGuard {
    /// Creates a stopped guard.
    pub fn new(config: SessionConfig, collaborators: SessionCollaborators) -> Self {
        Self {
            config,
            collaborators,
            monitor: Arc::new(RwLock::new(Monitor::idle())),
            task: Mutex::new(None),
        }
    }

    /// Starts monitoring the current session.
    ///
    /// Without complete credentials this logs a warning and does nothing.
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("session guard already running");
            return;
        }

        let Some(ticket) = self
            .collaborators
            .auth
            .ticket()
            .filter(SessionTicket::is_complete)
        else {
            warn!("no credentials, session guard not started");
            return;
        };

        let url = match session_url(&self.config.url, &ticket) {
            Ok(url) => url,
            Err(err) => {
                error!(error = %err, "session guard not started");
                return;
            }
        };

        *self.monitor.write() = Monitor::idle();
        let supervisor = Supervisor {
            config: self.config.clone(),
            collaborators: self.collaborators.clone(),
            monitor: Arc::clone(&self.monitor),
        };
        *task = Some(tokio::spawn(supervisor.run(url)));
        info!(user_id = %ticket.user_id, "session guard started");
    }

    /// Stops monitoring. Used on logout and shutdown.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("session guard stopped");
        }
        let mut monitor = self.monitor.write();
        monitor.heartbeat_active = false;
        if monitor.state != SessionState::LoggedOut {
            monitor.state = SessionState::Disconnected;
        }
    }

    /// Returns a snapshot of the guard.
    pub fn status(&self) -> SessionStatus {
        let monitor = self.monitor.read().clone();
        SessionStatus {
            state: monitor.state,
            connected: monitor.state == SessionState::Connected,
            heartbeat_active: monitor.heartbeat_active,
            reconnect_attempts: monitor.reconnect_attempts,
            polling: monitor.state == SessionState::PollingFallback,
            logged_out: monitor.state == SessionState::LoggedOut,
            authenticated: self.collaborators.auth.is_authenticated(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Builds the authority URL carrying the credentials as query parameters.
pub fn session_url(base: &str, ticket: &SessionTicket) -> SyncResult<String> {
    let mut url = Url::parse(base)
        .map_err(|err| SyncError::transport_fatal(format!("invalid session url {base}: {err}")))?;
    url.query_pairs_mut()
        .append_pair("token", &ticket.auth_token)
        .append_pair("deviceToken", &ticket.device_token);
    Ok(url.into())
}

impl Supervisor {
    async fn run(self, url: String) {
        let max_attempts = self.config.reconnect.max_attempts;

        loop {
            self.set_state(SessionState::Connecting);
            match tokio::time::timeout(
                self.config.connect_timeout,
                self.collaborators.connector.connect(&url),
            )
            .await
            {
                Ok(Ok(channel)) => {
                    {
                        let mut monitor = self.monitor.write();
                        monitor.state = SessionState::Connected;
                        monitor.reconnect_attempts = 0;
                    }
                    info!("session channel connected");
                    match self.hold(channel).await {
                        ChannelEnd::Invalidated(reason) => {
                            self.invalidate(reason).await;
                            return;
                        }
                        ChannelEnd::Lost => warn!("session channel lost"),
                    }
                }
                Ok(Err(err)) => warn!(error = %err, "session connection failed"),
                Err(_) => warn!(
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "session connection timed out"
                ),
            }

            let attempt = {
                let mut monitor = self.monitor.write();
                monitor.state = SessionState::Disconnected;
                monitor.heartbeat_active = false;
                if monitor.reconnect_attempts >= max_attempts {
                    None
                } else {
                    monitor.reconnect_attempts += 1;
                    Some(monitor.reconnect_attempts)
                }
            };
            let Some(attempt) = attempt else {
                break;
            };

            let delay = self.config.reconnect.delay_for_attempt(attempt);
            info!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "reconnecting session channel");
            tokio::time::sleep(delay).await;
        }

        warn!(max_attempts, "reconnects exhausted, polling session status");
        self.poll().await;
    }

    /// Runs the heartbeat and reads frames until the channel ends.
    async fn hold(&self, mut channel: Box<dyn SessionChannel>) -> ChannelEnd {
        let period = self.config.heartbeat_interval.max(MIN_PERIOD);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.monitor.write().heartbeat_active = true;

        let end = loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let frame = OutboundMessage::Heartbeat { timestamp: now_millis() }.to_text();
                    if let Err(err) = channel.send(frame).await {
                        warn!(error = %err, "heartbeat send failed");
                        break ChannelEnd::Lost;
                    }
                    debug!("heartbeat sent");
                }
                frame = channel.recv() => {
                    let Some(text) = frame else {
                        break ChannelEnd::Lost;
                    };
                    match InboundMessage::parse(&text) {
                        Ok(InboundMessage::SessionInvalidated { reason }) => {
                            break ChannelEnd::Invalidated(reason);
                        }
                        Ok(InboundMessage::Unknown(kind)) => {
                            debug!(kind = %kind, "unhandled session message");
                        }
                        Ok(message) => debug!(?message, "session message"),
                        Err(err) => warn!(error = %err, "malformed session message ignored"),
                    }
                }
            }
        };

        self.monitor.write().heartbeat_active = false;
        if matches!(end, ChannelEnd::Invalidated(_)) {
            channel.close().await;
        }
        end
    }

    async fn poll(&self) {
        self.set_state(SessionState::PollingFallback);
        let period = self.config.poll_interval.max(MIN_PERIOD);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(ticket) = self.collaborators.auth.ticket() else {
                debug!("no credentials, session poll skipped");
                continue;
            };
            match self.collaborators.poller.check_session(&ticket).await {
                Ok(SessionCheck::Valid) => debug!("session still valid"),
                Ok(SessionCheck::Invalidated(reason)) => {
                    self.invalidate(reason).await;
                    return;
                }
                Err(err) => warn!(error = %err, "session poll failed"),
            }
        }
    }

    async fn invalidate(&self, reason: String) {
        warn!(reason = %reason, "session invalidated");
        {
            let mut monitor = self.monitor.write();
            monitor.state = SessionState::LoggedOut;
            monitor.heartbeat_active = false;
        }

        if let Err(err) = self.collaborators.credentials.purge() {
            error!(error = %err, "failed to purge credentials");
        }

        self.collaborators
            .notifier
            .notify(Notification::error("Session Ended", reason.clone()));

        match &self.collaborators.logout {
            Some(hook) => match hook.logout(&reason).await {
                Ok(()) => info!("logged out after session invalidation"),
                Err(err) => {
                    warn!(error = %err, "logout hook failed, restarting");
                    self.restart();
                }
            },
            None => self.restart(),
        }
    }

    fn restart(&self) {
        match &self.collaborators.restart {
            Some(hook) => hook.restart(),
            None => error!("no logout or restart hook available"),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.monitor.write().state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::{
        MemoryStatusPoller, RecordingLogout, RecordingNotifier, RecordingRestart, ScriptedConnector,
        StaticAuth,
    };
    use ledgersync_protocol::NotificationKind;
    use std::time::Duration;

    struct Harness {
        auth: Arc<StaticAuth>,
        connector: Arc<ScriptedConnector>,
        poller: Arc<MemoryStatusPoller>,
        notifier: Arc<RecordingNotifier>,
        logout: Arc<RecordingLogout>,
        restart: Arc<RecordingRestart>,
    }

    impl Harness {
        fn new(logout: RecordingLogout) -> Self {
            Self {
                auth: Arc::new(StaticAuth::new(SessionTicket::new("tok en", "dev/1", "u-1"))),
                connector: Arc::new(ScriptedConnector::new()),
                poller: Arc::new(MemoryStatusPoller::new()),
                notifier: Arc::new(RecordingNotifier::new()),
                logout: Arc::new(logout),
                restart: Arc::new(RecordingRestart::new()),
            }
        }

        fn guard(&self, with_logout: bool) -> SessionGuard {
            let collaborators = SessionCollaborators {
                auth: self.auth.clone(),
                credentials: self.auth.clone(),
                connector: self.connector.clone(),
                poller: self.poller.clone(),
                notifier: self.notifier.clone(),
                logout: with_logout.then(|| self.logout.clone() as Arc<dyn LogoutHook>),
                restart: Some(self.restart.clone()),
            };
            SessionGuard::new(fast_config(), collaborators)
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig::new("ws://localhost:3000/session")
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_reconnect(RetryConfig::constant(2, Duration::from_millis(5)))
            .with_poll_interval(Duration::from_millis(15))
            .with_connect_timeout(Duration::from_millis(200))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn url_carries_encoded_credentials() {
        let ticket = SessionTicket::new("a b&c", "dev/1", "u");
        let url = session_url("wss://api.example.com/session", &ticket).unwrap();
        assert_eq!(
            url,
            "wss://api.example.com/session?token=a+b%26c&deviceToken=dev%2F1"
        );
        assert!(session_url("not a url", &ticket).is_err());
    }

    #[tokio::test]
    async fn start_without_credentials_is_noop() {
        let h = Harness::new(RecordingLogout::new());
        h.auth.set_ticket(None);
        let guard = h.guard(true);
        guard.start();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.connector.attempts().is_empty());
        let status = guard.status();
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(!status.authenticated);
    }

    #[tokio::test]
    async fn connects_and_sends_heartbeats() {
        let h = Harness::new(RecordingLogout::new());
        let channel = h.connector.accept();
        let guard = h.guard(true);
        guard.start();

        assert!(wait_until(|| channel.sent().len() >= 2).await);
        let status = guard.status();
        assert!(status.connected);
        assert!(status.heartbeat_active);
        assert_eq!(status.reconnect_attempts, 0);

        let frame: serde_json::Value = serde_json::from_str(&channel.sent()[0]).unwrap();
        assert_eq!(frame["type"], "HEARTBEAT");
        assert!(frame["timestamp"].as_u64().unwrap() > 0);

        let url = &h.connector.attempts()[0];
        assert!(url.contains("token=tok+en"));
        assert!(url.contains("deviceToken=dev%2F1"));

        guard.stop();
        assert!(!guard.status().heartbeat_active);
    }

    #[tokio::test]
    async fn malformed_messages_are_ignored() {
        let h = Harness::new(RecordingLogout::new());
        let channel = h.connector.accept();
        let guard = h.guard(true);
        guard.start();

        assert!(wait_until(|| guard.status().connected).await);
        assert!(channel.push("not json"));
        assert!(channel.push(r#"{"type":"SOMETHING_NEW"}"#));
        assert!(channel.push(r#"{"type":"HEARTBEAT_ACK"}"#));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(guard.status().connected);
        assert_eq!(h.connector.attempts().len(), 1);
        assert!(h.logout.reasons().is_empty());
    }

    #[tokio::test]
    async fn invalidation_purges_and_logs_out() {
        let h = Harness::new(RecordingLogout::new());
        let channel = h.connector.accept();
        let guard = h.guard(true);
        guard.start();

        assert!(wait_until(|| guard.status().connected).await);
        channel.push(r#"{"type":"SESSION_INVALIDATED","message":"Logged in on laptop"}"#);

        assert!(wait_until(|| guard.status().logged_out).await);
        assert!(channel.is_closed());
        assert_eq!(h.auth.purge_count(), 1);

        let status = guard.status();
        assert!(!status.authenticated);
        assert!(!status.heartbeat_active);

        assert!(wait_until(|| !h.logout.reasons().is_empty()).await);
        assert_eq!(h.logout.reasons(), vec!["Logged in on laptop".to_string()]);
        assert_eq!(h.restart.count(), 0);

        let errors = h.notifier.of_kind(NotificationKind::Error);
        assert_eq!(errors[0].message, "Logged in on laptop");
        assert_eq!(errors[0].duration_ms, 5000);
    }

    #[tokio::test]
    async fn failing_logout_falls_back_to_restart() {
        let h = Harness::new(RecordingLogout::failing());
        let channel = h.connector.accept();
        let guard = h.guard(true);
        guard.start();

        assert!(wait_until(|| guard.status().connected).await);
        channel.push(r#"{"type":"DEVICE_CONFLICT"}"#);

        assert!(wait_until(|| h.restart.count() == 1).await);
        assert_eq!(
            h.logout.reasons(),
            vec!["You have been logged in from another device".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_logout_hook_restarts() {
        let h = Harness::new(RecordingLogout::new());
        let channel = h.connector.accept();
        let guard = h.guard(false);
        guard.start();

        assert!(wait_until(|| guard.status().connected).await);
        channel.push(r#"{"type":"SESSION_INVALIDATED"}"#);
        assert!(wait_until(|| h.restart.count() == 1).await);
    }

    #[tokio::test]
    async fn reconnects_after_loss() {
        let h = Harness::new(RecordingLogout::new());
        let first = h.connector.accept();
        let second = h.connector.accept();
        let guard = h.guard(true);
        guard.start();

        assert!(wait_until(|| guard.status().connected).await);
        first.disconnect();

        assert!(wait_until(|| h.connector.attempts().len() == 2 && guard.status().connected).await);
        assert_eq!(guard.status().reconnect_attempts, 0);
        assert!(wait_until(|| !second.sent().is_empty()).await);
    }

    #[tokio::test]
    async fn exhausted_reconnects_fall_back_to_polling() {
        let h = Harness::new(RecordingLogout::new());
        let guard = h.guard(true);
        guard.start();

        assert!(wait_until(|| guard.status().polling).await);
        let status = guard.status();
        assert_eq!(status.state, SessionState::PollingFallback);
        assert!(!status.heartbeat_active);
        assert!(!status.connected);
        assert_eq!(status.reconnect_attempts, 2);
        // First attempt plus two reconnects
        assert_eq!(h.connector.attempts().len(), 3);

        assert!(wait_until(|| h.poller.poll_count() >= 2).await);
        assert!(h.logout.reasons().is_empty());
    }

    #[tokio::test]
    async fn polling_detects_invalidation() {
        let h = Harness::new(RecordingLogout::new());
        h.poller
            .set_answer(SessionCheck::Invalidated("Session revoked".into()));
        let guard = h.guard(true);
        guard.start();

        assert!(wait_until(|| guard.status().logged_out).await);
        assert!(wait_until(|| h.logout.reasons() == vec!["Session revoked".to_string()]).await);
        assert_eq!(h.auth.purge_count(), 1);
    }
}
