//! Configuration for the sync engine.
//!
//! Every struct deserializes from a partial JSON document; missing fields
//! take their defaults. Durations are written as whole milliseconds.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for sync runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Loopback port of the local accounting engine.
    pub local_port: u16,
    /// Pause between two tenants of one run.
    #[serde(with = "millis", rename = "interTenantDelayMs")]
    pub inter_tenant_delay: Duration,
    /// Pause between the end of a run and its reconciliation pass.
    #[serde(with = "millis", rename = "reconciliationDelayMs")]
    pub reconciliation_delay: Duration,
    /// Whether a reconciliation pass follows each successful run.
    pub reconcile_after_run: bool,
    /// Bound on every network call.
    #[serde(with = "millis", rename = "requestTimeoutMs")]
    pub request_timeout: Duration,
    /// Retry policy for idempotent reads.
    pub read_retry: RetryConfig,
    /// Finished runs kept by the state guard.
    pub history_limit: usize,
    /// Entries kept per reconciliation audit log.
    pub audit_limit: usize,
    /// Delay between the end of a run and draining the next queued request.
    #[serde(with = "millis", rename = "queueGraceDelayMs")]
    pub queue_grace_delay: Duration,
    /// Push only records that passed verification.
    pub skip_invalid_records: bool,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            local_port: 9000,
            inter_tenant_delay: Duration::from_millis(100),
            reconciliation_delay: Duration::from_secs(2),
            reconcile_after_run: true,
            request_timeout: Duration::from_secs(15),
            read_retry: RetryConfig::default(),
            history_limit: 50,
            audit_limit: 100,
            queue_grace_delay: Duration::from_millis(500),
            skip_invalid_records: false,
        }
    }

    /// Sets the local accounting engine port.
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Sets the inter-tenant delay.
    pub fn with_inter_tenant_delay(mut self, delay: Duration) -> Self {
        self.inter_tenant_delay = delay;
        self
    }

    /// Sets the delay before the reconciliation pass.
    pub fn with_reconciliation_delay(mut self, delay: Duration) -> Self {
        self.reconciliation_delay = delay;
        self
    }

    /// Enables or disables the reconciliation pass.
    pub fn with_reconcile_after_run(mut self, enabled: bool) -> Self {
        self.reconcile_after_run = enabled;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the read retry configuration.
    pub fn with_read_retry(mut self, retry: RetryConfig) -> Self {
        self.read_retry = retry;
        self
    }

    /// Sets the number of finished runs kept.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Sets the number of entries kept per audit log.
    pub fn with_audit_limit(mut self, limit: usize) -> Self {
        self.audit_limit = limit;
        self
    }

    /// Sets the queue grace delay.
    pub fn with_queue_grace_delay(mut self, delay: Duration) -> Self {
        self.queue_grace_delay = delay;
        self
    }

    /// Pushes only valid records when set.
    pub fn with_skip_invalid_records(mut self, skip: bool) -> Self {
        self.skip_invalid_records = skip;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the startup and interval triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Run once after launch.
    pub sync_on_startup: bool,
    /// Run on the fixed interval.
    pub background_enabled: bool,
    /// Period of the interval trigger.
    #[serde(with = "millis", rename = "intervalMs")]
    pub interval: Duration,
    /// Delay before the first interval tick.
    #[serde(with = "millis", rename = "warmupDelayMs")]
    pub warmup_delay: Duration,
}

impl SchedulerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            sync_on_startup: false,
            background_enabled: true,
            interval: Duration::from_secs(2 * 60 * 60),
            warmup_delay: Duration::from_secs(5 * 60),
        }
    }

    /// Enables or disables the startup trigger.
    pub fn with_sync_on_startup(mut self, enabled: bool) -> Self {
        self.sync_on_startup = enabled;
        self
    }

    /// Enables or disables the interval trigger.
    pub fn with_background_enabled(mut self, enabled: bool) -> Self {
        self.background_enabled = enabled;
        self
    }

    /// Sets the interval period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the warm-up delay.
    pub fn with_warmup_delay(mut self, delay: Duration) -> Self {
        self.warmup_delay = delay;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the session guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Session authority endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Heartbeat period.
    #[serde(with = "millis", rename = "heartbeatIntervalMs")]
    pub heartbeat_interval: Duration,
    /// Reconnect policy after an unexpected channel loss.
    pub reconnect: RetryConfig,
    /// Status polling period once reconnects are exhausted.
    #[serde(with = "millis", rename = "pollIntervalMs")]
    pub poll_interval: Duration,
    /// Bound on a single connection attempt.
    #[serde(with = "millis", rename = "connectTimeoutMs")]
    pub connect_timeout: Duration,
}

impl SessionConfig {
    /// Creates a configuration for a session authority URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: RetryConfig::constant(5, Duration::from_secs(3)),
            poll_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
        }
    }

    /// Derives the session endpoint from the backend base URL.
    ///
    /// `http` becomes `ws`, `https` becomes `wss`, and `/session` is appended.
    pub fn from_backend_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let url = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}/session")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}/session")
        } else {
            format!("{base}/session")
        };
        Self::new(url)
    }

    /// Sets the heartbeat period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the polling period.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    #[serde(with = "millis", rename = "initialDelayMs")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "millis", rename = "maxDelayMs")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates a constant-delay configuration.
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Application settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    /// Backend base URL (`http://` or `https://`).
    pub backend_url: String,
    /// Sync run settings.
    pub sync: SyncConfig,
    /// Trigger settings.
    pub scheduler: SchedulerConfig,
    /// Session guard settings. An empty `url` is derived from `backend_url`.
    pub session: SessionConfig,
}

impl AppSettings {
    /// Creates settings for a backend with defaults elsewhere.
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            ..Self::default()
        }
        .with_derived_session_url()
    }

    /// Parses a settings document.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let settings: AppSettings =
            serde_json::from_str(json).map_err(ledgersync_protocol::ProtocolError::from)?;
        Ok(settings.with_derived_session_url())
    }

    /// Reads a settings document from disk.
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl AppSettings {
    fn with_derived_session_url(mut self) -> Self {
        if self.session.url.is_empty() {
            self.session.url = SessionConfig::from_backend_url(&self.backend_url).url;
        }
        self
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:3000".to_string(),
            sync: SyncConfig::default(),
            scheduler: SchedulerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.local_port, 9000);
        assert_eq!(config.inter_tenant_delay, Duration::from_millis(100));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.history_limit, 50);
        assert_eq!(config.audit_limit, 100);
        assert!(!config.skip_invalid_records);
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_local_port(9100)
            .with_inter_tenant_delay(Duration::ZERO)
            .with_skip_invalid_records(true)
            .with_read_retry(RetryConfig::no_retry());

        assert_eq!(config.local_port, 9100);
        assert_eq!(config.inter_tenant_delay, Duration::ZERO);
        assert!(config.skip_invalid_records);
        assert_eq!(config.read_retry.max_attempts, 1);
    }

    #[test]
    fn session_url_derivation() {
        let config = SessionConfig::from_backend_url("https://api.example.com/");
        assert_eq!(config.url, "wss://api.example.com/session");

        let config = SessionConfig::from_backend_url("http://localhost:3000");
        assert_eq!(config.url, "ws://localhost:3000/session");
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(150));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn settings_from_partial_json() {
        let settings = AppSettings::from_json(
            r#"{
                "backendUrl": "https://sync.example.com",
                "sync": { "localPort": 9001, "interTenantDelayMs": 50 },
                "scheduler": { "syncOnStartup": true, "intervalMs": 60000 }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.sync.local_port, 9001);
        assert_eq!(settings.sync.inter_tenant_delay, Duration::from_millis(50));
        assert_eq!(settings.sync.history_limit, 50);
        assert!(settings.scheduler.sync_on_startup);
        assert_eq!(settings.scheduler.interval, Duration::from_secs(60));
        assert_eq!(settings.session.url, "wss://sync.example.com/session");
    }

    #[test]
    fn settings_reject_bad_json() {
        assert!(AppSettings::from_json("{").is_err());
    }
}
