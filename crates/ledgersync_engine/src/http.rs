//! HTTP backend client.
//!
//! Implements the ingestion and tenant directory collaborators over an
//! abstract [`HttpClient`], so any HTTP library (reqwest, hyper, ...) can
//! carry the requests.

use crate::collaborators::{AuthProvider, Ingestor, PushOutcome, SyncKind, TenantDirectory};
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use ledgersync_protocol::{EntityType, Record, Tenant};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Creates a 200 response with a JSON body.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }
}

/// HTTP client abstraction.
///
/// Errors are connection-level failures; any response, whatever its status,
/// is `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request.
    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse, String>;

    /// Sends a POST request with a JSON body.
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<HttpResponse, String>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

/// Backend client for tenant listing, record pushes and remote reads.
pub struct BackendClient<C: HttpClient> {
    base_url: String,
    client: C,
    auth: Arc<dyn AuthProvider>,
    timeout: Duration,
    read_retry: RetryConfig,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> BackendClient<C> {
    /// Creates a client.
    pub fn new(base_url: impl Into<String>, client: C, auth: Arc<dyn AuthProvider>) -> Self {
        let config = SyncConfig::default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            auth,
            timeout: config.request_timeout,
            read_retry: config.read_retry,
            last_error: RwLock::new(None),
        }
    }

    /// Applies the timeout and retry settings of a sync configuration.
    pub fn with_config(mut self, config: &SyncConfig) -> Self {
        self.timeout = config.request_timeout;
        self.read_retry = config.read_retry.clone();
        self
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy for reads.
    pub fn with_read_retry(mut self, retry: RetryConfig) -> Self {
        self.read_retry = retry;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> SyncResult<String> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| SyncError::transport_fatal(format!("invalid url: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url.into())
    }

    fn headers(&self) -> SyncResult<(Vec<(String, String)>, String)> {
        let ticket = self
            .auth
            .ticket()
            .filter(|ticket| ticket.is_complete())
            .ok_or(SyncError::NotAuthenticated)?;
        let headers = vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", ticket.auth_token),
            ),
            ("X-Device-Token".to_string(), ticket.device_token.clone()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        Ok((headers, ticket.user_id))
    }

    async fn call<F>(&self, request: F) -> SyncResult<Vec<u8>>
    where
        F: Future<Output = Result<HttpResponse, String>> + Send,
    {
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(message)) => {
                *self.last_error.write() = Some(message.clone());
                return Err(SyncError::transport_retryable(message));
            }
            Err(_) => {
                *self.last_error.write() = Some("timed out".to_string());
                return Err(SyncError::Timeout);
            }
        };

        let status = response.status;
        let result = match status {
            200..=299 => Ok(response.body),
            401 | 403 => Err(SyncError::AuthenticationFailed(format!("HTTP {status}"))),
            500..=599 => Err(SyncError::ServerError(format!("HTTP {status}"))),
            _ => Err(SyncError::transport_fatal(format!("HTTP {status}"))),
        };
        *self.last_error.write() = result.as_ref().err().map(ToString::to_string);
        result
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> SyncResult<T> {
        let (headers, _) = self.headers()?;
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.read_retry.delay_for_attempt(attempt)).await;
            }
            match self.call(self.client.get(url, &headers)).await {
                Ok(body) => return Ok(serde_json::from_slice(&body)?),
                Err(err) if err.is_retryable() && attempt + 1 < self.read_retry.max_attempts => {
                    warn!(url, attempt, error = %err, "read failed, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<C: HttpClient> TenantDirectory for BackendClient<C> {
    async fn list_tenants(&self) -> SyncResult<Vec<Tenant>> {
        let url = self.url("/companies", &[])?;
        let envelope: Envelope<Vec<Tenant>> = self.get_json(&url).await?;
        if !envelope.success {
            return Err(SyncError::Directory(
                envelope
                    .message
                    .unwrap_or_else(|| "tenant listing failed".into()),
            ));
        }
        let tenants = envelope.data.unwrap_or_default();
        debug!(count = tenants.len(), "tenants listed");
        Ok(tenants)
    }
}

#[async_trait]
impl<C: HttpClient> Ingestor for BackendClient<C> {
    async fn push_records(
        &self,
        tenant: &Tenant,
        entity_type: &EntityType,
        records: &[Record],
        kind: SyncKind,
    ) -> SyncResult<PushOutcome> {
        let (headers, user_id) = self.headers()?;
        let url = self.url(&entity_type.endpoint(), &[])?;

        let mut payload = serde_json::Map::new();
        payload.insert("cmpId".into(), tenant.id.clone().into());
        payload.insert("userId".into(), user_id.into());
        payload.insert("syncType".into(), serde_json::to_value(kind)?);
        payload.insert(entity_type.payload_key(), serde_json::to_value(records)?);
        let body = serde_json::to_vec(&payload)?;

        // Writes are not idempotent: one attempt only.
        let response = self.call(self.client.post(&url, &headers, body)).await?;

        #[derive(Deserialize)]
        struct PushReply {
            #[serde(default)]
            success: bool,
            #[serde(default)]
            count: usize,
            #[serde(default)]
            message: Option<String>,
        }
        let reply: PushReply = serde_json::from_slice(&response)?;
        if !reply.success {
            return Err(SyncError::Ingestion(
                reply
                    .message
                    .unwrap_or_else(|| format!("{entity_type} push rejected")),
            ));
        }
        Ok(PushOutcome {
            success: true,
            count: reply.count,
        })
    }

    async fn fetch_remote_records(
        &self,
        tenant: &Tenant,
        entity_type: &EntityType,
    ) -> SyncResult<Vec<Record>> {
        let url = self.url(&entity_type.endpoint(), &[("cmpId", tenant.id.as_str())])?;
        let value: serde_json::Value = self.get_json(&url).await?;

        // Either a bare array or a `{success, data}` envelope.
        let records = match value {
            serde_json::Value::Array(items) => serde_json::Value::Array(items),
            serde_json::Value::Object(mut object) => {
                if object.get("success").and_then(|v| v.as_bool()) == Some(false) {
                    return Err(SyncError::ServerError(format!(
                        "{entity_type} read rejected"
                    )));
                }
                object
                    .remove("data")
                    .unwrap_or(serde_json::Value::Array(Vec::new()))
            }
            _ => {
                return Err(ledgersync_protocol::ProtocolError::invalid_structure(
                    "expected records array",
                )
                .into())
            }
        };
        Ok(serde_json::from_value(records)?)
    }
}
