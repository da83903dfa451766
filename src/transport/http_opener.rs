use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::{ClientCacheConfig, TransportConfig};
use crate::error::BridgeError;
use crate::util::floor_char_boundary;

use super::client_cache::{cache_key, ClientCache};
use super::failover::{AccountCredentials, OpenedStream, StreamOpener, StreamRequest};
use super::rate_limit::{is_usage_limit_body, RateLimitSnapshot};
use super::retry_policy::is_transient_transport_message;

const CHATGPT_ACCOUNT_ID: HeaderName = HeaderName::from_static("chatgpt-account-id");
const OPENAI_ORGANIZATION: HeaderName = HeaderName::from_static("openai-organization");
const OPENAI_PROJECT: HeaderName = HeaderName::from_static("openai-project");
const ERROR_MESSAGE_MAX_BYTES: usize = 512;

fn build_reqwest_client(
    config: &TransportConfig,
    default_headers: HeaderMap,
) -> Result<reqwest::Client, BridgeError> {
    let pool_idle_timeout = if config.pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(config.pool_idle_timeout_secs))
    };
    reqwest::Client::builder()
        .default_headers(default_headers)
        .user_agent(config.user_agent.clone())
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .read_timeout(Duration::from_secs(config.read_timeout_secs))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|err| BridgeError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Opens streaming POST requests with reqwest.
///
/// Clients are cached per endpoint and static header set; credentials are
/// attached per request so rotating accounts reuses the same pool.
pub struct HttpStreamOpener {
    clients: Arc<ClientCache<reqwest::Client>>,
    transport: TransportConfig,
    sweep_interval: Duration,
    clock: SharedClock,
}

impl HttpStreamOpener {
    #[must_use]
    pub fn new(transport: &TransportConfig, cache: &ClientCacheConfig, clock: SharedClock) -> Self {
        Self {
            clients: Arc::new(ClientCache::new(cache.ttl(), clock.clone())),
            transport: transport.clone(),
            sweep_interval: cache.sweep_interval(),
            clock,
        }
    }

    #[must_use]
    pub fn clients(&self) -> &Arc<ClientCache<reqwest::Client>> {
        &self.clients
    }

    /// Start the background eviction task. It stops when the opener is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.clients.spawn_sweeper(self.sweep_interval)
    }

    fn client_for(&self, request: &StreamRequest) -> Result<reqwest::Client, BridgeError> {
        let key = cache_key(&request.url, &request.headers);
        self.clients
            .get_or_try_insert_with(&key, || {
                build_reqwest_client(&self.transport, request.headers.clone())
            })
    }

    async fn open_inner(
        &self,
        request: &StreamRequest,
        credentials: &AccountCredentials,
    ) -> Result<OpenedStream, BridgeError> {
        let client = self.client_for(request)?;
        let response = client
            .post(&request.url)
            .headers(credential_headers(credentials)?)
            .body(request.body.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let now = self.clock.wall();
        let mut rate_limit = RateLimitSnapshot::from_headers(response.headers(), now);

        if status.is_success() {
            let body = response
                .bytes_stream()
                .map_err(map_reqwest_error)
                .boxed();
            return Ok(OpenedStream { body, rate_limit });
        }

        let body = read_error_body(response).await;
        let from_body = RateLimitSnapshot::from_error_body(&body, now);
        match rate_limit.as_mut() {
            Some(snapshot) => snapshot.fill_from(from_body),
            None => rate_limit = from_body,
        }
        let message = error_message(&body, status);
        tracing::debug!(status = status.as_u16(), message = %message, "upstream rejected request");

        if status == http::StatusCode::TOO_MANY_REQUESTS && is_usage_limit_body(&body) {
            return Err(BridgeError::UsageLimit {
                message,
                rate_limit,
            });
        }
        Err(BridgeError::Upstream {
            status: status.as_u16(),
            message,
            rate_limit,
        })
    }
}

impl StreamOpener for HttpStreamOpener {
    fn open<'a>(
        &'a self,
        request: &'a StreamRequest,
        credentials: &'a AccountCredentials,
    ) -> BoxFuture<'a, Result<OpenedStream, BridgeError>> {
        self.open_inner(request, credentials).boxed()
    }

    fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        Some(self.spawn_sweeper())
    }
}

/// Body of a rejected response; empty when it cannot be read.
async fn read_error_body(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => body,
        Err(err) => {
            tracing::debug!(
                status = status.as_u16(),
                error = %err,
                "failed to read upstream error body"
            );
            String::new()
        }
    }
}

/// Per-request auth headers for one account.
///
/// # Errors
///
/// Returns [`BridgeError::Auth`] when a credential contains bytes that are
/// not valid in a header value.
pub fn credential_headers(credentials: &AccountCredentials) -> Result<HeaderMap, BridgeError> {
    let mut headers = HeaderMap::with_capacity(6);
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let mut bearer = header_value(&format!("Bearer {}", credentials.bearer_token))?;
    bearer.set_sensitive(true);
    headers.insert(AUTHORIZATION, bearer);

    let optional = [
        (CHATGPT_ACCOUNT_ID, credentials.chatgpt_account_id.as_deref()),
        (OPENAI_ORGANIZATION, credentials.organization.as_deref()),
        (OPENAI_PROJECT, credentials.project.as_deref()),
    ];
    for (name, value) in optional {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            headers.insert(name, header_value(value)?);
        }
    }
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, BridgeError> {
    HeaderValue::from_str(value)
        .map_err(|_| BridgeError::Auth("credential contains invalid header characters".to_string()))
}

fn map_reqwest_error(err: reqwest::Error) -> BridgeError {
    let message = err.to_string();
    if err.is_builder() || err.is_redirect() {
        return BridgeError::Internal(message);
    }
    if err.is_timeout()
        || err.is_connect()
        || err.is_request()
        || err.is_body()
        || is_transient_transport_message(&message)
    {
        return BridgeError::Transport(message);
    }
    BridgeError::Internal(message)
}

/// Best-effort human message from an error response body.
fn error_message(body: &str, status: http::StatusCode) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            let error = value.get("error").unwrap_or(&value);
            match error {
                serde_json::Value::String(message) => Some(message.clone()),
                _ => error
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
            }
        });
    if let Some(message) = from_json.filter(|m| !m.is_empty()) {
        return message;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("upstream error")
            .to_string();
    }
    trimmed[..floor_char_boundary(trimmed, ERROR_MESSAGE_MAX_BYTES)].to_string()
}
