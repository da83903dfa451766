//! Retry and account-failover loop around a single streaming request.
//!
//! The controller owns everything between "the caller wants a response" and
//! "bytes are flowing": opening the stream, classifying failures, backoff,
//! credential rotation, and turning a fatal outcome into exactly one `Error`
//! event. Once a stream is open it hands the body to the decode loop and
//! never retries again; partial output cannot be replayed.
//!
//! Background upkeep of the opener, such as the client-cache sweep, is
//! started when the controller is built inside a Tokio runtime and aborted
//! when the last clone of the controller is dropped.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::{DecoderConfig, EngineConfig};
use crate::error::{BridgeError, ErrorKind};
use crate::protocol::canonical::{OutputEvent, Protocol};
use crate::stream::{decode_sse_stream, ByteStream, CancelToken, OutputStream};

use super::rate_limit::RateLimitSnapshot;
use super::retry_policy::{classify, RetryDecision, RetryPolicy};

/// Credentials for one upstream account, handed over by the account store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountCredentials {
    /// Stable identifier used in logs and `AccountRotated` events.
    pub account_id: String,
    pub bearer_token: String,
    pub chatgpt_account_id: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
}

/// The request to replay on every attempt.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl StreamRequest {
    #[must_use]
    pub fn new(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            headers: http::HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// A successfully opened response body.
pub struct OpenedStream {
    pub body: ByteStream,
    pub rate_limit: Option<RateLimitSnapshot>,
}

/// Opens one streaming response. Non-2xx statuses must be returned as
/// errors, never as an opened stream.
pub trait StreamOpener: Send + Sync {
    fn open<'a>(
        &'a self,
        request: &'a StreamRequest,
        credentials: &'a AccountCredentials,
    ) -> BoxFuture<'a, Result<OpenedStream, BridgeError>>;

    /// Start periodic upkeep owned by whoever drives this opener.
    fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        None
    }
}

/// Source of credentials, able to switch to another account when one is
/// rate-limited.
pub trait AccountProvider: Send + Sync {
    /// Credentials for the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Auth`] when no usable account exists.
    fn current(&self) -> Result<AccountCredentials, BridgeError>;

    /// Switch away from `exhausted`. `None` means no alternate is available.
    fn rotate(
        &self,
        exhausted: &AccountCredentials,
        snapshot: Option<&RateLimitSnapshot>,
    ) -> Option<AccountCredentials>;
}

/// A single fixed account that can never rotate.
#[derive(Debug, Clone)]
pub struct StaticAccount(pub AccountCredentials);

impl AccountProvider for StaticAccount {
    fn current(&self) -> Result<AccountCredentials, BridgeError> {
        if self.0.bearer_token.is_empty() {
            return Err(BridgeError::Auth("no bearer token configured".to_string()));
        }
        Ok(self.0.clone())
    }

    fn rotate(
        &self,
        _exhausted: &AccountCredentials,
        _snapshot: Option<&RateLimitSnapshot>,
    ) -> Option<AccountCredentials> {
        None
    }
}

/// Retry/failover controller for one protocol.
#[derive(Clone)]
pub struct RequestController {
    protocol: Protocol,
    policy: RetryPolicy,
    decoder: DecoderConfig,
    opener: Arc<dyn StreamOpener>,
    accounts: Arc<dyn AccountProvider>,
    clock: SharedClock,
    maintenance: Option<Arc<MaintenanceTask>>,
}

/// Aborts the opener's background task once the controller is gone.
struct MaintenanceTask(JoinHandle<()>);

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Result of the open phase: status events gathered so far plus either an
/// open body or the fatal error.
struct Established {
    prelude: Vec<OutputEvent>,
    outcome: Result<OpenedStream, BridgeError>,
}

impl RequestController {
    #[must_use]
    pub fn new(
        protocol: Protocol,
        config: &EngineConfig,
        opener: Arc<dyn StreamOpener>,
        accounts: Arc<dyn AccountProvider>,
        clock: SharedClock,
    ) -> Self {
        let maintenance = tokio::runtime::Handle::try_current()
            .ok()
            .and_then(|_| opener.spawn_maintenance())
            .map(|handle| Arc::new(MaintenanceTask(handle)));
        if maintenance.is_none() {
            debug!(protocol = protocol.as_str(), "no opener maintenance task started");
        }
        Self {
            protocol,
            policy: RetryPolicy::from_config(&config.retry),
            decoder: config.decoder.clone(),
            opener,
            accounts,
            clock,
            maintenance,
        }
    }

    /// Whether the opener's background upkeep is running for this controller.
    #[must_use]
    pub fn has_maintenance(&self) -> bool {
        self.maintenance.is_some()
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one request to completion as a lazy stream of output events.
    ///
    /// Fatal failures surface as a single trailing `Error` event. Cancellation
    /// before the stream opens ends the output quietly.
    #[must_use]
    pub fn run(&self, request: StreamRequest, cancel: CancelToken) -> OutputStream {
        let controller = self.clone();
        futures_util::stream::once(async move {
            let Established { prelude, outcome } = controller.establish(&request, &cancel).await;
            let head = futures_util::stream::iter(prelude);
            match outcome {
                Ok(opened) => {
                    let decoder = controller
                        .protocol
                        .new_decoder(&controller.decoder, controller.clock.clone());
                    head.chain(decode_sse_stream(opened.body, decoder, cancel, controller.protocol))
                        .boxed()
                }
                Err(BridgeError::Cancelled) => head.boxed(),
                Err(err) => {
                    warn!(
                        protocol = controller.protocol.as_str(),
                        kind = ?err.kind(),
                        error = %err,
                        "request failed"
                    );
                    let error =
                        OutputEvent::error(err.kind(), err.user_message(controller.clock.wall()));
                    head.chain(futures_util::stream::iter([error])).boxed()
                }
            }
        })
        .flatten()
        .boxed()
    }

    async fn establish(&self, request: &StreamRequest, cancel: &CancelToken) -> Established {
        let mut prelude = Vec::new();
        let mut credentials = match self.accounts.current() {
            Ok(credentials) => credentials,
            Err(err) => {
                return Established {
                    prelude,
                    outcome: Err(err),
                }
            }
        };
        let mut attempt: u32 = 0;
        let mut rotations: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Established {
                    prelude,
                    outcome: Err(BridgeError::Cancelled),
                };
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(BridgeError::Cancelled),
                result = self.opener.open(request, &credentials) => result,
            };

            let err = match result {
                Ok(opened) => {
                    if let Some(snapshot) = opened.rate_limit.clone() {
                        prelude.push(OutputEvent::RateLimits(snapshot));
                    }
                    debug!(
                        protocol = self.protocol.as_str(),
                        account = %credentials.account_id,
                        attempt,
                        "upstream stream opened"
                    );
                    return Established {
                        prelude,
                        outcome: Ok(opened),
                    };
                }
                Err(err) => err,
            };

            let decision = classify(err.kind());
            if decision == RetryDecision::Rotate && rotations < self.policy.max_account_rotations() {
                if let Some(next) = self.accounts.rotate(&credentials, err.rate_limit()) {
                    rotations += 1;
                    info!(
                        from = %credentials.account_id,
                        to = %next.account_id,
                        rotations,
                        "rate limited, rotating account"
                    );
                    prelude.push(OutputEvent::AccountRotated {
                        account_id: next.account_id.clone(),
                    });
                    credentials = next;
                    continue;
                }
            }

            // A plain 429 without an alternate account is retried like a
            // transient failure; an exhausted usage quota is not.
            let retryable = match decision {
                RetryDecision::Backoff => true,
                RetryDecision::Rotate => matches!(err, BridgeError::Upstream { .. }),
                RetryDecision::Fail => false,
            };
            if !retryable || attempt + 1 >= self.policy.max_attempts() {
                if let Some(snapshot) = err.rate_limit() {
                    prelude.push(OutputEvent::RateLimits(snapshot.clone()));
                }
                return Established {
                    prelude,
                    outcome: Err(err),
                };
            }

            let delay = self
                .policy
                .delay_for(attempt, retry_after_hint(&err, self.clock.wall()));
            warn!(
                protocol = self.protocol.as_str(),
                attempt = attempt + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retrying upstream request"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Established {
                        prelude,
                        outcome: Err(BridgeError::Cancelled),
                    };
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

fn retry_after_hint(err: &BridgeError, now: DateTime<Utc>) -> Option<Duration> {
    if err.kind() != ErrorKind::RateLimited && err.kind() != ErrorKind::Transient {
        return None;
    }
    let reset_at = err.rate_limit()?.reset_at?;
    (reset_at - now).to_std().ok()
}
