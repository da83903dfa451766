use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use stream_bridge::clock::system_clock;
use stream_bridge::config::{EngineConfig, RetryConfig};
use stream_bridge::error::{BridgeError, ErrorKind};
use stream_bridge::protocol::canonical::{OutputEvent, Protocol};
use stream_bridge::stream::{ByteStream, CancelToken};
use stream_bridge::transport::{
    AccountCredentials, AccountProvider, OpenedStream, RateLimitSnapshot, RequestController,
    StreamOpener, StreamRequest,
};

enum Scripted {
    Body(&'static str),
    Fail(fn() -> BridgeError),
}

/// Replays scripted outcomes in order and records which account each attempt used.
struct ScriptedOpener {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedOpener {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl StreamOpener for ScriptedOpener {
    fn open<'a>(
        &'a self,
        _request: &'a StreamRequest,
        credentials: &'a AccountCredentials,
    ) -> BoxFuture<'a, Result<OpenedStream, BridgeError>> {
        self.calls.lock().push(credentials.account_id.clone());
        let next = self.script.lock().pop_front();
        async move {
            match next {
                Some(Scripted::Body(text)) => {
                    let chunks: Vec<Result<Bytes, BridgeError>> =
                        vec![Ok(Bytes::from_static(text.as_bytes()))];
                    let body: ByteStream = futures_util::stream::iter(chunks).boxed();
                    Ok(OpenedStream {
                        body,
                        rate_limit: None,
                    })
                }
                Some(Scripted::Fail(make)) => Err(make()),
                None => Err(BridgeError::Internal("script exhausted".to_string())),
            }
        }
        .boxed()
    }
}

struct AccountPool {
    accounts: Vec<AccountCredentials>,
    current: Mutex<usize>,
}

impl AccountPool {
    fn new(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            accounts: ids
                .iter()
                .map(|id| AccountCredentials {
                    account_id: (*id).to_string(),
                    bearer_token: format!("token-{id}"),
                    ..AccountCredentials::default()
                })
                .collect(),
            current: Mutex::new(0),
        })
    }
}

impl AccountProvider for AccountPool {
    fn current(&self) -> Result<AccountCredentials, BridgeError> {
        Ok(self.accounts[*self.current.lock()].clone())
    }

    fn rotate(
        &self,
        exhausted: &AccountCredentials,
        _snapshot: Option<&RateLimitSnapshot>,
    ) -> Option<AccountCredentials> {
        let position = self
            .accounts
            .iter()
            .position(|a| a.account_id == exhausted.account_id)?;
        let next = position + 1;
        let account = self.accounts.get(next)?.clone();
        *self.current.lock() = next;
        Some(account)
    }
}

const HELLO: &str = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            ..RetryConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn controller(
    config: &EngineConfig,
    opener: Arc<ScriptedOpener>,
    accounts: Arc<AccountPool>,
) -> RequestController {
    RequestController::new(Protocol::OpenAiChat, config, opener, accounts, system_clock())
}

async fn run(controller: &RequestController) -> Vec<OutputEvent> {
    let request = StreamRequest::new("https://upstream.invalid/v1/chat/completions", "{}");
    tokio::time::timeout(
        Duration::from_secs(5),
        controller.run(request, CancelToken::new()).collect::<Vec<_>>(),
    )
    .await
    .expect("controller finishes")
}

fn errors(events: &[OutputEvent]) -> Vec<&OutputEvent> {
    events
        .iter()
        .filter(|e| matches!(e, OutputEvent::Error { .. }))
        .collect()
}

fn usage_limit() -> BridgeError {
    BridgeError::UsageLimit {
        message: "usage_limit_reached".to_string(),
        rate_limit: Some(RateLimitSnapshot {
            remaining: Some(0),
            plan_type: Some("plus".to_string()),
            ..RateLimitSnapshot::default()
        }),
    }
}

#[tokio::test]
async fn test_usage_limit_rotates_account_without_visible_error() {
    let opener = ScriptedOpener::new(vec![Scripted::Fail(usage_limit), Scripted::Body(HELLO)]);
    let accounts = AccountPool::new(&["acct-a", "acct-b"]);
    let events = run(&controller(&fast_config(), opener.clone(), accounts)).await;

    assert!(errors(&events).is_empty(), "{events:?}");
    assert_eq!(
        events,
        vec![
            OutputEvent::AccountRotated {
                account_id: "acct-b".to_string()
            },
            OutputEvent::text("Hi"),
        ]
    );
    assert_eq!(opener.calls(), vec!["acct-a", "acct-b"]);
}

#[tokio::test]
async fn test_usage_limit_without_alternate_surfaces_reset_estimate() {
    let opener = ScriptedOpener::new(vec![Scripted::Fail(usage_limit)]);
    let accounts = AccountPool::new(&["only"]);
    let events = run(&controller(&fast_config(), opener.clone(), accounts)).await;

    assert_eq!(opener.calls().len(), 1);
    assert!(matches!(events[0], OutputEvent::RateLimits(_)));
    let errors = errors(&events);
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        OutputEvent::Error { kind: ErrorKind::RateLimited, message } if message.starts_with("Usage limit reached.")
    ));
}

#[tokio::test]
async fn test_auth_failure_is_fatal_and_not_retried() {
    let opener = ScriptedOpener::new(vec![
        Scripted::Fail(|| BridgeError::Upstream {
            status: 401,
            message: "invalid token".to_string(),
            rate_limit: None,
        }),
        Scripted::Body(HELLO),
    ]);
    let accounts = AccountPool::new(&["acct-a", "acct-b"]);
    let events = run(&controller(&fast_config(), opener.clone(), accounts)).await;

    assert_eq!(opener.calls(), vec!["acct-a"]);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        OutputEvent::Error { kind: ErrorKind::AuthInvalid, .. }
    ));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let opener = ScriptedOpener::new(vec![
        Scripted::Fail(|| BridgeError::Transport("connection reset by peer".to_string())),
        Scripted::Fail(|| BridgeError::Upstream {
            status: 503,
            message: "overloaded".to_string(),
            rate_limit: None,
        }),
        Scripted::Body(HELLO),
    ]);
    let accounts = AccountPool::new(&["acct-a"]);
    let events = run(&controller(&fast_config(), opener.clone(), accounts)).await;

    assert_eq!(opener.calls().len(), 3);
    assert_eq!(events, vec![OutputEvent::text("Hi")]);
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempts() {
    let transient = || BridgeError::Upstream {
        status: 529,
        message: "overloaded".to_string(),
        rate_limit: None,
    };
    let opener = ScriptedOpener::new(vec![
        Scripted::Fail(transient),
        Scripted::Fail(transient),
        Scripted::Fail(transient),
        Scripted::Body(HELLO),
    ]);
    let accounts = AccountPool::new(&["acct-a"]);
    let events = run(&controller(&fast_config(), opener.clone(), accounts)).await;

    assert_eq!(opener.calls().len(), 3);
    assert_eq!(errors(&events).len(), 1);
    assert!(matches!(
        events.last(),
        Some(OutputEvent::Error { kind: ErrorKind::Transient, .. })
    ));
}

#[tokio::test]
async fn test_server_error_is_surfaced_immediately() {
    let opener = ScriptedOpener::new(vec![
        Scripted::Fail(|| BridgeError::Upstream {
            status: 500,
            message: "boom".to_string(),
            rate_limit: None,
        }),
        Scripted::Body(HELLO),
    ]);
    let accounts = AccountPool::new(&["acct-a"]);
    let events = run(&controller(&fast_config(), opener.clone(), accounts)).await;

    assert_eq!(opener.calls().len(), 1);
    assert!(matches!(
        events.as_slice(),
        [OutputEvent::Error { kind: ErrorKind::ServerError, .. }]
    ));
}

#[tokio::test]
async fn test_rotations_are_bounded() {
    let opener = ScriptedOpener::new(vec![
        Scripted::Fail(usage_limit),
        Scripted::Fail(usage_limit),
        Scripted::Fail(usage_limit),
    ]);
    let accounts = AccountPool::new(&["a", "b", "c"]);
    let mut config = fast_config();
    config.retry.max_account_rotations = 1;
    let events = run(&controller(&config, opener.clone(), accounts)).await;

    assert_eq!(opener.calls(), vec!["a", "b"]);
    assert_eq!(errors(&events).len(), 1);
}

#[tokio::test]
async fn test_cancel_during_backoff_ends_quietly() {
    let opener = ScriptedOpener::new(vec![
        Scripted::Fail(|| BridgeError::Transport("timed out".to_string())),
        Scripted::Body(HELLO),
    ]);
    let accounts = AccountPool::new(&["acct-a"]);
    let config = EngineConfig {
        retry: RetryConfig {
            initial_delay_ms: 30_000,
            max_delay_ms: 30_000,
            ..RetryConfig::default()
        },
        ..EngineConfig::default()
    };
    let controller = controller(&config, opener.clone(), accounts);
    let cancel = CancelToken::new();
    let stream = controller.run(
        StreamRequest::new("https://upstream.invalid", "{}"),
        cancel.clone(),
    );
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let events: Vec<OutputEvent> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("cancel interrupts backoff");
    canceller.await.unwrap();

    assert!(events.is_empty(), "{events:?}");
    assert_eq!(opener.calls().len(), 1);
}
