use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use stream_bridge::clock::ManualClock;
use stream_bridge::config::DecoderConfig;
use stream_bridge::error::{BridgeError, ErrorKind};
use stream_bridge::protocol::canonical::{OutputEvent, Protocol};
use stream_bridge::stream::{decode_sse_stream, ByteStream, CancelToken};

fn body_then_hang(chunks: &[&str]) -> ByteStream {
    let chunks: Vec<Result<Bytes, BridgeError>> = chunks
        .iter()
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk.as_bytes())))
        .collect();
    futures_util::stream::iter(chunks)
        .chain(futures_util::stream::pending())
        .boxed()
}

fn decoder(protocol: Protocol) -> Box<dyn stream_bridge::stream::StreamDecoder> {
    protocol.new_decoder(&DecoderConfig::default(), Arc::new(ManualClock::new()))
}

#[tokio::test]
async fn test_cancel_mid_thinking_flushes_buffer() {
    let body = body_then_hang(&[
        "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"thinking\",\"thinking\":\"\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"partial idea\"}}\n\n",
    ]);
    let cancel = CancelToken::new();
    let stream = decode_sse_stream(body, decoder(Protocol::Anthropic), cancel.clone(), Protocol::Anthropic);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });
    let events: Vec<OutputEvent> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("stream ends after cancel");
    canceller.await.unwrap();

    assert_eq!(events.len(), 2, "{events:?}");
    let OutputEvent::ThinkingDelta { text, thread_id, .. } = &events[0] else {
        panic!("expected thinking delta, got {events:?}");
    };
    assert_eq!(text, "partial idea");
    assert_eq!(
        events[1],
        OutputEvent::ThinkingClosed {
            thread_id: thread_id.clone()
        }
    );
}

#[tokio::test]
async fn test_cancel_before_first_read_emits_nothing() {
    let body = body_then_hang(&["data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"}}]}\n\n"]);
    let cancel = CancelToken::new();
    cancel.cancel();
    let events: Vec<OutputEvent> =
        decode_sse_stream(body, decoder(Protocol::OpenAiChat), cancel, Protocol::OpenAiChat)
            .collect()
            .await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn test_cancel_does_not_force_complete_tool_calls() {
    let body = body_then_hang(&[
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"run\",\"arguments\":\"{\\\"cmd\\\":\"}}]}}]}\n\n",
    ]);
    let cancel = CancelToken::new();
    let mut stream =
        decode_sse_stream(body, decoder(Protocol::OpenAiChat), cancel.clone(), Protocol::OpenAiChat);

    let first = stream.next().await;
    assert!(matches!(first, Some(OutputEvent::ToolCallStart { ref name, .. }) if name == "run"));
    cancel.cancel();
    let rest: Vec<OutputEvent> = stream.collect().await;
    assert!(rest.is_empty(), "{rest:?}");
}

#[tokio::test]
async fn test_transport_error_flushes_then_single_error() {
    let chunks: Vec<Result<Bytes, BridgeError>> = vec![
        Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"reasoning_content\":\"abc\"}}]}\n\n",
        )),
        Err(BridgeError::Transport("connection reset by peer".to_string())),
        Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"never\"}}]}\n\n",
        )),
    ];
    let body: ByteStream = futures_util::stream::iter(chunks).boxed();
    let events: Vec<OutputEvent> = decode_sse_stream(
        body,
        decoder(Protocol::OpenAiChat),
        CancelToken::new(),
        Protocol::OpenAiChat,
    )
    .collect()
    .await;

    assert!(matches!(&events[0], OutputEvent::ThinkingDelta { text, .. } if text == "abc"));
    assert!(matches!(events[1], OutputEvent::ThinkingClosed { .. }));
    assert!(matches!(
        &events[2],
        OutputEvent::Error { kind: ErrorKind::Transient, .. }
    ));
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn test_body_end_without_done_still_finishes() {
    let chunks: Vec<Result<Bytes, BridgeError>> = vec![Ok(Bytes::from_static(
        b"event: response.output_text.delta\ndata: {\"delta\":\"tail\"}",
    ))];
    let body: ByteStream = futures_util::stream::iter(chunks).boxed();
    let events: Vec<OutputEvent> = decode_sse_stream(
        body,
        decoder(Protocol::OpenAiResponses),
        CancelToken::new(),
        Protocol::OpenAiResponses,
    )
    .collect()
    .await;
    assert_eq!(events, vec![OutputEvent::text("tail")]);
}
