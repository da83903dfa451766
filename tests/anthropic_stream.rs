use std::sync::Arc;

use serde_json::json;
use stream_bridge::clock::ManualClock;
use stream_bridge::config::DecoderConfig;
use stream_bridge::protocol::anthropic::stream::AnthropicStreamDecoder;
use stream_bridge::protocol::canonical::{OutputEvent, ToolArguments, Usage};
use stream_bridge::stream::decode_chunks;

fn sse(records: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for record in records {
        let event = record["type"].as_str().unwrap_or_default();
        body.push_str("event: ");
        body.push_str(event);
        body.push_str("\ndata: ");
        body.push_str(&record.to_string());
        body.push_str("\n\n");
    }
    body
}

fn decoder() -> AnthropicStreamDecoder {
    AnthropicStreamDecoder::new(&DecoderConfig::default(), Arc::new(ManualClock::new()))
}

fn decode_in_chunks(body: &str, chunk_size: usize) -> Vec<OutputEvent> {
    let mut decoder = decoder();
    decode_chunks(&mut decoder, body.as_bytes().chunks(chunk_size))
}

fn texts(events: &[OutputEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            OutputEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_hi_there_yields_text_without_thinking() {
    let body = sse(&[
        json!({"type":"message_start","message":{"id":"msg_1","model":"claude","usage":{"input_tokens":5,"output_tokens":1}}}),
        json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}),
        json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}),
        json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}),
        json!({"type":"content_block_stop","index":0}),
        json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}),
        json!({"type":"message_stop"}),
    ]);
    let events = decode_in_chunks(&body, 4096);

    assert_eq!(texts(&events).concat(), "Hi there");
    assert!(!events.iter().any(|event| matches!(
        event,
        OutputEvent::ThinkingDelta { .. } | OutputEvent::ThinkingClosed { .. }
    )));
    assert_eq!(
        events.last(),
        Some(&OutputEvent::Usage(Usage::new(Some(5), Some(2))))
    );
}

#[test]
fn test_single_char_deltas_batch_to_ceil_of_160() {
    let total: usize = 400;
    let mut records = vec![json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}})];
    for _ in 0..total {
        records.push(json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"a"}}));
    }
    records.push(json!({"type":"content_block_stop","index":0}));
    records.push(json!({"type":"message_stop"}));

    let events = decode_in_chunks(&sse(&records), 4096);
    let texts = texts(&events);
    assert_eq!(texts.len(), total.div_ceil(160));
    assert_eq!(texts.concat(), "a".repeat(total));
}

#[test]
fn test_thinking_closed_before_text_across_chunk_boundaries() {
    let body = sse(&[
        json!({"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}),
        json!({"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Let me think about this carefully."}}),
        json!({"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":" Done."}}),
        json!({"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig-abc"}}),
        json!({"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}),
        json!({"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Answer."}}),
        json!({"type":"content_block_stop","index":1}),
        json!({"type":"message_stop"}),
    ]);

    for chunk_size in [1, 3, 7, 64, 4096] {
        let events = decode_in_chunks(&body, chunk_size);
        let closed = events
            .iter()
            .position(|e| matches!(e, OutputEvent::ThinkingClosed { .. }))
            .expect("thinking closed");
        let first_text = events
            .iter()
            .position(|e| matches!(e, OutputEvent::TextDelta { .. }))
            .expect("text emitted");
        assert!(closed < first_text, "chunk size {chunk_size}: {events:?}");

        let thinking: String = events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::ThinkingDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(thinking, "Let me think about this carefully. Done.");
        let signature = events.iter().rev().find_map(|e| match e {
            OutputEvent::ThinkingDelta { signature, .. } => signature.clone(),
            _ => None,
        });
        assert_eq!(signature.as_deref(), Some("sig-abc"));
    }
}

#[test]
fn test_malformed_record_inside_chunk_does_not_stop_stream() {
    let good_start = json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}});
    let good_delta = json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"still here"}});
    let body = format!(
        "event: content_block_start\ndata: {good_start}\n\n\
         event: content_block_delta\ndata: {{\"type\":\"content_block_delta\",\"index\":0,\"delta\":\n\n\
         event: content_block_delta\ndata: {good_delta}\n\n\
         event: message_stop\ndata: {{\"type\":\"message_stop\"}}\n\n"
    );
    let events = decode_in_chunks(&body, body.len());
    assert_eq!(texts(&events).concat(), "still here");
}

#[test]
fn test_tool_use_fragments_complete_once() {
    let body = sse(&[
        json!({"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_9","name":"get_weather","input":{}}}),
        json!({"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":""}}),
        json!({"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}),
        json!({"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"Paris\"}"}}),
        json!({"type":"content_block_stop","index":0}),
        json!({"type":"message_stop"}),
    ]);
    let events = decode_in_chunks(&body, 5);
    let completes: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, OutputEvent::ToolCallComplete { .. }))
        .collect();
    assert_eq!(
        completes,
        vec![&OutputEvent::ToolCallComplete {
            id: "toolu_9".to_string(),
            name: "get_weather".to_string(),
            arguments: ToolArguments::Parsed(json!({"city": "Paris"})),
        }]
    );
    assert!(matches!(
        events.first(),
        Some(OutputEvent::ToolCallStart { id, name }) if id == "toolu_9" && name == "get_weather"
    ));
}

#[test]
fn test_reasoning_only_response_gets_placeholder() {
    let body = sse(&[
        json!({"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":"hmm"}}),
        json!({"type":"content_block_stop","index":0}),
        json!({"type":"message_stop"}),
    ]);
    let events = decode_in_chunks(&body, 4096);
    assert_eq!(texts(&events), vec![" "]);
}

#[test]
fn test_cache_tokens_count_as_input() {
    let body = sse(&[
        json!({"type":"message_start","message":{"usage":{"input_tokens":10,"cache_read_input_tokens":90,"output_tokens":0}}}),
        json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":"ok"}}),
        json!({"type":"content_block_stop","index":0}),
        json!({"type":"message_delta","delta":{},"usage":{"output_tokens":3}}),
        json!({"type":"message_stop"}),
    ]);
    let events = decode_in_chunks(&body, 4096);
    assert_eq!(
        events.last(),
        Some(&OutputEvent::Usage(Usage::new(Some(100), Some(3))))
    );
}

#[test]
fn test_in_band_error_event() {
    let body = sse(&[
        json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":"partial"}}),
        json!({"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}),
    ]);
    let events = decode_in_chunks(&body, 4096);
    assert_eq!(texts(&events), vec!["partial"]);
    assert!(events.iter().any(|e| matches!(
        e,
        OutputEvent::Error { kind: stream_bridge::error::ErrorKind::Transient, message } if message == "Overloaded"
    )));
}
