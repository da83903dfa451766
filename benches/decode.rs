use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;

use stream_bridge::clock::ManualClock;
use stream_bridge::config::DecoderConfig;
use stream_bridge::protocol::anthropic::stream::AnthropicStreamDecoder;
use stream_bridge::protocol::openai_chat::conformance::fix_sse_text;
use stream_bridge::protocol::openai_chat::stream::OpenAiChatStreamDecoder;
use stream_bridge::protocol::openai_responses::stream::ResponsesStreamDecoder;
use stream_bridge::stream::decode_chunks;

fn sse(records: &[serde_json::Value], named: bool) -> String {
    let mut body = String::new();
    for record in records {
        if named {
            body.push_str("event: ");
            body.push_str(record["type"].as_str().unwrap_or_default());
            body.push('\n');
        }
        body.push_str("data: ");
        body.push_str(&record.to_string());
        body.push_str("\n\n");
    }
    body
}

fn anthropic_body(deltas: usize) -> String {
    let mut records = vec![
        json!({"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}),
        json!({"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}),
    ];
    for _ in 0..deltas {
        records.push(json!({"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"step "}}));
    }
    records.push(json!({"type":"content_block_stop","index":0}));
    records.push(json!({"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}));
    for _ in 0..deltas {
        records.push(json!({"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"word "}}));
    }
    records.push(json!({"type":"content_block_stop","index":1}));
    records.push(json!({"type":"message_stop"}));
    sse(&records, true)
}

fn openai_tool_body(fragments: usize) -> String {
    let mut records = vec![json!({"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"write_file","arguments":"{\"content\":\""}}]}}]})];
    for _ in 0..fragments {
        records.push(json!({"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"abcdefgh"}}]}}]}));
    }
    records.push(json!({"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"}"}}]}}]}));
    records.push(json!({"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}));
    let mut body = sse(&records, false);
    body.push_str("data: [DONE]\n\n");
    body
}

fn responses_body(deltas: usize) -> String {
    let mut records = vec![json!({"type":"response.output_item.added","output_index":0,"item":{"type":"reasoning","id":"rs_1"}})];
    for _ in 0..deltas {
        records.push(json!({"type":"response.reasoning_summary_text.delta","item_id":"rs_1","delta":"thinking "}));
    }
    records.push(json!({"type":"response.output_item.done","output_index":0,"item":{"type":"reasoning","id":"rs_1"}}));
    for _ in 0..deltas {
        records.push(json!({"type":"response.output_text.delta","item_id":"msg_1","delta":"token "}));
    }
    records.push(json!({"type":"response.completed","response":{"usage":{"input_tokens":3,"output_tokens":9}}}));
    sse(&records, true)
}

fn bench_anthropic(c: &mut Criterion) {
    let config = DecoderConfig::default();
    let body = anthropic_body(512);

    c.bench_function("anthropic_decode_512_deltas_4k_chunks", |b| {
        b.iter(|| {
            let mut decoder = AnthropicStreamDecoder::new(&config, Arc::new(ManualClock::new()));
            let events = decode_chunks(&mut decoder, black_box(body.as_bytes()).chunks(4096));
            black_box(events.len());
        });
    });

    c.bench_function("anthropic_decode_512_deltas_7b_chunks", |b| {
        b.iter(|| {
            let mut decoder = AnthropicStreamDecoder::new(&config, Arc::new(ManualClock::new()));
            let events = decode_chunks(&mut decoder, black_box(body.as_bytes()).chunks(7));
            black_box(events.len());
        });
    });
}

fn bench_openai_tool_calls(c: &mut Criterion) {
    let config = DecoderConfig::default();
    let body = openai_tool_body(1024);

    c.bench_function("openai_tool_call_1k_fragments_repair", |b| {
        b.iter(|| {
            let mut decoder = OpenAiChatStreamDecoder::new(&config);
            let events = decode_chunks(&mut decoder, black_box(body.as_bytes()).chunks(4096));
            black_box(events.len());
        });
    });

    let mut plain = config.clone();
    plain.duplicate_repair.enabled = false;
    c.bench_function("openai_tool_call_1k_fragments_plain", |b| {
        b.iter(|| {
            let mut decoder = OpenAiChatStreamDecoder::new(&plain);
            let events = decode_chunks(&mut decoder, black_box(body.as_bytes()).chunks(4096));
            black_box(events.len());
        });
    });
}

fn bench_responses(c: &mut Criterion) {
    let config = DecoderConfig::default();
    let body = responses_body(512);

    c.bench_function("responses_decode_512_deltas", |b| {
        b.iter(|| {
            let mut decoder = ResponsesStreamDecoder::new(&config);
            let events = decode_chunks(&mut decoder, black_box(body.as_bytes()).chunks(4096));
            black_box(events.len());
        });
    });
}

fn bench_conformance_fixer(c: &mut Criterion) {
    let conforming = openai_tool_body(256);
    let sloppy = conforming.replace("data: ", "data:");

    c.bench_function("sse_fixer_conforming_passthrough", |b| {
        b.iter(|| black_box(fix_sse_text(black_box(&conforming)).len()));
    });

    c.bench_function("sse_fixer_rewrites_missing_space", |b| {
        b.iter(|| black_box(fix_sse_text(black_box(&sloppy)).len()));
    });
}

criterion_group!(
    benches,
    bench_anthropic,
    bench_openai_tool_calls,
    bench_responses,
    bench_conformance_fixer
);
criterion_main!(benches);
