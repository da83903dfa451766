use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use bytes::Bytes;
use clap::{CommandFactory, Parser, ValueEnum};
use futures_util::StreamExt;
use stream_bridge::clock::system_clock;
use stream_bridge::config::{load_config, EngineConfig};
use stream_bridge::error::BridgeError;
use stream_bridge::observability::init_tracing;
use stream_bridge::protocol::canonical::Protocol;
use stream_bridge::protocol::openai_chat::conformance::fix_sse_text;
use stream_bridge::stream::{decode_sse_stream, ByteStream, CancelToken};

const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Replay a captured SSE response through a decoder and print one JSON
/// output event per line.
#[derive(Parser, Debug)]
#[command(name = "stream-bridge", version, about)]
struct Cli {
    /// Wire protocol of the capture
    #[arg(value_enum)]
    protocol: ReplayProtocol,

    /// Captured SSE response body
    capture: PathBuf,

    /// Engine config (YAML); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Split the capture into chunks of this many bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser = parse_chunk_size)]
    chunk_size: usize,

    /// Print the capture after OpenAI conformance fixing and exit
    #[arg(long)]
    fix_only: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ReplayProtocol {
    Anthropic,
    Openai,
    OpenaiResponses,
}

impl From<ReplayProtocol> for Protocol {
    fn from(protocol: ReplayProtocol) -> Self {
        match protocol {
            ReplayProtocol::Anthropic => Protocol::Anthropic,
            ReplayProtocol::Openai => Protocol::OpenAiChat,
            ReplayProtocol::OpenaiResponses => Protocol::OpenAiResponses,
        }
    }
}

impl Cli {
    fn check(&self) -> Result<(), clap::Error> {
        if self.fix_only && self.protocol != ReplayProtocol::Openai {
            return Err(Cli::command().error(
                clap::error::ErrorKind::ArgumentConflict,
                "--fix-only only applies to the openai protocol",
            ));
        }
        Ok(())
    }
}

fn parse_chunk_size(raw: &str) -> Result<usize, String> {
    raw.parse::<usize>()
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| format!("invalid chunk size: {raw}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = cli.check() {
        err.exit();
    }

    let config = match cli.config.as_deref() {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Failed to load configuration: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };
    init_tracing(&config.logging);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to initialize Tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(replay(cli, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn replay(cli: Cli, config: EngineConfig) -> Result<(), String> {
    let capture = tokio::fs::read(&cli.capture)
        .await
        .map_err(|err| format!("Failed to read {}: {err}", cli.capture.display()))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if cli.fix_only {
        let text = String::from_utf8_lossy(&capture);
        out.write_all(fix_sse_text(&text).as_bytes())
            .map_err(|err| err.to_string())?;
        return Ok(());
    }

    let chunks: Vec<Result<Bytes, BridgeError>> = Bytes::from(capture)
        .chunks(cli.chunk_size)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    let body: ByteStream = futures_util::stream::iter(chunks).boxed();
    let protocol = Protocol::from(cli.protocol);
    let decoder = protocol.new_decoder(&config.decoder, system_clock());
    let mut events = decode_sse_stream(body, decoder, CancelToken::new(), protocol);

    while let Some(event) = events.next().await {
        let line = serde_json::to_string(&event).map_err(|err| err.to_string())?;
        writeln!(out, "{line}").map_err(|err| err.to_string())?;
    }
    out.flush().map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(list: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("stream-bridge").chain(list.iter().copied()))
    }

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_args_defaults() {
        let cli = parse(&["anthropic", "capture.sse"]).unwrap();
        assert_eq!(cli.protocol, ReplayProtocol::Anthropic);
        assert_eq!(cli.capture, PathBuf::from("capture.sse"));
        assert_eq!(cli.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!cli.fix_only);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parse_args_options() {
        let cli = parse(&[
            "--chunk-size",
            "7",
            "openai",
            "cap.sse",
            "--config",
            "engine.yaml",
            "--fix-only",
        ])
        .unwrap();
        assert_eq!(Protocol::from(cli.protocol), Protocol::OpenAiChat);
        assert_eq!(cli.chunk_size, 7);
        assert!(cli.fix_only);
        assert_eq!(cli.config, Some(PathBuf::from("engine.yaml")));
    }

    #[test]
    fn test_responses_protocol_name() {
        let cli = parse(&["openai-responses", "cap.sse"]).unwrap();
        assert_eq!(Protocol::from(cli.protocol), Protocol::OpenAiResponses);
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(parse(&["anthropic"]).is_err());
        assert!(parse(&["gemini", "x"]).is_err());
        assert!(parse(&["openai", "x", "--chunk-size", "0"]).is_err());
        assert!(parse(&["openai", "x", "--verbose"]).is_err());
        let fix_anthropic = parse(&["anthropic", "x", "--fix-only"]).unwrap();
        assert!(fix_anthropic.check().is_err());
        assert!(parse(&["openai", "x", "--fix-only"]).unwrap().check().is_ok());
    }
}
