pub mod validation;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;
use crate::stream::{
    DuplicateFragmentRepair, FragmentRepair, PlainAppend, TextBatchLimits,
};

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Retry and account-failover configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fractional jitter applied to each delay, in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_account_rotations")]
    pub max_account_rotations: u32,
    #[serde(default = "default_true")]
    pub honor_retry_after: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_max_account_rotations() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_account_rotations: default_max_account_rotations(),
            honor_retry_after: true,
        }
    }
}

/// Duplicate-fragment repair knobs for OpenAI-style tool-call arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateRepairConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_repeat_len")]
    pub min_repeat_len: usize,
    #[serde(default = "default_prefix_scan_len")]
    pub prefix_scan_len: usize,
}

fn default_min_repeat_len() -> usize {
    8
}
fn default_prefix_scan_len() -> usize {
    50
}

impl Default for DuplicateRepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_repeat_len: default_min_repeat_len(),
            prefix_scan_len: default_prefix_scan_len(),
        }
    }
}

/// Decoder thresholds and behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_anthropic_thinking_flush_chars")]
    pub anthropic_thinking_flush_chars: usize,
    #[serde(default = "default_openai_thinking_flush_chars")]
    pub openai_thinking_flush_chars: usize,
    #[serde(default = "default_responses_thinking_flush_chars")]
    pub responses_thinking_flush_chars: usize,
    #[serde(default = "default_text_batch_max_words")]
    pub text_batch_max_words: usize,
    #[serde(default = "default_text_batch_max_chars")]
    pub text_batch_max_chars: usize,
    #[serde(default = "default_text_batch_max_interval_ms")]
    pub text_batch_max_interval_ms: u64,
    /// Text emitted at `message_stop` when a turn produced reasoning only.
    #[serde(default = "default_reasoning_placeholder")]
    pub reasoning_placeholder: String,
    #[serde(default)]
    pub duplicate_repair: DuplicateRepairConfig,
}

fn default_anthropic_thinking_flush_chars() -> usize {
    20
}
fn default_openai_thinking_flush_chars() -> usize {
    10
}
fn default_responses_thinking_flush_chars() -> usize {
    500
}
fn default_text_batch_max_words() -> usize {
    20
}
fn default_text_batch_max_chars() -> usize {
    160
}
fn default_text_batch_max_interval_ms() -> u64 {
    200
}
fn default_reasoning_placeholder() -> String {
    " ".to_string()
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            anthropic_thinking_flush_chars: default_anthropic_thinking_flush_chars(),
            openai_thinking_flush_chars: default_openai_thinking_flush_chars(),
            responses_thinking_flush_chars: default_responses_thinking_flush_chars(),
            text_batch_max_words: default_text_batch_max_words(),
            text_batch_max_chars: default_text_batch_max_chars(),
            text_batch_max_interval_ms: default_text_batch_max_interval_ms(),
            reasoning_placeholder: default_reasoning_placeholder(),
            duplicate_repair: DuplicateRepairConfig::default(),
        }
    }
}

impl DecoderConfig {
    #[must_use]
    pub fn text_batch_limits(&self) -> TextBatchLimits {
        TextBatchLimits {
            max_words: self.text_batch_max_words,
            max_chars: self.text_batch_max_chars,
            max_interval: Duration::from_millis(self.text_batch_max_interval_ms),
        }
    }

    /// Repair strategy for protocols whose upstreams resend argument bytes.
    #[must_use]
    pub fn fragment_repair(&self) -> Box<dyn FragmentRepair> {
        let repair = &self.duplicate_repair;
        if repair.enabled {
            Box::new(DuplicateFragmentRepair {
                min_repeat_len: repair.min_repeat_len,
                prefix_scan_len: repair.prefix_scan_len,
            })
        } else {
            Box::new(PlainAppend)
        }
    }
}

/// Client cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_sweep_interval_secs() -> u64 {
    60
}

impl Default for ClientCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_cache_sweep_interval_secs(),
        }
    }
}

impl ClientCacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum silence between two body chunks before the read is abandoned.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_read_timeout_secs() -> u64 {
    180
}
fn default_pool_idle_timeout_secs() -> u64 {
    15
}
fn default_user_agent() -> String {
    concat!("stream-bridge/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub client_cache: ClientCacheConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl EngineConfig {
    /// Parse and validate configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] when parsing fails or
    /// [`ConfigError::Validation`] when semantic validation fails.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if contents.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        validate_config(&config)?;
        Ok(config)
    }
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: impl AsRef<std::path::Path>) -> Result<EngineConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    EngineConfig::from_yaml_str(&contents)
}
