use super::{ConfigError, EngineConfig};

/// Validate the full engine config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    validate_log_level(config)?;
    validate_retry(config)?;
    validate_decoder(config)?;
    validate_client_cache(config)?;
    validate_transport(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_log_level(config: &EngineConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.logging.level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "logging.level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_retry(config: &EngineConfig) -> Result<(), ConfigError> {
    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(validation_err("retry.max_attempts must be greater than 0"));
    }
    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
        return Err(validation_err(
            "retry.backoff_multiplier must be a finite number >= 1.0",
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return Err(validation_err("retry.jitter must be between 0.0 and 1.0"));
    }
    if retry.max_delay_ms < retry.initial_delay_ms {
        return Err(validation_err(
            "retry.max_delay_ms must not be smaller than retry.initial_delay_ms",
        ));
    }
    Ok(())
}

fn validate_decoder(config: &EngineConfig) -> Result<(), ConfigError> {
    let decoder = &config.decoder;
    let thresholds = [
        (
            "decoder.anthropic_thinking_flush_chars",
            decoder.anthropic_thinking_flush_chars,
        ),
        (
            "decoder.openai_thinking_flush_chars",
            decoder.openai_thinking_flush_chars,
        ),
        (
            "decoder.responses_thinking_flush_chars",
            decoder.responses_thinking_flush_chars,
        ),
        ("decoder.text_batch_max_words", decoder.text_batch_max_words),
        ("decoder.text_batch_max_chars", decoder.text_batch_max_chars),
    ];
    for (name, value) in thresholds {
        if value == 0 {
            return Err(validation_err(format!("{name} must be greater than 0")));
        }
    }
    if decoder.reasoning_placeholder.is_empty() {
        return Err(validation_err(
            "decoder.reasoning_placeholder cannot be empty",
        ));
    }
    let repair = &decoder.duplicate_repair;
    if repair.enabled && repair.prefix_scan_len < repair.min_repeat_len {
        return Err(validation_err(
            "decoder.duplicate_repair.prefix_scan_len must be >= min_repeat_len",
        ));
    }
    Ok(())
}

fn validate_client_cache(config: &EngineConfig) -> Result<(), ConfigError> {
    let cache = &config.client_cache;
    if cache.ttl_secs == 0 {
        return Err(validation_err("client_cache.ttl_secs must be greater than 0"));
    }
    if cache.sweep_interval_secs == 0 {
        return Err(validation_err(
            "client_cache.sweep_interval_secs must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_transport(config: &EngineConfig) -> Result<(), ConfigError> {
    let transport = &config.transport;
    if transport.connect_timeout_secs == 0 {
        return Err(validation_err(
            "transport.connect_timeout_secs must be greater than 0",
        ));
    }
    if transport.read_timeout_secs == 0 {
        return Err(validation_err(
            "transport.read_timeout_secs must be greater than 0",
        ));
    }
    if transport.user_agent.trim().is_empty() {
        return Err(validation_err("transport.user_agent cannot be empty"));
    }
    Ok(())
}
