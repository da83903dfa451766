use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

use crate::config::RetryConfig;
use crate::error::ErrorKind;

/// What the controller does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the backoff delay and try again with the same account.
    Backoff,
    /// Ask the account provider for different credentials and retry at once.
    Rotate,
    /// Surface the error to the caller.
    Fail,
}

/// Map an error kind onto the controller's next move.
#[inline]
#[must_use]
pub fn classify(kind: ErrorKind) -> RetryDecision {
    match kind {
        ErrorKind::Transient => RetryDecision::Backoff,
        ErrorKind::RateLimited => RetryDecision::Rotate,
        ErrorKind::AuthInvalid
        | ErrorKind::ServerError
        | ErrorKind::MalformedUpstreamData
        | ErrorKind::InvalidRequest
        | ErrorKind::Cancelled => RetryDecision::Fail,
    }
}

/// Exponential backoff with symmetric jitter.
///
/// `delay(n) = initial * multiplier^n`, capped at `max_delay`, then spread by
/// `±jitter/2` of itself.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
    jitter: f64,
    honor_retry_after: bool,
    max_account_rotations: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
            honor_retry_after: config.honor_retry_after,
            max_account_rotations: config.max_account_rotations,
        }
    }

    #[inline]
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[inline]
    #[must_use]
    pub fn max_account_rotations(&self) -> u32 {
        self.max_account_rotations
    }

    /// Un-jittered delay before attempt `attempt + 1`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Jittered delay before attempt `attempt + 1`.
    ///
    /// A `Retry-After` hint, when honoured, acts as a floor; the result never
    /// exceeds `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.base_delay(attempt);
        let spread = base.as_secs_f64() * self.jitter;
        let offset = fastrand::f64() * spread - spread / 2.0;
        let jittered = Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0));
        let floor = if self.honor_retry_after {
            retry_after.unwrap_or_default()
        } else {
            Duration::ZERO
        };
        jittered.max(floor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Whether a transport failure message looks like a dropped or stalled connection.
#[inline]
pub(crate) fn is_transient_transport_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 10] = [
        b"timed out",
        b"timeout",
        b"connection reset",
        b"connection aborted",
        b"connection closed",
        b"broken pipe",
        b"http2 error",
        b"connection refused",
        b"unexpected eof",
        b"stream closed",
    ];
    let haystack = message.as_bytes();
    NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }

    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

/// Parse `Retry-After` as delta-seconds or an HTTP date relative to `now`.
#[must_use]
pub fn parse_retry_after(headers: &http::HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    if let Ok(seconds) = raw.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::from_secs_f64(seconds));
        }
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    Some(target.duration_since(now).unwrap_or_default())
}
