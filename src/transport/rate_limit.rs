//! Rate-limit snapshots parsed from response headers and usage-limit bodies.
//!
//! Three header families are understood: the coding backend's
//! `x-codex-primary-*` / `x-codex-secondary-*` windows, the generic
//! `x-ratelimit-*` set (durations such as `1m30s`), and
//! `anthropic-ratelimit-*` (RFC 3339 reset instants). `retry-after` fills in
//! the reset time when nothing more specific is present.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;
use serde::Serialize;

use super::retry_policy::parse_retry_after;

/// Point-in-time view of the caller's quota. Replaced wholesale, never merged
/// across responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateLimitSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_percent: Option<f64>,
}

impl RateLimitSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining.is_none()
            && self.limit.is_none()
            && self.reset_at.is_none()
            && self.plan_type.is_none()
            && self.used_percent.is_none()
    }

    /// Build a snapshot from response headers. Returns `None` when no known
    /// header is present.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Self> {
        let mut snapshot = codex_window(headers, "primary", now).unwrap_or_default();
        if let Some(secondary) = codex_window(headers, "secondary", now) {
            // The tighter of the two windows is the one that matters.
            let tighter = match (snapshot.used_percent, secondary.used_percent) {
                (Some(primary), Some(other)) => other > primary,
                (None, Some(_)) => true,
                _ => false,
            };
            if tighter {
                snapshot = secondary;
            }
        }

        snapshot.fill_from(generic_ratelimit(headers, now));
        snapshot.fill_from(anthropic_ratelimit(headers));

        if snapshot.reset_at.is_none() {
            if let Some(delay) = parse_retry_after(headers, now.into()) {
                snapshot.reset_at = add_duration(now, delay);
            }
        }

        (!snapshot.is_empty()).then_some(snapshot)
    }

    /// Build a snapshot from a structured usage-limit error body.
    ///
    /// Accepts the fields either under `error` or at the top level:
    /// `resets_at` (epoch seconds), `resets_in_seconds`, `plan_type`.
    #[must_use]
    pub fn from_error_body(body: &str, now: DateTime<Utc>) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        let error = value.get("error").filter(|e| e.is_object()).unwrap_or(&value);

        let mut snapshot = Self {
            plan_type: error
                .get("plan_type")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            ..Self::default()
        };
        if let Some(epoch) = error.get("resets_at").and_then(serde_json::Value::as_i64) {
            snapshot.reset_at = Utc.timestamp_opt(epoch, 0).single();
        }
        if snapshot.reset_at.is_none() {
            if let Some(seconds) = error
                .get("resets_in_seconds")
                .and_then(serde_json::Value::as_u64)
            {
                snapshot.reset_at = add_duration(now, Duration::from_secs(seconds));
            }
        }
        if is_usage_limit_value(error) {
            snapshot.remaining = Some(0);
        }
        (!snapshot.is_empty()).then_some(snapshot)
    }

    /// Fill fields this snapshot lacks from `other`.
    pub fn fill_from(&mut self, other: Option<Self>) {
        let Some(other) = other else {
            return;
        };
        self.remaining = self.remaining.or(other.remaining);
        self.limit = self.limit.or(other.limit);
        self.reset_at = self.reset_at.or(other.reset_at);
        self.used_percent = self.used_percent.or(other.used_percent);
        if self.plan_type.is_none() {
            self.plan_type = other.plan_type;
        }
    }

    /// Human-readable reset estimate, e.g. `Resets in 2 hours 5 minutes.`
    #[must_use]
    pub fn reset_description(&self, now: DateTime<Utc>) -> String {
        let Some(reset_at) = self.reset_at else {
            return "Please try again later.".to_string();
        };
        let remaining = (reset_at - now).num_seconds();
        if remaining <= 0 {
            return "The limit should reset momentarily.".to_string();
        }
        let when = format_wait(u64::try_from(remaining).unwrap_or(0));
        match self.plan_type.as_deref() {
            Some(plan) if !plan.is_empty() => {
                format!("Your {plan} plan limit resets in {when}.")
            }
            _ => format!("Resets in {when}."),
        }
    }
}

/// Whether a JSON error body reports an exhausted usage quota.
#[must_use]
pub fn is_usage_limit_body(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let error = value.get("error").filter(|e| e.is_object()).unwrap_or(&value);
    is_usage_limit_value(error)
}

fn is_usage_limit_value(error: &serde_json::Value) -> bool {
    ["type", "code"].iter().any(|field| {
        error
            .get(*field)
            .and_then(serde_json::Value::as_str)
            .is_some_and(|value| value == "usage_limit_reached")
    })
}

fn codex_window(headers: &HeaderMap, window: &str, now: DateTime<Utc>) -> Option<RateLimitSnapshot> {
    let used_percent = header_str(headers, &format!("x-codex-{window}-used-percent"))
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite());
    let reset_after = header_str(headers, &format!("x-codex-{window}-reset-after-seconds"))
        .and_then(|v| v.parse::<u64>().ok());
    let reset_at_epoch = header_str(headers, &format!("x-codex-{window}-reset-at"))
        .and_then(|v| v.parse::<i64>().ok());
    if used_percent.is_none() && reset_after.is_none() && reset_at_epoch.is_none() {
        return None;
    }
    let reset_at = reset_at_epoch
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .or_else(|| reset_after.and_then(|secs| add_duration(now, Duration::from_secs(secs))));
    Some(RateLimitSnapshot {
        used_percent,
        reset_at,
        plan_type: header_str(headers, "x-codex-plan-type").map(str::to_string),
        ..RateLimitSnapshot::default()
    })
}

fn generic_ratelimit(headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateLimitSnapshot> {
    ["requests", "tokens"].iter().find_map(|unit| {
        let remaining = header_u64(headers, &format!("x-ratelimit-remaining-{unit}"));
        let limit = header_u64(headers, &format!("x-ratelimit-limit-{unit}"));
        let reset_at = header_str(headers, &format!("x-ratelimit-reset-{unit}"))
            .and_then(parse_go_duration)
            .and_then(|delay| add_duration(now, delay));
        if remaining.is_none() && limit.is_none() && reset_at.is_none() {
            return None;
        }
        Some(RateLimitSnapshot {
            remaining,
            limit,
            reset_at,
            ..RateLimitSnapshot::default()
        })
    })
}

fn anthropic_ratelimit(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    ["requests", "tokens", "input-tokens", "output-tokens"]
        .iter()
        .find_map(|unit| {
            let remaining = header_u64(headers, &format!("anthropic-ratelimit-{unit}-remaining"));
            let limit = header_u64(headers, &format!("anthropic-ratelimit-{unit}-limit"));
            let reset_at = header_str(headers, &format!("anthropic-ratelimit-{unit}-reset"))
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|at| at.with_timezone(&Utc));
            if remaining.is_none() && limit.is_none() && reset_at.is_none() {
                return None;
            }
            Some(RateLimitSnapshot {
                remaining,
                limit,
                reset_at,
                ..RateLimitSnapshot::default()
            })
        })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name)?.parse().ok()
}

fn add_duration(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay).ok()?;
    now.checked_add_signed(delay)
}

/// Parse compound durations such as `1h2m3.5s`, `6ms` or `20s`. A bare
/// number is seconds.
#[must_use]
pub fn parse_go_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<f64>() {
        return (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds));
    }

    let mut total = 0.0_f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 0.001,
            "us" | "µs" => 0.000_001,
            "ns" => 0.000_000_001,
            _ => return None,
        };
        total += value * scale;
        rest = &rest[unit_len..];
    }
    total.is_finite().then(|| Duration::from_secs_f64(total))
}

fn format_wait(seconds: u64) -> String {
    if seconds < 60 {
        return "less than a minute".to_string();
    }
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let mut parts = Vec::with_capacity(2);
    for (value, unit) in [(days, "day"), (hours, "hour"), (minutes, "minute")] {
        if value == 0 || parts.len() == 2 {
            continue;
        }
        let plural = if value == 1 { "" } else { "s" };
        parts.push(format!("{value} {unit}{plural}"));
    }
    parts.join(" ")
}
