use serde::Serialize;

use crate::transport::rate_limit::RateLimitSnapshot;

/// Crate-wide error type.
///
/// Decoders never return it for per-record problems (those are logged and
/// skipped); it surfaces from opening a stream and from configuration.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream {
        status: u16,
        message: String,
        rate_limit: Option<RateLimitSnapshot>,
    },
    #[error("Usage limit reached: {message}")]
    UsageLimit {
        message: String,
        rate_limit: Option<RateLimitSnapshot>,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Malformed upstream data: {0}")]
    Malformed(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy shared by the controller and the `Error` output event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    AuthInvalid,
    ServerError,
    MalformedUpstreamData,
    InvalidRequest,
    Cancelled,
}

/// Map an upstream HTTP status code to an error kind.
///
/// Gateway and overload statuses count as transient; every other 5xx is a
/// server error that ends the turn.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::AuthInvalid,
        408 => ErrorKind::Transient,
        429 => ErrorKind::RateLimited,
        502 | 503 | 504 | 529 => ErrorKind::Transient,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::InvalidRequest,
    }
}

impl BridgeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Auth(_) => ErrorKind::AuthInvalid,
            BridgeError::Upstream { status, .. } => category_from_upstream_status(*status),
            BridgeError::UsageLimit { .. } => ErrorKind::RateLimited,
            BridgeError::Transport(_) => ErrorKind::Transient,
            BridgeError::Malformed(_) => ErrorKind::MalformedUpstreamData,
            BridgeError::Cancelled => ErrorKind::Cancelled,
            BridgeError::Config(_) | BridgeError::Internal(_) => ErrorKind::ServerError,
        }
    }

    #[must_use]
    pub fn rate_limit(&self) -> Option<&RateLimitSnapshot> {
        match self {
            BridgeError::Upstream { rate_limit, .. } | BridgeError::UsageLimit { rate_limit, .. } => {
                rate_limit.as_ref()
            }
            _ => None,
        }
    }

    /// Message shown to the end user for a fatal outcome. `now` anchors the
    /// reset estimate of a usage limit.
    #[must_use]
    pub fn user_message(&self, now: chrono::DateTime<chrono::Utc>) -> String {
        match self.kind() {
            ErrorKind::AuthInvalid => {
                "Authentication failed. Please sign in again to continue.".to_string()
            }
            ErrorKind::RateLimited => match self.rate_limit() {
                Some(snapshot) => format!(
                    "Usage limit reached. {}",
                    snapshot.reset_description(now)
                ),
                None => "Usage limit reached. Please try again later.".to_string(),
            },
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_upstream_status() {
        assert_eq!(category_from_upstream_status(401), ErrorKind::AuthInvalid);
        assert_eq!(category_from_upstream_status(403), ErrorKind::AuthInvalid);
        assert_eq!(category_from_upstream_status(429), ErrorKind::RateLimited);
        assert_eq!(category_from_upstream_status(503), ErrorKind::Transient);
        assert_eq!(category_from_upstream_status(529), ErrorKind::Transient);
        assert_eq!(category_from_upstream_status(500), ErrorKind::ServerError);
        assert_eq!(category_from_upstream_status(400), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_usage_limit_is_rate_limited() {
        let err = BridgeError::UsageLimit {
            message: "usage_limit_reached".to_string(),
            rate_limit: None,
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.user_message(chrono::Utc::now()).starts_with("Usage limit reached."));
    }

    #[test]
    fn test_auth_message_asks_for_reauth() {
        let err = BridgeError::Upstream {
            status: 401,
            message: "invalid token".to_string(),
            rate_limit: None,
        };
        assert!(err.user_message(chrono::Utc::now()).contains("sign in again"));
    }
}
