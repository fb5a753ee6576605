// ── Core error types ──
//
// Domain errors from gatewatch-core. Callers never see raw reqwest or
// tungstenite failures; the `From<gatewatch_api::Error>` impl translates
// vendor-surface errors into domain variants, and the wrapping variants
// attach the device, operation, and correlation id.

use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Authentication ───────────────────────────────────────────────
    #[error("Malformed Digest challenge: missing {missing}")]
    MalformedChallenge { missing: &'static str },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Cannot decrypt credentials for device '{device_id}': {message}")]
    Decrypt { device_id: String, message: String },

    // ── Lookup ───────────────────────────────────────────────────────
    #[error("No session for device '{device_id}'")]
    SessionNotFound { device_id: String },

    #[error("No configuration for device '{device_id}'")]
    ConfigNotFound { device_id: String },

    // ── Connection ───────────────────────────────────────────────────
    #[error("Cannot reach device at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Initial event transport connection to '{device_id}' failed")]
    TransportConnect {
        device_id: String,
        #[source]
        source: Box<CoreError>,
    },

    #[error("Subscription for device '{device_id}' failed (correlation {correlation_id})")]
    SubscriptionFailed {
        device_id: String,
        correlation_id: Uuid,
        #[source]
        source: Box<CoreError>,
    },

    #[error("{operation} failed for device '{device_id}' (correlation {correlation_id})")]
    Operation {
        device_id: String,
        operation: &'static str,
        correlation_id: Uuid,
        #[source]
        source: Box<CoreError>,
    },

    // ── Data ─────────────────────────────────────────────────────────
    #[error("Vendor event rejected: {message}")]
    Parse { message: String },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("Device API error: {message}")]
    Api {
        message: String,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Wrap `source` with the device and operation it failed under.
    pub fn operation(device_id: &str, operation: &'static str, source: CoreError) -> Self {
        Self::Operation {
            device_id: device_id.to_owned(),
            operation,
            correlation_id: Uuid::new_v4(),
            source: Box::new(source),
        }
    }

    /// The innermost cause, skipping context wrappers.
    pub fn root(&self) -> &CoreError {
        match self {
            Self::TransportConnect { source, .. }
            | Self::SubscriptionFailed { source, .. }
            | Self::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Correlation id of the outermost wrapper, if any.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::SubscriptionFailed { correlation_id, .. }
            | Self::Operation { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }

    /// Whether the root cause is a credential or challenge problem.
    pub fn is_auth(&self) -> bool {
        matches!(
            self.root(),
            Self::AuthenticationFailed { .. }
                | Self::MalformedChallenge { .. }
                | Self::Decrypt { .. }
        )
    }
}

// ── Conversion from vendor-surface errors ────────────────────────────

impl From<gatewatch_api::Error> for CoreError {
    fn from(err: gatewatch_api::Error) -> Self {
        use gatewatch_api::Error as ApiError;

        match err {
            ApiError::MalformedChallenge { missing } => CoreError::MalformedChallenge { missing },
            ApiError::Authentication { message } => CoreError::AuthenticationFailed { message },
            ApiError::Transport(ref e) => {
                if e.is_connect() || e.is_timeout() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map_or_else(|| "<unknown>".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            ApiError::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            ApiError::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            ApiError::Isapi { status, message } => CoreError::Api {
                message,
                status: Some(status),
            },
            ApiError::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            ApiError::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            ApiError::Parse { message } => CoreError::Parse { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_skips_wrappers() {
        let err = CoreError::SubscriptionFailed {
            device_id: "door-1".into(),
            correlation_id: Uuid::new_v4(),
            source: Box::new(CoreError::TransportConnect {
                device_id: "door-1".into(),
                source: Box::new(CoreError::AuthenticationFailed {
                    message: "rejected".into(),
                }),
            }),
        };
        assert!(matches!(err.root(), CoreError::AuthenticationFailed { .. }));
        assert!(err.is_auth());
        assert!(err.correlation_id().is_some());
    }

    #[test]
    fn api_errors_translate() {
        let err: CoreError = gatewatch_api::Error::MalformedChallenge { missing: "realm" }.into();
        assert!(matches!(err, CoreError::MalformedChallenge { missing: "realm" }));

        let err: CoreError = gatewatch_api::Error::Isapi {
            status: 503,
            message: "busy".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Api { status: Some(503), .. }));
    }
}
