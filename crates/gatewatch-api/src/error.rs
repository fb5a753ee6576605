use thiserror::Error;

/// Top-level error type for the `gatewatch-api` crate.
///
/// Covers every failure mode of the vendor surface: challenge negotiation,
/// HTTP transport, ISAPI responses, the alert-stream WebSocket, and payload
/// parsing. `gatewatch-core` maps these into domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Digest challenge is missing `realm` or `nonce`.
    #[error("Malformed Digest challenge: missing {missing}")]
    MalformedChallenge { missing: &'static str },

    /// Credentials rejected, or the device answered 401 without a usable challenge.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── ISAPI ───────────────────────────────────────────────────────
    /// Non-success HTTP status from an ISAPI endpoint.
    #[error("ISAPI error (HTTP {status}): {message}")]
    Isapi { status: u16, message: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed by the device.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// A vendor payload could not be interpreted.
    #[error("Unparseable vendor payload: {message}")]
    Parse { message: String },
}

impl Error {
    /// Returns `true` if this error came from a credential or challenge problem.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::MalformedChallenge { .. }
        )
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}
