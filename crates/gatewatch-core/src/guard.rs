//! Inbound device request authentication.
//!
//! [`require_device_auth`] is an axum middleware for endpoints devices
//! call back into. A request must carry `x-device-id` and
//! `x-device-signature`, and may carry an RFC 3339 `x-timestamp`. The
//! signature is the first 32 hex characters of
//! `SHA-256(json + shared_secret)`, where `json` is
//! `{"deviceId":…,"body":…,"timestamp":…}` serialized compactly in that
//! key order (`timestamp` omitted when the header is absent).
//!
//! ```ignore
//! let guard = Arc::new(GuardConfig::new(secret));
//! let app = Router::new()
//!     .route("/api/device/events", post(ingest))
//!     .layer(middleware::from_fn_with_state(guard, require_device_auth));
//! ```

use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub const HEADER_DEVICE_ID: &str = "x-device-id";
pub const HEADER_SIGNATURE: &str = "x-device-signature";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";

const SIGNATURE_LEN: usize = 32;

/// Guard settings, shared with the middleware as axum state.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub shared_secret: SecretString,
    /// Exact paths that skip authentication.
    pub public_paths: Vec<String>,
    pub max_skew: chrono::Duration,
    /// Signatures starting with this are accepted outside production.
    pub dev_signature_prefix: Option<String>,
    pub production: bool,
    /// Largest body buffered for signing, in bytes.
    pub body_limit: usize,
}

impl GuardConfig {
    pub fn new(shared_secret: SecretString) -> Self {
        Self {
            shared_secret,
            public_paths: vec!["/health".into()],
            max_skew: chrono::Duration::minutes(5),
            dev_signature_prefix: None,
            production: true,
            body_limit: 1024 * 1024,
        }
    }

    fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| p == path)
    }
}

/// Request extension set on every request the guard lets through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedDevice {
    pub device_id: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedPayload<'a> {
    device_id: &'a str,
    body: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<&'a str>,
}

/// Compute the expected signature for a request.
///
/// `body` is the parsed request body: JSON when it parses, `{}` when
/// empty, the raw text otherwise. See [`body_value`].
pub fn compute_signature(
    device_id: &str,
    body: &Value,
    timestamp: Option<&str>,
    shared_secret: &SecretString,
) -> String {
    let payload = SignedPayload {
        device_id,
        body,
        timestamp,
    };
    let json = serde_json::to_string(&payload).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hasher.update(shared_secret.expose_secret().as_bytes());
    let mut hex: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    hex.truncate(SIGNATURE_LEN);
    hex
}

/// The body as it enters the signature.
pub fn body_value(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return json!({});
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// ── Middleware ───────────────────────────────────────────────────────

/// Reject unsigned or mis-signed device requests with `401`.
pub async fn require_device_auth(
    State(config): State<Arc<GuardConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if config.is_public(request.uri().path()) {
        return next.run(request).await;
    }

    let (mut parts, body) = request.into_parts();
    let bytes = match to_bytes(body, config.body_limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %parts.uri.path(), error = %e, "device request body unreadable");
            return reject("request body unreadable or too large");
        }
    };

    match verify(&config, &parts.headers, &bytes) {
        Ok(device) => {
            debug!(device_id = %device.device_id, path = %parts.uri.path(), "device request authenticated");
            parts.extensions.insert(device);
            next.run(Request::from_parts(parts, Body::from(bytes))).await
        }
        Err(rejection) => {
            warn!(
                path = %parts.uri.path(),
                device_id = header(&parts.headers, HEADER_DEVICE_ID).unwrap_or("-"),
                signature = %redact(header(&parts.headers, HEADER_SIGNATURE)),
                reason = rejection.reason(),
                "device request rejected"
            );
            reject(rejection.reason())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    MissingHeaders,
    BadTimestamp,
    StaleTimestamp,
    BadSignature,
}

impl Rejection {
    fn reason(self) -> &'static str {
        match self {
            Self::MissingHeaders => "missing device authentication headers",
            Self::BadTimestamp => "invalid timestamp",
            Self::StaleTimestamp => "timestamp outside allowed window",
            Self::BadSignature => "invalid signature",
        }
    }
}

fn verify(
    config: &GuardConfig,
    headers: &HeaderMap,
    bytes: &Bytes,
) -> Result<AuthenticatedDevice, Rejection> {
    let (Some(device_id), Some(signature)) = (
        header(headers, HEADER_DEVICE_ID).filter(|v| !v.is_empty()),
        header(headers, HEADER_SIGNATURE).filter(|v| !v.is_empty()),
    ) else {
        return Err(Rejection::MissingHeaders);
    };

    let raw_timestamp = header(headers, HEADER_TIMESTAMP);
    let timestamp = raw_timestamp
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| Rejection::BadTimestamp)
        })
        .transpose()?;
    if let Some(at) = timestamp {
        if (Utc::now() - at).abs() > config.max_skew {
            return Err(Rejection::StaleTimestamp);
        }
    }

    let dev_bypass = !config.production
        && config
            .dev_signature_prefix
            .as_deref()
            .is_some_and(|prefix| !prefix.is_empty() && signature.starts_with(prefix));

    if !dev_bypass {
        let expected = compute_signature(
            device_id,
            &body_value(bytes),
            raw_timestamp,
            &config.shared_secret,
        );
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(Rejection::BadSignature);
        }
    }

    Ok(AuthenticatedDevice {
        device_id: device_id.to_owned(),
        timestamp,
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reject(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized", "message": message })),
    )
        .into_response()
}

/// First few characters only; signatures never reach the logs whole.
fn redact(signature: Option<&str>) -> String {
    match signature {
        None => "-".into(),
        Some(s) => {
            let prefix: String = s.chars().take(6).collect();
            format!("{prefix}…")
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn body_value_shapes() {
        assert_eq!(body_value(b""), json!({}));
        assert_eq!(body_value(b"  \n"), json!({}));
        assert_eq!(body_value(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(body_value(b"door=1"), Value::String("door=1".into()));
    }

    #[test]
    fn signature_is_32_hex_and_depends_on_inputs() {
        let secret = SecretString::from("s3cret");
        let body = json!({"event": "door"});
        let a = compute_signature("lobby", &body, None, &secret);
        let b = compute_signature("lobby", &body, Some("2024-06-15T10:00:00Z"), &secret);
        let c = compute_signature("garage", &body, None, &secret);

        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, compute_signature("lobby", &body, None, &secret));
    }

    #[test]
    fn signed_payload_key_order() {
        let body = json!({});
        let payload = SignedPayload {
            device_id: "d",
            body: &body,
            timestamp: None,
        };
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"deviceId":"d","body":{}}"#
        );
    }

    #[test]
    fn constant_time_eq_matches_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn redaction_keeps_a_prefix() {
        assert_eq!(redact(Some("0123456789abcdef")), "012345…");
        assert_eq!(redact(None), "-");
    }
}
