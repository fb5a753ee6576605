use std::time::Duration;

use chrono::{DateTime, Utc};
use gatewatch_api::DeviceInfo;
use serde::Serialize;

/// Local session for one authenticated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    pub device_id: String,
    /// Session cookie handed out by the device, if any.
    pub auth_token: Option<String>,
    /// Locally generated; never derived from `auth_token`.
    pub session_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub device_info: DeviceInfo,
}

impl DeviceSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }
}

/// What a successful `authenticate` hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOutcome {
    pub device_id: String,
    pub session_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub device_info: DeviceInfo,
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHealth {
    pub device_id: String,
    pub connected: bool,
    pub auth_valid: bool,
    #[serde(
        rename = "latencyMs",
        serialize_with = "serialize_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub latency: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceHealth {
    /// No usable session, so nothing was sent.
    pub fn offline(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_owned(),
            connected: false,
            auth_valid: false,
            latency: None,
            error: None,
        }
    }
}

#[allow(clippy::ref_option)]
fn serialize_millis<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        None => serializer.serialize_none(),
    }
}
