// ── Runtime device configuration ──
//
// These types describe *how* to reach a device and how to monitor it.
// They carry credential data and tuning, but never touch disk. Callers
// (the CLI, a dashboard backend) build them and hand them in, or expose
// them through `DeviceConfigSource`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use gatewatch_api::{TlsMode, TransportConfig};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;
use crate::model::EventType;

/// Scheme the device's ISAPI surface is served on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    #[default]
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Https => "https",
        })
    }
}

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification. Access controllers ship self-signed certificates.
    #[default]
    DangerAcceptInvalid,
}

/// Connection parameters for one device. Immutable once built.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub username: String,
    /// Opaque to core; turned into a password by a [`SecretDecryptor`].
    pub encrypted_secret: SecretString,
    /// Per-request timeout.
    pub timeout: Duration,
    pub tls: TlsVerification,
}

impl DeviceConfig {
    /// `http(s)://host:port/`
    pub fn base_url(&self) -> Result<Url, CoreError> {
        let raw = format!("{}://{}:{}/", self.protocol, self.host, self.port);
        Url::parse(&raw).map_err(|e| CoreError::Config {
            message: format!("invalid address for device '{}': {e}", self.device_id),
        })
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            tls: match &self.tls {
                TlsVerification::SystemDefaults => TlsMode::System,
                TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
                TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
            },
            timeout: self.timeout,
        }
    }
}

/// Per-subscription monitoring options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Canonical types to deliver. `None` delivers everything.
    pub event_types: Option<HashSet<EventType>>,
    pub polling_interval: Duration,
    /// WebSocket push when `true`, HTTP polling otherwise.
    pub use_websocket: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            event_types: None,
            polling_interval: Duration::from_millis(5000),
            use_websocket: true,
            max_retries: 5,
            retry_delay: Duration::from_millis(2000),
        }
    }
}

impl MonitorOptions {
    /// Vendor type names for the polling query filter. Empty means all.
    pub fn vendor_event_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .event_types
            .iter()
            .flatten()
            .map(|t| t.vendor_name().to_owned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

// ── Collaborator seams ───────────────────────────────────────────────

/// Turns a stored secret into the device password.
///
/// Any `Fn(&str) -> Result<SecretString, CoreError>` closure qualifies.
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, encrypted: &SecretString) -> Result<SecretString, CoreError>;
}

impl<F> SecretDecryptor for F
where
    F: Fn(&str) -> Result<SecretString, CoreError> + Send + Sync,
{
    fn decrypt(&self, encrypted: &SecretString) -> Result<SecretString, CoreError> {
        self(encrypted.expose_secret())
    }
}

/// Looks up a device's configuration by id.
pub trait DeviceConfigSource: Send + Sync {
    fn device_config(&self, device_id: &str) -> Option<DeviceConfig>;
}

impl DeviceConfigSource for HashMap<String, DeviceConfig> {
    fn device_config(&self, device_id: &str) -> Option<DeviceConfig> {
        self.get(device_id).cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn device(protocol: Protocol) -> DeviceConfig {
        DeviceConfig {
            device_id: "lobby".into(),
            host: "10.0.0.20".into(),
            port: 8443,
            protocol,
            username: "admin".into(),
            encrypted_secret: SecretString::from("pw"),
            timeout: Duration::from_secs(5),
            tls: TlsVerification::default(),
        }
    }

    #[test]
    fn base_url_uses_protocol_and_port() {
        assert_eq!(
            device(Protocol::Https).base_url().unwrap().as_str(),
            "https://10.0.0.20:8443/"
        );
        assert_eq!(
            device(Protocol::Http).base_url().unwrap().as_str(),
            "http://10.0.0.20:8443/"
        );
    }

    #[test]
    fn default_options() {
        let options = MonitorOptions::default();
        assert_eq!(options.event_types, None);
        assert_eq!(options.polling_interval, Duration::from_millis(5000));
        assert!(options.use_websocket);
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.retry_delay, Duration::from_millis(2000));
        assert!(options.vendor_event_types().is_empty());
    }

    #[test]
    fn closures_decrypt() {
        let decryptor = |raw: &str| {
            Ok::<_, CoreError>(SecretString::from(raw.chars().rev().collect::<String>()))
        };
        let out = decryptor.decrypt(&SecretString::from("olleh")).unwrap();
        assert_eq!(out.expose_secret(), "hello");
    }
}
