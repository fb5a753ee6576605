//! Configuration for the gatewatch CLI.
//!
//! A TOML file plus `GATEWATCH_*` environment overrides, layered with
//! figment, describing monitor defaults, the callback guard, the callback
//! server, and the devices themselves. [`DeviceRegistry`] resolves the
//! `[devices.<id>]` tables into `gatewatch_core::DeviceConfig`s and is the
//! CLI's [`DeviceConfigSource`].

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gatewatch_core::{
    CoreError, DeviceConfig, DeviceConfigSource, EventType, GuardConfig, MonitorOptions, Protocol,
    SecretDecryptor, TlsVerification,
};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no secret configured for {owner}")]
    NoCredentials { owner: String },

    #[error("device '{device_id}' is not configured")]
    UnknownDevice { device_id: String, available: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub guard: GuardSettings,

    #[serde(default)]
    pub server: ServerSettings,

    /// Devices keyed by id.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
}

/// Defaults for `watch` subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MonitorSettings {
    /// Canonical type names (`DOOR_OPEN`, …). Empty means all.
    #[serde(default)]
    pub event_types: Vec<String>,

    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    #[serde(default = "default_true")]
    pub use_websocket: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            event_types: Vec::new(),
            polling_interval_ms: default_polling_interval_ms(),
            use_websocket: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_polling_interval_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}

/// Authentication of device callbacks (`gatewatch serve`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GuardSettings {
    /// Shared secret (plaintext; prefer `shared_secret_env`).
    pub shared_secret: Option<String>,

    /// Environment variable holding the shared secret.
    pub shared_secret_env: Option<String>,

    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,

    #[serde(default = "default_max_skew_secs")]
    pub max_skew_secs: u64,

    /// Signatures with this prefix pass when `production` is off.
    pub dev_signature_prefix: Option<String>,

    #[serde(default = "default_true")]
    pub production: bool,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            shared_secret: None,
            shared_secret_env: None,
            public_paths: default_public_paths(),
            max_skew_secs: default_max_skew_secs(),
            dev_signature_prefix: None,
            production: true,
        }
    }
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".into()]
}
fn default_max_skew_secs() -> u64 {
    300
}

/// Callback server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Prometheus exporter address; disabled when unset.
    pub metrics_addr: Option<String>,

    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            metrics_addr: None,
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8080".into()
}
fn default_body_limit() -> usize {
    1024 * 1024
}

/// One `[devices.<id>]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub host: String,

    /// Defaults to 443 for https, 80 for http.
    pub port: Option<u16>,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default = "default_username")]
    pub username: String,

    /// Password (plaintext; prefer `secret_env`).
    pub secret: Option<String>,

    /// Environment variable holding the password.
    pub secret_env: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Accept self-signed certificates. Most controllers ship one.
    #[serde(default = "default_true")]
    pub insecure: bool,

    /// Custom CA, used when `insecure` is off.
    pub ca_cert: Option<PathBuf>,
}

fn default_username() -> String {
    "admin".into()
}
fn default_timeout_secs() -> u64 {
    10
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "gatewatch", "gatewatch").map_or_else(
        || PathBuf::from(".gatewatch.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file, then `GATEWATCH_*` variables.
///
/// Nested keys use a double underscore:
/// `GATEWATCH_DEVICES__LOBBY__HOST=10.0.0.20`.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("GATEWATCH_").split("__"))
}

/// Load from `path`, or from [`config_path`] when `None`.
///
/// A missing file is not an error; defaults and environment still apply.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    Ok(config)
}

fn lookup_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl Config {
    /// Subscription options from `[monitor]`.
    pub fn monitor_options(&self) -> Result<MonitorOptions, ConfigError> {
        let m = &self.monitor;
        Ok(MonitorOptions {
            event_types: parse_event_types(&m.event_types)?,
            polling_interval: Duration::from_millis(m.polling_interval_ms),
            use_websocket: m.use_websocket,
            max_retries: m.max_retries,
            retry_delay: Duration::from_millis(m.retry_delay_ms),
        })
    }

    /// Guard settings with the shared secret resolved.
    pub fn guard_config(&self) -> Result<GuardConfig, ConfigError> {
        self.guard_config_with(lookup_env)
    }

    fn guard_config_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<GuardConfig, ConfigError> {
        let g = &self.guard;
        let shared_secret = resolve_secret(
            g.shared_secret_env.as_deref(),
            g.shared_secret.as_deref(),
            &lookup,
        )
        .ok_or_else(|| ConfigError::NoCredentials {
            owner: "[guard]".into(),
        })?;

        Ok(GuardConfig {
            shared_secret,
            public_paths: g.public_paths.clone(),
            max_skew: chrono::Duration::seconds(i64::try_from(g.max_skew_secs).unwrap_or(i64::MAX)),
            dev_signature_prefix: g.dev_signature_prefix.clone(),
            production: g.production,
            body_limit: self.server.body_limit_bytes,
        })
    }

    /// Resolve every `[devices.*]` table.
    pub fn device_registry(&self) -> Result<DeviceRegistry, ConfigError> {
        self.device_registry_with(lookup_env)
    }

    fn device_registry_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<DeviceRegistry, ConfigError> {
        let devices = self
            .devices
            .iter()
            .map(|(id, entry)| Ok((id.clone(), entry.resolve(id, &lookup)?)))
            .collect::<Result<_, ConfigError>>()?;
        Ok(DeviceRegistry { devices })
    }

    /// A copy with every inline secret masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |secret: &mut Option<String>| {
            if secret.is_some() {
                *secret = Some("********".into());
            }
        };
        mask(&mut copy.guard.shared_secret);
        for entry in copy.devices.values_mut() {
            mask(&mut entry.secret);
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse canonical type names, case-insensitively. Empty means all.
pub fn parse_event_types(names: &[String]) -> Result<Option<HashSet<EventType>>, ConfigError> {
    if names.is_empty() {
        return Ok(None);
    }
    names
        .iter()
        .map(|name| {
            EventType::from_str(name.trim()).map_err(|_| ConfigError::Validation {
                field: "event_types".into(),
                reason: format!("unknown event type '{name}'"),
            })
        })
        .collect::<Result<HashSet<_>, _>>()
        .map(Some)
}

/// Env var first, then the inline value.
fn resolve_secret(
    env_name: Option<&str>,
    inline: Option<&str>,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Option<SecretString> {
    env_name
        .and_then(lookup)
        .or_else(|| inline.map(str::to_owned))
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}

impl DeviceEntry {
    fn resolve(
        &self,
        device_id: &str,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> Result<DeviceConfig, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: format!("devices.{device_id}.host"),
                reason: "must not be empty".into(),
            });
        }
        let secret = resolve_secret(self.secret_env.as_deref(), self.secret.as_deref(), lookup)
            .ok_or_else(|| ConfigError::NoCredentials {
                owner: format!("device '{device_id}'"),
            })?;

        let tls = if self.insecure {
            TlsVerification::DangerAcceptInvalid
        } else if let Some(ref ca_path) = self.ca_cert {
            TlsVerification::CustomCa(ca_path.clone())
        } else {
            TlsVerification::SystemDefaults
        };

        Ok(DeviceConfig {
            device_id: device_id.to_owned(),
            host: self.host.clone(),
            port: self.port.unwrap_or(match self.protocol {
                Protocol::Http => 80,
                Protocol::Https => 443,
            }),
            protocol: self.protocol,
            username: self.username.clone(),
            encrypted_secret: secret,
            timeout: Duration::from_secs(self.timeout_secs),
            tls,
        })
    }
}

// ── Device registry ─────────────────────────────────────────────────

/// Resolved device configurations, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceConfig>,
}

impl DeviceRegistry {
    pub fn get(&self, device_id: &str) -> Result<&DeviceConfig, ConfigError> {
        self.devices
            .get(device_id)
            .ok_or_else(|| ConfigError::UnknownDevice {
                device_id: device_id.to_owned(),
                available: self.ids().join(", "),
            })
    }

    /// Configured ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceConfigSource for DeviceRegistry {
    fn device_config(&self, device_id: &str) -> Option<DeviceConfig> {
        self.devices.get(device_id).cloned()
    }
}

/// Secrets in the config file are stored in the clear.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextSecrets;

impl SecretDecryptor for PlaintextSecrets {
    fn decrypt(&self, encrypted: &SecretString) -> Result<SecretString, CoreError> {
        Ok(SecretString::from(encrypted.expose_secret().to_owned()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
[monitor]
event_types = ["door_open", "ACCESS_DENIED"]
polling_interval_ms = 1500
use_websocket = false

[guard]
shared_secret_env = "LOBBY_CALLBACK_SECRET"
dev_signature_prefix = "dev-"
production = false

[server]
listen = "0.0.0.0:9090"

[devices.lobby]
host = "10.0.0.20"
secret = "Passw0rd!"

[devices.garage]
host = "10.0.0.21"
port = 8080
protocol = "http"
username = "operator"
secret_env = "GARAGE_SECRET"
insecure = false
timeout_secs = 3
"#;

    fn load(contents: &str) -> Config {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(file.path()))
            .extract()
            .unwrap()
    }

    fn env(name: &str) -> Option<String> {
        match name {
            "GARAGE_SECRET" => Some("from-env".into()),
            "LOBBY_CALLBACK_SECRET" => Some("callback".into()),
            _ => None,
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.monitor, MonitorSettings::default());
        assert!(config.devices.is_empty());

        let options = config.monitor_options().unwrap();
        assert_eq!(options, MonitorOptions::default());
    }

    #[test]
    fn monitor_section_maps_to_options() {
        let options = load(SAMPLE).monitor_options().unwrap();
        assert!(!options.use_websocket);
        assert_eq!(options.polling_interval, Duration::from_millis(1500));
        assert_eq!(
            options.event_types,
            Some(HashSet::from([EventType::DoorOpen, EventType::AccessDenied]))
        );
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = parse_event_types(&["DOOR_AJAR".into()]).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "event_types"));
    }

    #[test]
    fn devices_resolve_with_defaults_and_env() {
        let registry = load(SAMPLE).device_registry_with(env).unwrap();
        assert_eq!(registry.ids(), ["garage", "lobby"]);

        let lobby = registry.get("lobby").unwrap();
        assert_eq!(lobby.port, 443);
        assert_eq!(lobby.protocol, Protocol::Https);
        assert_eq!(lobby.username, "admin");
        assert_eq!(lobby.timeout, Duration::from_secs(10));
        assert_eq!(lobby.tls, TlsVerification::DangerAcceptInvalid);
        assert_eq!(lobby.encrypted_secret.expose_secret(), "Passw0rd!");

        let garage = registry.device_config("garage").unwrap();
        assert_eq!(garage.port, 8080);
        assert_eq!(garage.protocol, Protocol::Http);
        assert_eq!(garage.username, "operator");
        assert_eq!(garage.tls, TlsVerification::SystemDefaults);
        assert_eq!(garage.encrypted_secret.expose_secret(), "from-env");

        assert!(matches!(
            registry.get("attic"),
            Err(ConfigError::UnknownDevice { ref available, .. }) if available == "garage, lobby"
        ));
    }

    #[test]
    fn device_without_secret_fails() {
        let config = load("[devices.lobby]\nhost = \"10.0.0.20\"\n");
        assert!(matches!(
            config.device_registry_with(|_| None),
            Err(ConfigError::NoCredentials { .. })
        ));
    }

    #[test]
    fn guard_section_resolves_secret() {
        let guard = load(SAMPLE).guard_config_with(env).unwrap();
        assert_eq!(guard.shared_secret.expose_secret(), "callback");
        assert_eq!(guard.max_skew, chrono::Duration::minutes(5));
        assert_eq!(guard.public_paths, ["/health"]);
        assert_eq!(guard.dev_signature_prefix.as_deref(), Some("dev-"));
        assert!(!guard.production);

        assert!(load("").guard_config_with(|_| None).is_err());
    }

    #[test]
    fn redacted_masks_inline_secrets() {
        let rendered = load(SAMPLE).redacted().to_toml().unwrap();
        assert!(!rendered.contains("Passw0rd!"));
        assert!(rendered.contains("********"));
        assert!(rendered.contains("GARAGE_SECRET"));
    }

    #[test]
    fn plaintext_secrets_pass_through() {
        let out = PlaintextSecrets
            .decrypt(&SecretString::from("Passw0rd!"))
            .unwrap();
        assert_eq!(out.expose_secret(), "Passw0rd!");
    }
}
