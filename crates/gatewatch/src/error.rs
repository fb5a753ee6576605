//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use gatewatch_config::ConfigError;
use gatewatch_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach device '{device_id}'")]
    #[diagnostic(
        code(gatewatch::connection_failed),
        help(
            "Check that the device is powered and reachable, and that host, port,\n\
             and protocol in [devices.{device_id}] are right."
        )
    )]
    ConnectionFailed {
        device_id: String,
        #[source]
        source: CoreError,
    },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication with device '{device_id}' failed")]
    #[diagnostic(
        code(gatewatch::auth_failed),
        help(
            "Verify username and secret (or secret_env) in [devices.{device_id}].\n\
             Devices lock accounts after repeated failures; check the device log."
        )
    )]
    AuthFailed {
        device_id: String,
        #[source]
        source: CoreError,
    },

    #[error("No secret configured for {owner}")]
    #[diagnostic(
        code(gatewatch::no_credentials),
        help("Set `secret_env` to an environment variable holding it, or `secret` inline.")
    )]
    NoCredentials { owner: String },

    // ── Lookup ───────────────────────────────────────────────────────
    #[error("Device '{device_id}' is not configured")]
    #[diagnostic(
        code(gatewatch::unknown_device),
        help("Configured devices: {available}\nRun: gatewatch config show")
    )]
    UnknownDevice { device_id: String, available: String },

    // ── Device ───────────────────────────────────────────────────────
    #[error("Device '{device_id}' returned an error")]
    #[diagnostic(code(gatewatch::device_error))]
    Device {
        device_id: String,
        #[source]
        source: CoreError,
    },

    // ── Validation / configuration ───────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(gatewatch::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(code(gatewatch::config))]
    Config(Box<figment::Error>),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::UnknownDevice { .. } => exit_code::NOT_FOUND,
            Self::Validation { .. } | Self::Config(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }

    /// Attach a device id to a core failure, classified by its root cause.
    pub fn from_core(device_id: &str, err: CoreError) -> Self {
        let device_id = device_id.to_owned();
        if err.is_auth() {
            return Self::AuthFailed {
                device_id,
                source: err,
            };
        }
        match err.root() {
            CoreError::ConnectionFailed { .. } => Self::ConnectionFailed {
                device_id,
                source: err,
            },
            CoreError::ConfigNotFound { .. } => Self::UnknownDevice {
                device_id,
                available: String::new(),
            },
            CoreError::Config { message } => Self::Validation {
                field: format!("devices.{device_id}"),
                reason: message.clone(),
            },
            _ => Self::Device {
                device_id,
                source: err,
            },
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::NoCredentials { owner } => Self::NoCredentials { owner },
            ConfigError::UnknownDevice {
                device_id,
                available,
            } => Self::UnknownDevice {
                device_id,
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available
                },
            },
            ConfigError::Serialization(e) => Self::Validation {
                field: "config".into(),
                reason: e.to_string(),
            },
            ConfigError::Figment(e) => Self::Config(e),
        }
    }
}
