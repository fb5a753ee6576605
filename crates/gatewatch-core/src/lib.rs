//! Device integration layer between `gatewatch-api` and its consumers
//! (the CLI, a dashboard backend).
//!
//! - **[`DeviceSessionManager`]**: authenticates devices through the
//!   ISAPI Digest/Basic handshake and tracks one local session per
//!   device, with validation, refresh, logout, and health probes.
//!
//! - **[`EventMonitor`]**: one live event subscription per device, over
//!   the WebSocket alert stream or HTTP polling. Vendor payloads are
//!   normalized into [`DeviceEvent`]s and delivered on an
//!   [`EventStream`]; per-subscription [`MonitoringStats`] track health.
//!
//! - **[`guard`]**: axum middleware that authenticates inbound device
//!   callbacks by signed headers.
//!
//! Collaborators are injected as trait objects: [`DeviceConfigSource`]
//! resolves device configuration by id and [`SecretDecryptor`] turns the
//! stored secret into a password.

pub mod config;
pub mod error;
pub mod guard;
pub mod model;
pub mod monitor;
pub mod session;
mod telemetry;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{
    DeviceConfig, DeviceConfigSource, MonitorOptions, Protocol, SecretDecryptor, TlsVerification,
};
pub use error::CoreError;
pub use guard::{AuthenticatedDevice, GuardConfig, require_device_auth};
pub use model::{
    AuthOutcome, DeviceEvent, DeviceHealth, DeviceSession, EventNormalizer, EventType,
};
pub use monitor::{ConnectionStatus, EventMonitor, EventStream, MonitoringStats, TransportKind};
pub use session::DeviceSessionManager;

// Vendor-surface types that appear in this crate's public API.
pub use gatewatch_api::DeviceInfo;
