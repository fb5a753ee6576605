// gatewatch-api: Async Rust client for ISAPI access-control devices

pub mod client;
pub mod digest;
pub mod error;
pub mod payload;
pub mod transport;
pub mod websocket;

pub use client::{AuthScheme, Capabilities, Credentials, IsapiClient};
pub use digest::{AuthChallenge, DigestChallenge, DigestSession};
pub use error::Error;
pub use payload::{DeviceInfo, RawVendorEvent, VendorPayload};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{AlertItem, AlertStream, AlertStreamRequest, LinkState, ReconnectConfig};
