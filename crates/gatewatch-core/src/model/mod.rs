// Domain model: canonical events and device sessions.

pub mod event;
pub mod session;

pub use event::{DeviceEvent, EventNormalizer, EventType, parse_timestamp};
pub use session::{AuthOutcome, DeviceHealth, DeviceSession};
