// ── Canonical access events ──
//
// Vendor events arrive with free-form type strings and device-local
// timestamps. Everything downstream of the transports sees only
// `DeviceEvent`, built here.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use gatewatch_api::RawVendorEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::CoreError;

/// Bounded set of event kinds the dashboard understands.
///
/// `NetworkError` doubles as the bucket for vendor types with no mapping.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum EventType {
    AccessGranted,
    AccessDenied,
    DoorOpen,
    DoorClose,
    Alarm,
    Tamper,
    CardScan,
    FingerprintScan,
    FaceRecognition,
    NetworkError,
}

impl EventType {
    /// Map a vendor type string. Case, `_` and `-` are ignored.
    ///
    /// Never fails: unknown types land in [`EventType::NetworkError`].
    pub fn from_vendor(raw: &str) -> Self {
        let key: String = raw
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();

        match key.as_str() {
            "accesscontrollerevent" | "acsevent" | "accessgranted" | "accesspass" => {
                Self::AccessGranted
            }
            "accessdenied" | "accessrefused" | "invalidcard" => Self::AccessDenied,
            "dooropen" | "dooropened" | "doorunlock" => Self::DoorOpen,
            "doorclose" | "doorclosed" | "doorlock" => Self::DoorClose,
            "alarm" | "alarmin" | "intrusion" | "dooropentimeout" => Self::Alarm,
            "tamper" | "tamperalarm" | "devicetamper" => Self::Tamper,
            "cardscan" | "card" | "cardswipe" => Self::CardScan,
            "fingerprint" | "fingerprintscan" | "fingerprintcompare" => Self::FingerprintScan,
            "face" | "facerecognition" | "facecapture" | "facecompare" => Self::FaceRecognition,
            _ => Self::NetworkError,
        }
    }

    /// The vendor type string used when asking a device for this kind.
    pub fn vendor_name(self) -> &'static str {
        match self {
            Self::AccessGranted => "AccessControllerEvent",
            Self::AccessDenied => "accessDenied",
            Self::DoorOpen => "doorOpen",
            Self::DoorClose => "doorClose",
            Self::Alarm => "alarm",
            Self::Tamper => "tamper",
            Self::CardScan => "cardScan",
            Self::FingerprintScan => "fingerPrint",
            Self::FaceRecognition => "faceRecognition",
            Self::NetworkError => "networkError",
        }
    }
}

/// A normalized access event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub device_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub biometric_id: Option<String>,
    #[serde(default)]
    pub extras: Map<String, Value>,
}

// ── EventNormalizer ──────────────────────────────────────────────────

/// Builds [`DeviceEvent`]s for one device, applying a type filter.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    device_id: String,
    filter: Option<HashSet<EventType>>,
}

impl EventNormalizer {
    /// `filter = None` accepts every type.
    pub fn new(device_id: impl Into<String>, filter: Option<HashSet<EventType>>) -> Self {
        Self {
            device_id: device_id.into(),
            filter,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn accepts(&self, event_type: EventType) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&event_type))
    }

    /// Normalize one vendor event. `Ok(None)` means filtered out.
    ///
    /// `received_at` stands in for a missing timestamp; a present but
    /// unreadable one is an error.
    pub fn normalize(
        &self,
        raw: RawVendorEvent,
        received_at: DateTime<Utc>,
    ) -> Result<Option<DeviceEvent>, CoreError> {
        let event_type = EventType::from_vendor(&raw.event_type);
        if !self.accepts(event_type) {
            return Ok(None);
        }

        let timestamp = match raw.date_time.as_deref() {
            Some(text) => parse_timestamp(text)?,
            None => received_at,
        };

        let mut extras = raw.extra;
        extras.insert("vendorEventType".into(), Value::String(raw.event_type));
        if let Some(vendor_id) = raw.device_id.filter(|id| *id != self.device_id) {
            extras.insert("vendorDeviceId".into(), Value::String(vendor_id));
        }
        if let Some(door) = raw.door_no {
            extras.insert("doorNo".into(), Value::String(door));
        }

        Ok(Some(DeviceEvent {
            device_id: self.device_id.clone(),
            event_type,
            timestamp,
            user_id: raw.user_id,
            card_id: raw.card_no,
            biometric_id: raw.biometric_id,
            extras,
        }))
    }
}

/// RFC 3339 first, then the offset-less forms some firmware emits (read as UTC).
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, CoreError> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| CoreError::Parse {
            message: format!("unreadable timestamp '{text}'"),
        })
}
