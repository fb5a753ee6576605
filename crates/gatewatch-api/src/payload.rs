// ── Vendor payload parsing ──
//
// Devices report events as flat-tag XML or as JSON in several envelopes.
// `VendorPayload` is the tagged union over those shapes; `RawVendorEvent`
// is one event pulled out of any of them, still in vendor vocabulary.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Error;

const TYPE_KEYS: &[&str] = &["eventType"];
const TIME_KEYS: &[&str] = &["dateTime", "time", "timestamp"];
const DEVICE_KEYS: &[&str] = &["deviceID", "deviceId"];
const USER_KEYS: &[&str] = &["employeeNoString", "employeeNo", "userId", "userID"];
const CARD_KEYS: &[&str] = &["cardNo", "cardId", "cardID"];
const BIOMETRIC_KEYS: &[&str] = &["fingerPrintID", "fingerprintId", "faceID", "faceId", "biometricId"];
const DOOR_KEYS: &[&str] = &["doorNo", "doorID", "doorId"];

/// Nested objects ISAPI uses to carry the access-control details of an alert.
const DETAIL_OBJECTS: &[&str] = &["AccessControllerEvent", "AcsEvent"];

// ── RawVendorEvent ───────────────────────────────────────────────────

/// One vendor event, before canonical mapping.
///
/// Every field the device sent that is not lifted into a named field
/// lands in `extra`, so nothing is silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVendorEvent {
    pub event_type: String,
    pub date_time: Option<String>,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    pub card_no: Option<String>,
    pub biometric_id: Option<String>,
    pub door_no: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl RawVendorEvent {
    /// Build from one JSON alert object.
    pub fn from_json(value: Value) -> Result<Self, Error> {
        let Value::Object(mut fields) = value else {
            return Err(Error::parse("event is not a JSON object"));
        };

        let details: Vec<Map<String, Value>> = DETAIL_OBJECTS
            .iter()
            .filter_map(|name| match fields.get(*name) {
                Some(Value::Object(obj)) => Some(obj.clone()),
                _ => None,
            })
            .collect();

        let mut lift = |keys: &[&str]| -> Option<String> {
            if let Some(found) = take_scalar(&mut fields, keys) {
                return Some(found);
            }
            details.iter().find_map(|d| peek_scalar(d, keys))
        };

        let event_type = lift(TYPE_KEYS).ok_or_else(|| Error::parse("event has no eventType"))?;
        let date_time = lift(TIME_KEYS);
        let device_id = lift(DEVICE_KEYS);
        let user_id = lift(USER_KEYS);
        let card_no = lift(CARD_KEYS);
        let biometric_id = lift(BIOMETRIC_KEYS);
        let door_no = lift(DOOR_KEYS);

        Ok(Self {
            event_type,
            date_time,
            device_id,
            user_id,
            card_no,
            biometric_id,
            door_no,
            extra: fields,
        })
    }

    /// Build from the leaf tags of a flat XML document.
    pub fn from_xml_leaves(leaves: Vec<(String, String)>) -> Result<Self, Error> {
        let mut fields = Map::new();
        for (tag, text) in leaves {
            fields.entry(tag).or_insert(Value::String(text));
        }
        Self::from_json(Value::Object(fields))
    }
}

// ── VendorPayload ────────────────────────────────────────────────────

/// Every payload shape a device is known to send, plus a residual variant.
#[derive(Debug, Clone, PartialEq)]
pub enum VendorPayload {
    /// `<EventNotificationAlert><eventType>…</eventType>…` as leaf tags.
    FlatXml(Vec<(String, String)>),
    /// `[ {...}, {...} ]`
    JsonArray(Vec<Value>),
    /// `{ "events": [...] }` or `{ "EventNotificationAlert": {...} | [...] }`
    JsonWrapped(Vec<Value>),
    /// A single alert object, as pushed over the alert stream.
    JsonObject(Value),
    /// Anything else. Kept so new firmware shapes surface in logs.
    Unparsed { body: String, reason: String },
}

impl VendorPayload {
    /// Classify a payload by its leading character and structure. Never fails.
    pub fn parse(body: &str) -> Self {
        let trimmed = body.trim_start_matches('\u{feff}').trim();
        if trimmed.is_empty() {
            return Self::JsonArray(Vec::new());
        }

        if trimmed.starts_with('<') {
            return match xml_leaves(trimmed) {
                Ok(leaves) => Self::FlatXml(leaves),
                Err(e) => Self::unparsed(trimmed, e.to_string()),
            };
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => Self::JsonArray(items),
            Ok(Value::Object(mut obj)) => {
                if matches!(obj.get("events"), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = obj.remove("events") {
                        return Self::JsonWrapped(items);
                    }
                }
                match obj.remove("EventNotificationAlert") {
                    Some(Value::Array(items)) => Self::JsonWrapped(items),
                    Some(single @ Value::Object(_)) => Self::JsonWrapped(vec![single]),
                    Some(other) => {
                        obj.insert("EventNotificationAlert".into(), other);
                        Self::JsonObject(Value::Object(obj))
                    }
                    None => Self::JsonObject(Value::Object(obj)),
                }
            }
            Ok(other) => Self::unparsed(trimmed, format!("unexpected JSON value: {other}")),
            Err(e) => Self::unparsed(trimmed, e.to_string()),
        }
    }

    /// Extract the events, one result per vendor event.
    ///
    /// A malformed element does not affect its siblings.
    pub fn into_events(self) -> Vec<Result<RawVendorEvent, Error>> {
        match self {
            Self::FlatXml(leaves) => vec![RawVendorEvent::from_xml_leaves(leaves)],
            Self::JsonArray(items) | Self::JsonWrapped(items) => {
                items.into_iter().map(RawVendorEvent::from_json).collect()
            }
            Self::JsonObject(value) => vec![RawVendorEvent::from_json(value)],
            Self::Unparsed { reason, .. } => vec![Err(Error::Parse { message: reason })],
        }
    }

    fn unparsed(body: &str, reason: String) -> Self {
        Self::Unparsed {
            body: body.to_owned(),
            reason,
        }
    }
}

// ── DeviceInfo ───────────────────────────────────────────────────────

/// Identity fields reported by `/ISAPI/System/capabilities` or `deviceInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
}

impl DeviceInfo {
    /// Extract identity fields from an XML or JSON body (detected by first char).
    pub fn from_body(body: &str) -> Self {
        let trimmed = body.trim_start_matches('\u{feff}').trim();
        if trimmed.starts_with('<') {
            let leaves = xml_leaves(trimmed).unwrap_or_else(|e| {
                debug!(error = %e, "device info body is not readable XML");
                Vec::new()
            });
            let find = |key: &str| {
                leaves
                    .iter()
                    .find(|(tag, _)| tag == key)
                    .map(|(_, text)| text.clone())
            };
            Self {
                model: find("model"),
                serial_number: find("serialNumber"),
                firmware_version: find("firmwareVersion"),
            }
        } else {
            let value: Value = serde_json::from_str(trimmed).unwrap_or_else(|e| {
                debug!(error = %e, "device info body is not readable JSON");
                Value::Null
            });
            Self {
                model: find_json(&value, "model"),
                serial_number: find_json(&value, "serialNumber"),
                firmware_version: find_json(&value, "firmwareVersion"),
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Collect `(tag, text)` for every element that directly holds text.
///
/// Namespace prefixes are dropped; nesting is flattened in document order.
pub(crate) fn xml_leaves(xml: &str) -> Result<Vec<(String, String)>, Error> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut open: Vec<String> = Vec::new();
    let mut text: Option<String> = None;
    let mut leaves = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                open.push(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                text = None;
            }
            Ok(Event::Text(t)) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| Error::parse(format!("invalid XML text: {e}")))?;
                text = Some(unescaped.into_owned());
            }
            Ok(Event::CData(cdata)) => {
                text = Some(String::from_utf8_lossy(&cdata.into_inner()).into_owned());
            }
            Ok(Event::End(_)) => {
                let tag = open.pop();
                if let (Some(tag), Some(value)) = (tag, text.take()) {
                    leaves.push((tag, value));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::parse(format!(
                    "invalid XML at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            Ok(_) => {}
        }
    }

    if !open.is_empty() {
        return Err(Error::parse(format!("unclosed XML element <{}>", open.join("><"))));
    }
    if leaves.is_empty() {
        return Err(Error::parse("XML document has no text elements"));
    }
    Ok(leaves)
}

fn scalar_to_string(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) if !s.is_empty() => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        _ => None,
    }
}

fn take_scalar(fields: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    let key = keys
        .iter()
        .find(|k| fields.get(**k).and_then(scalar_to_string).is_some())?;
    fields
        .remove(*key)
        .as_ref()
        .and_then(scalar_to_string)
        .map(Cow::into_owned)
}

fn peek_scalar(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| fields.get(*k).and_then(scalar_to_string))
        .map(Cow::into_owned)
}

fn find_json(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(obj) => obj
            .get(key)
            .and_then(scalar_to_string)
            .map(Cow::into_owned)
            .or_else(|| obj.values().find_map(|v| find_json(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find_json(v, key)),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn unreadable_device_info_is_empty() {
        assert_eq!(DeviceInfo::from_body("<DeviceCap><model>X</model>"), DeviceInfo::default());
        assert_eq!(DeviceInfo::from_body("{\"model\": "), DeviceInfo::default());
        assert_eq!(DeviceInfo::from_body(""), DeviceInfo::default());
    }

    #[test]
    fn flat_xml_alert_is_parsed() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <EventNotificationAlert version="2.0" xmlns="http://www.isapi.org/ver20/XMLSchema">
                <ipAddress>10.0.0.5</ipAddress>
                <deviceID>dev-7</deviceID>
                <dateTime>2024-06-15T10:30:00+08:00</dateTime>
                <eventType>doorOpen</eventType>
                <AccessControllerEvent>
                    <doorNo>2</doorNo>
                    <cardNo>12345678</cardNo>
                </AccessControllerEvent>
            </EventNotificationAlert>"#;

        let payload = VendorPayload::parse(xml);
        assert!(matches!(payload, VendorPayload::FlatXml(_)));

        let events: Vec<_> = payload.into_events();
        let event = events.into_iter().next().unwrap().unwrap();
        assert_eq!(event.event_type, "doorOpen");
        assert_eq!(event.device_id.as_deref(), Some("dev-7"));
        assert_eq!(event.card_no.as_deref(), Some("12345678"));
        assert_eq!(event.door_no.as_deref(), Some("2"));
        assert_eq!(event.extra["ipAddress"], "10.0.0.5");
    }

    #[test]
    fn json_alert_lifts_nested_access_fields() {
        let value = json!({
            "ipAddress": "10.0.0.5",
            "dateTime": "2024-06-15T10:30:00+08:00",
            "eventType": "AccessControllerEvent",
            "AccessControllerEvent": {
                "majorEventType": 5,
                "subEventType": 75,
                "employeeNoString": "E-100",
                "fingerPrintID": 3,
                "doorNo": 1
            }
        });

        let event = RawVendorEvent::from_json(value).unwrap();
        assert_eq!(event.event_type, "AccessControllerEvent");
        assert_eq!(event.user_id.as_deref(), Some("E-100"));
        assert_eq!(event.biometric_id.as_deref(), Some("3"));
        assert_eq!(event.door_no.as_deref(), Some("1"));
        // Nested object is passed through verbatim.
        assert_eq!(event.extra["AccessControllerEvent"]["subEventType"], 75);
    }

    #[test]
    fn json_shapes_are_classified() {
        assert!(matches!(
            VendorPayload::parse(r#"[{"eventType":"doorOpen"}]"#),
            VendorPayload::JsonArray(v) if v.len() == 1
        ));
        assert!(matches!(
            VendorPayload::parse(r#"{"events":[{"eventType":"a"},{"eventType":"b"}]}"#),
            VendorPayload::JsonWrapped(v) if v.len() == 2
        ));
        assert!(matches!(
            VendorPayload::parse(r#"{"EventNotificationAlert":{"eventType":"a"}}"#),
            VendorPayload::JsonWrapped(v) if v.len() == 1
        ));
        assert!(matches!(
            VendorPayload::parse(r#"{"EventNotificationAlert":[{"eventType":"a"},{"eventType":"b"}]}"#),
            VendorPayload::JsonWrapped(v) if v.len() == 2
        ));
        assert!(matches!(
            VendorPayload::parse(r#"{"eventType":"doorClose"}"#),
            VendorPayload::JsonObject(_)
        ));
    }

    #[test]
    fn garbage_is_unparsed_not_an_error() {
        let payload = VendorPayload::parse("not a payload");
        assert!(matches!(payload, VendorPayload::Unparsed { .. }));
        let events = payload.into_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }

    #[test]
    fn one_bad_element_does_not_poison_siblings() {
        let events = VendorPayload::parse(r#"[{"eventType":"doorOpen"}, 42, {"noType":true}]"#)
            .into_events();
        assert_eq!(events.len(), 3);
        assert!(events[0].is_ok());
        assert!(events[1].is_err());
        assert!(events[2].is_err());
    }

    #[test]
    fn device_info_from_xml_and_json() {
        let xml = "<DeviceInfo><model>DS-K1T671</model><serialNumber>SN1</serialNumber>\
                   <firmwareVersion>V3.2.0</firmwareVersion></DeviceInfo>";
        let info = DeviceInfo::from_body(xml);
        assert_eq!(info.model.as_deref(), Some("DS-K1T671"));
        assert_eq!(info.serial_number.as_deref(), Some("SN1"));
        assert_eq!(info.firmware_version.as_deref(), Some("V3.2.0"));

        let json = r#"{"DeviceInfo":{"model":"DS-K1T341","serialNumber":"SN2","firmwareVersion":"V1.0"}}"#;
        let info = DeviceInfo::from_body(json);
        assert_eq!(info.model.as_deref(), Some("DS-K1T341"));
        assert_eq!(info.serial_number.as_deref(), Some("SN2"));
    }

    #[test]
    fn unclosed_xml_is_rejected() {
        assert!(xml_leaves("<a><b>1</b>").is_err());
    }
}
