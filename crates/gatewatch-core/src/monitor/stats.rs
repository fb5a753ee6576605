use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use strum::Display;
use uuid::Uuid;

use crate::model::EventType;
use crate::telemetry;

/// Link status as seen by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    /// Retry budget exhausted. Terminal for the subscription.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransportKind {
    #[strum(serialize = "websocket")]
    #[serde(rename = "websocket")]
    WebSocket,
    Polling,
}

/// Per-subscription counters. Kept after unsubscribe until the next
/// subscribe or `cleanup()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStats {
    pub device_id: String,
    pub subscription_id: Uuid,
    pub transport: TransportKind,
    pub started_at: DateTime<Utc>,
    pub total_events: u64,
    pub events_by_type: BTreeMap<EventType, u64>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub connection_status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub parse_errors: u64,
}

impl MonitoringStats {
    pub(crate) fn new(device_id: &str, subscription_id: Uuid, transport: TransportKind) -> Self {
        Self {
            device_id: device_id.to_owned(),
            subscription_id,
            transport,
            started_at: Utc::now(),
            total_events: 0,
            events_by_type: BTreeMap::new(),
            last_event_at: None,
            connection_status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            parse_errors: 0,
        }
    }
}

pub(crate) type StatsTable = Arc<DashMap<String, MonitoringStats>>;

/// Write handle a transport uses for its own stats row.
///
/// Updates land only while the row still belongs to this subscription,
/// so a superseded transport cannot overwrite its successor's numbers.
#[derive(Clone)]
pub(crate) struct StatsRecorder {
    device_id: String,
    subscription_id: Uuid,
    table: StatsTable,
}

impl StatsRecorder {
    pub(crate) fn new(device_id: &str, subscription_id: Uuid, table: StatsTable) -> Self {
        Self {
            device_id: device_id.to_owned(),
            subscription_id,
            table,
        }
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    fn update(&self, f: impl FnOnce(&mut MonitoringStats)) {
        if let Some(mut row) = self.table.get_mut(&self.device_id) {
            if row.subscription_id == self.subscription_id {
                f(&mut row);
            }
        }
    }

    pub(crate) fn connected(&self) {
        self.update(|s| {
            s.connection_status = ConnectionStatus::Connected;
            s.reconnect_attempts = 0;
        });
    }

    /// Link lost; `attempts` is the retry counter after this failure.
    pub(crate) fn disconnected(&self, attempts: u32, reason: &str) {
        telemetry::record_transport_failure(&self.device_id);
        self.update(|s| {
            s.connection_status = ConnectionStatus::Disconnected;
            s.reconnect_attempts = attempts;
            s.last_error = Some(reason.to_owned());
        });
    }

    pub(crate) fn failed(&self, reason: &str) {
        telemetry::record_transport_failure(&self.device_id);
        self.update(|s| {
            s.connection_status = ConnectionStatus::Error;
            s.last_error = Some(reason.to_owned());
        });
    }

    pub(crate) fn event_delivered(&self, event_type: EventType, at: DateTime<Utc>) {
        telemetry::record_event_delivered(&self.device_id, event_type.as_ref());
        self.update(|s| {
            s.total_events += 1;
            *s.events_by_type.entry(event_type).or_insert(0) += 1;
            s.last_event_at = Some(at);
        });
    }

    pub(crate) fn parse_error(&self, reason: &str) {
        telemetry::record_parse_error(&self.device_id);
        self.update(|s| {
            s.parse_errors += 1;
            s.last_error = Some(reason.to_owned());
        });
    }
}
