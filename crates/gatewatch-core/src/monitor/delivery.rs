// Delivery path shared by both transports: vendor item → canonical event
// → subscriber channel, with stats recorded along the way.

use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use gatewatch_api::RawVendorEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::stats::StatsRecorder;
use crate::error::CoreError;
use crate::model::{DeviceEvent, EventNormalizer};

// ── EventStream ──────────────────────────────────────────────────────

/// Receiving end of a subscription.
///
/// Ends (yields `None`) once the subscription is unsubscribed, superseded,
/// or its transport gives up.
#[derive(Debug)]
pub struct EventStream {
    device_id: String,
    subscription_id: Uuid,
    rx: mpsc::Receiver<DeviceEvent>,
}

impl EventStream {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    /// Next event, or `None` when the subscription has ended.
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = DeviceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ── EventSink ────────────────────────────────────────────────────────

/// Sending end. Refuses to send once cancelled.
#[derive(Debug)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<DeviceEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    /// `false` means the subscription is over and the caller should stop.
    pub(crate) async fn send(&self, event: DeviceEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}

pub(crate) fn channel(
    device_id: &str,
    subscription_id: Uuid,
    capacity: usize,
    cancel: CancellationToken,
) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSink { tx, cancel },
        EventStream {
            device_id: device_id.to_owned(),
            subscription_id,
            rx,
        },
    )
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// Normalizer, sink, and stats for one subscription.
pub(crate) struct Pipeline {
    pub(crate) normalizer: EventNormalizer,
    pub(crate) sink: EventSink,
    pub(crate) stats: StatsRecorder,
}

impl Pipeline {
    /// Turn one vendor item into a deliverable event.
    ///
    /// Bad items are counted and dropped here; they never reach the caller.
    pub(crate) fn prepare(
        &self,
        item: Result<RawVendorEvent, CoreError>,
        received_at: DateTime<Utc>,
    ) -> Option<DeviceEvent> {
        let outcome = item.and_then(|raw| self.normalizer.normalize(raw, received_at));
        match outcome {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                trace!(device_id = self.stats.device_id(), "event filtered out");
                None
            }
            Err(e) => {
                self.reject(&e.to_string());
                None
            }
        }
    }

    pub(crate) fn reject(&self, reason: &str) {
        debug!(device_id = self.stats.device_id(), reason, "skipping vendor event");
        self.stats.parse_error(reason);
    }

    /// Hand an event to the subscriber. `false` means stop.
    pub(crate) async fn deliver(&self, event: DeviceEvent) -> bool {
        let event_type = event.event_type;
        let at = event.timestamp;
        if !self.sink.send(event).await {
            return false;
        }
        self.stats.event_delivered(event_type, at);
        true
    }
}
