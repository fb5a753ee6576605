// HTTP polling transport.
//
// One task per device. The interval is awaited in-line, so a slow poll
// delays the next tick instead of overlapping it; ticks missed in the
// meantime are skipped.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use gatewatch_api::{Credentials, IsapiClient};
use secrecy::SecretString;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TransportExit;
use super::delivery::Pipeline;
use crate::config::{DeviceConfig, MonitorOptions};
use crate::error::CoreError;
use crate::model::DeviceEvent;

pub(crate) struct PollingTransport {
    client: IsapiClient,
    pipeline: Pipeline,
    cursor: PollCursor,
    event_types: Vec<String>,
    interval: Duration,
    max_retries: u32,
    cancel: CancellationToken,
}

impl PollingTransport {
    /// Run the first poll. Returns once it succeeds.
    pub(crate) async fn start(
        device: &DeviceConfig,
        password: SecretString,
        options: &MonitorOptions,
        pipeline: Pipeline,
        cancel: CancellationToken,
    ) -> Result<Self, CoreError> {
        let client = IsapiClient::new(
            device.base_url()?,
            Credentials {
                username: device.username.clone(),
                password,
            },
            &device.transport_config(),
        )?;

        let mut transport = Self {
            client,
            pipeline,
            // Devices report whole seconds.
            cursor: PollCursor::new(Utc::now().trunc_subsecs(0)),
            event_types: options.vendor_event_types(),
            interval: options.polling_interval,
            max_retries: options.max_retries,
            cancel,
        };

        transport.poll_once().await?;
        transport.pipeline.stats.connected();
        info!(
            device_id = transport.pipeline.stats.device_id(),
            interval = ?transport.interval,
            "polling subscribed"
        );
        Ok(transport)
    }

    /// Poll until cancelled or `max_retries` consecutive failures.
    pub(crate) async fn run(mut self) -> TransportExit {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.cancel.clone();
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return TransportExit::Stopped,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return TransportExit::Stopped,
                result = self.poll_once() => result,
            };

            match result {
                Ok(()) => {
                    if failures > 0 {
                        info!(
                            device_id = self.pipeline.stats.device_id(),
                            failures, "polling recovered"
                        );
                    }
                    failures = 0;
                    self.pipeline.stats.connected();
                }
                Err(e) => {
                    failures += 1;
                    let reason = e.to_string();
                    if failures >= self.max_retries {
                        warn!(
                            device_id = self.pipeline.stats.device_id(),
                            failures,
                            error = %reason,
                            "polling retry limit reached, giving up"
                        );
                        self.pipeline.stats.failed(&reason);
                        return TransportExit::Failed(reason);
                    }
                    warn!(
                        device_id = self.pipeline.stats.device_id(),
                        failures,
                        error = %reason,
                        "poll failed"
                    );
                    self.pipeline.stats.disconnected(failures, &reason);
                }
            }

            if cancel.is_cancelled() {
                return TransportExit::Stopped;
            }
        }
    }

    /// One request, then in-order delivery of everything not yet delivered.
    async fn poll_once(&mut self) -> Result<(), CoreError> {
        let payload = self
            .client
            .poll_events(self.cursor.since(), &self.event_types)
            .await?;
        let received_at = Utc::now();

        let mut batch: Vec<DeviceEvent> = payload
            .into_events()
            .into_iter()
            .filter_map(|item| {
                self.pipeline
                    .prepare(item.map_err(CoreError::from), received_at)
            })
            .collect();
        batch.sort_by_key(|event| event.timestamp);

        let fetched = batch.len();
        let mut delivered = 0usize;
        for event in batch {
            if !self.cursor.admit(&event) {
                continue;
            }
            if !self.pipeline.deliver(event).await {
                break;
            }
            delivered += 1;
        }

        debug!(
            device_id = self.pipeline.stats.device_id(),
            fetched,
            delivered,
            since = %self.cursor.since(),
            "poll complete"
        );
        Ok(())
    }
}

// ── PollCursor ───────────────────────────────────────────────────────

/// Fingerprints remembered for redelivery suppression.
const SEEN_CAPACITY: usize = 4096;

/// The `startTime` watermark plus the events already delivered.
///
/// Devices return events at `startTime` inclusively, so the boundary
/// second comes back on every poll until a newer event arrives. An event
/// stamped before the watermark (a lagging device clock, a backfill) is
/// still new if it has not been seen.
#[derive(Debug)]
struct PollCursor {
    since: DateTime<Utc>,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl PollCursor {
    fn new(since: DateTime<Utc>) -> Self {
        Self {
            since,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// `true` the first time an event is offered. The watermark moves to
    /// the newest timestamp admitted.
    fn admit(&mut self, event: &DeviceEvent) -> bool {
        let key = fingerprint(event);
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        self.since = self.since.max(event.timestamp);
        true
    }
}

fn fingerprint(event: &DeviceEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| {
        format!(
            "{}|{}|{:?}|{:?}",
            event.event_type, event.timestamp, event.user_id, event.card_id
        )
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use chrono::TimeZone;
    use serde_json::Map;

    fn event(second: u32, user: &str) -> DeviceEvent {
        DeviceEvent {
            device_id: "lobby".into(),
            event_type: EventType::AccessGranted,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, second).unwrap(),
            user_id: Some(user.into()),
            card_id: None,
            biometric_id: None,
            extras: Map::new(),
        }
    }

    #[test]
    fn cursor_admits_each_event_once() {
        let mut cursor = PollCursor::new(event(5, "x").timestamp);

        assert!(cursor.admit(&event(4, "a")), "older than watermark but unseen");
        assert_eq!(cursor.since(), event(5, "x").timestamp, "watermark never moves back");
        assert!(cursor.admit(&event(5, "b")), "at watermark, first time");
        assert!(!cursor.admit(&event(5, "b")), "at watermark, repeated");
        assert!(cursor.admit(&event(5, "c")), "same second, different event");
        assert!(cursor.admit(&event(7, "d")));
        assert_eq!(cursor.since(), event(7, "d").timestamp);
        assert!(!cursor.admit(&event(4, "a")), "older and already delivered");
    }

    #[test]
    fn replayed_batch_is_suppressed() {
        let mut cursor = PollCursor::new(event(0, "x").timestamp);
        let batch = [event(1, "a"), event(2, "b"), event(2, "c")];

        let first: Vec<bool> = batch.iter().map(|e| cursor.admit(e)).collect();
        let second: Vec<bool> = batch.iter().map(|e| cursor.admit(e)).collect();

        assert_eq!(first, vec![true, true, true]);
        assert_eq!(second, vec![false, false, false]);
    }

    #[test]
    fn seen_set_is_bounded() {
        let mut cursor = PollCursor::new(event(0, "x").timestamp);
        for n in 0..=SEEN_CAPACITY {
            assert!(cursor.admit(&event(1, &n.to_string())));
        }
        assert_eq!(cursor.order.len(), SEEN_CAPACITY);
        assert_eq!(cursor.seen.len(), SEEN_CAPACITY);
        // The oldest fingerprint was forgotten; the newest is still known.
        assert!(!cursor.admit(&event(1, &SEEN_CAPACITY.to_string())));
    }
}
