//! Event monitoring coordinator.
//!
//! [`EventMonitor`] owns one live subscription per device. Each
//! subscription is a spawned task running either the WebSocket or the
//! polling transport; events reach the caller through the
//! [`EventStream`] returned by
//! [`subscribe_to_events`](EventMonitor::subscribe_to_events).
//!
//! Per device the life cycle is
//! `UNSUBSCRIBED → CONNECTING → CONNECTED ⇄ RECONNECTING → CONNECTED | ERROR`,
//! and an explicit unsubscribe returns to `UNSUBSCRIBED` from anywhere.
//! A transport that reaches `ERROR` removes its own subscription; its
//! stats row keeps the status and last error.

mod delivery;
mod polling;
mod stats;
mod websocket;

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

pub use delivery::EventStream;
pub use stats::{ConnectionStatus, MonitoringStats, TransportKind};

use self::delivery::Pipeline;
use self::polling::PollingTransport;
use self::stats::{StatsRecorder, StatsTable};
use self::websocket::WebSocketTransport;
use crate::config::{DeviceConfig, MonitorOptions, SecretDecryptor};
use crate::error::CoreError;
use crate::model::EventNormalizer;
use crate::telemetry;

/// Per-subscription channel depth. The initial poll delivers into it
/// before the caller holds the stream.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How a transport task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportExit {
    /// Cancelled, or the subscriber went away.
    Stopped,
    /// Retry budget exhausted.
    Failed(String),
}

enum Transport {
    WebSocket(WebSocketTransport),
    Polling(PollingTransport),
}

impl Transport {
    async fn run(self) -> TransportExit {
        match self {
            Self::WebSocket(t) => t.run().await,
            Self::Polling(t) => t.run().await,
        }
    }
}

struct Subscription {
    id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type SubscriptionTable = Arc<DashMap<String, Subscription>>;

// ── EventMonitor ─────────────────────────────────────────────────────

/// Subscribes to device event streams and tracks their health.
///
/// Cheaply cloneable. Dropping the last clone cancels every transport.
#[derive(Clone)]
pub struct EventMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    decryptor: Arc<dyn SecretDecryptor>,
    subscriptions: SubscriptionTable,
    stats: StatsTable,
    locks: DashMap<String, Arc<Mutex<()>>>,
    root: CancellationToken,
    channel_capacity: usize,
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

impl EventMonitor {
    pub fn new(decryptor: Arc<dyn SecretDecryptor>) -> Self {
        Self::with_channel_capacity(decryptor, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(decryptor: Arc<dyn SecretDecryptor>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                decryptor,
                subscriptions: Arc::new(DashMap::new()),
                stats: Arc::new(DashMap::new()),
                locks: DashMap::new(),
                root: CancellationToken::new(),
                channel_capacity: capacity.max(1),
            }),
        }
    }

    // ── Subscribe / unsubscribe ──────────────────────────────────────

    /// Start monitoring `device`, replacing any existing subscription.
    ///
    /// Returns once the transport's first connection (or first poll)
    /// succeeds. On failure nothing is left behind, neither subscription
    /// nor stats.
    pub async fn subscribe_to_events(
        &self,
        device: &DeviceConfig,
        options: MonitorOptions,
    ) -> Result<EventStream, CoreError> {
        let device_id = device.device_id.as_str();
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        if self.stop(device_id).await? {
            info!(device_id, "superseding existing subscription");
        }

        let subscription_id = Uuid::new_v4();
        let kind = if options.use_websocket {
            TransportKind::WebSocket
        } else {
            TransportKind::Polling
        };
        self.inner.stats.insert(
            device_id.to_owned(),
            MonitoringStats::new(device_id, subscription_id, kind),
        );

        let cancel = self.inner.root.child_token();
        let span = info_span!("subscription", device_id, %subscription_id, transport = %kind);

        let started = self
            .start_transport(device, &options, kind, subscription_id, cancel.clone())
            .instrument(span.clone())
            .await;

        let (transport, stream) = match started {
            Ok(ok) => ok,
            Err(source) => {
                cancel.cancel();
                self.inner.stats.remove(device_id);
                let correlation_id = Uuid::new_v4();
                error!(device_id, %correlation_id, error = %source, "subscription failed");
                return Err(CoreError::SubscriptionFailed {
                    device_id: device_id.to_owned(),
                    correlation_id,
                    source: Box::new(source),
                });
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let subscriptions = Arc::clone(&self.inner.subscriptions);
        let owner = device_id.to_owned();
        let task = tokio::spawn(
            async move {
                // Wait until the subscription is registered so a fast
                // failure can find and remove it.
                if ready_rx.await.is_err() {
                    return;
                }
                if let TransportExit::Failed(reason) = transport.run().await {
                    if subscriptions
                        .remove_if(&owner, |_, sub| sub.id == subscription_id)
                        .is_some()
                    {
                        telemetry::record_subscription_closed();
                    }
                    warn!(reason = %reason, "subscription ended in error");
                }
            }
            .instrument(span),
        );

        self.inner.subscriptions.insert(
            device_id.to_owned(),
            Subscription {
                id: subscription_id,
                cancel,
                task,
            },
        );
        telemetry::record_subscription_opened();
        let _ = ready_tx.send(());

        info!(device_id, %subscription_id, transport = %kind, "subscribed");
        Ok(stream)
    }

    async fn start_transport(
        &self,
        device: &DeviceConfig,
        options: &MonitorOptions,
        kind: TransportKind,
        subscription_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(Transport, EventStream), CoreError> {
        let device_id = device.device_id.as_str();
        let password = self
            .inner
            .decryptor
            .decrypt(&device.encrypted_secret)
            .map_err(|e| CoreError::Decrypt {
                device_id: device_id.to_owned(),
                message: e.to_string(),
            })?;

        let (sink, stream) = delivery::channel(
            device_id,
            subscription_id,
            self.inner.channel_capacity,
            cancel.clone(),
        );
        let pipeline = Pipeline {
            normalizer: EventNormalizer::new(device_id, options.event_types.clone()),
            sink,
            stats: StatsRecorder::new(device_id, subscription_id, Arc::clone(&self.inner.stats)),
        };

        let transport = match kind {
            TransportKind::WebSocket => {
                WebSocketTransport::start(device, password, options, pipeline, cancel)
                    .await
                    .map(Transport::WebSocket)
            }
            TransportKind::Polling => {
                PollingTransport::start(device, password, options, pipeline, cancel)
                    .await
                    .map(Transport::Polling)
            }
        }
        .map_err(|source| CoreError::TransportConnect {
            device_id: device_id.to_owned(),
            source: Box::new(source),
        })?;

        Ok((transport, stream))
    }

    /// Stop monitoring a device. Unknown devices are a no-op.
    ///
    /// When this returns the transport has stopped and no further events
    /// will be sent. The stats row stays, marked disconnected.
    pub async fn unsubscribe_from_events(&self, device_id: &str) -> Result<(), CoreError> {
        let lock = self.device_lock(device_id);
        let stopped = {
            let _guard = lock.lock().await;
            self.stop(device_id).await
        };
        self.release_lock(device_id, lock);
        stopped.map(|_| ())
    }

    /// Cancel and join the device's subscription. `Ok(false)` if none.
    async fn stop(&self, device_id: &str) -> Result<bool, CoreError> {
        let Some((_, subscription)) = self.inner.subscriptions.remove(device_id) else {
            return Ok(false);
        };
        telemetry::record_subscription_closed();

        subscription.cancel.cancel();
        let joined = subscription.task.await;

        if let Some(mut row) = self.inner.stats.get_mut(device_id) {
            if row.subscription_id == subscription.id
                && row.connection_status != ConnectionStatus::Error
            {
                row.connection_status = ConnectionStatus::Disconnected;
            }
        }
        info!(device_id, subscription_id = %subscription.id, "unsubscribed");

        match joined {
            Ok(()) => Ok(true),
            Err(e) if e.is_cancelled() => Ok(true),
            Err(e) => Err(CoreError::Internal(format!(
                "transport task for '{device_id}' panicked: {e}"
            ))),
        }
    }

    /// Unsubscribe every device concurrently, then clear all stats.
    ///
    /// Every device is attempted; the outcome for each is returned.
    pub async fn cleanup(&self) -> Vec<(String, Result<(), CoreError>)> {
        let device_ids = self.active_subscriptions();
        let outcomes = join_all(device_ids.into_iter().map(|device_id| async move {
            let result = self.unsubscribe_from_events(&device_id).await;
            (device_id, result)
        }))
        .await;

        for (device_id, result) in &outcomes {
            if let Err(e) = result {
                warn!(device_id, error = %e, "unsubscribe during cleanup failed");
            }
        }
        self.inner.stats.clear();
        outcomes
    }

    // ── Snapshots ────────────────────────────────────────────────────

    pub fn monitoring_stats(&self, device_id: &str) -> Option<MonitoringStats> {
        self.inner.stats.get(device_id).map(|row| row.clone())
    }

    /// Every stats row, ordered by device id.
    pub fn all_monitoring_stats(&self) -> Vec<MonitoringStats> {
        let mut rows: Vec<MonitoringStats> = self
            .inner
            .stats
            .iter()
            .map(|row| row.value().clone())
            .collect();
        rows.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        rows
    }

    /// Devices with a live subscription, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.inner
                .locks
                .entry(device_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn release_lock(&self, device_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.inner
            .locks
            .remove_if(device_id, |_, held| Arc::strong_count(held) == 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    fn monitor() -> EventMonitor {
        EventMonitor::new(Arc::new(|raw: &str| {
            Ok::<_, CoreError>(SecretString::from(raw.to_owned()))
        }))
    }

    #[tokio::test]
    async fn unsubscribe_releases_device_lock() {
        let monitor = monitor();
        monitor.unsubscribe_from_events("lobby").await.unwrap();
        monitor.unsubscribe_from_events("garage").await.unwrap();
        assert!(monitor.inner.locks.is_empty());
    }

    #[tokio::test]
    async fn held_lock_survives_unsubscribe() {
        let monitor = monitor();
        let held = monitor.device_lock("lobby");
        monitor.unsubscribe_from_events("lobby").await.unwrap();
        assert!(monitor.inner.locks.contains_key("lobby"));

        drop(held);
        monitor.unsubscribe_from_events("lobby").await.unwrap();
        assert!(monitor.inner.locks.is_empty());
    }
}
