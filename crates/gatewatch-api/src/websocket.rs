//! Alert-stream WebSocket with auto-reconnect.
//!
//! Connects to a device's `/ISAPI/Event/notification/alertStream` socket and
//! forwards every vendor event through an [`mpsc`] channel. Link changes
//! are published on a [`watch`] channel so the owner can track status
//! without polling.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatewatch_api::websocket::{AlertStream, AlertStreamRequest, ReconnectConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let request = AlertStreamRequest {
//!     url: client.alert_stream_url()?,
//!     authorization: client.basic_header(),
//!     tls: None,
//! };
//! let mut stream = AlertStream::connect(request, ReconnectConfig::default(), CancellationToken::new()).await?;
//!
//! while let Some(item) = stream.next().await {
//!     println!("{item:?}");
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::payload::{RawVendorEvent, VendorPayload};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Channel capacity ─────────────────────────────────────────────────

const ITEM_CHANNEL_CAPACITY: usize = 256;

// ── Public types ─────────────────────────────────────────────────────

/// One unit of alert-stream output.
#[derive(Debug, Clone)]
pub enum AlertItem {
    Event(RawVendorEvent),
    /// A frame or element that could not be read as a vendor event.
    Rejected { reason: String },
}

/// Connection state of the alert stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Lost the link; waiting `delay` before attempt number `attempt`.
    Reconnecting {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// Retry budget exhausted. Terminal.
    Failed { reason: String },
    /// Cancelled by the owner. Terminal.
    Closed,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Closed)
    }
}

/// Linear backoff configuration for reconnection.
///
/// Attempt `n` waits `retry_delay * n`; after `max_retries` failed
/// attempts the stream gives up.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base delay. Default: 2s.
    pub retry_delay: Duration,
    /// Default: 5.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }
}

/// Where and how to open the socket.
#[derive(Clone)]
pub struct AlertStreamRequest {
    pub url: Url,
    /// Full `Authorization` header value for the upgrade request.
    pub authorization: String,
    /// Custom TLS config for `wss://`. `None` uses webpki roots.
    pub tls: Option<Arc<ClientConfig>>,
}

impl std::fmt::Debug for AlertStreamRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertStreamRequest")
            .field("url", &self.url.as_str())
            .field("authorization", &"<redacted>")
            .field("custom_tls", &self.tls.is_some())
            .finish()
    }
}

// ── AlertStream ──────────────────────────────────────────────────────

/// Handle to a running alert stream.
///
/// Dropping the handle cancels the background task.
pub struct AlertStream {
    items: mpsc::Receiver<AlertItem>,
    state: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AlertStream {
    /// Open the socket and spawn the read/reconnect loop.
    ///
    /// Unlike later reconnects, the first connection is made inline: a
    /// device that refuses the upgrade fails here.
    pub async fn connect(
        request: AlertStreamRequest,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let (item_tx, items) = mpsc::channel(ITEM_CHANNEL_CAPACITY);
        let (state_tx, state) = watch::channel(LinkState::Connecting);

        let socket = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(Error::WebSocketConnect("cancelled before connecting".into()));
            }
            result = open(&request) => result?,
        };
        state_tx.send_replace(LinkState::Connected);

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            stream_loop(request, socket, item_tx, state_tx, reconnect, task_cancel).await;
        });

        Ok(Self {
            items,
            state,
            cancel,
            task: Some(task),
        })
    }

    /// Next item. `None` once the stream has terminated and drained.
    pub async fn next(&mut self) -> Option<AlertItem> {
        self.items.recv().await
    }

    /// A receiver for link state changes.
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Stop and wait for the background task to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AlertStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Background loop ──────────────────────────────────────────────────

enum ReadOutcome {
    Cancelled,
    Lost(String),
}

/// read → on loss, back off → reconnect, until cancelled or out of retries.
async fn stream_loop(
    request: AlertStreamRequest,
    mut socket: Socket,
    item_tx: mpsc::Sender<AlertItem>,
    state_tx: watch::Sender<LinkState>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    'session: loop {
        let mut reason = match read_until_lost(socket, &item_tx, &cancel).await {
            ReadOutcome::Cancelled => break 'session,
            ReadOutcome::Lost(reason) => reason,
        };

        loop {
            if attempt >= reconnect.max_retries {
                tracing::error!(
                    url = %request.url,
                    max_retries = reconnect.max_retries,
                    reason = %reason,
                    "alert stream reconnection limit reached, giving up"
                );
                state_tx.send_replace(LinkState::Failed { reason });
                return;
            }

            attempt += 1;
            let delay = reconnect.delay_for(attempt);
            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "waiting before reconnect"
            );
            state_tx.send_replace(LinkState::Reconnecting {
                attempt,
                delay,
                reason: reason.clone(),
            });

            tokio::select! {
                biased;
                () = cancel.cancelled() => break 'session,
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break 'session,
                result = open(&request) => result,
            };
            match result {
                Ok(fresh) => {
                    attempt = 0;
                    state_tx.send_replace(LinkState::Connected);
                    socket = fresh;
                    continue 'session;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "alert stream reconnect failed");
                    reason = e.to_string();
                }
            }
        }
    }

    state_tx.send_replace(LinkState::Closed);
    tracing::debug!(url = %request.url, "alert stream loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

async fn open(request: &AlertStreamRequest) -> Result<Socket, Error> {
    tracing::info!(url = %request.url, "connecting to alert stream");

    let uri: tungstenite::http::Uri = request
        .url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let upgrade =
        ClientRequestBuilder::new(uri).with_header("Authorization", request.authorization.clone());
    let connector = request
        .tls
        .as_ref()
        .map(|config| Connector::Rustls(Arc::clone(config)));

    let (socket, _response) =
        tokio_tungstenite::connect_async_tls_with_config(upgrade, None, false, connector)
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

    tracing::info!("alert stream connected");
    Ok(socket)
}

/// Read frames until the link drops or the owner cancels.
async fn read_until_lost(
    socket: Socket,
    item_tx: &mpsc::Sender<AlertItem>,
    cancel: &CancellationToken,
) -> ReadOutcome {
    let (_write, mut read) = socket.split();

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => return ReadOutcome::Cancelled,
            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(tungstenite::Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(tungstenite::Message::Binary(bytes))) => {
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Some(Ok(tungstenite::Message::Ping(_))) => {
                // tungstenite queues the pong itself
                tracing::trace!("alert stream ping");
                continue;
            }
            Some(Ok(tungstenite::Message::Close(frame))) => {
                let err = match frame {
                    Some(cf) => Error::WebSocketClosed {
                        code: u16::from(cf.code),
                        reason: cf.reason.as_str().to_owned(),
                    },
                    None => Error::WebSocketClosed {
                        code: 1005,
                        reason: "no close payload".into(),
                    },
                };
                tracing::info!(error = %err, "alert stream close frame received");
                return ReadOutcome::Lost(err.to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return ReadOutcome::Lost(e.to_string()),
            None => return ReadOutcome::Lost("stream ended".into()),
        };

        if !forward(&text, item_tx, cancel).await {
            return ReadOutcome::Cancelled;
        }
    }
}

/// Split one frame into items and push them. `false` means stop.
async fn forward(
    text: &str,
    item_tx: &mpsc::Sender<AlertItem>,
    cancel: &CancellationToken,
) -> bool {
    for item in frame_items(text) {
        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => return false,
            sent = item_tx.send(item) => sent,
        };
        if sent.is_err() {
            tracing::debug!("alert stream receiver dropped");
            return false;
        }
    }
    true
}

fn frame_items(text: &str) -> Vec<AlertItem> {
    VendorPayload::parse(text)
        .into_events()
        .into_iter()
        .map(|result| match result {
            Ok(event) => AlertItem::Event(event),
            Err(e) => AlertItem::Rejected {
                reason: e.to_string(),
            },
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn backoff_is_linear() {
        let config = ReconnectConfig {
            retry_delay: Duration::from_millis(500),
            max_retries: 3,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(500));
        assert_eq!(config.delay_for(2), Duration::from_millis(1000));
        assert_eq!(config.delay_for(3), Duration::from_millis(1500));
    }

    #[test]
    fn frame_with_array_yields_one_item_per_element() {
        let items = frame_items(r#"[{"eventType":"doorOpen"},{"eventType":"doorClose"},7]"#);
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], AlertItem::Event(e) if e.event_type == "doorOpen"));
        assert!(matches!(&items[1], AlertItem::Event(e) if e.event_type == "doorClose"));
        assert!(matches!(&items[2], AlertItem::Rejected { .. }));
    }

    #[test]
    fn unreadable_frame_is_rejected_not_dropped() {
        let items = frame_items("\u{1}\u{2}garbage");
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], AlertItem::Rejected { .. }));
    }

    #[test]
    fn terminal_states() {
        assert!(LinkState::Closed.is_terminal());
        assert!(
            LinkState::Failed {
                reason: "x".into()
            }
            .is_terminal()
        );
        assert!(!LinkState::Connected.is_terminal());
    }

    #[test]
    fn request_debug_redacts_authorization() {
        let request = AlertStreamRequest {
            url: Url::parse("ws://10.0.0.20/ISAPI/Event/notification/alertStream").unwrap(),
            authorization: "Basic YWRtaW46c2VjcmV0".into(),
            tls: None,
        };
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("YWRtaW46"));
        assert!(rendered.contains("<redacted>"));
    }
}
