// WebSocket push transport.
//
// The socket, its reconnect loop and linear backoff live in
// `gatewatch_api::websocket`; this side turns alert items into canonical
// events and mirrors link state into the subscription's stats.

use chrono::Utc;
use gatewatch_api::{
    AlertItem, AlertStream, AlertStreamRequest, Credentials, IsapiClient, LinkState,
    ReconnectConfig,
};
use secrecy::SecretString;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TransportExit;
use super::delivery::Pipeline;
use crate::config::{DeviceConfig, MonitorOptions};
use crate::error::CoreError;

pub(crate) struct WebSocketTransport {
    stream: AlertStream,
    link: watch::Receiver<LinkState>,
    pipeline: Pipeline,
    cancel: CancellationToken,
}

impl WebSocketTransport {
    /// Open the alert-stream socket. Returns once the first upgrade succeeds.
    pub(crate) async fn start(
        device: &DeviceConfig,
        password: SecretString,
        options: &MonitorOptions,
        pipeline: Pipeline,
        cancel: CancellationToken,
    ) -> Result<Self, CoreError> {
        let transport = device.transport_config();
        // Used for URL and header construction only; nothing is sent.
        let client = IsapiClient::new(
            device.base_url()?,
            Credentials {
                username: device.username.clone(),
                password,
            },
            &transport,
        )?;

        let url = client.alert_stream_url()?;
        let tls = if url.scheme() == "wss" {
            transport.websocket_tls()?
        } else {
            None
        };
        let request = AlertStreamRequest {
            url,
            authorization: client.basic_header(),
            tls,
        };
        let reconnect = ReconnectConfig {
            retry_delay: options.retry_delay,
            max_retries: options.max_retries,
        };

        let stream = AlertStream::connect(request, reconnect, cancel.child_token()).await?;
        let link = stream.state();
        pipeline.stats.connected();
        info!(device_id = pipeline.stats.device_id(), "alert stream subscribed");

        Ok(Self {
            stream,
            link,
            pipeline,
            cancel,
        })
    }

    /// Deliver events until cancelled or the socket gives up.
    pub(crate) async fn run(mut self) -> TransportExit {
        let mut link_open = true;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                changed = self.link.changed(), if link_open => {
                    if changed.is_err() {
                        link_open = false;
                        continue;
                    }
                    let state = self.link.borrow_and_update().clone();
                    self.mirror(&state);
                }
                item = self.stream.next() => match item {
                    Some(AlertItem::Event(raw)) => {
                        if let Some(event) = self.pipeline.prepare(Ok(raw), Utc::now()) {
                            if !self.pipeline.deliver(event).await {
                                break;
                            }
                        }
                    }
                    Some(AlertItem::Rejected { reason }) => self.pipeline.reject(&reason),
                    None => break,
                },
            }
        }

        let last = self.link.borrow().clone();
        self.stream.close().await;

        if let LinkState::Failed { reason } = last {
            self.pipeline.stats.failed(&reason);
            return TransportExit::Failed(reason);
        }
        TransportExit::Stopped
    }

    fn mirror(&self, state: &LinkState) {
        let device_id = self.pipeline.stats.device_id();
        match state {
            LinkState::Connected => {
                info!(device_id, "alert stream connected");
                self.pipeline.stats.connected();
            }
            LinkState::Reconnecting {
                attempt,
                delay,
                reason,
            } => {
                warn!(device_id, attempt, ?delay, reason = %reason, "alert stream lost");
                self.pipeline.stats.disconnected(*attempt, reason);
            }
            LinkState::Failed { reason } => {
                warn!(device_id, reason = %reason, "alert stream gave up");
            }
            LinkState::Connecting | LinkState::Closed => {
                debug!(device_id, ?state, "alert stream state");
            }
        }
    }
}
