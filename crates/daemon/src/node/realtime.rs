//! WebSocket link to the Node's realtime channel.
//!
//! Outbound: every event published on the bus, wrapped in an echo frame.
//! Inbound: echo frames relayed by the Node, handed to
//! [`StatusBus::receive_echo`]. The link reconnects after a fixed delay when
//! the connection drops; events published while disconnected are dropped.

use crate::bus::{RealtimeFrame, StatusBus, VideoEvent};
use crate::config::NodeConfig;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection settings for the realtime channel
#[derive(Debug, Clone)]
pub struct RealtimeLink {
    url: String,
    token: String,
    reconnect_delay: Duration,
}

/// Derive the WebSocket URL from the Node's HTTP base URL.
pub fn realtime_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/{}", base, path.trim_start_matches('/'))
}

/// Why a connected session ended
enum SessionEnd {
    Shutdown,
    Disconnected,
}

impl RealtimeLink {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            url: realtime_url(&config.base_url, &config.realtime_path),
            token: config.token.clone(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Keep the link up until `shutdown` is cancelled.
    pub async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<VideoEvent>,
        bus: Arc<StatusBus>,
        shutdown: CancellationToken,
    ) {
        loop {
            match self.session(&mut outbound, &bus, &shutdown).await {
                Ok(SessionEnd::Shutdown) => return,
                Ok(SessionEnd::Disconnected) => {
                    info!(url = %self.url, "Realtime link disconnected");
                }
                Err(e) => {
                    warn!(url = %self.url, "Realtime link failed: {}", e);
                }
            }

            let retry = tokio::time::sleep(self.reconnect_delay);
            tokio::pin!(retry);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = &mut retry => break,
                    event = outbound.recv() => match event {
                        Some(event) => debug!(video_id = %event.video_id(), "Realtime link down; dropping event"),
                        None => return,
                    },
                }
            }
        }
    }

    async fn session(
        &self,
        outbound: &mut mpsc::UnboundedReceiver<VideoEvent>,
        bus: &StatusBus,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, Box<dyn std::error::Error + Send + Sync>> {
        let mut request = self.url.as_str().into_client_request()?;
        if !self.token.is_empty() {
            request.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", self.token))?,
            );
        }

        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        info!(url = %self.url, "Realtime link connected");
        let (mut sink, mut inbound) = stream.split();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                event = outbound.recv() => {
                    let Some(event) = event else {
                        return Ok(SessionEnd::Shutdown);
                    };
                    let frame = serde_json::to_string(&RealtimeFrame::echo(&event)?)?;
                    sink.send(Message::Text(frame)).await?;
                }
                message = inbound.next() => match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RealtimeFrame>(&text) {
                        Ok(frame) => {
                            if let Some(event) = frame.into_echoed_event() {
                                bus.receive_echo(event);
                            }
                        }
                        Err(e) => debug!("Ignoring malformed realtime frame: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}
