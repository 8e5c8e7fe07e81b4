//! Upstream transport seam.
//!
//! A `Connector` opens one socket and hands back an `UpstreamLink`: a sender
//! for outbound text and a receiver of inbound events. Dropping the link
//! closes the socket. The production connector bridges a tokio-tungstenite
//! stream through a reader task and a writer task.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::StreamError;

/// Default capacity of the per-link channels.
const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened on an upstream socket.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Text(String),
    Binary(Bytes),
    /// Socket closed or errored; no further events follow
    Closed { reason: Option<String> },
}

/// An open upstream connection.
pub struct UpstreamLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<UpstreamEvent>,
}

impl UpstreamLink {
    /// Next inbound event. A vanished reader counts as a close.
    pub async fn next_event(&mut self) -> UpstreamEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(UpstreamEvent::Closed { reason: None })
    }

    /// Queue a text message without waiting. Returns false if the link is
    /// closed or its queue is full.
    pub fn send_text(&self, text: String) -> bool {
        self.outbound.try_send(text).is_ok()
    }
}

/// Opens upstream connections.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<UpstreamLink, StreamError>>;
}

/// Await the next event on an optional link; pending forever when there is none.
pub(crate) async fn next_event(link: &mut Option<UpstreamLink>) -> UpstreamEvent {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    channel_capacity: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl WsConnector {
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            channel_capacity: channel_capacity.max(1),
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<UpstreamLink, StreamError>> {
        let url = url.to_string();
        let capacity = self.channel_capacity;
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| StreamError::connect(&url, e))?;
            let (mut ws_write, mut ws_read) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<String>(capacity);
            let (in_tx, in_rx) = mpsc::channel::<UpstreamEvent>(capacity);

            // Writer: ends when the link is dropped, then closes the socket
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if ws_write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = ws_write.close().await;
            });

            // Reader: forwards frames until the socket or the link goes away
            let reader_url = url.clone();
            tokio::spawn(async move {
                let reason = loop {
                    let event = match ws_read.next().await {
                        Some(Ok(Message::Text(text))) => UpstreamEvent::Text(text.as_str().to_owned()),
                        Some(Ok(Message::Binary(data))) => UpstreamEvent::Binary(data),
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map(|f| f.reason.as_str().to_owned());
                        }
                        // Ping/pong are answered by tungstenite
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    };
                    if in_tx.send(event).await.is_err() {
                        debug!(url = %reader_url, "link dropped, stopping reader");
                        return;
                    }
                };
                let _ = in_tx.send(UpstreamEvent::Closed { reason }).await;
            });

            Ok(UpstreamLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
