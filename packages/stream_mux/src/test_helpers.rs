//! Shared test fixtures: an in-memory connector and frame helpers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::StreamError;
use crate::frame::{Frame, SharedSink};
use crate::transport::{Connector, UpstreamEvent, UpstreamLink};

/// The far end of a fake upstream link, held by the test.
pub(crate) struct ServerSide {
    pub url: String,
    pub outbound: mpsc::Receiver<String>,
    pub inbound: mpsc::Sender<UpstreamEvent>,
}

impl ServerSide {
    /// Next channel-selection message the client sent.
    pub async fn next_selection(&mut self) -> Option<String> {
        let text = self.outbound.recv().await?;
        let json: serde_json::Value = serde_json::from_str(&text).ok()?;
        json["chn"].as_str().map(str::to_string)
    }

    pub async fn send_frame(&self, label: &str) {
        let _ = self
            .inbound
            .send(UpstreamEvent::Text(image_json(label)))
            .await;
    }

    pub async fn close(&self) {
        let _ = self
            .inbound
            .send(UpstreamEvent::Closed {
                reason: Some("server going away".into()),
            })
            .await;
    }
}

/// Connector that hands each opened link to the test instead of a socket.
pub(crate) struct FakeConnector {
    links: mpsc::UnboundedSender<ServerSide>,
    fail_next: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (links, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            links,
            fail_next: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
        });
        (connector, rx)
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Times at which connect was called.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<UpstreamLink, StreamError>> {
        self.attempts.lock().unwrap().push(Instant::now());

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let url = url.to_string();
            return Box::pin(async move { Err(StreamError::connect(&url, "connection refused")) });
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.links.send(ServerSide {
            url: url.to_string(),
            outbound: out_rx,
            inbound: in_tx,
        });
        Box::pin(async move {
            Ok(UpstreamLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

pub(crate) fn image_json(label: &str) -> String {
    serde_json::json!({
        "image": STANDARD.encode(b"\xff\xd8\xff\xe0jpeg"),
        "task": label,
    })
    .to_string()
}

/// A sink that forwards every frame it receives into a channel.
pub(crate) fn channel_sink() -> (SharedSink, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: SharedSink = Arc::new(move |frame: &Frame| {
        let _ = tx.send(frame.clone());
    });
    (sink, rx)
}

/// A sink that counts frames.
pub(crate) fn counting_sink() -> (SharedSink, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let counter = count.clone();
    let sink: SharedSink = Arc::new(move |_: &Frame| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (sink, count)
}
