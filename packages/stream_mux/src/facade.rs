//! Consumer-facing entry point.
//!
//! Consumers subscribe by id and get frames through a sink plus a status
//! channel. Depending on the configured [`DistributionMode`] each consumer is
//! either a subscriber of one shared [`StreamMultiplexer`] or owns a
//! [`DedicatedClient`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{DistributionMode, StreamConfig};
use crate::dedicated::{DedicatedClient, DedicatedOptions};
use crate::error::StreamError;
use crate::frame::{Frame, SharedSink};
use crate::metrics::{FrameRateMeter, MuxMetricsSnapshot};
use crate::multiplexer::{ConnectionState, MuxStatus, StreamMultiplexer};
use crate::status::{SessionState, SessionStatus};
use crate::transport::{Connector, WsConnector};

const FPS_WINDOW: Duration = Duration::from_secs(1);

enum Consumer {
    Shared(SharedConsumer),
    Dedicated(DedicatedClient),
}

/// A subscriber of the shared multiplexer, plus the task that turns the
/// multiplexer's connection state into this consumer's session status.
struct SharedConsumer {
    /// The caller's sink wrapped with frame accounting
    sink: SharedSink,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    status: watch::Receiver<SessionStatus>,
    _bridge: DropGuard,
}

impl Consumer {
    fn status(&self) -> watch::Receiver<SessionStatus> {
        match self {
            Consumer::Shared(shared) => shared.status.clone(),
            Consumer::Dedicated(client) => client.status(),
        }
    }
}

pub struct StreamFacade {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    multiplexer: OnceLock<StreamMultiplexer>,
    consumers: RwLock<HashMap<String, Consumer>>,
}

impl StreamFacade {
    pub fn new(config: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            multiplexer: OnceLock::new(),
            consumers: RwLock::new(HashMap::new()),
        }
    }

    /// Facade talking to real WebSocket upstreams.
    pub fn with_websocket(config: StreamConfig) -> Self {
        Self::new(config, Arc::new(WsConnector::default()))
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start streaming `channel` to `sink`. An existing consumer with the
    /// same id is replaced.
    pub async fn subscribe(
        &self,
        consumer_id: &str,
        channel: &str,
        sink: SharedSink,
        expected_label: Option<String>,
    ) -> Result<watch::Receiver<SessionStatus>, StreamError> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(StreamError::EmptyChannel);
        }

        let mut consumers = self.consumers.write().await;
        if let Some(previous) = consumers.remove(consumer_id) {
            debug!(consumer = %consumer_id, "replacing consumer");
            // The multiplexer replaces a re-used id itself
            if let Consumer::Dedicated(client) = previous {
                client.close();
            }
        }

        let consumer = match self.config.mode {
            DistributionMode::Shared => {
                Consumer::Shared(self.subscribe_shared(consumer_id, channel, sink, expected_label)?)
            }
            DistributionMode::Dedicated => {
                let options = DedicatedOptions {
                    endpoint: self.config.dedicated_endpoint.clone(),
                    backoff: self.config.backoff.clone(),
                    channel: Some(channel.to_string()),
                    expected_label,
                    settling_period: self.config.mux.settling_period,
                    auto_connect: self.config.auto_connect,
                };
                Consumer::Dedicated(DedicatedClient::spawn(options, self.connector.clone(), sink))
            }
        };
        info!(consumer = %consumer_id, channel = %channel, mode = ?self.config.mode, "consumer subscribed");

        let status = consumer.status();
        consumers.insert(consumer_id.to_string(), consumer);
        Ok(status)
    }

    fn subscribe_shared(
        &self,
        consumer_id: &str,
        channel: &str,
        sink: SharedSink,
        expected_label: Option<String>,
    ) -> Result<SharedConsumer, StreamError> {
        let mux = self.multiplexer();
        let meter = Arc::new(FrameRateMeter::new());
        let frame_seen = Arc::new(Notify::new());

        let counted: SharedSink = {
            let meter = meter.clone();
            let frame_seen = frame_seen.clone();
            Arc::new(move |frame: &Frame| {
                meter.record();
                frame_seen.notify_one();
                sink.deliver(frame);
            })
        };
        mux.subscribe(consumer_id, channel, counted.clone(), expected_label)?;

        let (status_tx, status) = watch::channel(SessionStatus {
            state: SessionState::Connecting,
            ..SessionStatus::new(Uuid::new_v4(), Some(channel.to_string()))
        });
        let status_tx = Arc::new(status_tx);
        let cancel = CancellationToken::new();
        tokio::spawn(bridge_shared_status(
            mux.status(),
            meter,
            frame_seen,
            status_tx.clone(),
            cancel.clone(),
        ));

        Ok(SharedConsumer {
            sink: counted,
            status_tx,
            status,
            _bridge: cancel.drop_guard(),
        })
    }

    fn multiplexer(&self) -> &StreamMultiplexer {
        self.multiplexer.get_or_init(|| {
            StreamMultiplexer::spawn(
                self.config.endpoint.clone(),
                self.config.mux.clone(),
                self.connector.clone(),
            )
        })
    }

    /// Stop delivering to a consumer. Returns false if it was not subscribed.
    pub async fn unsubscribe(&self, consumer_id: &str) -> bool {
        let removed = self.consumers.write().await.remove(consumer_id);
        match removed {
            Some(consumer) => {
                self.release(consumer_id, consumer);
                info!(consumer = %consumer_id, "consumer unsubscribed");
                true
            }
            None => false,
        }
    }

    fn release(&self, consumer_id: &str, consumer: Consumer) {
        match consumer {
            Consumer::Shared(_) => {
                if let Some(mux) = self.multiplexer.get() {
                    mux.unsubscribe(consumer_id);
                }
            }
            Consumer::Dedicated(client) => client.close(),
        }
    }

    /// Point a consumer at another channel. The expected label is re-derived
    /// from the new channel key.
    pub async fn set_channel(&self, consumer_id: &str, channel: &str) -> Result<(), StreamError> {
        let channel = channel.trim();
        if channel.is_empty() {
            return Err(StreamError::EmptyChannel);
        }
        let consumers = self.consumers.read().await;
        let consumer = consumers
            .get(consumer_id)
            .ok_or_else(|| StreamError::UnknownConsumer(consumer_id.to_string()))?;

        match consumer {
            Consumer::Shared(shared) => {
                self.multiplexer()
                    .subscribe(consumer_id, channel, shared.sink.clone(), None)?;
                shared.status_tx.send_modify(|s| {
                    s.channel = Some(channel.to_string());
                });
            }
            Consumer::Dedicated(client) => client.set_channel(channel)?,
        }
        debug!(consumer = %consumer_id, channel = %channel, "channel reassigned");
        Ok(())
    }

    /// Manual retry. Shared consumers reconnect on their own, so this is a
    /// no-op for them.
    pub async fn retry(&self, consumer_id: &str) -> Result<(), StreamError> {
        let consumers = self.consumers.read().await;
        match consumers.get(consumer_id) {
            Some(Consumer::Dedicated(client)) => client.retry(),
            Some(Consumer::Shared(_)) => Ok(()),
            None => Err(StreamError::UnknownConsumer(consumer_id.to_string())),
        }
    }

    pub async fn status(&self, consumer_id: &str) -> Result<watch::Receiver<SessionStatus>, StreamError> {
        self.consumers
            .read()
            .await
            .get(consumer_id)
            .map(Consumer::status)
            .ok_or_else(|| StreamError::UnknownConsumer(consumer_id.to_string()))
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.consumers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Counters of the shared connection, once one has been created.
    pub fn mux_metrics(&self) -> Option<MuxMetricsSnapshot> {
        self.multiplexer.get().map(StreamMultiplexer::metrics)
    }

    /// Drop every consumer and stop the shared connection.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Consumer)> = self.consumers.write().await.drain().collect();
        debug!(consumers = drained.len(), "shutting down stream facade");
        for (id, consumer) in drained {
            self.release(&id, consumer);
        }
        if let Some(mux) = self.multiplexer.get() {
            mux.shutdown();
        }
    }
}

/// Derive one shared consumer's session status from the multiplexer's
/// connection state and the frames it has received.
async fn bridge_shared_status(
    mut mux_status: watch::Receiver<MuxStatus>,
    meter: Arc<FrameRateMeter>,
    frame_seen: Arc<Notify>,
    status: Arc<watch::Sender<SessionStatus>>,
    cancel: CancellationToken,
) {
    let mut fps_tick = tokio::time::interval_at(Instant::now() + FPS_WINDOW, FPS_WINDOW);
    fps_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Frames counted before the current connection came up
    let mut baseline = meter.total();
    let mut attempted = false;

    loop {
        let mux = *mux_status.borrow_and_update();
        if mux.state != ConnectionState::Connected {
            baseline = meter.total();
        }
        if mux.state != ConnectionState::Disconnected {
            attempted = true;
        }
        let state = match mux.state {
            ConnectionState::Connected if meter.total() > baseline => SessionState::Playing,
            ConnectionState::Connected | ConnectionState::Connecting => SessionState::Connecting,
            ConnectionState::Disconnected if attempted => SessionState::Reconnecting,
            ConnectionState::Disconnected => SessionState::Connecting,
        };
        let fps = meter.rate();
        status.send_if_modified(|s| {
            let changed = s.state != state || s.retry_count != mux.failed_attempts || s.fps != fps;
            s.state = state;
            s.retry_count = mux.failed_attempts;
            s.fps = fps;
            changed
        });

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = mux_status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = frame_seen.notified() => {}
            _ = fps_tick.tick() => {
                meter.tick();
            }
        }
    }

    status.send_modify(|s| {
        s.state = SessionState::Idle;
        s.fps = 0;
    });
}
