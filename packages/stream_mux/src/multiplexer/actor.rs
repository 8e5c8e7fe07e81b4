use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{self, Inbound};
use crate::config::{Endpoint, MuxSettings};
use crate::error::StreamError;
use crate::frame::{Frame, SharedSink};
use crate::metrics::{MuxMetrics, MuxMetricsSnapshot};
use crate::timer::Deadline;
use crate::transport::{Connector, UpstreamEvent, UpstreamLink, next_event};

use super::state::{MuxState, RouteOutcome};

/// Lifecycle of the shared upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state plus the number of consecutive failed connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxStatus {
    pub state: ConnectionState,
    pub failed_attempts: u32,
}

/// Commands that can be sent to the multiplexer actor
enum MuxCommand {
    Subscribe {
        id: String,
        channel: String,
        sink: SharedSink,
        expected_label: Option<String>,
    },
    Unsubscribe {
        id: String,
    },
    SubscriberCount {
        respond_to: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Handle to a shared-connection multiplexer.
///
/// Cheap to clone. The actor stops when every handle is dropped or
/// `shutdown` is called. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct StreamMultiplexer {
    sender: mpsc::UnboundedSender<MuxCommand>,
    status: watch::Receiver<MuxStatus>,
    metrics: Arc<MuxMetrics>,
    session_id: Uuid,
}

impl StreamMultiplexer {
    /// Spawn the actor. No connection is opened until the first subscriber.
    pub fn spawn(endpoint: Endpoint, settings: MuxSettings, connector: Arc<dyn Connector>) -> Self {
        let (sender, commands) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(MuxStatus {
            state: ConnectionState::Disconnected,
            failed_attempts: 0,
        });
        let (connect_tx, connect_results) = mpsc::unbounded_channel();
        let metrics = Arc::new(MuxMetrics::new());
        let session_id = Uuid::new_v4();

        let actor = MuxActor {
            session_id,
            endpoint,
            connector,
            state: MuxState::new(settings),
            commands,
            link: None,
            connecting: false,
            generation: 0,
            connect_tx,
            connect_results,
            cycle_timer: Deadline::new(),
            reconnect_timer: Deadline::new(),
            status: status_tx,
            metrics: metrics.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            status,
            metrics,
            session_id,
        }
    }

    /// Register interest in `channel`. Re-using an id replaces the old
    /// registration. Callable from inside a frame sink.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        channel: impl Into<String>,
        sink: SharedSink,
        expected_label: Option<String>,
    ) -> Result<(), StreamError> {
        self.sender
            .send(MuxCommand::Subscribe {
                id: id.into(),
                channel: channel.into(),
                sink,
                expected_label,
            })
            .map_err(|_| StreamError::Closed)
    }

    /// Remove a subscriber. Idempotent. When called from a frame sink the
    /// removal takes effect after the current dispatch pass.
    pub fn unsubscribe(&self, id: &str) {
        let _ = self.sender.send(MuxCommand::Unsubscribe { id: id.to_string() });
    }

    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(MuxCommand::SubscriberCount { respond_to: tx })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn status(&self) -> watch::Receiver<MuxStatus> {
        self.status.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn metrics(&self) -> MuxMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Close the upstream connection and stop the actor.
    pub fn shutdown(&self) {
        let _ = self.sender.send(MuxCommand::Shutdown);
    }
}

type ConnectResult = (u64, Result<UpstreamLink, StreamError>);

/// The actor owning the shared connection and its subscribers
struct MuxActor {
    session_id: Uuid,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    state: MuxState,
    commands: mpsc::UnboundedReceiver<MuxCommand>,
    link: Option<UpstreamLink>,
    connecting: bool,
    /// Bumped whenever a connection is opened or torn down; connect results
    /// from an older generation are discarded.
    generation: u64,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_results: mpsc::UnboundedReceiver<ConnectResult>,
    cycle_timer: Deadline,
    reconnect_timer: Deadline,
    status: watch::Sender<MuxStatus>,
    metrics: Arc<MuxMetrics>,
}

impl MuxActor {
    async fn run(mut self) {
        debug!(session = %self.session_id, "multiplexer started");
        loop {
            tokio::select! {
                // Commands first so an unsubscribe issued from a sink lands
                // before the next frame is routed
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(MuxCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some((generation, result)) = self.connect_results.recv() => {
                    self.on_connect_result(generation, result);
                }
                event = next_event(&mut self.link) => self.on_upstream(event),
                () = self.cycle_timer.fired() => self.on_cycle_tick(),
                () = self.reconnect_timer.fired() => self.open_connection(),
            }
        }
        self.close_connection();
        debug!(session = %self.session_id, "multiplexer stopped");
    }

    fn handle_command(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::Subscribe {
                id,
                channel,
                sink,
                expected_label,
            } => {
                debug!(session = %self.session_id, subscriber = %id, channel = %channel, "subscribe");
                self.state.insert(id, channel, sink, expected_label);
                self.on_membership_changed();
            }
            MuxCommand::Unsubscribe { id } => {
                if !self.state.remove(&id) {
                    return;
                }
                debug!(session = %self.session_id, subscriber = %id, "unsubscribe");
                if self.state.is_empty() {
                    info!(session = %self.session_id, "last subscriber left, closing upstream");
                    self.close_connection();
                } else {
                    self.on_membership_changed();
                }
            }
            MuxCommand::SubscriberCount { respond_to } => {
                let _ = respond_to.send(self.state.subscriber_count());
            }
            MuxCommand::Shutdown => {}
        }
    }

    fn on_membership_changed(&mut self) {
        if self.link.is_none() {
            if !self.connecting && !self.reconnect_timer.is_armed() {
                self.open_connection();
            }
            return;
        }
        if let Some(channel) = self.state.reselect_if_needed(Instant::now()) {
            self.send_selection(&channel);
        } else if self.state.cycle().rotates() {
            if !self.cycle_timer.is_armed() {
                self.cycle_timer.arm(self.state.settings().cycle_interval);
            }
        } else {
            self.cycle_timer.cancel();
        }
    }

    fn open_connection(&mut self) {
        if self.state.is_empty() {
            return;
        }
        self.generation += 1;
        self.connecting = true;
        self.set_state(ConnectionState::Connecting);

        let generation = self.generation;
        let url = self.endpoint.template().to_string();
        let connector = self.connector.clone();
        let results = self.connect_tx.clone();
        info!(session = %self.session_id, url = %url, "connecting upstream");
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = results.send((generation, result));
        });
    }

    fn on_connect_result(&mut self, generation: u64, result: Result<UpstreamLink, StreamError>) {
        if generation != self.generation {
            debug!(session = %self.session_id, generation, "discarding stale connection attempt");
            return;
        }
        self.connecting = false;

        match result {
            Ok(link) => {
                if self.state.is_empty() {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
                info!(session = %self.session_id, "upstream connected");
                self.metrics.connection_opened();
                self.link = Some(link);
                self.status.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.failed_attempts = 0;
                });
                if let Some(channel) = self.state.select_for_connection(Instant::now()) {
                    self.send_selection(&channel);
                }
            }
            Err(e) => {
                self.status.send_modify(|s| s.failed_attempts += 1);
                self.on_disconnected(&e.to_string());
            }
        }
    }

    fn on_upstream(&mut self, event: UpstreamEvent) {
        let decoded = match event {
            UpstreamEvent::Text(text) => codec::decode_text(&text),
            UpstreamEvent::Binary(data) => codec::decode_binary(data),
            UpstreamEvent::Closed { reason } => {
                let reason = reason.unwrap_or_else(|| "closed".to_string());
                self.on_disconnected(&reason);
                return;
            }
        };

        match decoded {
            Ok(Inbound::Frame(frame)) => self.route(frame),
            Ok(Inbound::KeepAlive) => {}
            Ok(Inbound::UpstreamError(message)) => {
                warn!(session = %self.session_id, error = %message, "upstream reported an error, reconnecting");
                self.metrics.upstream_error();
                self.on_disconnected(&message);
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "dropping malformed payload");
                self.metrics.malformed_payload();
            }
        }
    }

    fn route(&mut self, frame: Frame) {
        self.metrics.frame_received();
        let routed = self.state.route(&frame, Instant::now());
        match routed.outcome {
            RouteOutcome::Delivered(count) => self.metrics.frames_delivered(count),
            RouteOutcome::Settling => self.metrics.frame_settling(),
            RouteOutcome::Unmatched => self.metrics.frame_unmatched(),
            RouteOutcome::Ambiguous => self.metrics.frame_ambiguous(),
        }
        for sink in routed.sinks {
            sink.deliver(&frame);
        }
    }

    fn on_cycle_tick(&mut self) {
        if self.link.is_none() {
            return;
        }
        if let Some(channel) = self.state.rotate(Instant::now()) {
            self.send_selection(&channel);
        }
    }

    fn send_selection(&mut self, channel: &str) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        debug!(session = %self.session_id, channel = %channel, "selecting channel");
        if !link.send_text(codec::encode_select(channel)) {
            warn!(session = %self.session_id, channel = %channel, "failed to queue channel selection");
        }
        self.metrics.channel_switched();
        if self.state.cycle().rotates() {
            self.cycle_timer.arm(self.state.settings().cycle_interval);
        } else {
            self.cycle_timer.cancel();
        }
    }

    /// Unexpected loss of the connection (or a failed connect).
    fn on_disconnected(&mut self, reason: &str) {
        self.link = None;
        self.connecting = false;
        self.generation += 1;
        self.cycle_timer.cancel();
        self.set_state(ConnectionState::Disconnected);

        if self.state.is_empty() {
            return;
        }
        let delay = self.state.settings().reconnect_delay;
        warn!(
            session = %self.session_id,
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "upstream lost, scheduling reconnect"
        );
        self.metrics.reconnect_scheduled();
        self.reconnect_timer.arm(delay);
    }

    /// Deliberate close: nobody is subscribed any more, or shutdown.
    fn close_connection(&mut self) {
        self.link = None;
        self.connecting = false;
        self.generation += 1;
        self.cycle_timer.cancel();
        self.reconnect_timer.cancel();
        self.state.reset_selection();
        self.status.send_modify(|s| {
            s.state = ConnectionState::Disconnected;
            s.failed_attempts = 0;
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|s| {
            if s.state == state {
                false
            } else {
                s.state = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeConnector, channel_sink, counting_sink};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_mux() -> (
        StreamMultiplexer,
        Arc<FakeConnector>,
        mpsc::UnboundedReceiver<crate::test_helpers::ServerSide>,
    ) {
        let (connector, links) = FakeConnector::new();
        let mux = StreamMultiplexer::spawn(
            Endpoint::parse("ws://bm.test/video").unwrap(),
            MuxSettings::default(),
            connector.clone(),
        );
        (mux, connector, links)
    }

    #[tokio::test(start_paused = true)]
    async fn cycles_between_requested_channels() {
        let (mux, _connector, mut links) = spawn_mux();
        let (s1, _) = counting_sink();
        let (s2, _) = counting_sink();
        let (s3, _) = counting_sink();
        mux.subscribe("s1", "A", s1, None).unwrap();
        mux.subscribe("s2", "B", s2, None).unwrap();
        mux.subscribe("s3", "A", s3, None).unwrap();
        assert_eq!(mux.subscriber_count().await, 3);

        let mut server = links.recv().await.unwrap();
        assert_eq!(server.url, "ws://bm.test/video");
        let start = Instant::now();
        assert_eq!(server.next_selection().await.as_deref(), Some("A"));
        assert_eq!(server.next_selection().await.as_deref(), Some("B"));
        assert!(start.elapsed() >= Duration::from_millis(800));
        assert_eq!(server.next_selection().await.as_deref(), Some("A"));
        assert_eq!(mux.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn single_channel_selected_once() {
        let (mux, _connector, mut links) = spawn_mux();
        let (s1, _) = counting_sink();
        let (s2, _) = counting_sink();
        mux.subscribe("s1", "task/abc", s1, None).unwrap();
        let mut server = links.recv().await.unwrap();
        assert_eq!(server.next_selection().await.as_deref(), Some("task/abc"));

        mux.subscribe("s2", "task/abc", s2, None).unwrap();
        let more = timeout(Duration::from_secs(10), server.next_selection()).await;
        assert!(more.is_err(), "single-member cycle must not re-select");
        assert_eq!(mux.metrics().channel_switches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_after_consistent_run() {
        let (mux, _connector, mut links) = spawn_mux();
        let (sink, mut frames) = channel_sink();
        mux.subscribe("s1", "task/cam1", sink, None).unwrap();
        let mut server = links.recv().await.unwrap();
        server.next_selection().await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        server.send_frame("cam1").await;
        server.send_frame("cam1").await;

        let frame = timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.label.as_deref(), Some("cam1"));
        let snapshot = mux.metrics();
        assert_eq!(snapshot.frames.received, 2);
        assert_eq!(snapshot.frames.delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closes_upstream_when_last_subscriber_leaves() {
        let (mux, _connector, mut links) = spawn_mux();
        let (sink, _) = counting_sink();
        mux.subscribe("s1", "A", sink, None).unwrap();
        let mut server = links.recv().await.unwrap();
        server.next_selection().await;

        mux.unsubscribe("s1");
        mux.unsubscribe("s1");
        assert_eq!(mux.subscriber_count().await, 0);
        // Link dropped on the client side
        assert_eq!(server.outbound.recv().await, None);
        assert_eq!(mux.connection_state(), ConnectionState::Disconnected);

        // No reconnect while nobody is subscribed
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(links.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_unexpected_close() {
        let (mux, connector, mut links) = spawn_mux();
        let (sink, _) = counting_sink();
        mux.subscribe("s1", "A", sink, None).unwrap();
        let mut server = links.recv().await.unwrap();
        server.next_selection().await;

        server.close().await;
        let mut status = mux.status();
        status
            .wait_for(|s| s.state == ConnectionState::Disconnected)
            .await
            .unwrap();

        let mut server = links.recv().await.unwrap();
        assert_eq!(server.next_selection().await.as_deref(), Some("A"));
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_secs(3));
        assert_eq!(mux.metrics().connections.reconnects_scheduled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_is_retried() {
        let (mux, connector, mut links) = spawn_mux();
        connector.fail_next(2);
        let (sink, _) = counting_sink();
        mux.subscribe("s1", "A", sink, None).unwrap();

        let mut server = links.recv().await.unwrap();
        assert_eq!(server.next_selection().await.as_deref(), Some("A"));
        assert_eq!(connector.attempts().len(), 3);
        assert_eq!(mux.status().borrow().failed_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_error_forces_reconnect() {
        let (mux, connector, mut links) = spawn_mux();
        let (sink, _) = counting_sink();
        mux.subscribe("s1", "A", sink, None).unwrap();
        let mut server = links.recv().await.unwrap();
        server.next_selection().await;

        server
            .inbound
            .send(UpstreamEvent::Text(r#"{"error":"no such task"}"#.into()))
            .await
            .unwrap();
        let _server = links.recv().await.unwrap();
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(mux.metrics().errors.upstream, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_dropped() {
        let (mux, _connector, mut links) = spawn_mux();
        let (sink, mut frames) = channel_sink();
        mux.subscribe("s1", "A", sink, None).unwrap();
        let mut server = links.recv().await.unwrap();
        server.next_selection().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        server
            .inbound
            .send(UpstreamEvent::Text("{garbage".into()))
            .await
            .unwrap();
        server.send_frame("A").await;
        server.send_frame("A").await;
        assert!(frames.recv().await.is_some());
        assert_eq!(mux.metrics().errors.malformed, 1);
        assert_eq!(mux.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_from_inside_sink_is_deferred() {
        let (mux, _connector, mut links) = spawn_mux();
        let handle = mux.clone();
        let (s2, count2) = counting_sink();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_in_sink = calls.clone();
        let s1: SharedSink = Arc::new(move |_: &Frame| {
            calls_in_sink.fetch_add(1, Ordering::SeqCst);
            handle.unsubscribe("s1");
        });
        mux.subscribe("s1", "A", s1, None).unwrap();
        mux.subscribe("s2", "A", s2, None).unwrap();
        let mut server = links.recv().await.unwrap();
        server.next_selection().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        for _ in 0..4 {
            server.send_frame("A").await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mux.subscriber_count().await, 1);
        // s2 kept receiving within the same pass and afterwards
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 3);
    }
}
