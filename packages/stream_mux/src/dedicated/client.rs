use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{self, Inbound};
use crate::config::{BackoffConfig, Endpoint};
use crate::error::StreamError;
use crate::frame::{Frame, SharedSink, channel_key, normalize_label};
use crate::metrics::FrameRateMeter;
use crate::status::{SessionState, SessionStatus};
use crate::timer::Deadline;
use crate::transport::{Connector, UpstreamEvent, UpstreamLink, next_event};

use super::backoff::Backoff;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Everything a dedicated client needs besides its transport and sink.
#[derive(Debug, Clone)]
pub struct DedicatedOptions {
    pub endpoint: Endpoint,
    pub backoff: BackoffConfig,
    /// Channel to play; `None` starts idle
    pub channel: Option<String>,
    /// Labeled frames reporting anything else are dropped. Defaults to the
    /// `task/`-stripped channel key.
    pub expected_label: Option<String>,
    /// Frames arriving this soon after an in-place switch are dropped
    pub settling_period: Duration,
    /// Connect right away when a channel is given
    pub auto_connect: bool,
}

enum ClientCommand {
    SetChannel(String),
    Retry,
    Close,
}

/// Handle to a consumer-owned upstream connection.
///
/// The session reconnects with exponential backoff on transport failure and
/// parks in [`SessionState::Error`] once retries are exhausted.
#[derive(Clone)]
pub struct DedicatedClient {
    sender: mpsc::UnboundedSender<ClientCommand>,
    status: watch::Receiver<SessionStatus>,
    session_id: Uuid,
}

impl DedicatedClient {
    pub fn spawn(options: DedicatedOptions, connector: Arc<dyn Connector>, sink: SharedSink) -> Self {
        let session_id = Uuid::new_v4();
        let (sender, commands) = mpsc::unbounded_channel();
        let (status_tx, status) =
            watch::channel(SessionStatus::new(session_id, options.channel.clone()));
        let (connect_tx, connect_results) = mpsc::unbounded_channel();

        let actor = ClientActor {
            session_id,
            endpoint: options.endpoint,
            connector,
            sink,
            expected_label: options
                .expected_label
                .as_deref()
                .and_then(normalize_label)
                .or_else(|| options.channel.as_deref().and_then(default_label)),
            channel: options.channel,
            settling_period: options.settling_period,
            switched_at: None,
            backoff: Backoff::new(options.backoff),
            commands,
            link: None,
            generation: 0,
            connect_tx,
            connect_results,
            reconnect_timer: Deadline::new(),
            meter: FrameRateMeter::new(),
            status: status_tx,
        };
        tokio::spawn(actor.run(options.auto_connect));

        Self {
            sender,
            status,
            session_id,
        }
    }

    /// Switch to another channel, in place when the endpoint allows it.
    /// The expected label follows the new channel's key.
    pub fn set_channel(&self, channel: impl Into<String>) -> Result<(), StreamError> {
        self.sender
            .send(ClientCommand::SetChannel(channel.into()))
            .map_err(|_| StreamError::Closed)
    }

    /// Manual retry: resets the backoff and reconnects immediately.
    pub fn retry(&self) -> Result<(), StreamError> {
        self.sender
            .send(ClientCommand::Retry)
            .map_err(|_| StreamError::Closed)
    }

    /// Close the socket and stop. Pending reconnects are cancelled.
    pub fn close(&self) {
        let _ = self.sender.send(ClientCommand::Close);
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

type ConnectResult = (u64, Result<UpstreamLink, StreamError>);

struct ClientActor {
    session_id: Uuid,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    sink: SharedSink,
    expected_label: Option<String>,
    channel: Option<String>,
    settling_period: Duration,
    /// Set by an in-place switch; frames still in flight for the old channel
    /// arrive inside the settling window
    switched_at: Option<Instant>,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    link: Option<UpstreamLink>,
    /// Bumped on every teardown so trailing results of an old socket are ignored
    generation: u64,
    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_results: mpsc::UnboundedReceiver<ConnectResult>,
    reconnect_timer: Deadline,
    meter: FrameRateMeter,
    status: watch::Sender<SessionStatus>,
}

impl ClientActor {
    async fn run(mut self, auto_connect: bool) {
        info!(session = %self.session_id, channel = ?self.channel, "dedicated client started");
        if auto_connect && self.channel.is_some() {
            self.connect();
        }

        let mut fps_tick = tokio::time::interval_at(Instant::now() + FPS_WINDOW, FPS_WINDOW);
        fps_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(ClientCommand::SetChannel(channel)) => self.set_channel(channel),
                    Some(ClientCommand::Retry) => self.manual_retry(),
                    Some(ClientCommand::Close) | None => break,
                },
                Some((generation, result)) = self.connect_results.recv() => {
                    self.on_connect_result(generation, result);
                }
                event = next_event(&mut self.link) => self.on_upstream(event),
                () = self.reconnect_timer.fired() => self.connect(),
                _ = fps_tick.tick() => self.publish_fps(),
            }
        }

        self.teardown();
        self.status.send_modify(|s| {
            s.state = SessionState::Idle;
            s.fps = 0;
        });
        info!(session = %self.session_id, "dedicated client closed");
    }

    fn connect(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        self.teardown();
        self.set_state(SessionState::Connecting);

        let generation = self.generation;
        let url = self.endpoint.url_for(&channel);
        let connector = self.connector.clone();
        let results = self.connect_tx.clone();
        debug!(
            session = %self.session_id,
            url = %url,
            attempt = self.backoff.retry_count(),
            "connecting"
        );
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
        match result {
            Ok(link) => {
                info!(session = %self.session_id, channel = ?self.channel, "connected");
                self.link = Some(link);
                if !self.endpoint.channel_in_url() {
                    if let Some(channel) = self.channel.clone() {
                        self.send_selection(&channel);
                    }
                }
            }
            Err(e) => self.on_failure(e.to_string()),
        }
    }

    fn on_upstream(&mut self, event: UpstreamEvent) {
        let decoded = match event {
            UpstreamEvent::Text(text) => codec::decode_text(&text),
            UpstreamEvent::Binary(data) => codec::decode_binary(data),
            UpstreamEvent::Closed { reason } => {
                self.on_failure(reason.unwrap_or_else(|| "connection closed".to_string()));
                return;
            }
        };

        match decoded {
            Ok(Inbound::Frame(frame)) => self.on_frame(frame),
            Ok(Inbound::KeepAlive) => {}
            Ok(Inbound::UpstreamError(message)) => {
                warn!(session = %self.session_id, error = %message, "upstream reported an error");
                self.on_failure(message);
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "skipping malformed payload");
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if self.status.borrow().state != SessionState::Playing {
            info!(session = %self.session_id, channel = ?self.channel, "playing");
            self.backoff.reset();
            self.status.send_modify(|s| {
                s.state = SessionState::Playing;
                s.retry_count = 0;
                s.last_error = None;
            });
        }

        if self
            .switched_at
            .is_some_and(|at| Instant::now() < at + self.settling_period)
        {
            debug!(session = %self.session_id, "dropping frame inside settling window");
            return;
        }
        if let (Some(expected), Some(label)) = (&self.expected_label, &frame.label) {
            if expected != label {
                debug!(session = %self.session_id, label = %label, "dropping frame for another label");
                return;
            }
        }

        self.meter.record();
        self.sink.deliver(&frame);
    }

    fn on_failure(&mut self, reason: String) {
        self.teardown();
        match self.backoff.next() {
            Some(delay) => {
                let retry_count = self.backoff.retry_count();
                warn!(
                    session = %self.session_id,
                    reason = %reason,
                    attempt = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "connection lost, scheduling reconnect"
                );
                self.reconnect_timer.arm(delay);
                self.status.send_modify(|s| {
                    s.state = SessionState::Reconnecting;
                    s.retry_count = retry_count;
                    s.last_error = Some(reason);
                });
            }
            None => {
                warn!(
                    session = %self.session_id,
                    reason = %reason,
                    retries = self.backoff.retry_count(),
                    "retries exhausted, giving up"
                );
                self.status.send_modify(|s| {
                    s.state = SessionState::Error;
                    s.retry_count = self.backoff.retry_count();
                    s.last_error = Some(reason);
                });
            }
        }
    }

    fn set_channel(&mut self, channel: String) {
        if self.channel.as_deref() == Some(channel.as_str()) && self.link.is_some() {
            return;
        }
        debug!(session = %self.session_id, channel = %channel, "channel reassigned");
        self.expected_label = default_label(&channel);
        self.channel = Some(channel.clone());
        self.status.send_modify(|s| s.channel = Some(channel.clone()));

        if self.link.is_some() && !self.endpoint.channel_in_url() {
            self.switched_at = Some(Instant::now());
            self.send_selection(&channel);
            return;
        }
        self.backoff.reset();
        self.status.send_modify(|s| s.retry_count = 0);
        self.connect();
    }

    fn manual_retry(&mut self) {
        info!(session = %self.session_id, "manual retry");
        self.backoff.reset();
        self.status.send_modify(|s| {
            s.retry_count = 0;
            s.last_error = None;
        });
        if self.channel.is_some() {
            self.connect();
        } else {
            self.teardown();
            self.set_state(SessionState::Idle);
        }
    }

    fn send_selection(&self, channel: &str) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        debug!(session = %self.session_id, channel = %channel, "selecting channel");
        if !link.send_text(codec::encode_select(channel)) {
            warn!(session = %self.session_id, channel = %channel, "failed to queue channel selection");
        }
    }

    fn publish_fps(&mut self) {
        let fps = self.meter.tick();
        self.status.send_if_modified(|s| {
            if s.fps == fps {
                return false;
            }
            s.fps = fps;
            true
        });
    }

    /// Drop the socket and any pending reconnect.
    fn teardown(&mut self) {
        self.link = None;
        self.switched_at = None;
        self.generation += 1;
        self.reconnect_timer.cancel();
    }

    fn set_state(&self, state: SessionState) {
        self.status.send_if_modified(|s| {
            if s.state == state {
                return false;
            }
            s.state = state;
            true
        });
    }
}

fn default_label(channel: &str) -> Option<String> {
    normalize_label(&channel_key(channel))
}
