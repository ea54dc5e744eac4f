//! Peer-side event loop.
//!
//! Everything the extension side does happens as a discrete reaction inside
//! [`PeerActor::handle_event`]: transport frames, timer expiry, heartbeat
//! ticks and shutdown are first turned into a [`PeerEvent`] by
//! [`PeerActor::next_event`], so no two reactions ever overlap.

pub mod process;

use serde_json::Value;
use std::io;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, Interval};

use crate::chunk::{assemble_inbound, ChunkEncoder, ChunkReassembler, ReassemblerConfig};
use crate::config::Config;
use crate::dispatch::{DispatchOutcome, DispatchSettings, Dispatcher, PageDriver};
use crate::liveness::LivenessForwarder;
use crate::protocol::{
    now_unix_ms, to_value, CommandFrame, EventFrame, HandshakeFrame, HostReady, InboundMessage,
    ResponseFrame, RpcFrame, SafetyLockTimeout,
};
use crate::reconnect::{BackoffConfig, ScheduleDecision};
use crate::session::{HandshakeState, HostReadyOutcome, Session, SessionIdentity};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A live link to the host. The link is gone once `inbound` yields `None`.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Value>,
    pub inbound: mpsc::UnboundedReceiver<Value>,
}

pub trait Connector {
    fn connect(&mut self) -> Result<Connection, TransportError>;
}

/// The far side of a [`ChannelConnector`] connection.
#[derive(Debug)]
pub struct RemoteEnd {
    pub tx: mpsc::UnboundedSender<Value>,
    pub rx: mpsc::UnboundedReceiver<Value>,
}

impl RemoteEnd {
    pub fn send(&self, value: Value) -> bool {
        self.tx.send(value).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// In-process transport: each [`ChannelListener::offer`] makes exactly one
/// connect attempt succeed.
pub struct ChannelConnector {
    queue: mpsc::UnboundedReceiver<Connection>,
}

#[derive(Clone)]
pub struct ChannelListener {
    queue: mpsc::UnboundedSender<Connection>,
}

pub fn channel_transport() -> (ChannelConnector, ChannelListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelConnector { queue: rx }, ChannelListener { queue: tx })
}

impl ChannelListener {
    pub fn offer(&self) -> RemoteEnd {
        let (to_peer, peer_inbound) = mpsc::unbounded_channel();
        let (peer_outbound, from_peer) = mpsc::unbounded_channel();
        let _ = self.queue.send(Connection {
            outbound: peer_outbound,
            inbound: peer_inbound,
        });
        RemoteEnd {
            tx: to_peer,
            rx: from_peer,
        }
    }
}

impl Connector for ChannelConnector {
    fn connect(&mut self) -> Result<Connection, TransportError> {
        self.queue
            .try_recv()
            .map_err(|_| TransportError::Unavailable("no host endpoint offered".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub profile_id: String,
    pub profile_alias: String,
    pub backoff: BackoffConfig,
    pub confirm_grace: Duration,
    pub heartbeat_interval: Duration,
    pub reassembler: ReassemblerConfig,
    pub dispatch: DispatchSettings,
    /// Outbound ceiling until the host announces its own.
    pub max_frame_bytes: usize,
}

impl PeerConfig {
    pub fn from_config(config: &Config, profile_id: impl Into<String>, profile_alias: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            profile_alias: profile_alias.into(),
            backoff: config.reconnect.backoff(),
            confirm_grace: Duration::from_millis(config.handshake.confirm_grace_ms),
            heartbeat_interval: Duration::from_millis(config.liveness.interval_ms),
            reassembler: config.chunks.reassembler(config.host.max_inbound_message_bytes),
            dispatch: DispatchSettings::from_config(config),
            max_frame_bytes: config.host.max_outbound_frame_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerNotice {
    HandshakeConfirmed { launch_id: String },
    Disconnected { previous: HandshakeState },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectAbandoned { attempts: u32 },
    SafetyLockTimeout { idle: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Inbound(Value),
    Disconnected,
    ReconnectDue,
    ConfirmDue,
    HeartbeatTick,
    TimerDue,
    Shutdown,
}

#[derive(Debug)]
enum PeerControl {
    Shutdown,
}

/// Owner-side handle. Dropping it stops the actor.
pub struct PeerHandle {
    control: mpsc::UnboundedSender<PeerControl>,
    notices: mpsc::UnboundedReceiver<PeerNotice>,
}

impl PeerHandle {
    pub fn shutdown(&self) {
        let _ = self.control.send(PeerControl::Shutdown);
    }

    pub async fn next_notice(&mut self) -> Option<PeerNotice> {
        self.notices.recv().await
    }
}

pub struct PeerActor<C, D> {
    connector: C,
    session: Session,
    identity: SessionIdentity,
    dispatcher: Dispatcher<D>,
    reassembler: ChunkReassembler,
    liveness: LivenessForwarder,
    ticker: Interval,
    connection: Option<Connection>,
    reconnect_at: Option<Instant>,
    confirm_at: Option<Instant>,
    confirm_grace: Duration,
    max_frame_bytes: usize,
    control: mpsc::UnboundedReceiver<PeerControl>,
    notices: mpsc::UnboundedSender<PeerNotice>,
    stopped: bool,
}

impl<C, D> PeerActor<C, D>
where
    C: Connector,
    D: PageDriver,
{
    /// Must be called from within a tokio runtime.
    pub fn new(connector: C, driver: D, config: PeerConfig) -> (Self, PeerHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let liveness = LivenessForwarder::new(config.heartbeat_interval);
        let ticker = liveness.ticker();
        let actor = Self {
            connector,
            session: Session::new(config.backoff),
            identity: SessionIdentity::generate(config.profile_id, config.profile_alias),
            dispatcher: Dispatcher::new(driver, config.dispatch),
            reassembler: ChunkReassembler::new(config.reassembler),
            liveness,
            ticker,
            connection: None,
            reconnect_at: None,
            confirm_at: None,
            confirm_grace: config.confirm_grace,
            max_frame_bytes: config.max_frame_bytes,
            control: control_rx,
            notices: notice_tx,
            stopped: false,
        };
        let handle = PeerHandle {
            control: control_tx,
            notices: notice_rx,
        };
        (actor, handle)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn dispatcher(&self) -> &Dispatcher<D> {
        &self.dispatcher
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Connects and processes events until shutdown, then hands the actor
    /// back for inspection.
    pub async fn run(mut self) -> Self {
        tracing::info!(
            profile_id = %self.identity.profile_id,
            launch_id = %self.identity.launch_id,
            "peer starting"
        );
        self.connect();
        while !self.stopped {
            let event = self.next_event().await;
            self.handle_event(event);
        }
        self
    }

    pub async fn next_event(&mut self) -> PeerEvent {
        let reconnect_at = self.reconnect_at;
        let confirm_at = self.confirm_at;
        let wake_at = self.dispatcher.next_wake();

        tokio::select! {
            biased;
            control = self.control.recv() => match control {
                Some(PeerControl::Shutdown) | None => PeerEvent::Shutdown,
            },
            // Ahead of inbound so a busy host cannot hold off lock expiry.
            _ = sleep_until_opt(wake_at) => PeerEvent::TimerDue,
            inbound = recv_inbound(&mut self.connection) => match inbound {
                Some(value) => PeerEvent::Inbound(value),
                None => PeerEvent::Disconnected,
            },
            _ = sleep_until_opt(confirm_at) => PeerEvent::ConfirmDue,
            _ = sleep_until_opt(reconnect_at) => PeerEvent::ReconnectDue,
            _ = self.ticker.tick() => PeerEvent::HeartbeatTick,
        }
    }

    pub fn handle_event(&mut self, event: PeerEvent) {
        let now = Instant::now();
        match event {
            PeerEvent::Inbound(value) => self.on_inbound(value, now),
            PeerEvent::Disconnected => self.on_disconnected(),
            PeerEvent::ReconnectDue => {
                self.reconnect_at = None;
                self.session.reconnect_mut().fire();
                self.connect();
            }
            PeerEvent::ConfirmDue => {
                self.confirm_at = None;
                self.send_confirm();
            }
            PeerEvent::HeartbeatTick => {
                self.reassembler.purge_stale(now.into_std());
                if let Some(frame) = self.liveness.on_tick(&self.session) {
                    self.send(to_value(&frame));
                }
            }
            PeerEvent::TimerDue => self.on_timer(now),
            PeerEvent::Shutdown => self.shutdown(),
        }
    }

    fn connect(&mut self) {
        if let Err(err) = self.session.begin_connect() {
            tracing::debug!(error = %err, "connect skipped");
            return;
        }
        match self.connector.connect() {
            Ok(connection) => {
                self.connection = Some(connection);
                match self.session.on_transport_connected(self.identity.clone()) {
                    Ok(frame) => {
                        tracing::info!(peer_id = %self.identity.peer_id, "transport connected, announcing peer");
                        self.send(to_value(&frame));
                    }
                    Err(err) => tracing::warn!(error = %err, "unexpected handshake state on connect"),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "connect failed");
                self.session.on_connect_failed();
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.session.reconnect_mut().schedule() {
            ScheduleDecision::Scheduled { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.reconnect_at = Some(Instant::now() + delay);
                self.notify(PeerNotice::ReconnectScheduled { attempt, delay });
            }
            ScheduleDecision::AlreadyPending => {
                tracing::debug!("reconnect already pending");
            }
            ScheduleDecision::Exhausted { attempts } => {
                tracing::error!(attempts, "reconnect attempts exhausted, giving up");
                self.notify(PeerNotice::ReconnectAbandoned { attempts });
            }
        }
    }

    fn on_disconnected(&mut self) {
        self.connection = None;
        self.confirm_at = None;
        let previous = self.session.on_disconnect();
        self.reassembler.clear();
        self.dispatcher.cancel_waits();
        tracing::warn!(previous = ?previous, "transport disconnected");
        self.notify(PeerNotice::Disconnected { previous });
        self.schedule_reconnect();
    }

    fn on_inbound(&mut self, value: Value, now: Instant) {
        let Some(message) = assemble_inbound(&self.reassembler, value, now.into_std()) else {
            return;
        };

        if !self.session.admits(&message) {
            tracing::warn!(
                kind = message.kind(),
                handshake = ?self.session.handshake_state(),
                "dropping frame received before host_ready"
            );
            return;
        }

        match message {
            InboundMessage::Handshake(HandshakeFrame::HostReady(ready)) => self.on_host_ready(ready, now),
            InboundMessage::Handshake(frame) => {
                tracing::warn!(command = frame.name(), "unexpected handshake frame from host");
            }
            InboundMessage::Command(command) => self.on_command(command, now),
            other => {
                tracing::debug!(kind = other.kind(), "ignoring frame");
            }
        }
    }

    fn on_host_ready(&mut self, ready: HostReady, now: Instant) {
        match self.session.on_host_ready(&ready) {
            Ok(HostReadyOutcome::Accepted) => {
                tracing::info!(
                    version = %ready.version,
                    max_message_size = ready.max_message_size,
                    "host ready"
                );
                if self.confirm_grace.is_zero() {
                    self.send_confirm();
                } else {
                    self.confirm_at = Some(now + self.confirm_grace);
                }
            }
            Ok(HostReadyOutcome::Ignored) => {}
            Err(err) => tracing::warn!(error = %err, "host_ready rejected"),
        }
    }

    fn send_confirm(&mut self) {
        match self.session.confirm() {
            Ok(frame) => {
                self.send(to_value(&frame));
                tracing::info!(launch_id = %self.identity.launch_id, "handshake confirmed");
                self.notify(PeerNotice::HandshakeConfirmed {
                    launch_id: self.identity.launch_id.clone(),
                });
            }
            Err(err) => tracing::warn!(error = %err, "handshake confirm skipped"),
        }
    }

    fn on_command(&mut self, command: CommandFrame, now: Instant) {
        match self.dispatcher.dispatch(&command, now) {
            DispatchOutcome::Respond(response) => self.send_response(response),
            DispatchOutcome::Pending => {
                tracing::debug!(id = %command.id, "command pending");
            }
        }
    }

    fn on_timer(&mut self, now: Instant) {
        let output = self.dispatcher.on_timer(now);
        for response in output.responses {
            self.send_response(response);
        }
        if let Some(idle) = output.lock_timeout {
            let frame = EventFrame::SafetyLockTimeout(SafetyLockTimeout {
                idle_ms: idle.as_millis() as u64,
                timestamp: now_unix_ms(),
            });
            self.send(to_value(&frame));
            self.notify(PeerNotice::SafetyLockTimeout { idle });
        }
    }

    fn send_response(&mut self, response: ResponseFrame) {
        self.send(to_value(&RpcFrame::Response(response)));
    }

    fn send(&mut self, value: Value) {
        let Some(connection) = &self.connection else {
            tracing::debug!("not connected, outbound frame dropped");
            return;
        };
        let limit = self
            .session
            .host_info()
            .map(|info| info.max_message_size)
            .unwrap_or(self.max_frame_bytes);
        let frames = match ChunkEncoder::encode_message(value, limit) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode outbound frame");
                return;
            }
        };
        let closed = frames
            .into_iter()
            .any(|frame| connection.outbound.send(frame).is_err());
        if closed {
            tracing::warn!("transport closed during send");
            self.on_disconnected();
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("peer shutting down");
        self.dispatcher.shutdown();
        self.connection = None;
        self.reconnect_at = None;
        self.confirm_at = None;
        self.stopped = true;
    }

    fn notify(&self, notice: PeerNotice) {
        let _ = self.notices.send(notice);
    }
}

async fn recv_inbound(connection: &mut Option<Connection>) -> Option<Value> {
    match connection {
        Some(connection) => connection.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkOutcome;
    use crate::dispatch::memory::{Element, MemoryPage};
    use serde_json::json;

    fn config(max_attempts: u32) -> PeerConfig {
        PeerConfig {
            profile_id: "profile-test".to_string(),
            profile_alias: "Test".to_string(),
            backoff: BackoffConfig {
                max_attempts,
                ..BackoffConfig::default()
            },
            confirm_grace: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(15),
            reassembler: ReassemblerConfig::default(),
            dispatch: DispatchSettings::default(),
            max_frame_bytes: 1024 * 1024,
        }
    }

    fn page() -> MemoryPage {
        let mut page = MemoryPage::new();
        page.insert_element(1, "#send", Element::button("Send"));
        page
    }

    fn host_ready(max_message_size: usize) -> Value {
        json!({
            "command": "host_ready",
            "capabilities": ["chunking"],
            "version": "test",
            "max_message_size": max_message_size
        })
    }

    fn command(name: &str, id: &str, target: Value, payload: Value) -> Value {
        json!({"type": "COMMAND", "command": name, "id": id, "target": target, "payload": payload})
    }

    /// Skips frames (heartbeats, mostly) until one satisfies `pred`.
    async fn recv_until<F>(remote: &mut RemoteEnd, pred: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(600), remote.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("peer closed the connection");
            if pred(&frame) {
                return frame;
            }
        }
    }

    async fn notice_until<F>(handle: &mut PeerHandle, pred: F) -> PeerNotice
    where
        F: Fn(&PeerNotice) -> bool,
    {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(600), handle.next_notice())
                .await
                .expect("timed out waiting for notice")
                .expect("actor stopped");
            if pred(&notice) {
                return notice;
            }
        }
    }

    /// Connected but not driven; the test pulls events itself.
    fn manual_peer(
        confirm_grace: Duration,
    ) -> (PeerActor<ChannelConnector, MemoryPage>, PeerHandle, RemoteEnd) {
        let (connector, listener) = channel_transport();
        let remote = listener.offer();
        let config = PeerConfig {
            confirm_grace,
            ..config(10)
        };
        let (mut actor, handle) = PeerActor::new(connector, page(), config);
        actor.connect();
        (actor, handle, remote)
    }

    async fn confirmed_peer(
        max_attempts: u32,
    ) -> (
        RemoteEnd,
        ChannelListener,
        PeerHandle,
        tokio::task::JoinHandle<PeerActor<ChannelConnector, MemoryPage>>,
    ) {
        let (connector, listener) = channel_transport();
        let mut remote = listener.offer();
        let (actor, handle) = PeerActor::new(connector, page(), config(max_attempts));
        let task = tokio::spawn(actor.run());

        let ready = recv_until(&mut remote, |f| f["command"] == "peer_ready").await;
        assert_eq!(ready["profile_id"], "profile-test");
        assert_eq!(ready["profile_alias"], "Test");

        remote.send(host_ready(1024 * 1024));
        let confirm = recv_until(&mut remote, |f| f["command"] == "handshake_confirm").await;
        assert_eq!(confirm["launch_id"], ready["launch_id"]);
        (remote, listener, handle, task)
    }

    #[tokio::test(start_paused = true)]
    async fn commands_before_host_ready_never_reach_the_dispatcher() {
        let (connector, listener) = channel_transport();
        let mut remote = listener.offer();
        let (actor, handle) = PeerActor::new(connector, page(), config(10));
        let task = tokio::spawn(actor.run());

        recv_until(&mut remote, |f| f["command"] == "peer_ready").await;
        remote.send(command("element-click", "early", json!({"selector": "#send"}), Value::Null));
        remote.send(host_ready(1024 * 1024));

        let next = recv_until(&mut remote, |f| f["event"] != "heartbeat").await;
        assert_eq!(next["command"], "handshake_confirm");

        handle.shutdown();
        let actor = task.await.unwrap();
        assert_eq!(actor.dispatcher().driver().element(1, "#send").unwrap().clicks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_waits_out_the_grace_period() {
        let (mut actor, _handle, mut remote) = manual_peer(Duration::from_millis(500));
        recv_until(&mut remote, |f| f["command"] == "peer_ready").await;

        let start = Instant::now();
        actor.handle_event(PeerEvent::Inbound(host_ready(1024 * 1024)));
        assert_eq!(actor.session().handshake_state(), HandshakeState::HostReady);
        assert_eq!(actor.confirm_at, Some(start + Duration::from_millis(500)));

        // Commands are served while the confirm is still pending.
        actor.handle_event(PeerEvent::Inbound(command(
            "element-click",
            "early-1",
            json!({"selector": "#send"}),
            Value::Null,
        )));
        let resp = recv_until(&mut remote, |f| f["type"] == "RESPONSE").await;
        assert_eq!(resp["id"], "early-1");
        assert_eq!(resp["payload"]["ok"], true);
        assert_eq!(actor.session().handshake_state(), HandshakeState::HostReady);

        let event = actor.next_event().await;
        assert_eq!(event, PeerEvent::ConfirmDue);
        assert!(start.elapsed() >= Duration::from_millis(500));
        actor.handle_event(event);

        assert_eq!(actor.session().handshake_state(), HandshakeState::Confirmed);
        assert_eq!(actor.confirm_at, None);
        let confirm = recv_until(&mut remote, |f| f["command"] == "handshake_confirm").await;
        assert_eq!(confirm["launch_id"], actor.identity().launch_id.as_str());
        assert_eq!(actor.dispatcher().driver().element(1, "#send").unwrap().clicks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_grace_cancels_the_confirm() {
        let (mut actor, mut handle, mut remote) = manual_peer(Duration::from_secs(5));
        recv_until(&mut remote, |f| f["command"] == "peer_ready").await;
        actor.handle_event(PeerEvent::Inbound(host_ready(1024 * 1024)));
        assert!(actor.confirm_at.is_some());

        drop(remote);
        let event = actor.next_event().await;
        assert_eq!(event, PeerEvent::Disconnected);
        actor.handle_event(event);
        assert_eq!(actor.confirm_at, None);
        assert_eq!(actor.session().handshake_state(), HandshakeState::None);

        // 1 + 2 + 4 seconds of backoff outlasts the grace period.
        for _ in 0..3 {
            let event = actor.next_event().await;
            assert_eq!(event, PeerEvent::ReconnectDue);
            actor.handle_event(event);
        }
        assert_eq!(actor.session().handshake_state(), HandshakeState::None);

        drop(actor);
        while let Some(notice) = handle.next_notice().await {
            assert!(!matches!(notice, PeerNotice::HandshakeConfirmed { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn due_lock_timeout_is_not_starved_by_inbound_traffic() {
        let (mut actor, _handle, mut remote) = manual_peer(Duration::ZERO);
        recv_until(&mut remote, |f| f["command"] == "peer_ready").await;
        actor.handle_event(PeerEvent::Inbound(host_ready(1024 * 1024)));
        actor.handle_event(PeerEvent::Inbound(command("ui-lock", "lock-1", Value::Null, Value::Null)));
        assert!(actor.dispatcher().safety_lock().is_active());

        time::advance(Duration::from_secs(30)).await;
        for n in 0..50 {
            remote.send(command(
                "element-click",
                &format!("flood-{n}"),
                json!({"selector": "#send"}),
                Value::Null,
            ));
        }

        let event = actor.next_event().await;
        assert_eq!(event, PeerEvent::TimerDue);
        actor.handle_event(event);
        assert!(!actor.dispatcher().safety_lock().is_active());
        let timeout = recv_until(&mut remote, |f| f["event"] == "safety_lock_timeout").await;
        assert_eq!(timeout["idle_ms"], 30_000);

        assert!(matches!(actor.next_event().await, PeerEvent::Inbound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_peer_answers_commands_with_correlated_responses() {
        let (mut remote, _listener, handle, task) = confirmed_peer(10).await;

        remote.send(command("element-click", "c-1", json!({"selector": "#send"}), Value::Null));
        let resp = recv_until(&mut remote, |f| f["type"] == "RESPONSE").await;
        assert_eq!(resp["id"], "c-1");
        assert_eq!(resp["payload"]["ok"], true);

        remote.send(command("do-a-barrel-roll", "c-2", Value::Null, Value::Null));
        let resp = recv_until(&mut remote, |f| f["type"] == "RESPONSE").await;
        assert_eq!(resp["id"], "c-2");
        assert_eq!(resp["payload"]["code"], "unsupported");

        handle.shutdown();
        let actor = task.await.unwrap();
        assert_eq!(actor.dispatcher().driver().element(1, "#send").unwrap().clicks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chunked_commands_are_reassembled_before_dispatch() {
        let (mut remote, _listener, handle, task) = confirmed_peer(10).await;

        let big = command(
            "element-click",
            "big-1",
            json!({"selector": "#send"}),
            json!({"padding": "p".repeat(20_000)}),
        );
        for frame in ChunkEncoder::encode_message(big, 4096).unwrap() {
            remote.send(frame);
        }
        let resp = recv_until(&mut remote, |f| f["type"] == "RESPONSE").await;
        assert_eq!(resp["id"], "big-1");
        assert_eq!(resp["payload"]["ok"], true);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_flow_once_confirmed() {
        let (mut remote, _listener, handle, task) = confirmed_peer(10).await;
        let hb = recv_until(&mut remote, |f| f["event"] == "heartbeat").await;
        assert_eq!(hb["profile_id"], "profile-test");
        assert_eq!(hb["status"], "alive");
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_triggers_one_lock_timeout() {
        let (mut remote, _listener, mut handle, task) = confirmed_peer(10).await;

        remote.send(command("ui-lock", "lock-1", Value::Null, json!({"reason": "agent run"})));
        let resp = recv_until(&mut remote, |f| f["type"] == "RESPONSE").await;
        assert_eq!(resp["payload"]["result"]["locked"], true);

        let event = recv_until(&mut remote, |f| f["event"] == "safety_lock_timeout").await;
        assert!(event["idle_ms"].as_u64().unwrap() >= 30_000);
        let notice = notice_until(&mut handle, |n| matches!(n, PeerNotice::SafetyLockTimeout { .. })).await;
        assert_eq!(
            notice,
            PeerNotice::SafetyLockTimeout {
                idle: Duration::from_secs(30)
            }
        );

        handle.shutdown();
        let actor = task.await.unwrap();
        assert!(!actor.dispatcher().driver().is_interaction_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_survives_disconnect_and_still_expires() {
        let (mut remote, listener, mut handle, task) = confirmed_peer(10).await;

        remote.send(command("ui-lock", "lock-1", Value::Null, Value::Null));
        recv_until(&mut remote, |f| f["type"] == "RESPONSE").await;
        drop(remote);

        let notice = notice_until(&mut handle, |n| matches!(n, PeerNotice::Disconnected { .. })).await;
        assert_eq!(
            notice,
            PeerNotice::Disconnected {
                previous: HandshakeState::Confirmed
            }
        );

        let mut remote = listener.offer();
        recv_until(&mut remote, |f| f["command"] == "peer_ready").await;

        notice_until(&mut handle, |n| matches!(n, PeerNotice::SafetyLockTimeout { .. })).await;
        handle.shutdown();
        let actor = task.await.unwrap();
        assert!(!actor.dispatcher().safety_lock().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backs_off_then_gives_up() {
        let (mut remote, _listener, mut handle, task) = confirmed_peer(3).await;
        drop(remote);

        let mut delays = Vec::new();
        let abandoned = loop {
            match handle.next_notice().await.unwrap() {
                PeerNotice::ReconnectScheduled { delay, .. } => delays.push(delay),
                PeerNotice::ReconnectAbandoned { attempts } => break attempts,
                _ => {}
            }
        };
        assert_eq!(abandoned, 3);
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        // The actor stays up after giving up.
        handle.shutdown();
        let actor = task.await.unwrap();
        assert!(actor.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_backoff() {
        let (remote, listener, mut handle, task) = confirmed_peer(10).await;
        drop(remote);
        notice_until(&mut handle, |n| matches!(n, PeerNotice::ReconnectScheduled { attempt: 1, .. })).await;
        notice_until(&mut handle, |n| matches!(n, PeerNotice::ReconnectScheduled { attempt: 2, .. })).await;

        let mut remote = listener.offer();
        recv_until(&mut remote, |f| f["command"] == "peer_ready").await;
        remote.send(host_ready(4096));
        recv_until(&mut remote, |f| f["command"] == "handshake_confirm").await;
        drop(remote);

        let notice = notice_until(&mut handle, |n| matches!(n, PeerNotice::ReconnectScheduled { .. })).await;
        assert_eq!(
            notice,
            PeerNotice::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn large_responses_are_chunked_to_the_host_limit() {
        let (connector, listener) = channel_transport();
        let mut remote = listener.offer();
        let mut page = page();
        page.insert_element(1, "#article", Element::text(&"lorem ipsum ".repeat(2_000)));
        let (actor, handle) = PeerActor::new(connector, page, config(10));
        let task = tokio::spawn(actor.run());

        recv_until(&mut remote, |f| f["command"] == "peer_ready").await;
        remote.send(host_ready(4096));
        recv_until(&mut remote, |f| f["command"] == "handshake_confirm").await;

        remote.send(command("element-read", "read-1", json!({"selector": "#article"}), Value::Null));
        let reassembler = ChunkReassembler::default();
        let bytes = loop {
            let frame = recv_until(&mut remote, |f| f.get("chunk").is_some()).await;
            assert!(serde_json::to_vec(&frame).unwrap().len() <= 4096);
            if let ChunkOutcome::CompleteValid(bytes) = reassembler.process(&frame) {
                break bytes;
            }
        };
        let resp: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(resp["id"], "read-1");
        assert_eq!(resp["payload"]["ok"], true);

        handle.shutdown();
        task.await.unwrap();
    }
}
