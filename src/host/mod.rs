//! Native messaging host.
//!
//! The browser launches the host and talks to it over stdio with
//! little-endian length-prefixed JSON. Inbound frames are reassembled and
//! gated by a host-role [`Session`]; admitted traffic is relayed to the local
//! service over a TCP link that reconnects on its own. Everything written
//! back to the browser goes through one writer task that chunks frames above
//! the browser's size limit.

use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::chunk::{assemble_inbound, ChunkEncoder, ChunkReassembler, ReassemblerConfig};
use crate::config::Config;
use crate::liveness::{relay_decision, RelayDecision};
use crate::protocol::{
    read_json_frame, to_value, write_json_frame, EventFrame, FrameError, HandshakeFrame, HostReady,
    InboundMessage, LengthPrefix, PeerReady, RegisterHost, BRIDGE_VERSION,
};
use crate::reconnect::{BackoffConfig, ReconnectPolicy, ScheduleDecision};
use crate::session::{HandshakeState, Session};
use crate::telemetry::SessionLogs;

#[derive(Debug, Clone)]
pub struct HostSettings {
    /// `None` runs the host without a service link.
    pub service_addr: Option<String>,
    pub service_backoff: BackoffConfig,
    pub max_inbound_bytes: usize,
    pub max_outbound_bytes: usize,
    pub capabilities: Vec<String>,
    pub reassembler: ReassemblerConfig,
    pub logs_root: PathBuf,
    pub telemetry_refresh: Duration,
    pub profile_hint: Option<String>,
}

impl HostSettings {
    pub fn from_config(config: &Config, profile_hint: Option<String>) -> Self {
        let host = &config.host;
        Self {
            service_addr: Some(host.service_addr.clone()),
            service_backoff: host.service_reconnect.backoff(),
            max_inbound_bytes: host.max_inbound_message_bytes,
            max_outbound_bytes: host.max_outbound_frame_bytes,
            capabilities: host.capabilities.clone(),
            reassembler: config.chunks.reassembler(host.max_inbound_message_bytes),
            logs_root: config.logging.dir_path(),
            telemetry_refresh: Duration::from_secs(config.logging.telemetry_refresh_secs),
            profile_hint,
        }
    }
}

/// Runs the host on the process stdio until the browser closes stdin or the
/// process is interrupted.
pub async fn run_native_host(settings: HostSettings) -> io::Result<()> {
    tracing::info!(
        pid = std::process::id(),
        version = BRIDGE_VERSION,
        profile_hint = ?settings.profile_hint,
        "native host starting"
    );
    tokio::select! {
        result = run_session_io(tokio::io::stdin(), tokio::io::stdout(), settings) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, native host exiting");
            Ok(())
        }
    }
}

/// Drives one browser session over `reader`/`writer`. Returns once the
/// browser side reaches end of stream.
pub async fn run_session_io<R, W>(reader: R, writer: W, settings: HostSettings) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let reassembler = Arc::new(ChunkReassembler::new(settings.reassembler.clone()));

    let (chrome_tx, chrome_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(chrome_writer(writer, chrome_rx, settings.max_outbound_bytes));

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(chrome_reader(
        reader,
        reassembler.clone(),
        inbound_tx,
        settings.max_inbound_bytes,
    ));

    let mut host = HostSession::new(settings, chrome_tx, reassembler);
    loop {
        tokio::select! {
            message = inbound_rx.recv() => match message {
                Some(message) => host.on_chrome_message(message),
                None => break,
            },
            frame = host.next_service_frame() => host.on_service_frame(frame),
        }
    }

    host.close();
    drop(host);
    let _ = reader_task.await;
    if let Err(err) = writer_task.await {
        tracing::warn!(error = %err, "chrome writer task failed");
    }
    Ok(())
}

async fn chrome_reader<R>(
    mut reader: R,
    reassembler: Arc<ChunkReassembler>,
    tx: mpsc::UnboundedSender<InboundMessage>,
    max_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_json_frame(&mut reader, LengthPrefix::LittleEndian, max_bytes).await {
            Ok(Some(value)) => {
                let Some(message) = assemble_inbound(&reassembler, value, Instant::now()) else {
                    continue;
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!("chrome closed stdin");
                break;
            }
            Err(err) if err.is_recoverable() => {
                tracing::warn!(error = %err, "dropping unreadable frame from chrome");
            }
            Err(err) => {
                tracing::error!(error = %err, "chrome stdin failed");
                break;
            }
        }
    }
}

async fn chrome_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>, max_bytes: usize)
where
    W: AsyncWrite + Unpin,
{
    while let Some(value) = rx.recv().await {
        let frames = match ChunkEncoder::encode_message(value, max_bytes) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode frame for chrome");
                continue;
            }
        };
        for frame in frames {
            match write_json_frame(&mut writer, LengthPrefix::LittleEndian, &frame, max_bytes).await {
                Ok(()) => {}
                Err(FrameError::Io(err)) => {
                    tracing::warn!(error = %err, "chrome stdout closed");
                    return;
                }
                Err(err) => tracing::warn!(error = %err, "frame for chrome dropped"),
            }
        }
    }
}

struct HostSession {
    settings: HostSettings,
    session: Session,
    reassembler: Arc<ChunkReassembler>,
    chrome: mpsc::UnboundedSender<Value>,
    service: Option<ServiceLink>,
    logs: SessionLogs,
}

impl HostSession {
    fn new(
        settings: HostSettings,
        chrome: mpsc::UnboundedSender<Value>,
        reassembler: Arc<ChunkReassembler>,
    ) -> Self {
        let logs = SessionLogs::new(settings.logs_root.clone(), settings.telemetry_refresh);
        let mut host = Self {
            session: Session::new(settings.service_backoff.clone()),
            settings,
            reassembler,
            chrome,
            service: None,
            logs,
        };
        if let Some(profile_id) = host.settings.profile_hint.clone() {
            host.ensure_service_link(&profile_id);
        }
        host
    }

    fn on_chrome_message(&mut self, message: InboundMessage) {
        if !self.session.admits(&message) {
            tracing::warn!(
                kind = message.kind(),
                handshake = ?self.session.handshake_state(),
                "dropping frame received before peer_ready"
            );
            return;
        }

        match message {
            InboundMessage::Handshake(HandshakeFrame::PeerReady(ready)) => self.on_peer_ready(ready),
            InboundMessage::Handshake(HandshakeFrame::HandshakeConfirm(confirm)) => {
                match self.session.on_confirm(&confirm) {
                    Ok(()) => {
                        tracing::info!(
                            profile_id = %confirm.profile_id,
                            launch_id = %confirm.launch_id,
                            "handshake confirmed"
                        );
                        self.logs.log_host("INFO", "handshake confirmed");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "handshake_confirm rejected");
                        self.logs.log_host("WARN", &format!("handshake_confirm rejected: {err}"));
                    }
                }
            }
            InboundMessage::Handshake(frame) => {
                tracing::warn!(command = frame.name(), "unexpected handshake frame from peer");
            }
            InboundMessage::Event(EventFrame::Heartbeat(heartbeat)) => {
                match relay_decision(&self.session, &heartbeat) {
                    RelayDecision::Relay => {
                        self.forward_to_service(to_value(&EventFrame::Heartbeat(heartbeat)))
                    }
                    decision => tracing::warn!(
                        decision = ?decision,
                        launch_id = %heartbeat.launch_id,
                        "heartbeat not relayed"
                    ),
                }
            }
            InboundMessage::Event(EventFrame::Log(log)) => {
                self.logs
                    .log_extension(&log.level, &log.message, log.timestamp.as_deref());
            }
            other => self.forward_to_service(other.into_value()),
        }
    }

    fn on_peer_ready(&mut self, ready: PeerReady) {
        if let Err(err) = self.session.on_peer_ready(&ready) {
            tracing::warn!(error = %err, "peer_ready rejected");
            self.logs.log_host("WARN", &format!("peer_ready rejected: {err}"));
            return;
        }
        if let Err(err) = self.logs.open(&ready.profile_id, &ready.launch_id) {
            tracing::warn!(error = %err, "failed to open session logs");
        }
        self.logs.log_host(
            "INFO",
            &format!(
                "peer_ready profile={} launch={} peer={}",
                ready.profile_id, ready.launch_id, ready.peer_id
            ),
        );

        let reply = HandshakeFrame::HostReady(HostReady {
            capabilities: self.settings.capabilities.clone(),
            version: BRIDGE_VERSION.to_string(),
            max_message_size: self.settings.max_outbound_bytes,
        });
        if self.chrome.send(to_value(&reply)).is_err() {
            tracing::warn!("chrome writer gone, host_ready not sent");
            return;
        }
        if let Err(err) = self.session.mark_host_ready_sent() {
            tracing::warn!(error = %err, "host_ready out of order");
        }
        self.ensure_service_link(&ready.profile_id);
    }

    fn ensure_service_link(&mut self, profile_id: &str) {
        if let Some(link) = &self.service {
            if link.profile_id != profile_id {
                tracing::warn!(
                    registered = %link.profile_id,
                    announced = %profile_id,
                    "peer profile differs from the registered one"
                );
            }
            return;
        }
        let Some(addr) = self.settings.service_addr.clone() else {
            return;
        };
        self.service = Some(ServiceLink::spawn(
            addr,
            self.settings.service_backoff.clone(),
            RegisterHost::new(profile_id),
            self.settings.max_inbound_bytes,
        ));
    }

    fn forward_to_service(&mut self, frame: Value) {
        match &self.service {
            Some(link) => link.send(frame),
            None => tracing::debug!("no service link, frame dropped"),
        }
    }

    async fn next_service_frame(&mut self) -> Option<Value> {
        match self.service.as_mut() {
            Some(link) => link.recv().await,
            None => std::future::pending().await,
        }
    }

    fn on_service_frame(&mut self, frame: Option<Value>) {
        let Some(frame) = frame else {
            tracing::error!("service link stopped");
            self.logs.log_host("ERROR", "service link stopped");
            self.service = None;
            return;
        };
        match self.session.handshake_state() {
            HandshakeState::HostReady | HandshakeState::Confirmed => {
                if self.chrome.send(frame).is_err() {
                    tracing::warn!("chrome writer gone, service frame dropped");
                }
            }
            state => tracing::warn!(handshake = ?state, "service frame dropped before handshake"),
        }
    }

    fn close(&mut self) {
        let previous = self.session.on_disconnect();
        self.reassembler.clear();
        self.logs.log_host("INFO", "chrome disconnected, host exiting");
        tracing::info!(previous = ?previous, "chrome session ended");
        if let Some(link) = self.service.take() {
            link.shutdown();
        }
    }
}

/// TCP connection to the local service. The link task owns the socket,
/// registers on every connect and reconnects with backoff.
pub struct ServiceLink {
    profile_id: String,
    outbound: mpsc::UnboundedSender<Value>,
    inbound: mpsc::UnboundedReceiver<Value>,
    task: JoinHandle<()>,
}

impl ServiceLink {
    pub fn spawn(
        addr: String,
        backoff: BackoffConfig,
        registration: RegisterHost,
        max_frame_bytes: usize,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let profile_id = registration.profile_id.clone();
        let task = tokio::spawn(service_loop(
            addr,
            backoff,
            to_value(&registration),
            outbound_rx,
            inbound_tx,
            max_frame_bytes,
        ));
        Self {
            profile_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
            task,
        }
    }

    pub fn send(&self, frame: Value) {
        if self.outbound.send(frame).is_err() {
            tracing::debug!("service link task gone, frame dropped");
        }
    }

    /// `None` once the link task has given up.
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbound.recv().await
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

enum LinkEnd {
    Disconnected,
    OwnerGone,
}

async fn service_loop(
    addr: String,
    backoff: BackoffConfig,
    registration: Value,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    inbound: mpsc::UnboundedSender<Value>,
    max_frame_bytes: usize,
) {
    let mut policy = ReconnectPolicy::new(backoff);
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                policy.reset();
                tracing::info!(addr = %addr, "service link connected");
                let end = pump(stream, &registration, &mut outbound, &inbound, max_frame_bytes).await;
                if let LinkEnd::OwnerGone = end {
                    return;
                }
                tracing::warn!(addr = %addr, "service link disconnected");
            }
            Err(err) => tracing::warn!(addr = %addr, error = %err, "service connect failed"),
        }

        match policy.schedule() {
            ScheduleDecision::Scheduled { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "service reconnect scheduled");
                if !discard_until(time::Instant::now() + delay, &mut outbound).await {
                    return;
                }
                policy.fire();
            }
            ScheduleDecision::AlreadyPending => policy.fire(),
            ScheduleDecision::Exhausted { attempts } => {
                tracing::error!(attempts, "service reconnect attempts exhausted");
                return;
            }
        }
    }
}

/// Sleeps until `deadline`, dropping frames queued while the link is down.
/// Returns `false` if the owner went away meanwhile.
async fn discard_until(deadline: time::Instant, outbound: &mut mpsc::UnboundedReceiver<Value>) -> bool {
    let sleep = time::sleep_until(deadline);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            frame = outbound.recv() => match frame {
                Some(_) => tracing::debug!("service link down, frame dropped"),
                None => return false,
            },
        }
    }
}

async fn pump(
    stream: TcpStream,
    registration: &Value,
    outbound: &mut mpsc::UnboundedReceiver<Value>,
    inbound: &mpsc::UnboundedSender<Value>,
    max_frame_bytes: usize,
) -> LinkEnd {
    let (read_half, mut write_half) = stream.into_split();
    if let Err(err) =
        write_json_frame(&mut write_half, LengthPrefix::BigEndian, registration, max_frame_bytes).await
    {
        tracing::warn!(error = %err, "service registration failed");
        return LinkEnd::Disconnected;
    }

    let mut reader = tokio::spawn(service_reader(read_half, inbound.clone(), max_frame_bytes));
    let end = loop {
        tokio::select! {
            _ = &mut reader => break LinkEnd::Disconnected,
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break LinkEnd::OwnerGone;
                };
                match write_json_frame(&mut write_half, LengthPrefix::BigEndian, &frame, max_frame_bytes).await {
                    Ok(()) => {}
                    Err(err) if err.is_recoverable() => {
                        tracing::warn!(error = %err, "frame for service dropped");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "service write failed");
                        break LinkEnd::Disconnected;
                    }
                }
            }
        }
    };
    reader.abort();
    end
}

async fn service_reader(
    mut reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Value>,
    max_frame_bytes: usize,
) {
    loop {
        match read_json_frame(&mut reader, LengthPrefix::BigEndian, max_frame_bytes).await {
            Ok(Some(frame)) => {
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) if err.is_recoverable() => {
                tracing::warn!(error = %err, "dropping unreadable frame from service");
            }
            Err(err) => {
                tracing::warn!(error = %err, "service read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkOutcome;
    use serde_json::json;
    use std::path::Path;
    use tokio::io::{split, DuplexStream};
    use tokio::net::TcpListener;

    const TEST_OUTBOUND: usize = 4096;

    fn settings(logs: &Path, service_addr: Option<String>) -> HostSettings {
        HostSettings {
            service_addr,
            service_backoff: BackoffConfig {
                base_delay: Duration::from_millis(10),
                growth: 2.0,
                exponent_cap: 3,
                max_attempts: 0,
            },
            max_inbound_bytes: 1024 * 1024,
            max_outbound_bytes: TEST_OUTBOUND,
            capabilities: vec!["chunking".to_string(), "heartbeat".to_string()],
            reassembler: ReassemblerConfig::default(),
            logs_root: logs.to_path_buf(),
            telemetry_refresh: Duration::from_secs(30),
            profile_hint: None,
        }
    }

    fn spawn_test_host(settings: HostSettings) -> (DuplexStream, JoinHandle<io::Result<()>>) {
        let (host_side, client) = tokio::io::duplex(1024 * 1024);
        let (reader, writer) = split(host_side);
        let task = tokio::spawn(run_session_io(reader, writer, settings));
        (client, task)
    }

    async fn send(client: &mut DuplexStream, frame: Value) {
        write_json_frame(client, LengthPrefix::LittleEndian, &frame, usize::MAX)
            .await
            .unwrap();
    }

    async fn recv(client: &mut DuplexStream) -> Value {
        time::timeout(
            Duration::from_secs(2),
            read_json_frame(client, LengthPrefix::LittleEndian, 1024 * 1024),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    }

    async fn service_recv(stream: &mut TcpStream) -> Value {
        time::timeout(
            Duration::from_secs(2),
            read_json_frame(stream, LengthPrefix::BigEndian, 1024 * 1024),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap()
            .0
    }

    fn peer_ready() -> Value {
        json!({
            "command": "peer_ready",
            "profile_id": "profile-a",
            "launch_id": "launch-1",
            "peer_id": "peer-1",
            "profile_alias": "Work",
            "timestamp": 1
        })
    }

    fn confirm() -> Value {
        json!({
            "command": "handshake_confirm",
            "profile_id": "profile-a",
            "launch_id": "launch-1",
            "peer_id": "peer-1",
            "timestamp": 2
        })
    }

    fn heartbeat(launch_id: &str) -> Value {
        json!({
            "event": "heartbeat",
            "profile_id": "profile-a",
            "launch_id": launch_id,
            "timestamp": 3,
            "status": "alive"
        })
    }

    #[tokio::test]
    async fn replies_to_peer_ready_with_host_ready() {
        let logs = tempfile::tempdir().unwrap();
        let (mut client, task) = spawn_test_host(settings(logs.path(), None));

        send(&mut client, peer_ready()).await;
        let reply = recv(&mut client).await;
        assert_eq!(reply["command"], "host_ready");
        assert_eq!(reply["max_message_size"], TEST_OUTBOUND);
        assert_eq!(reply["version"], BRIDGE_VERSION);
        assert_eq!(reply["capabilities"], json!(["chunking", "heartbeat"]));

        drop(client);
        task.await.unwrap().unwrap();

        let host_dir = logs.path().join("profiles").join("profile-a").join("host");
        assert!(host_dir.is_dir());
        let telemetry = crate::telemetry::read_telemetry(&logs.path().join("telemetry.json")).unwrap();
        assert!(telemetry["active_streams"]["synapse_host"]["path"].is_string());
    }

    #[tokio::test]
    async fn extension_log_events_land_in_the_extension_stream() {
        let logs = tempfile::tempdir().unwrap();
        let (mut client, task) = spawn_test_host(settings(logs.path(), None));

        send(&mut client, peer_ready()).await;
        recv(&mut client).await;
        send(&mut client, confirm()).await;
        send(
            &mut client,
            json!({"event": "log", "level": "WARN", "message": "content script reloaded"}),
        )
        .await;
        drop(client);
        task.await.unwrap().unwrap();

        let host_dir = logs.path().join("profiles").join("profile-a").join("host");
        let extension_log = std::fs::read_dir(&host_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .find(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("synapse_extension_"))
            })
            .unwrap();
        let contents = std::fs::read_to_string(extension_log).unwrap();
        assert!(contents.contains("[WARN] [EXTENSION] content script reloaded"));
    }

    #[tokio::test]
    async fn gates_traffic_and_relays_matching_heartbeats() {
        let logs = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (mut client, task) = spawn_test_host(settings(logs.path(), Some(addr)));

        send(
            &mut client,
            json!({"type": "COMMAND", "command": "tab-query", "id": "early", "payload": {}}),
        )
        .await;
        send(&mut client, peer_ready()).await;
        assert_eq!(recv(&mut client).await["command"], "host_ready");

        let mut service = accept(&listener).await;
        let registration = service_recv(&mut service).await;
        assert_eq!(registration["type"], "REGISTER_HOST");
        assert_eq!(registration["profile_id"], "profile-a");
        assert_eq!(registration["pid"], std::process::id());

        // Not trusted yet: dropped.
        send(&mut client, heartbeat("launch-1")).await;
        send(&mut client, confirm()).await;
        send(&mut client, heartbeat("some-older-launch")).await;
        send(&mut client, heartbeat("launch-1")).await;

        let relayed = service_recv(&mut service).await;
        assert_eq!(relayed["event"], "heartbeat");
        assert_eq!(relayed["launch_id"], "launch-1");
        assert_eq!(relayed["timestamp"], 3);

        send(
            &mut client,
            json!({"type": "RESPONSE", "id": "r-1", "payload": {"ok": true, "result": {"n": 1}}}),
        )
        .await;
        let response = service_recv(&mut service).await;
        assert_eq!(response["type"], "RESPONSE");
        assert_eq!(response["id"], "r-1");
        assert_eq!(response["payload"]["result"]["n"], 1);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn large_service_frames_reach_chrome_chunked() {
        let logs = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (mut client, task) = spawn_test_host(settings(logs.path(), Some(addr)));

        send(&mut client, peer_ready()).await;
        recv(&mut client).await;
        let mut service = accept(&listener).await;
        service_recv(&mut service).await;

        let command = json!({
            "type": "COMMAND",
            "command": "dom-snapshot",
            "id": "big-1",
            "payload": {"filler": "x".repeat(3 * TEST_OUTBOUND)}
        });
        write_json_frame(&mut service, LengthPrefix::BigEndian, &command, usize::MAX)
            .await
            .unwrap();

        let reassembler = ChunkReassembler::default();
        let first = recv(&mut client).await;
        assert_eq!(first["chunk"]["type"], "header");
        let mut outcome = reassembler.process(&first);
        while outcome == ChunkOutcome::Incomplete {
            let frame = recv(&mut client).await;
            assert!(serde_json::to_vec(&frame).unwrap().len() <= TEST_OUTBOUND);
            outcome = reassembler.process(&frame);
        }
        let ChunkOutcome::CompleteValid(bytes) = outcome else {
            panic!("expected a valid reassembled message, got {outcome:?}");
        };
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), command);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn chunked_peer_ready_is_reassembled_before_gating() {
        let logs = tempfile::tempdir().unwrap();
        let (mut client, task) = spawn_test_host(settings(logs.path(), None));

        let mut ready = peer_ready();
        ready["profile_alias"] = json!("a".repeat(2 * TEST_OUTBOUND));
        for frame in ChunkEncoder::encode_message(ready, TEST_OUTBOUND).unwrap() {
            send(&mut client, frame).await;
        }
        assert_eq!(recv(&mut client).await["command"], "host_ready");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn service_link_reregisters_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let backoff = BackoffConfig {
            base_delay: Duration::from_millis(10),
            growth: 2.0,
            exponent_cap: 2,
            max_attempts: 0,
        };
        let mut link = ServiceLink::spawn(addr, backoff, RegisterHost::new("profile-r"), 1024 * 1024);

        let mut first = accept(&listener).await;
        assert_eq!(service_recv(&mut first).await["type"], "REGISTER_HOST");
        drop(first);

        let mut second = accept(&listener).await;
        let registration = service_recv(&mut second).await;
        assert_eq!(registration["profile_id"], "profile-r");

        write_json_frame(&mut second, LengthPrefix::BigEndian, &json!({"type": "PING"}), 1024)
            .await
            .unwrap();
        let inbound = time::timeout(Duration::from_secs(2), link.recv()).await.unwrap();
        assert_eq!(inbound, Some(json!({"type": "PING"})));

        link.send(json!({"event": "heartbeat"}));
        assert_eq!(service_recv(&mut second).await["event"], "heartbeat");
        link.shutdown();
    }

    #[tokio::test]
    async fn service_link_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let backoff = BackoffConfig {
            base_delay: Duration::from_millis(1),
            growth: 1.0,
            exponent_cap: 0,
            max_attempts: 2,
        };
        let mut link = ServiceLink::spawn(addr, backoff, RegisterHost::new("p"), 1024);
        let end = time::timeout(Duration::from_secs(5), link.recv()).await.unwrap();
        assert_eq!(end, None);
    }
}
