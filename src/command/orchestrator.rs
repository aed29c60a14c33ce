//! Session orchestration
//!
//! [`SessionOrchestrator`] creates peer sessions and wires them to the rest
//! of the process:
//! - the capture broadcast feeds each session's video track;
//! - the command channel is bound to snapshot, recording, camera and car
//!   control handlers;
//! - lossy and reliable channel payloads are relayed to local subscribers;
//! - a session ending always parks the actuator with one neutral command.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::files::{parse_query_time, RecordingIndex, OLDER_FILES_LIMIT};
use super::protocol::{query_response_packet, Command, CommandKind, FileMetadata, FileQuery};
use crate::actuator::{clamp_axes, Actuator};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::capture::CaptureEngine;
use crate::video::snapshot::encode_jpeg;
use crate::warn_throttled;
use crate::webrtc::channel::{ChannelRole, DataChannel};
use crate::webrtc::config::WebRtcConfig;
use crate::webrtc::session::{PeerSession, SessionEvent, SessionKind, SignalingEvent};
use crate::webrtc::signaling::ConnectionState;
use crate::webrtc::track::{VideoTrack, VideoTrackConfig};
use crate::webrtc::transport::TransportFactory;

/// Commands served on the command channel
const HANDLED_COMMANDS: [CommandKind; 5] = [
    CommandKind::TakeSnapshot,
    CommandKind::QueryFile,
    CommandKind::TransferFile,
    CommandKind::ControlCamera,
    CommandKind::ControlCar,
];

/// Relay capacity for lossy/reliable payloads
const PAYLOAD_CHANNEL_CAPACITY: usize = 64;

/// Payload received on a lossy or reliable channel
#[derive(Debug, Clone)]
pub struct ChannelPayload {
    pub session_id: String,
    pub role: ChannelRole,
    pub data: Bytes,
}

/// What command handlers act on
#[derive(Clone)]
struct Services {
    capture: Arc<CaptureEngine>,
    actuator: Option<Arc<dyn Actuator>>,
    recordings: Option<RecordingIndex>,
    payload_tx: broadcast::Sender<ChannelPayload>,
    throttler: Arc<LogThrottler>,
}

impl Services {
    async fn handle(&self, channel: &Arc<DataChannel>, command: Command) {
        let kind = command.kind();
        let result = match command {
            Command::TakeSnapshot { quality } => self.take_snapshot(channel, quality).await,
            Command::QueryFile(query) => self.query_file(channel, query).await,
            Command::TransferFile { path } => self.transfer_file(channel, path).await,
            Command::ControlCamera { id, value } => {
                self.capture.set_control(id as u32, value);
                debug!(session_id = %channel.session_id(), "Camera control {:#x} = {}", id, value);
                Ok(())
            }
            Command::ControlCar { throttle, steer } => {
                self.control_car(throttle, steer).await;
                Ok(())
            }
            Command::Disconnect { .. } => Ok(()),
        };

        if let Err(e) = result {
            warn!(session_id = %channel.session_id(), "{:?} failed: {}", kind, e);
        }
    }

    async fn take_snapshot(&self, channel: &DataChannel, quality: u32) -> Result<()> {
        let quality = quality.min(100);
        let frame = self
            .capture
            .latest_frame()
            .ok_or_else(|| AppError::Snapshot("no frame captured yet".to_string()))?;

        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality))
            .await
            .map_err(|e| AppError::Snapshot(format!("encoder task failed: {}", e)))??;

        info!(
            session_id = %channel.session_id(),
            "Snapshot taken: {} bytes at quality {}",
            jpeg.len(),
            quality
        );
        channel.send_chunked(CommandKind::TakeSnapshot, &jpeg).await
    }

    fn recordings(&self) -> Result<RecordingIndex> {
        self.recordings
            .clone()
            .ok_or_else(|| AppError::Protocol("no record path configured".to_string()))
    }

    async fn query_file(&self, channel: &DataChannel, query: FileQuery) -> Result<()> {
        let index = self.recordings()?;
        let files = tokio::task::spawn_blocking(move || lookup_recordings(&index, query))
            .await
            .map_err(|e| AppError::Protocol(format!("file query task failed: {}", e)))??;

        debug!(session_id = %channel.session_id(), "File query matched {} recordings", files.len());
        channel.send_packet(&query_response_packet(files)).await
    }

    async fn transfer_file(&self, channel: &DataChannel, path: String) -> Result<()> {
        let index = self.recordings()?;
        let resolved = tokio::task::spawn_blocking(move || index.resolve(&path))
            .await
            .map_err(|e| AppError::Protocol(format!("path lookup failed: {}", e)))??;

        let data = tokio::fs::read(&resolved).await?;
        info!(
            session_id = %channel.session_id(),
            "Transferring {} ({} bytes)",
            resolved.display(),
            data.len()
        );
        channel.send_chunked(CommandKind::TransferFile, &data).await
    }

    async fn control_car(&self, throttle: i32, steer: i32) {
        let (throttle, steer) = clamp_axes(throttle, steer);
        let Some(actuator) = self.actuator.as_ref().filter(|a| a.is_connected()) else {
            warn_throttled!(
                self.throttler,
                "actuator_unavailable",
                "Actuator not connected, dropping car control ({}, {})",
                throttle,
                steer
            );
            return;
        };
        if let Err(e) = actuator.send_command(throttle, steer).await {
            warn_throttled!(self.throttler, "actuator_send", "Car control failed: {}", e);
        }
    }

    /// Park the actuator when a session ends
    async fn neutral_stop(&self, session_id: &str) {
        let Some(actuator) = self.actuator.as_ref() else {
            return;
        };
        if !actuator.is_connected() {
            debug!(session_id, "Actuator not connected, skipping neutral command");
            return;
        }
        match actuator.send_command(0, 0).await {
            Ok(()) => info!(session_id, "Actuator set to neutral"),
            Err(e) => warn!(session_id, "Failed to set actuator to neutral: {}", e),
        }
    }
}

fn lookup_recordings(index: &RecordingIndex, query: FileQuery) -> Result<Vec<FileMetadata>> {
    let paths: Vec<PathBuf> = match query {
        FileQuery::Latest => index.latest()?.into_iter().collect(),
        FileQuery::BeforeFile(file) | FileQuery::BeforeTime(file) if file.trim().is_empty() => {
            index.latest()?.into_iter().collect()
        }
        FileQuery::BeforeFile(file) => index.older_than(&file, OLDER_FILES_LIMIT)?,
        FileQuery::BeforeTime(time) => {
            let time = parse_query_time(&time)
                .ok_or_else(|| AppError::Protocol(format!("unparsable query time '{}'", time)))?;
            index.newest_before(time)?.into_iter().collect()
        }
    };
    Ok(paths.iter().map(|path| index.describe(path)).collect())
}

/// Attach handlers for a channel's role
fn bind_channel(services: &Arc<Services>, kind: SessionKind, channel: &Arc<DataChannel>) {
    match channel.role() {
        ChannelRole::Command if kind == SessionKind::Direct => {
            for command in HANDLED_COMMANDS {
                let services = services.clone();
                channel.on_command(command, move |ch: Arc<DataChannel>, cmd: Command| {
                    let services = services.clone();
                    async move { services.handle(&ch, cmd).await }
                });
            }
        }
        ChannelRole::Command => {}
        role => {
            let payload_tx = services.payload_tx.clone();
            channel.on_message(move |ch: Arc<DataChannel>, data: Bytes| {
                let _ = payload_tx.send(ChannelPayload {
                    session_id: ch.session_id().to_string(),
                    role,
                    data,
                });
                async {}
            });
        }
    }
}

/// Creates peer sessions and binds them to capture, commands and actuator
pub struct SessionOrchestrator {
    config: WebRtcConfig,
    factory: Arc<dyn TransportFactory>,
    track_config: VideoTrackConfig,
    services: Arc<Services>,
    sessions: Arc<RwLock<HashMap<String, Arc<PeerSession>>>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: WebRtcConfig,
        factory: Arc<dyn TransportFactory>,
        capture: Arc<CaptureEngine>,
    ) -> Self {
        let fps = capture.config().fps;
        let (payload_tx, _) = broadcast::channel(PAYLOAD_CHANNEL_CAPACITY);
        Self {
            config,
            factory,
            track_config: VideoTrackConfig {
                fps: if fps > 0 { fps } else { VideoTrackConfig::default().fps },
                ..Default::default()
            },
            services: Arc::new(Services {
                capture,
                actuator: None,
                recordings: None,
                payload_tx,
                throttler: Arc::new(LogThrottler::default()),
            }),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Route car control to `actuator`
    pub fn with_actuator(mut self, actuator: Arc<dyn Actuator>) -> Self {
        let mut services = (*self.services).clone();
        services.actuator = Some(actuator);
        self.services = Arc::new(services);
        self
    }

    /// Serve file queries and transfers from `index`
    pub fn with_recordings(mut self, index: RecordingIndex) -> Self {
        let mut services = (*self.services).clone();
        services.recordings = Some(index);
        self.services = Arc::new(services);
        self
    }

    /// Create a session and wire its channels, track and lifetime watcher.
    ///
    /// Relay sessions only receive media; command handlers are bound for
    /// direct peers.
    pub async fn create_session(
        &self,
        kind: SessionKind,
        signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<Arc<PeerSession>> {
        let id = uuid::Uuid::new_v4().to_string();
        let transport = self.factory.create(&id).await?;
        let session = PeerSession::with_id(id.clone(), kind, self.config.clone(), transport, signaling_tx);

        if let Err(e) = self.wire_session(&session).await {
            warn!(session_id = %id, "Failed to set up session: {}", e);
            session.close().await;
            return Err(e);
        }

        self.sessions.write().insert(id.clone(), session.clone());
        info!(session_id = %id, "Session ready ({} active)", self.session_count());
        Ok(session)
    }

    async fn wire_session(&self, session: &Arc<PeerSession>) -> Result<()> {
        self.spawn_lifetime_watcher(session);
        self.spawn_event_listener(session);

        for role in self.config.data_channels.roles() {
            let channel = session.create_data_channel(role).await?;
            bind_channel(&self.services, session.kind(), &channel);
        }

        let track = Arc::new(VideoTrack::new(self.track_config.clone()));
        session
            .attach_video_track(track, self.services.capture.subscribe())
            .await
    }

    /// Sends the neutral actuator command once the session is gone
    fn spawn_lifetime_watcher(&self, session: &Arc<PeerSession>) {
        let mut state_rx = session.state_watch();
        let services = self.services.clone();
        let sessions = self.sessions.clone();
        let id = session.id().to_string();
        tokio::spawn(async move {
            // An error means the session was dropped, which ends it just the same
            let _ = state_rx.wait_for(|s| *s == ConnectionState::Closed).await;
            sessions.write().remove(&id);
            services.neutral_stop(&id).await;
        });
    }

    /// Bind channels the remote peer opens on its own
    fn spawn_event_listener(&self, session: &Arc<PeerSession>) {
        let mut events = session.subscribe_events();
        let kind = session.kind();
        let services = self.services.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::RemoteChannel(channel)) => bind_channel(&services, kind, &channel),
                    Ok(SessionEvent::ConnectionChanged(ConnectionState::Closed)) => break,
                    Ok(SessionEvent::ConnectionChanged(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Session event listener lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Close one session
    pub async fn close_session(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| AppError::SessionClosed(id.to_string()))?;
        session.close().await;
        Ok(())
    }

    /// Close every session
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.write().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        if count > 0 {
            info!("Closed {} sessions", count);
        }
    }

    /// Payloads arriving on lossy and reliable channels
    pub fn subscribe_payloads(&self) -> broadcast::Receiver<ChannelPayload> {
        self.services.payload_tx.subscribe()
    }

    /// Send `data` on the `role` channel of every session that has one.
    ///
    /// Returns how many sessions it reached.
    pub async fn relay_payload(&self, role: ChannelRole, data: Bytes) -> usize {
        let channels: Vec<Arc<DataChannel>> = self
            .sessions
            .read()
            .values()
            .filter_map(|s| s.channel(role))
            .collect();

        let mut delivered = 0;
        for channel in channels {
            match channel.send(data.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(session_id = %channel.session_id(), "Relay send failed: {}", e),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::testing::RecordingActuator;
    use crate::command::protocol::{encode_packet, Packet, Payload};
    use crate::video::capture::CaptureConfig;
    use crate::video::device::VideoDevice;
    use crate::video::testing::FakeDevice;
    use crate::webrtc::config::DataChannelMode;
    use crate::webrtc::testing::{MockChannel, MockTransport, MockTransportFactory};
    use protobuf::Message;
    use std::path::Path;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Harness {
        orchestrator: SessionOrchestrator,
        factory: Arc<MockTransportFactory>,
        device: Arc<FakeDevice>,
        capture: Arc<CaptureEngine>,
        actuator: Arc<RecordingActuator>,
        _signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
        signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    }

    fn harness(mode: DataChannelMode, recordings: Option<&Path>) -> Harness {
        let device = Arc::new(FakeDevice::capture());
        let dev: Arc<dyn VideoDevice> = device.clone();
        let capture = Arc::new(CaptureEngine::with_device(dev, CaptureConfig::default()).unwrap());
        let factory = Arc::new(MockTransportFactory::default());
        let actuator = Arc::new(RecordingActuator::new(true));
        let config = WebRtcConfig {
            data_channels: mode,
            ..Default::default()
        };

        let mut orchestrator = SessionOrchestrator::new(config, factory.clone(), capture.clone())
            .with_actuator(actuator.clone());
        if let Some(root) = recordings {
            orchestrator = orchestrator.with_recordings(RecordingIndex::new(root));
        }
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        Harness {
            orchestrator,
            factory,
            device,
            capture,
            actuator,
            _signaling_rx: signaling_rx,
            signaling_tx,
        }
    }

    impl Harness {
        async fn session(&self, kind: SessionKind) -> (Arc<PeerSession>, Arc<MockTransport>) {
            let session = self
                .orchestrator
                .create_session(kind, self.signaling_tx.clone())
                .await
                .unwrap();
            (session, self.factory.last().unwrap())
        }
    }

    fn command_channel(transport: &MockTransport) -> Arc<MockChannel> {
        transport.channel("cmd_channel").unwrap().1
    }

    fn deliver(channel: &MockChannel, command: Command) {
        let bytes = encode_packet(&command.to_packet()).unwrap();
        channel.deliver(Bytes::from(bytes));
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn sent_packets(channel: &MockChannel) -> Vec<Packet> {
        channel
            .sent()
            .iter()
            .map(|b| Packet::parse_from_bytes(b).unwrap())
            .collect()
    }

    /// Reassemble a chunked transfer, once its last chunk was sent
    fn reassemble(channel: &MockChannel) -> Option<Vec<u8>> {
        let mut data = Vec::new();
        for packet in sent_packets(channel) {
            if let Some(Payload::TransferChunk(chunk)) = packet.payload {
                assert_eq!(chunk.offset as usize, data.len());
                data.extend_from_slice(&chunk.data);
                if chunk.last {
                    assert_eq!(chunk.total_size as usize, data.len());
                    return Some(data);
                }
            }
        }
        None
    }

    fn queried_files(channel: &MockChannel) -> Option<Vec<String>> {
        sent_packets(channel).into_iter().find_map(|p| match p.payload {
            Some(Payload::QueryFileResponse(resp)) => {
                Some(resp.files.into_iter().map(|f| f.filepath).collect())
            }
            _ => None,
        })
    }

    fn write_recording(dir: &Path, name: &str, age_secs: u64, body: &[u8]) {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_wiring() {
        let h = harness(DataChannelMode::Both, None);
        let (session, transport) = h.session(SessionKind::Direct).await;

        assert_eq!(transport.channel_count(), 3);
        assert_eq!(transport.track_count(), 1);
        let (spec, _) = transport.channel("lossy_channel").unwrap();
        assert_eq!(spec.max_retransmits, Some(0));
        assert_eq!(spec.negotiated_id, Some(1));

        let cmd = session.channel(ChannelRole::Command).unwrap();
        for kind in HANDLED_COMMANDS {
            assert!(cmd.has_handler(kind));
        }
        assert!(cmd.has_handler(CommandKind::Disconnect));
        assert_eq!(h.orchestrator.session_count(), 1);
        assert!(h.orchestrator.get_session(session.id()).is_some());
    }

    #[tokio::test]
    async fn test_channel_mode_none_keeps_command_channel() {
        let h = harness(DataChannelMode::None, None);
        let (_session, transport) = h.session(SessionKind::Direct).await;
        assert_eq!(transport.channel_count(), 1);
        assert!(transport.channel("cmd_channel").is_some());
    }

    #[tokio::test]
    async fn test_relay_session_has_no_command_handlers() {
        let h = harness(DataChannelMode::Reliable, None);
        let (session, transport) = h.session(SessionKind::Relay).await;

        let (spec, _) = transport.channel("cmd_channel").unwrap();
        assert_eq!(spec.negotiated_id, None);
        let cmd = session.channel(ChannelRole::Command).unwrap();
        assert!(!cmd.has_handler(CommandKind::ControlCar));
    }

    #[tokio::test]
    async fn test_control_car_is_clamped() {
        let h = harness(DataChannelMode::None, None);
        let (_session, transport) = h.session(SessionKind::Direct).await;
        let cmd = command_channel(&transport);

        deliver(&cmd, Command::ControlCar { throttle: -99999, steer: 99999 });
        deliver(&cmd, Command::ControlCar { throttle: 800, steer: -5000 });
        deliver(&cmd, Command::ControlCar { throttle: 120, steer: -300 });

        eventually("car commands", || h.actuator.commands().len() == 3).await;
        assert_eq!(
            h.actuator.commands(),
            vec![(-500, 1000), (500, -1000), (120, -300)]
        );
    }

    #[tokio::test]
    async fn test_control_car_dropped_when_disconnected() {
        let h = harness(DataChannelMode::None, None);
        h.actuator.set_connected(false);
        let (_session, transport) = h.session(SessionKind::Direct).await;
        let cmd = command_channel(&transport);

        deliver(&cmd, Command::ControlCar { throttle: 100, steer: 100 });
        h.actuator.set_connected(true);
        deliver(&cmd, Command::ControlCar { throttle: 5, steer: 6 });

        eventually("second car command", || !h.actuator.commands().is_empty()).await;
        assert_eq!(h.actuator.commands(), vec![(5, 6)]);
    }

    #[tokio::test]
    async fn test_session_end_sends_one_neutral_command() {
        let h = harness(DataChannelMode::None, None);
        let (session, _transport) = h.session(SessionKind::Direct).await;

        session.close().await;
        session.close().await;
        eventually("session removal", || h.orchestrator.session_count() == 0).await;
        eventually("neutral command", || !h.actuator.commands().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.actuator.commands(), vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_remote_disconnect_parks_actuator() {
        let h = harness(DataChannelMode::None, None);
        let (session, transport) = h.session(SessionKind::Direct).await;
        let cmd = command_channel(&transport);

        deliver(&cmd, Command::ControlCar { throttle: 300, steer: 0 });
        deliver(
            &cmd,
            Command::Disconnect {
                reason: crate::command::protocol::DisconnectReason::UserExit,
            },
        );

        eventually("session closed", || session.is_closed()).await;
        eventually("neutral command", || h.actuator.commands().len() == 2).await;
        assert_eq!(h.actuator.commands(), vec![(300, 0), (0, 0)]);
    }

    #[tokio::test]
    async fn test_control_camera_reaches_device() {
        let h = harness(DataChannelMode::None, None);
        let (_session, transport) = h.session(SessionKind::Direct).await;
        h.capture.start().unwrap();

        deliver(&command_channel(&transport), Command::ControlCamera { id: 0x0098_0900, value: 42 });
        // Controls are applied on the next capture cycle
        eventually("camera control", || {
            h.device.push_frame(0);
            h.device.controls().contains(&(0x0098_0900, 42))
        })
        .await;
        h.capture.stop();
    }

    #[tokio::test]
    async fn test_take_snapshot_sends_jpeg_chunks() {
        let h = harness(DataChannelMode::None, None);
        let (_session, transport) = h.session(SessionKind::Direct).await;
        h.capture.start().unwrap();
        h.device.push_frame(0);
        eventually("first frame", || h.capture.latest_frame().is_some()).await;

        let cmd = command_channel(&transport);
        deliver(&cmd, Command::TakeSnapshot { quality: 250 });
        eventually("snapshot", || reassemble(&cmd).is_some()).await;

        let jpeg = reassemble(&cmd).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(sent_packets(&cmd)
            .iter()
            .all(|p| p.type_.enum_value() == Ok(CommandKind::TakeSnapshot.wire_type())));
        h.capture.stop();
    }

    #[tokio::test]
    async fn test_snapshot_without_frame_sends_nothing() {
        let h = harness(DataChannelMode::None, None);
        let (_session, transport) = h.session(SessionKind::Direct).await;
        let cmd = command_channel(&transport);

        deliver(&cmd, Command::TakeSnapshot { quality: 80 });
        deliver(&cmd, Command::ControlCar { throttle: 1, steer: 1 });
        eventually("car command", || !h.actuator.commands().is_empty()).await;
        // bulk commands run on their own lane; give it time to answer
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cmd.sent().is_empty());
    }

    #[tokio::test]
    async fn test_query_latest_and_before_file() {
        let dir = TempDir::new().unwrap();
        for i in 0..5u64 {
            write_recording(dir.path(), &format!("r{}.mp4", i), 100 - i * 10, b"mp4");
        }
        std::fs::write(dir.path().join("r3.jpg"), [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();

        let h = harness(DataChannelMode::None, Some(dir.path()));
        let (_session, transport) = h.session(SessionKind::Direct).await;
        let cmd = command_channel(&transport);

        deliver(&cmd, Command::QueryFile(FileQuery::Latest));
        eventually("latest response", || queried_files(&cmd).is_some()).await;
        let latest = queried_files(&cmd).unwrap();
        assert_eq!(latest.len(), 1);
        assert!(latest[0].ends_with("r3.mp4"));

        let response = sent_packets(&cmd)
            .into_iter()
            .find_map(|p| match p.payload {
                Some(Payload::QueryFileResponse(resp)) => Some(resp),
                _ => None,
            })
            .unwrap();
        assert!(response.files[0]
            .thumbnail
            .starts_with("data:image/jpeg;base64,"));

        let before = dir.path().join("r3.mp4").to_string_lossy().into_owned();
        let sent_before = cmd.sent().len();
        deliver(&cmd, Command::QueryFile(FileQuery::BeforeFile(before)));
        eventually("before response", || cmd.sent().len() > sent_before).await;

        let last = Packet::parse_from_bytes(cmd.sent().last().unwrap()).unwrap();
        let Some(Payload::QueryFileResponse(resp)) = last.payload else {
            panic!("expected a query response");
        };
        let names: Vec<String> = resp.files.into_iter().map(|f| f.filepath).collect();
        assert_eq!(names.len(), 3);
        assert!(names[0].ends_with("r2.mp4"));
        assert!(names[2].ends_with("r0.mp4"));
    }

    #[tokio::test]
    async fn test_query_without_record_path_is_dropped() {
        let h = harness(DataChannelMode::None, None);
        let (_session, transport) = h.session(SessionKind::Direct).await;
        let cmd = command_channel(&transport);

        deliver(&cmd, Command::QueryFile(FileQuery::Latest));
        deliver(&cmd, Command::ControlCar { throttle: 1, steer: 1 });
        eventually("car command", || !h.actuator.commands().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cmd.sent().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_file() {
        let dir = TempDir::new().unwrap();
        let body: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        write_recording(dir.path(), "clip.mp4", 5, &body);

        let h = harness(DataChannelMode::None, Some(dir.path()));
        let (_session, transport) = h.session(SessionKind::Direct).await;
        let cmd = command_channel(&transport);

        deliver(&cmd, Command::TransferFile { path: "clip.mp4".to_string() });
        eventually("transfer", || reassemble(&cmd).is_some()).await;
        assert_eq!(reassemble(&cmd).unwrap(), body);
        assert_eq!(cmd.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_transfer_outside_record_path_rejected() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("records");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.mp4"), b"secret").unwrap();

        let h = harness(DataChannelMode::None, Some(&root));
        let (_session, transport) = h.session(SessionKind::Direct).await;
        let cmd = command_channel(&transport);

        deliver(&cmd, Command::TransferFile { path: "../secret.mp4".to_string() });
        deliver(&cmd, Command::ControlCar { throttle: 1, steer: 1 });
        eventually("car command", || !h.actuator.commands().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cmd.sent().is_empty());
    }

    #[tokio::test]
    async fn test_remote_command_channel_is_bound() {
        let h = harness(DataChannelMode::None, None);
        let (session, transport) = h.session(SessionKind::Direct).await;

        let remote = transport.open_remote_channel("cmd_channel");
        eventually("remote channel adopted", || {
            session
                .channel(ChannelRole::Command)
                .map(|c| c.label() == "cmd_channel" && c.has_handler(CommandKind::Disconnect))
                .unwrap_or(false)
        })
        .await;

        // Handlers are bound right after adoption, so retry until one lands
        eventually("car command over remote channel", || {
            if h.actuator.commands().is_empty() {
                deliver(&remote, Command::ControlCar { throttle: 7, steer: 8 });
            }
            !h.actuator.commands().is_empty()
        })
        .await;
        assert_eq!(h.actuator.commands()[0], (7, 8));
    }

    #[tokio::test]
    async fn test_payload_relay() {
        let h = harness(DataChannelMode::Both, None);
        let mut payloads = h.orchestrator.subscribe_payloads();
        let (session, transport) = h.session(SessionKind::Direct).await;

        let reliable = transport.channel("reliable_channel").unwrap().1;
        reliable.deliver(Bytes::from_static(b"ipc frame"));
        let payload = tokio::time::timeout(Duration::from_secs(5), payloads.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.session_id, session.id());
        assert_eq!(payload.role, ChannelRole::Reliable);
        assert_eq!(payload.data, Bytes::from_static(b"ipc frame"));

        let reached = h
            .orchestrator
            .relay_payload(ChannelRole::Lossy, Bytes::from_static(b"out"))
            .await;
        assert_eq!(reached, 1);
        let lossy = transport.channel("lossy_channel").unwrap().1;
        assert_eq!(lossy.sent(), vec![Bytes::from_static(b"out")]);
    }

    #[tokio::test]
    async fn test_failed_channel_creation_closes_session() {
        let h = harness(DataChannelMode::Both, None);
        let factory = Arc::new(FailingChannels(MockTransportFactory::default()));
        let capture = h.capture.clone();
        let orchestrator = SessionOrchestrator::new(WebRtcConfig::default(), factory.clone(), capture)
            .with_actuator(h.actuator.clone());

        let err = orchestrator
            .create_session(SessionKind::Direct, h.signaling_tx.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::ChannelCreation(_)));
        assert_eq!(orchestrator.session_count(), 0);
        assert!(factory.0.last().unwrap().is_closed());
    }

    struct FailingChannels(MockTransportFactory);

    #[async_trait::async_trait]
    impl TransportFactory for FailingChannels {
        async fn create(&self, session_id: &str) -> Result<crate::webrtc::transport::TransportPair> {
            let pair = self.0.create(session_id).await?;
            if let Some(transport) = self.0.last() {
                transport.fail_channels();
            }
            Ok(pair)
        }
    }

    #[tokio::test]
    async fn test_close_session_and_close_all() {
        let h = harness(DataChannelMode::None, None);
        let (first, _) = h.session(SessionKind::Direct).await;
        let (second, _) = h.session(SessionKind::Direct).await;
        assert_eq!(h.orchestrator.session_count(), 2);

        h.orchestrator.close_session(first.id()).await.unwrap();
        assert!(first.is_closed());
        assert!(matches!(
            h.orchestrator.close_session(first.id()).await,
            Err(AppError::SessionClosed(_))
        ));

        h.orchestrator.close_all().await;
        assert!(second.is_closed());
        assert_eq!(h.orchestrator.session_count(), 0);
    }
}
