//! Peer session negotiation state machine
//!
//! A [`PeerSession`] owns one transport and walks the offer/answer phases
//! (`Stable -> HaveLocalOffer -> Stable`, `Stable -> HaveRemoteOffer -> Stable`)
//! independently of the connection state reported by the transport.
//!
//! Timers hang off a session-lifetime [`CancellationToken`]:
//! - a watchdog armed on `HaveRemoteOffer` closes the session if it has not
//!   connected within `peer_timeout_secs`;
//! - an emission timer delays handing a finished local description to the
//!   signaling collaborator. Arming a new one cancels and joins the previous.
//!
//! Once the transport reports `Connected`, remote descriptions and candidates
//! are rejected; [`PeerSession::restart_ice`] is the only way to refresh it.
//!
//! Offers, remote descriptions and ICE restarts run one at a time. Each
//! checks the signaling state only after the previous one has finished.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{ChannelRole, DataChannel};
use super::config::WebRtcConfig;
use super::signaling::{ConnectionState, IceCandidate, SdpType, SignalingState};
use super::track::VideoTrack;
use super::transport::{ChannelTransport, RtcTransport, TransportEvent, TransportPair};
use crate::command::protocol::CommandKind;
use crate::error::{AppError, Result};
use crate::video::frame::FrameBuffer;

/// Whether the remote side is a relay that negotiates its own channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Direct peer: channels are pre-negotiated on fixed ids
    Direct,
    /// Relay (SFU) subscriber: channels use the in-band open handshake
    Relay,
}

/// Outbound signaling, for the signaling collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    LocalDescription {
        session_id: String,
        sdp_type: SdpType,
        sdp: String,
    },
    LocalCandidate {
        session_id: String,
        candidate: IceCandidate,
    },
    Closed {
        session_id: String,
    },
}

/// Session notifications for local consumers
#[derive(Clone)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    /// The remote peer opened a data channel we recognise
    RemoteChannel(Arc<DataChannel>),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::ConnectionChanged(s) => write!(f, "ConnectionChanged({})", s),
            SessionEvent::RemoteChannel(c) => write!(f, "RemoteChannel({:?})", c.role()),
        }
    }
}

type TimerSlot = Mutex<Option<(CancellationToken, JoinHandle<()>)>>;

/// One negotiated peer
pub struct PeerSession {
    id: String,
    kind: SessionKind,
    config: WebRtcConfig,
    transport: Arc<dyn RtcTransport>,
    signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    signaling: Mutex<SignalingState>,
    /// Held across each offer/answer exchange
    negotiation: AsyncMutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    watchdog: Mutex<Option<CancellationToken>>,
    emitter: TimerSlot,
    channels: RwLock<HashMap<ChannelRole, Arc<DataChannel>>>,
    video_track: Mutex<Option<Arc<VideoTrack>>>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Create a session around `transport` and start consuming its events
    pub fn new(
        kind: SessionKind,
        config: WebRtcConfig,
        transport: TransportPair,
        signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Arc<Self> {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            kind,
            config,
            transport,
            signaling_tx,
        )
    }

    /// Like [`new`](Self::new) with a caller-chosen id
    pub fn with_id(
        id: String,
        kind: SessionKind,
        config: WebRtcConfig,
        (transport, mut transport_rx): TransportPair,
        signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        let (events_tx, _) = broadcast::channel(16);

        let session = Arc::new(Self {
            id,
            kind,
            config,
            transport,
            signaling_tx,
            signaling: Mutex::new(SignalingState::Stable),
            negotiation: AsyncMutex::new(()),
            state_tx,
            events_tx,
            cancel: CancellationToken::new(),
            watchdog: Mutex::new(None),
            emitter: Mutex::new(None),
            channels: RwLock::new(HashMap::new()),
            video_track: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&session);
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = transport_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.handle_transport_event(event).await;
            }
        });

        info!(session_id = %session.id, "Peer session created ({:?})", kind);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state changes
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channel(&self, role: ChannelRole) -> Option<Arc<DataChannel>> {
        self.channels.read().get(&role).cloned()
    }

    fn set_signaling(&self, state: SignalingState) {
        let mut current = self.signaling.lock();
        if *current != SignalingState::Closed && *current != state {
            debug!(session_id = %self.id, "Signaling {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Remote negotiation is refused once closed or connected
    fn ensure_negotiable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::SessionClosed(self.id.clone()));
        }
        if self.connection_state() == ConnectionState::Connected {
            return Err(AppError::NegotiationLocked(self.id.clone()));
        }
        Ok(())
    }

    /// Produce a local offer.
    ///
    /// A second call while the first offer is outstanding does nothing. The
    /// offer itself is delivered as [`SignalingEvent::LocalDescription`].
    pub async fn create_offer(self: &Arc<Self>) -> Result<()> {
        let _negotiating = self.negotiation.lock().await;
        {
            let mut state = self.signaling.lock();
            match *state {
                SignalingState::Closed => return Err(AppError::SessionClosed(self.id.clone())),
                SignalingState::HaveLocalOffer => {
                    debug!(session_id = %self.id, "Offer already outstanding");
                    return Ok(());
                }
                SignalingState::HaveRemoteOffer => {
                    return Err(AppError::InvalidState(
                        "cannot offer while answering a remote offer".into(),
                    ))
                }
                SignalingState::Stable => *state = SignalingState::HaveLocalOffer,
            }
        }

        let result = async {
            let offer = self.transport.create_offer().await?;
            self.transport
                .set_local_description(SdpType::Offer, offer)
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(session_id = %self.id, "Failed to create offer: {}", e);
            let mut state = self.signaling.lock();
            if *state == SignalingState::HaveLocalOffer {
                *state = SignalingState::Stable;
            }
            return Err(e);
        }

        self.schedule_emit(SdpType::Offer).await;
        Ok(())
    }

    /// Apply a remote description of type `sdp_type`.
    ///
    /// An accepted offer is answered automatically. A rejected description
    /// leaves the session where it was.
    pub async fn set_remote_description(self: &Arc<Self>, sdp: &str, sdp_type: &str) -> Result<()> {
        let kind: SdpType = sdp_type.parse()?;
        let _negotiating = self.negotiation.lock().await;
        self.ensure_negotiable()?;

        let current = self.signaling_state();
        let allowed = match kind {
            SdpType::Offer => matches!(
                current,
                SignalingState::Stable | SignalingState::HaveRemoteOffer
            ),
            SdpType::Answer | SdpType::Pranswer => current == SignalingState::HaveLocalOffer,
            SdpType::Rollback => matches!(
                current,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer
            ),
        };
        if !allowed {
            return Err(AppError::InvalidState(format!(
                "remote {} in signaling state {}",
                kind, current
            )));
        }

        self.transport
            .set_remote_description(kind, sdp.to_string())
            .await?;

        match kind {
            SdpType::Offer => {
                self.set_signaling(SignalingState::HaveRemoteOffer);
                self.arm_watchdog();
                self.answer().await
            }
            SdpType::Answer | SdpType::Rollback => {
                self.set_signaling(SignalingState::Stable);
                Ok(())
            }
            SdpType::Pranswer => Ok(()),
        }
    }

    async fn answer(self: &Arc<Self>) -> Result<()> {
        let result = async {
            let answer = self.transport.create_answer().await?;
            self.transport
                .set_local_description(SdpType::Answer, answer)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                self.set_signaling(SignalingState::Stable);
                self.schedule_emit(SdpType::Answer).await;
                Ok(())
            }
            Err(e) => {
                // The remote offer is applied but unanswerable; the transport is unusable
                warn!(session_id = %self.id, "Failed to answer remote offer: {}", e);
                self.close().await;
                Err(e)
            }
        }
    }

    /// Add a trickled remote candidate
    pub async fn set_remote_candidate(
        &self,
        mid: Option<String>,
        index: Option<u16>,
        candidate: &str,
    ) -> Result<()> {
        self.ensure_negotiable()?;

        let candidate = IceCandidate {
            candidate: candidate.to_string(),
            sdp_mid: mid,
            sdp_mline_index: index,
            username_fragment: None,
        };
        candidate.attribute()?;
        self.transport.add_candidate(candidate).await
    }

    /// Swap the ICE credentials of the stored remote description, re-apply it
    /// as an offer and return the regenerated local description
    pub async fn restart_ice(&self, ufrag: &str, pwd: &str) -> Result<String> {
        let _negotiating = self.negotiation.lock().await;
        if self.is_closed() {
            return Err(AppError::SessionClosed(self.id.clone()));
        }
        let remote = self
            .transport
            .remote_description()
            .await
            .ok_or_else(|| AppError::InvalidState("no remote description to restart".into()))?;

        let rewritten = rewrite_ice_credentials(&remote, ufrag, pwd);
        self.transport
            .set_remote_description(SdpType::Offer, rewritten)
            .await?;
        let answer = self.transport.create_answer().await?;
        self.transport
            .set_local_description(SdpType::Answer, answer)
            .await?;

        info!(session_id = %self.id, "ICE credentials restarted");
        self.transport
            .local_description()
            .await
            .ok_or_else(|| AppError::InvalidState("no local description after restart".into()))
    }

    /// Open a data channel for `role`.
    ///
    /// The command channel comes with a `DISCONNECT` handler that closes
    /// the session.
    pub async fn create_data_channel(self: &Arc<Self>, role: ChannelRole) -> Result<Arc<DataChannel>> {
        if self.is_closed() {
            return Err(AppError::SessionClosed(self.id.clone()));
        }
        let spec = role.spec(self.kind == SessionKind::Relay);
        let transport = self
            .transport
            .create_data_channel(&spec)
            .await
            .map_err(|e| match e {
                AppError::ChannelCreation(_) => e,
                other => AppError::ChannelCreation(other.to_string()),
            })?;

        let channel = self.adopt_channel(role, transport);
        debug!(session_id = %self.id, "Data channel '{}' created", role.label());
        Ok(channel)
    }

    fn adopt_channel(
        self: &Arc<Self>,
        role: ChannelRole,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<DataChannel> {
        let channel = DataChannel::new(role, self.id.clone(), transport);
        if role == ChannelRole::Command {
            let weak: Weak<PeerSession> = Arc::downgrade(self);
            channel.on_command(CommandKind::Disconnect, move |_, cmd| {
                let weak = weak.clone();
                async move {
                    if let Some(session) = weak.upgrade() {
                        info!(session_id = %session.id, "Remote requested disconnect: {:?}", cmd);
                        session.close().await;
                    }
                }
            });
        }
        self.channels.write().insert(role, channel.clone());
        channel
    }

    /// Attach `track` and start forwarding `frames` once connected
    pub async fn attach_video_track(
        &self,
        track: Arc<VideoTrack>,
        frames: broadcast::Receiver<FrameBuffer>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::SessionClosed(self.id.clone()));
        }
        self.transport.add_video_track(&track).await?;
        *self.video_track.lock() = Some(track.clone());

        let mut state_rx = self.state_watch();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                if *state_rx.borrow_and_update() == ConnectionState::Connected {
                    track.start_sending(frames);
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn arm_watchdog(self: &Arc<Self>) {
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return;
        }
        let token = self.cancel.child_token();
        *slot = Some(token.clone());

        let timeout = self.config.peer_timeout();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(session) = weak.upgrade() {
                        if session.connection_state() != ConnectionState::Connected {
                            warn!(
                                session_id = %session.id,
                                "Not connected within {:?}, closing",
                                timeout
                            );
                            session.close().await;
                        }
                    }
                }
            }
        });
    }

    fn disarm_watchdog(&self) {
        if let Some(token) = self.watchdog.lock().take() {
            token.cancel();
        }
    }

    /// Emit the current local description, after the configured delay
    async fn schedule_emit(self: &Arc<Self>, sdp_type: SdpType) {
        let previous = self.emitter.lock().take();
        if let Some((token, handle)) = previous {
            token.cancel();
            let _ = handle.await;
        }

        let delay = self.config.emit_delay();
        if delay.is_zero() {
            self.emit_local_description(sdp_type).await;
            return;
        }

        let token = self.cancel.child_token();
        let timer_token = token.clone();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(session) = weak.upgrade() {
                        session.emit_local_description(sdp_type).await;
                    }
                }
            }
        });
        *self.emitter.lock() = Some((token, handle));
    }

    async fn emit_local_description(&self, sdp_type: SdpType) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.transport.local_description().await {
            Some(sdp) => {
                let _ = self.signaling_tx.send(SignalingEvent::LocalDescription {
                    session_id: self.id.clone(),
                    sdp_type,
                    sdp,
                });
            }
            None => warn!(session_id = %self.id, "No local {} to emit", sdp_type),
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            TransportEvent::SignalingChange(state) => {
                debug!(session_id = %self.id, "Transport signaling state: {}", state);
            }
            TransportEvent::ConnectionChange(state) => {
                if self.state_tx.send_replace(state) == state {
                    return;
                }
                info!(session_id = %self.id, "Connection state: {}", state);
                let _ = self.events_tx.send(SessionEvent::ConnectionChanged(state));
                match state {
                    ConnectionState::Connected => {
                        self.disarm_watchdog();
                        if let Some((token, _)) = self.emitter.lock().take() {
                            token.cancel();
                        }
                    }
                    ConnectionState::Failed | ConnectionState::Closed => self.close().await,
                    _ => {}
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                if self.config.has_candidates_in_sdp {
                    return;
                }
                let _ = self.signaling_tx.send(SignalingEvent::LocalCandidate {
                    session_id: self.id.clone(),
                    candidate,
                });
            }
            TransportEvent::RemoteDataChannel(transport) => {
                let label = transport.label();
                match ChannelRole::from_label(&label) {
                    Some(role) => {
                        let channel = self.adopt_channel(role, transport);
                        info!(session_id = %self.id, "Remote data channel '{}' adopted", label);
                        let _ = self.events_tx.send(SessionEvent::RemoteChannel(channel));
                    }
                    None => warn!(session_id = %self.id, "Ignoring unknown data channel '{}'", label),
                }
            }
        }
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.signaling.lock() = SignalingState::Closed;
        self.cancel.cancel();
        self.watchdog.lock().take();
        self.emitter.lock().take();

        if let Some(track) = self.video_track.lock().take() {
            track.stop();
        }
        let channels: Vec<Arc<DataChannel>> = self.channels.write().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close().await;
        }
        if let Err(e) = self.transport.close().await {
            debug!(session_id = %self.id, "Transport close failed: {}", e);
        }

        self.state_tx.send_replace(ConnectionState::Closed);
        let _ = self
            .events_tx
            .send(SessionEvent::ConnectionChanged(ConnectionState::Closed));
        let _ = self.signaling_tx.send(SignalingEvent::Closed {
            session_id: self.id.clone(),
        });
        info!(session_id = %self.id, "Peer session closed");
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Replace the `a=ice-ufrag` and `a=ice-pwd` values of every media section
fn rewrite_ice_credentials(sdp: &str, ufrag: &str, pwd: &str) -> String {
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    sdp.split('\n')
        .map(|line| {
            let line = line.trim_end_matches('\r');
            if line.starts_with("a=ice-ufrag:") {
                format!("a=ice-ufrag:{}", ufrag)
            } else if line.starts_with("a=ice-pwd:") {
                format!("a=ice-pwd:{}", pwd)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(eol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::protocol::{encode_packet, Command, DisconnectReason};
    use crate::webrtc::testing::MockTransport;
    use bytes::Bytes;
    use std::time::Duration;

    const OFFER: &str = "v=0\r\na=ice-ufrag:old\r\na=ice-pwd:oldpwd\r\nm=application 9\r\na=ice-ufrag:old\r\n";

    fn session_with(
        config: WebRtcConfig,
        kind: SessionKind,
    ) -> (
        Arc<PeerSession>,
        Arc<MockTransport>,
        mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        let (transport, events) = MockTransport::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(kind, config, (transport.clone(), events), tx);
        (session, transport, rx)
    }

    fn direct_session() -> (
        Arc<PeerSession>,
        Arc<MockTransport>,
        mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        session_with(WebRtcConfig::default(), SessionKind::Direct)
    }

    async fn wait_for_state(session: &PeerSession, state: ConnectionState) {
        let mut rx = session.state_watch();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_offer_is_idempotent() {
        let (session, transport, mut rx) = direct_session();
        session.create_offer().await.unwrap();
        session.create_offer().await.unwrap();

        assert_eq!(transport.offers_created(), 1);
        assert_eq!(session.signaling_state(), SignalingState::HaveLocalOffer);
        match rx.recv().await.unwrap() {
            SignalingEvent::LocalDescription { sdp_type, sdp, .. } => {
                assert_eq!(sdp_type, SdpType::Offer);
                assert!(sdp.contains("offer"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());

        session
            .set_remote_description("v=0\r\n", "answer")
            .await
            .unwrap();
        assert_eq!(session.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_remote_offer_is_answered() {
        let (session, transport, mut rx) = direct_session();
        session.set_remote_description(OFFER, "offer").await.unwrap();

        assert_eq!(transport.answers_created(), 1);
        assert_eq!(session.signaling_state(), SignalingState::Stable);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SignalingEvent::LocalDescription {
                sdp_type: SdpType::Answer,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_offer_waits_for_remote_offer() {
        let (session, transport, mut rx) = direct_session();
        let (remote, local) = tokio::join!(
            session.set_remote_description(OFFER, "offer"),
            session.create_offer()
        );
        remote.unwrap();
        local.unwrap();

        assert_eq!(transport.answers_created(), 1);
        assert_eq!(transport.offers_created(), 1);
        let mut emitted = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                SignalingEvent::LocalDescription { sdp_type, .. } => emitted.push(sdp_type),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(emitted, vec![SdpType::Answer, SdpType::Offer]);
        assert_eq!(session.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_bad_remote_description_keeps_state() {
        let (session, _transport, _rx) = direct_session();
        assert!(matches!(
            session.set_remote_description(OFFER, "bogus").await,
            Err(AppError::SdpParse(_))
        ));
        assert!(matches!(
            session.set_remote_description("garbage", "offer").await,
            Err(AppError::SdpParse(_))
        ));
        assert_eq!(session.signaling_state(), SignalingState::Stable);
        assert!(!session.is_closed());

        // An answer without an offer is out of order
        assert!(matches!(
            session.set_remote_description("v=0\r\n", "answer").await,
            Err(AppError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_answer_failure_closes_session() {
        let (session, transport, mut rx) = direct_session();
        transport.fail_answers();
        assert!(session.set_remote_description(OFFER, "offer").await.is_err());
        assert!(session.is_closed());
        assert!(matches!(rx.recv().await.unwrap(), SignalingEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn test_candidates() {
        let (session, transport, _rx) = direct_session();
        session
            .set_remote_candidate(
                Some("0".into()),
                Some(0),
                "a=candidate:1 1 udp 2122260223 192.168.1.2 50000 typ host",
            )
            .await
            .unwrap();
        assert!(matches!(
            session.set_remote_candidate(None, None, "not-a-candidate").await,
            Err(AppError::CandidateParse(_))
        ));
        assert_eq!(transport.candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_connected_session_rejects_negotiation() {
        let (session, transport, _rx) = direct_session();
        session.set_remote_description(OFFER, "offer").await.unwrap();
        transport.connect_state(ConnectionState::Connected);
        wait_for_state(&session, ConnectionState::Connected).await;

        let remote_before = transport.remote();
        assert!(matches!(
            session.set_remote_description(OFFER, "offer").await,
            Err(AppError::NegotiationLocked(_))
        ));
        assert!(matches!(
            session
                .set_remote_candidate(None, None, "candidate:1 1 udp 1 10.0.0.1 5000 typ host")
                .await,
            Err(AppError::NegotiationLocked(_))
        ));
        assert_eq!(transport.remote(), remote_before);
        assert!(transport.candidates().is_empty());
        assert_eq!(session.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_restart_ice_rewrites_credentials() {
        let (session, transport, _rx) = direct_session();
        session.set_remote_description(OFFER, "offer").await.unwrap();
        transport.connect_state(ConnectionState::Connected);
        wait_for_state(&session, ConnectionState::Connected).await;

        let local = session.restart_ice("newufrag", "newpwd").await.unwrap();
        assert!(local.contains("answer"));

        let (kind, remote) = transport.remote().unwrap();
        assert_eq!(kind, SdpType::Offer);
        assert_eq!(remote.matches("a=ice-ufrag:newufrag").count(), 2);
        assert!(remote.contains("a=ice-pwd:newpwd\r\n"));
        assert!(!remote.contains("old"));
    }

    #[test]
    fn test_rewrite_keeps_line_endings() {
        let sdp = "v=0\na=ice-ufrag:a\na=ice-pwd:b\n";
        assert_eq!(
            rewrite_ice_credentials(sdp, "x", "y"),
            "v=0\na=ice-ufrag:x\na=ice-pwd:y\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_closes_unconnected_session() {
        let (session, _transport, mut rx) = direct_session();
        session.set_remote_description(OFFER, "offer").await.unwrap();
        let _answer = rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(session.is_closed());
        assert!(matches!(rx.recv().await.unwrap(), SignalingEvent::Closed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_disarmed_on_connect() {
        let (session, transport, _rx) = direct_session();
        session.set_remote_description(OFFER, "offer").await.unwrap();
        transport.connect_state(ConnectionState::Connected);
        wait_for_state(&session, ConnectionState::Connected).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_emission_and_candidates_in_sdp() {
        let config = WebRtcConfig {
            has_candidates_in_sdp: true,
            ..Default::default()
        };
        let (session, transport, mut rx) = session_with(config, SessionKind::Direct);
        session.set_remote_description(OFFER, "offer").await.unwrap();
        transport.gather("candidate:1 1 udp 1 10.0.0.1 5000 typ host");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            SignalingEvent::LocalDescription { .. }
        ));
        // Candidates travel inside the SDP
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancels_pending_emission() {
        let config = WebRtcConfig {
            has_candidates_in_sdp: true,
            ..Default::default()
        };
        let (session, transport, mut rx) = session_with(config, SessionKind::Direct);
        session.set_remote_description(OFFER, "offer").await.unwrap();
        transport.connect_state(ConnectionState::Connected);
        wait_for_state(&session, ConnectionState::Connected).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trickled_candidates_emitted() {
        let (session, transport, mut rx) = direct_session();
        transport.gather("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        match rx.recv().await.unwrap() {
            SignalingEvent::LocalCandidate {
                session_id,
                candidate,
            } => {
                assert_eq!(session_id, session.id());
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_connection_closes_once() {
        let (session, transport, mut rx) = direct_session();
        transport.connect_state(ConnectionState::Failed);
        wait_for_state(&session, ConnectionState::Closed).await;
        session.close().await;

        assert!(transport.is_closed());
        assert!(matches!(rx.recv().await.unwrap(), SignalingEvent::Closed { .. }));
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            session.create_offer().await,
            Err(AppError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_data_channels_pre_negotiated() {
        let (session, transport, _rx) = direct_session();
        for role in [ChannelRole::Command, ChannelRole::Lossy, ChannelRole::Reliable] {
            session.create_data_channel(role).await.unwrap();
        }
        let (spec, _) = transport.channel("lossy_channel").unwrap();
        assert_eq!(spec.negotiated_id, Some(1));
        assert_eq!(spec.max_retransmits, Some(0));
        let cmd = session.channel(ChannelRole::Command).unwrap();
        assert!(cmd.has_handler(CommandKind::Disconnect));

        let (session2, transport2, _rx2) = direct_session();
        transport2.fail_channels();
        assert!(matches!(
            session2.create_data_channel(ChannelRole::Lossy).await,
            Err(AppError::ChannelCreation(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_channels_use_handshake() {
        let (session, transport, _rx) = session_with(WebRtcConfig::default(), SessionKind::Relay);
        session.create_data_channel(ChannelRole::Command).await.unwrap();
        let (spec, _) = transport.channel("cmd_channel").unwrap();
        assert_eq!(spec.negotiated_id, None);
    }

    #[tokio::test]
    async fn test_disconnect_command_closes_session() {
        let (session, transport, mut rx) = direct_session();
        session.create_data_channel(ChannelRole::Command).await.unwrap();
        let (_, channel) = transport.channel("cmd_channel").unwrap();

        let packet = Command::Disconnect {
            reason: DisconnectReason::UserExit,
        }
        .to_packet();
        channel.deliver(Bytes::from(encode_packet(&packet).unwrap()));

        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap(),
            Some(SignalingEvent::Closed { .. })
        ));
        assert!(session.is_closed());
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_remote_channel_adopted() {
        let (session, transport, _rx) = session_with(WebRtcConfig::default(), SessionKind::Relay);
        let mut events = session.subscribe_events();
        transport.open_remote_channel("unknown");
        transport.open_remote_channel("reliable_channel");

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::RemoteChannel(channel) => {
                assert_eq!(channel.role(), ChannelRole::Reliable);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(session.channel(ChannelRole::Reliable).is_some());
    }

    #[tokio::test]
    async fn test_video_track_starts_on_connect() {
        let (session, transport, _rx) = direct_session();
        let track = Arc::new(VideoTrack::new(Default::default()));
        let (frames_tx, frames_rx) = broadcast::channel(4);
        session
            .attach_video_track(track.clone(), frames_rx)
            .await
            .unwrap();
        assert_eq!(transport.track_count(), 1);
        assert!(!track.is_running());

        transport.connect_state(ConnectionState::Connected);
        wait_for_state(&session, ConnectionState::Connected).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !track.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        session.close().await;
        assert!(!track.is_running());
        drop(frames_tx);
    }
}
