//! Transport seam between a peer session and the WebRTC stack
//!
//! [`PeerSession`](super::session::PeerSession) drives negotiation through
//! [`RtcTransport`] and learns about connectivity from the [`TransportEvent`]
//! stream returned alongside it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::config::WebRtcConfig;
use super::signaling::{ConnectionState, IceCandidate, SdpType};
use super::track::VideoTrack;
use crate::error::{AppError, Result};

/// Something the transport noticed on its own
pub enum TransportEvent {
    /// The stack's signaling state changed (informational)
    SignalingChange(String),
    /// Connectivity changed
    ConnectionChange(ConnectionState),
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// The remote side opened a data channel
    RemoteDataChannel(Arc<dyn ChannelTransport>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::SignalingChange(s) => write!(f, "SignalingChange({})", s),
            TransportEvent::ConnectionChange(s) => write!(f, "ConnectionChange({})", s),
            TransportEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            TransportEvent::RemoteDataChannel(c) => write!(f, "RemoteDataChannel({})", c.label()),
        }
    }
}

/// Delivery policy of a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub label: String,
    pub ordered: bool,
    /// `None` retransmits until delivered
    pub max_retransmits: Option<u16>,
    /// Fixed id for a pre-negotiated channel; `None` uses the in-band open handshake
    pub negotiated_id: Option<u16>,
}

/// One data channel as seen by the transport
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn label(&self) -> String;

    fn id(&self) -> Option<u16>;

    /// Route every inbound message into `sink`
    fn set_message_sink(&self, sink: mpsc::UnboundedSender<Bytes>);

    async fn send(&self, data: &Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Negotiation surface of a peer connection
#[async_trait]
pub trait RtcTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String>;

    async fn create_answer(&self) -> Result<String>;

    async fn set_local_description(&self, kind: SdpType, sdp: String) -> Result<()>;

    /// Fails with `AppError::SdpParse` when the description is rejected
    async fn set_remote_description(&self, kind: SdpType, sdp: String) -> Result<()>;

    /// Fails with `AppError::CandidateParse` when the candidate is rejected
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn create_data_channel(&self, spec: &ChannelSpec) -> Result<Arc<dyn ChannelTransport>>;

    async fn add_video_track(&self, track: &VideoTrack) -> Result<()>;

    /// Current local description, including any candidates gathered so far
    async fn local_description(&self) -> Option<String>;

    async fn remote_description(&self) -> Option<String>;

    async fn close(&self) -> Result<()>;
}

/// A transport and the events it reports
pub type TransportPair = (Arc<dyn RtcTransport>, mpsc::UnboundedReceiver<TransportEvent>);

/// Creates one transport per session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, session_id: &str) -> Result<TransportPair>;
}

/// Factory for [`WebRtcTransport`]
pub struct WebRtcTransportFactory {
    config: WebRtcConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, session_id: &str) -> Result<TransportPair> {
        let (transport, events) = WebRtcTransport::new(&self.config, session_id).await?;
        Ok((Arc::new(transport), events))
    }
}

/// Transport backed by a `webrtc` peer connection
pub struct WebRtcTransport {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcTransport {
    /// Create a new peer connection
    pub async fn new(
        config: &WebRtcConfig,
        session_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_setting_engine(SettingEngine::default())
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let transport = Self {
            session_id: session_id.to_string(),
            pc: Arc::new(pc),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        transport.setup_event_handlers(tx);

        Ok((transport, rx))
    }

    fn setup_event_handlers(&self, tx: mpsc::UnboundedSender<TransportEvent>) {
        let events = tx.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
                let _ = events.send(TransportEvent::SignalingChange(s.to_string()));
                Box::pin(async {})
            }));

        let events = tx.clone();
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let new_state = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = new_state {
                    debug!("Peer {} transport state: {}", session_id, state);
                    let _ = events.send(TransportEvent::ConnectionChange(state));
                }
                Box::pin(async {})
            }));

        let events = tx.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(json) = candidate.and_then(|c| c.to_json().ok()) {
                    let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    }));
                }
                Box::pin(async {})
            }));

        let events = tx;
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                info!("Remote data channel opened: {}", dc.label());
                let _ = events.send(TransportEvent::RemoteDataChannel(Arc::new(RtcChannel(dc))));
                Box::pin(async {})
            }));
    }
}

fn session_description(kind: SdpType, sdp: String) -> Result<RTCSessionDescription> {
    let parsed = match kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            let mut desc = RTCSessionDescription::default();
            desc.sdp_type = RTCSdpType::Rollback;
            return Ok(desc);
        }
    };
    parsed.map_err(|e| AppError::SdpParse(format!("Invalid SDP {}: {}", kind, e)))
}

#[async_trait]
impl RtcTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpType, sdp: String) -> Result<()> {
        let desc = session_description(kind, sdp)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: String) -> Result<()> {
        let desc = session_description(kind, sdp)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| AppError::SdpParse(format!("Failed to set remote description: {}", e)))
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::CandidateParse(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(&self, spec: &ChannelSpec) -> Result<Arc<dyn ChannelTransport>> {
        let init = RTCDataChannelInit {
            ordered: Some(spec.ordered),
            max_retransmits: spec.max_retransmits,
            negotiated: spec.negotiated_id,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&spec.label, Some(init))
            .await
            .map_err(|e| {
                AppError::ChannelCreation(format!("Failed to create '{}': {}", spec.label, e))
            })?;
        Ok(Arc::new(RtcChannel(dc)))
    }

    async fn add_video_track(&self, track: &VideoTrack) -> Result<()> {
        self.pc
            .add_track(track.sample_track())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;
        Ok(())
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|d| d.sdp)
    }

    async fn remote_description(&self) -> Option<String> {
        self.pc.remote_description().await.map(|d| d.sdp)
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// `webrtc` data channel behind the [`ChannelTransport`] seam
struct RtcChannel(Arc<RTCDataChannel>);

#[async_trait]
impl ChannelTransport for RtcChannel {
    fn label(&self) -> String {
        self.0.label().to_string()
    }

    fn id(&self) -> Option<u16> {
        Some(self.0.id())
    }

    fn set_message_sink(&self, sink: mpsc::UnboundedSender<Bytes>) {
        self.0.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = sink.send(msg.data);
            Box::pin(async {})
        }));
    }

    async fn send(&self, data: &Bytes) -> Result<()> {
        self.0
            .send(data)
            .await
            .map(|_| ())
            .map_err(|e| AppError::WebRtcError(format!("Data channel send failed: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.0
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Data channel close failed: {}", e)))
    }
}
