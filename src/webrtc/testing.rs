//! In-memory transport doubles for session tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::signaling::{ConnectionState, IceCandidate, SdpType};
use super::track::VideoTrack;
use super::transport::{
    ChannelSpec, ChannelTransport, RtcTransport, TransportEvent, TransportFactory, TransportPair,
};
use crate::error::{AppError, Result};

/// Data channel that records what is sent and lets tests inject inbound messages
pub(crate) struct MockChannel {
    label: String,
    id: Option<u16>,
    sink: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MockChannel {
    pub(crate) fn new(label: &str, id: u16) -> Arc<Self> {
        Self::with_id(label, Some(id))
    }

    pub(crate) fn with_id(label: &str, id: Option<u16>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            id,
            sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Feed a message as if the remote peer sent it
    pub(crate) fn deliver(&self, data: Bytes) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(data);
        }
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelTransport for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn id(&self) -> Option<u16> {
        self.id
    }

    fn set_message_sink(&self, sink: mpsc::UnboundedSender<Bytes>) {
        *self.sink.lock() = Some(sink);
    }

    async fn send(&self, data: &Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::WebRtcError("channel closed".into()));
        }
        self.sent.lock().push(data.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockState {
    local: Option<(SdpType, String)>,
    remote: Option<(SdpType, String)>,
    candidates: Vec<IceCandidate>,
    channels: Vec<(ChannelSpec, Arc<MockChannel>)>,
    tracks: usize,
    offers: usize,
    answers: usize,
    closed: bool,
    fail_answer: bool,
    fail_channels: bool,
}

/// Scriptable [`RtcTransport`].
///
/// SDP must start with `v=0` and candidates with `candidate:`; anything else is
/// rejected the way a real stack would reject unparsable input.
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            state: Mutex::new(MockState::default()),
            events: tx,
        });
        (transport, rx)
    }

    /// Report a connection state change
    pub(crate) fn connect_state(&self, state: ConnectionState) {
        let _ = self.events.send(TransportEvent::ConnectionChange(state));
    }

    /// Report a gathered local candidate
    pub(crate) fn gather(&self, candidate: &str) {
        let _ = self.events.send(TransportEvent::LocalCandidate(
            IceCandidate::new(candidate).with_mid("0", 0),
        ));
    }

    /// Announce a channel opened by the remote peer
    pub(crate) fn open_remote_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = MockChannel::with_id(label, None);
        let _ = self
            .events
            .send(TransportEvent::RemoteDataChannel(channel.clone()));
        channel
    }

    pub(crate) fn fail_answers(&self) {
        self.state.lock().fail_answer = true;
    }

    pub(crate) fn fail_channels(&self) {
        self.state.lock().fail_channels = true;
    }

    pub(crate) fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    pub(crate) fn answers_created(&self) -> usize {
        self.state.lock().answers
    }

    pub(crate) fn remote(&self) -> Option<(SdpType, String)> {
        self.state.lock().remote.clone()
    }

    pub(crate) fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub(crate) fn channel(&self, label: &str) -> Option<(ChannelSpec, Arc<MockChannel>)> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|(spec, _)| spec.label == label)
            .cloned()
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub(crate) fn track_count(&self) -> usize {
        self.state.lock().tracks
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(AppError::WebRtcError("transport closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RtcTransport for MockTransport {
    async fn create_offer(&self) -> Result<String> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.offers += 1;
        Ok(format!("v=0\r\no=mock {} offer\r\n", state.offers))
    }

    async fn create_answer(&self) -> Result<String> {
        self.check_open()?;
        let mut state = self.state.lock();
        if state.fail_answer {
            return Err(AppError::WebRtcError("answer generation failed".into()));
        }
        match state.remote {
            Some((SdpType::Offer, _)) => {
                state.answers += 1;
                Ok(format!("v=0\r\no=mock {} answer\r\n", state.answers))
            }
            _ => Err(AppError::WebRtcError("no remote offer".into())),
        }
    }

    async fn set_local_description(&self, kind: SdpType, sdp: String) -> Result<()> {
        self.check_open()?;
        self.state.lock().local = Some((kind, sdp));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpType, sdp: String) -> Result<()> {
        self.check_open()?;
        if kind != SdpType::Rollback && !sdp.starts_with("v=0") {
            return Err(AppError::SdpParse(format!("unparsable {}", kind)));
        }
        // A real stack parses on another task; let other callers run meanwhile
        tokio::task::yield_now().await;
        self.state.lock().remote = Some((kind, sdp));
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check_open()?;
        candidate.attribute()?;
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, spec: &ChannelSpec) -> Result<Arc<dyn ChannelTransport>> {
        self.check_open()?;
        let mut state = self.state.lock();
        if state.fail_channels {
            return Err(AppError::ChannelCreation(spec.label.clone()));
        }
        let channel = MockChannel::with_id(&spec.label, spec.negotiated_id);
        state.channels.push((spec.clone(), channel.clone()));
        Ok(channel)
    }

    async fn add_video_track(&self, _track: &VideoTrack) -> Result<()> {
        self.check_open()?;
        self.state.lock().tracks += 1;
        Ok(())
    }

    async fn local_description(&self) -> Option<String> {
        self.state.lock().local.as_ref().map(|(_, sdp)| sdp.clone())
    }

    async fn remote_description(&self) -> Option<String> {
        self.state.lock().remote.as_ref().map(|(_, sdp)| sdp.clone())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        let _ = self
            .events
            .send(TransportEvent::ConnectionChange(ConnectionState::Closed));
        Ok(())
    }
}

/// Hands out [`MockTransport`]s and keeps them for inspection
#[derive(Default)]
pub(crate) struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub(crate) fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, _session_id: &str) -> Result<TransportPair> {
        let (transport, events) = MockTransport::new();
        self.created.lock().push(transport.clone());
        Ok((transport, events))
    }
}
