//! Line-delimited JSON signaling endpoint
//!
//! Each TCP connection drives one peer session. Every line is one
//! [`SignalingMessage`]; local descriptions and candidates produced by the
//! session are written back the same way.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::SessionOrchestrator;
use crate::error::{AppError, Result};
use crate::webrtc::session::{PeerSession, SessionKind, SignalingEvent};
use crate::webrtc::signaling::{
    SdpAnswer, SdpOffer, SdpType, SignalingError, SignalingMessage,
};

/// Signaling TCP server
pub struct SignalingServer {
    orchestrator: Arc<SessionOrchestrator>,
    listener: TcpListener,
}

impl SignalingServer {
    /// Bind the listen address
    pub async fn bind(addr: SocketAddr, orchestrator: Arc<SessionOrchestrator>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            AppError::Io(std::io::Error::new(
                e.kind(),
                format!("signaling bind on {} failed: {}", addr, e),
            ))
        })?;
        Ok(Self {
            orchestrator,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Signaling listening on {}", self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default());
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Signaling shutdown signal received");
                    break;
                }
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("Signaling client connected: {}", addr);
                        let orchestrator = self.orchestrator.clone();
                        let shutdown = shutdown.clone();
                        clients.spawn(async move {
                            let (reader, writer) = stream.into_split();
                            if let Err(e) = serve_connection(reader, writer, orchestrator, shutdown).await {
                                warn!("Signaling client {} ended with error: {}", addr, e);
                            }
                            debug!("Signaling client {} disconnected", addr);
                        });
                    }
                    Err(e) => warn!("Signaling accept failed: {}", e),
                },
            }
        }

        // Clients observe the same token and close their sessions
        while clients.join_next().await.is_some() {}
    }
}

/// Drive one session over a line-oriented stream
pub async fn serve_connection<R, W>(
    reader: R,
    mut writer: W,
    orchestrator: Arc<SessionOrchestrator>,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (signaling_tx, mut signaling_rx) = mpsc::unbounded_channel();
    let session = orchestrator
        .create_session(SessionKind::Direct, signaling_tx)
        .await?;
    let session_id = session.id().to_string();
    let mut lines = BufReader::new(reader).lines();

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write_message(&mut writer, &SignalingMessage::Close).await;
                break Ok(());
            }
            event = signaling_rx.recv() => {
                let Some(event) = event else { break Ok(()) };
                let closed = matches!(event, SignalingEvent::Closed { .. });
                if let Err(e) = write_message(&mut writer, &outbound(event)).await {
                    break Err(e);
                }
                if closed {
                    break Ok(());
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                match handle_line(&session, &line).await {
                    Ok(Inbound::Continue) => {}
                    Ok(Inbound::Reply(msg)) => {
                        if let Err(e) = write_message(&mut writer, &msg).await {
                            break Err(e);
                        }
                    }
                    Ok(Inbound::Close) => break Ok(()),
                    Err(e) => {
                        debug!(session_id = %session_id, "Signaling message rejected: {}", e);
                        let reply = SignalingMessage::Error(SignalingError::from_app_error(&e));
                        if let Err(e) = write_message(&mut writer, &reply).await {
                            break Err(e);
                        }
                    }
                }
            }
        }
    };

    if orchestrator.close_session(&session_id).await.is_err() {
        // Already removed when the session closed itself
        session.close().await;
    }
    result
}

enum Inbound {
    Continue,
    Reply(SignalingMessage),
    Close,
}

async fn handle_line(session: &Arc<PeerSession>, line: &str) -> Result<Inbound> {
    let message: SignalingMessage = serde_json::from_str(line)
        .map_err(|e| AppError::SdpParse(format!("invalid signaling message: {}", e)))?;

    match message {
        SignalingMessage::Offer(offer) => {
            session.set_remote_description(&offer.sdp, "offer").await?;
        }
        SignalingMessage::Answer(answer) => {
            session.set_remote_description(&answer.sdp, "answer").await?;
        }
        SignalingMessage::Candidate(candidate) => {
            session
                .set_remote_candidate(
                    candidate.sdp_mid,
                    candidate.sdp_mline_index,
                    &candidate.candidate,
                )
                .await?;
        }
        SignalingMessage::RestartIce(restart) => {
            let sdp = session.restart_ice(&restart.ufrag, &restart.pwd).await?;
            return Ok(Inbound::Reply(SignalingMessage::Answer(SdpAnswer::new(sdp))));
        }
        SignalingMessage::Error(err) => {
            warn!(session_id = %session.id(), "Remote signaling error {}: {}", err.code, err.message);
        }
        SignalingMessage::Close => return Ok(Inbound::Close),
    }
    Ok(Inbound::Continue)
}

fn outbound(event: SignalingEvent) -> SignalingMessage {
    match event {
        SignalingEvent::LocalDescription { sdp_type, sdp, .. } => match sdp_type {
            SdpType::Offer => SignalingMessage::Offer(SdpOffer::new(sdp)),
            _ => SignalingMessage::Answer(SdpAnswer::new(sdp)),
        },
        SignalingEvent::LocalCandidate { candidate, .. } => SignalingMessage::Candidate(candidate),
        SignalingEvent::Closed { .. } => SignalingMessage::Close,
    }
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &SignalingMessage) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
