//! Role-tagged data channels with per-command handler dispatch

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, Future, FutureExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::transport::{ChannelSpec, ChannelTransport};
use crate::command::protocol::{
    chunk_packets, decode_command, encode_packet, Command, CommandKind, Packet,
};
use crate::error::Result;

/// What a data channel is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Structured commands and their responses
    Command = 0,
    /// Best effort payloads, never retransmitted
    Lossy = 1,
    /// Ordered payloads, retransmitted until delivered
    Reliable = 2,
}

impl ChannelRole {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelRole::Command => "cmd_channel",
            ChannelRole::Lossy => "lossy_channel",
            ChannelRole::Reliable => "reliable_channel",
        }
    }

    /// Pre-negotiated channel id
    pub fn id(&self) -> u16 {
        *self as u16
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "cmd_channel" => Some(ChannelRole::Command),
            "lossy_channel" => Some(ChannelRole::Lossy),
            "reliable_channel" => Some(ChannelRole::Reliable),
            _ => None,
        }
    }

    /// Delivery policy. Relay sessions use the in-band open handshake,
    /// everything else pre-negotiates the channel on its fixed id.
    pub fn spec(&self, relay: bool) -> ChannelSpec {
        ChannelSpec {
            label: self.label().to_string(),
            ordered: true,
            max_retransmits: match self {
                ChannelRole::Lossy => Some(0),
                _ => None,
            },
            negotiated_id: if relay { None } else { Some(self.id()) },
        }
    }
}

/// Handler for one command type
pub type CommandHandler =
    Arc<dyn Fn(Arc<DataChannel>, Command) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler for raw messages on payload channels
pub type MessageHandler =
    Arc<dyn Fn(Arc<DataChannel>, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// A data channel bound to its role.
///
/// Inbound messages are dispatched in arrival order on a task owned by the
/// channel. The command channel decodes each message and routes it to the
/// handler registered for its type; other roles hand raw bytes to the
/// message handler.
///
/// Bulk commands (snapshots and file transfers) run in order on a second
/// task, so control commands never wait behind a payload being streamed.
pub struct DataChannel {
    role: ChannelRole,
    session_id: String,
    transport: Arc<dyn ChannelTransport>,
    handlers: RwLock<HashMap<CommandKind, CommandHandler>>,
    message_handler: RwLock<Option<MessageHandler>>,
    bulk: mpsc::UnboundedSender<(CommandHandler, Command)>,
    cancel: CancellationToken,
}

impl DataChannel {
    /// Wrap a transport channel and start dispatching its messages
    pub fn new(
        role: ChannelRole,
        session_id: impl Into<String>,
        transport: Arc<dyn ChannelTransport>,
    ) -> Arc<Self> {
        let (bulk, mut bulk_rx) = mpsc::unbounded_channel::<(CommandHandler, Command)>();
        let channel = Arc::new(Self {
            role,
            session_id: session_id.into(),
            transport,
            handlers: RwLock::new(HashMap::new()),
            message_handler: RwLock::new(None),
            bulk,
            cancel: CancellationToken::new(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        channel.transport.set_message_sink(tx);

        let weak = Arc::downgrade(&channel);
        let cancel = channel.cancel.clone();
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(data) => data,
                        None => break,
                    },
                };
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                channel.dispatch(data).await;
            }
        });

        let weak = Arc::downgrade(&channel);
        let cancel = channel.cancel.clone();
        tokio::spawn(async move {
            loop {
                let (handler, command) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = bulk_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = handler(channel, command) => {}
                }
            }
        });

        channel
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn label(&self) -> String {
        self.transport.label()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Register the handler for `kind`, replacing any earlier one
    pub fn on_command<F, Fut>(&self, kind: CommandKind, f: F)
    where
        F: Fn(Arc<DataChannel>, Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: CommandHandler =
            Arc::new(move |ch: Arc<DataChannel>, cmd: Command| f(ch, cmd).boxed());
        if self.handlers.write().insert(kind, handler).is_some() {
            debug!(
                session_id = %self.session_id,
                "Replaced {:?} handler on {}",
                kind,
                self.role.label()
            );
        }
    }

    pub fn has_handler(&self, kind: CommandKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Register the raw message handler
    pub fn on_message<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<DataChannel>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler =
            Arc::new(move |ch: Arc<DataChannel>, data: Bytes| f(ch, data).boxed());
        *self.message_handler.write() = Some(handler);
    }

    async fn dispatch(self: Arc<Self>, data: Bytes) {
        if self.role != ChannelRole::Command {
            let handler = self.message_handler.read().clone();
            match handler {
                Some(handler) => handler(self.clone(), data).await,
                None => debug!("{} message ({} bytes) ignored", self.role.label(), data.len()),
            }
            return;
        }

        let Some(command) = decode_command(&data) else {
            return;
        };
        let kind = command.kind();
        let handler = self.handlers.read().get(&kind).cloned();
        match handler {
            Some(handler) if kind.is_bulk() => {
                if self.bulk.send((handler, command)).is_err() {
                    debug!(session_id = %self.session_id, "{:?} dropped, channel closing", kind);
                }
            }
            Some(handler) => handler(self.clone(), command).await,
            None => warn!(session_id = %self.session_id, "No handler for {:?}", kind),
        }
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.transport.send(&data).await
    }

    /// Send one protobuf packet as one message
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let bytes = encode_packet(packet)?;
        self.send(Bytes::from(bytes)).await
    }

    /// Send a binary payload as a sequence of transfer chunks
    pub async fn send_chunked(&self, kind: CommandKind, data: &[u8]) -> Result<()> {
        for packet in chunk_packets(kind, data) {
            self.send_packet(&packet).await?;
        }
        Ok(())
    }

    /// Stop dispatching and close the underlying channel
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.transport.close().await {
            debug!("Closing {} failed: {}", self.role.label(), e);
        }
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
