//! Command channel protocol
//!
//! Every data channel message carries exactly one protobuf `Packet`, so the
//! channel's message boundaries are the framing. `Packet.type` names the
//! command and the `payload` oneof holds its body.

use protobuf::Message;
use tracing::warn;

use crate::error::{AppError, Result};

// Include the generated protobuf code
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));
}

pub use proto::packet::packet::Payload;
pub use proto::packet::{
    CarControlCommand, CommandType, ControlCameraRequest, DisconnectRequest, FileMetadata,
    Packet, QueryFileRequest, QueryFileResponse, QueryFileType, TakeSnapshotRequest,
    TransferChunk, TransferFileRequest,
};

use proto::packet::disconnect_request::DisconnectReason as WireDisconnectReason;

/// Largest payload carried by one `TransferChunk`
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Command tag, used as the handler registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    TakeSnapshot,
    QueryFile,
    TransferFile,
    ControlCamera,
    ControlCar,
    Disconnect,
}

impl CommandKind {
    pub fn wire_type(&self) -> CommandType {
        match self {
            CommandKind::TakeSnapshot => CommandType::TAKE_SNAPSHOT,
            CommandKind::QueryFile => CommandType::QUERY_FILE,
            CommandKind::TransferFile => CommandType::TRANSFER_FILE,
            CommandKind::ControlCamera => CommandType::CONTROL_CAMERA,
            CommandKind::ControlCar => CommandType::CONTROL_CAR,
            CommandKind::Disconnect => CommandType::DISCONNECT,
        }
    }
    /// Commands answered with image or file payloads
    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            CommandKind::TakeSnapshot | CommandKind::QueryFile | CommandKind::TransferFile
        )
    }
}

/// How a file query selects recordings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileQuery {
    /// Most recent finished recording
    Latest,
    /// Recordings older than the named file
    BeforeFile(String),
    /// Newest recording not newer than the given time
    BeforeTime(String),
}

/// Why the remote side is leaving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Unknown,
    UserExit,
    Timeout,
    Error,
}

/// Decoded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    TakeSnapshot { quality: u32 },
    QueryFile(FileQuery),
    TransferFile { path: String },
    ControlCamera { id: i32, value: i32 },
    ControlCar { throttle: i32, steer: i32 },
    Disconnect { reason: DisconnectReason },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::TakeSnapshot { .. } => CommandKind::TakeSnapshot,
            Command::QueryFile(_) => CommandKind::QueryFile,
            Command::TransferFile { .. } => CommandKind::TransferFile,
            Command::ControlCamera { .. } => CommandKind::ControlCamera,
            Command::ControlCar { .. } => CommandKind::ControlCar,
            Command::Disconnect { .. } => CommandKind::Disconnect,
        }
    }

    /// Build the wire packet for this command
    pub fn to_packet(&self) -> Packet {
        let payload = match self {
            Command::TakeSnapshot { quality } => {
                let mut req = TakeSnapshotRequest::new();
                req.quality = *quality;
                Payload::TakeSnapshotRequest(req)
            }
            Command::QueryFile(query) => {
                let mut req = QueryFileRequest::new();
                let (kind, parameter) = match query {
                    FileQuery::Latest => (QueryFileType::LATEST_FILE, String::new()),
                    FileQuery::BeforeFile(p) => (QueryFileType::BEFORE_FILE, p.clone()),
                    FileQuery::BeforeTime(t) => (QueryFileType::BEFORE_TIME, t.clone()),
                };
                req.type_ = kind.into();
                req.parameter = parameter;
                Payload::QueryFileRequest(req)
            }
            Command::TransferFile { path } => {
                let mut req = TransferFileRequest::new();
                req.filepath = path.clone();
                Payload::TransferFileRequest(req)
            }
            Command::ControlCamera { id, value } => {
                let mut req = ControlCameraRequest::new();
                req.id = *id;
                req.value = *value;
                Payload::ControlCameraRequest(req)
            }
            Command::ControlCar { throttle, steer } => {
                let mut req = CarControlCommand::new();
                req.throttle = *throttle;
                req.steer = *steer;
                Payload::CarControlCommand(req)
            }
            Command::Disconnect { reason } => {
                let mut req = DisconnectRequest::new();
                req.reason = match reason {
                    DisconnectReason::Unknown => WireDisconnectReason::UNKNOWN,
                    DisconnectReason::UserExit => WireDisconnectReason::USER_EXIT,
                    DisconnectReason::Timeout => WireDisconnectReason::TIMEOUT,
                    DisconnectReason::Error => WireDisconnectReason::ERROR,
                }
                .into();
                Payload::DisconnectionRequest(req)
            }
        };

        let mut packet = Packet::new();
        packet.type_ = self.kind().wire_type().into();
        packet.payload = Some(payload);
        packet
    }
}

/// Decode one data channel message.
///
/// Malformed bytes, an unknown tag, or a tag whose payload is missing are
/// logged and yield `None`.
pub fn decode_command(data: &[u8]) -> Option<Command> {
    let packet = match Packet::parse_from_bytes(data) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("Dropping malformed command packet ({} bytes): {}", data.len(), e);
            return None;
        }
    };

    let tag = match packet.type_.enum_value() {
        Ok(tag) => tag,
        Err(raw) => {
            warn!("Dropping command with unknown type {}", raw);
            return None;
        }
    };

    let command = match (tag, packet.payload) {
        (CommandType::TAKE_SNAPSHOT, Some(Payload::TakeSnapshotRequest(req))) => {
            Command::TakeSnapshot {
                quality: req.quality,
            }
        }
        (CommandType::QUERY_FILE, Some(Payload::QueryFileRequest(req))) => {
            let query = match req.type_.enum_value() {
                Ok(QueryFileType::LATEST_FILE) => FileQuery::Latest,
                Ok(QueryFileType::BEFORE_FILE) => FileQuery::BeforeFile(req.parameter),
                Ok(QueryFileType::BEFORE_TIME) => FileQuery::BeforeTime(req.parameter),
                Err(raw) => {
                    warn!("Dropping file query with unknown type {}", raw);
                    return None;
                }
            };
            Command::QueryFile(query)
        }
        (CommandType::TRANSFER_FILE, Some(Payload::TransferFileRequest(req))) => {
            Command::TransferFile { path: req.filepath }
        }
        (CommandType::CONTROL_CAMERA, Some(Payload::ControlCameraRequest(req))) => {
            Command::ControlCamera {
                id: req.id,
                value: req.value,
            }
        }
        (CommandType::CONTROL_CAR, Some(Payload::CarControlCommand(req))) => Command::ControlCar {
            throttle: req.throttle,
            steer: req.steer,
        },
        (CommandType::DISCONNECT, payload) => {
            // A bare disconnect is still a disconnect
            let reason = match payload {
                Some(Payload::DisconnectionRequest(req)) => match req.reason.enum_value() {
                    Ok(WireDisconnectReason::USER_EXIT) => DisconnectReason::UserExit,
                    Ok(WireDisconnectReason::TIMEOUT) => DisconnectReason::Timeout,
                    Ok(WireDisconnectReason::ERROR) => DisconnectReason::Error,
                    _ => DisconnectReason::Unknown,
                },
                _ => DisconnectReason::Unknown,
            };
            Command::Disconnect { reason }
        }
        (CommandType::UNSPECIFIED, _) => {
            warn!("Dropping command without a type");
            return None;
        }
        (tag, _) => {
            warn!("Dropping {:?} command without a matching payload", tag);
            return None;
        }
    };

    Some(command)
}

/// Serialize a packet for a data channel message
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
    packet
        .write_to_bytes()
        .map_err(|e| AppError::Protocol(format!("Failed to encode packet: {}", e)))
}

/// Split a binary payload into `TransferChunk` packets of at most [`CHUNK_SIZE`] bytes.
///
/// The final chunk has `last` set. An empty payload yields one empty final chunk.
pub fn chunk_packets(kind: CommandKind, data: &[u8]) -> Vec<Packet> {
    let total = data.len() as u64;
    let mut pieces: Vec<(usize, &[u8])> = data
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(i, piece)| (i * CHUNK_SIZE, piece))
        .collect();
    if pieces.is_empty() {
        pieces.push((0, &[]));
    }

    let count = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (offset, piece))| {
            let mut chunk = TransferChunk::new();
            chunk.total_size = total;
            chunk.offset = offset as u64;
            chunk.data = piece.to_vec();
            chunk.last = i + 1 == count;

            let mut packet = Packet::new();
            packet.type_ = kind.wire_type().into();
            packet.payload = Some(Payload::TransferChunk(chunk));
            packet
        })
        .collect()
}

/// Wrap file query results
pub fn query_response_packet(files: Vec<FileMetadata>) -> Packet {
    let mut response = QueryFileResponse::new();
    response.files = files;

    let mut packet = Packet::new();
    packet.type_ = CommandType::QUERY_FILE.into();
    packet.payload = Some(Payload::QueryFileResponse(response));
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(command: Command) -> Option<Command> {
        let bytes = encode_packet(&command.to_packet()).unwrap();
        decode_command(&bytes)
    }

    #[test]
    fn test_decode_typed_commands() {
        assert_eq!(
            roundtrip(Command::ControlCar {
                throttle: 800,
                steer: -5000
            }),
            Some(Command::ControlCar {
                throttle: 800,
                steer: -5000
            })
        );
        assert_eq!(
            roundtrip(Command::QueryFile(FileQuery::BeforeTime("20240101_120000".into()))),
            Some(Command::QueryFile(FileQuery::BeforeTime("20240101_120000".into())))
        );
        assert_eq!(
            roundtrip(Command::Disconnect {
                reason: DisconnectReason::UserExit
            }),
            Some(Command::Disconnect {
                reason: DisconnectReason::UserExit
            })
        );
    }

    #[test]
    fn test_malformed_packets_dropped() {
        assert_eq!(decode_command(&[0xFF, 0xFF, 0xFF]), None);

        // Tag without payload
        let mut packet = Packet::new();
        packet.type_ = CommandType::CONTROL_CAR.into();
        assert_eq!(decode_command(&encode_packet(&packet).unwrap()), None);

        // Tag with someone else's payload
        let mut packet = Command::TakeSnapshot { quality: 50 }.to_packet();
        packet.type_ = CommandType::TRANSFER_FILE.into();
        assert_eq!(decode_command(&encode_packet(&packet).unwrap()), None);

        // Unknown numeric tag
        let mut packet = Command::TakeSnapshot { quality: 50 }.to_packet();
        packet.type_ = protobuf::EnumOrUnknown::from_i32(42);
        assert_eq!(decode_command(&encode_packet(&packet).unwrap()), None);
    }

    #[test]
    fn test_bare_disconnect() {
        let mut packet = Packet::new();
        packet.type_ = CommandType::DISCONNECT.into();
        assert_eq!(
            decode_command(&encode_packet(&packet).unwrap()),
            Some(Command::Disconnect {
                reason: DisconnectReason::Unknown
            })
        );
    }

    #[test]
    fn test_chunking() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        let packets = chunk_packets(CommandKind::TakeSnapshot, &data);
        assert_eq!(packets.len(), 3);

        let mut reassembled = Vec::new();
        for (i, packet) in packets.iter().enumerate() {
            let encoded = encode_packet(packet).unwrap();
            let parsed = Packet::parse_from_bytes(&encoded).unwrap();
            match parsed.payload {
                Some(Payload::TransferChunk(chunk)) => {
                    assert!(chunk.data.len() <= CHUNK_SIZE);
                    assert_eq!(chunk.offset as usize, reassembled.len());
                    assert_eq!(chunk.total_size as usize, data.len());
                    assert_eq!(chunk.last, i == 2);
                    reassembled.extend_from_slice(&chunk.data);
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }
        assert_eq!(reassembled, data);

        let empty = chunk_packets(CommandKind::TransferFile, &[]);
        assert_eq!(empty.len(), 1);
        assert!(matches!(&empty[0].payload, Some(Payload::TransferChunk(c)) if c.last));
    }
}
