//! Live editing packet vocabulary.
//!
//! Every packet body starts with a one-byte [`LivePacketType`] tag followed by
//! a payload encoded with [`crate::codec`]. Client → server tags live in
//! `0x10..0x40`, server → client tags in `0x80..0xA0`.
//!
//! Decoding is strict: a payload must be consumed exactly, trailing bytes
//! are a protocol violation just like a truncated field.

use crate::codec::{CodecError, PacketReader, PacketWriter, Position, MAX_MESSAGE_SIZE};
use crate::document::MapDescriptor;
use crate::framing::{encode_frame, FramingError};
use crate::presence::{PeerColor, PeerId};

/// Largest change payload that can still be relayed.
///
/// A relayed `Changes` body carries the tag, origin, version and blob
/// length (13 bytes) in front of the payload, and must stay within
/// [`MAX_MESSAGE_SIZE`].
pub const MAX_CHANGE_PAYLOAD: usize = MAX_MESSAGE_SIZE as usize - 13;

/// Packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LivePacketType {
    // Client → server
    HelloFromClient = 0x10,
    ReadyClient = 0x11,
    NodeRequest = 0x20,
    ReceiveChanges = 0x21,
    ChatMessage = 0x30,
    CursorUpdate = 0x31,
    ClientColorUpdate = 0x32,

    // Server → client
    HelloFromServer = 0x80,
    KickFromServer = 0x81,
    YourIdColor = 0x82,
    PeerJoined = 0x83,
    PeerLeft = 0x84,
    ServerNotice = 0x85,
    ClientColorToClients = 0x86,
    ActionDenied = 0x87,
    NodeData = 0x90,
    CursorUpdateToClients = 0x91,
    ChangesToClients = 0x92,
    ChangeRejected = 0x93,
    ChatMessageToClients = 0x94,
}

impl LivePacketType {
    pub fn is_client_packet(self) -> bool {
        (self as u8) < 0x80
    }
}

impl TryFrom<u8> for LivePacketType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        use LivePacketType::*;
        Ok(match tag {
            0x10 => HelloFromClient,
            0x11 => ReadyClient,
            0x20 => NodeRequest,
            0x21 => ReceiveChanges,
            0x30 => ChatMessage,
            0x31 => CursorUpdate,
            0x32 => ClientColorUpdate,
            0x80 => HelloFromServer,
            0x81 => KickFromServer,
            0x82 => YourIdColor,
            0x83 => PeerJoined,
            0x84 => PeerLeft,
            0x85 => ServerNotice,
            0x86 => ClientColorToClients,
            0x87 => ActionDenied,
            0x90 => NodeData,
            0x91 => CursorUpdateToClients,
            0x92 => ChangesToClients,
            0x93 => ChangeRejected,
            0x94 => ChatMessageToClients,
            other => return Err(ProtocolError::UnknownPacketType(other)),
        })
    }
}

/// Login request sent as the very first packet of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    /// Map format version the client edits with
    pub map_version: u32,
    /// Client software version
    pub client_version: u32,
    /// Display name (also the account username in account mode)
    pub name: String,
    /// Password attempt (empty when none)
    pub password: String,
}

/// Packets sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Hello(ClientHello),
    Ready,
    NodeRequest { position: Position },
    ReceiveChanges { payload: Vec<u8> },
    Chat { text: String },
    CursorUpdate { position: Position },
    ColorUpdate { color: PeerColor },
}

/// Packets sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    Hello {
        server_name: String,
        map: MapDescriptor,
    },
    Kick {
        reason: String,
    },
    YourIdColor {
        peer_id: PeerId,
        color: PeerColor,
    },
    PeerJoined {
        peer_id: PeerId,
        name: String,
        color: PeerColor,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    ServerNotice {
        text: String,
    },
    ClientColor {
        peer_id: PeerId,
        color: PeerColor,
    },
    /// A request was refused for lack of permission or readiness.
    ActionDenied {
        packet: u8,
        reason: String,
    },
    NodeData {
        position: Position,
        /// `None` = no tile at this position
        tile: Option<Vec<u8>>,
    },
    CursorUpdate {
        peer_id: PeerId,
        color: PeerColor,
        position: Position,
    },
    Changes {
        origin: PeerId,
        version: u32,
        payload: Vec<u8>,
    },
    ChangeRejected {
        reason: String,
    },
    Chat {
        peer_id: PeerId,
        name: String,
        text: String,
    },
}

impl ClientPacket {
    pub fn packet_type(&self) -> LivePacketType {
        match self {
            Self::Hello(_) => LivePacketType::HelloFromClient,
            Self::Ready => LivePacketType::ReadyClient,
            Self::NodeRequest { .. } => LivePacketType::NodeRequest,
            Self::ReceiveChanges { .. } => LivePacketType::ReceiveChanges,
            Self::Chat { .. } => LivePacketType::ChatMessage,
            Self::CursorUpdate { .. } => LivePacketType::CursorUpdate,
            Self::ColorUpdate { .. } => LivePacketType::ClientColorUpdate,
        }
    }

    /// Encode the packet body (tag + payload), without the length prefix.
    pub fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = PacketWriter::with_tag(self.packet_type() as u8);
        match self {
            Self::Hello(hello) => {
                w.write_u32(hello.map_version)
                    .write_u32(hello.client_version)
                    .write_string(&hello.name)
                    .write_string(&hello.password);
            }
            Self::Ready => {}
            Self::NodeRequest { position } | Self::CursorUpdate { position } => {
                w.write_position(*position);
            }
            Self::ReceiveChanges { payload } => {
                w.write_bytes(payload);
            }
            Self::Chat { text } => {
                w.write_string(text);
            }
            Self::ColorUpdate { color } => {
                w.write_color(*color);
            }
        }
        Ok(w.finish()?)
    }

    /// Encode as a complete length-prefixed frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(encode_frame(&self.encode_body()?)?)
    }

    /// Decode a client packet from its tag and payload.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let packet_type = LivePacketType::try_from(tag)?;
        let mut r = PacketReader::new(payload);
        let packet = match packet_type {
            LivePacketType::HelloFromClient => Self::Hello(decode_client_hello(&mut r)?),
            LivePacketType::ReadyClient => Self::Ready,
            LivePacketType::NodeRequest => Self::NodeRequest {
                position: r.read_position()?,
            },
            LivePacketType::ReceiveChanges => Self::ReceiveChanges {
                payload: r.read_bytes()?,
            },
            LivePacketType::ChatMessage => Self::Chat {
                text: r.read_string()?,
            },
            LivePacketType::CursorUpdate => Self::CursorUpdate {
                position: r.read_position()?,
            },
            LivePacketType::ClientColorUpdate => Self::ColorUpdate {
                color: r.read_color()?,
            },
            other => return Err(ProtocolError::UnexpectedPacket(other)),
        };
        expect_end(&r)?;
        Ok(packet)
    }
}

impl ServerPacket {
    pub fn packet_type(&self) -> LivePacketType {
        match self {
            Self::Hello { .. } => LivePacketType::HelloFromServer,
            Self::Kick { .. } => LivePacketType::KickFromServer,
            Self::YourIdColor { .. } => LivePacketType::YourIdColor,
            Self::PeerJoined { .. } => LivePacketType::PeerJoined,
            Self::PeerLeft { .. } => LivePacketType::PeerLeft,
            Self::ServerNotice { .. } => LivePacketType::ServerNotice,
            Self::ClientColor { .. } => LivePacketType::ClientColorToClients,
            Self::ActionDenied { .. } => LivePacketType::ActionDenied,
            Self::NodeData { .. } => LivePacketType::NodeData,
            Self::CursorUpdate { .. } => LivePacketType::CursorUpdateToClients,
            Self::Changes { .. } => LivePacketType::ChangesToClients,
            Self::ChangeRejected { .. } => LivePacketType::ChangeRejected,
            Self::Chat { .. } => LivePacketType::ChatMessageToClients,
        }
    }

    pub fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = PacketWriter::with_tag(self.packet_type() as u8);
        match self {
            Self::Hello { server_name, map } => {
                w.write_string(server_name);
                map.encode(&mut w);
            }
            Self::Kick { reason } | Self::ChangeRejected { reason } => {
                w.write_string(reason);
            }
            Self::YourIdColor { peer_id, color } | Self::ClientColor { peer_id, color } => {
                w.write_u32(*peer_id).write_color(*color);
            }
            Self::PeerJoined { peer_id, name, color } => {
                w.write_u32(*peer_id).write_string(name).write_color(*color);
            }
            Self::PeerLeft { peer_id } => {
                w.write_u32(*peer_id);
            }
            Self::ServerNotice { text } => {
                w.write_string(text);
            }
            Self::ActionDenied { packet, reason } => {
                w.write_u8(*packet).write_string(reason);
            }
            Self::NodeData { position, tile } => {
                w.write_position(*position);
                match tile {
                    Some(data) => w.write_bool(true).write_bytes(data),
                    None => w.write_bool(false),
                };
            }
            Self::CursorUpdate { peer_id, color, position } => {
                w.write_u32(*peer_id).write_color(*color).write_position(*position);
            }
            Self::Changes { origin, version, payload } => {
                w.write_u32(*origin).write_u32(*version).write_bytes(payload);
            }
            Self::Chat { peer_id, name, text } => {
                w.write_u32(*peer_id).write_string(name).write_string(text);
            }
        }
        Ok(w.finish()?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(encode_frame(&self.encode_body()?)?)
    }

    /// Decode a server packet from its tag and payload.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let packet_type = LivePacketType::try_from(tag)?;
        let mut r = PacketReader::new(payload);
        let packet = match packet_type {
            LivePacketType::HelloFromServer => Self::Hello {
                server_name: r.read_string()?,
                map: MapDescriptor::decode(&mut r)?,
            },
            LivePacketType::KickFromServer => Self::Kick {
                reason: r.read_string()?,
            },
            LivePacketType::YourIdColor => Self::YourIdColor {
                peer_id: r.read_u32()?,
                color: r.read_color()?,
            },
            LivePacketType::PeerJoined => Self::PeerJoined {
                peer_id: r.read_u32()?,
                name: r.read_string()?,
                color: r.read_color()?,
            },
            LivePacketType::PeerLeft => Self::PeerLeft {
                peer_id: r.read_u32()?,
            },
            LivePacketType::ServerNotice => Self::ServerNotice {
                text: r.read_string()?,
            },
            LivePacketType::ClientColorToClients => Self::ClientColor {
                peer_id: r.read_u32()?,
                color: r.read_color()?,
            },
            LivePacketType::ActionDenied => Self::ActionDenied {
                packet: r.read_u8()?,
                reason: r.read_string()?,
            },
            LivePacketType::NodeData => {
                let position = r.read_position()?;
                let tile = if r.read_bool()? {
                    Some(r.read_bytes()?)
                } else {
                    None
                };
                Self::NodeData { position, tile }
            }
            LivePacketType::CursorUpdateToClients => Self::CursorUpdate {
                peer_id: r.read_u32()?,
                color: r.read_color()?,
                position: r.read_position()?,
            },
            LivePacketType::ChangesToClients => Self::Changes {
                origin: r.read_u32()?,
                version: r.read_u32()?,
                payload: r.read_bytes()?,
            },
            LivePacketType::ChangeRejected => Self::ChangeRejected {
                reason: r.read_string()?,
            },
            LivePacketType::ChatMessageToClients => Self::Chat {
                peer_id: r.read_u32()?,
                name: r.read_string()?,
                text: r.read_string()?,
            },
            other => return Err(ProtocolError::UnexpectedPacket(other)),
        };
        expect_end(&r)?;
        Ok(packet)
    }
}

fn decode_client_hello(r: &mut PacketReader<'_>) -> Result<ClientHello, CodecError> {
    Ok(ClientHello {
        map_version: r.read_u32()?,
        client_version: r.read_u32()?,
        name: r.read_string()?,
        password: r.read_string()?,
    })
}

fn expect_end(r: &PacketReader<'_>) -> Result<(), ProtocolError> {
    match r.remaining() {
        0 => Ok(()),
        n => Err(ProtocolError::TrailingBytes(n)),
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Tag does not name any packet type
    UnknownPacketType(u8),
    /// Known packet type that is not valid here
    UnexpectedPacket(LivePacketType),
    /// Payload field failed to decode
    Malformed(CodecError),
    /// Payload had bytes left after the last field
    TrailingBytes(usize),
    /// Invalid length prefix
    Framing(FramingError),
    ConnectionClosed,
    Timeout,
    Io(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownPacketType(tag) => write!(f, "Unknown packet type 0x{tag:02x}"),
            Self::UnexpectedPacket(t) => write!(f, "Unexpected packet {t:?}"),
            Self::Malformed(e) => write!(f, "Malformed payload: {e}"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after payload"),
            Self::Framing(e) => write!(f, "Framing error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        Self::Malformed(e)
    }
}

impl From<FramingError> for ProtocolError {
    fn from(e: FramingError) -> Self {
        Self::Framing(e)
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
