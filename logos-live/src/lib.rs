//! # logos-live — Live collaborative map editing for Logos
//!
//! A session server that lets several clients edit one shared map at once,
//! see each other's cursors and chat, over a small length-framed binary
//! protocol on TCP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   TCP, framed     ┌───────────────┐
//! │ LiveClient  │ ◄───────────────► │ SessionServer │
//! │ (per user)  │   binary packets  │ (central)     │
//! └─────────────┘                   └──────┬────────┘
//!                                          │ one PeerConnection per socket
//!                     ┌────────────────────┼────────────────────┐
//!                     ▼                    ▼                    ▼
//!              ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//!              │AuthRegistry │      │LiveDocument │      │ Relay       │
//!              │(sessions)   │      │(tiles)      │      │ (fan-out)   │
//!              └─────────────┘      └─────────────┘      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — Typed little-endian packet reader/writer
//! - [`framing`] — Length-prefixed frames over a byte stream
//! - [`protocol`] — Packet tags and typed client/server packets
//! - [`presence`] — Peer identity and cursor colors
//! - [`auth`] — Accounts, roles, sessions and bans
//! - [`document`] — Document interfaces and an in-memory map
//! - [`broadcast`] — Peer table and relay fan-out
//! - [`peer`] — Per-connection state machine
//! - [`server`] — TCP session server
//! - [`client`] — TCP client

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod codec;
pub mod document;
pub mod framing;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod server;

// Re-exports for convenience
pub use auth::{AuthConfig, AuthRegistry, AuthResult, Permission, Role, UserAccount};
pub use broadcast::{Audience, PeerTable, Relay};
pub use client::{ClientEvent, LiveClient, LoginOutcome, Welcome};
pub use codec::{CodecError, PacketReader, PacketWriter, Position, MAX_MESSAGE_SIZE};
pub use document::{
    ChangeApplier, ChangeRejection, DocumentSnapshot, InMemoryMap, LiveDocument, MapDescriptor,
};
pub use framing::{FrameDecoder, FramingError};
pub use presence::{Palette, PeerColor, PeerId, PeerIdentity};
pub use protocol::{ClientHello, ClientPacket, LivePacketType, ProtocolError, ServerPacket};
pub use server::{ServerConfig, ServerError, SessionServer};
