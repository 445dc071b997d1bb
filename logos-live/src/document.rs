//! Boundary to the shared map document.
//!
//! The session server never interprets map semantics. It reads through
//! [`DocumentSnapshot`] and writes through [`ChangeApplier`]; the document
//! behind those traits owns its own locking.
//!
//! [`InMemoryMap`] is a small tile store implementing both traits. It backs
//! the `logos-live` binary and the test suite.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::codec::{CodecError, PacketReader, PacketWriter, Position};
use crate::presence::PeerId;

/// Highest floor index accepted by [`InMemoryMap`].
pub const MAX_FLOOR: u8 = 15;

/// Serialized contents of one tile. Opaque to the session layer.
pub type TileSnapshot = Vec<u8>;

/// Summary of the document sent in the server hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapDescriptor {
    pub name: String,
    pub width: u16,
    pub height: u16,
    /// Number of changes applied so far
    pub version: u32,
}

impl MapDescriptor {
    pub fn encode(&self, w: &mut PacketWriter) {
        w.write_string(&self.name)
            .write_u16(self.width)
            .write_u16(self.height)
            .write_u32(self.version);
    }

    pub fn decode(r: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            name: r.read_string()?,
            width: r.read_u16()?,
            height: r.read_u16()?,
            version: r.read_u32()?,
        })
    }
}

/// Result of a successfully applied change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    /// Document version after the change
    pub version: u32,
    /// Payload to relay to the other peers
    pub payload: Vec<u8>,
}

/// Why the document refused a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRejection {
    pub reason: String,
}

impl ChangeRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ChangeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Read side of the document.
pub trait DocumentSnapshot: Send + Sync {
    fn descriptor(&self) -> MapDescriptor;

    fn get_tile(&self, position: Position) -> Option<TileSnapshot>;
}

/// Write side of the document.
pub trait ChangeApplier: Send + Sync {
    /// Apply a change on behalf of `origin`.
    ///
    /// The returned payload is relayed as is and must not exceed
    /// [`crate::protocol::MAX_CHANGE_PAYLOAD`].
    fn apply_change(&self, origin: PeerId, payload: &[u8]) -> Result<AppliedChange, ChangeRejection>;
}

/// A document the session server can serve.
pub trait LiveDocument: DocumentSnapshot + ChangeApplier {}

impl<T: DocumentSnapshot + ChangeApplier> LiveDocument for T {}

/// One tile write inside a change payload. Empty `data` removes the tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileChange {
    pub position: Position,
    pub data: Vec<u8>,
}

/// Encode tile changes as `count: u32 ‖ (position ‖ blob)*`.
pub fn encode_tile_changes(changes: &[TileChange]) -> Result<Vec<u8>, CodecError> {
    let mut w = PacketWriter::new();
    w.write_u32(changes.len() as u32);
    for change in changes {
        w.write_position(change.position).write_bytes(&change.data);
    }
    w.finish()
}

pub fn decode_tile_changes(payload: &[u8]) -> Result<Vec<TileChange>, CodecError> {
    let mut r = PacketReader::new(payload);
    let count = r.read_u32()?;
    // Each entry takes at least 9 bytes; don't trust the count for capacity.
    let mut changes = Vec::with_capacity((count as usize).min(r.remaining() / 9));
    for _ in 0..count {
        changes.push(TileChange {
            position: r.read_position()?,
            data: r.read_bytes()?,
        });
    }
    r.expect_end()?;
    Ok(changes)
}

#[derive(Debug, Default)]
struct MapState {
    tiles: HashMap<Position, TileSnapshot>,
    last_editor: HashMap<Position, PeerId>,
    version: u32,
}

/// In-memory tile map.
pub struct InMemoryMap {
    name: String,
    width: u16,
    height: u16,
    state: RwLock<MapState>,
}

impl InMemoryMap {
    pub fn new(name: impl Into<String>, width: u16, height: u16) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            state: RwLock::new(MapState::default()),
        }
    }

    pub fn contains(&self, position: Position) -> bool {
        position.x < self.width && position.y < self.height && position.z <= MAX_FLOOR
    }

    /// Write a tile directly, bypassing change attribution.
    pub fn set_tile(&self, position: Position, data: TileSnapshot) {
        self.state.write().tiles.insert(position, data);
    }

    /// Peer that last changed the tile at `position`.
    pub fn last_editor(&self, position: Position) -> Option<PeerId> {
        self.state.read().last_editor.get(&position).copied()
    }

    pub fn tile_count(&self) -> usize {
        self.state.read().tiles.len()
    }

    pub fn version(&self) -> u32 {
        self.state.read().version
    }
}

impl DocumentSnapshot for InMemoryMap {
    fn descriptor(&self) -> MapDescriptor {
        MapDescriptor {
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            version: self.version(),
        }
    }

    fn get_tile(&self, position: Position) -> Option<TileSnapshot> {
        self.state.read().tiles.get(&position).cloned()
    }
}

impl ChangeApplier for InMemoryMap {
    fn apply_change(&self, origin: PeerId, payload: &[u8]) -> Result<AppliedChange, ChangeRejection> {
        let changes = decode_tile_changes(payload)
            .map_err(|e| ChangeRejection::new(format!("Malformed change: {e}")))?;
        if changes.is_empty() {
            return Err(ChangeRejection::new("Empty change"));
        }
        // Validate everything first so a change applies completely or not at all.
        if let Some(bad) = changes.iter().find(|c| !self.contains(c.position)) {
            return Err(ChangeRejection::new(format!(
                "Position {} is outside the map",
                bad.position
            )));
        }

        let mut state = self.state.write();
        for change in &changes {
            if change.data.is_empty() {
                state.tiles.remove(&change.position);
            } else {
                state.tiles.insert(change.position, change.data.clone());
            }
            state.last_editor.insert(change.position, origin);
        }
        state.version = state.version.wrapping_add(1);

        Ok(AppliedChange {
            version: state.version,
            payload: payload.to_vec(),
        })
    }
}
