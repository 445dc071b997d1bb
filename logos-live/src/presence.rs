//! Peer presence: identity, cursor colors and the color palette.
//!
//! The server owns one [`Palette`] and hands colors out in join order,
//! wrapping around once every entry is taken. Colors may repeat; the
//! palette size never limits how many peers can join.

/// Server-assigned peer identifier. Allocated monotonically from 1 and
/// never reused while the server process lives.
pub type PeerId = u32;

/// 24-bit RGB color for cursor rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PeerColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl Default for PeerColor {
    fn default() -> Self {
        Self::rgb(0x42, 0x85, 0xF4) // Default blue
    }
}

/// Ordered set of cursor colors handed out to joining peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<PeerColor>,
}

impl Palette {
    /// Build a palette from explicit colors. An empty list falls back to the
    /// default palette so that indexing can never fail.
    pub fn new(colors: Vec<PeerColor>) -> Self {
        if colors.is_empty() {
            return Self::default();
        }
        Self { colors }
    }

    /// Color for the `index`-th accepted peer (wraps around).
    pub fn color_for(&self, index: u32) -> PeerColor {
        self.colors[index as usize % self.colors.len()]
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn colors(&self) -> &[PeerColor] {
        &self.colors
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            colors: vec![
                PeerColor::rgb(0xE6, 0x19, 0x4B), // red
                PeerColor::rgb(0x3C, 0xB4, 0x4B), // green
                PeerColor::rgb(0x43, 0x63, 0xD8), // blue
                PeerColor::rgb(0xF5, 0x82, 0x31), // orange
                PeerColor::rgb(0x91, 0x1E, 0xB4), // purple
                PeerColor::rgb(0x46, 0xF0, 0xF0), // cyan
                PeerColor::rgb(0xF0, 0x32, 0xE6), // magenta
                PeerColor::rgb(0xBC, 0xF6, 0x0C), // lime
                PeerColor::rgb(0xFA, 0xBE, 0xBE), // pink
                PeerColor::rgb(0x00, 0x80, 0x80), // teal
            ],
        }
    }
}

/// Public identity of an accepted peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub name: String,
    pub color: PeerColor,
    pub ready: bool,
}

impl PeerIdentity {
    pub fn new(id: PeerId, name: impl Into<String>, color: PeerColor) -> Self {
        Self {
            id,
            name: name.into(),
            color,
            ready: false,
        }
    }
}
