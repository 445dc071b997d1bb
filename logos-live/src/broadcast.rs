//! Live peer table and relay fan-out.
//!
//! Every accepted peer has an entry holding its public identity and the
//! sending half of its outbound queue. Connections never write to each
//! other directly: they push a [`RelayEvent`] into the [`Relay`] and the
//! fan-out loop delivers the pre-encoded bytes to every matching queue.
//!
//! ```text
//! Peer A ──┐                              ┌──► queue B ──► writer B
//!          ├──► Relay ──► fan_out loop ───┤
//! Peer C ──┘        (one mpsc)            └──► queue C ──► writer C
//! ```
//!
//! A single fan-out loop keeps relay order per destination. Packets are
//! encoded once and shared between destinations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};

use crate::auth::UserId;
use crate::presence::{PeerColor, PeerId, PeerIdentity};
use crate::protocol::{ProtocolError, ServerPacket};

/// Item on a peer's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A framed packet
    Packet(Arc<Vec<u8>>),
    /// Flush everything queued before this, then close the transport
    Close,
}

impl Outbound {
    pub fn packet(packet: &ServerPacket) -> Result<Self, ProtocolError> {
        Ok(Self::Packet(Arc::new(packet.encode()?)))
    }
}

/// Which peers a relayed packet goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Ready peers except the origin
    ReadyExcept(PeerId),
    /// Every ready peer
    Ready,
    /// Every accepted peer except the origin, ready or not
    Except(PeerId),
}

impl Audience {
    fn includes(self, peer: &PeerIdentity) -> bool {
        match self {
            Self::ReadyExcept(origin) => peer.ready && peer.id != origin,
            Self::Ready => peer.ready,
            Self::Except(origin) => peer.id != origin,
        }
    }
}

/// An encoded packet on its way to an audience.
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub audience: Audience,
    pub bytes: Arc<Vec<u8>>,
}

/// A peer in the live table.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub identity: PeerIdentity,
    /// Account behind the peer, in account mode
    pub user_id: Option<UserId>,
    pub remote_addr: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PeerEntry {
    pub fn new(
        identity: PeerIdentity,
        user_id: Option<UserId>,
        remote_addr: impl Into<String>,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            identity,
            user_id,
            remote_addr: remote_addr.into(),
            tx,
        }
    }

    fn push(&self, item: Outbound) -> bool {
        self.tx.send(item).is_ok()
    }
}

fn joined_packet(identity: &PeerIdentity) -> ServerPacket {
    ServerPacket::PeerJoined {
        peer_id: identity.id,
        name: identity.name.clone(),
        color: identity.color,
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub events_relayed: u64,
    pub packets_delivered: u64,
    pub active_peers: usize,
}

/// The set of accepted peers, keyed by peer id.
pub struct PeerTable {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    events_relayed: AtomicU64,
    packets_delivered: AtomicU64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            events_relayed: AtomicU64::new(0),
            packets_delivered: AtomicU64::new(0),
        }
    }

    /// Insert a peer if fewer than `capacity` peers are present.
    ///
    /// Under the same lock, the new peer is queued `greeting` followed by a
    /// `PeerJoined` for every peer already present, and every present peer
    /// is queued the newcomer's `PeerJoined`. Nothing relayed afterwards can
    /// overtake these, and each peer hears of every other exactly once.
    /// Returns `false` when full.
    pub async fn admit(&self, entry: PeerEntry, capacity: usize, greeting: &[Outbound]) -> bool {
        let mut peers = self.peers.write().await;
        if peers.len() >= capacity {
            return false;
        }
        for item in greeting {
            entry.push(item.clone());
        }
        match Outbound::packet(&joined_packet(&entry.identity)) {
            Ok(item) => {
                for other in peers.values() {
                    other.push(item.clone());
                }
            }
            Err(e) => log::error!("Failed to announce peer {}: {e}", entry.identity.id),
        }
        let mut present: Vec<&PeerEntry> = peers.values().collect();
        present.sort_by_key(|e| e.identity.id);
        for other in present {
            match Outbound::packet(&joined_packet(&other.identity)) {
                Ok(item) => {
                    entry.push(item);
                }
                Err(e) => log::error!("Failed to encode roster entry {}: {e}", other.identity.id),
            }
        }
        peers.insert(entry.identity.id, entry);
        true
    }

    /// Remove a peer. `None` if it was already gone.
    pub async fn remove(&self, peer_id: PeerId) -> Option<PeerEntry> {
        self.peers.write().await.remove(&peer_id)
    }

    /// Mark a peer ready. Returns `true` on the first transition.
    pub async fn set_ready(&self, peer_id: PeerId) -> bool {
        match self.peers.write().await.get_mut(&peer_id) {
            Some(entry) if !entry.identity.ready => {
                entry.identity.ready = true;
                true
            }
            _ => false,
        }
    }

    pub async fn set_color(&self, peer_id: PeerId, color: PeerColor) {
        if let Some(entry) = self.peers.write().await.get_mut(&peer_id) {
            entry.identity.color = color;
        }
    }

    pub async fn identity(&self, peer_id: PeerId) -> Option<PeerIdentity> {
        self.peers.read().await.get(&peer_id).map(|e| e.identity.clone())
    }

    /// Identities of all peers, ordered by id.
    pub async fn snapshot(&self) -> Vec<PeerIdentity> {
        let mut list: Vec<PeerIdentity> = self
            .peers
            .read()
            .await
            .values()
            .map(|e| e.identity.clone())
            .collect();
        list.sort_by_key(|p| p.id);
        list
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.read().await.contains_key(&peer_id)
    }

    /// Peers logged in as `user_id`.
    pub async fn peers_of_user(&self, user_id: UserId) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .values()
            .filter(|e| e.user_id == Some(user_id))
            .map(|e| e.identity.id)
            .collect()
    }

    /// Queue items for one peer. Returns `false` if the peer is gone.
    pub async fn send_to(&self, peer_id: PeerId, items: &[Outbound]) -> bool {
        let peers = self.peers.read().await;
        let Some(entry) = peers.get(&peer_id) else {
            return false;
        };
        items.iter().all(|item| entry.push(item.clone()))
    }

    /// Queue a kick followed by a close for one peer.
    pub async fn kick(&self, peer_id: PeerId, reason: &str) -> bool {
        let kick = match Outbound::packet(&ServerPacket::Kick {
            reason: reason.to_string(),
        }) {
            Ok(item) => item,
            Err(e) => {
                log::error!("Failed to encode kick for peer {peer_id}: {e}");
                Outbound::Close
            }
        };
        let sent = self.send_to(peer_id, &[kick, Outbound::Close]).await;
        if sent {
            log::info!("Kicking peer {peer_id}: {reason}");
        }
        sent
    }

    /// Deliver an event to its audience. Returns the number of peers reached.
    pub async fn deliver(&self, event: &RelayEvent) -> usize {
        let peers = self.peers.read().await;
        let mut delivered = 0;
        for entry in peers.values().filter(|e| event.audience.includes(&e.identity)) {
            if entry.push(Outbound::Packet(event.bytes.clone())) {
                delivered += 1;
            }
        }
        self.events_relayed.fetch_add(1, Ordering::Relaxed);
        self.packets_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            events_relayed: self.events_relayed.load(Ordering::Relaxed),
            packets_delivered: self.packets_delivered.load(Ordering::Relaxed),
            active_peers: self.len().await,
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle used by connections and the server to enqueue relays.
#[derive(Debug, Clone)]
pub struct Relay {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl Relay {
    /// Create a relay and the receiver its fan-out loop consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Encode once and enqueue for `audience`.
    pub fn send(&self, audience: Audience, packet: &ServerPacket) -> Result<(), ProtocolError> {
        let bytes = Arc::new(packet.encode()?);
        self.send_raw(audience, bytes);
        Ok(())
    }

    /// Enqueue pre-encoded bytes.
    pub fn send_raw(&self, audience: Audience, bytes: Arc<Vec<u8>>) {
        if self.tx.send(RelayEvent { audience, bytes }).is_err() {
            log::debug!("Relay loop has stopped; dropping event for {audience:?}");
        }
    }
}

/// Drain relay events into the peer table until every [`Relay`] is dropped.
pub async fn fan_out(peers: Arc<PeerTable>, mut rx: mpsc::UnboundedReceiver<RelayEvent>) {
    while let Some(event) = rx.recv().await {
        let reached = peers.deliver(&event).await;
        log::trace!("Relayed {} bytes to {reached} peers ({:?})", event.bytes.len(), event.audience);
    }
    log::debug!("Relay loop finished");
}
