//! Per-connection protocol state machine.
//!
//! ```text
//!            HelloFromClient (accepted)             ReadyClient
//! Unauthenticated ──────────────────► Authenticated ──────────► Authenticated + ready
//!        │                                  │
//!        │ anything else / kick             │ transport closed / kick / violation
//!        ▼                                  ▼
//!      Closed ◄─────────────────────────────┘
//! ```
//!
//! Each connection runs a reader (this module's [`PeerConnection`]) and a
//! writer task draining the peer's outbound queue. Inbound packets are
//! handled strictly in receive order. Whatever ends the connection, the
//! disconnect bookkeeping runs exactly once.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};

use crate::auth::{AuthResult, Permission, UserId};
use crate::broadcast::{Audience, Outbound, PeerEntry};
use crate::codec::Position;
use crate::framing::{Frame, FrameDecoder};
use crate::presence::{PeerColor, PeerId, PeerIdentity};
use crate::protocol::{
    ClientHello, ClientPacket, LivePacketType, ProtocolError, ServerPacket, MAX_CHANGE_PAYLOAD,
};
use crate::server::ServerContext;

pub const SERVER_FULL: &str = "Server is full.";
pub const INCORRECT_PASSWORD: &str = "Incorrect password.";
pub const INVALID_CREDENTIALS: &str = "Invalid username or password.";
pub const SESSION_EXPIRED: &str = "Session expired.";
pub const NOT_READY: &str = "Client is not ready.";

const READ_CHUNK: usize = 16 * 1024;

/// Whether the read loop keeps going after a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// An accepted peer.
#[derive(Debug)]
struct Login {
    peer_id: PeerId,
    name: String,
    color: PeerColor,
    ready: bool,
    user_id: Option<UserId>,
    token: Option<String>,
}

#[derive(Debug)]
enum PeerState {
    Unauthenticated,
    Authenticated(Login),
    Closed,
}

/// Reader side of one client connection.
pub(crate) struct PeerConnection {
    ctx: Arc<ServerContext>,
    remote_addr: String,
    state: PeerState,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Serve one connection until it closes, then clean up.
pub(crate) async fn serve_connection<S>(ctx: Arc<ServerContext>, stream: S, remote_addr: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    ctx.connection_opened();
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(Notify::new());
    let writer_task = tokio::spawn(write_loop(writer, rx, closed.clone()));

    let mut conn = PeerConnection::new(ctx, remote_addr, tx);
    match conn.read_loop(&mut reader, &closed).await {
        Ok(()) => log::debug!("{} closed", conn.label()),
        Err(ProtocolError::Io(e)) => log::error!("Transport error on {}: {e}", conn.label()),
        Err(e) => log::warn!("Dropping {}: {e}", conn.label()),
    }
    conn.disconnect().await;

    // The queue closes once the last sender is gone; the writer then
    // flushes what is left and shuts the transport down.
    drop(conn);
    if let Err(e) = writer_task.await {
        log::error!("Writer task failed: {e}");
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>, closed: Arc<Notify>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Packet(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    log::debug!("Write failed: {e}");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    closed.notify_one();
}

impl PeerConnection {
    fn new(ctx: Arc<ServerContext>, remote_addr: String, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        log::debug!("Connection from {remote_addr}");
        Self {
            ctx,
            remote_addr,
            state: PeerState::Unauthenticated,
            tx,
        }
    }

    /// Log label: the peer id once known, the remote address before.
    fn label(&self) -> String {
        match &self.state {
            PeerState::Authenticated(login) => format!("peer {}", login.peer_id),
            _ => self.remote_addr.clone(),
        }
    }

    async fn read_loop<R>(&mut self, reader: &mut R, closed: &Notify) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => read?,
                _ = closed.notified() => return Ok(()),
            };
            if n == 0 {
                return Ok(());
            }
            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.next_frame()? {
                if self.handle_frame(frame).await? == Flow::Close {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Flow, ProtocolError> {
        let packet_type = LivePacketType::try_from(frame.tag)?;
        if !packet_type.is_client_packet() {
            return Err(ProtocolError::UnexpectedPacket(packet_type));
        }
        log::trace!("{} sent {packet_type:?} ({} bytes)", self.label(), frame.payload.len());

        match self.state {
            PeerState::Unauthenticated => {
                if packet_type != LivePacketType::HelloFromClient {
                    return Err(ProtocolError::UnexpectedPacket(packet_type));
                }
                match ClientPacket::decode(frame.tag, &frame.payload)? {
                    ClientPacket::Hello(hello) => self.login(hello).await,
                    other => Err(ProtocolError::UnexpectedPacket(other.packet_type())),
                }
            }
            PeerState::Authenticated(_) => {
                let packet = ClientPacket::decode(frame.tag, &frame.payload)?;
                self.dispatch(packet).await
            }
            PeerState::Closed => Ok(Flow::Close),
        }
    }

    fn send(&self, packet: &ServerPacket) -> Result<(), ProtocolError> {
        self.tx
            .send(Outbound::packet(packet)?)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn relay(&self, audience: Audience, packet: &ServerPacket) -> Result<(), ProtocolError> {
        self.ctx.relay.send(audience, packet)
    }

    fn kick(&self, reason: &str) -> Result<Flow, ProtocolError> {
        log::warn!("Kicking {}: {reason}", self.label());
        self.send(&ServerPacket::Kick {
            reason: reason.to_string(),
        })?;
        Ok(Flow::Close)
    }

    async fn login(&mut self, hello: ClientHello) -> Result<Flow, ProtocolError> {
        let ctx = self.ctx.clone();
        let config = &ctx.config;
        log::debug!(
            "Hello from {} as '{}' (map {}, client {})",
            self.remote_addr,
            hello.name,
            hello.map_version,
            hello.client_version
        );

        let (user_id, token) = match &ctx.auth {
            Some(auth) => match auth.authenticate(&hello.name, &hello.password, &self.remote_addr) {
                AuthResult::Success { user_id, token } => (Some(user_id), Some(token)),
                AuthResult::ServerFull => return self.kick(SERVER_FULL),
                AuthResult::InvalidCredentials => return self.kick(INVALID_CREDENTIALS),
                AuthResult::UserBanned { reason } => {
                    return self.kick(&format!("You are banned: {reason}"));
                }
            },
            None => {
                if ctx.peers.len().await >= config.max_users {
                    return self.kick(SERVER_FULL);
                }
                if !config.password_matches(&hello.password) {
                    return self.kick(INCORRECT_PASSWORD);
                }
                (None, None)
            }
        };

        let peer_id = ctx.allocate_peer_id();
        let color = config.palette.color_for(peer_id - 1);
        let name = if hello.name.is_empty() {
            format!("Peer {peer_id}")
        } else {
            hello.name
        };

        let greeting = [
            Outbound::packet(&ServerPacket::Hello {
                server_name: config.server_name.clone(),
                map: ctx.document.descriptor(),
            })?,
            Outbound::packet(&ServerPacket::YourIdColor { peer_id, color })?,
        ];
        let identity = PeerIdentity::new(peer_id, name.clone(), color);
        let entry = PeerEntry::new(identity, user_id, self.remote_addr.clone(), self.tx.clone());
        if !ctx.peers.admit(entry, config.max_users, &greeting).await {
            if let (Some(auth), Some(uid)) = (&ctx.auth, user_id) {
                auth.logout(uid);
            }
            return self.kick(SERVER_FULL);
        }

        log::info!("Peer {peer_id} ('{name}') joined from {}", self.remote_addr);
        self.state = PeerState::Authenticated(Login {
            peer_id,
            name,
            color,
            ready: false,
            user_id,
            token,
        });
        Ok(Flow::Continue)
    }

    fn login_ref(&self) -> Result<&Login, ProtocolError> {
        match &self.state {
            PeerState::Authenticated(login) => Ok(login),
            _ => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn permitted(&self, login: &Login, permission: Permission) -> bool {
        match (&self.ctx.auth, login.user_id) {
            (Some(auth), Some(uid)) => auth.has_permission(uid, permission),
            _ => self.ctx.config.default_role.has_permission(permission),
        }
    }

    /// Reason to refuse `packet_type`, if any.
    fn denial(&self, login: &Login, needs_ready: bool, permission: Permission) -> Option<String> {
        if needs_ready && !login.ready {
            return Some(NOT_READY.to_string());
        }
        if !self.permitted(login, permission) {
            return Some(format!("Missing permission '{permission}'."));
        }
        None
    }

    fn deny(&self, packet_type: LivePacketType, reason: String) -> Result<Flow, ProtocolError> {
        log::debug!("Denied {packet_type:?} from {}: {reason}", self.label());
        self.send(&ServerPacket::ActionDenied {
            packet: packet_type as u8,
            reason,
        })?;
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, packet: ClientPacket) -> Result<Flow, ProtocolError> {
        let login = self.login_ref()?;
        if let (Some(auth), Some(uid), Some(token)) = (&self.ctx.auth, login.user_id, &login.token) {
            if !auth.validate_session(uid, token) {
                return self.kick(SESSION_EXPIRED);
            }
        }

        match packet {
            ClientPacket::Hello(_) => Err(ProtocolError::UnexpectedPacket(LivePacketType::HelloFromClient)),
            ClientPacket::Ready => {
                let peer_id = login.peer_id;
                if let PeerState::Authenticated(login) = &mut self.state {
                    login.ready = true;
                }
                if self.ctx.peers.set_ready(peer_id).await {
                    log::info!("Peer {peer_id} is ready");
                }
                Ok(Flow::Continue)
            }
            ClientPacket::NodeRequest { position } => self.node_request(position),
            ClientPacket::ReceiveChanges { payload } => self.receive_changes(payload),
            ClientPacket::Chat { text } => {
                if let Some(reason) = self.denial(login, false, Permission::Chat) {
                    return self.deny(LivePacketType::ChatMessage, reason);
                }
                log::debug!("Chat from peer {}: {text}", login.peer_id);
                self.relay(
                    Audience::Except(login.peer_id),
                    &ServerPacket::Chat {
                        peer_id: login.peer_id,
                        name: login.name.clone(),
                        text,
                    },
                )?;
                Ok(Flow::Continue)
            }
            ClientPacket::CursorUpdate { position } => {
                self.relay(
                    Audience::ReadyExcept(login.peer_id),
                    &ServerPacket::CursorUpdate {
                        peer_id: login.peer_id,
                        color: login.color,
                        position,
                    },
                )?;
                Ok(Flow::Continue)
            }
            ClientPacket::ColorUpdate { color } => {
                let peer_id = login.peer_id;
                if let PeerState::Authenticated(login) = &mut self.state {
                    login.color = color;
                }
                self.ctx.peers.set_color(peer_id, color).await;
                self.relay(
                    Audience::ReadyExcept(peer_id),
                    &ServerPacket::ClientColor { peer_id, color },
                )?;
                Ok(Flow::Continue)
            }
        }
    }

    fn node_request(&self, position: Position) -> Result<Flow, ProtocolError> {
        let login = self.login_ref()?;
        if let Some(reason) = self.denial(login, true, Permission::ViewMap) {
            return self.deny(LivePacketType::NodeRequest, reason);
        }
        let tile = self.ctx.document.get_tile(position);
        self.send(&ServerPacket::NodeData { position, tile })?;
        Ok(Flow::Continue)
    }

    fn receive_changes(&self, payload: Vec<u8>) -> Result<Flow, ProtocolError> {
        let login = self.login_ref()?;
        if let Some(reason) = self.denial(login, true, Permission::EditMap) {
            return self.deny(LivePacketType::ReceiveChanges, reason);
        }
        // The relayed packet must fit in one frame, so refuse before applying.
        if payload.len() > MAX_CHANGE_PAYLOAD {
            log::debug!(
                "Rejected {} byte change from peer {}",
                payload.len(),
                login.peer_id
            );
            self.send(&ServerPacket::ChangeRejected {
                reason: format!(
                    "Change of {} bytes exceeds the limit of {MAX_CHANGE_PAYLOAD} bytes",
                    payload.len()
                ),
            })?;
            return Ok(Flow::Continue);
        }
        match self.ctx.document.apply_change(login.peer_id, &payload) {
            Ok(applied) => {
                log::debug!(
                    "Applied change from peer {} (version {})",
                    login.peer_id,
                    applied.version
                );
                let relayed = ServerPacket::Changes {
                    origin: login.peer_id,
                    version: applied.version,
                    payload: applied.payload,
                };
                // Already applied: a relay failure must not take the sender down too.
                if let Err(e) = self.relay(Audience::ReadyExcept(login.peer_id), &relayed) {
                    log::error!(
                        "Failed to relay change {} from peer {}: {e}",
                        applied.version,
                        login.peer_id
                    );
                }
            }
            Err(rejection) => {
                log::debug!("Rejected change from peer {}: {rejection}", login.peer_id);
                self.send(&ServerPacket::ChangeRejected {
                    reason: rejection.reason,
                })?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Drop the peer from the table, tell the others and log the user out.
    /// Runs at most once per connection.
    async fn disconnect(&mut self) {
        let PeerState::Authenticated(login) = std::mem::replace(&mut self.state, PeerState::Closed) else {
            return;
        };
        if self.ctx.peers.remove(login.peer_id).await.is_none() {
            return;
        }
        log::info!("Peer {} ('{}') left", login.peer_id, login.name);
        if let Err(e) = self.relay(
            Audience::Except(login.peer_id),
            &ServerPacket::PeerLeft {
                peer_id: login.peer_id,
            },
        ) {
            log::error!("Failed to announce departure of peer {}: {e}", login.peer_id);
        }

        if let (Some(auth), Some(uid), Some(token)) = (&self.ctx.auth, login.user_id, &login.token) {
            // A newer login of the same user keeps its session.
            if auth.session(uid).is_some_and(|s| &s.token == token) {
                auth.logout(uid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{encode_tile_changes, InMemoryMap, TileChange};
    use crate::server::{ServerConfig, SessionServer};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Raw protocol driver over an in-memory pipe.
    struct Wire {
        stream: DuplexStream,
        decoder: FrameDecoder,
    }

    impl Wire {
        fn connect(server: &SessionServer) -> Self {
            let (client, server_side) = tokio::io::duplex(64 * 1024);
            let server = server.clone();
            tokio::spawn(async move {
                server.serve_stream(server_side, "duplex".to_string()).await;
            });
            Self {
                stream: client,
                decoder: FrameDecoder::new(),
            }
        }

        async fn send(&mut self, packet: ClientPacket) {
            self.stream.write_all(&packet.encode().unwrap()).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        /// Next packet, or `None` once the server closed the pipe.
        async fn recv(&mut self) -> Option<ServerPacket> {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = self.decoder.next_frame().unwrap() {
                    return Some(ServerPacket::decode(frame.tag, &frame.payload).unwrap());
                }
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut buf))
                    .await
                    .expect("timed out waiting for the server")
                    .unwrap();
                if n == 0 {
                    return None;
                }
                self.decoder.extend(&buf[..n]);
            }
        }

        async fn expect_closed(&mut self) {
            while self.recv().await.is_some() {}
        }
    }

    fn hello(name: &str, password: &str) -> ClientPacket {
        ClientPacket::Hello(ClientHello {
            map_version: 1,
            client_version: 1,
            name: name.into(),
            password: password.into(),
        })
    }

    fn server(config: ServerConfig) -> (SessionServer, Arc<InMemoryMap>) {
        let map = Arc::new(InMemoryMap::new("test", 32, 32));
        (SessionServer::new(config, map.clone()).unwrap(), map)
    }

    async fn join(server: &SessionServer, name: &str) -> (Wire, PeerId) {
        let mut wire = Wire::connect(server);
        wire.send(hello(name, "")).await;
        assert!(matches!(wire.recv().await, Some(ServerPacket::Hello { .. })));
        let Some(ServerPacket::YourIdColor { peer_id, .. }) = wire.recv().await else {
            panic!("expected YourIdColor");
        };
        (wire, peer_id)
    }

    async fn wait_ready(server: &SessionServer, peer_id: PeerId) {
        for _ in 0..200 {
            if server.peers().await.iter().any(|p| p.id == peer_id && p.ready) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("peer {peer_id} never became ready");
    }

    async fn wait_online(server: &SessionServer, count: usize) {
        for _ in 0..200 {
            if server.online_count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("online count never reached {count}");
    }

    #[tokio::test]
    async fn test_hello_gets_descriptor_and_first_palette_color() {
        let (server, _map) = server(ServerConfig::default());
        let mut wire = Wire::connect(&server);
        wire.send(hello("alice", "")).await;

        match wire.recv().await {
            Some(ServerPacket::Hello { server_name, map }) => {
                assert_eq!(server_name, "Logos Live");
                assert_eq!(map.name, "test");
                assert_eq!((map.width, map.height), (32, 32));
            }
            other => panic!("expected hello, got {other:?}"),
        }
        assert_eq!(
            wire.recv().await,
            Some(ServerPacket::YourIdColor {
                peer_id: 1,
                color: server.config().palette.color_for(0),
            })
        );
    }

    #[tokio::test]
    async fn test_packet_before_hello_closes() {
        let (server, _map) = server(ServerConfig::default());
        let mut wire = Wire::connect(&server);
        wire.send(ClientPacket::Ready).await;
        wire.expect_closed().await;
        assert_eq!(server.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_length_frame_closes() {
        let (server, _map) = server(ServerConfig::default());
        let (mut wire, _) = join(&server, "alice").await;
        wire.send_raw(&0u32.to_le_bytes()).await;
        wire.expect_closed().await;
        assert_eq!(server.online_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_packet_from_client_closes() {
        let (server, _map) = server(ServerConfig::default());
        let (mut wire, _) = join(&server, "alice").await;
        wire.send_raw(&[1, 0, 0, 0, LivePacketType::KickFromServer as u8]).await;
        wire.expect_closed().await;
    }

    #[tokio::test]
    async fn test_malformed_payload_closes() {
        let (server, _map) = server(ServerConfig::default());
        let (mut wire, _) = join(&server, "alice").await;
        // NodeRequest with a 2-byte position.
        wire.send_raw(&[3, 0, 0, 0, LivePacketType::NodeRequest as u8, 1, 2]).await;
        wire.expect_closed().await;
    }

    #[tokio::test]
    async fn test_second_hello_closes() {
        let (server, _map) = server(ServerConfig::default());
        let (mut wire, _) = join(&server, "alice").await;
        wire.send(hello("alice", "")).await;
        wire.expect_closed().await;
    }

    #[tokio::test]
    async fn test_split_hello_is_accepted() {
        let (server, _map) = server(ServerConfig::default());
        let mut wire = Wire::connect(&server);
        let bytes = hello("alice", "").encode().unwrap();
        for chunk in bytes.chunks(3) {
            wire.send_raw(chunk).await;
            tokio::task::yield_now().await;
        }
        assert!(matches!(wire.recv().await, Some(ServerPacket::Hello { .. })));
    }

    #[tokio::test]
    async fn test_node_request_requires_ready() {
        let (server, map) = server(ServerConfig::default());
        map.set_tile(Position::new(1, 2, 7), b"grass".to_vec());
        let (mut wire, peer_id) = join(&server, "alice").await;

        wire.send(ClientPacket::NodeRequest {
            position: Position::new(1, 2, 7),
        })
        .await;
        assert_eq!(
            wire.recv().await,
            Some(ServerPacket::ActionDenied {
                packet: LivePacketType::NodeRequest as u8,
                reason: NOT_READY.into(),
            })
        );

        wire.send(ClientPacket::Ready).await;
        wait_ready(&server, peer_id).await;
        wire.send(ClientPacket::NodeRequest {
            position: Position::new(1, 2, 7),
        })
        .await;
        assert_eq!(
            wire.recv().await,
            Some(ServerPacket::NodeData {
                position: Position::new(1, 2, 7),
                tile: Some(b"grass".to_vec()),
            })
        );

        wire.send(ClientPacket::NodeRequest {
            position: Position::new(9, 9, 7),
        })
        .await;
        assert_eq!(
            wire.recv().await,
            Some(ServerPacket::NodeData {
                position: Position::new(9, 9, 7),
                tile: None,
            })
        );
    }

    #[tokio::test]
    async fn test_guest_role_cannot_edit() {
        let config = ServerConfig {
            default_role: crate::auth::Role::Guest,
            ..ServerConfig::default()
        };
        let (server, map) = server(config);
        let (mut wire, peer_id) = join(&server, "alice").await;
        wire.send(ClientPacket::Ready).await;
        wait_ready(&server, peer_id).await;

        let payload = encode_tile_changes(&[TileChange {
            position: Position::new(0, 0, 7),
            data: b"wall".to_vec(),
        }])
        .unwrap();
        wire.send(ClientPacket::ReceiveChanges { payload }).await;
        match wire.recv().await {
            Some(ServerPacket::ActionDenied { packet, reason }) => {
                assert_eq!(packet, LivePacketType::ReceiveChanges as u8);
                assert!(reason.contains("edit_map"));
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert_eq!(map.tile_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_change_replies_to_sender() {
        let (server, map) = server(ServerConfig::default());
        let (mut wire, peer_id) = join(&server, "alice").await;
        wire.send(ClientPacket::Ready).await;
        wait_ready(&server, peer_id).await;

        let payload = encode_tile_changes(&[TileChange {
            position: Position::new(100, 0, 7),
            data: b"wall".to_vec(),
        }])
        .unwrap();
        wire.send(ClientPacket::ReceiveChanges { payload }).await;
        match wire.recv().await {
            Some(ServerPacket::ChangeRejected { reason }) => assert!(reason.contains("outside")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(map.version(), 0);
    }

    #[tokio::test]
    async fn test_change_size_limit_keeps_peers_in_step() {
        let (server, map) = server(ServerConfig::default());
        let (mut alice, alice_id) = join(&server, "alice").await;
        let (mut bob, bob_id) = join(&server, "bob").await;
        alice.send(ClientPacket::Ready).await;
        bob.send(ClientPacket::Ready).await;
        wait_ready(&server, alice_id).await;
        wait_ready(&server, bob_id).await;
        assert!(matches!(alice.recv().await, Some(ServerPacket::PeerJoined { peer_id, .. }) if peer_id == bob_id));
        assert!(matches!(bob.recv().await, Some(ServerPacket::PeerJoined { peer_id, .. }) if peer_id == alice_id));

        // One tile entry costs 13 bytes on top of its data.
        let change_of = |len: usize| {
            encode_tile_changes(&[TileChange {
                position: Position::new(0, 0, 7),
                data: vec![1u8; len - 13],
            }])
            .unwrap()
        };

        let too_big = change_of(MAX_CHANGE_PAYLOAD + 1);
        assert_eq!(too_big.len(), MAX_CHANGE_PAYLOAD + 1);
        alice.send(ClientPacket::ReceiveChanges { payload: too_big }).await;
        match alice.recv().await {
            Some(ServerPacket::ChangeRejected { reason }) => assert!(reason.contains("exceeds")),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(map.version(), 0);

        let largest = change_of(MAX_CHANGE_PAYLOAD);
        alice
            .send(ClientPacket::ReceiveChanges {
                payload: largest.clone(),
            })
            .await;
        assert_eq!(
            bob.recv().await,
            Some(ServerPacket::Changes {
                origin: alice_id,
                version: 1,
                payload: largest,
            })
        );
        assert_eq!(map.version(), 1);
        assert_eq!(server.online_count().await, 2);
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer_and_notifies() {
        let (server, _map) = server(ServerConfig::default());
        let (mut alice, _) = join(&server, "alice").await;
        let (bob, bob_id) = join(&server, "bob").await;

        assert!(matches!(alice.recv().await, Some(ServerPacket::PeerJoined { .. })));
        drop(bob);
        assert_eq!(alice.recv().await, Some(ServerPacket::PeerLeft { peer_id: bob_id }));
        assert_eq!(server.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_kick_closes_connection() {
        let (server, _map) = server(ServerConfig::default());
        let (mut wire, peer_id) = join(&server, "alice").await;
        assert!(server.kick(peer_id, "Bye.").await);
        assert_eq!(wire.recv().await, Some(ServerPacket::Kick { reason: "Bye.".into() }));
        wire.expect_closed().await;
        wait_online(&server, 0).await;
    }

    #[tokio::test]
    async fn test_color_update_is_stored() {
        let (server, _map) = server(ServerConfig::default());
        let (mut wire, peer_id) = join(&server, "alice").await;
        let color = PeerColor::rgb(1, 2, 3);
        wire.send(ClientPacket::ColorUpdate { color }).await;
        for _ in 0..200 {
            if server.peers().await[0].color == color {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("color of peer {peer_id} never changed");
    }
}
