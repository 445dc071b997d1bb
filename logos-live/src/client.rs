//! TCP client for the live editing protocol.
//!
//! Provides:
//! - Connection setup over TCP or any byte stream
//! - The hello handshake
//! - Typed send/receive of protocol packets
//!
//! A reader task decodes incoming frames into [`ClientEvent`]s; a writer
//! task drains the outgoing queue, so sending never blocks on the socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, RwLock};

use crate::document::MapDescriptor;
use crate::framing::FrameDecoder;
use crate::presence::{PeerColor, PeerId};
use crate::protocol::{ClientHello, ClientPacket, ProtocolError, ServerPacket};

/// Map format version sent in the hello.
pub const MAP_VERSION: u32 = 1;

/// Client software version sent in the hello.
pub const CLIENT_VERSION: u32 = 1;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events emitted by the reader task.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Packet(ServerPacket),
    /// The connection ended, with the error that ended it, if any
    Disconnected(Option<ProtocolError>),
}

/// What the server granted on login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub server_name: String,
    pub map: MapDescriptor,
    pub peer_id: PeerId,
    pub color: PeerColor,
}

/// Outcome of [`LiveClient::hello`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted(Welcome),
    Kicked(String),
}

/// The live client.
pub struct LiveClient {
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_rx: mpsc::UnboundedReceiver<ClientEvent>,
    state: Arc<RwLock<ConnectionState>>,
    peer_id: Option<PeerId>,
}

impl LiveClient {
    /// Connect over TCP.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Speak the protocol over an already connected stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        // Writer task: forward the outgoing queue to the stream
        tokio::spawn(async move {
            while let Some(bytes) = outgoing_rx.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        // Reader task: frames → events
        let reader_state = state.clone();
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = vec![0u8; 16 * 1024];
            let error = 'read: loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break None,
                    Ok(n) => n,
                    Err(e) => break Some(ProtocolError::from(e)),
                };
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => match ServerPacket::decode(frame.tag, &frame.payload) {
                            Ok(packet) => {
                                if event_tx.send(ClientEvent::Packet(packet)).is_err() {
                                    break 'read None;
                                }
                            }
                            Err(e) => break 'read Some(e),
                        },
                        Ok(None) => break,
                        Err(e) => break 'read Some(e.into()),
                    }
                }
            };

            if let Some(e) = &error {
                log::debug!("Client connection failed: {e}");
            }
            *reader_state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected(error));
        });

        Self {
            outgoing_tx,
            event_rx,
            state,
            peer_id: None,
        }
    }

    /// Send a packet.
    pub fn send(&self, packet: &ClientPacket) -> Result<(), ProtocolError> {
        self.send_raw(packet.encode()?)
    }

    /// Send bytes as-is, framing included.
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.outgoing_tx
            .send(bytes)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Log in and wait for the server's verdict.
    pub async fn hello(&mut self, name: &str, password: &str) -> Result<LoginOutcome, ProtocolError> {
        self.send(&ClientPacket::Hello(ClientHello {
            map_version: MAP_VERSION,
            client_version: CLIENT_VERSION,
            name: name.to_string(),
            password: password.to_string(),
        }))?;

        let (server_name, map) = match self.recv().await? {
            ServerPacket::Hello { server_name, map } => (server_name, map),
            ServerPacket::Kick { reason } => return Ok(LoginOutcome::Kicked(reason)),
            other => {
                return Err(ProtocolError::UnexpectedPacket(other.packet_type()));
            }
        };
        match self.recv().await? {
            ServerPacket::YourIdColor { peer_id, color } => {
                self.peer_id = Some(peer_id);
                Ok(LoginOutcome::Accepted(Welcome {
                    server_name,
                    map,
                    peer_id,
                    color,
                }))
            }
            other => Err(ProtocolError::UnexpectedPacket(other.packet_type())),
        }
    }

    /// Finish the handshake.
    pub fn ready(&self) -> Result<(), ProtocolError> {
        self.send(&ClientPacket::Ready)
    }

    /// Next event from the server.
    pub async fn next_event(&mut self) -> ClientEvent {
        self.event_rx
            .recv()
            .await
            .unwrap_or(ClientEvent::Disconnected(None))
    }

    /// Next packet. Fails once the connection is gone.
    pub async fn recv(&mut self) -> Result<ServerPacket, ProtocolError> {
        match self.next_event().await {
            ClientEvent::Packet(packet) => Ok(packet),
            ClientEvent::Disconnected(Some(e)) => Err(e),
            ClientEvent::Disconnected(None) => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<ServerPacket, ProtocolError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Skip packets until one matches `pred`.
    pub async fn recv_until(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&ServerPacket) -> bool,
    ) -> Result<ServerPacket, ProtocolError> {
        tokio::time::timeout(timeout, async {
            loop {
                let packet = self.recv().await?;
                if pred(&packet) {
                    return Ok::<_, ProtocolError>(packet);
                }
            }
        })
        .await
        .map_err(|_| ProtocolError::Timeout)?
    }

    /// Drain packets until the server closes the connection.
    ///
    /// Returns the packets seen on the way, or `Timeout` if the connection
    /// is still open after `timeout`.
    pub async fn wait_closed(&mut self, timeout: Duration) -> Result<Vec<ServerPacket>, ProtocolError> {
        tokio::time::timeout(timeout, async {
            let mut seen = Vec::new();
            loop {
                match self.next_event().await {
                    ClientEvent::Packet(packet) => seen.push(packet),
                    ClientEvent::Disconnected(_) => return seen,
                }
            }
        })
        .await
        .map_err(|_| ProtocolError::Timeout)
    }

    /// Our peer id, once the hello succeeded.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Position;

    /// A client wired to a raw stream the test plays server on.
    fn pair() -> (LiveClient, tokio::io::DuplexStream) {
        let (client_side, server_side) = tokio::io::duplex(4096);
        (LiveClient::from_stream(client_side), server_side)
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let (client, _server) = pair();
        assert_eq!(client.connection_state().await, ConnectionState::Connected);
        assert_eq!(client.peer_id(), None);
    }

    #[tokio::test]
    async fn test_send_writes_frames() {
        let (client, mut server) = pair();
        let packet = ClientPacket::CursorUpdate {
            position: Position::new(1, 2, 7),
        };
        client.send(&packet).unwrap();

        let expected = packet.encode().unwrap();
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_hello_accepted() {
        let (mut client, mut server) = pair();
        let map = MapDescriptor {
            name: "m".into(),
            width: 8,
            height: 8,
            version: 0,
        };
        let mut reply = ServerPacket::Hello {
            server_name: "srv".into(),
            map: map.clone(),
        }
        .encode()
        .unwrap();
        reply.extend(
            ServerPacket::YourIdColor {
                peer_id: 4,
                color: PeerColor::rgb(1, 2, 3),
            }
            .encode()
            .unwrap(),
        );
        server.write_all(&reply).await.unwrap();

        let outcome = client.hello("alice", "").await.unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::Accepted(Welcome {
                server_name: "srv".into(),
                map,
                peer_id: 4,
                color: PeerColor::rgb(1, 2, 3),
            })
        );
        assert_eq!(client.peer_id(), Some(4));
    }

    #[tokio::test]
    async fn test_hello_kicked() {
        let (mut client, mut server) = pair();
        let kick = ServerPacket::Kick {
            reason: "Incorrect password.".into(),
        };
        server.write_all(&kick.encode().unwrap()).await.unwrap();
        assert_eq!(
            client.hello("alice", "nope").await.unwrap(),
            LoginOutcome::Kicked("Incorrect password.".into())
        );
    }

    #[tokio::test]
    async fn test_close_is_reported() {
        let (mut client, server) = pair();
        drop(server);
        assert_eq!(client.recv().await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_bad_frame_is_an_error() {
        let (mut client, mut server) = pair();
        server.write_all(&0u32.to_le_bytes()).await.unwrap();
        assert!(matches!(client.recv().await, Err(ProtocolError::Framing(_))));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (mut client, _server) = pair();
        assert_eq!(
            client.recv_timeout(Duration::from_millis(20)).await,
            Err(ProtocolError::Timeout)
        );
    }
}
