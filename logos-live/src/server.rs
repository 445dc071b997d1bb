//! TCP session server for live map editing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── AuthRegistry (accounts, sessions)
//!            ├── PeerConnection ─────┼── LiveDocument (tiles, changes)
//! Client B ──┘   (one task each)     └── Relay ──► fan-out ──► PeerTable
//!                                                                │
//!                                                ┌───────────────┼───────────┐
//!                                                ▼               ▼           ▼
//!                                             Client A        Client B    Client C
//! ```
//!
//! The server owns:
//! - the live [`PeerTable`] and the relay fan-out loop,
//! - the shared document,
//! - the optional account registry and its session sweeper,
//! - the peer id counter and the color palette.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::auth::{AccountError, AuthConfig, AuthRegistry, Role, StoreError};
use crate::broadcast::{self, Audience, PeerTable, Relay};
use crate::document::LiveDocument;
use crate::peer::{self, SESSION_EXPIRED};
use crate::presence::{Palette, PeerId, PeerIdentity};
use crate::protocol::{ProtocolError, ServerPacket};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Name announced in the server hello
    pub server_name: String,
    /// Shared server password (`None` = open server)
    pub password: Option<String>,
    /// Maximum number of concurrently accepted peers
    pub max_users: usize,
    /// Idle time after which an account session expires
    pub session_timeout: Duration,
    /// Authenticate every hello against the account registry
    pub require_accounts: bool,
    /// JSON account store (None = accounts live in memory only)
    pub accounts_path: Option<PathBuf>,
    /// Password of the bootstrap administrator
    pub admin_password: String,
    /// Role granted to peers admitted by server password
    pub default_role: Role,
    /// How often expired sessions are swept
    pub sweep_interval: Duration,
    /// Cursor colors, handed out in join order
    pub palette: Palette,
    /// Size of the map served by the binary
    pub map_width: u16,
    pub map_height: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:31313".to_string(),
            server_name: "Logos Live".to_string(),
            password: None,
            max_users: 32,
            session_timeout: Duration::from_secs(60 * 60),
            require_accounts: false,
            accounts_path: None,
            admin_password: "admin".to_string(),
            default_role: Role::Editor,
            sweep_interval: Duration::from_secs(60),
            palette: Palette::default(),
            map_width: 2048,
            map_height: 2048,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from `LOGOS_LIVE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults; unparsable values are logged and
    /// ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LOGOS_LIVE_BIND") {
            config.bind_addr = addr;
        }
        if let Some(name) = lookup("LOGOS_LIVE_NAME") {
            config.server_name = name;
        }
        config.password = lookup("LOGOS_LIVE_PASSWORD").filter(|p| !p.is_empty());
        config.max_users = parse_or(&lookup, "LOGOS_LIVE_MAX_USERS", config.max_users);
        let minutes = parse_or(&lookup, "LOGOS_LIVE_SESSION_TIMEOUT_MINUTES", 60u64);
        config.session_timeout = Duration::from_secs(minutes * 60);
        if let Some(flag) = lookup("LOGOS_LIVE_REQUIRE_ACCOUNTS") {
            config.require_accounts = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        config.accounts_path = lookup("LOGOS_LIVE_ACCOUNTS")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        if let Some(pw) = lookup("LOGOS_LIVE_ADMIN_PASSWORD").filter(|p| !p.is_empty()) {
            config.admin_password = pw;
        }
        let secs = parse_or(&lookup, "LOGOS_LIVE_SWEEP_SECS", 60u64).max(1);
        config.sweep_interval = Duration::from_secs(secs);
        config.map_width = parse_or(&lookup, "LOGOS_LIVE_MAP_WIDTH", config.map_width);
        config.map_height = parse_or(&lookup, "LOGOS_LIVE_MAP_HEIGHT", config.map_height);
        config
    }

    /// Compare a hello password against the server password.
    pub fn password_matches(&self, attempt: &str) -> bool {
        match &self.password {
            None => true,
            Some(expected) => {
                crate::auth::password::constant_time_eq(expected.as_bytes(), attempt.as_bytes())
            }
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            max_users: self.max_users,
            session_timeout: self.session_timeout,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {key}={raw:?}, using {default}");
            default
        }),
    }
}

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    Io(String),
    Store(StoreError),
    Account(AccountError),
    /// The operation needs account mode
    AccountsDisabled,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Account(e) => write!(f, "{e}"),
            Self::AccountsDisabled => write!(f, "Account login is not enabled"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<AccountError> for ServerError {
    fn from(e: AccountError) -> Self {
        Self::Account(e)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_peers: usize,
    pub online_users: usize,
    pub events_relayed: u64,
    pub packets_delivered: u64,
}

/// State shared by the server handle and every connection.
pub(crate) struct ServerContext {
    pub config: ServerConfig,
    pub document: Arc<dyn LiveDocument>,
    pub auth: Option<Arc<AuthRegistry>>,
    pub peers: Arc<PeerTable>,
    pub relay: Relay,
    next_peer_id: AtomicU32,
    total_connections: AtomicU64,
}

impl ServerContext {
    /// Next peer id. Ids start at 1 and are never reused.
    pub fn allocate_peer_id(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }
}

/// The session server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionServer {
    ctx: Arc<ServerContext>,
}

impl SessionServer {
    /// Create a server for `document`.
    ///
    /// Loads or bootstraps the account registry in account mode and starts
    /// the relay loop and session sweeper. Must be called inside a tokio
    /// runtime.
    pub fn new(config: ServerConfig, document: Arc<dyn LiveDocument>) -> Result<Self, ServerError> {
        let auth = if config.require_accounts {
            let registry = match &config.accounts_path {
                Some(path) => {
                    AuthRegistry::load_or_bootstrap(path, config.auth_config(), &config.admin_password)?
                }
                None => {
                    let registry = AuthRegistry::new(config.auth_config());
                    registry.bootstrap_admin(&config.admin_password);
                    registry
                }
            };
            Some(Arc::new(registry))
        } else {
            None
        };
        Ok(Self::with_registry(config, document, auth))
    }

    /// Create a server around an existing registry (`None` = password mode).
    pub fn with_registry(
        config: ServerConfig,
        document: Arc<dyn LiveDocument>,
        auth: Option<Arc<AuthRegistry>>,
    ) -> Self {
        let peers = Arc::new(PeerTable::new());
        let (relay, relay_rx) = Relay::channel();
        tokio::spawn(broadcast::fan_out(peers.clone(), relay_rx));

        let sweep_interval = config.sweep_interval;
        let ctx = Arc::new(ServerContext {
            config,
            document,
            auth,
            peers,
            relay,
            next_peer_id: AtomicU32::new(1),
            total_connections: AtomicU64::new(0),
        });

        if ctx.auth.is_some() {
            tokio::spawn(sweep_sessions(Arc::downgrade(&ctx), sweep_interval));
        }

        Self { ctx }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!(
            "{} listening on {} ({} mode)",
            self.ctx.config.server_name,
            listener.local_addr()?,
            if self.ctx.auth.is_some() { "account" } else { "password" }
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("Could not set TCP_NODELAY for {addr}: {e}");
            }
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                server.serve_stream(stream, addr.to_string()).await;
            });
        }
    }

    /// Run the protocol over any byte stream until it closes.
    pub async fn serve_stream<S>(&self, stream: S, remote_addr: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        peer::serve_connection(self.ctx.clone(), stream, remote_addr).await;
    }

    /// Relay to every ready peer except `origin`.
    pub fn broadcast_to_others(&self, origin: PeerId, packet: &ServerPacket) -> Result<(), ProtocolError> {
        self.ctx.relay.send(Audience::ReadyExcept(origin), packet)
    }

    /// Relay to every ready peer.
    pub fn broadcast_to_all(&self, packet: &ServerPacket) -> Result<(), ProtocolError> {
        self.ctx.relay.send(Audience::Ready, packet)
    }

    pub fn broadcast_notice(&self, text: &str) -> Result<(), ProtocolError> {
        log::info!("Server notice: {text}");
        self.broadcast_to_all(&ServerPacket::ServerNotice {
            text: text.to_string(),
        })
    }

    /// Send `Kick` to a peer and close its connection.
    pub async fn kick(&self, peer_id: PeerId, reason: &str) -> bool {
        self.ctx.peers.kick(peer_id, reason).await
    }

    /// Ban an account and kick every peer logged in as it.
    ///
    /// Returns the number of peers kicked. The ban and the kicks stand even
    /// when saving the account store fails; that error is returned after.
    pub async fn ban(&self, username: &str, reason: &str) -> Result<usize, ServerError> {
        let auth = self.ctx.auth.as_ref().ok_or(ServerError::AccountsDisabled)?;
        let user_id = auth.ban_user(username, reason)?;

        let message = format!("You are banned: {reason}");
        let mut kicked = 0;
        for peer_id in self.ctx.peers.peers_of_user(user_id).await {
            if self.ctx.peers.kick(peer_id, &message).await {
                kicked += 1;
            }
        }

        if let Err(e) = self.persist_accounts() {
            log::error!("Ban of '{username}' could not be saved: {e}");
            return Err(e);
        }
        Ok(kicked)
    }

    /// Write the account registry to the configured store, if any.
    pub fn persist_accounts(&self) -> Result<(), ServerError> {
        if let (Some(auth), Some(path)) = (&self.ctx.auth, &self.ctx.config.accounts_path) {
            auth.save(path)?;
        }
        Ok(())
    }

    /// End expired account sessions and kick their peers.
    ///
    /// Returns the number of sessions removed.
    pub async fn sweep_expired_sessions(&self) -> usize {
        sweep_once(&self.ctx).await
    }

    /// Identities of all accepted peers, ordered by id.
    pub async fn peers(&self) -> Vec<PeerIdentity> {
        self.ctx.peers.snapshot().await
    }

    /// Number of accepted peers.
    pub async fn online_count(&self) -> usize {
        self.ctx.peers.len().await
    }

    pub async fn stats(&self) -> ServerStats {
        let relay = self.ctx.peers.stats().await;
        ServerStats {
            total_connections: self.ctx.total_connections.load(Ordering::Relaxed),
            active_peers: relay.active_peers,
            online_users: self.ctx.auth.as_ref().map_or(0, |a| a.online_count()),
            events_relayed: relay.events_relayed,
            packets_delivered: relay.packets_delivered,
        }
    }

    pub fn auth(&self) -> Option<&Arc<AuthRegistry>> {
        self.ctx.auth.as_ref()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn document(&self) -> &Arc<dyn LiveDocument> {
        &self.ctx.document
    }
}

async fn sweep_once(ctx: &ServerContext) -> usize {
    let Some(auth) = &ctx.auth else {
        return 0;
    };
    let expired = auth.cleanup_expired_sessions();
    for session in &expired {
        for peer_id in ctx.peers.peers_of_user(session.user_id).await {
            ctx.peers.kick(peer_id, SESSION_EXPIRED).await;
        }
    }
    expired.len()
}

/// Periodic session sweep. Stops once the server is dropped.
async fn sweep_sessions(ctx: Weak<ServerContext>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(ctx) = ctx.upgrade() else {
            break;
        };
        let removed = sweep_once(&ctx).await;
        if removed > 0 {
            log::info!("Session sweep ended {removed} sessions");
        }
    }
    log::debug!("Session sweeper stopped");
}
