//! Accounts, sessions, bans and permissions.
//!
//! [`AuthRegistry`] is the single owner of every [`UserAccount`] and
//! [`Session`]. Connections only hold a user id and a token. All state sits
//! behind one lock so that an authorization decision never observes a
//! half-applied ban or role change.
//!
//! ```text
//! authenticate ──► capacity ──► credentials ──► ban ──► new session
//!                  (ServerFull)  (Invalid…)     (Banned)  (Success)
//! ```
//!
//! Sessions expire `session_timeout` after their last validated use. Expiry
//! is checked lazily in [`AuthRegistry::validate_session`] and eagerly by
//! [`AuthRegistry::cleanup_expired_sessions`].

pub mod password;
pub mod roles;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use password::{generate_salt, generate_token, hash_password, verify_password};
pub use roles::{Permission, Role};
pub use store::StoreError;

/// Account identifier.
pub type UserId = u32;

/// Username of the account created when the store is empty.
pub const BOOTSTRAP_ADMIN: &str = "admin";

/// Longest accepted username, in bytes.
pub const MAX_USERNAME_LEN: usize = 32;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry limits.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Maximum number of simultaneously logged-in users
    pub max_users: usize,
    /// Idle time after which a session expires
    pub session_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_users: 32,
            session_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// A stored user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub role: Role,
    /// Creation time (seconds since epoch)
    pub created: u64,
    /// Last successful login (seconds since epoch, 0 = never)
    pub last_login: u64,
    pub is_banned: bool,
    pub ban_reason: String,
}

/// A live login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
    /// Creation time (seconds since epoch)
    pub created: u64,
    pub last_access: Instant,
    pub remote_address: String,
}

/// Outcome of [`AuthRegistry::authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success { user_id: UserId, token: String },
    InvalidCredentials,
    UserBanned { reason: String },
    ServerFull,
}

impl AuthResult {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Success { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Account management errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountError {
    UsernameTaken(String),
    UnknownUser(String),
    InvalidUsername(String),
}

impl std::fmt::Display for AccountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UsernameTaken(name) => write!(f, "Username '{name}' already exists"),
            Self::UnknownUser(name) => write!(f, "No account named '{name}'"),
            Self::InvalidUsername(name) => write!(f, "Invalid username '{name}'"),
        }
    }
}

impl std::error::Error for AccountError {}

#[derive(Debug, Default)]
struct RegistryState {
    accounts: BTreeMap<UserId, UserAccount>,
    by_name: HashMap<String, UserId>,
    sessions: HashMap<UserId, Session>,
    next_user_id: UserId,
}

impl RegistryState {
    fn account_mut(&mut self, username: &str) -> Result<&mut UserAccount, AccountError> {
        let id = *self
            .by_name
            .get(username)
            .ok_or_else(|| AccountError::UnknownUser(username.to_string()))?;
        self.accounts
            .get_mut(&id)
            .ok_or_else(|| AccountError::UnknownUser(username.to_string()))
    }
}

/// Thread-safe account and session registry.
pub struct AuthRegistry {
    config: AuthConfig,
    state: RwLock<RegistryState>,
}

impl AuthRegistry {
    /// Create an empty registry.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RegistryState {
                next_user_id: 1,
                ..RegistryState::default()
            }),
        }
    }

    /// Create a registry holding previously stored accounts.
    pub fn with_accounts(config: AuthConfig, accounts: Vec<UserAccount>) -> Self {
        let registry = Self::new(config);
        {
            let mut state = registry.state.write();
            for account in accounts {
                state.next_user_id = state.next_user_id.max(account.user_id.saturating_add(1));
                state.by_name.insert(account.username.clone(), account.user_id);
                state.accounts.insert(account.user_id, account);
            }
        }
        registry
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Create the default administrator if no account exists yet.
    ///
    /// Returns `true` if the account was created.
    pub fn bootstrap_admin(&self, password: &str) -> bool {
        let mut state = self.state.write();
        if !state.accounts.is_empty() {
            return false;
        }
        let id = Self::insert_account(&mut state, BOOTSTRAP_ADMIN, password, Role::Administrator);
        log::warn!(
            "Created default administrator '{BOOTSTRAP_ADMIN}' (user {id}); change its password"
        );
        true
    }

    fn insert_account(state: &mut RegistryState, username: &str, password: &str, role: Role) -> UserId {
        let id = state.next_user_id;
        state.next_user_id += 1;
        let salt = generate_salt();
        let account = UserAccount {
            user_id: id,
            username: username.to_string(),
            password_hash: hash_password(password, &salt),
            salt,
            role,
            created: unix_now(),
            last_login: 0,
            is_banned: false,
            ban_reason: String::new(),
        };
        state.by_name.insert(account.username.clone(), id);
        state.accounts.insert(id, account);
        id
    }

    /// Check capacity, credentials and ban state, then open a session.
    pub fn authenticate(&self, username: &str, password: &str, remote_address: &str) -> AuthResult {
        let mut state = self.state.write();

        if state.sessions.len() >= self.config.max_users {
            log::info!("Login for '{username}' from {remote_address} refused: server full");
            return AuthResult::ServerFull;
        }

        let Some(&user_id) = state.by_name.get(username) else {
            log::info!("Login for unknown user '{username}' from {remote_address}");
            return AuthResult::InvalidCredentials;
        };
        let Some(account) = state.accounts.get_mut(&user_id) else {
            return AuthResult::InvalidCredentials;
        };
        if !verify_password(password, &account.password_hash, &account.salt) {
            log::info!("Wrong password for '{username}' from {remote_address}");
            return AuthResult::InvalidCredentials;
        }
        if account.is_banned {
            log::info!("Banned user '{username}' tried to log in from {remote_address}");
            return AuthResult::UserBanned {
                reason: account.ban_reason.clone(),
            };
        }

        account.last_login = unix_now();
        let token = generate_token();
        // Overwrites any previous session of this user.
        state.sessions.insert(
            user_id,
            Session {
                user_id,
                token: token.clone(),
                created: unix_now(),
                last_access: Instant::now(),
                remote_address: remote_address.to_string(),
            },
        );
        log::info!("User '{username}' (user {user_id}) logged in from {remote_address}");
        AuthResult::Success { user_id, token }
    }

    /// Check a session token, refreshing its last access on success.
    pub fn validate_session(&self, user_id: UserId, token: &str) -> bool {
        let mut state = self.state.write();
        let Some(session) = state.sessions.get_mut(&user_id) else {
            return false;
        };
        if !password::constant_time_eq(session.token.as_bytes(), token.as_bytes()) {
            return false;
        }
        if session.last_access.elapsed() > self.config.session_timeout {
            state.sessions.remove(&user_id);
            log::info!("Session of user {user_id} expired");
            return false;
        }
        session.last_access = Instant::now();
        true
    }

    pub fn logout(&self, user_id: UserId) {
        if self.state.write().sessions.remove(&user_id).is_some() {
            log::info!("User {user_id} logged out");
        }
    }

    pub fn invalidate_session(&self, user_id: UserId) {
        if self.state.write().sessions.remove(&user_id).is_some() {
            log::debug!("Session of user {user_id} invalidated");
        }
    }

    /// Remove every expired session and return them.
    pub fn cleanup_expired_sessions(&self) -> Vec<Session> {
        let timeout = self.config.session_timeout;
        let mut state = self.state.write();
        let expired: Vec<UserId> = state
            .sessions
            .values()
            .filter(|s| s.last_access.elapsed() > timeout)
            .map(|s| s.user_id)
            .collect();
        let removed: Vec<Session> = expired
            .iter()
            .filter_map(|id| state.sessions.remove(id))
            .collect();
        if !removed.is_empty() {
            log::info!("Removed {} expired sessions", removed.len());
        }
        removed
    }

    pub fn has_permission(&self, user_id: UserId, permission: Permission) -> bool {
        self.state
            .read()
            .accounts
            .get(&user_id)
            .is_some_and(|a| a.role.has_permission(permission))
    }

    pub fn role_of(&self, user_id: UserId) -> Option<Role> {
        self.state.read().accounts.get(&user_id).map(|a| a.role)
    }

    pub fn add_user(&self, username: &str, password: &str, role: Role) -> Result<UserId, AccountError> {
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(AccountError::InvalidUsername(username.to_string()));
        }
        let mut state = self.state.write();
        if state.by_name.contains_key(username) {
            return Err(AccountError::UsernameTaken(username.to_string()));
        }
        let id = Self::insert_account(&mut state, username, password, role);
        log::info!("Added user '{username}' (user {id}) as {role:?}");
        Ok(id)
    }

    /// Delete an account and any session it holds.
    pub fn remove_user(&self, username: &str) -> Result<(), AccountError> {
        let mut state = self.state.write();
        let id = state
            .by_name
            .remove(username)
            .ok_or_else(|| AccountError::UnknownUser(username.to_string()))?;
        state.accounts.remove(&id);
        state.sessions.remove(&id);
        log::info!("Removed user '{username}' (user {id})");
        Ok(())
    }

    pub fn change_user_role(&self, username: &str, role: Role) -> Result<(), AccountError> {
        let mut state = self.state.write();
        let account = state.account_mut(username)?;
        account.role = role;
        log::info!("User '{username}' is now {role:?}");
        Ok(())
    }

    /// Set a new password under a freshly generated salt.
    pub fn change_user_password(&self, username: &str, password: &str) -> Result<(), AccountError> {
        let mut state = self.state.write();
        let account = state.account_mut(username)?;
        account.salt = generate_salt();
        account.password_hash = hash_password(password, &account.salt);
        log::info!("Password changed for '{username}'");
        Ok(())
    }

    /// Ban a user and end their session immediately.
    pub fn ban_user(&self, username: &str, reason: &str) -> Result<UserId, AccountError> {
        let mut state = self.state.write();
        let account = state.account_mut(username)?;
        account.is_banned = true;
        account.ban_reason = reason.to_string();
        let id = account.user_id;
        state.sessions.remove(&id);
        log::info!("Banned '{username}': {reason}");
        Ok(id)
    }

    pub fn unban_user(&self, username: &str) -> Result<(), AccountError> {
        let mut state = self.state.write();
        let account = state.account_mut(username)?;
        account.is_banned = false;
        account.ban_reason.clear();
        log::info!("Unbanned '{username}'");
        Ok(())
    }

    pub fn is_user_banned(&self, username: &str) -> bool {
        let state = self.state.read();
        state
            .by_name
            .get(username)
            .and_then(|id| state.accounts.get(id))
            .is_some_and(|a| a.is_banned)
    }

    /// Number of users with a live session.
    pub fn online_count(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn user(&self, username: &str) -> Option<UserAccount> {
        let state = self.state.read();
        state
            .by_name
            .get(username)
            .and_then(|id| state.accounts.get(id))
            .cloned()
    }

    pub fn user_by_id(&self, user_id: UserId) -> Option<UserAccount> {
        self.state.read().accounts.get(&user_id).cloned()
    }

    pub fn session(&self, user_id: UserId) -> Option<Session> {
        self.state.read().sessions.get(&user_id).cloned()
    }

    /// All accounts, ordered by user id.
    pub fn accounts(&self) -> Vec<UserAccount> {
        self.state.read().accounts.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_users: usize) -> AuthRegistry {
        AuthRegistry::new(AuthConfig {
            max_users,
            session_timeout: Duration::from_secs(60),
        })
    }

    fn login(reg: &AuthRegistry, name: &str, pw: &str) -> (UserId, String) {
        match reg.authenticate(name, pw, "127.0.0.1:1") {
            AuthResult::Success { user_id, token } => (user_id, token),
            other => panic!("expected success, got {other:?}"),
        }
    }

    /// Push a session's last access `age` into the past.
    fn age_session(reg: &AuthRegistry, user_id: UserId, age: Duration) {
        let mut state = reg.state.write();
        let session = state.sessions.get_mut(&user_id).unwrap();
        session.last_access = Instant::now().checked_sub(age).unwrap();
    }

    #[test]
    fn test_bootstrap_creates_single_admin() {
        let reg = registry(4);
        assert!(reg.bootstrap_admin("admin"));
        assert!(!reg.bootstrap_admin("admin"));
        let accounts = reg.accounts();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].username, BOOTSTRAP_ADMIN);
        assert_eq!(accounts[0].role, Role::Administrator);
    }

    #[test]
    fn test_bootstrap_skipped_when_accounts_exist() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        assert!(!reg.bootstrap_admin("admin"));
        assert!(reg.user(BOOTSTRAP_ADMIN).is_none());
    }

    #[test]
    fn test_authenticate_success_updates_last_login() {
        let reg = registry(4);
        let id = reg.add_user("alice", "pw", Role::Editor).unwrap();
        assert_eq!(reg.user("alice").unwrap().last_login, 0);

        let (user_id, token) = login(&reg, "alice", "pw");
        assert_eq!(user_id, id);
        assert!(reg.user("alice").unwrap().last_login > 0);
        assert!(reg.validate_session(id, &token));
        assert_eq!(reg.online_count(), 1);
    }

    #[test]
    fn test_unknown_user_and_wrong_password_look_alike() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        assert_eq!(reg.authenticate("bob", "pw", "x"), AuthResult::InvalidCredentials);
        assert_eq!(reg.authenticate("alice", "nope", "x"), AuthResult::InvalidCredentials);
        assert_eq!(reg.online_count(), 0);
    }

    #[test]
    fn test_capacity_checked_before_credentials() {
        let reg = registry(1);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        reg.add_user("mallory", "pw", Role::Editor).unwrap();
        reg.ban_user("mallory", "griefing").unwrap();
        login(&reg, "alice", "pw");

        assert_eq!(reg.authenticate("nobody", "x", "x"), AuthResult::ServerFull);
        assert_eq!(reg.authenticate("mallory", "pw", "x"), AuthResult::ServerFull);
        assert_eq!(reg.authenticate("mallory", "wrong", "x"), AuthResult::ServerFull);
    }

    #[test]
    fn test_banned_only_reported_for_correct_password() {
        let reg = registry(4);
        reg.add_user("mallory", "pw", Role::Editor).unwrap();
        reg.ban_user("mallory", "griefing").unwrap();
        assert_eq!(reg.authenticate("mallory", "wrong", "x"), AuthResult::InvalidCredentials);
        assert_eq!(
            reg.authenticate("mallory", "pw", "x"),
            AuthResult::UserBanned {
                reason: "griefing".into()
            }
        );
    }

    #[test]
    fn test_new_login_overwrites_session() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        let (id, first) = login(&reg, "alice", "pw");
        let (_, second) = login(&reg, "alice", "pw");
        assert_ne!(first, second);
        assert_eq!(reg.online_count(), 1);
        assert!(!reg.validate_session(id, &first));
        assert!(reg.validate_session(id, &second));
    }

    #[test]
    fn test_validate_rejects_missing_and_mismatched() {
        let reg = registry(4);
        let id = reg.add_user("alice", "pw", Role::Editor).unwrap();
        assert!(!reg.validate_session(id, "anything"));
        login(&reg, "alice", "pw");
        assert!(!reg.validate_session(id, "forged"));
        // A mismatch doesn't end the real session.
        assert_eq!(reg.online_count(), 1);
    }

    #[test]
    fn test_expired_session_fails_and_is_removed() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        let (id, token) = login(&reg, "alice", "pw");
        age_session(&reg, id, Duration::from_secs(61));

        assert!(!reg.validate_session(id, &token));
        assert!(reg.session(id).is_none());
        assert_eq!(reg.online_count(), 0);
    }

    #[test]
    fn test_validation_in_window_advances_last_access() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        let (id, token) = login(&reg, "alice", "pw");
        age_session(&reg, id, Duration::from_secs(30));
        let before = reg.session(id).unwrap().last_access;

        assert!(reg.validate_session(id, &token));
        let after = reg.session(id).unwrap().last_access;
        assert!(after > before);
    }

    #[test]
    fn test_cleanup_expired_sessions() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        reg.add_user("bob", "pw", Role::Editor).unwrap();
        let (alice, _) = login(&reg, "alice", "pw");
        let (bob, _) = login(&reg, "bob", "pw");

        assert!(reg.cleanup_expired_sessions().is_empty());

        age_session(&reg, alice, Duration::from_secs(120));
        let removed = reg.cleanup_expired_sessions();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].user_id, alice);
        assert!(reg.session(bob).is_some());

        // Idempotent.
        assert!(reg.cleanup_expired_sessions().is_empty());
    }

    #[test]
    fn test_logout_and_invalidate() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        let (id, token) = login(&reg, "alice", "pw");
        reg.logout(id);
        assert!(!reg.validate_session(id, &token));

        let (id, token) = login(&reg, "alice", "pw");
        reg.invalidate_session(id);
        assert!(!reg.validate_session(id, &token));
        // Repeated removal is harmless.
        reg.logout(id);
    }

    #[test]
    fn test_has_permission() {
        let reg = registry(4);
        let guest = reg.add_user("guest", "pw", Role::Guest).unwrap();
        let admin = reg.add_user("root", "pw", Role::Administrator).unwrap();
        assert!(!reg.has_permission(guest, Permission::EditMap));
        assert!(reg.has_permission(guest, Permission::Chat));
        assert!(reg.has_permission(admin, Permission::ManageUsers));
        assert!(!reg.has_permission(999, Permission::ViewMap));

        reg.change_user_role("guest", Role::Editor).unwrap();
        assert!(reg.has_permission(guest, Permission::EditMap));
    }

    #[test]
    fn test_add_user_duplicate_is_noop() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        let before = reg.user("alice").unwrap();
        assert_eq!(
            reg.add_user("alice", "other", Role::Administrator),
            Err(AccountError::UsernameTaken("alice".into()))
        );
        assert_eq!(reg.user("alice").unwrap(), before);
        assert_eq!(reg.accounts().len(), 1);
    }

    #[test]
    fn test_add_user_rejects_bad_names() {
        let reg = registry(4);
        assert!(reg.add_user("", "pw", Role::Guest).is_err());
        assert!(reg.add_user(&"a".repeat(MAX_USERNAME_LEN + 1), "pw", Role::Guest).is_err());
    }

    #[test]
    fn test_change_password_regenerates_salt() {
        let reg = registry(4);
        reg.add_user("alice", "old", Role::Editor).unwrap();

        reg.change_user_password("alice", "new").unwrap();
        let first = reg.user("alice").unwrap();
        reg.change_user_password("alice", "new").unwrap();
        let second = reg.user("alice").unwrap();

        assert_ne!(first.salt, second.salt);
        assert_ne!(first.password_hash, second.password_hash);
        assert!(verify_password("new", &second.password_hash, &second.salt));
        assert_eq!(reg.authenticate("alice", "old", "x"), AuthResult::InvalidCredentials);
        assert!(reg.authenticate("alice", "new", "x").is_success());
    }

    #[test]
    fn test_ban_forces_logout() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        let (id, token) = login(&reg, "alice", "pw");

        reg.ban_user("alice", "spam").unwrap();
        assert!(reg.is_user_banned("alice"));
        assert!(!reg.validate_session(id, &token));
        assert_eq!(reg.online_count(), 0);
        assert_eq!(
            reg.authenticate("alice", "pw", "x"),
            AuthResult::UserBanned { reason: "spam".into() }
        );
    }

    #[test]
    fn test_unban_clears_flag_without_session() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        reg.ban_user("alice", "spam").unwrap();
        reg.unban_user("alice").unwrap();

        let account = reg.user("alice").unwrap();
        assert!(!account.is_banned);
        assert!(account.ban_reason.is_empty());
        assert_eq!(reg.online_count(), 0);
        assert!(reg.authenticate("alice", "pw", "x").is_success());
    }

    #[test]
    fn test_remove_user_ends_session() {
        let reg = registry(4);
        reg.add_user("alice", "pw", Role::Editor).unwrap();
        let (id, token) = login(&reg, "alice", "pw");
        reg.remove_user("alice").unwrap();
        assert!(!reg.validate_session(id, &token));
        assert!(reg.user("alice").is_none());
        assert_eq!(
            reg.remove_user("alice"),
            Err(AccountError::UnknownUser("alice".into()))
        );
    }

    #[test]
    fn test_with_accounts_continues_id_sequence() {
        let source = registry(4);
        source.add_user("alice", "pw", Role::Editor).unwrap();
        source.add_user("bob", "pw", Role::Guest).unwrap();

        let reg = AuthRegistry::with_accounts(AuthConfig::default(), source.accounts());
        let id = reg.add_user("carol", "pw", Role::Guest).unwrap();
        assert_eq!(id, 3);
        assert!(reg.authenticate("bob", "pw", "x").is_success());
    }
}
