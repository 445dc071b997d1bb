//! JSON file persistence for user accounts.
//!
//! Only accounts are stored. Sessions are process-local and every restart
//! starts with nobody logged in.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AuthConfig, AuthRegistry, UserAccount, UserId};

/// Account store errors.
#[derive(Debug)]
pub enum StoreError {
    Io(String),
    Serialization(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Account store I/O error: {e}"),
            Self::Serialization(e) => write!(f, "Account store format error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountFile {
    next_user_id: UserId,
    accounts: Vec<UserAccount>,
}

impl AuthRegistry {
    /// Load accounts from `path`, or start empty if the file is missing.
    ///
    /// An empty registry gets the bootstrap administrator with
    /// `admin_password` and is written back immediately.
    pub fn load_or_bootstrap(
        path: &Path,
        config: AuthConfig,
        admin_password: &str,
    ) -> Result<Self, StoreError> {
        let registry = if path.exists() {
            let text = fs::read_to_string(path)?;
            let file: AccountFile = serde_json::from_str(&text)?;
            log::info!(
                "Loaded {} accounts from {}",
                file.accounts.len(),
                path.display()
            );
            let registry = Self::with_accounts(config, file.accounts);
            {
                let mut state = registry.state.write();
                state.next_user_id = state.next_user_id.max(file.next_user_id);
            }
            registry
        } else {
            log::info!("No account store at {}, starting empty", path.display());
            Self::new(config)
        };

        if registry.bootstrap_admin(admin_password) {
            registry.save(path)?;
        }
        Ok(registry)
    }

    /// Write all accounts to `path` through a temporary file.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let file = {
            let state = self.state.read();
            AccountFile {
                next_user_id: state.next_user_id,
                accounts: state.accounts.values().cloned().collect(),
            }
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        log::debug!("Saved {} accounts to {}", file.accounts.len(), path.display());
        Ok(())
    }
}
