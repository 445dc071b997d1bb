//! Roles and the static role → permission table.
//!
//! ```text
//! Guest          view_map, chat
//! Editor         + edit_map
//! Moderator      + kick_users, ban_users, broadcast_notice
//! Administrator  + server_admin, manage_users
//! ```

use serde::{Deserialize, Serialize};

/// A capability checked before serving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ViewMap,
    Chat,
    EditMap,
    KickUsers,
    BanUsers,
    BroadcastNotice,
    ServerAdmin,
    ManageUsers,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewMap => "view_map",
            Self::Chat => "chat",
            Self::EditMap => "edit_map",
            Self::KickUsers => "kick_users",
            Self::BanUsers => "ban_users",
            Self::BroadcastNotice => "broadcast_notice",
            Self::ServerAdmin => "server_admin",
            Self::ManageUsers => "manage_users",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "view_map" => Self::ViewMap,
            "chat" => Self::Chat,
            "edit_map" => Self::EditMap,
            "kick_users" => Self::KickUsers,
            "ban_users" => Self::BanUsers,
            "broadcast_notice" => Self::BroadcastNotice,
            "server_admin" => Self::ServerAdmin,
            "manage_users" => Self::ManageUsers,
            other => return Err(format!("unknown permission '{other}'")),
        })
    }
}

const GUEST: &[Permission] = &[Permission::ViewMap, Permission::Chat];

const EDITOR: &[Permission] = &[Permission::ViewMap, Permission::Chat, Permission::EditMap];

const MODERATOR: &[Permission] = &[
    Permission::ViewMap,
    Permission::Chat,
    Permission::EditMap,
    Permission::KickUsers,
    Permission::BanUsers,
    Permission::BroadcastNotice,
];

const ADMINISTRATOR: &[Permission] = &[
    Permission::ViewMap,
    Permission::Chat,
    Permission::EditMap,
    Permission::KickUsers,
    Permission::BanUsers,
    Permission::BroadcastNotice,
    Permission::ServerAdmin,
    Permission::ManageUsers,
];

/// Account role, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Guest,
    Editor,
    Moderator,
    Administrator,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Guest, Role::Editor, Role::Moderator, Role::Administrator];

    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Self::Guest => GUEST,
            Self::Editor => EDITOR,
            Self::Moderator => MODERATOR,
            Self::Administrator => ADMINISTRATOR,
        }
    }

    pub fn has_permission(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "guest" => Ok(Self::Guest),
            "editor" => Ok(Self::Editor),
            "moderator" => Ok(Self::Moderator),
            "administrator" | "admin" => Ok(Self::Administrator),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}
