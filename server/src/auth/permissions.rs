//! Capability registry and the rank rules administrators act under.

use shared::PermissionLevel;
use std::collections::{BTreeSet, HashMap};

pub const PLAY: &str = "play";
pub const CHAT: &str = "chat";
pub const VOICE: &str = "voice";
pub const CREATE_ROOM: &str = "create_room";
pub const JOIN_ROOM: &str = "join_room";
pub const KICK_PLAYER: &str = "kick_player";
pub const MUTE_PLAYER: &str = "mute_player";
pub const MANAGE_ROOMS: &str = "manage_rooms";
pub const BAN_PLAYER: &str = "ban_player";
pub const UNBAN_PLAYER: &str = "unban_player";
pub const SET_PERMISSION_LEVEL: &str = "set_permission_level";
pub const VIEW_ADMIN_PANEL: &str = "view_admin_panel";
pub const SERVER_CONFIG: &str = "server_config";
pub const SYSTEM_COMMANDS: &str = "system_commands";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub name: String,
    pub description: String,
    pub required_level: PermissionLevel,
    /// Granted to every new session regardless of level
    pub is_default: bool,
}

#[derive(Debug, Clone)]
pub struct PermissionRegistry {
    entries: HashMap<String, Permission>,
}

impl Default for PermissionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PermissionRegistry {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        use PermissionLevel::*;

        let mut registry = Self::empty();
        let table: [(&str, &str, PermissionLevel, bool); 14] = [
            (PLAY, "Join and play the session", Player, true),
            (CHAT, "Send text chat", Player, true),
            (VOICE, "Use voice chat", Player, true),
            (CREATE_ROOM, "Create a room", Player, true),
            (JOIN_ROOM, "Join a room", Player, true),
            (KICK_PLAYER, "Kick a player", Moderator, false),
            (MUTE_PLAYER, "Mute a player", Moderator, false),
            (MANAGE_ROOMS, "Manage rooms", Moderator, false),
            (BAN_PLAYER, "Ban a player", Admin, false),
            (UNBAN_PLAYER, "Lift a ban", Admin, false),
            (SET_PERMISSION_LEVEL, "Change permission levels", Admin, false),
            (VIEW_ADMIN_PANEL, "Open the admin panel", Admin, false),
            (SERVER_CONFIG, "Change server configuration", SuperAdmin, false),
            (SYSTEM_COMMANDS, "Run system commands", Developer, false),
        ];
        for (name, description, level, is_default) in table {
            registry.register(name, description, level, is_default);
        }
        registry
    }

    /// Adds or replaces a capability.
    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        required_level: PermissionLevel,
        is_default: bool,
    ) {
        self.entries.insert(
            name.to_string(),
            Permission {
                name: name.to_string(),
                description: description.to_string(),
                required_level,
                is_default,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Permission> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn required_level(&self, name: &str) -> Option<PermissionLevel> {
        self.entries.get(name).map(|p| p.required_level)
    }

    /// Default capabilities plus everything the level unlocks.
    pub fn implied_for(&self, level: PermissionLevel) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|p| p.is_default || p.required_level <= level)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Administrative actions that need a rank check against a target player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Kick,
    Mute,
    Ban,
    Unban,
    Promote,
    Demote,
    Grant,
}

impl AdminAction {
    pub fn minimum_level(self) -> PermissionLevel {
        match self {
            AdminAction::Ban | AdminAction::Unban | AdminAction::Promote | AdminAction::Demote => {
                PermissionLevel::Admin
            }
            AdminAction::Kick | AdminAction::Mute | AdminAction::Grant => {
                PermissionLevel::Moderator
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AdminAction::Kick => "kick",
            AdminAction::Mute => "mute",
            AdminAction::Ban => "ban",
            AdminAction::Unban => "unban",
            AdminAction::Promote => "promote",
            AdminAction::Demote => "demote",
            AdminAction::Grant => "grant",
        }
    }
}

/// Whether an actor at `admin` may perform `action` on a target at `target`.
///
/// Below Moderator nothing is allowed; SuperAdmin and Developer bypass the
/// rank comparison; everyone else must strictly outrank the target and hold
/// the action's minimum level.
pub fn outranks(admin: PermissionLevel, target: PermissionLevel, action: AdminAction) -> bool {
    if admin < PermissionLevel::Moderator {
        return false;
    }
    if admin >= PermissionLevel::SuperAdmin {
        return true;
    }
    if target >= admin {
        return false;
    }
    admin >= action.minimum_level()
}
