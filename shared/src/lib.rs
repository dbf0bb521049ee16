//! Wire vocabulary shared by the coordination server and host-bridge adapters.
//!
//! Two layers live here:
//! - fixed-layout packets (`wire`) whose fields are encoded in declaration order,
//!   little-endian, with no padding, exactly as the host side expects them
//! - the UDP envelope (`Packet`) exchanged between a bridge and the server
//!
//! Both are encoded with bincode's default options (fixed-width little-endian
//! integers, one byte per `bool`).

use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Player id used in packets that originate from the server itself.
pub const SERVER_PLAYER_ID: u32 = 0;

/// Maximum number of distinct stages carried by a conflict notification.
pub const MAX_CONFLICT_STAGES: usize = 8;

/// `sync_mode` value in `HostEvent::NpcDialogStart` that asks for the server default.
pub const DEFAULT_DIALOG_SYNC_MODE: u8 = 255;

/// Encodes any wire value with the shared bincode configuration.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

/// Decodes any wire value with the shared bincode configuration.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

/// How a player proved their identity to the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMethod {
    Anonymous,
    Steam,
    Gog,
    Epic,
    Custom,
}

impl AuthMethod {
    pub fn name(self) -> &'static str {
        match self {
            AuthMethod::Anonymous => "Anonymous",
            AuthMethod::Steam => "Steam",
            AuthMethod::Gog => "GOG",
            AuthMethod::Epic => "Epic",
            AuthMethod::Custom => "Custom",
        }
    }
}

/// Result codes reported to the host for an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthResult {
    Success,
    InvalidCredentials,
    AccountBanned,
    AccountSuspended,
    TooManyAttempts,
    ServerFull,
    VersionMismatch,
    NetworkError,
    MaintenanceMode,
    RequiredDataMissing,
}

impl AuthResult {
    pub fn name(self) -> &'static str {
        match self {
            AuthResult::Success => "Success",
            AuthResult::InvalidCredentials => "InvalidCredentials",
            AuthResult::AccountBanned => "AccountBanned",
            AuthResult::AccountSuspended => "AccountSuspended",
            AuthResult::TooManyAttempts => "TooManyAttempts",
            AuthResult::ServerFull => "ServerFull",
            AuthResult::VersionMismatch => "VersionMismatch",
            AuthResult::NetworkError => "NetworkError",
            AuthResult::MaintenanceMode => "MaintenanceMode",
            AuthResult::RequiredDataMissing => "RequiredDataMissing",
        }
    }
}

/// Monotonic authority levels. Ordering follows declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum PermissionLevel {
    Banned = 0,
    Guest = 1,
    #[default]
    Player = 2,
    Vip = 3,
    Moderator = 4,
    Admin = 5,
    SuperAdmin = 6,
    Developer = 7,
}

impl PermissionLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PermissionLevel::Banned),
            1 => Some(PermissionLevel::Guest),
            2 => Some(PermissionLevel::Player),
            3 => Some(PermissionLevel::Vip),
            4 => Some(PermissionLevel::Moderator),
            5 => Some(PermissionLevel::Admin),
            6 => Some(PermissionLevel::SuperAdmin),
            7 => Some(PermissionLevel::Developer),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PermissionLevel::Banned => "Banned",
            PermissionLevel::Guest => "Guest",
            PermissionLevel::Player => "Player",
            PermissionLevel::Vip => "VIP",
            PermissionLevel::Moderator => "Moderator",
            PermissionLevel::Admin => "Admin",
            PermissionLevel::SuperAdmin => "SuperAdmin",
            PermissionLevel::Developer => "Developer",
        }
    }
}

/// Fixed-layout packets mirrored into the host game.
pub mod wire {
    use super::MAX_CONFLICT_STAGES;
    use serde::{Deserialize, Serialize};

    /// `sync_type` values of [`QuestFullSync`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SyncType {
        Normal = 0,
        Conflict = 1,
        Forced = 2,
    }

    /// `reason` values of [`DialogEnd`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DialogEndReason {
        Completed = 0,
        Interrupted = 1,
        Timeout = 2,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct QuestFullSync {
        pub quest_hash: u32,
        pub target_stage: u16,
        pub target_state: u8,
        pub player_id: u32,
        pub timestamp: u64,
        pub sync_type: u8,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct QuestConflictNotification {
        pub conflict_id: u32,
        pub quest_hash: u32,
        pub conflicting_stages: [u16; MAX_CONFLICT_STAGES],
        pub stage_count: u8,
        pub resolution_method: u8,
        pub vote_timeout_seconds: u32,
    }

    impl QuestConflictNotification {
        /// Packs up to eight stages; any further stages are dropped.
        pub fn new(
            conflict_id: u32,
            quest_hash: u32,
            stages: &[u16],
            resolution_method: u8,
            vote_timeout_seconds: u32,
        ) -> Self {
            let mut conflicting_stages = [0u16; MAX_CONFLICT_STAGES];
            let count = stages.len().min(MAX_CONFLICT_STAGES);
            conflicting_stages[..count].copy_from_slice(&stages[..count]);
            Self {
                conflict_id,
                quest_hash,
                conflicting_stages,
                stage_count: count as u8,
                resolution_method,
                vote_timeout_seconds,
            }
        }

        pub fn stages(&self) -> &[u16] {
            &self.conflicting_stages[..self.stage_count as usize]
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct QuestVote {
        pub quest_hash: u32,
        pub player_id: u32,
        pub target_stage: u16,
        pub approve: bool,
        pub timestamp: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct QuestObjectiveUpdate {
        pub quest_hash: u32,
        pub objective_id: u32,
        pub player_id: u32,
        pub new_state: u8,
        pub timestamp: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DialogStart {
        pub session_id: u32,
        pub npc_id: u32,
        pub speaker_id: u32,
        pub quest_hash: u32,
        pub sync_mode: u8,
        pub timestamp: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DialogChoice {
        pub session_id: u32,
        pub player_id: u32,
        pub choice_id: u32,
        pub timestamp: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DialogVote {
        pub session_id: u32,
        pub vote_id: u32,
        pub player_id: u32,
        pub choice_id: u32,
        pub approve: bool,
        pub timestamp: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DialogEnd {
        pub session_id: u32,
        pub ending_player: u32,
        pub reason: u8,
        pub timestamp: u64,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DialogStateUpdate {
        pub session_id: u32,
        pub npc_id: u32,
        pub new_state: u8,
        pub current_choice: u32,
        pub timestamp: u64,
    }
}

/// One authoritative packet plus the players it is meant for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WirePacket {
    QuestFullSync(wire::QuestFullSync),
    QuestConflictNotification(wire::QuestConflictNotification),
    QuestVote(wire::QuestVote),
    QuestObjectiveUpdate(wire::QuestObjectiveUpdate),
    DialogStart(wire::DialogStart),
    DialogChoice(wire::DialogChoice),
    DialogVote(wire::DialogVote),
    DialogEnd(wire::DialogEnd),
    DialogStateUpdate(wire::DialogStateUpdate),
    SessionRevoked { player_id: u32, reason: String },
}

impl WirePacket {
    pub fn name(&self) -> &'static str {
        match self {
            WirePacket::QuestFullSync(_) => "QuestFullSync",
            WirePacket::QuestConflictNotification(_) => "QuestConflictNotification",
            WirePacket::QuestVote(_) => "QuestVote",
            WirePacket::QuestObjectiveUpdate(_) => "QuestObjectiveUpdate",
            WirePacket::DialogStart(_) => "DialogStart",
            WirePacket::DialogChoice(_) => "DialogChoice",
            WirePacket::DialogVote(_) => "DialogVote",
            WirePacket::DialogEnd(_) => "DialogEnd",
            WirePacket::DialogStateUpdate(_) => "DialogStateUpdate",
            WirePacket::SessionRevoked { .. } => "SessionRevoked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    All,
    Player(u32),
    AllExcept(u32),
}

impl Audience {
    pub fn includes(&self, player_id: u32) -> bool {
        match self {
            Audience::All => true,
            Audience::Player(id) => *id == player_id,
            Audience::AllExcept(id) => *id != player_id,
        }
    }
}

/// A change the host game must enact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeDecision {
    pub audience: Audience,
    pub packet: WirePacket,
}

impl AuthoritativeDecision {
    pub fn broadcast(packet: WirePacket) -> Self {
        Self {
            audience: Audience::All,
            packet,
        }
    }

    pub fn to_player(player_id: u32, packet: WirePacket) -> Self {
        Self {
            audience: Audience::Player(player_id),
            packet,
        }
    }
}

/// The closed set of events a host bridge may inject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostEvent {
    PlayerJoin {
        player_id: u32,
        display_name: String,
    },
    PlayerLeave {
        player_id: u32,
    },
    PositionUpdate {
        player_id: u32,
        x: f32,
        y: f32,
        z: f32,
    },
    NpcDialogStart {
        npc_id: u32,
        speaker_id: u32,
        quest_hash: u32,
        sync_mode: u8,
    },
    DialogChoice {
        session_id: u32,
        player_id: u32,
        choice_id: u32,
    },
    DialogVote {
        session_id: u32,
        player_id: u32,
        approve: bool,
    },
    QuestStage {
        player_id: u32,
        quest_hash: u32,
        new_stage: u16,
    },
    QuestState {
        player_id: u32,
        quest_hash: u32,
        new_state: u8,
    },
    ObjectiveComplete {
        player_id: u32,
        quest_hash: u32,
        objective_id: u32,
    },
    BranchChoice {
        player_id: u32,
        quest_hash: u32,
        stage: u16,
        choice: u32,
    },
    QuestVote {
        player_id: u32,
        quest_hash: u32,
        approve: bool,
    },
}

impl HostEvent {
    /// The player on whose behalf the event claims to act.
    pub fn acting_player(&self) -> u32 {
        match self {
            HostEvent::PlayerJoin { player_id, .. }
            | HostEvent::PlayerLeave { player_id }
            | HostEvent::PositionUpdate { player_id, .. }
            | HostEvent::DialogChoice { player_id, .. }
            | HostEvent::DialogVote { player_id, .. }
            | HostEvent::QuestStage { player_id, .. }
            | HostEvent::QuestState { player_id, .. }
            | HostEvent::ObjectiveComplete { player_id, .. }
            | HostEvent::BranchChoice { player_id, .. }
            | HostEvent::QuestVote { player_id, .. } => *player_id,
            HostEvent::NpcDialogStart { speaker_id, .. } => *speaker_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HostEvent::PlayerJoin { .. } => "player-join",
            HostEvent::PlayerLeave { .. } => "player-leave",
            HostEvent::PositionUpdate { .. } => "position-update",
            HostEvent::NpcDialogStart { .. } => "npc-dialog-start",
            HostEvent::DialogChoice { .. } => "dialog-choice",
            HostEvent::DialogVote { .. } => "dialog-vote",
            HostEvent::QuestStage { .. } => "quest-stage",
            HostEvent::QuestState { .. } => "quest-state",
            HostEvent::ObjectiveComplete { .. } => "objective-complete",
            HostEvent::BranchChoice { .. } => "branch-choice",
            HostEvent::QuestVote { .. } => "quest-vote",
        }
    }
}

/// UDP envelope between a host bridge and the coordination server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    // bridge -> server
    Authenticate {
        protocol_version: u32,
        name: String,
        token: String,
        method: AuthMethod,
        fingerprint: String,
    },
    Event {
        player_id: u32,
        session_token: String,
        event: HostEvent,
    },
    Logout {
        player_id: u32,
        session_token: String,
    },
    Heartbeat {
        player_id: u32,
    },

    // server -> bridge
    Authenticated {
        player_id: u32,
        session_token: String,
        permission_level: PermissionLevel,
        permissions: Vec<String>,
        expires_at: u64,
    },
    AuthFailed {
        code: AuthResult,
        message: String,
    },
    Decision(AuthoritativeDecision),
    Error {
        kind: String,
        message: String,
    },
}
