use rand::Rng;
use serde::{Deserialize, Serialize};
use shared::{AuthMethod, PermissionLevel};
use std::collections::{BTreeSet, HashMap};

pub const SESSION_TOKEN_LEN: usize = 48;

const TOKEN_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// URL-safe session token drawn from the thread-local CSPRNG.
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// An authenticated player. Times are clock milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub player_id: u32,
    pub display_name: String,
    pub session_token: String,
    pub method: AuthMethod,
    pub fingerprint: String,
    pub endpoint: String,
    pub permission_level: PermissionLevel,
    pub granted_permissions: BTreeSet<String>,
    pub login_time: u64,
    pub last_activity: u64,
    pub expires_at: u64,
    pub is_authenticated: bool,
}

impl Session {
    /// Live on the half-open interval `[login_time, expires_at)`.
    pub fn is_live(&self, now: u64) -> bool {
        self.is_authenticated && now < self.expires_at
    }

    /// Bumps `last_activity` without letting it pass `expires_at`.
    pub fn touch(&mut self, now: u64) {
        self.last_activity = now.clamp(self.login_time, self.expires_at);
    }
}

/// A name the server has seen before, kept across sessions so the player id
/// and level survive logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPlayer {
    pub player_id: u32,
    pub name: String,
    pub level: PermissionLevel,
    pub last_endpoint: String,
    pub last_fingerprint: String,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    pub sessions: HashMap<u32, Session>,
    pub known: HashMap<String, KnownPlayer>,
}

impl SessionTable {
    pub fn known_by_id(&self, player_id: u32) -> Option<&KnownPlayer> {
        self.known.values().find(|k| k.player_id == player_id)
    }

    pub fn known_by_id_mut(&mut self, player_id: u32) -> Option<&mut KnownPlayer> {
        self.known.values_mut().find(|k| k.player_id == player_id)
    }

    /// Session level if online, otherwise the remembered level.
    pub fn level_of(&self, player_id: u32) -> Option<PermissionLevel> {
        self.sessions
            .get(&player_id)
            .map(|s| s.permission_level)
            .or_else(|| self.known_by_id(player_id).map(|k| k.level))
    }

    pub fn live_count(&self, now: u64) -> usize {
        self.sessions.values().filter(|s| s.is_live(now)).count()
    }
}
