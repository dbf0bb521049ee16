//! Save/load hooks for the identity tables that outlive a process.
//!
//! Only bans and known players are persisted; sessions are always rebuilt by
//! re-authentication.

use super::bans::BanRecord;
use super::session::KnownPlayer;
use crate::utils::lock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub next_player_id: u32,
    pub known_players: Vec<KnownPlayer>,
    pub bans: Vec<BanRecord>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("identity store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("identity store is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait IdentityStore: Send + Sync {
    fn save(&self, snapshot: &IdentitySnapshot) -> Result<(), StoreError>;

    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<IdentitySnapshot>, StoreError>;
}

/// Pretty-printed JSON file, written through a temporary sibling and renamed.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl IdentityStore for JsonFileStore {
    fn save(&self, snapshot: &IdentitySnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<IdentitySnapshot>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<Option<IdentitySnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryStore {
    fn save(&self, snapshot: &IdentitySnapshot) -> Result<(), StoreError> {
        *lock(&self.saved) = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<IdentitySnapshot>, StoreError> {
        Ok(lock(&self.saved).clone())
    }
}
