//! # Configuration
//!
//! A fixed, typed configuration record read once when the core initializes.
//! Every field has a default, so a partial (or empty) TOML file is valid:
//!
//! ```toml
//! [identity]
//! max_online_players = 4
//! session_ttl_secs = 1800
//!
//! [dialog]
//! proximity_range = 20.0
//!
//! [lifecycle]
//! max_restart_attempts = 2
//! ```
//!
//! Values are validated on load and after every [`CoreConfig::reset_to_default`].
//! Command-line flags of the server binary override file values.

use crate::dialog::DialogSyncMode;
use crate::quest::QuestPriority;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub max_online_players: usize,
    pub session_ttl_secs: u64,
    pub max_failed_attempts: usize,
    pub attempt_window_secs: u64,
    /// Upper bound on remembered attempts per endpoint
    pub attempt_history_per_endpoint: usize,
    pub session_sweep_interval_secs: u64,
    /// Ban and login-attempt pruning interval
    pub cleanup_interval_secs: u64,
    pub maintenance_mode: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_online_players: 8,
            session_ttl_secs: 3600,
            max_failed_attempts: 5,
            attempt_window_secs: 900,
            attempt_history_per_endpoint: 32,
            session_sweep_interval_secs: 60,
            cleanup_interval_secs: 300,
            maintenance_mode: false,
        }
    }
}

impl IdentityConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn attempt_window(&self) -> Duration {
        Duration::from_secs(self.attempt_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogConfig {
    pub vote_timeout_secs: u64,
    pub dialog_timeout_secs: u64,
    pub proximity_range: f32,
    pub max_participants: usize,
    pub allow_spectators: bool,
    pub enable_skill_checks: bool,
    pub enable_quest_requirements: bool,
    pub record_history: bool,
    pub max_history_entries: usize,
    pub default_sync_mode: DialogSyncMode,
    /// How often the background scan fails expired votes
    pub vote_scan_interval_ms: u64,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            vote_timeout_secs: 30,
            dialog_timeout_secs: 120,
            proximity_range: 15.0,
            max_participants: 8,
            allow_spectators: true,
            enable_skill_checks: true,
            enable_quest_requirements: true,
            record_history: true,
            max_history_entries: 256,
            default_sync_mode: DialogSyncMode::Speaker,
            vote_scan_interval_ms: 1_000,
        }
    }
}

/// Maximum staleness, in milliseconds, per quest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncThresholds {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub background: u64,
}

impl Default for SyncThresholds {
    fn default() -> Self {
        Self {
            critical: 0,
            high: 1_000,
            medium: 5_000,
            low: 30_000,
            background: 300_000,
        }
    }
}

impl SyncThresholds {
    pub fn for_priority(&self, priority: QuestPriority) -> u64 {
        match priority {
            QuestPriority::Critical => self.critical,
            QuestPriority::High => self.high,
            QuestPriority::Medium => self.medium,
            QuestPriority::Low => self.low,
            QuestPriority::Background => self.background,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestConfig {
    pub vote_timeout_secs: u64,
    pub max_quest_history: usize,
    pub auto_repair: bool,
    pub conflict_check_interval_ms: u64,
    pub validation_interval_ms: u64,
    /// How often the background walker looks for stale quests
    pub sync_walk_interval_ms: u64,
    pub sync_thresholds_ms: SyncThresholds,
}

impl Default for QuestConfig {
    fn default() -> Self {
        Self {
            vote_timeout_secs: 30,
            max_quest_history: 100,
            auto_repair: true,
            conflict_check_interval_ms: 5_000,
            validation_interval_ms: 30_000,
            sync_walk_interval_ms: 1_000,
            sync_thresholds_ms: SyncThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub health_check_interval_ms: u64,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
    pub watchdog: bool,
    pub watchdog_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 5_000,
            auto_restart: true,
            max_restart_attempts: 3,
            watchdog: true,
            watchdog_timeout_ms: 30_000,
            watchdog_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub tick_rate: u32,
    pub peer_timeout_secs: u64,
    pub max_packet_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7777".to_string(),
            tick_rate: 30,
            peer_timeout_secs: 10,
            max_packet_size: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Individually resettable entries of the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    MaxOnlinePlayers,
    SessionTtl,
    MaxFailedAttempts,
    AttemptWindow,
    DefaultVoteTimeout,
    DialogTimeout,
    ProximityRange,
    MaxParticipants,
    AllowSpectators,
    SyncThresholds,
    MaxQuestHistory,
    MaxRestartAttempts,
    HealthCheckInterval,
    AutoRestart,
    Watchdog,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub identity: IdentityConfig,
    pub dialog: DialogConfig,
    pub quest: QuestConfig,
    pub lifecycle: LifecycleConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Reads, parses and validates a TOML configuration file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let identity = &self.identity;
        if identity.max_online_players == 0 {
            return Err(invalid("identity.max_online_players", "must be at least 1"));
        }
        if identity.session_ttl_secs == 0 {
            return Err(invalid("identity.session_ttl_secs", "must be positive"));
        }
        if identity.max_failed_attempts == 0 {
            return Err(invalid("identity.max_failed_attempts", "must be at least 1"));
        }
        if identity.attempt_window_secs == 0 {
            return Err(invalid("identity.attempt_window_secs", "must be positive"));
        }
        if identity.attempt_history_per_endpoint < identity.max_failed_attempts {
            return Err(invalid(
                "identity.attempt_history_per_endpoint",
                format!(
                    "must hold at least max_failed_attempts ({}) entries",
                    identity.max_failed_attempts
                ),
            ));
        }
        if identity.session_sweep_interval_secs == 0 || identity.session_sweep_interval_secs > 60 {
            return Err(invalid(
                "identity.session_sweep_interval_secs",
                "must be between 1 and 60",
            ));
        }

        let dialog = &self.dialog;
        if dialog.vote_timeout_secs == 0 {
            return Err(invalid("dialog.vote_timeout_secs", "must be positive"));
        }
        if dialog.dialog_timeout_secs == 0 {
            return Err(invalid("dialog.dialog_timeout_secs", "must be positive"));
        }
        if !(dialog.proximity_range > 0.0 && dialog.proximity_range.is_finite()) {
            return Err(invalid("dialog.proximity_range", "must be a positive distance"));
        }
        if !(1..=64).contains(&dialog.max_participants) {
            return Err(invalid("dialog.max_participants", "must be between 1 and 64"));
        }
        if dialog.vote_scan_interval_ms == 0 {
            return Err(invalid("dialog.vote_scan_interval_ms", "must be positive"));
        }

        let quest = &self.quest;
        if quest.vote_timeout_secs == 0 {
            return Err(invalid("quest.vote_timeout_secs", "must be positive"));
        }
        if quest.max_quest_history == 0 {
            return Err(invalid("quest.max_quest_history", "must be at least 1"));
        }
        if quest.sync_walk_interval_ms == 0 {
            return Err(invalid("quest.sync_walk_interval_ms", "must be positive"));
        }
        let t = quest.sync_thresholds_ms;
        if !(t.critical <= t.high && t.high <= t.medium && t.medium <= t.low && t.low <= t.background)
        {
            return Err(invalid(
                "quest.sync_thresholds_ms",
                "must not decrease from critical to background",
            ));
        }

        let lifecycle = &self.lifecycle;
        if lifecycle.health_check_interval_ms == 0 {
            return Err(invalid("lifecycle.health_check_interval_ms", "must be positive"));
        }
        if lifecycle.watchdog && lifecycle.watchdog_timeout_ms == 0 {
            return Err(invalid("lifecycle.watchdog_timeout_ms", "must be positive"));
        }

        let network = &self.network;
        if !(1..=240).contains(&network.tick_rate) {
            return Err(invalid("network.tick_rate", "must be between 1 and 240"));
        }
        if network.max_packet_size < 64 {
            return Err(invalid("network.max_packet_size", "must be at least 64 bytes"));
        }

        Ok(())
    }

    /// Restores one entry to its default and re-validates the whole record.
    ///
    /// On failure the previous value is put back, so the record never holds
    /// a combination that `validate` rejects.
    pub fn reset_to_default(&mut self, key: ConfigKey) -> Result<(), ConfigError> {
        let previous = self.clone();
        let identity = IdentityConfig::default();
        let dialog = DialogConfig::default();
        let quest = QuestConfig::default();
        let lifecycle = LifecycleConfig::default();

        match key {
            ConfigKey::MaxOnlinePlayers => {
                self.identity.max_online_players = identity.max_online_players
            }
            ConfigKey::SessionTtl => self.identity.session_ttl_secs = identity.session_ttl_secs,
            ConfigKey::MaxFailedAttempts => {
                self.identity.max_failed_attempts = identity.max_failed_attempts
            }
            ConfigKey::AttemptWindow => {
                self.identity.attempt_window_secs = identity.attempt_window_secs
            }
            ConfigKey::DefaultVoteTimeout => {
                self.dialog.vote_timeout_secs = dialog.vote_timeout_secs;
                self.quest.vote_timeout_secs = quest.vote_timeout_secs;
            }
            ConfigKey::DialogTimeout => self.dialog.dialog_timeout_secs = dialog.dialog_timeout_secs,
            ConfigKey::ProximityRange => self.dialog.proximity_range = dialog.proximity_range,
            ConfigKey::MaxParticipants => self.dialog.max_participants = dialog.max_participants,
            ConfigKey::AllowSpectators => self.dialog.allow_spectators = dialog.allow_spectators,
            ConfigKey::SyncThresholds => {
                self.quest.sync_thresholds_ms = quest.sync_thresholds_ms
            }
            ConfigKey::MaxQuestHistory => self.quest.max_quest_history = quest.max_quest_history,
            ConfigKey::MaxRestartAttempts => {
                self.lifecycle.max_restart_attempts = lifecycle.max_restart_attempts
            }
            ConfigKey::HealthCheckInterval => {
                self.lifecycle.health_check_interval_ms = lifecycle.health_check_interval_ms
            }
            ConfigKey::AutoRestart => self.lifecycle.auto_restart = lifecycle.auto_restart,
            ConfigKey::Watchdog => self.lifecycle.watchdog = lifecycle.watchdog,
        }

        if let Err(e) = self.validate() {
            *self = previous;
            return Err(e);
        }
        Ok(())
    }
}
