//! # Identity & Session
//!
//! Issues session tokens, keeps the roster of live sessions, answers
//! capability checks and enforces bans and the login rate limit.
//!
//! Sessions, permissions and bans each sit behind their own `RwLock`; the
//! login-attempt table has a dedicated `Mutex`. No two of them are held at the
//! same time, and events are published only after every guard is dropped.
//!
//! ## Authentication pipeline
//!
//! Attempts are rejected, in order, for: maintenance mode, malformed input,
//! too many recent failures from the endpoint, a matching ban, a suspended
//! account, a full server, and finally credentials the configured
//! [`CredentialVerifier`] refuses. Maintenance and capacity rejections are not
//! counted against the endpoint; everything else is.

pub mod bans;
pub mod permissions;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod validation;

pub use bans::{BanRecord, BanTarget, BanType};
pub use permissions::{AdminAction, Permission, PermissionRegistry};
pub use session::{KnownPlayer, Session};
pub use store::{IdentitySnapshot, IdentityStore, JsonFileStore, MemoryStore, StoreError};

use crate::clock::SharedClock;
use crate::config::IdentityConfig;
use crate::error::{AuthRejection, CoreError, CoreResult};
use crate::event_bus::{CoreEvent, EventBus};
use crate::utils::{lock, read, token_preview, write};
use bans::BanList;
use log::{debug, info, warn};
use permissions::outranks;
use rate_limit::AttemptTracker;
use session::{generate_token, SessionTable};
use shared::{AuthMethod, AuthResult, PermissionLevel};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub name: String,
    pub token: String,
    pub method: AuthMethod,
    pub fingerprint: String,
    pub endpoint: String,
}

impl AuthRequest {
    pub fn new(name: &str, token: &str, method: AuthMethod, fingerprint: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            token: token.to_string(),
            method,
            fingerprint: fingerprint.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

/// What a successful authentication hands back to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub player_id: u32,
    pub session_token: String,
    pub permission_level: PermissionLevel,
    pub permissions: Vec<String>,
    pub expires_at: u64,
}

/// Platform credential check, consulted after every other gate has passed.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, request: &AuthRequest) -> bool;
}

/// Accepts any token that already passed the shape checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShapeOnlyVerifier;

impl CredentialVerifier for ShapeOnlyVerifier {
    fn verify(&self, _request: &AuthRequest) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlinePlayer {
    pub player_id: u32,
    pub name: String,
    pub level: PermissionLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthStats {
    pub total_logins: u64,
    pub failed_logins: u64,
    pub active_bans: usize,
    pub online_players: usize,
}

pub struct AuthManager {
    config: IdentityConfig,
    clock: SharedClock,
    bus: Arc<EventBus>,
    verifier: RwLock<Arc<dyn CredentialVerifier>>,
    sessions: RwLock<SessionTable>,
    permissions: RwLock<PermissionRegistry>,
    bans: RwLock<BanList>,
    attempts: Mutex<AttemptTracker>,
    next_player_id: AtomicU32,
    maintenance: AtomicBool,
    total_logins: AtomicU64,
    failed_logins: AtomicU64,
}

impl AuthManager {
    pub fn new(config: IdentityConfig, clock: SharedClock, bus: Arc<EventBus>) -> Self {
        let attempts = AttemptTracker::new(
            config.attempt_window().as_millis() as u64,
            config.max_failed_attempts,
            config.attempt_history_per_endpoint,
        );
        let maintenance = config.maintenance_mode;
        Self {
            config,
            clock,
            bus,
            verifier: RwLock::new(Arc::new(ShapeOnlyVerifier)),
            sessions: RwLock::new(SessionTable::default()),
            permissions: RwLock::new(PermissionRegistry::with_defaults()),
            bans: RwLock::new(BanList::new()),
            attempts: Mutex::new(attempts),
            next_player_id: AtomicU32::new(1),
            maintenance: AtomicBool::new(maintenance),
            total_logins: AtomicU64::new(0),
            failed_logins: AtomicU64::new(0),
        }
    }

    pub fn set_verifier(&self, verifier: Arc<dyn CredentialVerifier>) {
        *write(&self.verifier) = verifier;
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn ttl_ms(&self) -> u64 {
        self.config.session_ttl().as_millis() as u64
    }

    // ---- authentication ------------------------------------------------

    pub fn authenticate(&self, request: &AuthRequest) -> Result<AuthGrant, AuthRejection> {
        let now = self.now();
        match self.try_authenticate(request, now) {
            Ok(grant) => {
                lock(&self.attempts).record(&request.endpoint, now, true);
                self.total_logins.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Player {} authenticated as #{} ({}) from {}",
                    request.name,
                    grant.player_id,
                    grant.permission_level.name(),
                    request.endpoint
                );
                debug!(
                    "Issued session {}... expiring at {}",
                    token_preview(&grant.session_token),
                    grant.expires_at
                );
                self.bus.publish(CoreEvent::PlayerAuthenticated {
                    player_id: grant.player_id,
                    name: request.name.clone(),
                });
                Ok(grant)
            }
            Err(rejection) => {
                let counted = !matches!(
                    rejection.code,
                    AuthResult::MaintenanceMode | AuthResult::ServerFull
                );
                if counted {
                    lock(&self.attempts).record(&request.endpoint, now, false);
                }
                self.failed_logins.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Authentication for {} from {} rejected: {}",
                    request.name, request.endpoint, rejection
                );
                self.bus.publish(CoreEvent::AuthFailed {
                    name: request.name.clone(),
                    endpoint: request.endpoint.clone(),
                    code: rejection.code.name().to_string(),
                });
                Err(rejection)
            }
        }
    }

    fn try_authenticate(&self, request: &AuthRequest, now: u64) -> Result<AuthGrant, AuthRejection> {
        if self.maintenance.load(Ordering::SeqCst) {
            return Err(AuthRejection::new(
                AuthResult::MaintenanceMode,
                "server is in maintenance mode",
            ));
        }

        validation::validate_name(&request.name)
            .and_then(|_| validation::validate_fingerprint(&request.fingerprint))
            .and_then(|_| validation::validate_endpoint(&request.endpoint))
            .and_then(|_| validation::validate_token(request.method, &request.token))
            .map_err(|e| AuthRejection::new(AuthResult::RequiredDataMissing, e.to_string()))?;

        if lock(&self.attempts).is_limited(&request.endpoint, now) {
            return Err(AuthRejection::new(
                AuthResult::TooManyAttempts,
                format!("too many failed attempts from {}", request.endpoint),
            ));
        }

        let known = read(&self.sessions).known.get(&request.name).cloned();
        let existing_id = known.as_ref().map(|k| k.player_id);

        if let Some(ban) =
            read(&self.bans).find_match(existing_id, &request.endpoint, &request.fingerprint, now)
        {
            return Err(AuthRejection::new(
                AuthResult::AccountBanned,
                format!("{} ({})", ban.reason, ban.ban_id),
            ));
        }

        let level = known.as_ref().map_or(PermissionLevel::Player, |k| k.level);
        if level == PermissionLevel::Banned {
            return Err(AuthRejection::new(
                AuthResult::AccountSuspended,
                "account is suspended",
            ));
        }

        if self.at_capacity(existing_id, now) {
            return Err(AuthRejection::new(AuthResult::ServerFull, "server is full"));
        }

        let verifier = Arc::clone(&*read(&self.verifier));
        if !verifier.verify(request) {
            return Err(AuthRejection::new(
                AuthResult::InvalidCredentials,
                format!("{} credentials rejected", request.method.name()),
            ));
        }

        let granted = read(&self.permissions).implied_for(level);
        let session_token = generate_token();
        let expires_at = now.saturating_add(self.ttl_ms());

        let mut table = write(&self.sessions);
        // Capacity may have changed while no lock was held.
        let replacing = existing_id.map_or(false, |id| table.sessions.contains_key(&id));
        if !replacing && table.live_count(now) >= self.config.max_online_players {
            return Err(AuthRejection::new(AuthResult::ServerFull, "server is full"));
        }

        let player_id =
            existing_id.unwrap_or_else(|| self.next_player_id.fetch_add(1, Ordering::SeqCst));
        table.known.insert(
            request.name.clone(),
            KnownPlayer {
                player_id,
                name: request.name.clone(),
                level,
                last_endpoint: request.endpoint.clone(),
                last_fingerprint: request.fingerprint.clone(),
            },
        );
        table.sessions.insert(
            player_id,
            Session {
                player_id,
                display_name: request.name.clone(),
                session_token: session_token.clone(),
                method: request.method,
                fingerprint: request.fingerprint.clone(),
                endpoint: request.endpoint.clone(),
                permission_level: level,
                granted_permissions: granted.clone(),
                login_time: now,
                last_activity: now,
                expires_at,
                is_authenticated: true,
            },
        );

        Ok(AuthGrant {
            player_id,
            session_token,
            permission_level: level,
            permissions: granted.into_iter().collect(),
            expires_at,
        })
    }

    fn at_capacity(&self, existing_id: Option<u32>, now: u64) -> bool {
        let table = read(&self.sessions);
        let already_online = existing_id
            .and_then(|id| table.sessions.get(&id))
            .map_or(false, |s| s.is_live(now));
        !already_online && table.live_count(now) >= self.config.max_online_players
    }

    // ---- session lifetime ---------------------------------------------

    pub fn logout(&self, player_id: u32) -> CoreResult<()> {
        let removed = write(&self.sessions).sessions.remove(&player_id);
        let session = removed.ok_or_else(|| CoreError::not_found("session", player_id))?;
        info!("Player {} (#{}) logged out", session.display_name, player_id);
        self.bus.publish(CoreEvent::PlayerLoggedOut {
            player_id,
            reason: "logout".to_string(),
        });
        Ok(())
    }

    /// Extends a live session to `now + session_ttl`; returns the new expiry.
    pub fn refresh(&self, player_id: u32) -> CoreResult<u64> {
        let now = self.now();
        let ttl = self.ttl_ms();
        let mut table = write(&self.sessions);
        let session = table
            .sessions
            .get_mut(&player_id)
            .ok_or_else(|| CoreError::not_found("session", player_id))?;
        if !session.is_live(now) {
            return Err(CoreError::PreconditionFailed(format!(
                "session of player {} has expired",
                player_id
            )));
        }
        session.expires_at = now.saturating_add(ttl);
        session.touch(now);
        Ok(session.expires_at)
    }

    /// Checks that `token` belongs to a live session of `player_id` and
    /// records the activity.
    pub fn validate_session(&self, player_id: u32, token: &str) -> CoreResult<()> {
        let now = self.now();
        let mut table = write(&self.sessions);
        let session = table
            .sessions
            .get_mut(&player_id)
            .ok_or_else(|| CoreError::not_found("session", player_id))?;
        if session.session_token != token {
            debug!(
                "Token {}... does not match session of player {}",
                token_preview(token),
                player_id
            );
            return Err(CoreError::PermissionDenied(format!(
                "invalid session token for player {}",
                player_id
            )));
        }
        if !session.is_live(now) {
            return Err(CoreError::PreconditionFailed(format!(
                "session of player {} has expired",
                player_id
            )));
        }
        session.touch(now);
        Ok(())
    }

    /// Removes every session with `now >= expires_at`.
    pub fn sweep_expired_sessions(&self) -> Vec<u32> {
        let now = self.now();
        let expired: Vec<u32> = {
            let mut table = write(&self.sessions);
            let ids: Vec<u32> = table
                .sessions
                .values()
                .filter(|s| !s.is_live(now))
                .map(|s| s.player_id)
                .collect();
            for id in &ids {
                table.sessions.remove(id);
            }
            ids
        };

        for &player_id in &expired {
            info!("Session of player #{} expired", player_id);
            self.bus.publish(CoreEvent::PlayerLoggedOut {
                player_id,
                reason: "expired".to_string(),
            });
        }
        expired
    }

    /// Prunes dead bans and aged login attempts.
    pub fn cleanup(&self) -> (usize, usize) {
        let now = self.now();
        let bans = write(&self.bans).prune(now);
        let attempts = lock(&self.attempts).prune(now);
        if bans > 0 || attempts > 0 {
            debug!("Identity cleanup removed {} bans and {} attempts", bans, attempts);
        }
        (bans, attempts)
    }

    // ---- permissions ----------------------------------------------------

    pub fn register_permission(
        &self,
        name: &str,
        description: &str,
        required_level: PermissionLevel,
        is_default: bool,
    ) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::InvalidArgument(
                "permission name must not be empty".to_string(),
            ));
        }
        write(&self.permissions).register(name, description, required_level, is_default);
        Ok(())
    }

    /// True iff the session is live and the capability is granted or implied
    /// by the session's level.
    pub fn check_permission(&self, player_id: u32, capability: &str) -> bool {
        let now = self.now();
        let (level, granted) = {
            let table = read(&self.sessions);
            match table.sessions.get(&player_id) {
                Some(s) if s.is_live(now) => (
                    s.permission_level,
                    s.granted_permissions.contains(capability),
                ),
                _ => return false,
            }
        };
        granted
            || read(&self.permissions)
                .required_level(capability)
                .map_or(false, |required| required <= level)
    }

    pub fn require_permission(&self, player_id: u32, capability: &str) -> CoreResult<()> {
        if self.check_permission(player_id, capability) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied(format!(
                "player {} lacks capability {}",
                player_id, capability
            )))
        }
    }

    fn actor_level(&self, admin_id: u32) -> CoreResult<PermissionLevel> {
        let now = self.now();
        read(&self.sessions)
            .sessions
            .get(&admin_id)
            .filter(|s| s.is_live(now))
            .map(|s| s.permission_level)
            .ok_or_else(|| {
                CoreError::PermissionDenied(format!("player {} has no live session", admin_id))
            })
    }

    fn target_level(&self, target_id: u32) -> CoreResult<PermissionLevel> {
        read(&self.sessions)
            .level_of(target_id)
            .ok_or_else(|| CoreError::not_found("player", target_id))
    }

    pub fn has_admin_permission(&self, admin_id: u32, target_id: u32, action: AdminAction) -> bool {
        match (self.actor_level(admin_id), self.target_level(target_id)) {
            (Ok(admin), Ok(target)) => outranks(admin, target, action),
            _ => false,
        }
    }

    fn ensure_outranks(&self, admin_id: u32, target_id: u32, action: AdminAction) -> CoreResult<()> {
        let admin = self.actor_level(admin_id)?;
        let target = self.target_level(target_id)?;
        if outranks(admin, target, action) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied(format!(
                "player {} ({}) may not {} player {} ({})",
                admin_id,
                admin.name(),
                action.name(),
                target_id,
                target.name()
            )))
        }
    }

    /// Changes a player's level and re-seeds their level-implied capabilities.
    /// Explicit grants are cleared.
    pub fn set_permission_level(
        &self,
        admin_id: u32,
        target_id: u32,
        new_level: PermissionLevel,
    ) -> CoreResult<()> {
        let current = self.target_level(target_id)?;
        let action = if new_level >= current {
            AdminAction::Promote
        } else {
            AdminAction::Demote
        };
        self.ensure_outranks(admin_id, target_id, action)?;

        let admin = self.actor_level(admin_id)?;
        if admin < PermissionLevel::SuperAdmin && new_level >= admin {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not assign level {}",
                admin.name(),
                new_level.name()
            )));
        }

        self.apply_level(target_id, new_level);
        info!(
            "Player #{} changed level of #{} from {} to {}",
            admin_id,
            target_id,
            current.name(),
            new_level.name()
        );
        Ok(())
    }

    pub fn promote(&self, admin_id: u32, target_id: u32, new_level: PermissionLevel) -> CoreResult<()> {
        if new_level <= self.target_level(target_id)? {
            return Err(CoreError::InvalidArgument(format!(
                "{} is not a promotion",
                new_level.name()
            )));
        }
        self.set_permission_level(admin_id, target_id, new_level)
    }

    pub fn demote(&self, admin_id: u32, target_id: u32, new_level: PermissionLevel) -> CoreResult<()> {
        if new_level >= self.target_level(target_id)? {
            return Err(CoreError::InvalidArgument(format!(
                "{} is not a demotion",
                new_level.name()
            )));
        }
        self.set_permission_level(admin_id, target_id, new_level)
    }

    /// Console-level assignment that bypasses actor checks.
    pub fn assign_level(&self, player_id: u32, level: PermissionLevel) -> CoreResult<()> {
        self.target_level(player_id)?;
        warn!("Level of player #{} set to {} by console", player_id, level.name());
        self.apply_level(player_id, level);
        Ok(())
    }

    fn apply_level(&self, player_id: u32, level: PermissionLevel) {
        let implied = read(&self.permissions).implied_for(level);
        {
            let mut table = write(&self.sessions);
            if let Some(known) = table.known_by_id_mut(player_id) {
                known.level = level;
            }
            if let Some(session) = table.sessions.get_mut(&player_id) {
                session.permission_level = level;
                session.granted_permissions = implied;
            }
        }
        self.bus.publish(CoreEvent::PermissionChanged {
            player_id,
            level: level.as_u8(),
        });
    }

    pub fn grant_permission(&self, admin_id: u32, target_id: u32, capability: &str) -> CoreResult<()> {
        self.edit_grant(admin_id, target_id, capability, true)
    }

    pub fn revoke_permission(&self, admin_id: u32, target_id: u32, capability: &str) -> CoreResult<()> {
        self.edit_grant(admin_id, target_id, capability, false)
    }

    fn edit_grant(&self, admin_id: u32, target_id: u32, capability: &str, grant: bool) -> CoreResult<()> {
        self.require_permission(admin_id, permissions::SET_PERMISSION_LEVEL)?;
        if !read(&self.permissions).contains(capability) {
            return Err(CoreError::not_found("permission", capability));
        }
        self.ensure_outranks(admin_id, target_id, AdminAction::Grant)?;

        let mut table = write(&self.sessions);
        let session = table
            .sessions
            .get_mut(&target_id)
            .ok_or_else(|| CoreError::not_found("session", target_id))?;
        if grant {
            session.granted_permissions.insert(capability.to_string());
        } else {
            session.granted_permissions.remove(capability);
        }
        info!(
            "Player #{} {} {} for #{}",
            admin_id,
            if grant { "granted" } else { "revoked" },
            capability,
            target_id
        );
        Ok(())
    }

    // ---- moderation -----------------------------------------------------

    pub fn kick(&self, admin_id: u32, target_id: u32, reason: &str) -> CoreResult<()> {
        if !read(&self.sessions).sessions.contains_key(&target_id) {
            return Err(CoreError::not_found("session", target_id));
        }
        self.ensure_outranks(admin_id, target_id, AdminAction::Kick)?;
        write(&self.sessions).sessions.remove(&target_id);

        warn!("Player #{} kicked by #{}: {}", target_id, admin_id, reason);
        self.bus.publish(CoreEvent::PlayerKicked {
            player_id: target_id,
            admin_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Bans a known player on the dimensions `ban_type` covers, taken from
    /// their live session or their last login.
    pub fn ban(
        &self,
        admin_id: u32,
        target_id: u32,
        reason: &str,
        ban_type: BanType,
        duration: Option<Duration>,
    ) -> CoreResult<String> {
        let target = {
            let table = read(&self.sessions);
            if let Some(session) = table.sessions.get(&target_id) {
                BanTarget {
                    player_id: Some(target_id),
                    endpoint: Some(session.endpoint.clone()),
                    fingerprint: Some(session.fingerprint.clone()),
                }
            } else if let Some(known) = table.known_by_id(target_id) {
                BanTarget {
                    player_id: Some(target_id),
                    endpoint: Some(known.last_endpoint.clone()),
                    fingerprint: Some(known.last_fingerprint.clone()),
                }
            } else {
                return Err(CoreError::not_found("player", target_id));
            }
        };
        self.ban_target(admin_id, target, reason, ban_type, duration)
    }

    /// Bans arbitrary dimensions and drops every session the ban matches.
    pub fn ban_target(
        &self,
        admin_id: u32,
        target: BanTarget,
        reason: &str,
        ban_type: BanType,
        duration: Option<Duration>,
    ) -> CoreResult<String> {
        let admin = self.actor_level(admin_id)?;
        let target_level = target
            .player_id
            .and_then(|id| read(&self.sessions).level_of(id))
            .unwrap_or(PermissionLevel::Banned);
        if !outranks(admin, target_level, AdminAction::Ban) {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not ban a {}",
                admin.name(),
                target_level.name()
            )));
        }

        let now = self.now();
        let record = {
            let mut bans = write(&self.bans);
            let mut ban_id = bans::generate_ban_id();
            while bans.contains(&ban_id) {
                ban_id = bans::generate_ban_id();
            }
            let record = BanRecord::new(
                ban_id,
                target,
                admin_id,
                reason,
                ban_type,
                now,
                duration.map(|d| d.as_millis() as u64),
            );
            if record.player_id.is_none() && record.endpoint.is_none() && record.fingerprint.is_none() {
                return Err(CoreError::InvalidArgument(
                    "ban covers no player, endpoint or fingerprint".to_string(),
                ));
            }
            bans.insert(record.clone());
            record
        };

        let removed: Vec<u32> = {
            let mut table = write(&self.sessions);
            let ids: Vec<u32> = table
                .sessions
                .values()
                .filter(|s| {
                    record.player_id == Some(s.player_id)
                        || record.endpoint.as_deref() == Some(s.endpoint.as_str())
                        || record.fingerprint.as_deref() == Some(s.fingerprint.as_str())
                })
                .map(|s| s.player_id)
                .collect();
            for id in &ids {
                table.sessions.remove(id);
            }
            ids
        };

        warn!(
            "Ban {} ({:?}) issued by #{}: {}",
            record.ban_id, ban_type, admin_id, reason
        );
        let player_ids = record.player_id.into_iter().chain(removed).collect::<std::collections::BTreeSet<_>>();
        for player_id in player_ids {
            self.bus.publish(CoreEvent::PlayerBanned {
                player_id,
                ban_id: record.ban_id.clone(),
                admin_id,
                reason: reason.to_string(),
            });
        }
        Ok(record.ban_id)
    }

    pub fn unban(&self, admin_id: u32, ban_id: &str, reason: &str) -> CoreResult<()> {
        let admin = self.actor_level(admin_id)?;
        if admin < PermissionLevel::Admin {
            return Err(CoreError::PermissionDenied(format!(
                "{} may not lift bans",
                admin.name()
            )));
        }
        {
            let mut bans = write(&self.bans);
            let active = bans
                .get(ban_id)
                .map(|record| record.active)
                .ok_or_else(|| CoreError::not_found("ban", ban_id))?;
            if !active {
                return Err(CoreError::PreconditionFailed(format!(
                    "ban {} is already lifted",
                    ban_id
                )));
            }
            bans.deactivate(ban_id);
        }
        info!("Ban {} lifted by #{}: {}", ban_id, admin_id, reason);
        self.bus.publish(CoreEvent::PlayerUnbanned {
            ban_id: ban_id.to_string(),
            admin_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn is_banned(&self, endpoint: &str, fingerprint: &str, name: &str) -> bool {
        let player_id = read(&self.sessions).known.get(name).map(|k| k.player_id);
        read(&self.bans)
            .find_match(player_id, endpoint, fingerprint, self.now())
            .is_some()
    }

    pub fn active_bans(&self) -> Vec<BanRecord> {
        read(&self.bans).active(self.now())
    }

    // ---- roster ---------------------------------------------------------

    pub fn set_maintenance_mode(&self, enabled: bool) {
        self.maintenance.store(enabled, Ordering::SeqCst);
        warn!("Maintenance mode {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_maintenance_mode(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    pub fn online_players(&self) -> Vec<OnlinePlayer> {
        let now = self.now();
        let table = read(&self.sessions);
        let mut players: Vec<OnlinePlayer> = table
            .sessions
            .values()
            .filter(|s| s.is_live(now))
            .map(|s| OnlinePlayer {
                player_id: s.player_id,
                name: s.display_name.clone(),
                level: s.permission_level,
            })
            .collect();
        players.sort_by_key(|p| p.player_id);
        players
    }

    pub fn get_session(&self, player_id: u32) -> Option<Session> {
        read(&self.sessions).sessions.get(&player_id).cloned()
    }

    pub fn is_online(&self, player_id: u32) -> bool {
        let now = self.now();
        read(&self.sessions)
            .sessions
            .get(&player_id)
            .map_or(false, |s| s.is_live(now))
    }

    pub fn stats(&self) -> AuthStats {
        AuthStats {
            total_logins: self.total_logins.load(Ordering::Relaxed),
            failed_logins: self.failed_logins.load(Ordering::Relaxed),
            active_bans: self.active_bans().len(),
            online_players: read(&self.sessions).live_count(self.now()),
        }
    }

    // ---- persistence ----------------------------------------------------

    pub fn snapshot(&self) -> IdentitySnapshot {
        let mut known_players: Vec<KnownPlayer> =
            read(&self.sessions).known.values().cloned().collect();
        known_players.sort_by_key(|k| k.player_id);
        IdentitySnapshot {
            next_player_id: self.next_player_id.load(Ordering::SeqCst),
            known_players,
            bans: read(&self.bans).all(),
        }
    }

    /// Replaces known players and bans; live sessions are dropped.
    pub fn restore(&self, snapshot: IdentitySnapshot) {
        let highest = snapshot
            .known_players
            .iter()
            .map(|k| k.player_id)
            .max()
            .unwrap_or(0);
        self.next_player_id
            .store(snapshot.next_player_id.max(highest + 1), Ordering::SeqCst);
        {
            let mut table = write(&self.sessions);
            table.sessions.clear();
            table.known = snapshot
                .known_players
                .into_iter()
                .map(|k| (k.name.clone(), k))
                .collect();
        }
        let mut bans = write(&self.bans);
        *bans = BanList::new();
        for record in snapshot.bans {
            bans.insert(record);
        }
    }

    pub fn save_to(&self, store: &dyn IdentityStore) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        store.save(&snapshot)?;
        info!(
            "Saved {} known players and {} bans",
            snapshot.known_players.len(),
            snapshot.bans.len()
        );
        Ok(())
    }

    /// Returns false when the store was empty.
    pub fn load_from(&self, store: &dyn IdentityStore) -> Result<bool, StoreError> {
        match store.load()? {
            Some(snapshot) => {
                info!(
                    "Loaded {} known players and {} bans",
                    snapshot.known_players.len(),
                    snapshot.bans.len()
                );
                self.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::error::ErrorKind;
    use crate::event_bus::{topics, EventRecorder};

    const TOKEN: &str = "tok16chars______";

    struct RejectAll;

    impl CredentialVerifier for RejectAll {
        fn verify(&self, _request: &AuthRequest) -> bool {
            false
        }
    }

    fn test_config() -> IdentityConfig {
        IdentityConfig {
            max_online_players: 3,
            ..IdentityConfig::default()
        }
    }

    fn manager_with(config: IdentityConfig) -> (AuthManager, ManualClock, EventRecorder) {
        let clock = ManualClock::new(1_000_000);
        let bus = Arc::new(EventBus::new());
        let recorder = EventRecorder::attach(&bus);
        let manager = AuthManager::new(config, Arc::new(clock.clone()), bus);
        (manager, clock, recorder)
    }

    fn setup() -> (AuthManager, ManualClock, EventRecorder) {
        manager_with(test_config())
    }

    fn auth_with(manager: &AuthManager, name: &str, endpoint: &str) -> Result<AuthGrant, AuthRejection> {
        manager.authenticate(&AuthRequest::new(
            name,
            TOKEN,
            AuthMethod::Steam,
            &format!("hw-{}", name),
            endpoint,
        ))
    }

    fn admin(manager: &AuthManager, name: &str, level: PermissionLevel) -> u32 {
        let grant = auth_with(manager, name, "10.0.0.1").unwrap();
        manager.assign_level(grant.player_id, level).unwrap();
        grant.player_id
    }

    #[test]
    fn test_successful_authentication() {
        let (manager, clock, recorder) = setup();
        let grant = auth_with(&manager, "Nova", "1.2.3.4").unwrap();

        assert_eq!(grant.player_id, 1);
        assert_eq!(grant.permission_level, PermissionLevel::Player);
        assert!(grant.session_token.len() >= 32);
        assert_eq!(grant.expires_at, clock.now_millis() + 3_600_000);
        assert!(grant.permissions.contains(&permissions::PLAY.to_string()));
        assert!(!grant.permissions.contains(&permissions::KICK_PLAYER.to_string()));

        let online = manager.online_players();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].name, "Nova");
        assert_eq!(recorder.topics(), vec![topics::PLAYER_AUTHENTICATED]);

        // Same name keeps its id across sessions.
        manager.logout(grant.player_id).unwrap();
        assert_eq!(auth_with(&manager, "Nova", "1.2.3.4").unwrap().player_id, 1);
        assert_eq!(auth_with(&manager, "Jackie", "1.2.3.5").unwrap().player_id, 2);
    }

    #[test]
    fn test_pipeline_rejections() {
        let (manager, _clock, _) = setup();

        manager.set_maintenance_mode(true);
        let err = auth_with(&manager, "Nova", "1.2.3.4").unwrap_err();
        assert_eq!(err.code, AuthResult::MaintenanceMode);
        manager.set_maintenance_mode(false);

        let err = auth_with(&manager, "bad<name>", "1.2.3.4").unwrap_err();
        assert_eq!(err.code, AuthResult::RequiredDataMissing);

        let err = manager
            .authenticate(&AuthRequest::new("Nova", "short", AuthMethod::Gog, "hw", "1.2.3.4"))
            .unwrap_err();
        assert_eq!(err.code, AuthResult::RequiredDataMissing);
        assert_eq!(CoreError::from(err).kind(), ErrorKind::InvalidArgument);

        for name in ["A", "B", "C"] {
            auth_with(&manager, name, "1.2.3.9").unwrap();
        }
        let err = auth_with(&manager, "D", "1.2.3.9").unwrap_err();
        assert_eq!(err.code, AuthResult::ServerFull);

        // Re-authenticating an online player is not blocked by the cap.
        assert!(auth_with(&manager, "A", "1.2.3.9").is_ok());

        let stats = manager.stats();
        assert_eq!(stats.online_players, 3);
        assert_eq!(stats.failed_logins, 4);
    }

    #[test]
    fn test_failed_attempts_trigger_rate_limit() {
        let (manager, clock, _) = setup();
        manager.set_verifier(Arc::new(RejectAll));

        for _ in 0..5 {
            let err = auth_with(&manager, "Nova", "1.2.3.4").unwrap_err();
            assert_eq!(err.code, AuthResult::InvalidCredentials);
            clock.advance_millis(10_000);
        }
        let err = auth_with(&manager, "Nova", "1.2.3.4").unwrap_err();
        assert_eq!(err.code, AuthResult::TooManyAttempts);

        // Other endpoints are unaffected.
        let err = auth_with(&manager, "Nova", "4.3.2.1").unwrap_err();
        assert_eq!(err.code, AuthResult::InvalidCredentials);

        // Maintenance rejections never count.
        let (manager, _, _) = setup();
        manager.set_maintenance_mode(true);
        for _ in 0..10 {
            auth_with(&manager, "Nova", "1.2.3.4").unwrap_err();
        }
        manager.set_maintenance_mode(false);
        assert!(auth_with(&manager, "Nova", "1.2.3.4").is_ok());
    }

    #[test]
    fn test_session_validation_and_expiry() {
        let (manager, clock, recorder) = setup();
        let grant = auth_with(&manager, "Nova", "1.2.3.4").unwrap();

        assert!(manager.validate_session(grant.player_id, &grant.session_token).is_ok());
        let err = manager.validate_session(grant.player_id, "forged").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        clock.advance_millis(1_000);
        let expires = manager.refresh(grant.player_id).unwrap();
        assert_eq!(expires, clock.now_millis() + 3_600_000);

        clock.set(expires);
        assert!(!manager.check_permission(grant.player_id, permissions::PLAY));
        assert_eq!(manager.sweep_expired_sessions(), vec![grant.player_id]);
        assert!(manager.get_session(grant.player_id).is_none());
        assert_eq!(
            recorder.with_topic(topics::PLAYER_LOGGED_OUT),
            vec![CoreEvent::PlayerLoggedOut {
                player_id: grant.player_id,
                reason: "expired".to_string()
            }]
        );
    }

    #[test]
    fn test_permission_checks() {
        let (manager, _, _) = setup();
        let player = auth_with(&manager, "Nova", "1.2.3.4").unwrap().player_id;
        let mod_id = admin(&manager, "Mod", PermissionLevel::Moderator);

        assert!(manager.check_permission(player, permissions::PLAY));
        assert!(!manager.check_permission(player, permissions::KICK_PLAYER));
        assert!(manager.check_permission(mod_id, permissions::KICK_PLAYER));
        assert!(!manager.check_permission(player, "unregistered"));

        manager
            .register_permission("photo_mode", "Use photo mode", PermissionLevel::Player, false)
            .unwrap();
        assert!(manager.check_permission(player, "photo_mode"));

        assert!(manager.has_admin_permission(mod_id, player, AdminAction::Kick));
        assert!(!manager.has_admin_permission(mod_id, player, AdminAction::Ban));
        assert!(!manager.has_admin_permission(player, mod_id, AdminAction::Kick));
    }

    #[test]
    fn test_promote_and_demote_rules() {
        let (manager, _, recorder) = setup();
        let player = auth_with(&manager, "Nova", "1.2.3.4").unwrap().player_id;
        let admin_id = admin(&manager, "Admin", PermissionLevel::Admin);
        let root = admin(&manager, "Root", PermissionLevel::SuperAdmin);

        manager
            .promote(admin_id, player, PermissionLevel::Moderator)
            .unwrap();
        assert!(manager.check_permission(player, permissions::KICK_PLAYER));

        // An Admin cannot hand out their own level or touch peers.
        let err = manager
            .promote(admin_id, player, PermissionLevel::Admin)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(
            manager.get_session(player).unwrap().permission_level,
            PermissionLevel::Moderator
        );
        assert!(manager.demote(player, admin_id, PermissionLevel::Guest).is_err());

        // SuperAdmin bypasses the comparison.
        manager.demote(root, admin_id, PermissionLevel::Player).unwrap();
        assert!(!manager.check_permission(admin_id, permissions::BAN_PLAYER));

        assert_eq!(
            manager.promote(root, player, PermissionLevel::Player).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(!recorder.with_topic(topics::PERMISSION_CHANGED).is_empty());
    }

    #[test]
    fn test_grant_and_revoke() {
        let (manager, _, _) = setup();
        let player = auth_with(&manager, "Nova", "1.2.3.4").unwrap().player_id;
        let admin_id = admin(&manager, "Admin", PermissionLevel::Admin);

        manager
            .grant_permission(admin_id, player, permissions::MUTE_PLAYER)
            .unwrap();
        assert!(manager.check_permission(player, permissions::MUTE_PLAYER));
        manager
            .revoke_permission(admin_id, player, permissions::MUTE_PLAYER)
            .unwrap();
        assert!(!manager.check_permission(player, permissions::MUTE_PLAYER));

        let err = manager.grant_permission(admin_id, player, "fly").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = manager
            .grant_permission(player, admin_id, permissions::PLAY)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_ban_then_unban_restores_access() {
        let (manager, _, recorder) = setup();
        let player = auth_with(&manager, "Nova", "1.2.3.4").unwrap().player_id;
        let admin_id = admin(&manager, "Admin", PermissionLevel::Admin);

        let ban_id = manager
            .ban(admin_id, player, "griefing", BanType::Permanent, None)
            .unwrap();
        assert!(manager.get_session(player).is_none());
        assert!(manager.is_banned("1.2.3.4", "", ""));
        assert_eq!(manager.active_bans().len(), 1);

        let err = auth_with(&manager, "Nova", "1.2.3.4").unwrap_err();
        assert_eq!(err.code, AuthResult::AccountBanned);
        // The player id dimension follows the name to a new endpoint.
        let err = auth_with(&manager, "Nova", "8.8.8.8").unwrap_err();
        assert_eq!(err.code, AuthResult::AccountBanned);

        manager.unban(admin_id, &ban_id, "appeal").unwrap();
        assert!(auth_with(&manager, "Nova", "1.2.3.4").is_ok());
        assert_eq!(
            manager.unban(admin_id, &ban_id, "again").unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            recorder.topics().iter().filter(|t| **t == topics::PLAYER_BANNED).count(),
            1
        );
    }

    #[test]
    fn test_endpoint_ban_and_temporary_expiry() {
        let (manager, clock, _) = setup();
        let admin_id = admin(&manager, "Admin", PermissionLevel::Admin);
        let bystander = auth_with(&manager, "Nova", "6.6.6.6").unwrap().player_id;

        manager
            .ban_target(
                admin_id,
                BanTarget {
                    endpoint: Some("6.6.6.6".to_string()),
                    ..BanTarget::default()
                },
                "abuse",
                BanType::Temporary,
                Some(Duration::from_secs(60)),
            )
            .unwrap();
        assert!(!manager.is_online(bystander));
        assert_eq!(
            auth_with(&manager, "Other", "6.6.6.6").unwrap_err().code,
            AuthResult::AccountBanned
        );

        clock.advance(Duration::from_secs(60));
        assert!(auth_with(&manager, "Other", "6.6.6.6").is_ok());
        assert_eq!(manager.cleanup().0, 1);

        let err = manager
            .ban_target(admin_id, BanTarget::default(), "nothing", BanType::Ip, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_kick_requires_rank() {
        let (manager, _, recorder) = setup();
        let player = auth_with(&manager, "Nova", "1.2.3.4").unwrap().player_id;
        let other = auth_with(&manager, "Jackie", "1.2.3.5").unwrap().player_id;

        assert_eq!(
            manager.kick(other, player, "no").unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        manager.assign_level(other, PermissionLevel::Moderator).unwrap();
        manager.kick(other, player, "afk").unwrap();
        assert!(!manager.is_online(player));
        assert_eq!(recorder.with_topic(topics::PLAYER_KICKED).len(), 1);
    }

    #[test]
    fn test_suspended_level_blocks_login() {
        let (manager, _, _) = setup();
        let player = auth_with(&manager, "Nova", "1.2.3.4").unwrap().player_id;
        manager.assign_level(player, PermissionLevel::Banned).unwrap();
        manager.logout(player).unwrap();

        let err = auth_with(&manager, "Nova", "1.2.3.4").unwrap_err();
        assert_eq!(err.code, AuthResult::AccountSuspended);
    }

    #[test]
    fn test_snapshot_roundtrip_through_store() {
        let (manager, _, _) = setup();
        let player = auth_with(&manager, "Nova", "1.2.3.4").unwrap().player_id;
        let admin_id = admin(&manager, "Admin", PermissionLevel::Admin);
        manager
            .ban(admin_id, player, "cheating", BanType::Hardware, None)
            .unwrap();

        let store = MemoryStore::new();
        manager.save_to(&store).unwrap();

        let (restored, _, _) = setup();
        assert!(restored.load_from(&store).unwrap());
        assert!(restored.is_banned("", "hw-Nova", ""));
        assert_eq!(auth_with(&restored, "Admin", "10.0.0.1").unwrap().player_id, admin_id);
        assert_eq!(auth_with(&restored, "Fresh", "10.0.0.2").unwrap().player_id, 3);
    }
}
