//! # Coordination core
//!
//! [`CoopCore`] owns one instance of every component and is the only value a
//! host-bridge adapter needs. Tests build as many independent cores as they
//! like; nothing here is process-global.
//!
//! Components never call each other while holding their own locks. The few
//! cross-component reactions (a departed player leaving dialogs and quests, a
//! branch choice picked in a quest dialog) are bus subscriptions installed
//! by [`CoopCore::new`].

use crate::auth::{AuthGrant, AuthManager, AuthRequest, IdentityStore};
use crate::bridge::{drain_into, DecisionReceiver, HostBridge, Outbox};
use crate::clock::{system_clock, SharedClock};
use crate::config::CoreConfig;
use crate::dialog::{DialogCoordinator, DialogSyncMode};
use crate::error::{AuthRejection, CoreError, CoreResult};
use crate::event_bus::{topics, CoreEvent, EventBus, HandlerResult, SubscriptionId};
use crate::lifecycle::{LifecycleOrchestrator, StateCell, Subsystem, SystemInfo, SystemPriority, SystemState, SystemType};
use crate::quest::{QuestEngine, QuestState, QuestSyncMode};
use crate::utils::lock;
use log::{debug, error, info, warn};
use shared::{AuthResult, AuthoritativeDecision, HostEvent, WirePacket, DEFAULT_DIALOG_SYNC_MODE};
use std::sync::{Arc, Mutex, Weak};

/// Capability every gameplay event requires.
pub const PLAY_CAPABILITY: &str = "play";

pub struct CoopCore {
    config: CoreConfig,
    clock: SharedClock,
    bus: Arc<EventBus>,
    outbox: Outbox,
    decisions: Mutex<DecisionReceiver>,
    auth: Arc<AuthManager>,
    dialogs: Arc<DialogCoordinator>,
    quests: Arc<QuestEngine>,
    lifecycle: LifecycleOrchestrator,
    subscriptions: Vec<SubscriptionId>,
}

impl CoopCore {
    /// Builds a core on the wall clock without identity persistence.
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        Self::with_clock(config, system_clock(), None)
    }

    pub fn with_clock(
        config: CoreConfig,
        clock: SharedClock,
        store: Option<Arc<dyn IdentityStore>>,
    ) -> CoreResult<Self> {
        config
            .validate()
            .map_err(|e| CoreError::InvalidArgument(e.to_string()))?;

        let bus = Arc::new(EventBus::new());
        let (outbox, decisions) = Outbox::channel();

        let auth = Arc::new(AuthManager::new(config.identity.clone(), clock.clone(), bus.clone()));
        let quests = Arc::new(QuestEngine::new(
            config.quest.clone(),
            clock.clone(),
            bus.clone(),
            outbox.clone(),
        ));
        let dialogs = Arc::new(DialogCoordinator::new(
            config.dialog.clone(),
            clock.clone(),
            bus.clone(),
            outbox.clone(),
        ));
        dialogs.set_quest_gate(quests.clone());

        let lifecycle = LifecycleOrchestrator::new(config.lifecycle.clone(), clock.clone(), bus.clone());
        register_subsystems(&lifecycle, &bus, &auth, &dialogs, &quests, store)?;

        let subscriptions = wire_reactions(&bus, &dialogs, &quests, &outbox);

        Ok(Self {
            config,
            clock,
            bus,
            outbox,
            decisions: Mutex::new(decisions),
            auth,
            dialogs,
            quests,
            lifecycle,
            subscriptions,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn dialogs(&self) -> &DialogCoordinator {
        &self.dialogs
    }

    pub fn quests(&self) -> &QuestEngine {
        &self.quests
    }

    pub fn lifecycle(&self) -> &LifecycleOrchestrator {
        &self.lifecycle
    }

    /// Starts every subsystem in dependency order.
    pub fn initialize(&self) -> CoreResult<()> {
        self.lifecycle.initialize()
    }

    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    /// One scheduler pass over every running subsystem.
    pub fn tick(&self) {
        self.lifecycle.update();
    }

    pub fn authenticate(&self, request: &AuthRequest) -> Result<AuthGrant, AuthRejection> {
        self.require_identity()
            .map_err(|e| AuthRejection::new(AuthResult::NetworkError, e.to_string()))?;
        self.auth.authenticate(request)
    }

    pub fn logout(&self, player_id: u32, session_token: &str) -> CoreResult<()> {
        self.auth.validate_session(player_id, session_token)?;
        self.auth.logout(player_id)
    }

    /// Validates the caller's session and routes one host event.
    ///
    /// The session must be live with a matching token, the player needs the
    /// `play` capability, and the event may only act on behalf of the
    /// authenticated player.
    pub fn ingest(&self, player_id: u32, session_token: &str, event: HostEvent) -> CoreResult<()> {
        self.require_identity()?;
        self.auth.validate_session(player_id, session_token)?;
        self.auth.require_permission(player_id, PLAY_CAPABILITY)?;
        let acting = event.acting_player();
        if acting != player_id {
            return Err(CoreError::PermissionDenied(format!(
                "player {} may not send {} on behalf of player {}",
                player_id,
                event.kind(),
                acting
            )));
        }
        debug!("Ingesting {} from player #{}", event.kind(), player_id);

        match event {
            HostEvent::PlayerJoin {
                player_id,
                display_name,
            } => {
                let joined = self.join_shared_quests(player_id);
                info!(
                    "{} (#{}) joined the world, synced into {} quests",
                    display_name, player_id, joined
                );
                Ok(())
            }
            HostEvent::PlayerLeave { player_id } => {
                let dialogs = self.dialogs.remove_player(player_id);
                let quests = self.quests.remove_player(player_id);
                info!(
                    "Player #{} left: dropped from {} dialogs and {} quests",
                    player_id, dialogs, quests
                );
                Ok(())
            }
            HostEvent::PositionUpdate { player_id, x, y, z } => {
                self.dialogs.update_player_position(player_id, x, y, z)
            }
            HostEvent::NpcDialogStart {
                npc_id,
                speaker_id,
                quest_hash,
                sync_mode,
            } => {
                let mode = dialog_mode(sync_mode)?;
                self.dialogs
                    .start_dialog(npc_id, speaker_id, quest_hash, mode)
                    .map(|_| ())
            }
            HostEvent::DialogChoice {
                session_id,
                player_id,
                choice_id,
            } => self
                .dialogs
                .select_dialog_choice(session_id, player_id, choice_id)
                .map(|_| ()),
            HostEvent::DialogVote {
                session_id,
                player_id,
                approve,
            } => self.dialogs.cast_vote(session_id, player_id, approve),
            HostEvent::QuestStage {
                player_id,
                quest_hash,
                new_stage,
            } => self.quests.update_quest_stage(player_id, quest_hash, new_stage),
            HostEvent::QuestState {
                player_id,
                quest_hash,
                new_state,
            } => {
                let state = QuestState::from_u8(new_state).ok_or_else(|| {
                    CoreError::InvalidArgument(format!("unknown quest state code {}", new_state))
                })?;
                self.quests.update_quest_state(player_id, quest_hash, state)
            }
            HostEvent::ObjectiveComplete {
                player_id,
                quest_hash,
                objective_id,
            } => self.quests.complete_objective(player_id, quest_hash, objective_id),
            HostEvent::BranchChoice {
                player_id,
                quest_hash,
                stage,
                choice,
            } => self.quests.add_branch_choice(quest_hash, stage, player_id, choice),
            HostEvent::QuestVote {
                player_id,
                quest_hash,
                approve,
            } => self.quests.cast_conflict_vote(quest_hash, player_id, approve),
        }
    }

    /// Hands every queued decision to `bridge`; returns how many went out.
    pub fn pump(&self, bridge: &dyn HostBridge) -> usize {
        drain_into(&mut lock(&self.decisions), bridge)
    }

    /// Removes and returns every queued decision.
    pub fn take_decisions(&self) -> Vec<AuthoritativeDecision> {
        let mut rx = lock(&self.decisions);
        let mut decisions = Vec::new();
        while let Ok(decision) = rx.try_recv() {
            decisions.push(decision);
        }
        decisions
    }

    /// Expired sessions plus dead bans and aged login attempts.
    pub fn sweep_identity(&self) -> usize {
        let expired = self.auth.sweep_expired_sessions().len();
        let (bans, attempts) = self.auth.cleanup();
        expired + bans + attempts
    }

    fn require_identity(&self) -> CoreResult<()> {
        match self.lifecycle.get_system_state(&SystemType::IdentitySession) {
            Some(SystemState::Running) | Some(SystemState::Uninitialized) => Ok(()),
            Some(state) => Err(CoreError::PreconditionFailed(format!(
                "identity service is {:?}",
                state
            ))),
            None => Err(CoreError::Internal("identity service is not registered".to_string())),
        }
    }

    fn join_shared_quests(&self, player_id: u32) -> usize {
        let mut joined = 0;
        for quest in self.quests.get_active_quests() {
            if quest.sync_mode == QuestSyncMode::Individual || quest.players.contains_key(&player_id) {
                continue;
            }
            match self.quests.register_player(quest.quest_hash, player_id) {
                Ok(()) => joined += 1,
                Err(e) => warn!("Could not add player #{} to quest {:#x}: {}", player_id, quest.quest_hash, e),
            }
        }
        self.quests.force_resync_player(player_id);
        joined
    }
}

impl Drop for CoopCore {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
    }
}

fn dialog_mode(code: u8) -> CoreResult<Option<DialogSyncMode>> {
    if code == DEFAULT_DIALOG_SYNC_MODE {
        return Ok(None);
    }
    DialogSyncMode::from_u8(code)
        .map(Some)
        .ok_or_else(|| CoreError::InvalidArgument(format!("unknown dialog sync mode {}", code)))
}

// ---- subsystem adapters ---------------------------------------------------

struct BusSystem {
    bus: Arc<EventBus>,
    cell: StateCell,
}

impl Subsystem for BusSystem {
    fn initialize(&self) -> CoreResult<()> {
        self.cell.run_initialize(|| Ok(()))
    }

    fn shutdown(&self) {
        self.cell.run_shutdown(|| {
            debug!("Event bus delivered {} events", self.bus.published_count());
        });
    }

    fn state(&self) -> SystemState {
        self.cell.get()
    }

    fn last_error(&self) -> Option<String> {
        self.cell.last_error()
    }

    fn reset(&self) {
        self.cell.reset();
    }
}

/// Loads bans and known players on start and saves them on stop.
struct IdentitySystem {
    auth: Arc<AuthManager>,
    store: Option<Arc<dyn IdentityStore>>,
    cell: StateCell,
}

impl Subsystem for IdentitySystem {
    fn initialize(&self) -> CoreResult<()> {
        self.cell.run_initialize(|| {
            if let Some(store) = &self.store {
                self.auth
                    .load_from(store.as_ref())
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
            }
            Ok(())
        })
    }

    fn shutdown(&self) {
        self.cell.run_shutdown(|| {
            if let Some(store) = &self.store {
                if let Err(e) = self.auth.save_to(store.as_ref()) {
                    error!("Failed to save identity state: {}", e);
                }
            }
        });
    }

    fn state(&self) -> SystemState {
        self.cell.get()
    }

    fn last_error(&self) -> Option<String> {
        self.cell.last_error()
    }

    fn reset(&self) {
        self.cell.reset();
    }
}

struct DialogSystem {
    dialogs: Arc<DialogCoordinator>,
    cell: StateCell,
}

impl Subsystem for DialogSystem {
    fn initialize(&self) -> CoreResult<()> {
        self.cell.run_initialize(|| Ok(()))
    }

    fn shutdown(&self) {
        self.cell.run_shutdown(|| {
            for session_id in self.dialogs.get_active_dialog_sessions() {
                if let Err(e) = self.dialogs.end_dialog(session_id, true) {
                    warn!("Could not end dialog {} on shutdown: {}", session_id, e);
                }
            }
        });
    }

    fn update(&self) {
        self.dialogs.tick();
    }

    fn state(&self) -> SystemState {
        self.cell.get()
    }

    fn last_error(&self) -> Option<String> {
        self.cell.last_error()
    }

    fn reset(&self) {
        self.cell.reset();
    }
}

struct QuestSystem {
    quests: Arc<QuestEngine>,
    cell: StateCell,
}

impl Subsystem for QuestSystem {
    fn initialize(&self) -> CoreResult<()> {
        self.cell.run_initialize(|| Ok(()))
    }

    fn shutdown(&self) {
        self.cell.run_shutdown(|| {
            debug!("Quest engine stopping with {} pending conflicts", self.quests.pending_conflicts().len());
        });
    }

    fn update(&self) {
        self.quests.tick();
    }

    fn state(&self) -> SystemState {
        self.cell.get()
    }

    fn last_error(&self) -> Option<String> {
        self.cell.last_error()
    }

    fn reset(&self) {
        self.cell.reset();
    }
}

fn register_subsystems(
    lifecycle: &LifecycleOrchestrator,
    bus: &Arc<EventBus>,
    auth: &Arc<AuthManager>,
    dialogs: &Arc<DialogCoordinator>,
    quests: &Arc<QuestEngine>,
    store: Option<Arc<dyn IdentityStore>>,
) -> CoreResult<()> {
    lifecycle.register_system(
        SystemType::EventBus,
        Arc::new(BusSystem {
            bus: bus.clone(),
            cell: StateCell::default(),
        }),
        SystemInfo::new("Event Bus")
            .priority(SystemPriority::Critical)
            .essential(),
    )?;
    lifecycle.register_system(
        SystemType::IdentitySession,
        Arc::new(IdentitySystem {
            auth: auth.clone(),
            store,
            cell: StateCell::default(),
        }),
        SystemInfo::new("Identity & Session")
            .priority(SystemPriority::Critical)
            .essential()
            .depends_on(SystemType::EventBus),
    )?;
    lifecycle.register_system(
        SystemType::QuestEngine,
        Arc::new(QuestSystem {
            quests: quests.clone(),
            cell: StateCell::default(),
        }),
        SystemInfo::new("Quest Engine")
            .priority(SystemPriority::High)
            .depends_on(SystemType::EventBus),
    )?;
    lifecycle.register_system(
        SystemType::DialogCoordinator,
        Arc::new(DialogSystem {
            dialogs: dialogs.clone(),
            cell: StateCell::default(),
        }),
        SystemInfo::new("Dialog Coordinator")
            .priority(SystemPriority::High)
            .depends_on(SystemType::EventBus)
            .optionally_depends_on(SystemType::QuestEngine),
    )?;
    Ok(())
}

// ---- cross-component reactions ---------------------------------------------

fn wire_reactions(
    bus: &EventBus,
    dialogs: &Arc<DialogCoordinator>,
    quests: &Arc<QuestEngine>,
    outbox: &Outbox,
) -> Vec<SubscriptionId> {
    let mut ids = Vec::new();
    for topic in [topics::PLAYER_LOGGED_OUT, topics::PLAYER_KICKED, topics::PLAYER_BANNED] {
        let dialogs = Arc::downgrade(dialogs);
        let quests = Arc::downgrade(quests);
        let outbox = outbox.clone();
        ids.push(bus.subscribe(topic, move |event| on_player_removed(&dialogs, &quests, &outbox, event)));
    }

    let engine = Arc::downgrade(quests);
    ids.push(bus.subscribe(topics::CHOICE_SELECTED, move |event| on_choice_selected(&engine, event)));
    ids
}

fn on_player_removed(
    dialogs: &Weak<DialogCoordinator>,
    quests: &Weak<QuestEngine>,
    outbox: &Outbox,
    event: &CoreEvent,
) -> HandlerResult {
    let (player_id, reason) = match event {
        CoreEvent::PlayerLoggedOut { player_id, reason } => (*player_id, reason.clone()),
        CoreEvent::PlayerKicked { player_id, reason, .. } => (*player_id, format!("kicked: {}", reason)),
        CoreEvent::PlayerBanned { player_id, reason, .. } => (*player_id, format!("banned: {}", reason)),
        _ => return Ok(()),
    };
    if let Some(dialogs) = dialogs.upgrade() {
        dialogs.remove_player(player_id);
    }
    if let Some(quests) = quests.upgrade() {
        quests.remove_player(player_id);
    }
    outbox.send(AuthoritativeDecision::to_player(
        player_id,
        WirePacket::SessionRevoked { player_id, reason },
    ));
    Ok(())
}

/// Branch choices picked in a quest dialog are recorded at the picking
/// player's current stage of that quest.
fn on_choice_selected(quests: &Weak<QuestEngine>, event: &CoreEvent) -> HandlerResult {
    let CoreEvent::ChoiceSelected {
        player_id,
        choice_id,
        quest_hash,
        branch: true,
        ..
    } = event
    else {
        return Ok(());
    };
    if *quest_hash == 0 {
        return Ok(());
    }
    let Some(quests) = quests.upgrade() else {
        return Ok(());
    };
    let Some(record) = quests.get_quest(*quest_hash) else {
        return Err(format!("branch choice for unknown quest {:#x}", quest_hash).into());
    };
    let stage = record
        .players
        .get(player_id)
        .map_or(record.authority_stage, |p| p.current_stage);
    quests.add_branch_choice(*quest_hash, stage, *player_id, *choice_id)?;
    Ok(())
}
