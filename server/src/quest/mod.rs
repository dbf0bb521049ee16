//! # Quest Engine
//!
//! Keeps one authoritative record per quest: the authority stage and state,
//! every participating player's progress, objectives, prerequisites and at
//! most one active vote.
//!
//! ## Stage updates
//!
//! A player's reported stage is always recorded first, then reconciled by the
//! quest's [`QuestSyncMode`]:
//!
//! - `Strict` moves the authority stage forward to the highest report and
//!   pulls every laggard up to it. Story-critical quests never advance
//!   silently; a jump ahead of the authority opens a vote instead.
//! - `Majority` / `Consensus` adopt a stage once enough players report it.
//! - `Leader` follows the leader's reports only.
//! - `Individual` never reconciles.
//!
//! ## Conflicts
//!
//! A periodic pass groups players by stage. Divergent quests get a conflict
//! record and a `QuestConflictNotification`, then the quest's
//! [`ConflictPolicy`] settles them (possibly by opening a vote).
//!
//! The quest table, the conflict table and the sync bookkeeping share one
//! mutex. Checkpoints and the work queues have their own. Packets go to the
//! [`Outbox`] and events to the bus only after the table lock is released.

pub mod conflict;
pub mod deps;
pub mod types;
pub mod validation;

pub use conflict::QuestConflict;
pub use types::{
    hash_quest_name, required_votes, ConflictPolicy, PlayerProgress, QuestObjective,
    QuestPriority, QuestRecord, QuestState, QuestSyncMode, QuestType, QuestVoteState,
};
pub use validation::ValidationIssue;

use crate::bridge::Outbox;
use crate::clock::SharedClock;
use crate::config::QuestConfig;
use crate::dialog::QuestGate;
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{CoreEvent, EventBus};
use crate::utils::lock;
use log::{debug, info, warn};
use shared::wire::{QuestConflictNotification, QuestFullSync, QuestObjectiveUpdate, QuestVote, SyncType};
use shared::{Audience, AuthoritativeDecision, WirePacket, SERVER_PLAYER_ID};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// `new_state` of a `QuestObjectiveUpdate`
pub const OBJECTIVE_COMPLETED_BY_PLAYER: u8 = 1;
pub const OBJECTIVE_COMPLETED_BY_GROUP: u8 = 2;

/// Registration parameters; priority and conflict policy default from the type.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestDefinition {
    pub quest_hash: u32,
    pub name: String,
    pub quest_type: QuestType,
    pub priority: QuestPriority,
    pub sync_mode: QuestSyncMode,
    pub conflict_policy: ConflictPolicy,
    pub story_critical: bool,
    pub prerequisites: Vec<u32>,
    pub objectives: Vec<QuestObjective>,
}

impl QuestDefinition {
    pub fn new(quest_hash: u32, name: &str, quest_type: QuestType, sync_mode: QuestSyncMode) -> Self {
        Self {
            quest_hash,
            name: name.to_string(),
            quest_type,
            priority: QuestPriority::for_type(quest_type),
            sync_mode,
            conflict_policy: ConflictPolicy::for_type(quest_type),
            story_critical: false,
            prerequisites: Vec::new(),
            objectives: Vec::new(),
        }
    }

    /// Uses the hash of `name` as the quest key.
    pub fn named(name: &str, quest_type: QuestType, sync_mode: QuestSyncMode) -> Self {
        Self::new(hash_quest_name(name), name, quest_type, sync_mode)
    }

    pub fn priority(mut self, priority: QuestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn story_critical(mut self) -> Self {
        self.story_critical = true;
        self
    }

    pub fn prerequisite(mut self, quest_hash: u32) -> Self {
        self.prerequisites.push(quest_hash);
        self
    }

    pub fn objective(mut self, objective_id: u32, description: &str, optional: bool) -> Self {
        self.objectives.push(QuestObjective {
            objective_id,
            description: description.to_string(),
            optional,
            requires_all_players: false,
            completed_by: BTreeSet::new(),
        });
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuestStats {
    pub total_quests: usize,
    pub active_quests: usize,
    pub completed_quests: usize,
    pub failed_quests: usize,
    pub pending_conflicts: usize,
    pub sync_operations: u64,
    pub validation_errors: u64,
    pub votes_passed: u64,
    pub votes_failed: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SyncMeta {
    last_sync: u64,
    /// Strictly increasing per quest
    timestamp: u64,
}

#[derive(Default)]
struct QuestTable {
    records: HashMap<u32, QuestRecord>,
    sync: HashMap<u32, SyncMeta>,
    conflicts: BTreeMap<u32, QuestConflict>,
    next_conflict_id: u32,
}

#[derive(Default)]
struct WorkQueues {
    sync: BTreeSet<u32>,
    validation: BTreeSet<u32>,
}

/// Outputs collected under the table lock and released after it.
#[derive(Default)]
struct Effects {
    events: Vec<CoreEvent>,
    decisions: Vec<AuthoritativeDecision>,
    syncs: u64,
    votes_passed: u64,
    votes_failed: u64,
}

impl Effects {
    fn broadcast(&mut self, packet: WirePacket) {
        self.decisions.push(AuthoritativeDecision::broadcast(packet));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteOutcome {
    Pending,
    Passed,
    Failed,
}

fn push_sync(
    record: &QuestRecord,
    meta: &mut SyncMeta,
    sync_type: SyncType,
    audience: Audience,
    now: u64,
    fx: &mut Effects,
) {
    meta.timestamp = now.max(meta.timestamp + 1);
    meta.last_sync = now;
    fx.syncs += 1;
    fx.decisions.push(AuthoritativeDecision {
        audience,
        packet: WirePacket::QuestFullSync(QuestFullSync {
            quest_hash: record.quest_hash,
            target_stage: record.authority_stage,
            target_state: record.authority_state.as_u8(),
            player_id: SERVER_PLAYER_ID,
            timestamp: meta.timestamp,
            sync_type: sync_type as u8,
        }),
    });
}

/// Adds `player_id` to the quest if needed. Newcomers start at the authority
/// stage under Strict and at zero otherwise.
fn ensure_player(record: &mut QuestRecord, player_id: u32, now: u64) {
    if record.players.contains_key(&player_id) {
        return;
    }
    let stage = if record.sync_mode == QuestSyncMode::Strict {
        record.authority_stage
    } else {
        0
    };
    let state = record.authority_state;
    record.players.insert(
        player_id,
        PlayerProgress {
            current_stage: stage,
            state,
            last_update: now,
            is_leader: record.leader == Some(player_id),
            ..Default::default()
        },
    );
}

fn evaluate_vote(
    record: &mut QuestRecord,
    meta: &mut SyncMeta,
    conflicts: &mut BTreeMap<u32, QuestConflict>,
    now: u64,
    fx: &mut Effects,
) -> VoteOutcome {
    let (yes, cast) = match &record.active_vote {
        Some(vote) => (vote.yes_count(), vote.votes.len()),
        None => return VoteOutcome::Pending,
    };
    let participants = record.players.len();
    let required = required_votes(participants);
    let outstanding = participants.saturating_sub(cast);

    if yes >= required {
        let Some(vote) = record.active_vote.take() else {
            return VoteOutcome::Pending;
        };
        record.authority_stage = vote.target_stage;
        record.align_players(now);
        push_sync(record, meta, SyncType::Conflict, Audience::All, now, fx);
        info!(
            "Quest {:#010x} vote passed ({}/{}): stage {}",
            record.quest_hash, yes, participants, vote.target_stage
        );
        fx.votes_passed += 1;
        fx.events.push(CoreEvent::QuestVotePassed {
            quest_hash: record.quest_hash,
            stage: vote.target_stage,
        });
        if let Some(conflict_id) = vote.conflict_id {
            if conflicts.remove(&conflict_id).is_some() {
                fx.events.push(CoreEvent::QuestConflictResolved {
                    quest_hash: record.quest_hash,
                    conflict_id,
                    stage: vote.target_stage,
                    method: ConflictPolicy::Vote.name().to_string(),
                });
            }
        }
        VoteOutcome::Passed
    } else if yes + outstanding < required {
        let Some(vote) = record.active_vote.take() else {
            return VoteOutcome::Pending;
        };
        info!(
            "Quest {:#010x} vote for stage {} failed ({}/{} yes)",
            record.quest_hash, vote.target_stage, yes, required
        );
        fx.votes_failed += 1;
        fx.events.push(CoreEvent::QuestVoteFailed {
            quest_hash: record.quest_hash,
            target_stage: vote.target_stage,
        });
        if let Some(conflict_id) = vote.conflict_id {
            conflicts.remove(&conflict_id);
        }
        VoteOutcome::Failed
    } else {
        VoteOutcome::Pending
    }
}

#[allow(clippy::too_many_arguments)]
fn open_vote(
    record: &mut QuestRecord,
    meta: &mut SyncMeta,
    conflicts: &mut BTreeMap<u32, QuestConflict>,
    target_stage: u16,
    initiator: u32,
    conflict_id: Option<u32>,
    now: u64,
    timeout_ms: u64,
    fx: &mut Effects,
) -> VoteOutcome {
    let mut votes = BTreeMap::new();
    votes.insert(initiator, true);
    record.active_vote = Some(QuestVoteState {
        target_stage,
        initiator,
        deadline: now.saturating_add(timeout_ms),
        votes,
        conflict_id,
    });
    info!(
        "Quest {:#010x} vote opened by player {} for stage {}",
        record.quest_hash, initiator, target_stage
    );
    fx.broadcast(WirePacket::QuestVote(QuestVote {
        quest_hash: record.quest_hash,
        player_id: initiator,
        target_stage,
        approve: true,
        timestamp: now,
    }));
    fx.events.push(CoreEvent::QuestVoteStarted {
        quest_hash: record.quest_hash,
        target_stage,
        initiator,
    });
    evaluate_vote(record, meta, conflicts, now, fx)
}

/// Settles a conflict on `stage` for every player.
#[allow(clippy::too_many_arguments)]
fn settle(
    record: &mut QuestRecord,
    meta: &mut SyncMeta,
    conflicts: &mut BTreeMap<u32, QuestConflict>,
    conflict_id: u32,
    stage: u16,
    policy: ConflictPolicy,
    now: u64,
    fx: &mut Effects,
) {
    record.authority_stage = stage;
    record.align_players(now);
    push_sync(record, meta, SyncType::Conflict, Audience::All, now, fx);
    conflicts.remove(&conflict_id);
    info!(
        "Quest {:#010x} conflict {} resolved by {} at stage {}",
        record.quest_hash,
        conflict_id,
        policy.name(),
        stage
    );
    fx.events.push(CoreEvent::QuestConflictResolved {
        quest_hash: record.quest_hash,
        conflict_id,
        stage,
        method: policy.name().to_string(),
    });
}

#[allow(clippy::too_many_arguments)]
fn apply_policy(
    record: &mut QuestRecord,
    meta: &mut SyncMeta,
    conflicts: &mut BTreeMap<u32, QuestConflict>,
    conflict: &QuestConflict,
    policy: ConflictPolicy,
    now: u64,
    timeout_ms: u64,
    fx: &mut Effects,
) {
    let id = conflict.conflict_id;
    match policy {
        ConflictPolicy::RollbackAll => {
            settle(record, meta, conflicts, id, conflict.min_stage(), policy, now, fx)
        }
        ConflictPolicy::AdvanceAll => {
            settle(record, meta, conflicts, id, conflict.max_stage(), policy, now, fx)
        }
        ConflictPolicy::AutoResolve => {
            let stage = conflict::auto_resolve_stage(record.quest_type, conflict);
            settle(record, meta, conflicts, id, stage, policy, now, fx)
        }
        ConflictPolicy::LeaderDecides => {
            let current = record.leader.filter(|l| record.players.contains_key(l));
            let leader = match current.or_else(|| conflict.first_affected()) {
                Some(leader) => leader,
                None => return,
            };
            if current.is_none() {
                let old = record.leader.unwrap_or(SERVER_PLAYER_ID);
                record.set_leader(Some(leader));
                fx.events.push(CoreEvent::QuestLeaderChanged {
                    quest_hash: record.quest_hash,
                    old_leader: old,
                    new_leader: leader,
                });
            }
            let stage = record
                .players
                .get(&leader)
                .map_or(record.authority_stage, |p| p.current_stage);
            settle(record, meta, conflicts, id, stage, policy, now, fx)
        }
        ConflictPolicy::Vote => {
            if record.active_vote.is_some() {
                return;
            }
            if let Some(initiator) = conflict.first_affected() {
                open_vote(
                    record,
                    meta,
                    conflicts,
                    conflict.max_stage(),
                    initiator,
                    Some(id),
                    now,
                    timeout_ms,
                    fx,
                );
            }
        }
    }
}

pub struct QuestEngine {
    config: QuestConfig,
    clock: SharedClock,
    bus: Arc<EventBus>,
    outbox: Outbox,
    table: Mutex<QuestTable>,
    queues: Mutex<WorkQueues>,
    checkpoints: Mutex<HashMap<u32, VecDeque<QuestRecord>>>,
    sync_operations: AtomicU64,
    validation_errors: AtomicU64,
    votes_passed: AtomicU64,
    votes_failed: AtomicU64,
    last_conflict_check: AtomicU64,
    last_validation: AtomicU64,
}

impl QuestEngine {
    pub fn new(config: QuestConfig, clock: SharedClock, bus: Arc<EventBus>, outbox: Outbox) -> Self {
        Self {
            config,
            clock,
            bus,
            outbox,
            table: Mutex::new(QuestTable {
                next_conflict_id: 1,
                ..QuestTable::default()
            }),
            queues: Mutex::new(WorkQueues::default()),
            checkpoints: Mutex::new(HashMap::new()),
            sync_operations: AtomicU64::new(0),
            validation_errors: AtomicU64::new(0),
            votes_passed: AtomicU64::new(0),
            votes_failed: AtomicU64::new(0),
            last_conflict_check: AtomicU64::new(0),
            last_validation: AtomicU64::new(0),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn vote_timeout_ms(&self) -> u64 {
        self.config.vote_timeout_secs.saturating_mul(1_000)
    }

    fn flush(&self, fx: Effects) {
        self.sync_operations.fetch_add(fx.syncs, Ordering::Relaxed);
        self.votes_passed.fetch_add(fx.votes_passed, Ordering::Relaxed);
        self.votes_failed.fetch_add(fx.votes_failed, Ordering::Relaxed);
        self.outbox.send_all(fx.decisions);
        self.bus.publish_all(fx.events);
    }

    fn queue_validation(&self, quest_hash: u32) {
        lock(&self.queues).validation.insert(quest_hash);
    }

    // ---- registration -------------------------------------------------

    pub fn register_quest(
        &self,
        quest_hash: u32,
        name: &str,
        quest_type: QuestType,
        priority: QuestPriority,
        sync_mode: QuestSyncMode,
    ) -> CoreResult<()> {
        self.register(QuestDefinition::new(quest_hash, name, quest_type, sync_mode).priority(priority))
    }

    pub fn register(&self, definition: QuestDefinition) -> CoreResult<()> {
        if definition.quest_hash == 0 {
            return Err(CoreError::InvalidArgument(
                "quest hash 0 is reserved".to_string(),
            ));
        }
        if definition.name.is_empty() {
            return Err(CoreError::InvalidArgument(
                "quest name must not be empty".to_string(),
            ));
        }

        let hash = definition.quest_hash;
        {
            let mut table = lock(&self.table);
            if table.records.contains_key(&hash) {
                return Err(CoreError::PreconditionFailed(format!(
                    "quest {:#010x} is already registered",
                    hash
                )));
            }
            for prerequisite in &definition.prerequisites {
                if deps::would_cycle(hash, *prerequisite, |q| {
                    table.records.get(&q).map(|r| &r.prerequisites)
                }) {
                    return Err(CoreError::DependencyCycle(format!(
                        "quest {:#010x} cannot require {:#010x}",
                        hash, prerequisite
                    )));
                }
            }

            let mut record = QuestRecord::new(
                hash,
                &definition.name,
                definition.quest_type,
                definition.priority,
                definition.sync_mode,
            );
            record.conflict_policy = definition.conflict_policy;
            record.story_critical = definition.story_critical;
            record.prerequisites = definition.prerequisites.iter().copied().collect();
            record.objectives = definition.objectives;
            table.records.insert(hash, record);
            table.sync.insert(hash, SyncMeta::default());
        }

        info!(
            "Registered quest {} ({:#010x}, {:?}, {:?})",
            definition.name, hash, definition.quest_type, definition.sync_mode
        );
        self.bus.publish(CoreEvent::QuestRegistered {
            quest_hash: hash,
            name: definition.name,
        });
        Ok(())
    }

    pub fn unregister_quest(&self, quest_hash: u32) -> CoreResult<()> {
        {
            let mut table = lock(&self.table);
            table
                .records
                .remove(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            table.sync.remove(&quest_hash);
            table.conflicts.retain(|_, c| c.quest_hash != quest_hash);
        }
        lock(&self.checkpoints).remove(&quest_hash);
        info!("Unregistered quest {:#010x}", quest_hash);
        Ok(())
    }

    fn with_record<T, F>(&self, quest_hash: u32, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut QuestRecord) -> CoreResult<T>,
    {
        let mut table = lock(&self.table);
        let record = table
            .records
            .get_mut(&quest_hash)
            .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
        f(record)
    }

    pub fn set_conflict_policy(&self, quest_hash: u32, policy: ConflictPolicy) -> CoreResult<()> {
        self.with_record(quest_hash, |record| {
            record.conflict_policy = policy;
            Ok(())
        })
    }

    /// Adds the quest to the story-critical set.
    pub fn mark_story_critical(&self, quest_hash: u32, critical: bool) -> CoreResult<()> {
        self.with_record(quest_hash, |record| {
            record.story_critical = critical;
            Ok(())
        })
    }

    pub fn add_objective(
        &self,
        quest_hash: u32,
        objective_id: u32,
        description: &str,
        optional: bool,
        requires_all_players: bool,
    ) -> CoreResult<()> {
        self.with_record(quest_hash, |record| {
            if record.has_objective(objective_id) {
                return Err(CoreError::PreconditionFailed(format!(
                    "objective {} already exists",
                    objective_id
                )));
            }
            record.objectives.push(QuestObjective {
                objective_id,
                description: description.to_string(),
                optional,
                requires_all_players,
                completed_by: BTreeSet::new(),
            });
            Ok(())
        })
    }

    // ---- dependencies ---------------------------------------------------

    pub fn add_quest_dependency(&self, quest_hash: u32, prerequisite: u32) -> CoreResult<()> {
        let mut table = lock(&self.table);
        if !table.records.contains_key(&quest_hash) {
            return Err(CoreError::not_found("quest", quest_hash));
        }
        if deps::would_cycle(quest_hash, prerequisite, |q| {
            table.records.get(&q).map(|r| &r.prerequisites)
        }) {
            return Err(CoreError::DependencyCycle(format!(
                "quest {:#010x} cannot require {:#010x}",
                quest_hash, prerequisite
            )));
        }
        if let Some(record) = table.records.get_mut(&quest_hash) {
            record.prerequisites.insert(prerequisite);
        }
        Ok(())
    }

    pub fn remove_quest_dependency(&self, quest_hash: u32, prerequisite: u32) -> CoreResult<bool> {
        self.with_record(quest_hash, |record| Ok(record.prerequisites.remove(&prerequisite)))
    }

    pub fn get_quest_dependencies(&self, quest_hash: u32) -> CoreResult<Vec<u32>> {
        self.with_record(quest_hash, |record| Ok(record.prerequisites.iter().copied().collect()))
    }

    /// True iff the quest exists and every registered prerequisite is
    /// Completed for the player. Unregistered prerequisites are ignored.
    pub fn can_start_quest(&self, quest_hash: u32, player_id: u32) -> bool {
        let table = lock(&self.table);
        let Some(record) = table.records.get(&quest_hash) else {
            return false;
        };
        record.prerequisites.iter().all(|prerequisite| {
            match table.records.get(prerequisite) {
                Some(required) => required
                    .players
                    .get(&player_id)
                    .map_or(false, |p| p.state == QuestState::Completed),
                None => true,
            }
        })
    }

    // ---- players ------------------------------------------------------

    pub fn register_player(&self, quest_hash: u32, player_id: u32) -> CoreResult<()> {
        let now = self.now();
        self.with_record(quest_hash, |record| {
            ensure_player(record, player_id, now);
            Ok(())
        })
    }

    pub fn unregister_player(&self, quest_hash: u32, player_id: u32) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records,
                sync,
                conflicts,
                ..
            } = &mut *table;
            let record = records
                .get_mut(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            if !record.players.contains_key(&player_id) {
                return Err(CoreError::not_found("quest player", player_id));
            }
            let meta = sync.entry(quest_hash).or_default();
            Self::drop_player(record, meta, conflicts, player_id, now, &mut fx);
        }
        self.flush(fx);
        Ok(())
    }

    /// Removes a departed player from every quest.
    pub fn remove_player(&self, player_id: u32) -> usize {
        let now = self.now();
        let mut fx = Effects::default();
        let mut removed = 0;
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records,
                sync,
                conflicts,
                ..
            } = &mut *table;
            for record in records.values_mut() {
                if record.players.contains_key(&player_id) {
                    let meta = sync.entry(record.quest_hash).or_default();
                    Self::drop_player(record, meta, conflicts, player_id, now, &mut fx);
                    removed += 1;
                }
            }
        }
        self.flush(fx);
        removed
    }

    fn drop_player(
        record: &mut QuestRecord,
        meta: &mut SyncMeta,
        conflicts: &mut BTreeMap<u32, QuestConflict>,
        player_id: u32,
        now: u64,
        fx: &mut Effects,
    ) {
        record.players.remove(&player_id);
        if record.leader == Some(player_id) {
            let next = record.players.keys().next().copied();
            record.set_leader(next);
            fx.events.push(CoreEvent::QuestLeaderChanged {
                quest_hash: record.quest_hash,
                old_leader: player_id,
                new_leader: next.unwrap_or(SERVER_PLAYER_ID),
            });
        }
        if let Some(vote) = record.active_vote.as_mut() {
            vote.votes.remove(&player_id);
            if record.players.is_empty() {
                record.active_vote = None;
            } else {
                evaluate_vote(record, meta, conflicts, now, fx);
            }
        }
        debug!("Player {} left quest {:#010x}", player_id, record.quest_hash);
    }

    pub fn set_quest_leader(&self, quest_hash: u32, player_id: u32) -> CoreResult<()> {
        let old = self.with_record(quest_hash, |record| {
            if !record.players.contains_key(&player_id) {
                return Err(CoreError::PreconditionFailed(format!(
                    "player {} is not on quest {:#010x}",
                    player_id, quest_hash
                )));
            }
            let old = record.leader;
            record.set_leader(Some(player_id));
            Ok(old)
        })?;
        info!("Quest {:#010x} leader is now player {}", quest_hash, player_id);
        self.bus.publish(CoreEvent::QuestLeaderChanged {
            quest_hash,
            old_leader: old.unwrap_or(SERVER_PLAYER_ID),
            new_leader: player_id,
        });
        Ok(())
    }

    pub fn transfer_quest_leadership(&self, quest_hash: u32, from: u32, to: u32) -> CoreResult<()> {
        let leader = self.with_record(quest_hash, |record| Ok(record.leader))?;
        if leader != Some(from) {
            return Err(CoreError::PermissionDenied(format!(
                "player {} does not lead quest {:#010x}",
                from, quest_hash
            )));
        }
        self.set_quest_leader(quest_hash, to)
    }

    // ---- progress -----------------------------------------------------

    pub fn update_quest_stage(&self, player_id: u32, quest_hash: u32, new_stage: u16) -> CoreResult<()> {
        let now = self.now();
        let timeout_ms = self.vote_timeout_ms();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records,
                sync,
                conflicts,
                ..
            } = &mut *table;
            let record = records
                .get_mut(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            let meta = sync.entry(quest_hash).or_default();

            ensure_player(record, player_id, now);
            if let Some(progress) = record.players.get_mut(&player_id) {
                progress.current_stage = new_stage;
                progress.last_update = now;
                if progress.state == QuestState::Inactive {
                    progress.state = QuestState::Active;
                }
            }
            if record.authority_state == QuestState::Inactive {
                record.authority_state = QuestState::Active;
            }
            fx.events.push(CoreEvent::QuestStageChanged {
                quest_hash,
                player_id,
                stage: new_stage,
            });

            match record.sync_mode {
                QuestSyncMode::Strict if record.story_critical => {
                    if record.active_vote.is_some() {
                        debug!(
                            "Quest {:#010x} vote in progress; recorded stage {} for player {}",
                            quest_hash, new_stage, player_id
                        );
                    } else if new_stage > record.authority_stage {
                        open_vote(
                            record, meta, conflicts, new_stage, player_id, None, now, timeout_ms,
                            &mut fx,
                        );
                    } else if new_stage < record.authority_stage {
                        record.align_players(now);
                        push_sync(
                            record,
                            meta,
                            SyncType::Forced,
                            Audience::Player(player_id),
                            now,
                            &mut fx,
                        );
                    }
                }
                QuestSyncMode::Strict => {
                    let before = record.authority_stage;
                    record.authority_stage = before.max(new_stage);
                    let moved = record.align_players(now);
                    if record.authority_stage != before || moved > 0 {
                        push_sync(record, meta, SyncType::Forced, Audience::All, now, &mut fx);
                    }
                }
                QuestSyncMode::Majority | QuestSyncMode::Consensus => {
                    let participants = record.players.len();
                    let required = if record.sync_mode == QuestSyncMode::Consensus {
                        participants
                    } else {
                        required_votes(participants)
                    };
                    let mut tally: BTreeMap<u16, usize> = BTreeMap::new();
                    for progress in record.players.values() {
                        *tally.entry(progress.current_stage).or_default() += 1;
                    }
                    let agreed = tally
                        .iter()
                        .find(|(_, count)| **count >= required)
                        .map(|(stage, _)| *stage);
                    // Dissenters at an unchanged authority stage are left to
                    // conflict detection.
                    if let Some(stage) = agreed.filter(|s| *s != record.authority_stage) {
                        record.authority_stage = stage;
                        record.align_players(now);
                        push_sync(record, meta, SyncType::Normal, Audience::All, now, &mut fx);
                    }
                }
                QuestSyncMode::Leader => {
                    if record.leader.map_or(true, |leader| leader == player_id) {
                        record.authority_stage = new_stage;
                        push_sync(record, meta, SyncType::Normal, Audience::All, now, &mut fx);
                    } else {
                        debug!(
                            "Quest {:#010x}: stage report from non-leader {} not adopted",
                            quest_hash, player_id
                        );
                    }
                }
                QuestSyncMode::Individual => {}
            }
        }
        self.queue_validation(quest_hash);
        self.flush(fx);
        Ok(())
    }

    pub fn update_quest_state(&self, player_id: u32, quest_hash: u32, new_state: QuestState) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable { records, sync, .. } = &mut *table;
            let record = records
                .get_mut(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            let meta = sync.entry(quest_hash).or_default();

            ensure_player(record, player_id, now);
            if let Some(progress) = record.players.get_mut(&player_id) {
                progress.state = new_state;
                progress.last_update = now;
            }

            let before = record.authority_state;
            match record.sync_mode {
                QuestSyncMode::Strict => {
                    record.authority_state = new_state;
                    if new_state.is_terminal() {
                        for progress in record.players.values_mut() {
                            progress.state = new_state;
                            progress.last_update = now;
                        }
                    }
                }
                QuestSyncMode::Leader if record.leader == Some(player_id) => {
                    record.authority_state = new_state;
                }
                _ => {
                    if record.players.values().all(|p| p.state == new_state) {
                        record.authority_state = new_state;
                    }
                }
            }

            fx.events.push(CoreEvent::QuestStateChanged {
                quest_hash,
                player_id,
                state: new_state.as_u8(),
            });
            if record.authority_state != before {
                info!(
                    "Quest {:#010x} state {:?} -> {:?}",
                    quest_hash, before, record.authority_state
                );
                push_sync(record, meta, SyncType::Normal, Audience::All, now, &mut fx);
            }
        }
        self.queue_validation(quest_hash);
        self.flush(fx);
        Ok(())
    }

    pub fn complete_objective(&self, player_id: u32, quest_hash: u32, objective_id: u32) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let record = table
                .records
                .get_mut(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            if !record.has_objective(objective_id) {
                return Err(CoreError::not_found("objective", objective_id));
            }
            ensure_player(record, player_id, now);

            let newly = record
                .players
                .get_mut(&player_id)
                .map_or(false, |p| p.completed_objectives.insert(objective_id));
            if !newly {
                return Ok(());
            }

            let players: Vec<u32> = record.players.keys().copied().collect();
            let strict = record.sync_mode == QuestSyncMode::Strict;
            let mut group_done = false;
            if let Some(objective) = record
                .objectives
                .iter_mut()
                .find(|o| o.objective_id == objective_id)
            {
                objective.completed_by.insert(player_id);
                group_done = !objective.requires_all_players
                    || players.iter().all(|p| objective.completed_by.contains(p));
            }
            // A shared objective counts for everyone under Strict.
            if strict && group_done {
                for progress in record.players.values_mut() {
                    progress.completed_objectives.insert(objective_id);
                }
            }

            fx.broadcast(WirePacket::QuestObjectiveUpdate(QuestObjectiveUpdate {
                quest_hash,
                objective_id,
                player_id,
                new_state: if group_done {
                    OBJECTIVE_COMPLETED_BY_GROUP
                } else {
                    OBJECTIVE_COMPLETED_BY_PLAYER
                },
                timestamp: now,
            }));
            fx.events.push(CoreEvent::ObjectiveCompleted {
                quest_hash,
                player_id,
                objective_id,
            });
        }
        self.queue_validation(quest_hash);
        self.flush(fx);
        Ok(())
    }

    pub fn add_branch_choice(&self, quest_hash: u32, stage: u16, player_id: u32, choice: u32) -> CoreResult<()> {
        let now = self.now();
        let disagreement = self.with_record(quest_hash, |record| {
            ensure_player(record, player_id, now);
            if let Some(progress) = record.players.get_mut(&player_id) {
                progress.branch_choices.insert(stage, choice);
                progress.last_update = now;
            }
            let choices: BTreeSet<u32> = record
                .players
                .values()
                .filter_map(|p| p.branch_choices.get(&stage).copied())
                .collect();
            Ok(choices.len() > 1)
        })?;
        if disagreement {
            debug!(
                "Quest {:#010x} stage {}: players chose different branches",
                quest_hash, stage
            );
        }
        self.bus.publish(CoreEvent::BranchChoiceMade {
            quest_hash,
            player_id,
            stage,
            choice,
        });
        Ok(())
    }

    /// player -> choice recorded at `stage`
    pub fn get_branch_choices(&self, quest_hash: u32, stage: u16) -> CoreResult<BTreeMap<u32, u32>> {
        self.with_record(quest_hash, |record| {
            Ok(record
                .players
                .iter()
                .filter_map(|(id, p)| p.branch_choices.get(&stage).map(|c| (*id, *c)))
                .collect())
        })
    }

    /// True when players recorded different branch choices at `stage`.
    pub fn requires_consensus(&self, quest_hash: u32, stage: u16) -> CoreResult<bool> {
        let choices = self.get_branch_choices(quest_hash, stage)?;
        let distinct: BTreeSet<u32> = choices.values().copied().collect();
        Ok(distinct.len() > 1)
    }

    // ---- voting -------------------------------------------------------

    pub fn start_conflict_vote(&self, quest_hash: u32, target_stage: u16, initiator: u32) -> CoreResult<()> {
        let now = self.now();
        let timeout_ms = self.vote_timeout_ms();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records,
                sync,
                conflicts,
                ..
            } = &mut *table;
            let record = records
                .get_mut(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            if record.sync_mode == QuestSyncMode::Individual {
                return Err(CoreError::PreconditionFailed(
                    "individual quests do not vote".to_string(),
                ));
            }
            if !record.players.contains_key(&initiator) {
                return Err(CoreError::PreconditionFailed(format!(
                    "player {} is not on quest {:#010x}",
                    initiator, quest_hash
                )));
            }
            if record.active_vote.is_some() {
                return Err(CoreError::PreconditionFailed(format!(
                    "quest {:#010x} already has an active vote",
                    quest_hash
                )));
            }
            if record.sync_mode == QuestSyncMode::Strict && target_stage < record.authority_stage {
                return Err(CoreError::InvalidArgument(format!(
                    "stage {} is behind the authority stage {}",
                    target_stage, record.authority_stage
                )));
            }
            let meta = sync.entry(quest_hash).or_default();
            open_vote(
                record, meta, conflicts, target_stage, initiator, None, now, timeout_ms, &mut fx,
            );
        }
        self.flush(fx);
        Ok(())
    }

    pub fn cast_conflict_vote(&self, quest_hash: u32, player_id: u32, approve: bool) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records,
                sync,
                conflicts,
                ..
            } = &mut *table;
            let record = records
                .get_mut(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            if !record.players.contains_key(&player_id) {
                return Err(CoreError::PermissionDenied(format!(
                    "player {} is not on quest {:#010x}",
                    player_id, quest_hash
                )));
            }
            let vote = record.active_vote.as_mut().ok_or_else(|| {
                CoreError::PreconditionFailed(format!("quest {:#010x} has no active vote", quest_hash))
            })?;
            if vote.votes.contains_key(&player_id) {
                return Err(CoreError::PreconditionFailed(format!(
                    "player {} already voted",
                    player_id
                )));
            }
            vote.votes.insert(player_id, approve);
            let target_stage = vote.target_stage;

            fx.broadcast(WirePacket::QuestVote(QuestVote {
                quest_hash,
                player_id,
                target_stage,
                approve,
                timestamp: now,
            }));
            fx.events.push(CoreEvent::QuestVoteCast {
                quest_hash,
                player_id,
                approve,
            });
            let meta = sync.entry(quest_hash).or_default();
            evaluate_vote(record, meta, conflicts, now, &mut fx);
        }
        self.flush(fx);
        Ok(())
    }

    /// Fails every vote whose deadline has been reached.
    pub fn process_vote_timeouts(&self) -> usize {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records, conflicts, ..
            } = &mut *table;
            for record in records.values_mut() {
                let expired = record.active_vote.as_ref().map_or(false, |v| now >= v.deadline);
                if !expired {
                    continue;
                }
                if let Some(vote) = record.active_vote.take() {
                    warn!(
                        "Quest {:#010x} vote for stage {} timed out",
                        record.quest_hash, vote.target_stage
                    );
                    if let Some(conflict_id) = vote.conflict_id {
                        conflicts.remove(&conflict_id);
                    }
                    fx.votes_failed += 1;
                    fx.events.push(CoreEvent::QuestVoteTimeout {
                        quest_hash: record.quest_hash,
                        target_stage: vote.target_stage,
                    });
                }
            }
        }
        let timed_out = fx.events.len();
        self.flush(fx);
        timed_out
    }

    // ---- conflicts ----------------------------------------------------

    /// Opens and settles conflicts for every divergent quest; returns the new
    /// conflict ids.
    pub fn detect_conflicts(&self) -> Vec<u32> {
        let now = self.now();
        let timeout_ms = self.vote_timeout_ms();
        let timeout_secs = self.config.vote_timeout_secs.min(u32::MAX as u64) as u32;
        let mut fx = Effects::default();
        let mut opened = Vec::new();
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records,
                sync,
                conflicts,
                next_conflict_id,
            } = &mut *table;

            let mut hashes: Vec<u32> = records.keys().copied().collect();
            hashes.sort_unstable();
            for hash in hashes {
                let Some(record) = records.get_mut(&hash) else {
                    continue;
                };
                if conflicts.values().any(|c| c.quest_hash == hash) {
                    continue;
                }
                let Some(groups) = conflict::stage_groups(record) else {
                    continue;
                };

                let conflict = QuestConflict {
                    conflict_id: *next_conflict_id,
                    quest_hash: hash,
                    groups,
                    detected_at: now,
                };
                *next_conflict_id = next_conflict_id.wrapping_add(1).max(1);
                let stages = conflict.stages();
                warn!(
                    "Quest {:#010x} conflict {}: players at stages {:?}",
                    hash, conflict.conflict_id, stages
                );

                fx.broadcast(WirePacket::QuestConflictNotification(
                    QuestConflictNotification::new(
                        conflict.conflict_id,
                        hash,
                        &stages,
                        record.conflict_policy.as_u8(),
                        timeout_secs,
                    ),
                ));
                fx.events.push(CoreEvent::QuestConflictDetected {
                    quest_hash: hash,
                    conflict_id: conflict.conflict_id,
                    stages,
                });
                opened.push(conflict.conflict_id);
                conflicts.insert(conflict.conflict_id, conflict.clone());

                let meta = sync.entry(hash).or_default();
                let policy = record.conflict_policy;
                apply_policy(record, meta, conflicts, &conflict, policy, now, timeout_ms, &mut fx);
            }
        }
        self.flush(fx);
        opened
    }

    pub fn pending_conflicts(&self) -> Vec<QuestConflict> {
        lock(&self.table).conflicts.values().cloned().collect()
    }

    /// Settles a pending conflict with `policy`, cancelling its vote if any.
    pub fn resolve_conflict(&self, conflict_id: u32, policy: ConflictPolicy) -> CoreResult<()> {
        let now = self.now();
        let timeout_ms = self.vote_timeout_ms();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records,
                sync,
                conflicts,
                ..
            } = &mut *table;
            let mut conflict = conflicts
                .get(&conflict_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found("conflict", conflict_id))?;
            let record = records
                .get_mut(&conflict.quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", conflict.quest_hash))?;
            let meta = sync.entry(conflict.quest_hash).or_default();

            if record
                .active_vote
                .as_ref()
                .map_or(false, |v| v.conflict_id == Some(conflict_id))
            {
                record.active_vote = None;
            }

            match conflict::stage_groups(record) {
                Some(groups) => {
                    conflict.groups = groups;
                    conflicts.insert(conflict_id, conflict.clone());
                    apply_policy(record, meta, conflicts, &conflict, policy, now, timeout_ms, &mut fx);
                }
                None => {
                    let stage = record.authority_stage;
                    settle(record, meta, conflicts, conflict_id, stage, policy, now, &mut fx);
                }
            }
        }
        self.flush(fx);
        Ok(())
    }

    // ---- validation ---------------------------------------------------

    pub fn validate_quest_state(&self, quest_hash: u32) -> CoreResult<Vec<ValidationIssue>> {
        let now = self.now();
        let issues = {
            let table = lock(&self.table);
            let record = table
                .records
                .get(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            validation::validate(record, now, |q| table.records.contains_key(&q))
        };
        self.note_issues(quest_hash, &issues);
        Ok(issues)
    }

    fn note_issues(&self, quest_hash: u32, issues: &[ValidationIssue]) {
        let errors = issues.iter().filter(|i| !i.is_warning()).count() as u64;
        self.validation_errors.fetch_add(errors, Ordering::Relaxed);
        for issue in issues {
            if issue.is_warning() {
                debug!("Quest {:#010x}: {}", quest_hash, issue);
            } else {
                warn!("Quest {:#010x}: {}", quest_hash, issue);
            }
        }
    }

    /// Issues for every quest that has any, ordered by hash.
    pub fn validate_all(&self) -> Vec<(u32, Vec<ValidationIssue>)> {
        let mut hashes: Vec<u32> = lock(&self.table).records.keys().copied().collect();
        hashes.sort_unstable();
        hashes
            .into_iter()
            .filter_map(|hash| {
                self.validate_quest_state(hash)
                    .ok()
                    .filter(|issues| !issues.is_empty())
                    .map(|issues| (hash, issues))
            })
            .collect()
    }

    pub fn repair_quest_state(&self, quest_hash: u32) -> CoreResult<usize> {
        if !self.config.auto_repair {
            return Err(CoreError::PreconditionFailed(
                "automatic repair is disabled".to_string(),
            ));
        }
        let now = self.now();
        let mut fx = Effects::default();
        let fixes = {
            let mut table = lock(&self.table);
            let QuestTable { records, sync, .. } = &mut *table;
            let record = records
                .get_mut(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            let fixes = validation::repair(record, now);
            if fixes > 0 {
                let meta = sync.entry(quest_hash).or_default();
                push_sync(record, meta, SyncType::Forced, Audience::All, now, &mut fx);
                fx.events.push(CoreEvent::QuestRepaired {
                    quest_hash,
                    fixes,
                });
            }
            fixes
        };
        if fixes > 0 {
            info!("Repaired quest {:#010x} ({} fixes)", quest_hash, fixes);
        }
        self.flush(fx);
        Ok(fixes)
    }

    // ---- synchronization ----------------------------------------------

    /// Broadcasts the authority state. Under Strict every player is aligned
    /// to the authority stage first.
    pub fn synchronize_quest(&self, quest_hash: u32) -> CoreResult<()> {
        self.synchronize(quest_hash, true)
    }

    fn synchronize(&self, quest_hash: u32, align: bool) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable { records, sync, .. } = &mut *table;
            let record = records
                .get_mut(&quest_hash)
                .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
            if align && record.sync_mode == QuestSyncMode::Strict {
                record.align_players(now);
            }
            let meta = sync.entry(quest_hash).or_default();
            push_sync(record, meta, SyncType::Normal, Audience::All, now, &mut fx);
        }
        debug!("Synchronized quest {:#010x}", quest_hash);
        self.flush(fx);
        Ok(())
    }

    /// Queues a synchronization for the next tick.
    pub fn request_sync(&self, quest_hash: u32) {
        lock(&self.queues).sync.insert(quest_hash);
    }

    /// Re-sends every quest the player is on, addressed to that player only.
    pub fn force_resync_player(&self, player_id: u32) -> usize {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable { records, sync, .. } = &mut *table;
            for record in records.values().filter(|r| r.players.contains_key(&player_id)) {
                let meta = sync.entry(record.quest_hash).or_default();
                push_sync(record, meta, SyncType::Forced, Audience::Player(player_id), now, &mut fx);
            }
        }
        let sent = fx.decisions.len();
        self.flush(fx);
        sent
    }

    /// Synchronizes queued quests and every quest older than the threshold
    /// of its priority. Story-critical divergence is left to votes, so the
    /// background pass does not realign those quests.
    pub fn run_sync_walk(&self) -> usize {
        let now = self.now();
        let thresholds = self.config.sync_thresholds_ms;
        let queued: Vec<u32> = std::mem::take(&mut lock(&self.queues).sync)
            .into_iter()
            .collect();

        let due: Vec<(u32, bool)> = {
            let table = lock(&self.table);
            let mut due: Vec<(u32, bool)> = table
                .records
                .values()
                .filter(|r| !r.players.is_empty())
                .filter(|r| {
                    let last = table.sync.get(&r.quest_hash).map_or(0, |m| m.last_sync);
                    now.saturating_sub(last) > thresholds.for_priority(r.priority)
                })
                .filter(|r| !queued.contains(&r.quest_hash))
                .map(|r| (r.quest_hash, !r.story_critical))
                .collect();
            due.sort_unstable();
            due
        };

        let mut synced = 0;
        for hash in queued {
            if self.synchronize(hash, true).is_ok() {
                synced += 1;
            }
        }
        for (hash, align) in due {
            if self.synchronize(hash, align).is_ok() {
                synced += 1;
            }
        }
        synced
    }

    // ---- checkpoints --------------------------------------------------

    /// Snapshots the quest; returns the ring size afterwards.
    pub fn create_checkpoint(&self, quest_hash: u32) -> CoreResult<usize> {
        let snapshot = lock(&self.table)
            .records
            .get(&quest_hash)
            .cloned()
            .ok_or_else(|| CoreError::not_found("quest", quest_hash))?;
        let mut checkpoints = lock(&self.checkpoints);
        let ring = checkpoints.entry(quest_hash).or_default();
        ring.push_back(snapshot);
        while ring.len() > self.config.max_quest_history {
            ring.pop_front();
        }
        debug!("Checkpoint {} stored for quest {:#010x}", ring.len(), quest_hash);
        Ok(ring.len())
    }

    /// Replaces the live record with the newest checkpoint and synchronizes.
    pub fn restore_checkpoint(&self, quest_hash: u32) -> CoreResult<()> {
        let now = self.now();
        let snapshot = lock(&self.checkpoints)
            .get_mut(&quest_hash)
            .and_then(|ring| ring.pop_back())
            .ok_or_else(|| CoreError::not_found("checkpoint for quest", quest_hash))?;

        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let QuestTable {
                records,
                sync,
                conflicts,
                ..
            } = &mut *table;
            if !records.contains_key(&quest_hash) {
                return Err(CoreError::not_found("quest", quest_hash));
            }
            conflicts.retain(|_, c| c.quest_hash != quest_hash);
            let stage = snapshot.authority_stage;
            records.insert(quest_hash, snapshot);
            if let Some(record) = records.get(&quest_hash) {
                let meta = sync.entry(quest_hash).or_default();
                push_sync(record, meta, SyncType::Forced, Audience::All, now, &mut fx);
            }
            fx.events.push(CoreEvent::QuestCheckpointRestored { quest_hash, stage });
        }
        info!("Quest {:#010x} restored from checkpoint", quest_hash);
        self.flush(fx);
        Ok(())
    }

    pub fn checkpoint_count(&self, quest_hash: u32) -> usize {
        lock(&self.checkpoints).get(&quest_hash).map_or(0, |r| r.len())
    }

    // ---- queries ------------------------------------------------------

    pub fn get_quest(&self, quest_hash: u32) -> Option<QuestRecord> {
        lock(&self.table).records.get(&quest_hash).cloned()
    }

    pub fn get_active_quests(&self) -> Vec<QuestRecord> {
        let mut quests: Vec<QuestRecord> = lock(&self.table)
            .records
            .values()
            .filter(|r| r.authority_state == QuestState::Active)
            .cloned()
            .collect();
        quests.sort_by_key(|r| r.quest_hash);
        quests
    }

    pub fn get_quests_by_type(&self, quest_type: QuestType) -> Vec<QuestRecord> {
        let mut quests: Vec<QuestRecord> = lock(&self.table)
            .records
            .values()
            .filter(|r| r.quest_type == quest_type)
            .cloned()
            .collect();
        quests.sort_by_key(|r| r.quest_hash);
        quests
    }

    pub fn stats(&self) -> QuestStats {
        let table = lock(&self.table);
        let count = |state: QuestState| {
            table
                .records
                .values()
                .filter(|r| r.authority_state == state)
                .count()
        };
        QuestStats {
            total_quests: table.records.len(),
            active_quests: count(QuestState::Active),
            completed_quests: count(QuestState::Completed),
            failed_quests: count(QuestState::Failed),
            pending_conflicts: table.conflicts.len(),
            sync_operations: self.sync_operations.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            votes_passed: self.votes_passed.load(Ordering::Relaxed),
            votes_failed: self.votes_failed.load(Ordering::Relaxed),
        }
    }

    // ---- scheduling ---------------------------------------------------

    /// One scheduler pass: vote deadlines, conflict detection and validation
    /// at their configured intervals, then the sync walk.
    pub fn tick(&self) {
        let now = self.now();
        self.process_vote_timeouts();

        let last = self.last_conflict_check.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= self.config.conflict_check_interval_ms {
            self.last_conflict_check.store(now, Ordering::Relaxed);
            self.detect_conflicts();
        }

        let last = self.last_validation.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= self.config.validation_interval_ms {
            self.last_validation.store(now, Ordering::Relaxed);
            let touched = std::mem::take(&mut lock(&self.queues).validation);
            for hash in touched {
                let errors = self
                    .validate_quest_state(hash)
                    .map(|issues| issues.iter().any(|i| !i.is_warning()))
                    .unwrap_or(false);
                if errors && self.config.auto_repair {
                    if let Err(e) = self.repair_quest_state(hash) {
                        warn!("Repair of quest {:#010x} failed: {}", hash, e);
                    }
                }
            }
        }

        self.run_sync_walk();
    }
}

impl QuestGate for QuestEngine {
    fn can_start_quest(&self, quest_hash: u32, player_id: u32) -> bool {
        QuestEngine::can_start_quest(self, quest_hash, player_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DecisionReceiver;
    use crate::clock::{Clock, ManualClock};
    use crate::error::ErrorKind;
    use crate::event_bus::{topics, EventRecorder};

    const MAIN: u32 = 0xABCD;

    struct Fixture {
        engine: QuestEngine,
        clock: ManualClock,
        recorder: EventRecorder,
        rx: DecisionReceiver,
    }

    impl Fixture {
        fn packets(&mut self) -> Vec<WirePacket> {
            let mut packets = Vec::new();
            while let Ok(decision) = self.rx.try_recv() {
                packets.push(decision.packet);
            }
            packets
        }
    }

    fn fixture() -> Fixture {
        fixture_with(QuestConfig::default())
    }

    fn fixture_with(config: QuestConfig) -> Fixture {
        let clock = ManualClock::new(10_000);
        let bus = Arc::new(EventBus::new());
        let recorder = EventRecorder::attach(&bus);
        let (outbox, rx) = Outbox::channel();
        let engine = QuestEngine::new(config, Arc::new(clock.clone()), bus, outbox);
        Fixture {
            engine,
            clock,
            recorder,
            rx,
        }
    }

    fn stages(engine: &QuestEngine, hash: u32) -> Vec<u16> {
        engine
            .get_quest(hash)
            .unwrap()
            .players
            .values()
            .map(|p| p.current_stage)
            .collect()
    }

    #[test]
    fn test_registration_rules() {
        let f = fixture();
        f.engine
            .register_quest(MAIN, "The Heist", QuestType::Main, QuestPriority::Critical, QuestSyncMode::Strict)
            .unwrap();
        let record = f.engine.get_quest(MAIN).unwrap();
        assert_eq!(record.conflict_policy, ConflictPolicy::Vote);
        assert_eq!(record.authority_state, QuestState::Inactive);

        let err = f
            .engine
            .register_quest(MAIN, "Again", QuestType::Side, QuestPriority::Low, QuestSyncMode::Strict)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert_eq!(
            f.engine
                .register(QuestDefinition::new(0, "zero", QuestType::Gig, QuestSyncMode::Strict))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );

        let named = QuestDefinition::named("Ghost Town", QuestType::Side, QuestSyncMode::Majority);
        assert_eq!(named.quest_hash, hash_quest_name("Ghost Town"));
        assert_eq!(named.priority, QuestPriority::Medium);
        f.engine.register(named).unwrap();
        assert_eq!(f.recorder.with_topic(topics::QUEST_REGISTERED).len(), 2);
    }

    #[test]
    fn test_dependency_cycles_rejected() {
        let f = fixture();
        f.engine.register(QuestDefinition::new(1, "a", QuestType::Side, QuestSyncMode::Strict)).unwrap();
        f.engine
            .register(QuestDefinition::new(2, "b", QuestType::Side, QuestSyncMode::Strict).prerequisite(1))
            .unwrap();
        f.engine.add_quest_dependency(3, 2).unwrap_err();
        f.engine
            .register(QuestDefinition::new(3, "c", QuestType::Side, QuestSyncMode::Strict).prerequisite(2))
            .unwrap();

        let err = f.engine.add_quest_dependency(1, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyCycle);
        assert_eq!(f.engine.add_quest_dependency(2, 2).unwrap_err().kind(), ErrorKind::DependencyCycle);
        assert_eq!(f.engine.get_quest_dependencies(1).unwrap(), Vec::<u32>::new());

        assert!(f.engine.remove_quest_dependency(3, 2).unwrap());
        f.engine.add_quest_dependency(1, 3).unwrap();
    }

    #[test]
    fn test_can_start_quest() {
        let f = fixture();
        f.engine.register(QuestDefinition::new(1, "intro", QuestType::Main, QuestSyncMode::Individual)).unwrap();
        f.engine
            .register(
                QuestDefinition::new(2, "act two", QuestType::Main, QuestSyncMode::Individual)
                    .prerequisite(1)
                    .prerequisite(999),
            )
            .unwrap();

        assert!(!f.engine.can_start_quest(2, 7));
        f.engine.update_quest_state(7, 1, QuestState::Completed).unwrap();
        assert!(f.engine.can_start_quest(2, 7));
        assert!(!f.engine.can_start_quest(2, 8));
        assert!(!f.engine.can_start_quest(404, 7));
    }

    #[test]
    fn test_strict_advances_and_aligns() {
        let mut f = fixture();
        f.engine
            .register(QuestDefinition::new(5, "gig", QuestType::Gig, QuestSyncMode::Strict))
            .unwrap();
        f.engine.register_player(5, 1).unwrap();
        f.engine.register_player(5, 2).unwrap();

        f.engine.update_quest_stage(2, 5, 3).unwrap();
        assert_eq!(f.engine.get_quest(5).unwrap().authority_stage, 3);
        assert_eq!(stages(&f.engine, 5), vec![3, 3]);

        // A report behind the authority is pulled forward, never backward.
        f.engine.update_quest_stage(1, 5, 1).unwrap();
        assert_eq!(f.engine.get_quest(5).unwrap().authority_stage, 3);
        assert_eq!(stages(&f.engine, 5), vec![3, 3]);

        let syncs: Vec<QuestFullSync> = f
            .packets()
            .into_iter()
            .filter_map(|p| match p {
                WirePacket::QuestFullSync(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(syncs.len(), 2);
        assert!(syncs.iter().all(|s| s.sync_type == SyncType::Forced as u8));
        assert!(syncs[1].timestamp > syncs[0].timestamp);
    }

    #[test]
    fn test_story_critical_stage_bump_opens_vote() {
        let mut f = fixture();
        f.engine
            .register(
                QuestDefinition::new(MAIN, "main", QuestType::Main, QuestSyncMode::Strict).story_critical(),
            )
            .unwrap();
        f.engine.register_player(MAIN, 1).unwrap();
        f.engine.register_player(MAIN, 2).unwrap();

        f.engine.update_quest_stage(1, MAIN, 2).unwrap();
        let record = f.engine.get_quest(MAIN).unwrap();
        assert_eq!(record.authority_stage, 0);
        let vote = record.active_vote.unwrap();
        assert_eq!((vote.target_stage, vote.initiator), (2, 1));
        assert_eq!(vote.deadline, f.clock.now_millis() + 30_000);
        assert!(f.packets().iter().any(|p| matches!(p, WirePacket::QuestVote(_))));

        f.engine.cast_conflict_vote(MAIN, 2, true).unwrap();
        assert_eq!(f.engine.get_quest(MAIN).unwrap().authority_stage, 2);
        assert_eq!(stages(&f.engine, MAIN), vec![2, 2]);
        assert_eq!(
            f.recorder.with_topic(topics::QUEST_VOTE_PASSED),
            vec![CoreEvent::QuestVotePassed { quest_hash: MAIN, stage: 2 }]
        );
    }

    fn failed_story_vote(config: QuestConfig) -> Fixture {
        let f = fixture_with(config);
        f.engine
            .register(
                QuestDefinition::new(MAIN, "main", QuestType::Main, QuestSyncMode::Strict).story_critical(),
            )
            .unwrap();
        f.engine.register_player(MAIN, 1).unwrap();
        f.engine.register_player(MAIN, 2).unwrap();
        f.engine.update_quest_stage(1, MAIN, 2).unwrap();
        f.engine.cast_conflict_vote(MAIN, 2, false).unwrap();
        f
    }

    #[test]
    fn test_failed_story_vote_keeps_authority() {
        let config = QuestConfig {
            conflict_check_interval_ms: u64::MAX,
            ..QuestConfig::default()
        };
        let f = failed_story_vote(config);

        // The initiator stays ahead until the next validation pass repairs it
        assert_eq!(f.engine.get_quest(MAIN).unwrap().authority_stage, 0);
        assert_eq!(stages(&f.engine, MAIN), vec![2, 0]);
        assert_eq!(f.recorder.with_topic(topics::QUEST_VOTE_FAILED).len(), 1);
        assert_eq!(
            f.engine.validate_quest_state(MAIN).unwrap(),
            vec![ValidationIssue::StageMismatch { player_id: 1, stage: 2, authority: 0 }]
        );

        f.clock.advance_millis(30_000);
        f.engine.tick();
        assert_eq!(stages(&f.engine, MAIN), vec![0, 0]);
        assert_eq!(f.engine.get_quest(MAIN).unwrap().authority_stage, 0);
        assert_eq!(f.recorder.with_topic(topics::QUEST_REPAIRED).len(), 1);
    }

    #[test]
    fn test_tick_skips_repair_when_disabled() {
        let config = QuestConfig {
            conflict_check_interval_ms: u64::MAX,
            auto_repair: false,
            ..QuestConfig::default()
        };
        let f = failed_story_vote(config);

        f.clock.advance_millis(30_000);
        f.engine.tick();
        assert_eq!(stages(&f.engine, MAIN), vec![2, 0]);
        assert!(f.recorder.with_topic(topics::QUEST_REPAIRED).is_empty());
        assert_eq!(
            f.engine.repair_quest_state(MAIN).unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
    }

    #[test]
    fn test_vote_rules() {
        let f = fixture();
        f.engine
            .register(QuestDefinition::new(9, "side", QuestType::Side, QuestSyncMode::Majority))
            .unwrap();
        for p in 1..=3 {
            f.engine.register_player(9, p).unwrap();
        }

        assert_eq!(
            f.engine.cast_conflict_vote(9, 1, true).unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
        f.engine.start_conflict_vote(9, 4, 1).unwrap();
        assert_eq!(
            f.engine.start_conflict_vote(9, 5, 2).unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            f.engine.cast_conflict_vote(9, 1, true).unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            f.engine.cast_conflict_vote(9, 42, true).unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );

        // 1 yes + 2 no can no longer reach 2 of 3.
        f.engine.cast_conflict_vote(9, 2, false).unwrap();
        assert!(f.engine.get_quest(9).unwrap().active_vote.is_some());
        f.engine.cast_conflict_vote(9, 3, false).unwrap();
        let record = f.engine.get_quest(9).unwrap();
        assert!(record.active_vote.is_none());
        assert_eq!(record.authority_stage, 0);
        assert_eq!(f.recorder.with_topic(topics::QUEST_VOTE_FAILED).len(), 1);
        assert_eq!(f.engine.stats().votes_failed, 1);
    }

    #[test]
    fn test_single_player_vote_passes_immediately() {
        let f = fixture();
        f.engine
            .register(QuestDefinition::new(9, "solo", QuestType::Side, QuestSyncMode::Consensus))
            .unwrap();
        f.engine.register_player(9, 1).unwrap();
        f.engine.start_conflict_vote(9, 6, 1).unwrap();
        assert_eq!(f.engine.get_quest(9).unwrap().authority_stage, 6);
    }

    #[test]
    fn test_vote_timeout() {
        let f = fixture();
        f.engine
            .register(QuestDefinition::new(9, "side", QuestType::Side, QuestSyncMode::Majority))
            .unwrap();
        for p in 1..=3 {
            f.engine.register_player(9, p).unwrap();
        }
        f.engine.start_conflict_vote(9, 4, 1).unwrap();

        f.clock.advance_millis(29_999);
        assert_eq!(f.engine.process_vote_timeouts(), 0);
        f.clock.advance_millis(1);
        assert_eq!(f.engine.process_vote_timeouts(), 1);
        assert!(f.engine.get_quest(9).unwrap().active_vote.is_none());
        assert_eq!(
            f.recorder.with_topic(topics::QUEST_VOTE_TIMEOUT),
            vec![CoreEvent::QuestVoteTimeout { quest_hash: 9, target_stage: 4 }]
        );
    }

    #[test]
    fn test_majority_and_consensus_tallies() {
        let f = fixture();
        f.engine.register(QuestDefinition::new(1, "maj", QuestType::Side, QuestSyncMode::Majority)).unwrap();
        f.engine.register(QuestDefinition::new(2, "con", QuestType::Side, QuestSyncMode::Consensus)).unwrap();
        for quest in [1, 2] {
            for p in 1..=3 {
                f.engine.register_player(quest, p).unwrap();
            }
        }

        f.engine.update_quest_stage(1, 1, 4).unwrap();
        assert_eq!(f.engine.get_quest(1).unwrap().authority_stage, 0);
        f.engine.update_quest_stage(2, 1, 4).unwrap();
        assert_eq!(f.engine.get_quest(1).unwrap().authority_stage, 4);
        assert_eq!(stages(&f.engine, 1), vec![4, 4, 4]);

        f.engine.update_quest_stage(1, 2, 4).unwrap();
        f.engine.update_quest_stage(2, 2, 4).unwrap();
        assert_eq!(f.engine.get_quest(2).unwrap().authority_stage, 0);
        f.engine.update_quest_stage(3, 2, 4).unwrap();
        assert_eq!(f.engine.get_quest(2).unwrap().authority_stage, 4);
    }

    #[test]
    fn test_leader_mode() {
        let f = fixture();
        f.engine.register(QuestDefinition::new(1, "lead", QuestType::Fixer, QuestSyncMode::Leader)).unwrap();
        f.engine.register_player(1, 1).unwrap();
        f.engine.register_player(1, 2).unwrap();
        f.engine.set_quest_leader(1, 2).unwrap();

        f.engine.update_quest_stage(1, 1, 5).unwrap();
        assert_eq!(f.engine.get_quest(1).unwrap().authority_stage, 0);
        f.engine.update_quest_stage(2, 1, 3).unwrap();
        assert_eq!(f.engine.get_quest(1).unwrap().authority_stage, 3);

        assert_eq!(
            f.engine.transfer_quest_leadership(1, 1, 2).unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );
        f.engine.transfer_quest_leadership(1, 2, 1).unwrap();
        assert_eq!(f.engine.get_quest(1).unwrap().leader, Some(1));

        f.engine.unregister_player(1, 1).unwrap();
        assert_eq!(f.engine.get_quest(1).unwrap().leader, Some(2));
    }

    #[test]
    fn test_individual_mode_never_reconciles() {
        let f = fixture();
        f.engine.register(QuestDefinition::new(1, "solo", QuestType::Scanner, QuestSyncMode::Individual)).unwrap();
        f.engine.update_quest_stage(1, 1, 5).unwrap();
        f.engine.update_quest_stage(2, 1, 2).unwrap();
        assert_eq!(stages(&f.engine, 1), vec![5, 2]);
        assert!(f.engine.detect_conflicts().is_empty());
        assert_eq!(
            f.engine.start_conflict_vote(1, 5, 1).unwrap_err().kind(),
            ErrorKind::PreconditionFailed
        );
    }

    fn diverged(f: &Fixture, policy: ConflictPolicy, quest_type: QuestType) {
        f.engine
            .register(QuestDefinition::new(7, "q", quest_type, QuestSyncMode::Leader).policy(policy))
            .unwrap();
        f.engine.register_player(7, 1).unwrap();
        f.engine.register_player(7, 2).unwrap();
        f.engine.register_player(7, 3).unwrap();
        f.engine.set_quest_leader(7, 3).unwrap();
        // Leader reports first so followers' reports are only recorded.
        f.engine.update_quest_stage(3, 7, 6).unwrap();
        f.engine.update_quest_stage(1, 7, 2).unwrap();
        f.engine.update_quest_stage(2, 7, 2).unwrap();
    }

    #[test]
    fn test_conflict_policies() {
        let cases = [
            (ConflictPolicy::RollbackAll, QuestType::Side, 2),
            (ConflictPolicy::AdvanceAll, QuestType::Side, 6),
            (ConflictPolicy::LeaderDecides, QuestType::Side, 6),
            (ConflictPolicy::AutoResolve, QuestType::Side, 2),
            (ConflictPolicy::AutoResolve, QuestType::Main, 6),
        ];
        for (policy, quest_type, expected) in cases {
            let mut f = fixture();
            diverged(&f, policy, quest_type);
            f.packets();

            let opened = f.engine.detect_conflicts();
            assert_eq!(opened.len(), 1, "{:?}", policy);
            let record = f.engine.get_quest(7).unwrap();
            assert_eq!(record.authority_stage, expected, "{:?}", policy);
            assert_eq!(stages(&f.engine, 7), vec![expected; 3]);
            assert!(f.engine.pending_conflicts().is_empty());

            let packets = f.packets();
            match &packets[0] {
                WirePacket::QuestConflictNotification(n) => {
                    assert_eq!(n.stages(), &[2, 6]);
                    assert_eq!(n.resolution_method, policy.as_u8());
                }
                other => panic!("unexpected packet {:?}", other),
            }
            assert_eq!(f.recorder.with_topic(topics::QUEST_CONFLICT_RESOLVED).len(), 1);
        }
    }

    #[test]
    fn test_vote_policy_conflict_and_manual_resolution() {
        let f = fixture();
        diverged(&f, ConflictPolicy::Vote, QuestType::Main);

        let opened = f.engine.detect_conflicts();
        let vote = f.engine.get_quest(7).unwrap().active_vote.unwrap();
        assert_eq!((vote.target_stage, vote.initiator), (6, 1));
        assert_eq!(vote.conflict_id, Some(opened[0]));
        assert_eq!(f.engine.pending_conflicts().len(), 1);
        // Nothing new while the vote runs.
        assert!(f.engine.detect_conflicts().is_empty());

        f.engine.resolve_conflict(opened[0], ConflictPolicy::RollbackAll).unwrap();
        let record = f.engine.get_quest(7).unwrap();
        assert!(record.active_vote.is_none());
        assert_eq!(record.authority_stage, 2);
        assert!(f.engine.pending_conflicts().is_empty());
        assert_eq!(
            f.engine.resolve_conflict(opened[0], ConflictPolicy::AdvanceAll).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_objectives() {
        let mut f = fixture();
        f.engine
            .register(
                QuestDefinition::new(3, "obj", QuestType::Side, QuestSyncMode::Strict)
                    .objective(1, "find the chip", false),
            )
            .unwrap();
        f.engine.add_objective(3, 2, "everyone escapes", false, true).unwrap();
        f.engine.register_player(3, 1).unwrap();
        f.engine.register_player(3, 2).unwrap();

        f.engine.complete_objective(1, 3, 1).unwrap();
        let record = f.engine.get_quest(3).unwrap();
        assert!(record.players.values().all(|p| p.completed_objectives.contains(&1)));

        f.engine.complete_objective(1, 3, 2).unwrap();
        f.engine.complete_objective(1, 3, 2).unwrap();
        f.engine.complete_objective(2, 3, 2).unwrap();
        let states: Vec<u8> = f
            .packets()
            .into_iter()
            .filter_map(|p| match p {
                WirePacket::QuestObjectiveUpdate(u) => Some(u.new_state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                OBJECTIVE_COMPLETED_BY_GROUP,
                OBJECTIVE_COMPLETED_BY_PLAYER,
                OBJECTIVE_COMPLETED_BY_GROUP
            ]
        );

        assert_eq!(
            f.engine.complete_objective(1, 3, 77).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(f.recorder.with_topic(topics::OBJECTIVE_COMPLETED).len(), 3);
    }

    #[test]
    fn test_state_propagation_under_strict() {
        let f = fixture();
        f.engine.register(QuestDefinition::new(4, "s", QuestType::Side, QuestSyncMode::Strict)).unwrap();
        f.engine.register_player(4, 1).unwrap();
        f.engine.register_player(4, 2).unwrap();

        f.engine.update_quest_state(1, 4, QuestState::Completed).unwrap();
        let record = f.engine.get_quest(4).unwrap();
        assert_eq!(record.authority_state, QuestState::Completed);
        assert!(record.players.values().all(|p| p.state == QuestState::Completed));
        assert_eq!(f.engine.stats().completed_quests, 1);
    }

    #[test]
    fn test_branch_choices() {
        let f = fixture();
        f.engine.register(QuestDefinition::new(4, "b", QuestType::Romance, QuestSyncMode::Strict)).unwrap();
        f.engine.add_branch_choice(4, 2, 1, 10).unwrap();
        assert!(!f.engine.requires_consensus(4, 2).unwrap());
        f.engine.add_branch_choice(4, 2, 2, 11).unwrap();
        assert!(f.engine.requires_consensus(4, 2).unwrap());

        let choices = f.engine.get_branch_choices(4, 2).unwrap();
        assert_eq!(choices.get(&1), Some(&10));
        assert_eq!(choices.get(&2), Some(&11));
        assert_eq!(f.recorder.with_topic(topics::BRANCH_CHOICE_MADE).len(), 2);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let f = fixture();
        f.engine.register(QuestDefinition::new(4, "c", QuestType::Side, QuestSyncMode::Strict)).unwrap();
        f.engine.update_quest_stage(1, 4, 2).unwrap();
        f.engine.create_checkpoint(4).unwrap();
        let snapshot = f.engine.get_quest(4).unwrap();

        f.engine.update_quest_stage(2, 4, 9).unwrap();
        f.engine.update_quest_state(1, 4, QuestState::Failed).unwrap();
        assert_ne!(f.engine.get_quest(4).unwrap(), snapshot);

        f.engine.restore_checkpoint(4).unwrap();
        assert_eq!(f.engine.get_quest(4).unwrap(), snapshot);
        assert_eq!(f.engine.checkpoint_count(4), 0);
        assert_eq!(
            f.engine.restore_checkpoint(4).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_checkpoint_ring_is_bounded() {
        let clock = ManualClock::new(0);
        let (outbox, _rx) = Outbox::channel();
        let config = QuestConfig {
            max_quest_history: 2,
            ..QuestConfig::default()
        };
        let engine = QuestEngine::new(config, Arc::new(clock), Arc::new(EventBus::new()), outbox);
        engine.register(QuestDefinition::new(4, "c", QuestType::Side, QuestSyncMode::Strict)).unwrap();
        for stage in 1..=3 {
            engine.update_quest_stage(1, 4, stage).unwrap();
            engine.create_checkpoint(4).unwrap();
        }
        assert_eq!(engine.checkpoint_count(4), 2);
        engine.restore_checkpoint(4).unwrap();
        engine.restore_checkpoint(4).unwrap();
        assert_eq!(engine.get_quest(4).unwrap().authority_stage, 2);
    }

    #[test]
    fn test_validation_and_repair() {
        let f = fixture();
        f.engine
            .register(
                QuestDefinition::new(6, "v", QuestType::Main, QuestSyncMode::Strict)
                    .story_critical()
                    .prerequisite(12345),
            )
            .unwrap();
        f.engine.register_player(6, 1).unwrap();
        f.engine.register_player(6, 2).unwrap();
        // Opens a vote; the recorded stage now differs from the authority.
        f.engine.update_quest_stage(1, 6, 3).unwrap();
        f.clock.advance_millis(31_000);

        let issues = f.engine.validate_quest_state(6).unwrap();
        assert!(issues.contains(&ValidationIssue::StageMismatch { player_id: 1, stage: 3, authority: 0 }));
        assert!(issues.contains(&ValidationIssue::MissingPrerequisite { quest_hash: 12345 }));
        assert!(issues.iter().any(|i| matches!(i, ValidationIssue::ExpiredVote { .. })));
        assert_eq!(f.engine.validate_all().len(), 1);

        assert_eq!(f.engine.repair_quest_state(6).unwrap(), 2);
        let remaining = f.engine.validate_quest_state(6).unwrap();
        assert!(remaining.iter().all(|i| i.is_warning()));
    }

    #[test]
    fn test_sync_walk_respects_priority_thresholds() {
        let mut f = fixture();
        f.engine.register(QuestDefinition::new(1, "crit", QuestType::Main, QuestSyncMode::Strict)).unwrap();
        f.engine.register(QuestDefinition::new(2, "low", QuestType::Gig, QuestSyncMode::Strict)).unwrap();
        f.engine.register_player(1, 1).unwrap();
        f.engine.register_player(2, 1).unwrap();

        // Low priority is not stale yet.
        assert_eq!(f.engine.run_sync_walk(), 1);
        f.packets();

        f.clock.advance_millis(10);
        assert_eq!(f.engine.run_sync_walk(), 1);
        f.clock.advance_millis(30_000);
        assert_eq!(f.engine.run_sync_walk(), 2);

        f.engine.request_sync(2);
        assert_eq!(f.engine.run_sync_walk(), 1);
        assert_eq!(f.engine.force_resync_player(1), 2);
        assert!(f.engine.stats().sync_operations >= 7);
    }

    #[test]
    fn test_remove_player_reevaluates_vote() {
        let f = fixture();
        f.engine
            .register(QuestDefinition::new(9, "side", QuestType::Side, QuestSyncMode::Majority))
            .unwrap();
        for p in 1..=3 {
            f.engine.register_player(9, p).unwrap();
        }
        f.engine.start_conflict_vote(9, 4, 1).unwrap();
        f.engine.cast_conflict_vote(9, 2, false).unwrap();

        // Two players remain and both have voted: 1 yes of 2 required.
        assert_eq!(f.engine.remove_player(3), 1);
        assert!(f.engine.get_quest(9).unwrap().active_vote.is_none());
        assert_eq!(f.recorder.with_topic(topics::QUEST_VOTE_FAILED).len(), 1);
    }
}
