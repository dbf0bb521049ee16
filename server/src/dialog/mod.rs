//! # Dialog Coordinator
//!
//! One [`DialogSession`] per NPC conversation. A session starts in
//! `Starting`, becomes `Active` on the next coordinator tick (or through
//! [`DialogCoordinator::activate_dialog`]) and from there follows:
//!
//! ```text
//! Active ──choice needing a vote──▶ AwaitingChoice ──pass──▶ Processing ──▶ Active
//!                                                  ──fail / timeout──▶ Active
//! Active ──direct choice──▶ Processing ──▶ Active
//! any ──end──▶ Ending (removed)      any ──force / timeout──▶ Interrupted (removed)
//! ```
//!
//! Exactly one participant holds the `Speaker` role for the whole life of a
//! session. When the speaker leaves, the role passes to the earliest-joined
//! `Participant` (or else the earliest remaining player); an empty session is
//! interrupted.
//!
//! Player positions live in their own map and are written without touching
//! the session table. Skill and quest requirement checks call out to
//! [`SkillProvider`] / [`QuestGate`] with no dialog lock held.

pub mod types;
pub mod vote;

pub use types::{
    ChoiceVote, DialogChoice, DialogChoiceType, DialogParticipant, DialogRole, DialogSession,
    DialogState, DialogStats, DialogSyncMode, HistoryEntry, NpcDialogState, VoteStatus,
};
pub use vote::{Position, UNKNOWN_DISTANCE};

use crate::bridge::Outbox;
use crate::clock::SharedClock;
use crate::config::DialogConfig;
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{CoreEvent, EventBus};
use crate::utils::{lock, read, write};
use log::{debug, info, warn};
use shared::wire::{self, DialogEndReason};
use shared::{Audience, AuthoritativeDecision, WirePacket};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use vote::Tally;

const MAX_CHOICE_TEXT: usize = 1000;

/// Skill and level checks for gated choices.
pub trait SkillProvider: Send + Sync {
    fn meets_skill(&self, player_id: u32, skill_id: u32, level: u32) -> bool;
}

/// Accepts every skill check.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveSkills;

impl SkillProvider for PermissiveSkills {
    fn meets_skill(&self, _player_id: u32, _skill_id: u32, _level: u32) -> bool {
        true
    }
}

/// Read-only quest lookup used to gate quest-linked choices.
pub trait QuestGate: Send + Sync {
    fn can_start_quest(&self, quest_hash: u32, player_id: u32) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceOutcome {
    /// Consequences applied; the dialog is Active again
    Applied,
    VoteOpened { vote_id: u32, required: u32 },
    /// An Ending choice was applied and the session closed
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndKind {
    Completed,
    Interrupted,
    Timeout,
}

impl EndKind {
    fn wire_reason(self) -> DialogEndReason {
        match self {
            EndKind::Completed => DialogEndReason::Completed,
            EndKind::Interrupted => DialogEndReason::Interrupted,
            EndKind::Timeout => DialogEndReason::Timeout,
        }
    }

    fn text(self) -> &'static str {
        match self {
            EndKind::Completed => "completed",
            EndKind::Interrupted => "interrupted",
            EndKind::Timeout => "inactivity",
        }
    }
}

#[derive(Default)]
struct DialogTable {
    sessions: HashMap<u32, DialogSession>,
    by_npc: HashMap<u32, u32>,
    next_session_id: u32,
    next_vote_id: u32,
}

impl DialogTable {
    fn session_mut(&mut self, session_id: u32) -> CoreResult<&mut DialogSession> {
        self.sessions
            .get_mut(&session_id)
            .ok_or_else(|| CoreError::not_found("dialog session", session_id))
    }

    fn allocate_session_id(&mut self) -> u32 {
        loop {
            self.next_session_id = self.next_session_id.wrapping_add(1);
            let id = self.next_session_id;
            if id != 0 && !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    fn allocate_vote_id(&mut self) -> u32 {
        self.next_vote_id = self.next_vote_id.wrapping_add(1).max(1);
        self.next_vote_id
    }
}

/// Outputs collected under the session lock, applied after it is released.
#[derive(Default)]
struct Effects {
    events: Vec<CoreEvent>,
    decisions: Vec<AuthoritativeDecision>,
    history: Vec<(u32, &'static str, String)>,
    npc: Vec<NpcDialogState>,
    ended: Vec<u32>,
    stats: DialogStats,
}

impl Effects {
    fn send(&mut self, session: &DialogSession, actor: u32, packet: WirePacket) {
        self.decisions.push(AuthoritativeDecision {
            audience: audience(session, actor),
            packet,
        });
    }

    fn note(&mut self, session_id: u32, action: &'static str, detail: String) {
        self.history.push((session_id, action, detail));
    }
}

/// Individual-mode sessions only report back to the acting player.
fn audience(session: &DialogSession, actor: u32) -> Audience {
    if session.sync_mode == DialogSyncMode::Individual {
        Audience::Player(actor)
    } else {
        Audience::All
    }
}

fn npc_snapshot(session: &DialogSession, now: u64) -> NpcDialogState {
    NpcDialogState {
        npc_id: session.npc_id,
        current_dialog: session.session_id,
        current_choice: session.current_choice,
        state: session.state,
        active_speaker: session.speaker,
        last_update: now,
    }
}

fn state_update(session: &DialogSession, now: u64) -> WirePacket {
    WirePacket::DialogStateUpdate(wire::DialogStateUpdate {
        session_id: session.session_id,
        npc_id: session.npc_id,
        new_state: session.state.as_u8(),
        current_choice: session.current_choice,
        timestamp: now,
    })
}

fn within_range(mode: DialogSyncMode, distance: f32, range: f32) -> bool {
    mode != DialogSyncMode::Proximity || distance <= range
}

/// Recomputes distances to the speaker and the requirement flags derived
/// from them.
fn refresh_distances(session: &mut DialogSession, positions: &HashMap<u32, Position>, range: f32) {
    let speaker_pos = positions.get(&session.speaker).copied();
    let mode = session.sync_mode;
    let speaker = session.speaker;
    for participant in session.participants.values_mut() {
        if participant.player_id == speaker {
            participant.distance_to_speaker = 0.0;
            participant.meets_requirements = true;
        } else {
            participant.distance_to_speaker =
                vote::distance(positions.get(&participant.player_id).copied(), speaker_pos);
            participant.meets_requirements =
                within_range(mode, participant.distance_to_speaker, range);
        }
        participant.can_vote = participant.role.is_active() && participant.meets_requirements;
    }
}

fn eligible_voters(session: &DialogSession) -> Vec<u32> {
    session
        .participants
        .values()
        .filter(|p| p.is_eligible_voter())
        .map(|p| p.player_id)
        .collect()
}

fn clear_ballots(session: &mut DialogSession) {
    for participant in session.participants.values_mut() {
        participant.has_voted = false;
        participant.voted_choice = 0;
    }
}

/// Runs a choice through Processing and back to Active. Returns true when
/// the choice ends the conversation.
fn apply_choice(session: &mut DialogSession, player_id: u32, choice: &DialogChoice, now: u64, fx: &mut Effects) -> bool {
    session.state = DialogState::Processing;
    session.current_choice = choice.choice_id;
    session.last_activity = now;
    if let Some(participant) = session.participants.get_mut(&player_id) {
        participant.last_activity = now;
    }

    for consequence_id in &choice.consequences {
        fx.events.push(CoreEvent::ChoiceConsequence {
            session_id: session.session_id,
            choice_id: choice.choice_id,
            consequence_id: *consequence_id,
        });
    }
    fx.send(
        session,
        player_id,
        WirePacket::DialogChoice(wire::DialogChoice {
            session_id: session.session_id,
            player_id,
            choice_id: choice.choice_id,
            timestamp: now,
        }),
    );
    fx.events.push(CoreEvent::ChoiceSelected {
        session_id: session.session_id,
        player_id,
        choice_id: choice.choice_id,
        quest_hash: session.quest_hash,
        branch: choice.choice_type == DialogChoiceType::Branch && session.quest_hash != 0,
    });
    fx.note(
        session.session_id,
        "choice_selected",
        format!("player:{},choice:{},text:{}", player_id, choice.choice_id, choice.text),
    );
    info!(
        "Player {} selected choice {} in dialog {}",
        player_id, choice.choice_id, session.session_id
    );

    session.state = DialogState::Active;
    fx.send(session, player_id, state_update(session, now));
    fx.npc.push(npc_snapshot(session, now));
    choice.choice_type == DialogChoiceType::Ending
}

/// Settles the active vote if its outcome is decided. Returns the outcome
/// and whether an applied Ending choice should close the session.
fn settle_vote(session: &mut DialogSession, now: u64, fx: &mut Effects) -> (Tally, bool) {
    let eligible = eligible_voters(session);
    let outcome = match &session.active_vote {
        Some(vote) => vote::tally(vote, &eligible),
        None => return (Tally::Pending, false),
    };
    if outcome == Tally::Pending {
        return (outcome, false);
    }
    let Some(vote) = session.active_vote.take() else {
        return (Tally::Pending, false);
    };
    clear_ballots(session);

    let passed = outcome == Tally::Passed;
    session.last_vote_result = Some(if passed { VoteStatus::Passed } else { VoteStatus::Failed });
    info!(
        "Dialog {} vote for choice {} {} ({}/{} yes)",
        session.session_id,
        vote.choice_id,
        if passed { "passed" } else { "failed" },
        vote.yes_count(),
        vote.required
    );
    fx.events.push(CoreEvent::VoteCompleted {
        session_id: session.session_id,
        choice_id: vote.choice_id,
        passed,
    });

    let mut ending = false;
    if passed {
        fx.stats.passed_votes += 1;
        match session.choice(vote.choice_id).cloned() {
            Some(choice) => ending = apply_choice(session, vote.initiator, &choice, now, fx),
            None => session.state = DialogState::Active,
        }
    } else {
        fx.stats.failed_votes += 1;
        session.state = DialogState::Active;
        fx.send(session, vote.initiator, state_update(session, now));
        fx.npc.push(npc_snapshot(session, now));
    }
    (outcome, ending)
}

/// Removes the session and emits its end packet and events.
fn finish(
    table: &mut DialogTable,
    session_id: u32,
    kind: EndKind,
    ending_player: u32,
    now: u64,
    fx: &mut Effects,
) -> Option<DialogSession> {
    let mut session = table.sessions.remove(&session_id)?;
    if table.by_npc.get(&session.npc_id) == Some(&session_id) {
        table.by_npc.remove(&session.npc_id);
    }
    let forced = kind != EndKind::Completed;
    session.state = if forced {
        DialogState::Interrupted
    } else {
        DialogState::Ending
    };

    if session.active_vote.take().is_some() {
        fx.stats.failed_votes += 1;
    }
    if forced {
        fx.stats.interrupted_dialogs += 1;
    } else {
        fx.stats.completed_dialogs += 1;
    }

    fx.send(
        &session,
        ending_player,
        WirePacket::DialogEnd(wire::DialogEnd {
            session_id,
            ending_player,
            reason: kind.wire_reason() as u8,
            timestamp: now,
        }),
    );
    fx.events.push(CoreEvent::DialogEnded {
        session_id,
        npc_id: session.npc_id,
        forced,
        reason: kind.text().to_string(),
    });
    let mut idle = NpcDialogState::idle(session.npc_id);
    idle.last_update = now;
    fx.npc.push(idle);
    fx.ended.push(session_id);

    info!(
        "Ended dialog {} with NPC {} after {} ms ({})",
        session_id,
        session.npc_id,
        now.saturating_sub(session.started_at),
        kind.text()
    );
    Some(session)
}

/// Drops a player from a session, handing over the speaker role or ending
/// the session as needed. Returns true if the session was closed.
fn detach_player(
    table: &mut DialogTable,
    session_id: u32,
    player_id: u32,
    positions: &HashMap<u32, Position>,
    range: f32,
    now: u64,
    fx: &mut Effects,
) -> bool {
    let Some(session) = table.sessions.get_mut(&session_id) else {
        return false;
    };
    if session.participants.remove(&player_id).is_none() {
        return false;
    }
    fx.events.push(CoreEvent::ParticipantRemoved {
        session_id,
        player_id,
    });
    fx.note(session_id, "participant_removed", format!("player:{}", player_id));
    session.last_activity = now;

    if session.participants.is_empty() {
        finish(table, session_id, EndKind::Interrupted, player_id, now, fx);
        return true;
    }

    if session.speaker == player_id {
        let mut candidates: Vec<&DialogParticipant> = session.participants.values().collect();
        candidates.sort_by_key(|p| (p.role != DialogRole::Participant, p.joined_at, p.player_id));
        if let Some(next) = candidates.first().map(|p| p.player_id) {
            session.speaker = next;
            if let Some(participant) = session.participants.get_mut(&next) {
                participant.role = DialogRole::Speaker;
            }
            refresh_distances(session, positions, range);
            info!("Dialog {}: speaker role passed from {} to {}", session_id, player_id, next);
            fx.events.push(CoreEvent::SpeakerChanged {
                session_id,
                old_speaker: player_id,
                new_speaker: next,
            });
            fx.npc.push(npc_snapshot(session, now));
        }
    }

    if let Some(vote) = session.active_vote.as_mut() {
        vote.votes.remove(&player_id);
    }
    let (_, ending) = settle_vote(session, now, fx);
    if ending {
        let speaker = session.speaker;
        finish(table, session_id, EndKind::Completed, speaker, now, fx);
        return true;
    }
    false
}

pub struct DialogCoordinator {
    config: DialogConfig,
    clock: SharedClock,
    bus: Arc<EventBus>,
    outbox: Outbox,
    table: Mutex<DialogTable>,
    npc_states: Mutex<HashMap<u32, NpcDialogState>>,
    positions: RwLock<HashMap<u32, Position>>,
    history: Mutex<HashMap<u32, VecDeque<HistoryEntry>>>,
    checkpoints: Mutex<HashMap<u32, DialogSession>>,
    stats: Mutex<DialogStats>,
    skills: RwLock<Arc<dyn SkillProvider>>,
    quests: RwLock<Option<Arc<dyn QuestGate>>>,
}

impl DialogCoordinator {
    pub fn new(config: DialogConfig, clock: SharedClock, bus: Arc<EventBus>, outbox: Outbox) -> Self {
        Self {
            config,
            clock,
            bus,
            outbox,
            table: Mutex::new(DialogTable::default()),
            npc_states: Mutex::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            checkpoints: Mutex::new(HashMap::new()),
            stats: Mutex::new(DialogStats::default()),
            skills: RwLock::new(Arc::new(PermissiveSkills)),
            quests: RwLock::new(None),
        }
    }

    pub fn set_skill_provider(&self, provider: Arc<dyn SkillProvider>) {
        *write(&self.skills) = provider;
    }

    pub fn set_quest_gate(&self, gate: Arc<dyn QuestGate>) {
        *write(&self.quests) = Some(gate);
    }

    pub fn config(&self) -> &DialogConfig {
        &self.config
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn positions_snapshot(&self) -> HashMap<u32, Position> {
        read(&self.positions).clone()
    }

    fn flush(&self, fx: Effects) {
        if !fx.npc.is_empty() {
            let mut npc_states = lock(&self.npc_states);
            for state in fx.npc {
                npc_states.insert(state.npc_id, state);
            }
        }

        if self.config.record_history && !fx.history.is_empty() {
            let now = self.now();
            let mut history = lock(&self.history);
            for (session_id, action, detail) in fx.history {
                let entries = history.entry(session_id).or_default();
                entries.push_back(HistoryEntry {
                    timestamp: now,
                    action,
                    detail,
                });
                while entries.len() > self.config.max_history_entries {
                    entries.pop_front();
                }
            }
        }

        if !fx.ended.is_empty() {
            let mut history = lock(&self.history);
            let mut checkpoints = lock(&self.checkpoints);
            for session_id in &fx.ended {
                history.remove(session_id);
                checkpoints.remove(session_id);
            }
        }

        {
            let mut stats = lock(&self.stats);
            stats.total_dialogs += fx.stats.total_dialogs;
            stats.completed_dialogs += fx.stats.completed_dialogs;
            stats.interrupted_dialogs += fx.stats.interrupted_dialogs;
            stats.total_votes += fx.stats.total_votes;
            stats.passed_votes += fx.stats.passed_votes;
            stats.failed_votes += fx.stats.failed_votes;
            stats.timeout_votes += fx.stats.timeout_votes;
        }

        self.outbox.send_all(fx.decisions);
        self.bus.publish_all(fx.events);
    }

    // ---- session lifecycle --------------------------------------------

    /// Opens a conversation with `npc_id`. Without an explicit mode,
    /// quest-linked dialogs use `Quest` and others the configured default.
    pub fn start_dialog(
        &self,
        npc_id: u32,
        speaker_id: u32,
        quest_hash: u32,
        sync_mode: Option<DialogSyncMode>,
    ) -> CoreResult<u32> {
        let now = self.now();
        let mode = sync_mode.unwrap_or(if quest_hash != 0 {
            DialogSyncMode::Quest
        } else {
            self.config.default_sync_mode
        });

        let mut fx = Effects::default();
        let session_id = {
            let mut table = lock(&self.table);
            if table.by_npc.contains_key(&npc_id) {
                return Err(CoreError::PreconditionFailed(format!(
                    "NPC {} is already in a dialog",
                    npc_id
                )));
            }
            let session_id = table.allocate_session_id();

            let mut participants = BTreeMap::new();
            participants.insert(
                speaker_id,
                DialogParticipant {
                    player_id: speaker_id,
                    role: DialogRole::Speaker,
                    can_vote: true,
                    has_voted: false,
                    voted_choice: 0,
                    distance_to_speaker: 0.0,
                    meets_requirements: true,
                    joined_at: now,
                    last_activity: now,
                },
            );
            let session = DialogSession {
                session_id,
                npc_id,
                quest_hash,
                sync_mode: mode,
                state: DialogState::Starting,
                speaker: speaker_id,
                participants,
                choices: Vec::new(),
                active_vote: None,
                last_vote_result: None,
                current_choice: 0,
                started_at: now,
                last_activity: now,
            };

            fx.send(
                &session,
                speaker_id,
                WirePacket::DialogStart(wire::DialogStart {
                    session_id,
                    npc_id,
                    speaker_id,
                    quest_hash,
                    sync_mode: mode.as_u8(),
                    timestamp: now,
                }),
            );
            fx.npc.push(npc_snapshot(&session, now));
            table.sessions.insert(session_id, session);
            table.by_npc.insert(npc_id, session_id);
            session_id
        };

        info!(
            "Started dialog {} with NPC {} (speaker {}, {} mode)",
            session_id,
            npc_id,
            speaker_id,
            mode.name()
        );
        fx.stats.total_dialogs += 1;
        fx.events.push(CoreEvent::DialogStarted {
            session_id,
            npc_id,
            speaker_id,
            quest_hash,
        });
        fx.note(
            session_id,
            "dialog_started",
            format!("npc:{},speaker:{},quest:{}", npc_id, speaker_id, quest_hash),
        );
        self.flush(fx);
        Ok(session_id)
    }

    /// `Starting -> Active`.
    pub fn activate_dialog(&self, session_id: u32) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            if session.state != DialogState::Starting {
                return Err(CoreError::PreconditionFailed(format!(
                    "dialog {} is {:?}, not Starting",
                    session_id, session.state
                )));
            }
            Self::activate(session, now, &mut fx);
        }
        self.flush(fx);
        Ok(())
    }

    fn activate(session: &mut DialogSession, now: u64, fx: &mut Effects) {
        session.state = DialogState::Active;
        session.last_activity = now;
        let speaker = session.speaker;
        fx.send(session, speaker, state_update(session, now));
        fx.npc.push(npc_snapshot(session, now));
        fx.events.push(CoreEvent::DialogActivated {
            session_id: session.session_id,
        });
        debug!("Dialog {} is active", session.session_id);
    }

    /// Ends a session. Without `force` an in-flight vote blocks the end.
    pub fn end_dialog(&self, session_id: u32, force: bool) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            if !force && session.active_vote.is_some() {
                return Err(CoreError::PreconditionFailed(format!(
                    "dialog {} has a vote in progress",
                    session_id
                )));
            }
            let speaker = session.speaker;
            let kind = if force {
                EndKind::Interrupted
            } else {
                EndKind::Completed
            };
            finish(&mut table, session_id, kind, speaker, now, &mut fx);
        }
        self.flush(fx);
        Ok(())
    }

    /// Force-ends a session on behalf of one of its participants.
    pub fn interrupt_dialog(&self, session_id: u32, player_id: u32) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            if !session.participants.contains_key(&player_id) {
                return Err(CoreError::PermissionDenied(format!(
                    "player {} is not in dialog {}",
                    player_id, session_id
                )));
            }
            finish(&mut table, session_id, EndKind::Interrupted, player_id, now, &mut fx);
        }
        warn!("Dialog {} interrupted by player {}", session_id, player_id);
        self.flush(fx);
        Ok(())
    }

    // ---- participants -------------------------------------------------

    pub fn add_participant(&self, session_id: u32, player_id: u32, role: DialogRole) -> CoreResult<()> {
        if role == DialogRole::Speaker {
            return Err(CoreError::InvalidArgument(
                "the speaker role is assigned by transfer".to_string(),
            ));
        }
        let now = self.now();
        let positions = self.positions_snapshot();
        let range = self.config.proximity_range;
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            if matches!(session.state, DialogState::Ending | DialogState::Interrupted) {
                return Err(CoreError::PreconditionFailed(format!(
                    "dialog {} is closing",
                    session_id
                )));
            }
            if session.participants.contains_key(&player_id) {
                return Err(CoreError::PreconditionFailed(format!(
                    "player {} is already in dialog {}",
                    player_id, session_id
                )));
            }
            if session.participants.len() >= self.config.max_participants {
                return Err(CoreError::Capacity(format!(
                    "dialog {} has reached {} participants",
                    session_id, self.config.max_participants
                )));
            }

            let distance = vote::distance(
                positions.get(&player_id).copied(),
                positions.get(&session.speaker).copied(),
            );
            if !within_range(session.sync_mode, distance, range) {
                debug!(
                    "Player {} is {:.1} m from the speaker of dialog {} (range {})",
                    player_id, distance, session_id, range
                );
                return Err(CoreError::PreconditionFailed(format!(
                    "player {} is out of range ({:.1} > {})",
                    player_id, distance, range
                )));
            }
            if role == DialogRole::Listener
                && !self.config.allow_spectators
                && session.participants.len() >= 2
            {
                return Err(CoreError::PreconditionFailed(
                    "spectators are not allowed".to_string(),
                ));
            }

            session.participants.insert(
                player_id,
                DialogParticipant {
                    player_id,
                    role,
                    can_vote: role.is_active(),
                    has_voted: false,
                    voted_choice: 0,
                    distance_to_speaker: distance,
                    meets_requirements: true,
                    joined_at: now,
                    last_activity: now,
                },
            );
            session.last_activity = now;

            fx.decisions.push(AuthoritativeDecision::to_player(
                player_id,
                WirePacket::DialogStart(wire::DialogStart {
                    session_id,
                    npc_id: session.npc_id,
                    speaker_id: session.speaker,
                    quest_hash: session.quest_hash,
                    sync_mode: session.sync_mode.as_u8(),
                    timestamp: now,
                }),
            ));
        }

        debug!("Added player {} to dialog {} as {}", player_id, session_id, role.name());
        fx.events.push(CoreEvent::ParticipantAdded {
            session_id,
            player_id,
            role: role.name().to_string(),
        });
        fx.note(
            session_id,
            "participant_added",
            format!("player:{},role:{}", player_id, role.name()),
        );
        self.flush(fx);
        Ok(())
    }

    pub fn remove_participant(&self, session_id: u32, player_id: u32) -> CoreResult<()> {
        let now = self.now();
        let positions = self.positions_snapshot();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            if !session.participants.contains_key(&player_id) {
                return Err(CoreError::not_found("dialog participant", player_id));
            }
            detach_player(
                &mut table,
                session_id,
                player_id,
                &positions,
                self.config.proximity_range,
                now,
                &mut fx,
            );
        }
        self.flush(fx);
        Ok(())
    }

    /// Removes a departed player from every dialog; returns how many
    /// sessions they were in.
    pub fn remove_player(&self, player_id: u32) -> usize {
        let now = self.now();
        let positions = self.positions_snapshot();
        let mut fx = Effects::default();
        let affected = {
            let mut table = lock(&self.table);
            let mut ids: Vec<u32> = table
                .sessions
                .values()
                .filter(|s| s.participants.contains_key(&player_id))
                .map(|s| s.session_id)
                .collect();
            ids.sort_unstable();
            for session_id in &ids {
                detach_player(
                    &mut table,
                    *session_id,
                    player_id,
                    &positions,
                    self.config.proximity_range,
                    now,
                    &mut fx,
                );
            }
            ids.len()
        };
        write(&self.positions).remove(&player_id);
        self.flush(fx);
        affected
    }

    pub fn update_participant_role(&self, session_id: u32, player_id: u32, role: DialogRole) -> CoreResult<()> {
        if role == DialogRole::Speaker {
            return Err(CoreError::InvalidArgument(
                "use transfer_speaker_role to change the speaker".to_string(),
            ));
        }
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            if session.speaker == player_id {
                return Err(CoreError::PreconditionFailed(
                    "the speaker's role changes only by transfer".to_string(),
                ));
            }
            let participant = session
                .participants
                .get_mut(&player_id)
                .ok_or_else(|| CoreError::not_found("dialog participant", player_id))?;
            participant.role = role;
            participant.can_vote = role.is_active() && participant.meets_requirements;
            participant.last_activity = now;
            fx.note(
                session_id,
                "role_changed",
                format!("player:{},role:{}", player_id, role.name()),
            );
            // A demoted voter may make the vote undecidable.
            let (_, ending) = settle_vote(session, now, &mut fx);
            if ending {
                let speaker = session.speaker;
                finish(&mut table, session_id, EndKind::Completed, speaker, now, &mut fx);
            }
        }
        self.flush(fx);
        Ok(())
    }

    pub fn transfer_speaker_role(&self, session_id: u32, new_speaker: u32) -> CoreResult<()> {
        let now = self.now();
        let positions = self.positions_snapshot();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            if !session.participants.contains_key(&new_speaker) {
                return Err(CoreError::not_found("dialog participant", new_speaker));
            }
            let old = session.speaker;
            if old == new_speaker {
                return Ok(());
            }
            if let Some(previous) = session.participants.get_mut(&old) {
                previous.role = DialogRole::Participant;
            }
            if let Some(next) = session.participants.get_mut(&new_speaker) {
                next.role = DialogRole::Speaker;
            }
            session.speaker = new_speaker;
            session.last_activity = now;
            refresh_distances(session, &positions, self.config.proximity_range);
            fx.npc.push(npc_snapshot(session, now));
            fx.events.push(CoreEvent::SpeakerChanged {
                session_id,
                old_speaker: old,
                new_speaker,
            });
            fx.note(session_id, "speaker_changed", format!("from:{},to:{}", old, new_speaker));
            info!("Dialog {}: speaker {} -> {}", session_id, old, new_speaker);
        }
        self.flush(fx);
        Ok(())
    }

    pub fn get_participants(&self, session_id: u32) -> CoreResult<Vec<DialogParticipant>> {
        let table = lock(&self.table);
        table
            .sessions
            .get(&session_id)
            .map(|s| s.participants.values().cloned().collect())
            .ok_or_else(|| CoreError::not_found("dialog session", session_id))
    }

    // ---- positions ----------------------------------------------------

    pub fn update_player_position(&self, player_id: u32, x: f32, y: f32, z: f32) -> CoreResult<()> {
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return Err(CoreError::InvalidArgument(format!(
                "position of player {} is not finite",
                player_id
            )));
        }
        write(&self.positions).insert(player_id, [x, y, z]);

        let positions = self.positions_snapshot();
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            for session in table.sessions.values_mut() {
                if !session.participants.contains_key(&player_id) {
                    continue;
                }
                refresh_distances(session, &positions, self.config.proximity_range);
                let (outcome, _) = if session.active_vote.is_some() {
                    settle_vote(session, now, &mut fx)
                } else {
                    (Tally::Pending, false)
                };
                if outcome != Tally::Pending {
                    debug!("Dialog {} vote settled after a position update", session.session_id);
                }
            }
        }
        self.flush(fx);
        Ok(())
    }

    pub fn player_position(&self, player_id: u32) -> Option<Position> {
        read(&self.positions).get(&player_id).copied()
    }

    /// Distance from `player_id` to the speaker of the session.
    pub fn check_proximity_requirement(&self, session_id: u32, player_id: u32) -> CoreResult<bool> {
        let speaker = {
            let table = lock(&self.table);
            let session = table
                .sessions
                .get(&session_id)
                .ok_or_else(|| CoreError::not_found("dialog session", session_id))?;
            if session.sync_mode != DialogSyncMode::Proximity {
                return Ok(true);
            }
            session.speaker
        };
        let positions = read(&self.positions);
        let distance = vote::distance(
            positions.get(&player_id).copied(),
            positions.get(&speaker).copied(),
        );
        Ok(distance <= self.config.proximity_range)
    }

    // ---- choices ------------------------------------------------------

    pub fn register_dialog_choice(&self, session_id: u32, choice: DialogChoice) -> CoreResult<()> {
        if choice.text.is_empty() || choice.text.len() > MAX_CHOICE_TEXT {
            return Err(CoreError::InvalidArgument(format!(
                "choice text must be 1-{} bytes",
                MAX_CHOICE_TEXT
            )));
        }
        let mut table = lock(&self.table);
        let session = table.session_mut(session_id)?;
        if matches!(session.state, DialogState::Ending | DialogState::Interrupted) {
            return Err(CoreError::PreconditionFailed(format!(
                "dialog {} is closing",
                session_id
            )));
        }
        if session.choice(choice.choice_id).is_some() {
            return Err(CoreError::PreconditionFailed(format!(
                "choice {} is already registered",
                choice.choice_id
            )));
        }
        debug!("Dialog {}: registered choice {}", session_id, choice.choice_id);
        session.choices.push(choice);
        Ok(())
    }

    fn meets_requirements(&self, player_id: u32, choice: &DialogChoice) -> bool {
        if self.config.enable_skill_checks
            && (choice.required_skill != 0 || choice.required_level != 0)
            && !read(&self.skills).meets_skill(player_id, choice.required_skill, choice.required_level)
        {
            return false;
        }
        if self.config.enable_quest_requirements && choice.quest_prerequisite != 0 {
            let gate = read(&self.quests).clone();
            if let Some(gate) = gate {
                return gate.can_start_quest(choice.quest_prerequisite, player_id);
            }
        }
        true
    }

    /// Choices the player currently satisfies the requirements for.
    pub fn get_available_choices(&self, session_id: u32, player_id: u32) -> CoreResult<Vec<DialogChoice>> {
        let choices = {
            let table = lock(&self.table);
            table
                .sessions
                .get(&session_id)
                .map(|s| s.choices.clone())
                .ok_or_else(|| CoreError::not_found("dialog session", session_id))?
        };
        Ok(choices
            .into_iter()
            .filter(|c| self.meets_requirements(player_id, c))
            .collect())
    }

    pub fn validate_choice(&self, session_id: u32, player_id: u32, choice_id: u32) -> CoreResult<()> {
        let choice = {
            let table = lock(&self.table);
            let session = table
                .sessions
                .get(&session_id)
                .ok_or_else(|| CoreError::not_found("dialog session", session_id))?;
            session
                .choice(choice_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found("dialog choice", choice_id))?
        };
        if self.meets_requirements(player_id, &choice) {
            Ok(())
        } else {
            Err(CoreError::PreconditionFailed(format!(
                "player {} does not meet the requirements of choice {}",
                player_id, choice_id
            )))
        }
    }

    pub fn select_dialog_choice(&self, session_id: u32, player_id: u32, choice_id: u32) -> CoreResult<ChoiceOutcome> {
        self.validate_choice(session_id, player_id, choice_id)?;

        let now = self.now();
        let vote_timeout_ms = self.config.vote_timeout_secs.saturating_mul(1_000);
        let mut fx = Effects::default();
        let outcome = {
            let mut table = lock(&self.table);
            let vote_id = table.allocate_vote_id();
            let session = table.session_mut(session_id)?;
            let role = session
                .participants
                .get(&player_id)
                .map(|p| p.role)
                .ok_or_else(|| {
                    CoreError::PermissionDenied(format!(
                        "player {} is not in dialog {}",
                        player_id, session_id
                    ))
                })?;
            if !role.is_active() {
                return Err(CoreError::PermissionDenied(format!(
                    "a {} cannot pick choices",
                    role.name()
                )));
            }
            if session.state != DialogState::Active {
                return Err(CoreError::PreconditionFailed(format!(
                    "dialog {} is {:?}",
                    session_id, session.state
                )));
            }
            let choice = session
                .choice(choice_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found("dialog choice", choice_id))?;

            if vote::needs_vote(session.sync_mode, role, &choice) {
                let eligible = session.eligible_voters();
                if eligible == 0 {
                    return Err(CoreError::PreconditionFailed(format!(
                        "dialog {} has no eligible voters",
                        session_id
                    )));
                }
                let required = vote::required_votes(session.sync_mode, eligible);
                let mut votes = BTreeMap::new();
                votes.insert(player_id, true);
                session.active_vote = Some(ChoiceVote {
                    vote_id,
                    choice_id,
                    initiator: player_id,
                    status: VoteStatus::InProgress,
                    votes,
                    started_at: now,
                    deadline: now.saturating_add(vote_timeout_ms),
                    required,
                });
                session.state = DialogState::AwaitingChoice;
                session.last_activity = now;
                if let Some(participant) = session.participants.get_mut(&player_id) {
                    participant.has_voted = true;
                    participant.voted_choice = choice_id;
                    participant.last_activity = now;
                }

                fx.stats.total_votes += 1;
                fx.send(
                    session,
                    player_id,
                    WirePacket::DialogVote(wire::DialogVote {
                        session_id,
                        vote_id,
                        player_id,
                        choice_id,
                        approve: true,
                        timestamp: now,
                    }),
                );
                fx.send(session, player_id, state_update(session, now));
                fx.npc.push(npc_snapshot(session, now));
                fx.events.push(CoreEvent::VoteStarted {
                    session_id,
                    choice_id,
                    initiator: player_id,
                    required,
                });
                info!(
                    "Dialog {}: vote {} on choice {} (required {}/{})",
                    session_id, vote_id, choice_id, required, eligible
                );

                match settle_vote(session, now, &mut fx) {
                    (Tally::Pending, _) => ChoiceOutcome::VoteOpened { vote_id, required },
                    (_, true) => {
                        finish(&mut table, session_id, EndKind::Completed, player_id, now, &mut fx);
                        ChoiceOutcome::Ended
                    }
                    _ => ChoiceOutcome::Applied,
                }
            } else if apply_choice(session, player_id, &choice, now, &mut fx) {
                finish(&mut table, session_id, EndKind::Completed, player_id, now, &mut fx);
                ChoiceOutcome::Ended
            } else {
                ChoiceOutcome::Applied
            }
        };
        self.flush(fx);
        Ok(outcome)
    }

    // ---- voting -------------------------------------------------------

    pub fn cast_vote(&self, session_id: u32, player_id: u32, approve: bool) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            let eligible = session
                .participants
                .get(&player_id)
                .map_or(false, |p| p.is_eligible_voter());
            let vote = session.active_vote.as_mut().ok_or_else(|| {
                CoreError::PreconditionFailed(format!("dialog {} has no active vote", session_id))
            })?;
            if !eligible {
                return Err(CoreError::PermissionDenied(format!(
                    "player {} cannot vote in dialog {}",
                    player_id, session_id
                )));
            }
            if vote.votes.contains_key(&player_id) {
                return Err(CoreError::PreconditionFailed(format!(
                    "player {} already voted",
                    player_id
                )));
            }
            vote.votes.insert(player_id, approve);
            let (vote_id, choice_id, yes, required) =
                (vote.vote_id, vote.choice_id, vote.yes_count(), vote.required);

            if let Some(participant) = session.participants.get_mut(&player_id) {
                participant.has_voted = true;
                participant.voted_choice = if approve { choice_id } else { 0 };
                participant.last_activity = now;
            }
            session.last_activity = now;
            debug!(
                "Player {} voted {} on choice {} in dialog {} ({}/{})",
                player_id,
                if approve { "yes" } else { "no" },
                choice_id,
                session_id,
                yes,
                required
            );

            fx.send(
                session,
                player_id,
                WirePacket::DialogVote(wire::DialogVote {
                    session_id,
                    vote_id,
                    player_id,
                    choice_id,
                    approve,
                    timestamp: now,
                }),
            );
            fx.events.push(CoreEvent::VoteCast {
                session_id,
                player_id,
                approve,
                yes,
                required,
            });

            let (_, ending) = settle_vote(session, now, &mut fx);
            if ending {
                let initiator = session.speaker;
                finish(&mut table, session_id, EndKind::Completed, initiator, now, &mut fx);
            }
        }
        self.flush(fx);
        Ok(())
    }

    pub fn cancel_vote(&self, session_id: u32) -> CoreResult<()> {
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            let vote = session.active_vote.take().ok_or_else(|| {
                CoreError::PreconditionFailed(format!("dialog {} has no active vote", session_id))
            })?;
            clear_ballots(session);
            session.state = DialogState::Active;
            session.last_vote_result = Some(VoteStatus::Failed);
            let speaker = session.speaker;
            fx.send(session, speaker, state_update(session, now));
            fx.npc.push(npc_snapshot(session, now));
            fx.events.push(CoreEvent::VoteCancelled {
                session_id,
                choice_id: vote.choice_id,
            });
            info!("Dialog {}: vote on choice {} cancelled", session_id, vote.choice_id);
        }
        self.flush(fx);
        Ok(())
    }

    /// `InProgress` while a vote runs, else the result of the last vote.
    pub fn get_vote_status(&self, session_id: u32) -> CoreResult<VoteStatus> {
        let table = lock(&self.table);
        let session = table
            .sessions
            .get(&session_id)
            .ok_or_else(|| CoreError::not_found("dialog session", session_id))?;
        Ok(match &session.active_vote {
            Some(vote) => vote.status,
            None => session.last_vote_result.unwrap_or(VoteStatus::Pending),
        })
    }

    // ---- queries ------------------------------------------------------

    pub fn get_dialog_session(&self, session_id: u32) -> Option<DialogSession> {
        lock(&self.table).sessions.get(&session_id).cloned()
    }

    pub fn get_active_dialog(&self, npc_id: u32) -> Option<DialogSession> {
        let table = lock(&self.table);
        table
            .by_npc
            .get(&npc_id)
            .and_then(|id| table.sessions.get(id))
            .cloned()
    }

    pub fn is_npc_in_dialog(&self, npc_id: u32) -> bool {
        lock(&self.table).by_npc.contains_key(&npc_id)
    }

    pub fn get_npc_state(&self, npc_id: u32) -> NpcDialogState {
        lock(&self.npc_states)
            .get(&npc_id)
            .cloned()
            .unwrap_or_else(|| NpcDialogState::idle(npc_id))
    }

    pub fn get_active_dialog_sessions(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = lock(&self.table).sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn get_active_dialog_count(&self) -> usize {
        lock(&self.table).sessions.len()
    }

    pub fn stats(&self) -> DialogStats {
        let active = self.get_active_dialog_count();
        let mut stats = lock(&self.stats).clone();
        stats.active_dialogs = active;
        stats
    }

    pub fn get_dialog_history(&self, session_id: u32) -> Vec<HistoryEntry> {
        lock(&self.history)
            .get(&session_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ---- checkpoints --------------------------------------------------

    /// Keeps one snapshot per session, replacing any earlier one.
    pub fn create_dialog_checkpoint(&self, session_id: u32) -> CoreResult<()> {
        let snapshot = self
            .get_dialog_session(session_id)
            .ok_or_else(|| CoreError::not_found("dialog session", session_id))?;
        lock(&self.checkpoints).insert(session_id, snapshot);
        debug!("Checkpointed dialog {}", session_id);
        Ok(())
    }

    pub fn restore_dialog_checkpoint(&self, session_id: u32) -> CoreResult<()> {
        let snapshot = lock(&self.checkpoints)
            .remove(&session_id)
            .ok_or_else(|| CoreError::not_found("checkpoint for dialog", session_id))?;
        let now = self.now();
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let session = table.session_mut(session_id)?;
            *session = snapshot;
            session.last_activity = now;
            let speaker = session.speaker;
            fx.send(session, speaker, state_update(session, now));
            fx.npc.push(npc_snapshot(session, now));
            fx.note(session_id, "checkpoint_restored", String::new());
        }
        info!("Dialog {} restored from checkpoint", session_id);
        self.flush(fx);
        Ok(())
    }

    // ---- scheduling ---------------------------------------------------

    /// Activates new sessions, ends idle ones and fails expired votes.
    pub fn tick(&self) {
        let now = self.now();
        let idle_limit = self.config.dialog_timeout_secs.saturating_mul(1_000);
        let mut fx = Effects::default();
        {
            let mut table = lock(&self.table);
            let mut ids: Vec<u32> = table.sessions.keys().copied().collect();
            ids.sort_unstable();

            for session_id in ids {
                let Some(session) = table.sessions.get_mut(&session_id) else {
                    continue;
                };

                if session.state == DialogState::Starting {
                    Self::activate(session, now, &mut fx);
                    continue;
                }

                let idle = matches!(session.state, DialogState::Active | DialogState::AwaitingChoice)
                    && now.saturating_sub(session.last_activity) > idle_limit;
                if idle {
                    warn!("Dialog {} timed out", session_id);
                    let speaker = session.speaker;
                    finish(&mut table, session_id, EndKind::Timeout, speaker, now, &mut fx);
                    fx.events.push(CoreEvent::DialogTimeout {
                        session_id,
                        reason: EndKind::Timeout.text().to_string(),
                    });
                }
            }
        }
        self.flush(fx);
        self.process_vote_timeouts();
    }

    /// Fails every vote whose deadline has passed; returns how many.
    ///
    /// Safe to call from a background scan as well as from [`tick`](Self::tick).
    pub fn process_vote_timeouts(&self) -> usize {
        let now = self.now();
        let mut fx = Effects::default();
        let mut expired_votes = 0;
        {
            let mut table = lock(&self.table);
            let mut ids: Vec<u32> = table
                .sessions
                .values()
                .filter(|s| s.active_vote.as_ref().map_or(false, |v| now >= v.deadline))
                .map(|s| s.session_id)
                .collect();
            ids.sort_unstable();

            for session_id in ids {
                let Some(session) = table.sessions.get_mut(&session_id) else {
                    continue;
                };
                let Some(mut vote) = session.active_vote.take() else {
                    continue;
                };
                vote.status = VoteStatus::Timeout;
                clear_ballots(session);
                session.state = DialogState::Active;
                session.last_vote_result = Some(VoteStatus::Timeout);
                warn!(
                    "Dialog {}: vote on choice {} timed out ({}/{} yes)",
                    session_id,
                    vote.choice_id,
                    vote.yes_count(),
                    vote.required
                );
                expired_votes += 1;
                fx.stats.timeout_votes += 1;
                let speaker = session.speaker;
                fx.send(session, speaker, state_update(session, now));
                fx.npc.push(npc_snapshot(session, now));
                fx.events.push(CoreEvent::VoteTimeout {
                    session_id,
                    choice_id: vote.choice_id,
                });
                fx.events.push(CoreEvent::VoteCompleted {
                    session_id,
                    choice_id: vote.choice_id,
                    passed: false,
                });
                fx.note(session_id, "vote_timeout", format!("choice:{}", vote.choice_id));
            }
        }
        self.flush(fx);
        expired_votes
    }
}
