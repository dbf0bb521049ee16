use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum QuestState {
    #[default]
    Inactive,
    Active,
    Completed,
    Failed,
    Suspended,
    Locked,
}

impl QuestState {
    pub fn as_u8(self) -> u8 {
        match self {
            QuestState::Inactive => 0,
            QuestState::Active => 1,
            QuestState::Completed => 2,
            QuestState::Failed => 3,
            QuestState::Suspended => 4,
            QuestState::Locked => 5,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QuestState::Inactive),
            1 => Some(QuestState::Active),
            2 => Some(QuestState::Completed),
            3 => Some(QuestState::Failed),
            4 => Some(QuestState::Suspended),
            5 => Some(QuestState::Locked),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QuestState::Completed | QuestState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuestType {
    Main,
    Side,
    Gig,
    Scanner,
    Romance,
    Corporate,
    Fixer,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QuestPriority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}

impl QuestPriority {
    /// Default priority for a quest category.
    pub fn for_type(quest_type: QuestType) -> Self {
        match quest_type {
            QuestType::Main => QuestPriority::Critical,
            QuestType::Romance => QuestPriority::High,
            QuestType::Side | QuestType::Custom => QuestPriority::Medium,
            QuestType::Gig | QuestType::Scanner | QuestType::Corporate | QuestType::Fixer => {
                QuestPriority::Low
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuestSyncMode {
    /// Everyone shares the authority stage, which only moves forward.
    Strict,
    Majority,
    /// No reconciliation; each player progresses alone.
    Individual,
    Leader,
    Consensus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictPolicy {
    RollbackAll,
    AdvanceAll,
    Vote,
    LeaderDecides,
    AutoResolve,
}

impl ConflictPolicy {
    pub fn for_type(quest_type: QuestType) -> Self {
        if quest_type == QuestType::Main {
            ConflictPolicy::Vote
        } else {
            ConflictPolicy::AutoResolve
        }
    }

    /// Wire code carried in `QuestConflictNotification::resolution_method`.
    pub fn as_u8(self) -> u8 {
        match self {
            ConflictPolicy::RollbackAll => 0,
            ConflictPolicy::AdvanceAll => 1,
            ConflictPolicy::Vote => 2,
            ConflictPolicy::LeaderDecides => 3,
            ConflictPolicy::AutoResolve => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConflictPolicy::RollbackAll => "RollbackAll",
            ConflictPolicy::AdvanceAll => "AdvanceAll",
            ConflictPolicy::Vote => "Vote",
            ConflictPolicy::LeaderDecides => "LeaderDecides",
            ConflictPolicy::AutoResolve => "AutoResolve",
        }
    }
}

/// Java-style string hash over the name's bytes, wrapping at 32 bits.
pub fn hash_quest_name(name: &str) -> u32 {
    name.bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestObjective {
    pub objective_id: u32,
    pub description: String,
    pub optional: bool,
    pub requires_all_players: bool,
    pub completed_by: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerProgress {
    pub current_stage: u16,
    pub state: QuestState,
    pub completed_objectives: BTreeSet<u32>,
    /// stage -> choice
    pub branch_choices: BTreeMap<u16, u32>,
    pub is_leader: bool,
    pub last_update: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestVoteState {
    pub target_stage: u16,
    pub initiator: u32,
    pub deadline: u64,
    pub votes: BTreeMap<u32, bool>,
    /// Set when the vote was opened to settle a detected conflict
    pub conflict_id: Option<u32>,
}

impl QuestVoteState {
    pub fn yes_count(&self) -> usize {
        self.votes.values().filter(|v| **v).count()
    }
}

/// Yes-votes a quest vote needs among `participants` players.
pub fn required_votes(participants: usize) -> usize {
    participants / 2 + 1
}

/// Authoritative record of one quest. Sync bookkeeping lives outside it so a
/// restored checkpoint equals the snapshot it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestRecord {
    pub quest_hash: u32,
    pub name: String,
    pub quest_type: QuestType,
    pub priority: QuestPriority,
    pub sync_mode: QuestSyncMode,
    pub conflict_policy: ConflictPolicy,
    pub story_critical: bool,
    pub authority_stage: u16,
    pub authority_state: QuestState,
    pub objectives: Vec<QuestObjective>,
    pub players: BTreeMap<u32, PlayerProgress>,
    pub prerequisites: BTreeSet<u32>,
    pub leader: Option<u32>,
    pub active_vote: Option<QuestVoteState>,
}

impl QuestRecord {
    pub fn new(
        quest_hash: u32,
        name: &str,
        quest_type: QuestType,
        priority: QuestPriority,
        sync_mode: QuestSyncMode,
    ) -> Self {
        Self {
            quest_hash,
            name: name.to_string(),
            quest_type,
            priority,
            sync_mode,
            conflict_policy: ConflictPolicy::for_type(quest_type),
            story_critical: false,
            authority_stage: 0,
            authority_state: QuestState::Inactive,
            objectives: Vec::new(),
            players: BTreeMap::new(),
            prerequisites: BTreeSet::new(),
            leader: None,
            active_vote: None,
        }
    }

    pub fn objective(&self, objective_id: u32) -> Option<&QuestObjective> {
        self.objectives.iter().find(|o| o.objective_id == objective_id)
    }

    pub fn has_objective(&self, objective_id: u32) -> bool {
        self.objective(objective_id).is_some()
    }

    /// Moves every player to the authority stage; returns how many moved.
    pub fn align_players(&mut self, now: u64) -> usize {
        let stage = self.authority_stage;
        let mut moved = 0;
        for progress in self.players.values_mut() {
            if progress.current_stage != stage {
                progress.current_stage = stage;
                progress.last_update = now;
                moved += 1;
            }
        }
        moved
    }

    pub fn set_leader(&mut self, leader: Option<u32>) {
        self.leader = leader;
        for (id, progress) in self.players.iter_mut() {
            progress.is_leader = Some(*id) == leader;
        }
    }
}
