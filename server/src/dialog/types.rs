use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DialogSyncMode {
    /// Only the speaker drives the conversation
    #[default]
    Speaker,
    Majority,
    Consensus,
    /// Membership limited to players near the speaker
    Proximity,
    /// Votes only on quest-critical choices
    Quest,
    Individual,
}

impl DialogSyncMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DialogSyncMode::Speaker => 0,
            DialogSyncMode::Majority => 1,
            DialogSyncMode::Consensus => 2,
            DialogSyncMode::Proximity => 3,
            DialogSyncMode::Quest => 4,
            DialogSyncMode::Individual => 5,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DialogSyncMode::Speaker),
            1 => Some(DialogSyncMode::Majority),
            2 => Some(DialogSyncMode::Consensus),
            3 => Some(DialogSyncMode::Proximity),
            4 => Some(DialogSyncMode::Quest),
            5 => Some(DialogSyncMode::Individual),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DialogSyncMode::Speaker => "Speaker",
            DialogSyncMode::Majority => "Majority",
            DialogSyncMode::Consensus => "Consensus",
            DialogSyncMode::Proximity => "Proximity",
            DialogSyncMode::Quest => "Quest",
            DialogSyncMode::Individual => "Individual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogRole {
    Speaker,
    Listener,
    Participant,
    Excluded,
}

impl DialogRole {
    /// Roles that may pick choices and vote.
    pub fn is_active(self) -> bool {
        matches!(self, DialogRole::Speaker | DialogRole::Participant)
    }

    pub fn name(self) -> &'static str {
        match self {
            DialogRole::Speaker => "Speaker",
            DialogRole::Listener => "Listener",
            DialogRole::Participant => "Participant",
            DialogRole::Excluded => "Excluded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogChoiceType {
    Normal,
    Skill,
    Romance,
    Aggressive,
    Passive,
    Quest,
    Ending,
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    Inactive,
    Starting,
    Active,
    AwaitingChoice,
    Processing,
    Ending,
    Interrupted,
}

impl DialogState {
    /// Code carried in `DialogStateUpdate::new_state`.
    pub fn as_u8(self) -> u8 {
        match self {
            DialogState::Inactive => 0,
            DialogState::Starting => 1,
            DialogState::Active => 2,
            DialogState::AwaitingChoice => 3,
            DialogState::Processing => 4,
            DialogState::Ending => 5,
            DialogState::Interrupted => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteStatus {
    Pending,
    InProgress,
    Passed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogChoice {
    pub choice_id: u32,
    pub text: String,
    pub choice_type: DialogChoiceType,
    /// 0 = none
    pub required_skill: u32,
    pub required_level: u32,
    /// Quest hash the picking player must be able to start; 0 = none
    pub quest_prerequisite: u32,
    pub requires_consensus: bool,
    pub quest_critical: bool,
    pub consequences: Vec<u32>,
}

impl DialogChoice {
    pub fn new(choice_id: u32, text: &str, choice_type: DialogChoiceType) -> Self {
        Self {
            choice_id,
            text: text.to_string(),
            choice_type,
            required_skill: 0,
            required_level: 0,
            quest_prerequisite: 0,
            requires_consensus: false,
            quest_critical: false,
            consequences: Vec::new(),
        }
    }

    pub fn consensus(mut self) -> Self {
        self.requires_consensus = true;
        self
    }

    pub fn quest_critical(mut self) -> Self {
        self.quest_critical = true;
        self
    }

    pub fn skill(mut self, skill: u32, level: u32) -> Self {
        self.required_skill = skill;
        self.required_level = level;
        self
    }

    pub fn requires_quest(mut self, quest_hash: u32) -> Self {
        self.quest_prerequisite = quest_hash;
        self
    }

    pub fn consequence(mut self, consequence_id: u32) -> Self {
        self.consequences.push(consequence_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogParticipant {
    pub player_id: u32,
    pub role: DialogRole,
    pub can_vote: bool,
    pub has_voted: bool,
    /// Choice the player approved in the current vote, 0 otherwise
    pub voted_choice: u32,
    pub distance_to_speaker: f32,
    pub meets_requirements: bool,
    pub joined_at: u64,
    pub last_activity: u64,
}

impl DialogParticipant {
    pub fn is_eligible_voter(&self) -> bool {
        self.can_vote && self.meets_requirements
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceVote {
    pub vote_id: u32,
    pub choice_id: u32,
    pub initiator: u32,
    pub status: VoteStatus,
    pub votes: BTreeMap<u32, bool>,
    pub started_at: u64,
    pub deadline: u64,
    pub required: u32,
}

impl ChoiceVote {
    pub fn yes_count(&self) -> u32 {
        self.votes.values().filter(|v| **v).count() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogSession {
    pub session_id: u32,
    pub npc_id: u32,
    /// 0 when the conversation is not tied to a quest
    pub quest_hash: u32,
    pub sync_mode: DialogSyncMode,
    pub state: DialogState,
    pub speaker: u32,
    pub participants: BTreeMap<u32, DialogParticipant>,
    pub choices: Vec<DialogChoice>,
    pub active_vote: Option<ChoiceVote>,
    pub last_vote_result: Option<VoteStatus>,
    pub current_choice: u32,
    pub started_at: u64,
    pub last_activity: u64,
}

impl DialogSession {
    pub fn choice(&self, choice_id: u32) -> Option<&DialogChoice> {
        self.choices.iter().find(|c| c.choice_id == choice_id)
    }

    pub fn eligible_voters(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.is_eligible_voter())
            .count()
    }

    pub fn speaker_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.role == DialogRole::Speaker)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpcDialogState {
    pub npc_id: u32,
    /// Session currently bound to the NPC, 0 when idle
    pub current_dialog: u32,
    pub current_choice: u32,
    pub state: DialogState,
    pub active_speaker: u32,
    pub last_update: u64,
}

impl NpcDialogState {
    pub fn idle(npc_id: u32) -> Self {
        Self {
            npc_id,
            current_dialog: 0,
            current_choice: 0,
            state: DialogState::Inactive,
            active_speaker: 0,
            last_update: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialogStats {
    pub total_dialogs: u64,
    pub completed_dialogs: u64,
    pub interrupted_dialogs: u64,
    pub total_votes: u64,
    pub passed_votes: u64,
    pub failed_votes: u64,
    pub timeout_votes: u64,
    pub active_dialogs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub action: &'static str,
    pub detail: String,
}
