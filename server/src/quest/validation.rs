use super::types::{QuestRecord, QuestSyncMode};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    StageMismatch { player_id: u32, stage: u16, authority: u16 },
    UnknownObjective { player_id: u32, objective_id: u32 },
    ExpiredVote { deadline: u64 },
    /// Warning only
    MissingPrerequisite { quest_hash: u32 },
}

impl ValidationIssue {
    pub fn is_warning(&self) -> bool {
        matches!(self, ValidationIssue::MissingPrerequisite { .. })
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::StageMismatch {
                player_id,
                stage,
                authority,
            } => write!(
                f,
                "player {} at stage {} but authority is {}",
                player_id, stage, authority
            ),
            ValidationIssue::UnknownObjective {
                player_id,
                objective_id,
            } => write!(
                f,
                "player {} completed unknown objective {}",
                player_id, objective_id
            ),
            ValidationIssue::ExpiredVote { deadline } => {
                write!(f, "vote expired at {}", deadline)
            }
            ValidationIssue::MissingPrerequisite { quest_hash } => {
                write!(f, "prerequisite {:#010x} is not registered", quest_hash)
            }
        }
    }
}

pub fn validate<F>(record: &QuestRecord, now: u64, is_registered: F) -> Vec<ValidationIssue>
where
    F: Fn(u32) -> bool,
{
    let mut issues = Vec::new();

    if record.sync_mode == QuestSyncMode::Strict {
        for (player_id, progress) in &record.players {
            if progress.current_stage != record.authority_stage {
                issues.push(ValidationIssue::StageMismatch {
                    player_id: *player_id,
                    stage: progress.current_stage,
                    authority: record.authority_stage,
                });
            }
        }
    }

    for (player_id, progress) in &record.players {
        for objective_id in &progress.completed_objectives {
            if !record.has_objective(*objective_id) {
                issues.push(ValidationIssue::UnknownObjective {
                    player_id: *player_id,
                    objective_id: *objective_id,
                });
            }
        }
    }

    if let Some(vote) = &record.active_vote {
        if vote.deadline < now {
            issues.push(ValidationIssue::ExpiredVote {
                deadline: vote.deadline,
            });
        }
    }

    for prerequisite in &record.prerequisites {
        if !is_registered(*prerequisite) {
            issues.push(ValidationIssue::MissingPrerequisite {
                quest_hash: *prerequisite,
            });
        }
    }

    issues
}

/// Fixes what `validate` reports, except missing prerequisites. Returns the
/// number of corrections made.
pub fn repair(record: &mut QuestRecord, now: u64) -> usize {
    let mut fixes = 0;

    if record.sync_mode == QuestSyncMode::Strict {
        fixes += record.align_players(now);
    }

    let known: Vec<u32> = record.objectives.iter().map(|o| o.objective_id).collect();
    for progress in record.players.values_mut() {
        let before = progress.completed_objectives.len();
        progress.completed_objectives.retain(|id| known.contains(id));
        fixes += before - progress.completed_objectives.len();
    }

    if record.active_vote.as_ref().map_or(false, |v| v.deadline < now) {
        record.active_vote = None;
        fixes += 1;
    }

    fixes
}
