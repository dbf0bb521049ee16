//! Vote arithmetic and proximity math for dialog sessions.

use super::types::{ChoiceVote, DialogChoice, DialogRole, DialogSyncMode};

/// Distance assumed for a player whose position was never reported.
pub const UNKNOWN_DISTANCE: f32 = 1000.0;

pub type Position = [f32; 3];

pub fn distance(a: Option<Position>, b: Option<Position>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) => {
            let dx = a[0] - b[0];
            let dy = a[1] - b[1];
            let dz = a[2] - b[2];
            (dx * dx + dy * dy + dz * dz).sqrt()
        }
        _ => UNKNOWN_DISTANCE,
    }
}

/// Yes-votes required among `eligible` voters.
pub fn required_votes(mode: DialogSyncMode, eligible: usize) -> u32 {
    let n = eligible as u32;
    match mode {
        DialogSyncMode::Consensus => n,
        DialogSyncMode::Majority | DialogSyncMode::Proximity => n / 2 + 1,
        DialogSyncMode::Quest => ((n + 2) / 3).max(1),
        DialogSyncMode::Speaker | DialogSyncMode::Individual => 1,
    }
}

pub fn needs_vote(mode: DialogSyncMode, role: DialogRole, choice: &DialogChoice) -> bool {
    match mode {
        DialogSyncMode::Speaker => role != DialogRole::Speaker && choice.requires_consensus,
        DialogSyncMode::Majority | DialogSyncMode::Consensus | DialogSyncMode::Proximity => true,
        DialogSyncMode::Quest => choice.quest_critical,
        DialogSyncMode::Individual => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    Pending,
    Passed,
    Failed,
}

/// Passes once the requirement is met; fails once the outstanding eligible
/// voters can no longer meet it.
pub fn tally(vote: &ChoiceVote, eligible: &[u32]) -> Tally {
    let yes = vote.yes_count();
    if yes >= vote.required {
        return Tally::Passed;
    }
    let outstanding = eligible
        .iter()
        .filter(|p| !vote.votes.contains_key(*p))
        .count() as u32;
    if yes + outstanding < vote.required {
        Tally::Failed
    } else {
        Tally::Pending
    }
}
