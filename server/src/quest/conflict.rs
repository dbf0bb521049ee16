//! Stage divergence between players of one quest.

use super::types::{QuestRecord, QuestSyncMode, QuestType};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestConflict {
    pub conflict_id: u32,
    pub quest_hash: u32,
    /// stage -> players at that stage, both ascending
    pub groups: BTreeMap<u16, Vec<u32>>,
    pub detected_at: u64,
}

impl QuestConflict {
    pub fn stages(&self) -> Vec<u16> {
        self.groups.keys().copied().collect()
    }

    /// Players ordered by stage, then id.
    pub fn affected_players(&self) -> Vec<u32> {
        self.groups.values().flatten().copied().collect()
    }

    pub fn first_affected(&self) -> Option<u32> {
        self.groups.values().flatten().next().copied()
    }

    pub fn min_stage(&self) -> u16 {
        self.groups.keys().next().copied().unwrap_or(0)
    }

    pub fn max_stage(&self) -> u16 {
        self.groups.keys().next_back().copied().unwrap_or(0)
    }
}

/// Groups players by stage when they disagree. Individual quests, quests
/// with fewer than two players and quests with a vote in flight never
/// conflict.
pub fn stage_groups(record: &QuestRecord) -> Option<BTreeMap<u16, Vec<u32>>> {
    if record.sync_mode == QuestSyncMode::Individual
        || record.players.len() < 2
        || record.active_vote.is_some()
    {
        return None;
    }
    let mut groups: BTreeMap<u16, Vec<u32>> = BTreeMap::new();
    for (player_id, progress) in &record.players {
        groups.entry(progress.current_stage).or_default().push(*player_id);
    }
    if groups.len() > 1 {
        Some(groups)
    } else {
        None
    }
}

/// Main quests advance everyone; others adopt the most populated stage,
/// preferring the higher stage on a tie.
pub fn auto_resolve_stage(quest_type: QuestType, conflict: &QuestConflict) -> u16 {
    if quest_type == QuestType::Main {
        return conflict.max_stage();
    }
    conflict
        .groups
        .iter()
        .max_by(|(stage_a, a), (stage_b, b)| a.len().cmp(&b.len()).then(stage_a.cmp(stage_b)))
        .map(|(stage, _)| *stage)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quest::types::{PlayerProgress, QuestPriority};

    fn record_with(stages: &[(u32, u16)], mode: QuestSyncMode) -> QuestRecord {
        let mut record = QuestRecord::new(9, "q", QuestType::Side, QuestPriority::Medium, mode);
        for (player, stage) in stages {
            record.players.insert(
                *player,
                PlayerProgress {
                    current_stage: *stage,
                    ..Default::default()
                },
            );
        }
        record
    }

    fn conflict(record: &QuestRecord) -> QuestConflict {
        QuestConflict {
            conflict_id: 1,
            quest_hash: record.quest_hash,
            groups: stage_groups(record).unwrap(),
            detected_at: 0,
        }
    }

    #[test]
    fn test_groups_and_first_affected() {
        let record = record_with(&[(3, 4), (2, 3), (1, 3)], QuestSyncMode::Strict);
        let c = conflict(&record);
        assert_eq!(c.stages(), vec![3, 4]);
        assert_eq!(c.affected_players(), vec![1, 2, 3]);
        assert_eq!(c.first_affected(), Some(1));
        assert_eq!((c.min_stage(), c.max_stage()), (3, 4));
    }

    #[test]
    fn test_no_conflict_cases() {
        assert!(stage_groups(&record_with(&[(1, 3), (2, 3)], QuestSyncMode::Strict)).is_none());
        assert!(stage_groups(&record_with(&[(1, 3)], QuestSyncMode::Strict)).is_none());
        assert!(stage_groups(&record_with(&[(1, 3), (2, 4)], QuestSyncMode::Individual)).is_none());
    }

    #[test]
    fn test_auto_resolve() {
        let record = record_with(&[(1, 2), (2, 2), (3, 7)], QuestSyncMode::Majority);
        assert_eq!(auto_resolve_stage(QuestType::Side, &conflict(&record)), 2);
        assert_eq!(auto_resolve_stage(QuestType::Main, &conflict(&record)), 7);

        let tie = record_with(&[(1, 2), (2, 5)], QuestSyncMode::Majority);
        assert_eq!(auto_resolve_stage(QuestType::Gig, &conflict(&tie)), 5);
    }
}
