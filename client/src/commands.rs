//! Text commands typed into the reference bridge, turned into host events.
//!
//! One command per line, words separated by whitespace:
//!
//! ```text
//! join <display-name>
//! leave
//! pos <x> <y> <z>
//! talk <npc-id> [quest-hash] [sync-mode]
//! choose <session-id> <choice-id>
//! vote <session-id> yes|no
//! stage <quest-hash> <stage>
//! state <quest-hash> <state-code>
//! objective <quest-hash> <objective-id>
//! branch <quest-hash> <stage> <choice>
//! quest-vote <quest-hash> yes|no
//! ```
//!
//! Numbers may be decimal or `0x`-prefixed hex. The acting player is always
//! the authenticated one.

use shared::{HostEvent, DEFAULT_DIALOG_SYNC_MODE};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("'{command}' expects {expected}")]
    Usage {
        command: &'static str,
        expected: &'static str,
    },

    #[error("'{0}' is not a valid number")]
    Number(String),

    #[error("expected yes or no, got '{0}'")]
    YesNo(String),
}

fn number<T: FromStr + TryFrom<u64>>(word: &str) -> Result<T, CommandError> {
    let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => word.parse::<u64>().ok(),
    };
    parsed
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| CommandError::Number(word.to_string()))
}

fn float(word: &str) -> Result<f32, CommandError> {
    word.parse::<f32>()
        .map_err(|_| CommandError::Number(word.to_string()))
}

fn yes_no(word: &str) -> Result<bool, CommandError> {
    match word.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Ok(true),
        "no" | "n" | "false" | "0" => Ok(false),
        _ => Err(CommandError::YesNo(word.to_string())),
    }
}

/// Parses one command line on behalf of `player_id`.
pub fn parse_command(line: &str, player_id: u32) -> Result<HostEvent, CommandError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&command, args)) = words.split_first() else {
        return Err(CommandError::Empty);
    };

    let usage = |command: &'static str, expected: &'static str| CommandError::Usage { command, expected };

    match command {
        "join" => {
            if args.is_empty() {
                return Err(usage("join", "a display name"));
            }
            Ok(HostEvent::PlayerJoin {
                player_id,
                display_name: args.join(" "),
            })
        }
        "leave" => Ok(HostEvent::PlayerLeave { player_id }),
        "pos" => match args {
            [x, y, z] => Ok(HostEvent::PositionUpdate {
                player_id,
                x: float(x)?,
                y: float(y)?,
                z: float(z)?,
            }),
            _ => Err(usage("pos", "<x> <y> <z>")),
        },
        "talk" => {
            let (npc, quest, mode) = match args {
                [npc] => (npc, None, None),
                [npc, quest] => (npc, Some(quest), None),
                [npc, quest, mode] => (npc, Some(quest), Some(mode)),
                _ => return Err(usage("talk", "<npc-id> [quest-hash] [sync-mode]")),
            };
            Ok(HostEvent::NpcDialogStart {
                npc_id: number(npc)?,
                speaker_id: player_id,
                quest_hash: quest.map(|q| number(q)).transpose()?.unwrap_or(0),
                sync_mode: mode
                    .map(|m| number(m))
                    .transpose()?
                    .unwrap_or(DEFAULT_DIALOG_SYNC_MODE),
            })
        }
        "choose" => match args {
            [session, choice] => Ok(HostEvent::DialogChoice {
                session_id: number(session)?,
                player_id,
                choice_id: number(choice)?,
            }),
            _ => Err(usage("choose", "<session-id> <choice-id>")),
        },
        "vote" => match args {
            [session, answer] => Ok(HostEvent::DialogVote {
                session_id: number(session)?,
                player_id,
                approve: yes_no(answer)?,
            }),
            _ => Err(usage("vote", "<session-id> yes|no")),
        },
        "stage" => match args {
            [quest, stage] => Ok(HostEvent::QuestStage {
                player_id,
                quest_hash: number(quest)?,
                new_stage: number(stage)?,
            }),
            _ => Err(usage("stage", "<quest-hash> <stage>")),
        },
        "state" => match args {
            [quest, state] => Ok(HostEvent::QuestState {
                player_id,
                quest_hash: number(quest)?,
                new_state: number(state)?,
            }),
            _ => Err(usage("state", "<quest-hash> <state-code>")),
        },
        "objective" => match args {
            [quest, objective] => Ok(HostEvent::ObjectiveComplete {
                player_id,
                quest_hash: number(quest)?,
                objective_id: number(objective)?,
            }),
            _ => Err(usage("objective", "<quest-hash> <objective-id>")),
        },
        "branch" => match args {
            [quest, stage, choice] => Ok(HostEvent::BranchChoice {
                player_id,
                quest_hash: number(quest)?,
                stage: number(stage)?,
                choice: number(choice)?,
            }),
            _ => Err(usage("branch", "<quest-hash> <stage> <choice>")),
        },
        "quest-vote" => match args {
            [quest, answer] => Ok(HostEvent::QuestVote {
                player_id,
                quest_hash: number(quest)?,
                approve: yes_no(answer)?,
            }),
            _ => Err(usage("quest-vote", "<quest-hash> yes|no")),
        },
        other => Err(CommandError::Unknown(other.to_string())),
    }
}
