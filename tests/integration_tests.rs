//! Integration tests for the co-op coordination core
//!
//! These tests drive whole cores through their public surface: host events,
//! the scheduler tick, the decision outbox and the UDP transport.

use coop_server::auth::{AuthGrant, AuthRequest, BanType, CredentialVerifier, IdentityStore, JsonFileStore};
use coop_server::bridge::RecordingBridge;
use coop_server::clock::{Clock, ManualClock};
use coop_server::config::{CoreConfig, LifecycleConfig};
use coop_server::coop::CoopCore;
use coop_server::dialog::{DialogChoice, DialogChoiceType, DialogRole, DialogState, DialogSyncMode, VoteStatus};
use coop_server::error::{CoreResult, ErrorKind};
use coop_server::event_bus::{topics, CoreEvent, EventBus, EventRecorder};
use coop_server::lifecycle::{
    LifecycleOrchestrator, StateCell, Subsystem, SystemInfo, SystemPriority, SystemState, SystemType,
};
use coop_server::quest::{QuestDefinition, QuestSyncMode, QuestType};
use shared::{AuthMethod, AuthResult, HostEvent, PermissionLevel, WirePacket, DEFAULT_DIALOG_SYNC_MODE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

const TOKEN: &str = "tok16chars______";

fn core_at(clock: &ManualClock, config: CoreConfig) -> CoopCore {
    let core = assert_ok!(CoopCore::with_clock(config, Arc::new(clock.clone()), None));
    assert_ok!(core.initialize());
    core
}

fn login(core: &CoopCore, name: &str, endpoint: &str) -> AuthGrant {
    let request = AuthRequest::new(name, TOKEN, AuthMethod::Steam, &format!("hw-{}", name), endpoint);
    assert_ok!(core.authenticate(&request))
}

fn send(core: &CoopCore, grant: &AuthGrant, event: HostEvent) -> CoreResult<()> {
    core.ingest(grant.player_id, &grant.session_token, event)
}

fn move_to(core: &CoopCore, grant: &AuthGrant, x: f32) {
    assert_ok!(send(
        core,
        grant,
        HostEvent::PositionUpdate {
            player_id: grant.player_id,
            x,
            y: 0.0,
            z: 0.0,
        },
    ));
}

/// IDENTITY TESTS
mod identity_tests {
    use super::*;

    struct RejectAll;

    impl CredentialVerifier for RejectAll {
        fn verify(&self, _request: &AuthRequest) -> bool {
            false
        }
    }

    /// A well-formed Steam login goes straight through
    #[test]
    fn happy_path_authentication() {
        let clock = ManualClock::new(5_000_000);
        let core = core_at(&clock, CoreConfig::default());

        let grant = login(&core, "Nova", "1.2.3.4");

        assert_eq!(grant.permission_level, PermissionLevel::Player);
        assert!(grant.session_token.len() >= 32);
        assert_eq!(
            grant.expires_at,
            clock.now_millis() + core.config().identity.session_ttl_secs * 1_000
        );
        let online = core.auth().online_players();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].name, "Nova");
        assert_eq!(online[0].level, PermissionLevel::Player);
    }

    /// Repeated failures from one endpoint lock it out for the attempt window
    #[test]
    fn brute_force_lockout() {
        let clock = ManualClock::new(5_000_000);
        let core = core_at(&clock, CoreConfig::default());
        core.auth().set_verifier(Arc::new(RejectAll));
        let attempt = || {
            core.authenticate(&AuthRequest::new("Nova", TOKEN, AuthMethod::Steam, "hwA", "1.2.3.4"))
                .map(|_| ())
                .map_err(|e| e.code)
        };
        let start = clock.now_millis();

        for _ in 0..5 {
            assert_eq!(attempt(), Err(AuthResult::InvalidCredentials));
            clock.advance_millis(10_000);
        }
        assert_eq!(attempt(), Err(AuthResult::TooManyAttempts));

        // The first failure has aged out, five more remain inside the window
        clock.set(start + 900_000);
        assert_eq!(attempt(), Err(AuthResult::TooManyAttempts));

        // Once every failure has aged out the credentials are checked again
        clock.set(start + 2 * 900_000);
        assert_eq!(attempt(), Err(AuthResult::InvalidCredentials));
    }

    /// Session expiry is half-open: exactly at `expires_at` the session is gone
    #[test]
    fn session_expires_at_deadline() {
        let clock = ManualClock::new(5_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let grant = login(&core, "Nova", "1.2.3.4");
        let leave = HostEvent::PlayerLeave {
            player_id: grant.player_id,
        };

        clock.set(grant.expires_at - 1);
        assert_ok!(send(
            &core,
            &grant,
            HostEvent::PlayerJoin {
                player_id: grant.player_id,
                display_name: "Nova".to_string(),
            },
        ));

        // Activity does not move the deadline
        let session = core.auth().get_session(grant.player_id).unwrap();
        assert_eq!(session.expires_at, grant.expires_at);
        clock.set(grant.expires_at);
        let err = assert_err!(send(&core, &grant, leave));
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        assert!(core.sweep_identity() >= 1);
        assert!(!core.auth().is_online(grant.player_id));
    }

    /// Ban then unban restores the ability to log in
    #[test]
    fn ban_and_unban_round_trip() {
        let clock = ManualClock::new(5_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let admin = login(&core, "Warden", "10.0.0.1");
        assert_ok!(core.auth().assign_level(admin.player_id, PermissionLevel::Admin));
        let target = login(&core, "Jackie", "1.2.3.5");

        let ban_id = assert_ok!(core.auth().ban(
            admin.player_id,
            target.player_id,
            "griefing",
            BanType::Permanent,
            None
        ));
        assert!(ban_id.starts_with("ban_"));
        assert!(!core.auth().is_online(target.player_id));

        let again = AuthRequest::new("Jackie", TOKEN, AuthMethod::Steam, "hw-Jackie", "1.2.3.5");
        assert_eq!(assert_err!(core.authenticate(&again)).code, AuthResult::AccountBanned);

        assert_ok!(core.auth().unban(admin.player_id, &ban_id, "appeal accepted"));
        assert_ok!(core.authenticate(&again));
    }

    /// Bans written by one process are enforced by the next
    #[test]
    fn bans_survive_restart_through_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let clock = ManualClock::new(5_000_000);

        {
            let store: Arc<dyn IdentityStore> = Arc::new(JsonFileStore::new(path.clone()));
            let core = assert_ok!(CoopCore::with_clock(
                CoreConfig::default(),
                Arc::new(clock.clone()),
                Some(store)
            ));
            assert_ok!(core.initialize());
            let admin = login(&core, "Warden", "10.0.0.1");
            assert_ok!(core.auth().assign_level(admin.player_id, PermissionLevel::Admin));
            let target = login(&core, "Jackie", "1.2.3.5");
            assert_ok!(core.auth().ban(
                admin.player_id,
                target.player_id,
                "griefing",
                BanType::Ip,
                None
            ));
            core.shutdown();
        }
        assert!(path.exists());

        let store: Arc<dyn IdentityStore> = Arc::new(JsonFileStore::new(path));
        let core = assert_ok!(CoopCore::with_clock(
            CoreConfig::default(),
            Arc::new(clock.clone()),
            Some(store)
        ));
        assert_ok!(core.initialize());
        assert!(core.auth().is_banned("1.2.3.5", "", ""));
        let request = AuthRequest::new("Someone", TOKEN, AuthMethod::Steam, "hw-new", "1.2.3.5");
        assert_eq!(assert_err!(core.authenticate(&request)).code, AuthResult::AccountBanned);
        assert_ok!(core.authenticate(&AuthRequest::new(
            "Someone",
            TOKEN,
            AuthMethod::Steam,
            "hw-new",
            "1.2.3.6"
        )));
    }
}

/// QUEST SYNCHRONIZATION TESTS
mod quest_tests {
    use super::*;

    const HEIST: u32 = 0x4E57_0001;

    /// Divergent stages on a story-critical main quest are settled by a vote
    #[test]
    fn majority_quest_conflict() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let recorder = EventRecorder::attach(core.bus());
        assert_ok!(core.quests().register(
            QuestDefinition::new(HEIST, "The Heist", QuestType::Main, QuestSyncMode::Strict).story_critical()
        ));

        let players: Vec<AuthGrant> = ["Nova", "Jackie", "Viktor"]
            .iter()
            .map(|name| login(&core, name, "1.2.3.4"))
            .collect();
        for grant in &players {
            assert_ok!(core.quests().register_player(HEIST, grant.player_id));
        }

        // Viktor runs ahead and opens a vote; the others' reports are only
        // recorded while it runs
        let report = |grant: &AuthGrant, stage: u16| {
            send(
                &core,
                grant,
                HostEvent::QuestStage {
                    player_id: grant.player_id,
                    quest_hash: HEIST,
                    new_stage: stage,
                },
            )
        };
        assert_ok!(report(&players[2], 4));
        assert_ok!(report(&players[0], 3));
        assert_ok!(report(&players[1], 3));

        clock.advance_millis(30_000);
        core.tick();
        assert_eq!(recorder.with_topic(topics::QUEST_VOTE_TIMEOUT).len(), 1);

        // The next detection pass sees stages 3, 3, 4
        let record = core.quests().get_quest(HEIST).unwrap();
        let vote = record.active_vote.expect("detection should open a vote");
        assert_eq!(vote.target_stage, 4);
        assert_eq!(vote.initiator, players[0].player_id);
        assert_eq!(vote.yes_count(), 1);
        assert_eq!(recorder.with_topic(topics::QUEST_CONFLICT_DETECTED).len(), 1);

        assert_ok!(send(
            &core,
            &players[1],
            HostEvent::QuestVote {
                player_id: players[1].player_id,
                quest_hash: HEIST,
                approve: true,
            },
        ));

        let record = core.quests().get_quest(HEIST).unwrap();
        assert_eq!(record.authority_stage, 4);
        assert!(record.players.values().all(|p| p.current_stage == 4));
        assert_eq!(
            recorder.with_topic(topics::QUEST_VOTE_PASSED),
            vec![CoreEvent::QuestVotePassed {
                quest_hash: HEIST,
                stage: 4
            }]
        );

        let bridge = RecordingBridge::new();
        core.pump(&bridge);
        assert!(bridge.count("QuestConflictNotification") >= 1);
        assert!(bridge.count("QuestFullSync") >= 1);
    }

    /// A story-critical stage bump under Strict mode asks before advancing
    #[test]
    fn story_critical_bump_opens_vote() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        assert_ok!(core.quests().register(
            QuestDefinition::new(HEIST, "The Heist", QuestType::Main, QuestSyncMode::Strict).story_critical()
        ));
        let nova = login(&core, "Nova", "1.2.3.4");
        let jackie = login(&core, "Jackie", "1.2.3.4");
        assert_ok!(core.quests().register_player(HEIST, nova.player_id));
        assert_ok!(core.quests().register_player(HEIST, jackie.player_id));

        assert_ok!(send(
            &core,
            &nova,
            HostEvent::QuestStage {
                player_id: nova.player_id,
                quest_hash: HEIST,
                new_stage: 2,
            },
        ));
        let record = core.quests().get_quest(HEIST).unwrap();
        assert_eq!(record.authority_stage, 0);
        assert!(record.active_vote.is_some());
    }

    /// Joining the world registers the player on shared quests and resyncs them
    #[test]
    fn player_join_syncs_active_quests() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        assert_ok!(core.quests().register(QuestDefinition::new(7, "gig", QuestType::Gig, QuestSyncMode::Strict)));
        assert_ok!(core.quests().register(QuestDefinition::new(8, "solo", QuestType::Side, QuestSyncMode::Individual)));
        let nova = login(&core, "Nova", "1.2.3.4");
        for quest_hash in [7, 8] {
            assert_ok!(send(
                &core,
                &nova,
                HostEvent::QuestStage {
                    player_id: nova.player_id,
                    quest_hash,
                    new_stage: 5,
                },
            ));
        }
        core.take_decisions();

        let jackie = login(&core, "Jackie", "1.2.3.5");
        assert_ok!(send(
            &core,
            &jackie,
            HostEvent::PlayerJoin {
                player_id: jackie.player_id,
                display_name: "Jackie".to_string(),
            },
        ));

        let gig = core.quests().get_quest(7).unwrap();
        assert_eq!(gig.players.get(&jackie.player_id).map(|p| p.current_stage), Some(5));
        assert!(!core.quests().get_quest(8).unwrap().players.contains_key(&jackie.player_id));

        let syncs: Vec<_> = core
            .take_decisions()
            .into_iter()
            .filter(|d| matches!(d.packet, WirePacket::QuestFullSync(_)))
            .collect();
        assert!(!syncs.is_empty());
        assert!(syncs.iter().all(|d| d.audience.includes(jackie.player_id)));
    }

    /// Unknown quest state codes are refused before reaching the engine
    #[test]
    fn unknown_state_code_is_invalid() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        assert_ok!(core.quests().register(QuestDefinition::new(7, "gig", QuestType::Gig, QuestSyncMode::Strict)));
        let nova = login(&core, "Nova", "1.2.3.4");

        let err = assert_err!(send(
            &core,
            &nova,
            HostEvent::QuestState {
                player_id: nova.player_id,
                quest_hash: 7,
                new_state: 200,
            },
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}

/// DIALOG COORDINATION TESTS
mod dialog_tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const NPC: u32 = 900;

    fn start(core: &CoopCore, speaker: &AuthGrant, mode: DialogSyncMode) -> u32 {
        assert_ok!(send(
            core,
            speaker,
            HostEvent::NpcDialogStart {
                npc_id: NPC,
                speaker_id: speaker.player_id,
                quest_hash: 0,
                sync_mode: mode.as_u8(),
            },
        ));
        core.dialogs().get_active_dialog(NPC).unwrap().session_id
    }

    /// Only players within the proximity range may join
    #[test]
    fn dialog_proximity_gate() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let speaker = login(&core, "Nova", "1.2.3.4");
        let a = login(&core, "Jackie", "1.2.3.4");
        let b = login(&core, "Viktor", "1.2.3.4");

        move_to(&core, &speaker, 0.0);
        let session = start(&core, &speaker, DialogSyncMode::Proximity);

        move_to(&core, &a, 10.0);
        assert_ok!(core.dialogs().add_participant(session, a.player_id, DialogRole::Participant));

        move_to(&core, &b, 20.0);
        let err = assert_err!(core.dialogs().add_participant(session, b.player_id, DialogRole::Participant));
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        move_to(&core, &b, 8.0);
        assert_ok!(core.dialogs().add_participant(session, b.player_id, DialogRole::Participant));

        let participants = assert_ok!(core.dialogs().get_participants(session));
        let joined = participants.iter().find(|p| p.player_id == b.player_id).unwrap();
        assert_approx_eq!(joined.distance_to_speaker, 8.0);
    }

    /// An unanswered consensus vote fails at its deadline without consequences
    #[test]
    fn vote_timeout() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let recorder = EventRecorder::attach(core.bus());
        let speaker = login(&core, "Nova", "1.2.3.4");
        let others = [login(&core, "Jackie", "1.2.3.4"), login(&core, "Viktor", "1.2.3.4")];

        let session = start(&core, &speaker, DialogSyncMode::Consensus);
        for other in &others {
            assert_ok!(core.dialogs().add_participant(session, other.player_id, DialogRole::Participant));
        }
        assert_ok!(core.dialogs().register_dialog_choice(
            session,
            DialogChoice::new(10, "Take the deal", DialogChoiceType::Normal)
                .consensus()
                .consequence(55)
        ));
        core.tick();
        assert_eq!(core.dialogs().get_dialog_session(session).unwrap().state, DialogState::Active);

        assert_ok!(send(
            &core,
            &speaker,
            HostEvent::DialogChoice {
                session_id: session,
                player_id: speaker.player_id,
                choice_id: 10,
            },
        ));
        let vote = core.dialogs().get_dialog_session(session).unwrap().active_vote.unwrap();
        assert_eq!(vote.required, 3);
        assert_eq!(vote.yes_count(), 1);

        clock.advance_millis(30_000);
        core.tick();

        let state = core.dialogs().get_dialog_session(session).unwrap();
        assert!(state.active_vote.is_none());
        assert_eq!(state.state, DialogState::Active);
        assert_eq!(assert_ok!(core.dialogs().get_vote_status(session)), VoteStatus::Timeout);
        assert_eq!(
            recorder.with_topic(topics::VOTE_TIMEOUT),
            vec![CoreEvent::VoteTimeout {
                session_id: session,
                choice_id: 10
            }]
        );
        assert!(recorder.with_topic(topics::CHOICE_CONSEQUENCE).is_empty());
    }

    /// A majority vote with two eligible voters needs both of them
    #[test]
    fn majority_of_two_needs_both() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let speaker = login(&core, "Nova", "1.2.3.4");
        let other = login(&core, "Jackie", "1.2.3.4");

        let session = start(&core, &speaker, DialogSyncMode::Majority);
        assert_ok!(core.dialogs().add_participant(session, other.player_id, DialogRole::Participant));
        assert_ok!(core.dialogs().register_dialog_choice(
            session,
            DialogChoice::new(4, "Open fire", DialogChoiceType::Aggressive)
        ));
        assert_ok!(core.dialogs().activate_dialog(session));

        assert_ok!(send(
            &core,
            &speaker,
            HostEvent::DialogChoice {
                session_id: session,
                player_id: speaker.player_id,
                choice_id: 4,
            },
        ));
        assert_eq!(
            core.dialogs().get_dialog_session(session).unwrap().active_vote.unwrap().required,
            2
        );

        assert_ok!(send(
            &core,
            &other,
            HostEvent::DialogVote {
                session_id: session,
                player_id: other.player_id,
                approve: true,
            },
        ));
        let state = core.dialogs().get_dialog_session(session).unwrap();
        assert!(state.active_vote.is_none());
        assert_eq!(state.current_choice, 4);
    }

    /// A consensus vote with a single eligible voter passes on the auto-yes
    #[test]
    fn consensus_of_one_passes_immediately() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let speaker = login(&core, "Nova", "1.2.3.4");

        let session = start(&core, &speaker, DialogSyncMode::Consensus);
        assert_ok!(core.dialogs().register_dialog_choice(
            session,
            DialogChoice::new(1, "Agree", DialogChoiceType::Normal)
        ));
        assert_ok!(core.dialogs().activate_dialog(session));
        assert_ok!(send(
            &core,
            &speaker,
            HostEvent::DialogChoice {
                session_id: session,
                player_id: speaker.player_id,
                choice_id: 1,
            },
        ));

        let state = core.dialogs().get_dialog_session(session).unwrap();
        assert!(state.active_vote.is_none());
        assert_eq!(state.current_choice, 1);
    }

    /// Starting and ending without choices frees the NPC
    #[test]
    fn start_end_round_trip() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let speaker = login(&core, "Nova", "1.2.3.4");

        let session = start(&core, &speaker, DialogSyncMode::Speaker);
        assert!(core.dialogs().is_npc_in_dialog(NPC));
        assert_ok!(core.dialogs().end_dialog(session, false));
        assert!(!core.dialogs().is_npc_in_dialog(NPC));
    }

    /// Leaving the world ends the speaker's dialog when nobody can take over
    #[test]
    fn player_leave_interrupts_dialog() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let speaker = login(&core, "Nova", "1.2.3.4");
        start(&core, &speaker, DialogSyncMode::Speaker);

        assert_ok!(send(
            &core,
            &speaker,
            HostEvent::PlayerLeave {
                player_id: speaker.player_id,
            },
        ));
        assert!(!core.dialogs().is_npc_in_dialog(NPC));
        assert_eq!(core.dialogs().stats().interrupted_dialogs, 1);
    }

    /// The default sync mode byte picks the configured default
    #[test]
    fn default_sync_mode_byte() {
        let clock = ManualClock::new(1_000_000);
        let core = core_at(&clock, CoreConfig::default());
        let speaker = login(&core, "Nova", "1.2.3.4");
        assert_ok!(send(
            &core,
            &speaker,
            HostEvent::NpcDialogStart {
                npc_id: NPC,
                speaker_id: speaker.player_id,
                quest_hash: 0,
                sync_mode: DEFAULT_DIALOG_SYNC_MODE,
            },
        ));
        assert_eq!(
            core.dialogs().get_active_dialog(NPC).unwrap().sync_mode,
            DialogSyncMode::Speaker
        );
    }
}

/// SUPERVISION TESTS
mod lifecycle_tests {
    use super::*;

    /// Subsystem whose health the test controls
    struct Flaky {
        cell: StateCell,
        healthy: AtomicBool,
    }

    impl Flaky {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                cell: StateCell::default(),
                healthy: AtomicBool::new(true),
            })
        }
    }

    impl Subsystem for Flaky {
        fn initialize(&self) -> CoreResult<()> {
            self.cell.run_initialize(|| Ok(()))
        }

        fn shutdown(&self) {
            self.cell.run_shutdown(|| {});
        }

        fn state(&self) -> SystemState {
            self.cell.get()
        }

        fn is_healthy(&self) -> bool {
            self.cell.get() == SystemState::Running && self.healthy.load(Ordering::SeqCst)
        }

        fn last_error(&self) -> Option<String> {
            self.cell.last_error()
        }

        fn reset(&self) {
            self.cell.reset();
        }
    }

    /// An essential subsystem that keeps failing takes everything down
    #[test]
    fn essential_subsystem_cascade() {
        let clock = ManualClock::new(0);
        let bus = Arc::new(EventBus::new());
        let recorder = EventRecorder::attach(&bus);
        let config = LifecycleConfig {
            max_restart_attempts: 2,
            ..LifecycleConfig::default()
        };
        let orchestrator = LifecycleOrchestrator::new(config, Arc::new(clock.clone()), bus);

        let bus_system = Flaky::new();
        let identity = Flaky::new();
        let dialogs = Flaky::new();
        assert_ok!(orchestrator.register_system(
            SystemType::EventBus,
            bus_system,
            SystemInfo::new("Event Bus").priority(SystemPriority::Critical).essential(),
        ));
        assert_ok!(orchestrator.register_system(
            SystemType::IdentitySession,
            identity.clone(),
            SystemInfo::new("Identity & Session")
                .priority(SystemPriority::Critical)
                .essential()
                .depends_on(SystemType::EventBus),
        ));
        assert_ok!(orchestrator.register_system(
            SystemType::DialogCoordinator,
            dialogs,
            SystemInfo::new("Dialog Coordinator").depends_on(SystemType::EventBus),
        ));
        assert_ok!(orchestrator.initialize());

        identity.healthy.store(false, Ordering::SeqCst);
        orchestrator.health_check();
        orchestrator.health_check();
        assert!(!orchestrator.is_emergency_shutdown());
        orchestrator.health_check();

        assert!(orchestrator.is_emergency_shutdown());
        assert_eq!(
            orchestrator.emergency_reason().as_deref(),
            Some("Essential system failure: Identity & Session")
        );
        for system in [
            SystemType::EventBus,
            SystemType::IdentitySession,
            SystemType::DialogCoordinator,
        ] {
            assert_eq!(orchestrator.get_system_state(&system), Some(SystemState::Stopped));
        }
        assert!(!orchestrator.are_all_systems_healthy());
        assert_eq!(recorder.with_topic(topics::EMERGENCY_SHUTDOWN).len(), 1);
    }

    /// Shutdown runs in the exact reverse of the start-up order
    #[test]
    fn core_shutdown_reverses_start_order() {
        let clock = ManualClock::new(0);
        let core = core_at(&clock, CoreConfig::default());
        let recorder = EventRecorder::attach(core.bus());

        let start = assert_ok!(core.lifecycle().get_initialization_order());
        core.shutdown();

        let stopped: Vec<String> = recorder
            .with_topic(topics::SYSTEM_STOPPED)
            .into_iter()
            .filter_map(|e| match e {
                CoreEvent::SystemStopped { system } => Some(system),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = start
            .iter()
            .rev()
            .filter_map(|t| core.lifecycle().get_system_info(t).map(|info| info.name))
            .collect();
        assert_eq!(stopped, expected);
    }
}

/// CONFIGURATION TESTS
mod config_tests {
    use super::*;

    /// A partial TOML file on disk fills the rest from defaults
    #[tokio::test]
    async fn core_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coop.toml");
        tokio::fs::write(
            &path,
            "[identity]\nmax_online_players = 2\n\n[dialog]\nproximity_range = 5.0\n",
        )
        .await
        .unwrap();

        let config = assert_ok!(CoreConfig::load(&path).await);
        assert_eq!(config.identity.max_online_players, 2);
        assert_eq!(config.dialog.vote_timeout_secs, 30);

        let clock = ManualClock::new(0);
        let core = core_at(&clock, config);
        login(&core, "Nova", "1.2.3.4");
        login(&core, "Jackie", "1.2.3.4");
        let third = AuthRequest::new("Viktor", TOKEN, AuthMethod::Steam, "hw", "1.2.3.4");
        assert_eq!(assert_err!(core.authenticate(&third)).code, AuthResult::ServerFull);
    }

    /// Invalid configurations never produce a core
    #[test]
    fn invalid_config_is_rejected() {
        let mut config = CoreConfig::default();
        config.dialog.max_participants = 0;
        match CoopCore::new(config) {
            Ok(_) => panic!("a dialog without participants was accepted"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::InvalidArgument),
        }
    }
}

/// TRANSPORT TESTS
mod transport_tests {
    use super::*;
    use bridge_client::commands::parse_command;
    use bridge_client::network::{BridgeClient, BridgeUpdate};
    use coop_server::network::Server;
    use std::time::Duration;

    const QUEST: u32 = 0x600D;

    /// Reads updates until one matches; panics when the server goes quiet.
    async fn wait_for<F>(bridge: &mut BridgeClient, mut matches: F) -> BridgeUpdate
    where
        F: FnMut(&BridgeUpdate) -> bool,
    {
        loop {
            match bridge.next_update().await.unwrap() {
                Some(update) if matches(&update) => return update,
                Some(_) => continue,
                None => panic!("server went quiet"),
            }
        }
    }

    /// Two bridges exchange events and decisions through a live UDP server
    #[tokio::test]
    async fn bridges_round_trip_over_udp() {
        let mut config = CoreConfig::default();
        config.network.bind_address = "127.0.0.1:0".to_string();
        let core = Arc::new(assert_ok!(CoopCore::new(config.clone())));
        assert_ok!(core.initialize());
        assert_ok!(core.quests().register(QuestDefinition::new(QUEST, "Pickup", QuestType::Gig, QuestSyncMode::Strict)));

        let mut server = Server::new(Arc::clone(&core), &config.network).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let scenario = async {
            let mut nova = BridgeClient::new(&addr)
                .await
                .unwrap()
                .with_reply_timeout(Duration::from_millis(1_000));
            let mut jackie = BridgeClient::new(&addr)
                .await
                .unwrap()
                .with_reply_timeout(Duration::from_millis(1_000));

            let nova_id = match nova.authenticate("Nova", TOKEN, AuthMethod::Steam, "hwA").await.unwrap() {
                BridgeUpdate::Authenticated(session) => session.player_id,
                other => panic!("unexpected {:?}", other),
            };
            assert!(matches!(
                jackie.authenticate("Jackie", TOKEN, AuthMethod::Steam, "hwB").await.unwrap(),
                BridgeUpdate::Authenticated(_)
            ));

            // A stage report is broadcast to every bridge
            let event = parse_command(&format!("stage {} 3", QUEST), nova_id).unwrap();
            nova.send_event(event).await.unwrap();
            let update = wait_for(&mut jackie, |u| {
                matches!(u, BridgeUpdate::Decision(d)
                    if matches!(&d.packet, WirePacket::QuestFullSync(s) if s.target_stage == 3))
            })
            .await;
            assert!(matches!(update, BridgeUpdate::Decision(_)));

            // Acting for someone else is refused with the error kind
            let spoof = parse_command("pos 1 2 3", nova_id).unwrap();
            jackie.send_event(spoof).await.unwrap();
            match wait_for(&mut jackie, |u| matches!(u, BridgeUpdate::Rejected { .. })).await {
                BridgeUpdate::Rejected { kind, .. } => assert_eq!(kind, "PermissionDenied"),
                other => panic!("unexpected {:?}", other),
            }

            // Logging out still delivers the revocation to the leaving bridge
            jackie.heartbeat().await.unwrap();
            nova.logout().await.unwrap();
            wait_for(&mut nova, |u| {
                matches!(u, BridgeUpdate::Decision(d)
                    if matches!(&d.packet, WirePacket::SessionRevoked { player_id, .. } if *player_id == nova_id))
            })
            .await;
            assert!(!core.auth().is_online(nova_id));
        };

        tokio::select! {
            result = server.run() => panic!("server stopped early: {:?}", result.err().map(|e| e.to_string())),
            _ = scenario => {}
        }
    }

    /// Logins are refused while the identity service is down
    #[test]
    fn login_refused_when_identity_stopped() {
        let clock = ManualClock::new(0);
        let core = core_at(&clock, CoreConfig::default());
        assert_ok!(core.lifecycle().stop_system(&SystemType::IdentitySession));

        let request = AuthRequest::new("Nova", TOKEN, AuthMethod::Steam, "hw", "1.2.3.4");
        assert_eq!(assert_err!(core.authenticate(&request)).code, AuthResult::NetworkError);
    }
}
