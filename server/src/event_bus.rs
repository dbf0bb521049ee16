//! Named-topic event dispatch between the coordination components.
//!
//! Components never call each other while holding their own locks. Instead they
//! collect [`CoreEvent`]s during a critical section and publish them here after
//! the guard is dropped. Handlers run synchronously on the publisher's thread,
//! in subscription order. A handler that returns an error or panics is logged
//! and skipped; dispatch to the remaining handlers continues.

use crate::utils::lock;
use log::{debug, error};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub mod topics {
    pub const PLAYER_AUTHENTICATED: &str = "player_authenticated";
    pub const PLAYER_LOGGED_OUT: &str = "player_logged_out";
    pub const PLAYER_BANNED: &str = "player_banned";
    pub const PLAYER_UNBANNED: &str = "player_unbanned";
    pub const PLAYER_KICKED: &str = "player_kicked";
    pub const PERMISSION_CHANGED: &str = "permission_changed";
    pub const AUTH_FAILED: &str = "auth_failed";

    pub const DIALOG_STARTED: &str = "dialog_started";
    pub const DIALOG_ACTIVATED: &str = "dialog_activated";
    pub const DIALOG_ENDED: &str = "dialog_ended";
    pub const DIALOG_TIMEOUT: &str = "dialog_timeout";
    pub const PARTICIPANT_ADDED: &str = "participant_added";
    pub const PARTICIPANT_REMOVED: &str = "participant_removed";
    pub const SPEAKER_CHANGED: &str = "speaker_changed";
    pub const CHOICE_SELECTED: &str = "choice_selected";
    pub const CHOICE_CONSEQUENCE: &str = "choice_consequence";
    pub const VOTE_STARTED: &str = "vote_started";
    pub const VOTE_CAST: &str = "vote_cast";
    pub const VOTE_COMPLETED: &str = "vote_completed";
    pub const VOTE_TIMEOUT: &str = "vote_timeout";
    pub const VOTE_CANCELLED: &str = "vote_cancelled";

    pub const QUEST_REGISTERED: &str = "quest_registered";
    pub const QUEST_STAGE_CHANGED: &str = "quest_stage_changed";
    pub const QUEST_STATE_CHANGED: &str = "quest_state_changed";
    pub const QUEST_VOTE_STARTED: &str = "quest_vote_started";
    pub const QUEST_VOTE_CAST: &str = "quest_vote_cast";
    pub const QUEST_VOTE_PASSED: &str = "quest_vote_passed";
    pub const QUEST_VOTE_FAILED: &str = "quest_vote_failed";
    pub const QUEST_VOTE_TIMEOUT: &str = "quest_vote_timeout";
    pub const QUEST_CONFLICT_DETECTED: &str = "quest_conflict_detected";
    pub const QUEST_CONFLICT_RESOLVED: &str = "quest_conflict_resolved";
    pub const QUEST_LEADER_CHANGED: &str = "quest_leader_changed";
    pub const OBJECTIVE_COMPLETED: &str = "objective_completed";
    pub const BRANCH_CHOICE_MADE: &str = "branch_choice_made";
    pub const QUEST_CHECKPOINT_RESTORED: &str = "quest_checkpoint_restored";
    pub const QUEST_REPAIRED: &str = "quest_repaired";

    pub const SYSTEM_STARTED: &str = "system_started";
    pub const SYSTEM_STOPPED: &str = "system_stopped";
    pub const SYSTEM_FAILED: &str = "system_failed";
    pub const SYSTEM_RESTARTED: &str = "system_restarted";
    pub const EMERGENCY_SHUTDOWN: &str = "emergency_shutdown";
}

/// Every event the core publishes. `topic()` names the subscription key.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    PlayerAuthenticated { player_id: u32, name: String },
    PlayerLoggedOut { player_id: u32, reason: String },
    PlayerBanned { player_id: u32, ban_id: String, admin_id: u32, reason: String },
    PlayerUnbanned { ban_id: String, admin_id: u32, reason: String },
    PlayerKicked { player_id: u32, admin_id: u32, reason: String },
    PermissionChanged { player_id: u32, level: u8 },
    AuthFailed { name: String, endpoint: String, code: String },

    DialogStarted { session_id: u32, npc_id: u32, speaker_id: u32, quest_hash: u32 },
    DialogActivated { session_id: u32 },
    DialogEnded { session_id: u32, npc_id: u32, forced: bool, reason: String },
    DialogTimeout { session_id: u32, reason: String },
    ParticipantAdded { session_id: u32, player_id: u32, role: String },
    ParticipantRemoved { session_id: u32, player_id: u32 },
    SpeakerChanged { session_id: u32, old_speaker: u32, new_speaker: u32 },
    ChoiceSelected { session_id: u32, player_id: u32, choice_id: u32, quest_hash: u32, branch: bool },
    ChoiceConsequence { session_id: u32, choice_id: u32, consequence_id: u32 },
    VoteStarted { session_id: u32, choice_id: u32, initiator: u32, required: u32 },
    VoteCast { session_id: u32, player_id: u32, approve: bool, yes: u32, required: u32 },
    VoteCompleted { session_id: u32, choice_id: u32, passed: bool },
    VoteTimeout { session_id: u32, choice_id: u32 },
    VoteCancelled { session_id: u32, choice_id: u32 },

    QuestRegistered { quest_hash: u32, name: String },
    QuestStageChanged { quest_hash: u32, player_id: u32, stage: u16 },
    QuestStateChanged { quest_hash: u32, player_id: u32, state: u8 },
    QuestVoteStarted { quest_hash: u32, target_stage: u16, initiator: u32 },
    QuestVoteCast { quest_hash: u32, player_id: u32, approve: bool },
    QuestVotePassed { quest_hash: u32, stage: u16 },
    QuestVoteFailed { quest_hash: u32, target_stage: u16 },
    QuestVoteTimeout { quest_hash: u32, target_stage: u16 },
    QuestConflictDetected { quest_hash: u32, conflict_id: u32, stages: Vec<u16> },
    QuestConflictResolved { quest_hash: u32, conflict_id: u32, stage: u16, method: String },
    QuestLeaderChanged { quest_hash: u32, old_leader: u32, new_leader: u32 },
    ObjectiveCompleted { quest_hash: u32, player_id: u32, objective_id: u32 },
    BranchChoiceMade { quest_hash: u32, player_id: u32, stage: u16, choice: u32 },
    QuestCheckpointRestored { quest_hash: u32, stage: u16 },
    QuestRepaired { quest_hash: u32, fixes: usize },

    SystemStarted { system: String },
    SystemStopped { system: String },
    SystemFailed { system: String, error: String, error_count: u32 },
    SystemRestarted { system: String, attempt: u32 },
    EmergencyShutdown { reason: String },
}

impl CoreEvent {
    pub fn topic(&self) -> &'static str {
        use topics::*;
        match self {
            CoreEvent::PlayerAuthenticated { .. } => PLAYER_AUTHENTICATED,
            CoreEvent::PlayerLoggedOut { .. } => PLAYER_LOGGED_OUT,
            CoreEvent::PlayerBanned { .. } => PLAYER_BANNED,
            CoreEvent::PlayerUnbanned { .. } => PLAYER_UNBANNED,
            CoreEvent::PlayerKicked { .. } => PLAYER_KICKED,
            CoreEvent::PermissionChanged { .. } => PERMISSION_CHANGED,
            CoreEvent::AuthFailed { .. } => AUTH_FAILED,
            CoreEvent::DialogStarted { .. } => DIALOG_STARTED,
            CoreEvent::DialogActivated { .. } => DIALOG_ACTIVATED,
            CoreEvent::DialogEnded { .. } => DIALOG_ENDED,
            CoreEvent::DialogTimeout { .. } => DIALOG_TIMEOUT,
            CoreEvent::ParticipantAdded { .. } => PARTICIPANT_ADDED,
            CoreEvent::ParticipantRemoved { .. } => PARTICIPANT_REMOVED,
            CoreEvent::SpeakerChanged { .. } => SPEAKER_CHANGED,
            CoreEvent::ChoiceSelected { .. } => CHOICE_SELECTED,
            CoreEvent::ChoiceConsequence { .. } => CHOICE_CONSEQUENCE,
            CoreEvent::VoteStarted { .. } => VOTE_STARTED,
            CoreEvent::VoteCast { .. } => VOTE_CAST,
            CoreEvent::VoteCompleted { .. } => VOTE_COMPLETED,
            CoreEvent::VoteTimeout { .. } => VOTE_TIMEOUT,
            CoreEvent::VoteCancelled { .. } => VOTE_CANCELLED,
            CoreEvent::QuestRegistered { .. } => QUEST_REGISTERED,
            CoreEvent::QuestStageChanged { .. } => QUEST_STAGE_CHANGED,
            CoreEvent::QuestStateChanged { .. } => QUEST_STATE_CHANGED,
            CoreEvent::QuestVoteStarted { .. } => QUEST_VOTE_STARTED,
            CoreEvent::QuestVoteCast { .. } => QUEST_VOTE_CAST,
            CoreEvent::QuestVotePassed { .. } => QUEST_VOTE_PASSED,
            CoreEvent::QuestVoteFailed { .. } => QUEST_VOTE_FAILED,
            CoreEvent::QuestVoteTimeout { .. } => QUEST_VOTE_TIMEOUT,
            CoreEvent::QuestConflictDetected { .. } => QUEST_CONFLICT_DETECTED,
            CoreEvent::QuestConflictResolved { .. } => QUEST_CONFLICT_RESOLVED,
            CoreEvent::QuestLeaderChanged { .. } => QUEST_LEADER_CHANGED,
            CoreEvent::ObjectiveCompleted { .. } => OBJECTIVE_COMPLETED,
            CoreEvent::BranchChoiceMade { .. } => BRANCH_CHOICE_MADE,
            CoreEvent::QuestCheckpointRestored { .. } => QUEST_CHECKPOINT_RESTORED,
            CoreEvent::QuestRepaired { .. } => QUEST_REPAIRED,
            CoreEvent::SystemStarted { .. } => SYSTEM_STARTED,
            CoreEvent::SystemStopped { .. } => SYSTEM_STOPPED,
            CoreEvent::SystemFailed { .. } => SYSTEM_FAILED,
            CoreEvent::SystemRestarted { .. } => SYSTEM_RESTARTED,
            CoreEvent::EmergencyShutdown { .. } => EMERGENCY_SHUTDOWN,
        }
    }
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn(&CoreEvent) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every topic
    topic: Option<String>,
    handler: Handler,
}

/// Synchronous publish/subscribe hub. Nothing is persisted across restarts.
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    published: AtomicU64,
    handler_failures: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&CoreEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(Some(topic.to_string()), Arc::new(handler))
    }

    /// Receives every published event regardless of topic.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CoreEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    fn add(&self, topic: Option<String>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!("Subscription {:?} added for {:?}", id, topic);
        lock(&self.subscriptions).push(Subscription { id, topic, handler });
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = lock(&self.subscriptions);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Delivers `event` to its subscribers and returns how many handled it cleanly.
    pub fn publish(&self, event: CoreEvent) -> usize {
        let topic = event.topic();
        self.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot so handlers may subscribe or publish without deadlocking.
        let handlers: Vec<(SubscriptionId, Handler)> = {
            let subscriptions = lock(&self.subscriptions);
            subscriptions
                .iter()
                .filter(|s| s.topic.as_deref().map_or(true, |t| t == topic))
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Handler {:?} failed on {}: {}", id, topic, e);
                }
                Err(_) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Handler {:?} panicked on {}", id, topic);
                }
            }
        }
        delivered
    }

    pub fn publish_all<I: IntoIterator<Item = CoreEvent>>(&self, events: I) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.subscriptions)
            .iter()
            .filter(|s| s.topic.as_deref().map_or(true, |t| t == topic))
            .count()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn handler_failure_count(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        lock(&self.subscriptions).clear();
    }
}

/// Test helper that records every event it sees.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<CoreEvent>>>,
}

impl EventRecorder {
    pub fn attach(bus: &EventBus) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.events);
        bus.subscribe_all(move |event| {
            lock(&sink).push(event.clone());
            Ok(())
        });
        recorder
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        lock(&self.events).clone()
    }

    pub fn topics(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(|e| e.topic()).collect()
    }

    pub fn with_topic(&self, topic: &str) -> Vec<CoreEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| e.topic() == topic)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}
