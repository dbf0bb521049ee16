//! # Lifecycle Orchestrator
//!
//! Owns start-up, shutdown and supervision of the registered subsystems.
//!
//! - `initialize` validates declared dependencies, sorts them topologically
//!   (priority breaks ties) and starts each system in that order. A cycle or
//!   a missing required dependency aborts before anything starts.
//! - `shutdown` stops every live system in the reverse order.
//! - `health_check` marks failing systems `Error` and restarts them while
//!   their restart budget lasts. An essential system with an exhausted
//!   budget triggers an emergency shutdown of everything.
//! - The watchdog treats a system whose liveness stamp (refreshed by every
//!   passing health check) is older than the timeout as failing.
//!
//! Subsystem callbacks always run with the registry lock released, and a
//! panicking callback counts as a failure of that system.

pub mod graph;
pub mod subsystem;

pub use subsystem::{
    compare_versions, Dependency, StateCell, Subsystem, SystemInfo, SystemPriority, SystemState, SystemType,
};

use crate::clock::SharedClock;
use crate::config::LifecycleConfig;
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{CoreEvent, EventBus};
use crate::utils::lock;
use graph::Node;
use log::{debug, error, info, warn};
use std::cmp::Ordering as VersionOrdering;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const MAX_ERROR_HISTORY: usize = 10;

/// Orchestrator run state shared with background sweeps.
#[derive(Debug, Clone)]
pub struct StopFlag(Arc<AtomicU8>);

impl StopFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    fn set(&self, state: SystemState) {
        let code = match state {
            SystemState::Running => 1,
            SystemState::Stopping => 2,
            SystemState::Stopped => 3,
            _ => 0,
        };
        self.0.store(code, Ordering::SeqCst);
    }

    pub fn state(&self) -> SystemState {
        match self.0.load(Ordering::SeqCst) {
            1 => SystemState::Running,
            2 => SystemState::Stopping,
            3 => SystemState::Stopped,
            _ => SystemState::Uninitialized,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == SystemState::Running
    }

    /// True once shutdown has begun.
    pub fn should_stop(&self) -> bool {
        matches!(self.state(), SystemState::Stopping | SystemState::Stopped)
    }
}

struct Entry {
    system: Arc<dyn Subsystem>,
    info: SystemInfo,
    state: SystemState,
    seq: usize,
    error_count: u32,
    restart_count: u32,
    errors: VecDeque<String>,
    last_alive: u64,
}

impl Entry {
    fn record_error(&mut self, error: &str) {
        self.error_count += 1;
        self.errors.push_back(error.to_string());
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_front();
        }
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<SystemType, Entry>,
    init_order: Vec<SystemType>,
    next_seq: usize,
}

#[derive(Default)]
struct Schedule {
    last_health_check: u64,
    last_watchdog: u64,
}

/// Runs a subsystem callback, turning a panic into an error.
fn guarded<T>(name: &str, what: &str, f: impl FnOnce() -> T) -> CoreResult<T> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|_| CoreError::Internal(format!("{} panicked during {}", name, what)))
}

pub struct LifecycleOrchestrator {
    config: LifecycleConfig,
    clock: SharedClock,
    bus: Arc<EventBus>,
    registry: Mutex<Registry>,
    schedule: Mutex<Schedule>,
    emergency: Mutex<Option<String>>,
    stop: StopFlag,
}

impl LifecycleOrchestrator {
    pub fn new(config: LifecycleConfig, clock: SharedClock, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            clock,
            bus,
            registry: Mutex::new(Registry::default()),
            schedule: Mutex::new(Schedule::default()),
            emergency: Mutex::new(None),
            stop: StopFlag::new(),
        }
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.stop.is_running()
    }

    pub fn register_system(&self, system_type: SystemType, system: Arc<dyn Subsystem>, info: SystemInfo) -> CoreResult<()> {
        let mut registry = lock(&self.registry);
        if registry.entries.contains_key(&system_type) {
            return Err(CoreError::PreconditionFailed(format!(
                "{} is already registered",
                system_type
            )));
        }
        info!("Registered system {} ({})", info.name, system_type);
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.entries.insert(
            system_type,
            Entry {
                system,
                info,
                state: SystemState::Uninitialized,
                seq,
                error_count: 0,
                restart_count: 0,
                errors: VecDeque::new(),
                last_alive: 0,
            },
        );
        Ok(())
    }

    /// Stops (if live) and forgets a system.
    pub fn unregister_system(&self, system_type: &SystemType) -> CoreResult<()> {
        self.stop_one(system_type)?;
        let mut registry = lock(&self.registry);
        registry.entries.remove(system_type);
        registry.init_order.retain(|t| t != system_type);
        info!("Unregistered system {}", system_type);
        Ok(())
    }

    fn plan(&self) -> CoreResult<Vec<SystemType>> {
        let registry = lock(&self.registry);
        let mut nodes = Vec::with_capacity(registry.entries.len());
        for (system_type, entry) in &registry.entries {
            let mut after = Vec::new();
            for dep in &entry.info.dependencies {
                match registry.entries.get(&dep.target) {
                    None if dep.required => {
                        return Err(CoreError::PreconditionFailed(format!(
                            "{} requires {} which is not registered",
                            entry.info.name, dep.target
                        )));
                    }
                    None => {
                        warn!(
                            "{}: optional dependency {} is not registered",
                            entry.info.name, dep.target
                        );
                    }
                    Some(target) => {
                        if let Some(min) = &dep.min_version {
                            if compare_versions(&target.info.version, min) == VersionOrdering::Less {
                                return Err(CoreError::PreconditionFailed(format!(
                                    "{} requires {} >= {}, found {}",
                                    entry.info.name, target.info.name, min, target.info.version
                                )));
                            }
                        }
                        after.push(dep.target.clone());
                    }
                }
            }
            nodes.push(Node {
                system: system_type.clone(),
                priority: entry.info.priority,
                seq: entry.seq,
                after,
            });
        }
        graph::initialization_order(&nodes)
    }

    pub fn get_initialization_order(&self) -> CoreResult<Vec<SystemType>> {
        self.plan()
    }

    pub fn get_shutdown_order(&self) -> CoreResult<Vec<SystemType>> {
        let mut order = self.plan()?;
        order.reverse();
        Ok(order)
    }

    /// Starts every registered system in dependency order.
    pub fn initialize(&self) -> CoreResult<()> {
        if self.stop.is_running() {
            return Ok(());
        }
        let order = self.plan()?;
        *lock(&self.emergency) = None;
        info!("Initializing {} systems", order.len());

        let mut started: Vec<SystemType> = Vec::new();
        for system_type in &order {
            match self.start_one(system_type) {
                Ok(()) => started.push(system_type.clone()),
                Err(e) => {
                    let (name, essential) = self.describe(system_type);
                    if essential {
                        error!("Essential system {} failed to start: {}", name, e);
                        for done in started.iter().rev() {
                            if let Err(stop_err) = self.stop_one(done) {
                                warn!("Rollback could not stop {:?}: {}", done, stop_err);
                            }
                        }
                        self.stop.set(SystemState::Stopped);
                        return Err(CoreError::Internal(format!(
                            "essential system {} failed to start: {}",
                            name, e
                        )));
                    }
                    warn!("Non-essential system {} failed to start, continuing: {}", name, e);
                }
            }
        }

        lock(&self.registry).init_order = order;
        let now = self.clock.now_millis();
        *lock(&self.schedule) = Schedule {
            last_health_check: now,
            last_watchdog: now,
        };
        self.stop.set(SystemState::Running);
        info!("All systems initialized ({} running)", started.len());
        Ok(())
    }

    /// Stops every live system in reverse initialization order. Errors are
    /// logged and never interrupt the cascade.
    pub fn shutdown(&self) {
        if self.stop.state() == SystemState::Stopped && self.running_systems().is_empty() {
            return;
        }
        info!("Shutting down systems");
        self.stop.set(SystemState::Stopping);

        let mut order = {
            let registry = lock(&self.registry);
            let mut order = registry.init_order.clone();
            // Systems started individually after initialize.
            let mut extra: Vec<(&SystemType, usize)> = registry
                .entries
                .iter()
                .filter(|(t, _)| !order.contains(*t))
                .map(|(t, e)| (t, e.seq))
                .collect();
            extra.sort_by_key(|(_, seq)| *seq);
            order.extend(extra.into_iter().map(|(t, _)| t.clone()));
            order
        };
        order.reverse();

        for system_type in &order {
            if let Err(e) = self.stop_one(system_type) {
                warn!("Stopping {} failed: {}", system_type, e);
            }
        }
        self.stop.set(SystemState::Stopped);
        info!("System shutdown completed");
    }

    fn describe(&self, system_type: &SystemType) -> (String, bool) {
        lock(&self.registry)
            .entries
            .get(system_type)
            .map(|e| (e.info.name.clone(), e.info.essential))
            .unwrap_or_else(|| (system_type.to_string(), false))
    }

    fn start_one(&self, system_type: &SystemType) -> CoreResult<()> {
        let (system, name) = {
            let mut registry = lock(&self.registry);
            let missing = {
                let entry = registry
                    .entries
                    .get(system_type)
                    .ok_or_else(|| CoreError::not_found("system", system_type))?;
                entry
                    .info
                    .dependencies
                    .iter()
                    .filter(|d| d.required)
                    .find(|d| {
                        !matches!(
                            registry.entries.get(&d.target).map(|t| t.state),
                            Some(SystemState::Running) | Some(SystemState::Paused)
                        )
                    })
                    .map(|d| d.target.clone())
            };
            let entry = registry
                .entries
                .get_mut(system_type)
                .ok_or_else(|| CoreError::not_found("system", system_type))?;
            if let Some(dep) = missing {
                let error = format!("required dependency {} is not running", dep);
                entry.state = SystemState::Error;
                entry.record_error(&error);
                return Err(CoreError::PreconditionFailed(format!("{}: {}", entry.info.name, error)));
            }
            entry.state = SystemState::Initializing;
            (Arc::clone(&entry.system), entry.info.name.clone())
        };

        info!("Initializing system {}", name);
        let result = guarded(&name, "initialize", || system.initialize()).and_then(|r| r);

        let now = self.clock.now_millis();
        let event = {
            let mut registry = lock(&self.registry);
            let entry = registry
                .entries
                .get_mut(system_type)
                .ok_or_else(|| CoreError::not_found("system", system_type))?;
            entry.last_alive = now;
            match &result {
                Ok(()) => {
                    entry.state = SystemState::Running;
                    CoreEvent::SystemStarted { system: name.clone() }
                }
                Err(e) => {
                    entry.state = SystemState::Error;
                    entry.record_error(&e.to_string());
                    CoreEvent::SystemFailed {
                        system: name.clone(),
                        error: e.to_string(),
                        error_count: entry.error_count,
                    }
                }
            }
        };
        match &result {
            Ok(()) => info!("System {} is running", name),
            Err(e) => error!("System {} failed to initialize: {}", name, e),
        }
        self.bus.publish(event);
        result
    }

    fn stop_one(&self, system_type: &SystemType) -> CoreResult<()> {
        let (system, name, live) = {
            let mut registry = lock(&self.registry);
            let entry = registry
                .entries
                .get_mut(system_type)
                .ok_or_else(|| CoreError::not_found("system", system_type))?;
            let live = entry.state.is_live();
            if live {
                entry.state = SystemState::Stopping;
            }
            (Arc::clone(&entry.system), entry.info.name.clone(), live)
        };
        if !live {
            return Ok(());
        }

        debug!("Shutting down system {}", name);
        let result = guarded(&name, "shutdown", || system.shutdown());
        if let Some(entry) = lock(&self.registry).entries.get_mut(system_type) {
            entry.state = SystemState::Stopped;
            if let Err(e) = &result {
                entry.record_error(&e.to_string());
            }
        }
        if let Err(e) = &result {
            error!("{}", e);
        }
        self.bus.publish(CoreEvent::SystemStopped { system: name });
        Ok(())
    }

    pub fn start_system(&self, system_type: &SystemType) -> CoreResult<()> {
        if self.get_system_state(system_type) == Some(SystemState::Running) {
            return Err(CoreError::PreconditionFailed(format!(
                "{} is already running",
                system_type
            )));
        }
        self.start_one(system_type)
    }

    pub fn stop_system(&self, system_type: &SystemType) -> CoreResult<()> {
        self.stop_one(system_type)
    }

    /// `shutdown`, `reset` and `initialize` in sequence.
    pub fn restart_system(&self, system_type: &SystemType) -> CoreResult<()> {
        let (system, name) = {
            let registry = lock(&self.registry);
            let entry = registry
                .entries
                .get(system_type)
                .ok_or_else(|| CoreError::not_found("system", system_type))?;
            (Arc::clone(&entry.system), entry.info.name.clone())
        };
        info!("Restarting system {}", name);
        self.stop_one(system_type)?;
        guarded(&name, "reset", || system.reset())?;
        self.start_one(system_type)
    }

    pub fn pause_system(&self, system_type: &SystemType) -> CoreResult<()> {
        self.swap_state(system_type, SystemState::Running, SystemState::Paused)
    }

    pub fn resume_system(&self, system_type: &SystemType) -> CoreResult<()> {
        self.swap_state(system_type, SystemState::Paused, SystemState::Running)
    }

    fn swap_state(&self, system_type: &SystemType, from: SystemState, to: SystemState) -> CoreResult<()> {
        let mut registry = lock(&self.registry);
        let entry = registry
            .entries
            .get_mut(system_type)
            .ok_or_else(|| CoreError::not_found("system", system_type))?;
        if entry.state != from {
            return Err(CoreError::PreconditionFailed(format!(
                "{} is {:?}, expected {:?}",
                entry.info.name, entry.state, from
            )));
        }
        entry.state = to;
        debug!("System {} is now {:?}", entry.info.name, to);
        Ok(())
    }

    fn snapshot(&self, states: &[SystemState]) -> Vec<(SystemType, Arc<dyn Subsystem>, String)> {
        let registry = lock(&self.registry);
        let mut systems: Vec<(&SystemType, &Entry)> = registry
            .entries
            .iter()
            .filter(|(_, e)| states.contains(&e.state))
            .collect();
        systems.sort_by_key(|(_, e)| e.seq);
        systems
            .into_iter()
            .map(|(t, e)| (t.clone(), Arc::clone(&e.system), e.info.name.clone()))
            .collect()
    }

    /// Calls `update` on every running system.
    pub fn update(&self) {
        if !self.stop.is_running() {
            return;
        }
        for (system_type, system, name) in self.snapshot(&[SystemState::Running]) {
            if let Err(e) = guarded(&name, "update", || system.update()) {
                self.handle_failure(&system_type, e.to_string());
            }
        }
    }

    /// Checks every running or failed system once; returns how many failed.
    pub fn health_check(&self) -> usize {
        if !self.stop.is_running() {
            return 0;
        }
        let now = self.clock.now_millis();
        lock(&self.schedule).last_health_check = now;

        let mut failures = 0;
        for (system_type, system, name) in self.snapshot(&[SystemState::Running, SystemState::Error]) {
            if !self.stop.is_running() {
                break;
            }
            if self.exhausted(&system_type) {
                continue;
            }
            let recorded = self.get_system_state(&system_type);
            let healthy = guarded(&name, "health check", || {
                system.is_healthy() && system.state() != SystemState::Error
            })
            .unwrap_or(false);

            if healthy && recorded == Some(SystemState::Running) {
                if let Some(entry) = lock(&self.registry).entries.get_mut(&system_type) {
                    entry.last_alive = now;
                }
                continue;
            }
            failures += 1;
            let error = system
                .last_error()
                .unwrap_or_else(|| "health check failed".to_string());
            self.handle_failure(&system_type, error);
        }
        failures
    }

    /// Fails running systems whose liveness stamp is older than the watchdog
    /// timeout.
    pub fn watchdog_check(&self) -> usize {
        if !self.config.watchdog || !self.stop.is_running() {
            return 0;
        }
        let now = self.clock.now_millis();
        lock(&self.schedule).last_watchdog = now;

        let stale: Vec<(SystemType, u64)> = {
            let registry = lock(&self.registry);
            let mut stale: Vec<(SystemType, u64, usize)> = registry
                .entries
                .iter()
                .filter(|(_, e)| e.state == SystemState::Running)
                .filter(|(_, e)| now.saturating_sub(e.last_alive) > self.config.watchdog_timeout_ms)
                .map(|(t, e)| (t.clone(), now.saturating_sub(e.last_alive), e.seq))
                .collect();
            stale.sort_by_key(|(_, _, seq)| *seq);
            stale.into_iter().map(|(t, age, _)| (t, age)).collect()
        };
        let mut flagged = 0;
        for (system_type, age) in stale {
            if !self.stop.is_running() {
                break;
            }
            flagged += 1;
            self.handle_failure(&system_type, format!("watchdog timeout: unresponsive for {} ms", age));
        }
        flagged
    }

    /// Runs whichever of the health check and watchdog are due.
    pub fn poll(&self) {
        let now = self.clock.now_millis();
        let (health_due, watchdog_due) = {
            let schedule = lock(&self.schedule);
            (
                now.saturating_sub(schedule.last_health_check) >= self.config.health_check_interval_ms,
                now.saturating_sub(schedule.last_watchdog) >= self.config.watchdog_interval_ms,
            )
        };
        if health_due {
            self.health_check();
        }
        if watchdog_due {
            self.watchdog_check();
        }
    }

    /// A non-essential system left in Error with no restarts to spend has
    /// already been reported; checking it again would only repeat that.
    fn exhausted(&self, system_type: &SystemType) -> bool {
        lock(&self.registry).entries.get(system_type).map_or(false, |entry| {
            entry.state == SystemState::Error
                && !entry.info.essential
                && (!self.config.auto_restart || entry.restart_count >= self.config.max_restart_attempts)
        })
    }

    fn handle_failure(&self, system_type: &SystemType, error: String) {
        if self.is_emergency_shutdown() {
            return;
        }
        let (name, essential, error_count, attempt) = {
            let mut registry = lock(&self.registry);
            let Some(entry) = registry.entries.get_mut(system_type) else {
                return;
            };
            entry.state = SystemState::Error;
            entry.record_error(&error);
            let attempt = if self.config.auto_restart && entry.restart_count < self.config.max_restart_attempts {
                entry.restart_count += 1;
                Some(entry.restart_count)
            } else {
                None
            };
            (entry.info.name.clone(), entry.info.essential, entry.error_count, attempt)
        };

        error!("System failure detected: {} - {}", name, error);
        self.bus.publish(CoreEvent::SystemFailed {
            system: name.clone(),
            error,
            error_count,
        });

        match attempt {
            Some(attempt) => {
                info!(
                    "Restarting {} (attempt {}/{})",
                    name, attempt, self.config.max_restart_attempts
                );
                match self.restart_system(system_type) {
                    Ok(()) => {
                        self.bus.publish(CoreEvent::SystemRestarted { system: name, attempt });
                    }
                    Err(e) => warn!("Restart of {} failed: {}", name, e),
                }
            }
            None if essential => {
                self.trigger_emergency_shutdown(&format!("Essential system failure: {}", name));
            }
            None => warn!("{} stays in Error: restart budget exhausted", name),
        }
    }

    /// Records the reason and stops every live system in reverse order.
    pub fn trigger_emergency_shutdown(&self, reason: &str) {
        {
            let mut emergency = lock(&self.emergency);
            if emergency.is_some() {
                return;
            }
            *emergency = Some(reason.to_string());
        }
        error!("EMERGENCY SHUTDOWN TRIGGERED: {}", reason);
        self.bus.publish(CoreEvent::EmergencyShutdown {
            reason: reason.to_string(),
        });
        self.shutdown();
    }

    pub fn is_emergency_shutdown(&self) -> bool {
        lock(&self.emergency).is_some()
    }

    pub fn emergency_reason(&self) -> Option<String> {
        lock(&self.emergency).clone()
    }

    /// False after an emergency, or while any system is not running and
    /// healthy.
    pub fn are_all_systems_healthy(&self) -> bool {
        if self.is_emergency_shutdown() {
            return false;
        }
        let registry = lock(&self.registry);
        let systems: Vec<(SystemState, Arc<dyn Subsystem>, String)> = registry
            .entries
            .values()
            .map(|e| (e.state, Arc::clone(&e.system), e.info.name.clone()))
            .collect();
        drop(registry);

        systems.into_iter().all(|(state, system, name)| {
            matches!(state, SystemState::Running | SystemState::Paused)
                && guarded(&name, "health check", || system.is_healthy()).unwrap_or(false)
        })
    }

    pub fn get_system_state(&self, system_type: &SystemType) -> Option<SystemState> {
        lock(&self.registry).entries.get(system_type).map(|e| e.state)
    }

    pub fn get_system_info(&self, system_type: &SystemType) -> Option<SystemInfo> {
        lock(&self.registry).entries.get(system_type).map(|e| e.info.clone())
    }

    /// The last ten errors, oldest first.
    pub fn get_system_errors(&self, system_type: &SystemType) -> Vec<String> {
        lock(&self.registry)
            .entries
            .get(system_type)
            .map(|e| e.errors.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn restart_count(&self, system_type: &SystemType) -> u32 {
        lock(&self.registry).entries.get(system_type).map_or(0, |e| e.restart_count)
    }

    pub fn error_count(&self, system_type: &SystemType) -> u32 {
        lock(&self.registry).entries.get(system_type).map_or(0, |e| e.error_count)
    }

    fn with_state(&self, state: SystemState) -> Vec<SystemType> {
        let registry = lock(&self.registry);
        let mut systems: Vec<(&SystemType, usize)> = registry
            .entries
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(t, e)| (t, e.seq))
            .collect();
        systems.sort_by_key(|(_, seq)| *seq);
        systems.into_iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn running_systems(&self) -> Vec<SystemType> {
        self.with_state(SystemState::Running)
    }

    pub fn failed_systems(&self) -> Vec<SystemType> {
        self.with_state(SystemState::Error)
    }

    pub fn system_count(&self) -> usize {
        lock(&self.registry).entries.len()
    }
}
