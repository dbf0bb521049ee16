use crate::error::CoreResult;
use crate::utils::lock;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemState {
    Uninitialized,
    Initializing,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl SystemState {
    /// States that hold resources and need a `shutdown`.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SystemState::Initializing | SystemState::Running | SystemState::Paused | SystemState::Error
        )
    }
}

/// Start-up precedence between subsystems with no dependency on each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemPriority {
    Critical,
    High,
    Medium,
    Low,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemType {
    EventBus,
    IdentitySession,
    DialogCoordinator,
    QuestEngine,
    HostBridge,
    Custom(String),
}

impl fmt::Display for SystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemType::EventBus => write!(f, "EventBus"),
            SystemType::IdentitySession => write!(f, "IdentitySession"),
            SystemType::DialogCoordinator => write!(f, "DialogCoordinator"),
            SystemType::QuestEngine => write!(f, "QuestEngine"),
            SystemType::HostBridge => write!(f, "HostBridge"),
            SystemType::Custom(name) => write!(f, "Custom({})", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub target: SystemType,
    pub required: bool,
    pub min_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
    pub priority: SystemPriority,
    /// Exhausting the restart budget of an essential system shuts everything down
    pub essential: bool,
    pub dependencies: Vec<Dependency>,
}

impl SystemInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            priority: SystemPriority::Medium,
            essential: false,
            dependencies: Vec::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn priority(mut self, priority: SystemPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn essential(mut self) -> Self {
        self.essential = true;
        self
    }

    pub fn depends_on(mut self, target: SystemType) -> Self {
        self.dependencies.push(Dependency {
            target,
            required: true,
            min_version: None,
        });
        self
    }

    pub fn optionally_depends_on(mut self, target: SystemType) -> Self {
        self.dependencies.push(Dependency {
            target,
            required: false,
            min_version: None,
        });
        self
    }

    pub fn depends_on_version(mut self, target: SystemType, min_version: &str) -> Self {
        self.dependencies.push(Dependency {
            target,
            required: true,
            min_version: Some(min_version.to_string()),
        });
        self
    }
}

/// Compares dotted version strings numerically; non-numeric parts count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Contract every managed component implements.
///
/// `initialize` moves `Uninitialized -> Running` (or `Error`), `update` is
/// only called while `Running`, and `shutdown` moves any live state to
/// `Stopped`. Implementations use interior mutability since the
/// orchestrator shares them behind `Arc`.
pub trait Subsystem: Send + Sync {
    fn initialize(&self) -> CoreResult<()>;
    fn shutdown(&self);
    fn update(&self) {}
    fn state(&self) -> SystemState;
    fn is_healthy(&self) -> bool {
        self.state() == SystemState::Running
    }
    fn last_error(&self) -> Option<String>;
    fn reset(&self);
}

/// State bookkeeping shared by the built-in subsystem adapters.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<SystemState>,
    last_error: Mutex<Option<String>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: Mutex::new(SystemState::Uninitialized),
            last_error: Mutex::new(None),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> SystemState {
        *lock(&self.state)
    }

    pub fn set(&self, state: SystemState) {
        *lock(&self.state) = state;
    }

    pub fn fail(&self, error: String) {
        *lock(&self.last_error) = Some(error);
        self.set(SystemState::Error);
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Back to `Uninitialized` with the error cleared.
    pub fn reset(&self) {
        *lock(&self.last_error) = None;
        self.set(SystemState::Uninitialized);
    }

    /// Runs `start` and records the resulting state.
    pub fn run_initialize<F>(&self, start: F) -> CoreResult<()>
    where
        F: FnOnce() -> CoreResult<()>,
    {
        self.set(SystemState::Initializing);
        match start() {
            Ok(()) => {
                self.set(SystemState::Running);
                Ok(())
            }
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Runs `stop` only when something is live.
    pub fn run_shutdown<F: FnOnce()>(&self, stop: F) {
        if self.get().is_live() {
            self.set(SystemState::Stopping);
            stop();
        }
        self.set(SystemState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.2.0", "1.2"), Ordering::Equal);
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.9", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("beta", "0"), Ordering::Equal);
    }

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), SystemState::Uninitialized);

        cell.run_initialize(|| Ok(())).unwrap();
        assert_eq!(cell.get(), SystemState::Running);

        let err = cell
            .run_initialize(|| Err(CoreError::Internal("disk gone".into())))
            .unwrap_err();
        assert_eq!(cell.get(), SystemState::Error);
        assert_eq!(cell.last_error(), Some(err.to_string()));

        let mut stopped = false;
        cell.run_shutdown(|| stopped = true);
        assert!(stopped);
        assert_eq!(cell.get(), SystemState::Stopped);

        cell.reset();
        assert_eq!(cell.get(), SystemState::Uninitialized);
        assert!(cell.last_error().is_none());
    }

    #[test]
    fn test_info_builder() {
        let info = SystemInfo::new("Quest Engine")
            .priority(SystemPriority::High)
            .depends_on(SystemType::EventBus)
            .optionally_depends_on(SystemType::HostBridge);
        assert!(!info.essential);
        assert_eq!(info.dependencies.len(), 2);
        assert!(!info.dependencies[1].required);
    }
}
