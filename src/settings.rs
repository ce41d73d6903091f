use std::sync::RwLock;

use chrono::Duration;

/// Immutable snapshot of the engine's tunable knobs. Components take one
/// snapshot per operation so a setting never changes mid-flow.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub request_cost: i64,
    pub approval_required: bool,
    pub session_timeout: Duration,
    pub approval_expiry: Option<Duration>,
    pub hold_grace: Duration,
    pub register_cost: i64,
    pub renew_cost: i64,
    pub renew_window_days: i64,
    pub code_expiry_days: i64,
    pub delete_after_days: i64,
    pub check_in_reward: i64,
    pub spam_threshold: u32,
    pub spam_penalty: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            request_cost: 30,
            approval_required: true,
            session_timeout: Duration::minutes(2),
            approval_expiry: None,
            hold_grace: Duration::hours(1),
            register_cost: 300,
            renew_cost: 300,
            renew_window_days: 7,
            code_expiry_days: 30,
            delete_after_days: 15,
            check_in_reward: 10,
            spam_threshold: 5,
            spam_penalty: 10,
        }
    }
}

pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> EngineSettings;
}

/// Settings held in process memory, updated through the admin surface.
#[derive(Debug, Default)]
pub struct StaticSettings {
    inner: RwLock<EngineSettings>,
}

impl StaticSettings {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn update(&self, apply: impl FnOnce(&mut EngineSettings)) {
        let mut guard = self.inner.write().expect("settings lock poisoned");
        apply(&mut guard);
    }
}

impl SettingsSource for StaticSettings {
    fn snapshot(&self) -> EngineSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }
}
