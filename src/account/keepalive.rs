//! Keepalive policy resolution and arming.

use std::time::Duration;

use tracing::debug;

use crate::config::KeepaliveMechanism;
use crate::engine::{KeepaliveAction, KeepaliveSetting, KeepaliveTimer};

/// Chooses the liveness mechanism for the engine and keeps re-arming
/// idempotent.
///
/// Mechanism and interval may change at any time; before the engine is armed
/// the changes are merely stored, afterwards [`KeepaliveScheduler::resolve`]
/// plus [`KeepaliveScheduler::mark_applied`] guarantee the engine only sees
/// actual changes.
#[derive(Debug)]
pub struct KeepaliveScheduler {
    mechanism: KeepaliveMechanism,
    interval: i32,
    applied: Option<KeepaliveSetting>,
}

impl KeepaliveScheduler {
    pub fn new(mechanism: KeepaliveMechanism, interval: i32) -> Self {
        Self {
            mechanism,
            interval,
            applied: None,
        }
    }

    pub fn set_mechanism(&mut self, mechanism: KeepaliveMechanism) {
        self.mechanism = mechanism;
    }

    pub fn set_interval(&mut self, interval: i32) {
        self.interval = interval;
    }

    /// Resolve the configured policy against the registration outcome.
    pub fn resolve(&self, registered: bool) -> KeepaliveSetting {
        let action = match self.mechanism {
            KeepaliveMechanism::None => KeepaliveAction::None,
            KeepaliveMechanism::RegisterRefresh => KeepaliveAction::RegisterRefresh,
            KeepaliveMechanism::Ping => KeepaliveAction::Ping,
            KeepaliveMechanism::Auto if registered => KeepaliveAction::RegisterRefresh,
            KeepaliveMechanism::Auto => KeepaliveAction::None,
        };

        let timer = match (action, self.interval) {
            (KeepaliveAction::None, _) => KeepaliveTimer::Disabled,
            (_, 0) => KeepaliveTimer::Disabled,
            (_, interval) if interval < 0 => KeepaliveTimer::EngineDefault,
            (_, interval) => KeepaliveTimer::Every(Duration::from_secs(interval as u64)),
        };

        KeepaliveSetting { action, timer }
    }

    /// Whether `setting` differs from what the engine last saw.
    pub fn needs_apply(&self, setting: &KeepaliveSetting) -> bool {
        self.applied.as_ref() != Some(setting)
    }

    pub fn mark_applied(&mut self, setting: KeepaliveSetting) {
        debug!(?setting, "keepalive armed");
        self.applied = Some(setting);
    }

    /// Whether the engine has been armed at all yet.
    pub fn is_armed(&self) -> bool {
        self.applied.is_some()
    }

    /// The setting the engine last saw, if any.
    pub fn applied(&self) -> Option<KeepaliveSetting> {
        self.applied
    }

    /// Forget the applied state, e.g. after the engine is destroyed.
    pub fn reset(&mut self) {
        self.applied = None;
    }
}
