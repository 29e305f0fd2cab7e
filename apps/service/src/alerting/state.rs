use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::AlertSettings;
use crate::monitoring::types::CheckResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertEvent {
    Down,
    Redown,
    Recovered,
}

impl fmt::Display for AlertEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertEvent::Down => write!(f, "down"),
            AlertEvent::Redown => write!(f, "redown"),
            AlertEvent::Recovered => write!(f, "recovered"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPhase {
    Healthy,
    /// Failing, below the threshold (or alerts disabled)
    Suspect,
    AlertedDown,
}

/// Thresholds shared by every target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self { failure_threshold: 2, cooldown: Duration::minutes(15) }
    }
}

/// Current alert bookkeeping for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertState {
    pub consecutive_failures: u32,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub currently_down: bool,
}

impl AlertState {
    pub fn phase(&self) -> AlertPhase {
        if self.currently_down {
            AlertPhase::AlertedDown
        } else if self.consecutive_failures > 0 {
            AlertPhase::Suspect
        } else {
            AlertPhase::Healthy
        }
    }

    /// Fold one check result into the state, returning the notification it
    /// calls for. The result's timestamp is taken as the current time.
    pub fn apply(&mut self, result: &CheckResult, settings: &AlertSettings, policy: &AlertPolicy) -> Option<AlertEvent> {
        let now = result.timestamp;

        if result.is_up() {
            let recovered = self.currently_down && settings.notify_on_recovery;
            *self = AlertState::default();
            return recovered.then_some(AlertEvent::Recovered);
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < policy.failure_threshold || !settings.enabled {
            return None;
        }

        if !self.currently_down {
            self.currently_down = true;
            self.last_alert_at = Some(now);
            return Some(AlertEvent::Down);
        }

        let cooled_down = self.last_alert_at.is_none_or(|last| now - last >= policy.cooldown);
        if cooled_down {
            self.last_alert_at = Some(now);
            return Some(AlertEvent::Redown);
        }
        None
    }
}
