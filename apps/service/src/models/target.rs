use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::validation::{clamp_interval, validate_target_name, validate_target_url};

pub type TargetId = Uuid;

/// How a target participates in scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetMode {
    /// Checked every `interval_seconds` by the scheduler
    Recurring { interval_seconds: u64 },
    /// Checked a single time, never scheduled, never alerted on
    OneTime,
}

/// Per-target alert preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertSettings {
    pub enabled: bool,
    pub notify_on_recovery: bool,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self { enabled: false, notify_on_recovery: true }
    }
}

/// A URL under monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub url: String,
    pub name: String,
    pub mode: TargetMode,
    pub active: bool,
    pub alerts: AlertSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    /// Create a recurring target, validating the URL and name.
    ///
    /// The interval is clamped up to `floor_seconds`.
    pub fn recurring(
        url: &str,
        name: Option<&str>,
        interval_seconds: u64,
        floor_seconds: u64,
    ) -> Result<Self, ValidationError> {
        let interval_seconds = clamp_interval(interval_seconds, floor_seconds)?;
        Self::build(url, name, TargetMode::Recurring { interval_seconds })
    }

    /// Create a one-time target
    pub fn one_time(url: &str) -> Result<Self, ValidationError> {
        let mut target = Self::build(url, None, TargetMode::OneTime)?;
        target.active = false;
        Ok(target)
    }

    fn build(url: &str, name: Option<&str>, mode: TargetMode) -> Result<Self, ValidationError> {
        let parsed = validate_target_url(url)?;
        let url = parsed.to_string();
        let name = match name {
            Some(name) => {
                validate_target_name(name)?;
                name.trim().to_string()
            }
            None => url.clone(),
        };

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            url,
            name,
            mode,
            active: true,
            alerts: AlertSettings::default(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_alerts(mut self, alerts: AlertSettings) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.mode, TargetMode::Recurring { .. })
    }

    /// Check interval, `None` for one-time targets
    pub fn interval(&self) -> Option<Duration> {
        match self.mode {
            TargetMode::Recurring { interval_seconds } => Some(Duration::from_secs(interval_seconds)),
            TargetMode::OneTime => None,
        }
    }

    /// Re-validate after a configuration change, clamping the interval floor.
    pub fn normalized(mut self, floor_seconds: u64) -> Result<Self, ValidationError> {
        self.url = validate_target_url(&self.url)?.to_string();
        validate_target_name(&self.name)?;
        if let TargetMode::Recurring { interval_seconds } = self.mode {
            self.mode = TargetMode::Recurring {
                interval_seconds: clamp_interval(interval_seconds, floor_seconds)?,
            };
        }
        Ok(self)
    }
}
