use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::info;

use crate::database::TargetStore;
use crate::error::ValidationError;
use crate::models::{AlertSettings, Target, TargetId, TargetMode};
use crate::validation::{clamp_interval, validate_target_name, validate_target_url};

/// A target to be created
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub url: String,
    pub name: Option<String>,
    pub interval_seconds: u64,
    pub alerts: AlertSettings,
}

/// Fields to change on an existing target; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct TargetChanges {
    pub name: Option<String>,
    pub interval_seconds: Option<u64>,
    pub active: Option<bool>,
    pub alerts_enabled: Option<bool>,
    pub notify_on_recovery: Option<bool>,
}

/// Validated create/update/delete of stored targets
pub struct TargetManager {
    store: Arc<dyn TargetStore>,
    min_interval_seconds: u64,
}

impl TargetManager {
    pub fn new(store: Arc<dyn TargetStore>, min_interval_seconds: u64) -> Self {
        Self { store, min_interval_seconds }
    }

    pub async fn add(&self, new: NewTarget) -> Result<Target> {
        let url = validate_target_url(&new.url)?;
        if let Some(existing) = self.store.find_recurring_by_url(url.as_str()).await? {
            return Err(ValidationError::DuplicateUrl { existing: existing.id }.into());
        }

        let target = Target::recurring(url.as_str(), new.name.as_deref(), new.interval_seconds, self.min_interval_seconds)?
            .with_alerts(new.alerts);
        self.store.save_target(&target).await?;

        info!(target_id = %target.id, url = %target.url, "Target added");
        Ok(target)
    }

    pub async fn update(&self, id: TargetId, changes: TargetChanges) -> Result<Target> {
        let mut target = self.store.get_target(id).await?.ok_or_else(|| anyhow!("Target {id} not found"))?;

        if let Some(name) = changes.name {
            validate_target_name(&name)?;
            target.name = name.trim().to_string();
        }
        if let Some(interval_seconds) = changes.interval_seconds {
            if !target.is_recurring() {
                return Err(ValidationError::OneTimeNotSchedulable.into());
            }
            target.mode = TargetMode::Recurring {
                interval_seconds: clamp_interval(interval_seconds, self.min_interval_seconds)?,
            };
        }
        if let Some(active) = changes.active {
            target.active = active;
        }
        if let Some(enabled) = changes.alerts_enabled {
            target.alerts.enabled = enabled;
        }
        if let Some(notify) = changes.notify_on_recovery {
            target.alerts.notify_on_recovery = notify;
        }
        target.updated_at = Utc::now();

        self.store.save_target(&target).await?;
        info!(target_id = %target.id, "Target updated");
        Ok(target)
    }

    /// Delete a target together with its alert state and history
    pub async fn remove(&self, id: TargetId) -> Result<bool> {
        let removed = self.store.delete_target(id).await?;
        if removed {
            info!(target_id = %id, "Target removed");
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<Target>> {
        self.store.list_targets().await
    }
}
