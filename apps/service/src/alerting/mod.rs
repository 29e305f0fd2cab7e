//! Failure and recovery alerting.
//!
//! The [`AlertEngine`] folds each check result of a recurring target into
//! the [`AlertState`] snapshot held by the target store and dispatches the
//! notifications the state machine asks for. Delivery runs on its own task so a slow webhook never
//! holds up a target's check loop.

mod state;

pub use state::{AlertEvent, AlertPhase, AlertPolicy, AlertState};

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::database::TargetStore;
use crate::models::{Target, TargetId};
use crate::monitoring::types::CheckResult;
use crate::notify::{Notification, NotificationDetails, Notifier};

pub struct AlertEngine {
    policy: AlertPolicy,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn TargetStore>,
    states: DashMap<TargetId, AlertState>,
}

impl AlertEngine {
    pub fn new(policy: AlertPolicy, notifier: Arc<dyn Notifier>, store: Arc<dyn TargetStore>) -> Self {
        Self { policy, notifier, store, states: DashMap::new() }
    }

    pub fn policy(&self) -> AlertPolicy {
        self.policy
    }

    /// Feed one check result for `target`.
    ///
    /// Callers serialize results per target. One-time targets are ignored.
    pub async fn process(&self, target: &Target, result: &CheckResult) -> Option<AlertEvent> {
        if !target.is_recurring() {
            return None;
        }

        let Some(mut state) = self.current_state(target.id).await else {
            debug!(target_id = %target.id, "Target no longer stored, dropping its alert state");
            self.forget(target.id);
            return None;
        };
        let event = state.apply(result, &target.alerts, &self.policy);
        self.states.insert(target.id, state);

        if let Err(e) = self.store.save_alert_state(target.id, &state).await {
            warn!(target_id = %target.id, error = %e, "Failed to persist alert state");
        }

        if let Some(event) = event {
            info!(
                target: "pagewatch::alerts",
                target_id = %target.id,
                url = %target.url,
                event = %event,
                consecutive_failures = state.consecutive_failures,
                "Alert triggered"
            );
            self.dispatch(target, result, &state, event);
        }
        event
    }

    /// Last state the engine computed for a target
    pub fn state(&self, id: TargetId) -> Option<AlertState> {
        self.states.get(&id).map(|entry| *entry.value())
    }

    /// Drop a removed target's state
    pub fn forget(&self, id: TargetId) {
        self.states.remove(&id);
    }

    /// Clear every target's state, in memory and in the store
    pub async fn reset_all(&self) -> Result<u64> {
        self.states.clear();
        let reset = self.store.reset_alert_states().await?;
        info!(target: "pagewatch::alerts", reset, "Alert states reset");
        Ok(reset)
    }

    /// The stored snapshot is authoritative so resets made elsewhere are seen.
    /// `None` when the target has been deleted.
    async fn current_state(&self, id: TargetId) -> Option<AlertState> {
        match self.store.load_alert_state(id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(target_id = %id, error = %e, "Failed to load alert state, using last known");
                Some(self.state(id).unwrap_or_default())
            }
        }
    }

    fn dispatch(&self, target: &Target, result: &CheckResult, state: &AlertState, event: AlertEvent) {
        let notification = Notification {
            target_name: target.name.clone(),
            target_url: target.url.clone(),
            event,
            details: NotificationDetails {
                status_code: result.status_code,
                error: result.error_message.clone(),
                consecutive_failures: state.consecutive_failures,
            },
        };
        let notifier = Arc::clone(&self.notifier);
        let url = target.url.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(notification).await {
                warn!(target: "pagewatch::alerts", url = %url, event = %event, error = %e, "Notification delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::models::AlertSettings;
    use crate::notify::NotifyError;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use tokio::sync::mpsc;

    struct ChannelNotifier(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
            let _ = self.0.send(notification);
            Ok(())
        }
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(minutes)
    }

    fn down(target: &Target, minutes: i64) -> CheckResult {
        CheckResult::new(target.id, target.url.clone(), at(minutes)).failure(3, "connection failed: refused".into())
    }

    fn up(target: &Target, minutes: i64) -> CheckResult {
        CheckResult::new(target.id, target.url.clone(), at(minutes)).success(50, 200)
    }

    async fn engine() -> (AlertEngine, Arc<MemoryStore>, mpsc::UnboundedReceiver<Notification>, Target) {
        let store = Arc::new(MemoryStore::new());
        let target = Target::recurring("https://example.com", Some("Example"), 60, 10)
            .unwrap()
            .with_alerts(AlertSettings { enabled: true, notify_on_recovery: true });
        store.save_target(&target).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = AlertEngine::new(AlertPolicy::default(), Arc::new(ChannelNotifier(tx)), store.clone());
        (engine, store, rx, target)
    }

    #[tokio::test]
    async fn test_scenario_sends_down_redown_and_recovery() {
        let (engine, store, mut rx, target) = engine().await;

        assert_eq!(engine.process(&target, &down(&target, 0)).await, None);
        assert_eq!(engine.process(&target, &down(&target, 1)).await, Some(AlertEvent::Down));
        assert_eq!(engine.process(&target, &down(&target, 11)).await, None);
        assert_eq!(engine.process(&target, &down(&target, 21)).await, Some(AlertEvent::Redown));
        assert_eq!(engine.process(&target, &up(&target, 22)).await, Some(AlertEvent::Recovered));

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            events.iter().map(|n| n.event).collect::<Vec<_>>(),
            vec![AlertEvent::Down, AlertEvent::Redown, AlertEvent::Recovered]
        );
        assert_eq!(events[0].target_name, "Example");
        assert_eq!(events[0].details.consecutive_failures, 2);
        assert_eq!(events[0].details.error.as_deref(), Some("connection failed: refused"));
        assert_eq!(events[2].details.status_code, Some(200));

        assert_eq!(engine.state(target.id), Some(AlertState::default()));
        assert_eq!(store.load_alert_state(target.id).await.unwrap(), Some(AlertState::default()));
    }

    #[tokio::test]
    async fn test_state_is_restored_from_store() {
        let (engine, store, _rx, target) = engine().await;
        let persisted = AlertState { consecutive_failures: 4, last_alert_at: Some(at(0)), currently_down: true };
        store.save_alert_state(target.id, &persisted).await.unwrap();

        // Still inside the cooldown of the persisted alert.
        assert_eq!(engine.process(&target, &down(&target, 5)).await, None);
        assert_eq!(engine.state(target.id).map(|s| s.consecutive_failures), Some(5));
    }

    #[tokio::test]
    async fn test_one_time_targets_are_ignored() {
        let (engine, _store, _rx, _) = engine().await;
        let target = Target::one_time("https://example.org").unwrap();

        for minute in 0..3 {
            assert_eq!(engine.process(&target, &down(&target, minute)).await, None);
        }
        assert_eq!(engine.state(target.id), None);
    }

    #[tokio::test]
    async fn test_reset_all_returns_targets_to_healthy() {
        let (engine, store, _rx, target) = engine().await;
        engine.process(&target, &down(&target, 0)).await;
        engine.process(&target, &down(&target, 1)).await;

        assert_eq!(engine.reset_all().await.unwrap(), 1);
        assert_eq!(engine.state(target.id), None);
        assert_eq!(store.load_alert_state(target.id).await.unwrap(), Some(AlertState::default()));

        // Failing again starts a fresh count.
        assert_eq!(engine.process(&target, &down(&target, 2)).await, None);
    }

    #[tokio::test]
    async fn test_reset_in_store_is_picked_up() {
        let (engine, store, _rx, target) = engine().await;
        engine.process(&target, &down(&target, 0)).await;
        assert_eq!(engine.process(&target, &down(&target, 1)).await, Some(AlertEvent::Down));

        // Another process resets the database behind the engine's back.
        store.reset_alert_states().await.unwrap();

        assert_eq!(engine.process(&target, &down(&target, 2)).await, None);
        let persisted = store.load_alert_state(target.id).await.unwrap().unwrap();
        assert_eq!(persisted.consecutive_failures, 1);
        assert!(!persisted.currently_down);
    }

    #[tokio::test]
    async fn test_deleted_target_state_is_dropped() {
        let (engine, store, _rx, target) = engine().await;
        engine.process(&target, &down(&target, 0)).await;
        assert!(engine.state(target.id).is_some());

        store.delete_target(target.id).await.unwrap();

        // A check that was in flight during the delete.
        assert_eq!(engine.process(&target, &down(&target, 1)).await, None);
        assert_eq!(engine.state(target.id), None);
        assert_eq!(store.load_alert_state(target.id).await.unwrap(), None);
    }
}
