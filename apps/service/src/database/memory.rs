use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{RequestFilter, ResultSink, TargetStore};
use crate::alerting::AlertState;
use crate::classify::SubsequentRequest;
use crate::models::{Target, TargetId};
use crate::monitoring::types::CheckResult;

#[derive(Default)]
struct Inner {
    targets: HashMap<TargetId, Target>,
    alert_states: HashMap<TargetId, AlertState>,
    results: Vec<CheckResult>,
    requests: Vec<SubsequentRequest>,
}

/// Store that keeps everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut targets: Vec<Target>) -> Vec<Target> {
    targets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    targets
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn list_active_targets(&self) -> Result<Vec<Target>> {
        let inner = self.inner.read().await;
        Ok(sorted(inner.targets.values().filter(|t| t.active && t.is_recurring()).cloned().collect()))
    }

    async fn list_targets(&self) -> Result<Vec<Target>> {
        Ok(sorted(self.inner.read().await.targets.values().cloned().collect()))
    }

    async fn get_target(&self, id: TargetId) -> Result<Option<Target>> {
        Ok(self.inner.read().await.targets.get(&id).cloned())
    }

    async fn save_target(&self, target: &Target) -> Result<()> {
        self.inner.write().await.targets.insert(target.id, target.clone());
        Ok(())
    }

    async fn delete_target(&self, id: TargetId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        inner.alert_states.remove(&id);
        inner.results.retain(|r| r.target_id != id);
        inner.requests.retain(|r| r.target_id != id);
        Ok(inner.targets.remove(&id).is_some())
    }

    async fn find_recurring_by_url(&self, url: &str) -> Result<Option<Target>> {
        let inner = self.inner.read().await;
        let found = inner.targets.values().filter(|t| t.is_recurring() && t.url == url).cloned().collect();
        Ok(sorted(found).into_iter().next())
    }

    async fn load_alert_state(&self, id: TargetId) -> Result<Option<AlertState>> {
        let inner = self.inner.read().await;
        if !inner.targets.contains_key(&id) {
            return Ok(None);
        }
        Ok(Some(inner.alert_states.get(&id).copied().unwrap_or_default()))
    }

    async fn save_alert_state(&self, id: TargetId, state: &AlertState) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.targets.contains_key(&id) {
            inner.alert_states.insert(id, *state);
        }
        Ok(())
    }

    async fn reset_alert_states(&self) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let reset = inner.alert_states.values().filter(|s| **s != AlertState::default()).count();
        inner.alert_states.clear();
        Ok(reset as u64)
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn record_check(&self, result: &CheckResult, requests: &[SubsequentRequest]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.results.push(result.clone());
        inner.requests.extend_from_slice(requests);
        Ok(())
    }

    async fn recent_results(&self, target_id: TargetId, limit: usize) -> Result<Vec<CheckResult>> {
        let inner = self.inner.read().await;
        let mut results: Vec<_> = inner.results.iter().rev().filter(|r| r.target_id == target_id).cloned().collect();
        // Stable sort keeps newest-recorded first among equal timestamps.
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        results.truncate(limit);
        Ok(results)
    }

    async fn subsequent_requests(&self, target_id: TargetId, filter: &RequestFilter) -> Result<Vec<SubsequentRequest>> {
        let inner = self.inner.read().await;
        let mut requests: Vec<_> = inner
            .requests
            .iter()
            .rev()
            .filter(|r| r.target_id == target_id && filter.matches(r))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        requests.truncate(filter.limit);
        Ok(requests)
    }
}
