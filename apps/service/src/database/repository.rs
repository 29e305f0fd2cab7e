use anyhow::Result;
use async_trait::async_trait;
use libsql::params;

use super::models::{
    ALERT_COLUMNS, REQUEST_COLUMNS, RESULT_COLUMNS, TARGET_COLUMNS, alert_state_from_row, bool_to_i64,
    check_result_from_row, mode_to_columns, subsequent_request_from_row, target_from_row, timestamp_to_i64,
};
use super::{RequestFilter, ResultSink, TargetStore};
use crate::alerting::AlertState;
use crate::classify::SubsequentRequest;
use crate::models::{Target, TargetId};
use crate::monitoring::types::CheckResult;
use crate::pool::{LibsqlManager, LibsqlPool};

/// LibSQL database implementation
pub struct LibsqlStore {
    pool: LibsqlPool,
}

impl LibsqlStore {
    /// Create a new store from a pool whose schema is initialized
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    async fn query_targets(&self, where_clause: &str, args: impl libsql::params::IntoParams) -> Result<Vec<Target>> {
        let conn = self.get_conn().await?;
        let sql = format!("SELECT {TARGET_COLUMNS} FROM targets {where_clause} ORDER BY created_at, id");
        let mut rows = conn.query(&sql, args).await?;

        let mut targets = Vec::new();
        while let Some(row) = rows.next().await? {
            targets.push(target_from_row(&row)?);
        }
        Ok(targets)
    }
}

#[async_trait]
impl TargetStore for LibsqlStore {
    async fn list_active_targets(&self) -> Result<Vec<Target>> {
        self.query_targets("WHERE active = 1 AND mode = 'recurring'", ()).await
    }

    async fn list_targets(&self) -> Result<Vec<Target>> {
        self.query_targets("", ()).await
    }

    async fn get_target(&self, id: TargetId) -> Result<Option<Target>> {
        Ok(self.query_targets("WHERE id = ?1", params![id.to_string()]).await?.into_iter().next())
    }

    async fn save_target(&self, target: &Target) -> Result<()> {
        let conn = self.get_conn().await?;
        let (mode, interval_seconds) = mode_to_columns(target.mode);

        conn.execute(
            "INSERT INTO targets (id, url, name, mode, interval_seconds, active, alerts_enabled, notify_on_recovery, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                name = excluded.name,
                mode = excluded.mode,
                interval_seconds = excluded.interval_seconds,
                active = excluded.active,
                alerts_enabled = excluded.alerts_enabled,
                notify_on_recovery = excluded.notify_on_recovery,
                updated_at = excluded.updated_at",
            params![
                target.id.to_string(),
                target.url.clone(),
                target.name.clone(),
                mode,
                interval_seconds,
                bool_to_i64(target.active),
                bool_to_i64(target.alerts.enabled),
                bool_to_i64(target.alerts.notify_on_recovery),
                timestamp_to_i64(target.created_at),
                timestamp_to_i64(target.updated_at)
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_target(&self, id: TargetId) -> Result<bool> {
        let conn = self.get_conn().await?;
        let id = id.to_string();

        let tx = conn.transaction().await?;
        tx.execute("DELETE FROM subsequent_requests WHERE target_id = ?1", params![id.clone()]).await?;
        tx.execute("DELETE FROM check_results WHERE target_id = ?1", params![id.clone()]).await?;
        let deleted = tx.execute("DELETE FROM targets WHERE id = ?1", params![id]).await?;
        tx.commit().await?;

        Ok(deleted > 0)
    }

    async fn find_recurring_by_url(&self, url: &str) -> Result<Option<Target>> {
        let found = self
            .query_targets("WHERE url = ?1 AND mode = 'recurring'", params![url.to_string()])
            .await?;
        Ok(found.into_iter().next())
    }

    async fn load_alert_state(&self, id: TargetId) -> Result<Option<AlertState>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {ALERT_COLUMNS} FROM targets WHERE id = ?1"), params![id.to_string()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(alert_state_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_alert_state(&self, id: TargetId, state: &AlertState) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE targets SET consecutive_failures = ?1, last_alert_at = ?2, currently_down = ?3 WHERE id = ?4",
            params![
                state.consecutive_failures as i64,
                state.last_alert_at.map(timestamp_to_i64),
                bool_to_i64(state.currently_down),
                id.to_string()
            ],
        )
        .await?;
        Ok(())
    }

    async fn reset_alert_states(&self) -> Result<u64> {
        let conn = self.get_conn().await?;
        let reset = conn
            .execute(
                "UPDATE targets SET consecutive_failures = 0, last_alert_at = NULL, currently_down = 0
                 WHERE consecutive_failures != 0 OR last_alert_at IS NOT NULL OR currently_down != 0",
                (),
            )
            .await?;
        Ok(reset)
    }
}

#[async_trait]
impl ResultSink for LibsqlStore {
    async fn record_check(&self, result: &CheckResult, requests: &[SubsequentRequest]) -> Result<()> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!("INSERT INTO check_results ({RESULT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                result.id.to_string(),
                result.target_id.to_string(),
                result.target.clone(),
                timestamp_to_i64(result.timestamp),
                result.status.to_string(),
                result.status_code.map(|v| v as i64),
                result.response_time_ms as i64,
                result.error_message.clone()
            ],
        )
        .await?;

        for request in requests {
            tx.execute(
                &format!("INSERT INTO subsequent_requests ({REQUEST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    request.check_id.to_string(),
                    request.target_id.to_string(),
                    request.url.clone(),
                    request.ip.map(|ip| ip.to_string()),
                    request.resource_type.as_str(),
                    request.state_type.as_str(),
                    request.protocol.as_str(),
                    timestamp_to_i64(request.timestamp)
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn recent_results(&self, target_id: TargetId, limit: usize) -> Result<Vec<CheckResult>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RESULT_COLUMNS} FROM check_results WHERE target_id = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2"
                ),
                params![target_id.to_string(), limit as i64],
            )
            .await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            results.push(check_result_from_row(&row)?);
        }
        Ok(results)
    }

    async fn subsequent_requests(&self, target_id: TargetId, filter: &RequestFilter) -> Result<Vec<SubsequentRequest>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM subsequent_requests
                     WHERE target_id = ?1
                       AND (?2 IS NULL OR resource_type = ?2)
                       AND (?3 IS NULL OR state_type = ?3)
                       AND (?4 IS NULL OR protocol = ?4)
                     ORDER BY timestamp DESC, id DESC LIMIT ?5"
                ),
                params![
                    target_id.to_string(),
                    filter.resource_type.map(|t| t.as_str()),
                    filter.state_type.map(|t| t.as_str()),
                    filter.protocol.map(|p| p.as_str()),
                    filter.limit as i64
                ],
            )
            .await?;

        let mut requests = Vec::new();
        while let Some(row) = rows.next().await? {
            requests.push(subsequent_request_from_row(&row)?);
        }
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Protocol, ResourceType, StateType};
    use crate::database::open_pool;
    use chrono::{DateTime, Duration, Utc};
    use tempfile::{TempDir, tempdir};

    async fn store() -> Result<(LibsqlStore, TempDir)> {
        let dir = tempdir()?;
        let pool = open_pool(&dir.path().join("data").join("pagewatch.db")).await?;
        Ok((LibsqlStore::new_from_pool(pool), dir))
    }

    fn request(check: &CheckResult, url: &str, resource_type: ResourceType, protocol: Protocol) -> SubsequentRequest {
        SubsequentRequest {
            check_id: check.id,
            target_id: check.target_id,
            url: url.to_string(),
            ip: Some("93.184.216.34".parse().unwrap()),
            resource_type,
            state_type: StateType::Stateless,
            protocol,
            timestamp: check.timestamp,
        }
    }

    fn millis(time: DateTime<Utc>) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap()
    }

    #[tokio::test]
    async fn test_target_round_trip_and_listing() -> Result<()> {
        let (store, _dir) = store().await?;
        let mut target = Target::recurring("https://example.com", Some("Example"), 60, 10)?;
        target.created_at = millis(target.created_at);
        target.updated_at = millis(target.updated_at);
        let mut paused = Target::recurring("https://paused.example.com", None, 60, 10)?;
        paused.active = false;

        store.save_target(&target).await?;
        store.save_target(&paused).await?;

        assert_eq!(store.get_target(target.id).await?, Some(target.clone()));
        assert_eq!(store.list_targets().await?.len(), 2);
        let active: Vec<_> = store.list_active_targets().await?.into_iter().map(|t| t.id).collect();
        assert_eq!(active, vec![target.id]);
        assert_eq!(store.find_recurring_by_url("https://example.com/").await?.map(|t| t.id), Some(target.id));
        assert_eq!(store.find_recurring_by_url("https://other.example.com/").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_alert_state_survives_target_updates() -> Result<()> {
        let (store, _dir) = store().await?;
        let mut target = Target::recurring("https://example.com", None, 60, 10)?;
        store.save_target(&target).await?;

        let state = AlertState {
            consecutive_failures: 3,
            last_alert_at: Some(millis(Utc::now())),
            currently_down: true,
        };
        store.save_alert_state(target.id, &state).await?;

        target.name = "Renamed".into();
        store.save_target(&target).await?;
        assert_eq!(store.load_alert_state(target.id).await?, Some(state));

        assert_eq!(store.reset_alert_states().await?, 1);
        assert_eq!(store.load_alert_state(target.id).await?, Some(AlertState::default()));
        Ok(())
    }

    #[tokio::test]
    async fn test_check_history_with_filters() -> Result<()> {
        let (store, _dir) = store().await?;
        let target = Target::recurring("https://example.com", None, 60, 10)?;
        store.save_target(&target).await?;

        let older = CheckResult::new(target.id, target.url.clone(), millis(Utc::now()) - Duration::minutes(1))
            .failure(10_000, "request timed out after 10s".into());
        let newer = CheckResult::new(target.id, target.url.clone(), millis(Utc::now())).success(87, 200);
        store.record_check(&older, &[]).await?;
        store
            .record_check(
                &newer,
                &[
                    request(&newer, "https://cdn.example.com/app.js", ResourceType::Js, Protocol::Https),
                    request(&newer, "http://img.example.com/a.png", ResourceType::Image, Protocol::Http),
                ],
            )
            .await?;

        assert_eq!(store.recent_results(target.id, 100).await?, vec![newer.clone(), older]);
        assert_eq!(store.recent_results(target.id, 1).await?, vec![newer.clone()]);

        let all = store.subsequent_requests(target.id, &RequestFilter::default()).await?;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.check_id == newer.id));

        let filter = RequestFilter { protocol: Some(Protocol::Http), ..RequestFilter::default() };
        let http = store.subsequent_requests(target.id, &filter).await?;
        assert_eq!(http.len(), 1);
        assert_eq!(http[0].resource_type, ResourceType::Image);

        let filter = RequestFilter { state_type: Some(StateType::Stateful), ..RequestFilter::default() };
        assert!(store.subsequent_requests(target.id, &filter).await?.is_empty());

        assert!(store.delete_target(target.id).await?);
        assert!(!store.delete_target(target.id).await?);
        assert!(store.recent_results(target.id, 100).await?.is_empty());
        Ok(())
    }
}
