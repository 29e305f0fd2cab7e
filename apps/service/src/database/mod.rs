/// Persistence layer
///
/// The engine only sees the [`TargetStore`] and [`ResultSink`] traits. Two
/// implementations ship: [`LibsqlStore`] over a pooled local libsql database
/// and [`MemoryStore`] for tests and one-off checks.
pub mod memory;
pub mod migrations;
pub mod models;
pub mod repository;

pub use memory::MemoryStore;
pub use repository::LibsqlStore;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::alerting::AlertState;
use crate::classify::{Protocol, ResourceType, StateType, SubsequentRequest};
use crate::models::{Target, TargetId};
use crate::monitoring::types::CheckResult;
use crate::pool::{LibsqlManager, LibsqlPool};

/// Default number of rows returned by history queries
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Target configuration and alert snapshots
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Active recurring targets, the ones the scheduler should run
    async fn list_active_targets(&self) -> Result<Vec<Target>>;

    async fn list_targets(&self) -> Result<Vec<Target>>;

    async fn get_target(&self, id: TargetId) -> Result<Option<Target>>;

    /// Insert or update a target. Alert state is left untouched.
    async fn save_target(&self, target: &Target) -> Result<()>;

    /// Delete a target with its alert state and history. Returns whether it existed.
    async fn delete_target(&self, id: TargetId) -> Result<bool>;

    async fn find_recurring_by_url(&self, url: &str) -> Result<Option<Target>>;

    async fn load_alert_state(&self, id: TargetId) -> Result<Option<AlertState>>;

    async fn save_alert_state(&self, id: TargetId, state: &AlertState) -> Result<()>;

    /// Clear every alert snapshot, returning how many targets were reset
    async fn reset_alert_states(&self) -> Result<u64>;
}

/// Filters for subsequent-request history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFilter {
    pub resource_type: Option<ResourceType>,
    pub state_type: Option<StateType>,
    pub protocol: Option<Protocol>,
    pub limit: usize,
}

impl Default for RequestFilter {
    fn default() -> Self {
        Self { resource_type: None, state_type: None, protocol: None, limit: DEFAULT_HISTORY_LIMIT }
    }
}

impl RequestFilter {
    pub fn matches(&self, request: &SubsequentRequest) -> bool {
        self.resource_type.is_none_or(|t| t == request.resource_type)
            && self.state_type.is_none_or(|t| t == request.state_type)
            && self.protocol.is_none_or(|p| p == request.protocol)
    }
}

/// Check history
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist one check with the requests it observed, atomically
    async fn record_check(&self, result: &CheckResult, requests: &[SubsequentRequest]) -> Result<()>;

    /// Most recent results for a target, newest first
    async fn recent_results(&self, target_id: TargetId, limit: usize) -> Result<Vec<CheckResult>>;

    /// Most recent subsequent requests for a target, newest first
    async fn subsequent_requests(&self, target_id: TargetId, filter: &RequestFilter) -> Result<Vec<SubsequentRequest>>;
}

/// Open (creating if needed) the database at `path` and bring its schema up to date
pub async fn open_pool(path: &Path) -> Result<LibsqlPool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }

    let database = libsql::Builder::new_local(path)
        .build()
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    let pool = LibsqlPool::builder(LibsqlManager::new(database)).build()?;

    let conn = pool.get().await?;
    initialize_database(&conn).await?;
    Ok(pool)
}

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
