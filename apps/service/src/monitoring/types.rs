use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::SubsequentRequest;
use crate::models::TargetId;

/// Status of a monitoring check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Up,
    Down,
}

impl MonitorStatus {
    pub fn is_up(self) -> bool {
        self == MonitorStatus::Up
    }
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorStatus::Up => f.pad("up"),
            MonitorStatus::Down => f.pad("down"),
        }
    }
}

/// Result of a monitoring check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Unique id of this check, referenced by subsequent requests
    pub id: Uuid,

    /// Target that was checked
    pub target_id: TargetId,

    /// URL that was probed
    pub target: String,

    /// Timestamp when the check was started
    pub timestamp: DateTime<Utc>,

    pub status: MonitorStatus,

    /// HTTP status code (if a response arrived)
    pub status_code: Option<u16>,

    /// Time from send to full response, or to the failure
    pub response_time_ms: u64,

    /// Error message (if check failed)
    pub error_message: Option<String>,
}

impl CheckResult {
    /// Create a new check result, initially down with no detail
    pub fn new(target_id: TargetId, target: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id,
            target,
            timestamp,
            status: MonitorStatus::Down,
            status_code: None,
            response_time_ms: 0,
            error_message: None,
        }
    }

    /// Mark the check as successful
    pub fn success(mut self, response_time_ms: u64, status_code: u16) -> Self {
        self.status = MonitorStatus::Up;
        self.response_time_ms = response_time_ms;
        self.status_code = Some(status_code);
        self.error_message = None;
        self
    }

    /// Mark the check as failed with error
    pub fn failure(mut self, response_time_ms: u64, error: String) -> Self {
        self.status = MonitorStatus::Down;
        self.response_time_ms = response_time_ms;
        self.error_message = Some(error);
        self
    }

    pub fn is_up(&self) -> bool {
        self.status.is_up()
    }
}

/// Everything one check produced: the probe outcome and the secondary
/// requests observed while it ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub result: CheckResult,
    pub subsequent_requests: Vec<SubsequentRequest>,
}
