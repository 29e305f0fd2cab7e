//! Row mapping between the libsql schema and the domain types.
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use libsql::Row;
use uuid::Uuid;

use crate::alerting::AlertState;
use crate::classify::SubsequentRequest;
use crate::models::{AlertSettings, Target, TargetMode};
use crate::monitoring::types::{CheckResult, MonitorStatus};

pub const TARGET_COLUMNS: &str =
    "id, url, name, mode, interval_seconds, active, alerts_enabled, notify_on_recovery, created_at, updated_at";

pub const RESULT_COLUMNS: &str = "id, target_id, target, timestamp, status, status_code, response_time_ms, error_message";

pub const REQUEST_COLUMNS: &str = "check_id, target_id, url, ip, resource_type, state_type, protocol, timestamp";

pub const ALERT_COLUMNS: &str = "consecutive_failures, last_alert_at, currently_down";

const MODE_RECURRING: &str = "recurring";
const MODE_ONE_TIME: &str = "one_time";

/// Convert a timestamp to Unix milliseconds
pub fn timestamp_to_i64(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert Unix milliseconds to a timestamp
pub fn i64_to_timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub fn bool_to_i64(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

/// `mode` and `interval_seconds` column values
pub fn mode_to_columns(mode: TargetMode) -> (&'static str, Option<i64>) {
    match mode {
        TargetMode::Recurring { interval_seconds } => (MODE_RECURRING, Some(interval_seconds as i64)),
        TargetMode::OneTime => (MODE_ONE_TIME, None),
    }
}

fn parse_uuid(row: &Row, idx: i32) -> Result<Uuid> {
    let value: String = row.get(idx)?;
    Ok(Uuid::parse_str(&value)?)
}

/// Map a row selected with [`TARGET_COLUMNS`]
pub fn target_from_row(row: &Row) -> Result<Target> {
    let mode: String = row.get(3)?;
    let mode = match (mode.as_str(), row.get::<Option<i64>>(4)?) {
        (MODE_RECURRING, Some(interval)) => TargetMode::Recurring { interval_seconds: interval.max(0) as u64 },
        (MODE_ONE_TIME, _) => TargetMode::OneTime,
        (other, _) => return Err(anyhow!("Invalid target mode '{other}'")),
    };

    Ok(Target {
        id: parse_uuid(row, 0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        mode,
        active: row.get::<i64>(5)? != 0,
        alerts: AlertSettings {
            enabled: row.get::<i64>(6)? != 0,
            notify_on_recovery: row.get::<i64>(7)? != 0,
        },
        created_at: i64_to_timestamp(row.get(8)?),
        updated_at: i64_to_timestamp(row.get(9)?),
    })
}

/// Map a row selected with [`ALERT_COLUMNS`]
pub fn alert_state_from_row(row: &Row) -> Result<AlertState> {
    Ok(AlertState {
        consecutive_failures: row.get::<i64>(0)?.clamp(0, u32::MAX as i64) as u32,
        last_alert_at: row.get::<Option<i64>>(1)?.map(i64_to_timestamp),
        currently_down: row.get::<i64>(2)? != 0,
    })
}

/// Map a row selected with [`RESULT_COLUMNS`]
pub fn check_result_from_row(row: &Row) -> Result<CheckResult> {
    let status: String = row.get(4)?;
    let status = match status.as_str() {
        "up" => MonitorStatus::Up,
        "down" => MonitorStatus::Down,
        other => return Err(anyhow!("Invalid check status '{other}'")),
    };

    Ok(CheckResult {
        id: parse_uuid(row, 0)?,
        target_id: parse_uuid(row, 1)?,
        target: row.get(2)?,
        timestamp: i64_to_timestamp(row.get(3)?),
        status,
        status_code: row.get::<Option<i64>>(5)?.map(|v| v as u16),
        response_time_ms: row.get::<i64>(6)?.max(0) as u64,
        error_message: row.get(7)?,
    })
}

/// Map a row selected with [`REQUEST_COLUMNS`]
pub fn subsequent_request_from_row(row: &Row) -> Result<SubsequentRequest> {
    let ip = row.get::<Option<String>>(3)?.map(|ip| ip.parse()).transpose()?;
    let resource_type: String = row.get(4)?;
    let state_type: String = row.get(5)?;
    let protocol: String = row.get(6)?;

    Ok(SubsequentRequest {
        check_id: parse_uuid(row, 0)?,
        target_id: parse_uuid(row, 1)?,
        url: row.get(2)?,
        ip,
        resource_type: resource_type.parse()?,
        state_type: state_type.parse()?,
        protocol: protocol.parse()?,
        timestamp: i64_to_timestamp(row.get(7)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_keep_millisecond_precision() {
        let time = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(i64_to_timestamp(timestamp_to_i64(time)), time);
    }

    #[test]
    fn test_mode_columns() {
        assert_eq!(mode_to_columns(TargetMode::Recurring { interval_seconds: 60 }), ("recurring", Some(60)));
        assert_eq!(mode_to_columns(TargetMode::OneTime), ("one_time", None));
    }
}
