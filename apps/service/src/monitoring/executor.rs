use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;
use url::Url;

use super::checker::{Checker, HttpChecker};
use super::types::CheckResult;
use crate::models::TargetId;

/// The HTML page a probe returned, kept for resource extraction
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub base_url: Url,
    pub body: String,
}

/// Outcome of one executed probe
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: CheckResult,
    pub elapsed: Duration,
    pub document: Option<FetchedDocument>,
}

/// Executes individual probes and turns them into check results
pub struct CheckExecutor {
    checker: Arc<dyn Checker>,
}

impl CheckExecutor {
    /// Create an executor backed by the HTTP checker
    pub fn new(timeout_seconds: u64, max_body_bytes: usize) -> anyhow::Result<Self> {
        Ok(Self::with_checker(Arc::new(HttpChecker::new(timeout_seconds, max_body_bytes)?)))
    }

    pub fn with_checker(checker: Arc<dyn Checker>) -> Self {
        Self { checker }
    }

    /// Run one probe. Never fails: transport problems become a down result.
    pub async fn execute(&self, target_id: TargetId, target: &str) -> Execution {
        let result = CheckResult::new(target_id, target.to_string(), Utc::now());
        let start = Instant::now();

        let outcome = self.checker.probe(target).await;
        let elapsed = start.elapsed();
        let response_time_ms = elapsed.as_millis() as u64;

        match outcome {
            Ok(response) => {
                debug!(target = %target, status = response.status_code, response_time_ms, "Probe answered");
                let document = response.document.and_then(|body| {
                    Url::parse(target).ok().map(|base_url| FetchedDocument { base_url, body })
                });
                Execution {
                    result: result.success(response_time_ms, response.status_code),
                    elapsed,
                    document,
                }
            }
            Err(e) => {
                debug!(target = %target, error = %e, response_time_ms, "Probe failed");
                Execution { result: result.failure(response_time_ms, e.to_string()), elapsed, document: None }
            }
        }
    }
}
