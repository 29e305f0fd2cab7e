use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use url::Url;

use super::executor::CheckExecutor;
use super::types::CheckReport;
use crate::capture::{CaptureBackend, CaptureSession, CaptureSettings};
use crate::classify::{Classifier, document};
use crate::models::Target;

/// One full check: capture around the probe, then classification
pub struct CheckPipeline {
    executor: CheckExecutor,
    capture: Arc<dyn CaptureBackend>,
    classifier: Classifier,
    capture_settings: CaptureSettings,
    document_fallback: bool,
}

impl CheckPipeline {
    pub fn new(
        executor: CheckExecutor,
        capture: Arc<dyn CaptureBackend>,
        classifier: Classifier,
        capture_settings: CaptureSettings,
        document_fallback: bool,
    ) -> Self {
        Self { executor, capture, classifier, capture_settings, document_fallback }
    }

    /// Run one check against `target`. Never fails.
    pub async fn run(&self, target: &Target) -> CheckReport {
        let session = match Url::parse(&target.url) {
            Ok(url) => Some(CaptureSession::start(self.capture.as_ref(), &url, self.capture_settings).await),
            Err(_) => None,
        };

        let execution = self.executor.execute(target.id, &target.url).await;

        let events = match session {
            Some(session) => session.finish().await,
            None => Vec::new(),
        };

        // The probe's own connection is always captured but never reported, so
        // the page is consulted whenever nothing else was classified.
        let mut subsequent_requests: Vec<_> = self.classifier.classify(&execution.result, events).await.collect();
        if subsequent_requests.is_empty() && self.document_fallback {
            if let Some(page) = &execution.document {
                let events = document::extract_resources(page, Utc::now());
                subsequent_requests = self.classifier.classify(&execution.result, events).await.collect();
            }
        }
        debug!(
            target_id = %target.id,
            status = %execution.result.status,
            response_time_ms = execution.result.response_time_ms,
            subsequent_requests = subsequent_requests.len(),
            "Check completed"
        );

        CheckReport { result: execution.result, subsequent_requests }
    }
}
