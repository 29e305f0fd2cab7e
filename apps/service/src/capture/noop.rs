use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{ActiveCapture, CaptureBackend, CaptureError, RawEvent};

/// Backend for platforms without a capture mechanism: observes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

struct NoopCapture;

#[async_trait]
impl CaptureBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn start(&self, _target: &Url, _max_window: Duration) -> Result<Box<dyn ActiveCapture>, CaptureError> {
        Ok(Box::new(NoopCapture))
    }
}

#[async_trait]
impl ActiveCapture for NoopCapture {
    async fn stop(self: Box<Self>) -> Result<Vec<RawEvent>, CaptureError> {
        Ok(Vec::new())
    }
}
