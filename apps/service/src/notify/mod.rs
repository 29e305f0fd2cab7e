pub mod webhook;

pub use webhook::WebhookNotifier;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::alerting::AlertEvent;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("webhook returned non-success status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Check outcome attached to a notification
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotificationDetails {
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub target_name: String,
    pub target_url: String,
    pub event: AlertEvent,
    pub details: NotificationDetails,
}

/// Outbound alert delivery.
///
/// Implementations are shared across target tasks and must tolerate
/// concurrent calls.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Used when no webhook is configured: logs and drops
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        debug!(
            target_url = %notification.target_url,
            event = %notification.event,
            "No webhook configured, dropping notification"
        );
        Ok(())
    }
}
