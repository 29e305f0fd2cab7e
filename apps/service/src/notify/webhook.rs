use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::{Value, json};

use super::{Notification, Notifier, NotifyError};
use crate::alerting::AlertEvent;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts Slack-compatible block messages to an incoming webhook
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(DELIVERY_TIMEOUT).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&payload(&notification))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }
}

/// Message body for one notification
pub fn payload(notification: &Notification) -> Value {
    let website = format!("*Website:*\n<{}|{}>", notification.target_url, notification.target_name);
    let details = &notification.details;

    match notification.event {
        AlertEvent::Down | AlertEvent::Redown => {
            let (text, header) = if notification.event == AlertEvent::Down {
                ("⚠️ URL Monitor Alert: Website Down", "⚠️ Website Down Alert")
            } else {
                ("⚠️ URL Monitor Alert: Website Still Down", "⚠️ Website Still Down")
            };
            let status_code = details.status_code.map_or_else(|| "N/A".to_string(), |c| c.to_string());
            let error = details.error.as_deref().unwrap_or("No error message");

            json!({
                "text": text,
                "blocks": [
                    { "type": "header", "text": { "type": "plain_text", "text": header, "emoji": true } },
                    { "type": "section", "fields": [
                        { "type": "mrkdwn", "text": website },
                        { "type": "mrkdwn", "text": "*Status:*\n❌ Down" }
                    ] },
                    { "type": "section", "fields": [
                        { "type": "mrkdwn", "text": format!("*Status Code:*\n{status_code}") },
                        { "type": "mrkdwn", "text": format!("*Error:*\n{error}") }
                    ] },
                    { "type": "context", "elements": [
                        { "type": "mrkdwn", "text": format!(
                            "The website has been down for {} consecutive checks.",
                            details.consecutive_failures
                        ) }
                    ] }
                ]
            })
        }
        AlertEvent::Recovered => json!({
            "text": "✅ URL Monitor Recovery: Website Back Online",
            "blocks": [
                { "type": "header", "text": { "type": "plain_text", "text": "✅ Website Recovered", "emoji": true } },
                { "type": "section", "fields": [
                    { "type": "mrkdwn", "text": website },
                    { "type": "mrkdwn", "text": "*Status:*\n✅ Online" }
                ] },
                { "type": "context", "elements": [
                    { "type": "mrkdwn", "text": "The website is now online after previous downtime." }
                ] }
            ]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationDetails;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn notification(event: AlertEvent) -> Notification {
        Notification {
            target_name: "Example".into(),
            target_url: "https://example.com/".into(),
            event,
            details: NotificationDetails {
                status_code: None,
                error: Some("connection failed: refused".into()),
                consecutive_failures: 3,
            },
        }
    }

    #[test]
    fn test_down_payload_carries_check_details() {
        let body = payload(&notification(AlertEvent::Down));

        assert_eq!(body["blocks"][0]["text"]["text"], "⚠️ Website Down Alert");
        assert_eq!(body["blocks"][1]["fields"][0]["text"], "*Website:*\n<https://example.com/|Example>");
        assert_eq!(body["blocks"][2]["fields"][0]["text"], "*Status Code:*\nN/A");
        assert_eq!(body["blocks"][2]["fields"][1]["text"], "*Error:*\nconnection failed: refused");
        assert_eq!(
            body["blocks"][3]["elements"][0]["text"],
            "The website has been down for 3 consecutive checks."
        );
    }

    #[test]
    fn test_redown_and_recovery_payloads() {
        let redown = payload(&notification(AlertEvent::Redown));
        assert_eq!(redown["blocks"][0]["text"]["text"], "⚠️ Website Still Down");

        let recovered = payload(&notification(AlertEvent::Recovered));
        assert_eq!(recovered["blocks"][0]["text"]["text"], "✅ Website Recovered");
        assert_eq!(recovered["blocks"].as_array().map(Vec::len), Some(3));
    }

    /// Answers one request with `status` and hands back the request body
    async fn capture_one(status: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            let body = loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if body.len() >= length || n == 0 {
                        break body.to_string();
                    }
                }
                if n == 0 {
                    break String::new();
                }
            };
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 7\r\nconnection: close\r\n\r\nno_hook");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            let _ = tx.send(body);
        });
        (format!("http://{addr}/hook"), rx)
    }

    #[tokio::test]
    async fn test_delivery_posts_json_payload() {
        let (url, body) = capture_one("200 OK").await;
        let notifier = WebhookNotifier::new(url).unwrap();

        notifier.notify(notification(AlertEvent::Down)).await.unwrap();

        let delivered: Value = serde_json::from_str(&body.await.unwrap()).unwrap();
        assert_eq!(delivered, payload(&notification(AlertEvent::Down)));
    }

    #[tokio::test]
    async fn test_delivery_reports_rejection() {
        let (url, _body) = capture_one("404 Not Found").await;
        let notifier = WebhookNotifier::new(url).unwrap();

        match notifier.notify(notification(AlertEvent::Recovered)).await {
            Err(NotifyError::Status { status, body }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "no_hook");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
