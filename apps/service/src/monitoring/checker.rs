use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use thiserror::Error;

/// Why a probe produced no response. Every variant maps to a down result.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Transport(String),
}

/// What came back from a probe that received a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status_code: u16,
    pub content_type: Option<String>,
    /// HTML body, kept only for `text/html` responses and truncated to the
    /// checker's body limit.
    pub document: Option<String>,
}

/// Checker trait for probe implementations
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    /// Issue one probe against `target` and wait for the full response
    async fn probe(&self, target: &str) -> Result<ProbeResponse, ProbeError>;
}

/// HTTP/HTTPS checker
pub struct HttpChecker {
    client: reqwest::Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl HttpChecker {
    pub fn new(timeout_seconds: u64, max_body_bytes: usize) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(timeout_seconds);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pagewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, timeout, max_body_bytes })
    }

    fn map_error(&self, error: reqwest::Error) -> ProbeError {
        if error.is_timeout() {
            ProbeError::Timeout(self.timeout)
        } else if error.is_connect() {
            ProbeError::Connect(error.to_string())
        } else {
            ProbeError::Transport(error.to_string())
        }
    }
}

#[async_trait::async_trait]
impl Checker for HttpChecker {
    async fn probe(&self, target: &str) -> Result<ProbeResponse, ProbeError> {
        let mut response = self.client.get(target).send().await.map_err(|e| self.map_error(e))?;

        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_ascii_lowercase);
        let is_html = content_type.as_deref().is_some_and(|ct| ct.contains("text/html"));

        // Drain the body so the measured time covers the full response.
        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_error(e))? {
            if !is_html || truncated {
                continue;
            }
            let room = self.max_body_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
            } else {
                body.extend_from_slice(&chunk);
            }
        }

        let document = is_html.then(|| String::from_utf8_lossy(&body).into_owned());

        Ok(ProbeResponse { status_code, content_type, document })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `response` verbatim to every connection, returning the base URL.
    pub(crate) async fn serve_fixed(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn test_server_error_still_gets_a_response() {
        let url = serve_fixed(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let checker = HttpChecker::new(5, 1024).unwrap();

        let response = checker.probe(&url).await.unwrap();
        assert_eq!(response.status_code, 503);
        assert_eq!(response.document, None);
    }

    #[tokio::test]
    async fn test_html_document_is_kept_and_truncated() {
        let url = serve_fixed(
            "HTTP/1.1 200 OK\r\ncontent-type: text/html; charset=utf-8\r\ncontent-length: 28\r\nconnection: close\r\n\r\n<html><body>hi</body></html>",
        )
        .await;
        let checker = HttpChecker::new(5, 12).unwrap();

        let response = checker.probe(&url).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content_type.as_deref(), Some("text/html; charset=utf-8"));
        assert_eq!(response.document.as_deref(), Some("<html><body>"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let checker = HttpChecker::new(2, 1024).unwrap();
        let error = checker.probe(&format!("http://{addr}/")).await.unwrap_err();
        assert!(matches!(error, ProbeError::Connect(_) | ProbeError::Transport(_)));
    }
}
