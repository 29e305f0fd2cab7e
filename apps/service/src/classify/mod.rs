//! Classification of captured traffic into subsequent requests.
//!
//! The [`Classifier`] resolves missing addresses up front, then hands back a
//! lazy [`SubsequentRequests`] iterator: records are built as they are
//! pulled, deduplicated by URL and kept in first-seen order.

pub mod document;
pub mod types;

pub use types::{Protocol, ResourceType, StateType, SubsequentRequest, UnknownVariant};

use std::collections::{HashMap, HashSet};
use std::iter::FusedIterator;
use std::net::IpAddr;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::capture::{RawEvent, Transport};
use crate::models::TargetId;
use crate::monitoring::types::CheckResult;

const TLS_PORTS: [u16; 2] = [443, 8443];
const PLAIN_HTTP_PORTS: [u16; 2] = [80, 8080];

#[derive(Debug, Clone)]
pub struct Classifier {
    dns_timeout: Duration,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Classifier {
    pub fn new(dns_timeout: Duration) -> Self {
        Self { dns_timeout }
    }

    /// Classify the events captured while `check` ran
    pub async fn classify(&self, check: &CheckResult, events: Vec<RawEvent>) -> SubsequentRequests {
        let resolved = self.resolve_missing(&events).await;
        SubsequentRequests::new(check, events, resolved)
    }

    async fn resolve_missing(&self, events: &[RawEvent]) -> HashMap<String, IpAddr> {
        let hosts: HashSet<&str> = events
            .iter()
            .filter(|event| event.remote_ip.is_none())
            .filter_map(|event| event.host.as_deref())
            .map(strip_port)
            .collect();

        let lookups = hosts.into_iter().map(|host| async move {
            let address = match timeout(self.dns_timeout, lookup_host((host, 0))).await {
                Ok(Ok(mut addrs)) => addrs.next().map(|addr| addr.ip()),
                Ok(Err(e)) => {
                    debug!(host, error = %e, "Host lookup failed");
                    None
                }
                Err(_) => {
                    debug!(host, "Host lookup timed out");
                    None
                }
            };
            address.map(|ip| (host.to_string(), ip))
        });

        join_all(lookups).await.into_iter().flatten().collect()
    }
}

/// Lazy sequence of classified requests for one check
pub struct SubsequentRequests {
    check_id: Uuid,
    target_id: TargetId,
    primary_url: Option<Url>,
    events: std::vec::IntoIter<RawEvent>,
    seen: HashSet<String>,
    resolved: HashMap<String, IpAddr>,
}

impl SubsequentRequests {
    fn new(check: &CheckResult, events: Vec<RawEvent>, resolved: HashMap<String, IpAddr>) -> Self {
        Self {
            check_id: check.id,
            target_id: check.target_id,
            primary_url: Url::parse(&check.target).ok(),
            events: events.into_iter(),
            seen: HashSet::new(),
            resolved,
        }
    }

    /// Whether `event` is the probe's own exchange
    fn is_primary(&self, event: &RawEvent, url: &str) -> bool {
        let Some(primary) = &self.primary_url else {
            return false;
        };
        if primary.as_str() == url {
            return true;
        }
        // A bare connection to the target host carries the probe itself.
        event.url.is_none()
            && event.path.is_none()
            && event.host.as_deref().map(strip_port) == primary.host_str()
    }

    fn build(&self, event: RawEvent, url: String, protocol: Protocol) -> SubsequentRequest {
        let ip = event.remote_ip.or_else(|| {
            event
                .host
                .as_deref()
                .and_then(|host| self.resolved.get(strip_port(host)).copied())
        });
        let path = event.url.as_ref().map(|u| u.path().to_string()).or(event.path.clone());

        SubsequentRequest {
            check_id: self.check_id,
            target_id: self.target_id,
            url,
            ip,
            resource_type: infer_resource_type(event.content_type.as_deref(), path.as_deref()),
            state_type: if event.session_bearing { StateType::Stateful } else { StateType::Stateless },
            protocol,
            timestamp: event.observed_at,
        }
    }
}

impl Iterator for SubsequentRequests {
    type Item = SubsequentRequest;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let event = self.events.next()?;
            let protocol = infer_protocol(&event);
            let Some(url) = event_url(&event, protocol) else { continue };

            if self.is_primary(&event, &url) || !self.seen.insert(url.clone()) {
                continue;
            }
            return Some(self.build(event, url, protocol));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.events.size_hint().1)
    }
}

impl FusedIterator for SubsequentRequests {}

pub fn infer_protocol(event: &RawEvent) -> Protocol {
    let port = event.remote_port.unwrap_or_default();
    let scheme = event.url.as_ref().map(Url::scheme);
    match event.transport {
        Some(Transport::Udp) if port == 443 => Protocol::Quic,
        Some(Transport::Udp) => Protocol::Udp,
        Some(Transport::Tcp) if event.tls_handshake || TLS_PORTS.contains(&port) || scheme == Some("https") => {
            Protocol::Https
        }
        Some(Transport::Tcp) if event.path.is_some() || PLAIN_HTTP_PORTS.contains(&port) || scheme == Some("http") => {
            Protocol::Http
        }
        Some(Transport::Tcp) => Protocol::Tcp,
        None => match scheme {
            Some("https") => Protocol::Https,
            Some("http") => Protocol::Http,
            _ => Protocol::Tcp,
        },
    }
}

/// Resource kind from the content type, falling back to the path extension
pub fn infer_resource_type(content_type: Option<&str>, path: Option<&str>) -> ResourceType {
    if let Some(kind) = content_type.and_then(resource_from_content_type) {
        return kind;
    }

    let Some(path) = path else {
        return ResourceType::Other;
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();
    if path.ends_with('/') {
        return ResourceType::Other;
    }
    mime_guess::from_path(path)
        .first()
        .and_then(|mime| resource_from_content_type(mime.essence_str()))
        .unwrap_or(ResourceType::Other)
}

fn resource_from_content_type(content_type: &str) -> Option<ResourceType> {
    let essence = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    if essence.contains("html") {
        Some(ResourceType::Html)
    } else if essence.contains("javascript") || essence.contains("ecmascript") {
        Some(ResourceType::Js)
    } else if essence == "text/css" {
        Some(ResourceType::Css)
    } else if essence.starts_with("image/") {
        Some(ResourceType::Image)
    } else {
        None
    }
}

/// URL for an event: observed directly, or rebuilt from host, port and path
fn event_url(event: &RawEvent, protocol: Protocol) -> Option<String> {
    if let Some(url) = &event.url {
        return Some(url.to_string());
    }

    let path = event.path.as_deref().unwrap_or("/");
    if path.starts_with("http://") || path.starts_with("https://") {
        // Proxy-form request target.
        return Url::parse(path).ok().map(String::from);
    }

    let scheme = protocol.scheme();
    let authority = match (&event.host, event.remote_ip) {
        (Some(host), _) if host.contains(':') && !host.starts_with('[') => host.clone(),
        (Some(host), _) => with_port(host.clone(), scheme, event.remote_port),
        (None, Some(IpAddr::V6(ip))) => with_port(format!("[{ip}]"), scheme, event.remote_port),
        (None, Some(ip)) => with_port(ip.to_string(), scheme, event.remote_port),
        (None, None) => return None,
    };
    let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
    let raw = format!("{scheme}://{authority}{path}");

    Some(Url::parse(&raw).map(String::from).unwrap_or(raw))
}

fn with_port(host: String, scheme: &str, port: Option<u16>) -> String {
    match (scheme, port) {
        ("http", Some(80)) | ("https", Some(443)) | (_, None) => host,
        (_, Some(port)) => format!("{host}:{port}"),
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.trim_start_matches('[').split(']').next().unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
