use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::lookup_host;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};
use url::{Host, Url};

use super::{ActiveCapture, CaptureBackend, CaptureError, RawEvent, Transport};

const HTTP_METHODS: [&str; 7] = ["GET ", "POST ", "PUT ", "DELETE ", "HEAD ", "OPTIONS ", "PATCH "];
const SERVICE_PORTS: [u16; 4] = [80, 443, 8080, 8443];
const TLS_PORTS: [u16; 2] = [443, 8443];
const DNS_PORT: u16 = 53;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Packet capture through the system `tcpdump` binary
#[derive(Debug, Clone)]
pub struct TcpdumpBackend {
    binary: String,
    interface: String,
    filter: String,
    max_packets: u32,
}

impl TcpdumpBackend {
    pub fn new(binary: impl Into<String>, interface: impl Into<String>, filter: impl Into<String>, max_packets: u32) -> Self {
        Self { binary: binary.into(), interface: interface.into(), filter: filter.into(), max_packets }
    }
}

#[async_trait]
impl CaptureBackend for TcpdumpBackend {
    fn name(&self) -> &'static str {
        "tcpdump"
    }

    async fn start(&self, target: &Url, max_window: Duration) -> Result<Box<dyn ActiveCapture>, CaptureError> {
        let addresses = target_addresses(target).await?;
        let filter = scoped_filter(&self.filter, &addresses);

        let mut child = Command::new(&self.binary)
            .args(["-l", "-n", "-A", "-i", &self.interface, "-c", &self.max_packets.to_string()])
            .arg(&filter)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => CaptureError::Unavailable(format!("{} not found", self.binary)),
                ErrorKind::PermissionDenied => CaptureError::PermissionDenied(e.to_string()),
                _ => CaptureError::Io(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Unavailable("tcpdump stdout not captured".into()))?;
        let mut stderr = child.stderr.take();

        debug!(target = %target, interface = %self.interface, filter = %filter, "Started tcpdump capture");

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut parser = TcpdumpParser::default();
            let mut lines = BufReader::new(stdout).lines();
            let window = tokio::time::sleep(max_window);
            tokio::pin!(window);

            // Whether the process went away on its own before we stopped it
            let mut exited_early = false;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = &mut window => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => parser.feed_line(&line, Utc::now()),
                        Ok(None) => {
                            exited_early = true;
                            break;
                        }
                        Err(e) => {
                            debug!(error = %e, "Failed reading tcpdump output");
                            break;
                        }
                    }
                }
            }

            let _ = child.start_kill();
            let status = child.wait().await?;

            let events = parser.finish();
            if exited_early && !status.success() && events.is_empty() {
                let mut message = String::new();
                if let Some(stderr) = stderr.as_mut() {
                    let _ = stderr.read_to_string(&mut message).await;
                }
                let message = message.trim().to_string();
                return Err(if message.to_ascii_lowercase().contains("permission") {
                    CaptureError::PermissionDenied(message)
                } else {
                    CaptureError::Exited(format!("{status}: {message}"))
                });
            }

            Ok::<_, CaptureError>(events)
        });

        Ok(Box::new(TcpdumpCapture { stop_tx: Some(stop_tx), task }))
    }
}

/// Addresses the probe of `target` will connect to
async fn target_addresses(target: &Url) -> Result<Vec<IpAddr>, CaptureError> {
    let domain = match target.host() {
        Some(Host::Ipv4(ip)) => return Ok(vec![IpAddr::V4(ip)]),
        Some(Host::Ipv6(ip)) => return Ok(vec![IpAddr::V6(ip)]),
        Some(Host::Domain(domain)) => domain,
        None => return Err(CaptureError::Unscoped(format!("{target} has no host"))),
    };

    let port = target.port_or_known_default().unwrap_or(80);
    let resolved = timeout(RESOLVE_TIMEOUT, lookup_host((domain, port)))
        .await
        .map_err(|_| CaptureError::Unscoped(format!("resolving {domain} timed out")))?
        .map_err(|e| CaptureError::Unscoped(format!("cannot resolve {domain}: {e}")))?;

    let mut addresses: Vec<IpAddr> = resolved.map(|addr| addr.ip()).collect();
    addresses.sort();
    addresses.dedup();
    if addresses.is_empty() {
        return Err(CaptureError::Unscoped(format!("{domain} has no addresses")));
    }
    Ok(addresses)
}

/// Narrow `base` to traffic exchanged with `addresses`, so concurrent checks
/// and unrelated processes stay out of this capture
fn scoped_filter(base: &str, addresses: &[IpAddr]) -> String {
    let hosts = addresses.iter().map(|ip| format!("host {ip}")).collect::<Vec<_>>().join(" or ");
    let base = base.trim();
    match (base.is_empty(), hosts.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => hosts,
        (false, false) => format!("({base}) and ({hosts})"),
    }
}

struct TcpdumpCapture {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<Vec<RawEvent>, CaptureError>>,
}

#[async_trait]
impl ActiveCapture for TcpdumpCapture {
    async fn stop(mut self: Box<Self>) -> Result<Vec<RawEvent>, CaptureError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|e| CaptureError::Exited(format!("capture task failed: {e}")))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    remote_ip: IpAddr,
    remote_port: u16,
    local_port: u16,
}

#[derive(Debug)]
struct Packet {
    observed_at: DateTime<Utc>,
    transport: Transport,
    direction: Option<Direction>,
    src: (IpAddr, u16),
    dst: (IpAddr, u16),
    payload: Vec<String>,
}

impl Packet {
    fn is_outbound(&self) -> bool {
        match self.direction {
            Some(direction) => direction == Direction::Out,
            None => SERVICE_PORTS.contains(&self.dst.1) || (!SERVICE_PORTS.contains(&self.src.1) && self.dst.1 < self.src.1),
        }
    }
}

/// Turns `tcpdump -n -A -l` line output into raw events.
///
/// Each new outbound flow yields one event. Plaintext HTTP requests on a flow
/// refine it (path, `Host`, cookies), responses annotate the request they
/// answer (content type, `Set-Cookie`), and TLS ClientHello payloads on the
/// TLS ports contribute the SNI host.
#[derive(Debug, Default)]
pub struct TcpdumpParser {
    pending: Option<Packet>,
    events: Vec<RawEvent>,
    flows: HashMap<FlowKey, usize>,
}

impl TcpdumpParser {
    pub fn feed_line(&mut self, line: &str, observed_at: DateTime<Utc>) {
        if let Some(packet) = parse_header(line, observed_at) {
            if let Some(previous) = self.pending.replace(packet) {
                self.absorb(previous);
            }
        } else if let Some(packet) = self.pending.as_mut() {
            packet.payload.push(line.to_string());
        } else {
            trace!(line, "Ignoring tcpdump line outside a packet");
        }
    }

    pub fn finish(mut self) -> Vec<RawEvent> {
        if let Some(packet) = self.pending.take() {
            self.absorb(packet);
        }
        self.events
    }

    fn absorb(&mut self, packet: Packet) {
        if packet.is_outbound() {
            self.absorb_outbound(packet);
        } else {
            self.absorb_inbound(packet);
        }
    }

    fn absorb_outbound(&mut self, packet: Packet) {
        let (remote_ip, remote_port) = packet.dst;
        if remote_port == DNS_PORT {
            return;
        }
        let key = FlowKey { remote_ip, remote_port, local_port: packet.src.1 };

        if let Some(request) = find_http_request(&packet.payload) {
            let mut event = self.flow_event(&packet);
            event.path = Some(request.path);
            event.host = request.host;
            event.session_bearing = request.session_bearing;

            match self.flows.get(&key).copied() {
                // First request on a connection replaces its placeholder.
                Some(index) if self.events[index].path.is_none() => {
                    event.observed_at = self.events[index].observed_at;
                    self.events[index] = event;
                }
                _ => {
                    self.flows.insert(key, self.events.len());
                    self.events.push(event);
                }
            }
            return;
        }

        let index = match self.flows.get(&key).copied() {
            Some(index) => index,
            None => {
                let event = self.flow_event(&packet);
                self.flows.insert(key, self.events.len());
                self.events.push(event);
                self.events.len() - 1
            }
        };

        if packet.transport == Transport::Tcp && TLS_PORTS.contains(&remote_port) {
            if let Some(host) = find_sni_host(&packet.payload) {
                let event = &mut self.events[index];
                event.tls_handshake = true;
                if event.host.is_none() {
                    event.host = Some(host);
                }
            }
        }
    }

    fn absorb_inbound(&mut self, packet: Packet) {
        let (remote_ip, remote_port) = packet.src;
        let key = FlowKey { remote_ip, remote_port, local_port: packet.dst.1 };
        let Some(index) = self.flows.get(&key).copied() else {
            return;
        };
        let Some(response) = find_http_response(&packet.payload) else {
            return;
        };

        let event = &mut self.events[index];
        if event.content_type.is_none() {
            event.content_type = response.content_type;
        }
        event.session_bearing |= response.sets_cookie;
    }

    fn flow_event(&self, packet: &Packet) -> RawEvent {
        let mut event = RawEvent::new(packet.observed_at);
        event.transport = Some(packet.transport);
        event.remote_ip = Some(packet.dst.0);
        event.remote_port = Some(packet.dst.1);
        event
    }
}

/// Parse a packet summary line such as
/// `12:00:00.000000 eth0 Out IP 10.0.0.2.51234 > 93.184.216.34.80: Flags [S], ...`
fn parse_header(line: &str, observed_at: DateTime<Utc>) -> Option<Packet> {
    let first = line.split_whitespace().next()?;
    if !first.contains(':') || !first.contains('.') || !first.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }

    let mut tokens = line.split_whitespace().skip(1);
    let mut direction = None;
    loop {
        match tokens.next()? {
            "In" => direction = Some(Direction::In),
            "Out" => direction = Some(Direction::Out),
            "IP" | "IP6" => break,
            _ => {}
        }
    }

    let src = parse_endpoint(tokens.next()?)?;
    if tokens.next()? != ">" {
        return None;
    }
    let dst = parse_endpoint(tokens.next()?.strip_suffix(':')?)?;

    let rest: Vec<&str> = tokens.collect();
    let rest = rest.join(" ");
    let transport = if rest.contains("Flags [") {
        Transport::Tcp
    } else if rest.contains("UDP") || dst.1 == DNS_PORT || src.1 == DNS_PORT {
        Transport::Udp
    } else {
        return None;
    };

    Some(Packet { observed_at, transport, direction, src, dst, payload: Vec::new() })
}

/// `93.184.216.34.443` or `2606:2800::1.443`
fn parse_endpoint(token: &str) -> Option<(IpAddr, u16)> {
    let (ip, port) = token.rsplit_once('.')?;
    Some((ip.parse().ok()?, port.parse().ok()?))
}

struct HttpRequest {
    path: String,
    host: Option<String>,
    session_bearing: bool,
}

struct HttpResponse {
    content_type: Option<String>,
    sets_cookie: bool,
}

fn find_http_request(payload: &[String]) -> Option<HttpRequest> {
    let (start, path) = payload.iter().enumerate().find_map(|(i, line)| {
        let method_at = HTTP_METHODS.iter().filter_map(|m| line.find(m)).min()?;
        let mut parts = line[method_at..].split_whitespace();
        let _method = parts.next()?;
        let path = parts.next()?;
        parts.next()?.starts_with("HTTP/").then(|| (i, path.to_string()))
    })?;

    let mut request = HttpRequest { path, host: None, session_bearing: false };
    for (name, value) in headers(&payload[start + 1..]) {
        match name.as_str() {
            "host" => request.host = Some(value.to_ascii_lowercase()),
            "cookie" | "authorization" => request.session_bearing = true,
            _ => {}
        }
    }
    Some(request)
}

fn find_http_response(payload: &[String]) -> Option<HttpResponse> {
    let start = payload.iter().position(|line| {
        line.find("HTTP/1.").is_some_and(|at| {
            line[at..].split_whitespace().nth(1).is_some_and(|code| code.len() == 3 && code.bytes().all(|b| b.is_ascii_digit()))
        })
    })?;

    let mut response = HttpResponse { content_type: None, sets_cookie: false };
    for (name, value) in headers(&payload[start + 1..]) {
        match name.as_str() {
            "content-type" => response.content_type = Some(value.to_ascii_lowercase()),
            "set-cookie" => response.sets_cookie = true,
            _ => {}
        }
    }
    Some(response)
}

/// Header lines up to the first blank line, names lowercased
fn headers(lines: &[String]) -> impl Iterator<Item = (String, String)> + '_ {
    lines
        .iter()
        .map(|line| line.trim_end_matches('\r'))
        .take_while(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
}

/// Find a plausible host name in an ASCII-rendered TLS ClientHello
fn find_sni_host(payload: &[String]) -> Option<String> {
    // Non-printable bytes render as '.', so runs of dots separate tokens too.
    payload.iter().find_map(|line| {
        line.split(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-'))
            .flat_map(|chunk| chunk.split(".."))
            .map(|candidate| candidate.trim_matches('.'))
            .find(|candidate| is_plausible_hostname(candidate))
            .map(str::to_ascii_lowercase)
    })
}

fn is_plausible_hostname(candidate: &str) -> bool {
    if candidate.len() < 4 || candidate.len() > 253 || !candidate.contains('.') {
        return false;
    }
    let labels: Vec<&str> = candidate.split('.').collect();
    let labels_ok = labels
        .iter()
        .all(|label| !label.is_empty() && !label.starts_with('-') && !label.ends_with('-'));
    let tld_ok = labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()));
    labels_ok && tld_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSession, CaptureSettings};

    fn parse(lines: &[&str]) -> Vec<RawEvent> {
        let mut parser = TcpdumpParser::default();
        for line in lines {
            parser.feed_line(line, Utc::now());
        }
        parser.finish()
    }

    #[test]
    fn test_plain_http_request_and_response() {
        let events = parse(&[
            "12:00:00.000001 eth0 Out IP 10.0.0.2.51000 > 93.184.216.34.80: Flags [S], seq 1, win 64240, length 0",
            "E..<..@.@.",
            "12:00:00.000200 eth0 Out IP 10.0.0.2.51000 > 93.184.216.34.80: Flags [P.], seq 1:80, ack 1, win 502, length 79: HTTP: GET /static/app.js HTTP/1.1",
            "E.....@.@.....GET /static/app.js HTTP/1.1",
            "Host: cdn.example.com",
            "Cookie: session=abc",
            "",
            "12:00:00.000900 eth0 In  IP 93.184.216.34.80 > 10.0.0.2.51000: Flags [P.], seq 1:200, ack 80, win 509, length 199: HTTP: HTTP/1.1 200 OK",
            "E.....@.8.....HTTP/1.1 200 OK",
            "Content-Type: Application/JavaScript",
            "Content-Length: 120",
            "",
        ]);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.transport, Some(Transport::Tcp));
        assert_eq!(event.remote_ip, Some("93.184.216.34".parse().unwrap()));
        assert_eq!(event.remote_port, Some(80));
        assert_eq!(event.host.as_deref(), Some("cdn.example.com"));
        assert_eq!(event.path.as_deref(), Some("/static/app.js"));
        assert_eq!(event.content_type.as_deref(), Some("application/javascript"));
        assert!(event.session_bearing);
    }

    #[test]
    fn test_tls_flow_picks_up_sni_host() {
        let events = parse(&[
            "12:00:01.000000 IP 10.0.0.2.52000 > 151.101.1.69.443: Flags [S], seq 9, win 64240, length 0",
            "12:00:01.000100 IP 10.0.0.2.52000 > 151.101.1.69.443: Flags [P.], seq 1:518, ack 1, win 502, length 517",
            "E..-..@.@.........................fonts.gstatic.com.........h2.http/1.1",
            "12:00:01.000300 IP 10.0.0.2.52000 > 151.101.1.69.443: Flags [.], ack 100, win 500, length 0",
        ]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].host.as_deref(), Some("fonts.gstatic.com"));
        assert!(events[0].tls_handshake);
        assert_eq!(events[0].path, None);
    }

    #[test]
    fn test_udp_quic_flow_and_dns_skipped() {
        let events = parse(&[
            "12:00:02.000000 IP 10.0.0.2.40000 > 1.1.1.1.53: 1234+ A? cdn.example.com. (33)",
            "12:00:02.000100 IP 10.0.0.2.40001 > 142.250.74.36.443: UDP, length 1250",
            "12:00:02.000200 IP 10.0.0.2.40001 > 142.250.74.36.443: UDP, length 1250",
        ]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transport, Some(Transport::Udp));
        assert_eq!(events[0].remote_port, Some(443));
    }

    #[test]
    fn test_ipv6_endpoint_parsing() {
        assert_eq!(parse_endpoint("2606:2800:220:1::1.443"), Some(("2606:2800:220:1::1".parse().unwrap(), 443)));
        assert_eq!(parse_endpoint("10.0.0.2.51000"), Some(("10.0.0.2".parse().unwrap(), 51000)));
        assert_eq!(parse_endpoint("garbage"), None);
    }

    #[test]
    fn test_non_header_lines_are_ignored() {
        assert!(parse(&["listening on any, link-type LINUX_SLL2", "GET / HTTP/1.1"]).is_empty());
    }

    #[test]
    fn test_hostname_plausibility() {
        assert!(is_plausible_hostname("example.com"));
        assert!(is_plausible_hostname("a-b.cdn.example.co"));
        assert!(!is_plausible_hostname("E..t"));
        assert!(!is_plausible_hostname("1.1"));
        assert!(!is_plausible_hostname("10.0.0.2"));
    }

    #[test]
    fn test_filter_is_scoped_to_target_addresses() {
        let addresses: [IpAddr; 2] = ["93.184.216.34".parse().unwrap(), "2606:2800:220:1::1".parse().unwrap()];

        assert_eq!(
            scoped_filter("tcp port 80 or tcp port 443", &addresses),
            "(tcp port 80 or tcp port 443) and (host 93.184.216.34 or host 2606:2800:220:1::1)"
        );
        assert_eq!(scoped_filter("  ", &addresses[..1]), "host 93.184.216.34");
    }

    #[tokio::test]
    async fn test_literal_targets_are_not_resolved() {
        let v4 = target_addresses(&Url::parse("http://127.0.0.1:8080/").unwrap()).await.unwrap();
        assert_eq!(v4, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let v6 = target_addresses(&Url::parse("https://[::1]/").unwrap()).await.unwrap();
        assert_eq!(v6, vec!["::1".parse::<IpAddr>().unwrap()]);
    }

    fn local_target() -> Url {
        Url::parse("http://127.0.0.1:8080/").unwrap()
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = TcpdumpBackend::new("/nonexistent/tcpdump", "any", "tcp port 80", 10);

        let started = backend.start(&local_target(), Duration::from_secs(1)).await;

        assert!(matches!(started, Err(CaptureError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_early_exit_is_reported() {
        // `false` accepts any arguments and exits 1 without output.
        let backend = TcpdumpBackend::new("false", "any", "tcp port 80", 10);
        let capture = backend.start(&local_target(), Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(matches!(capture.stop().await, Err(CaptureError::Exited(_))));
    }

    #[tokio::test]
    async fn test_failing_tool_degrades_to_empty_capture() {
        let backend = TcpdumpBackend::new("false", "any", "tcp port 80", 10);
        let settings = CaptureSettings {
            warmup: Duration::from_millis(100),
            grace: Duration::from_millis(200),
            max_window: Duration::from_secs(2),
        };

        let session = CaptureSession::start(&backend, &local_target(), settings).await;
        assert!(session.is_active());

        assert!(session.finish().await.is_empty());
    }
}
