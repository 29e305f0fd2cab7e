//! Resource references embedded in a fetched HTML page.
//!
//! Used when packet capture saw nothing: scripts, stylesheets and images the
//! page links to are the requests a browser would make next.

use chrono::{DateTime, Utc};
use url::Url;

use crate::capture::RawEvent;
use crate::monitoring::executor::FetchedDocument;

/// Turn the resources `document` references into events, in document order
pub fn extract_resources(document: &FetchedDocument, observed_at: DateTime<Utc>) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut rest = document.body.as_str();

    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find('>') else { break };
        let tag = &rest[..close];
        rest = &rest[close + 1..];

        let Some((name, attributes)) = split_tag(tag) else { continue };
        let reference = match name.as_str() {
            "script" => attribute(attributes, "src").map(|src| (src, "text/javascript")),
            "img" => attribute(attributes, "src").map(|src| (src, "image/*")),
            "link" if is_stylesheet(attributes) => attribute(attributes, "href").map(|href| (href, "text/css")),
            _ => None,
        };

        let Some((reference, content_type)) = reference else { continue };
        let Some(url) = resolve(&document.base_url, &reference) else { continue };

        let mut event = RawEvent::for_url(observed_at, url);
        event.content_type = Some(content_type.to_string());
        events.push(event);
    }

    events
}

fn split_tag(tag: &str) -> Option<(String, &str)> {
    let tag = tag.trim_start();
    let end = tag.find(|c: char| c.is_whitespace() || c == '/').unwrap_or(tag.len());
    let name = &tag[..end];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((name.to_ascii_lowercase(), &tag[end..]))
}

fn is_stylesheet(attributes: &str) -> bool {
    attribute(attributes, "rel")
        .map(|rel| rel.split_ascii_whitespace().any(|token| token.eq_ignore_ascii_case("stylesheet")))
        .unwrap_or(false)
}

/// Value of attribute `wanted`, quoted or bare
fn attribute(attributes: &str, wanted: &str) -> Option<String> {
    let mut rest = attributes;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '/');
        if rest.is_empty() {
            return None;
        }

        let name_end = rest.find(|c: char| c == '=' || c.is_whitespace() || c == '/').unwrap_or(rest.len());
        let name = &rest[..name_end];
        rest = rest[name_end..].trim_start();

        let value = if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            let (value, remaining) = match after_eq.chars().next() {
                Some(quote @ ('"' | '\'')) => {
                    let inner = &after_eq[1..];
                    let end = inner.find(quote).unwrap_or(inner.len());
                    (&inner[..end], inner.get(end + 1..).unwrap_or(""))
                }
                _ => {
                    let end = after_eq.find(char::is_whitespace).unwrap_or(after_eq.len());
                    (&after_eq[..end], &after_eq[end..])
                }
            };
            rest = remaining;
            Some(value)
        } else {
            None
        };

        if name.eq_ignore_ascii_case(wanted) {
            return value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        }
        if name.is_empty() && value.is_none() {
            return None;
        }
    }
}

fn resolve(base: &Url, reference: &str) -> Option<Url> {
    let url = base.join(reference).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}
