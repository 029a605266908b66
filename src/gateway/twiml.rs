//! TwiML for the inbound call webhook.
//!
//! The stream is opened with `<Connect><Stream>` rather than `<Start>`:
//! only a connected stream is bidirectional, and the relay must be able to
//! play assistant audio back into the call. `<Connect>` holds the call until
//! the stream ends, so the optional `<Say>` goes before it.

use quick_xml::escape::escape;

/// Media stream URL for the provider to dial.
///
/// Prefers the configured public origin (scheme stripped, always `wss`),
/// then the request's `Host` header.
pub fn stream_url(public_base_url: Option<&str>, host_header: Option<&str>) -> Option<String> {
    let host = public_base_url
        .map(strip_scheme)
        .filter(|h| !h.is_empty())
        .or_else(|| host_header.map(str::trim).filter(|h| !h.is_empty()))?;
    Some(format!("wss://{host}/ws"))
}

fn strip_scheme(url: &str) -> &str {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("wss://"))
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);
    rest.trim_end_matches('/')
}

/// `<Response>` that optionally speaks `connect_message`, then connects the
/// call to the media stream at `stream_url`.
pub fn connect_stream(stream_url: &str, connect_message: &str) -> String {
    let mut doc = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
    let message = connect_message.trim();
    if !message.is_empty() {
        doc.push_str("<Say>");
        doc.push_str(&escape(message));
        doc.push_str("</Say>");
    }
    doc.push_str(r#"<Connect><Stream url=""#);
    doc.push_str(&escape(stream_url));
    doc.push_str(r#""/></Connect></Response>"#);
    doc
}
