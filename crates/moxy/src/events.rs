//! Lifecycle event types and the records they carry.
//!
//! Every request the proxy handles is described by exactly one
//! [`RequestRecord`], mutated in place as milestones occur. Subscribers
//! receive snapshots of that record inside [`ProxyEvent`] values, so the
//! field set visible at each milestone is explicit in the type rather than
//! implied by delivery order.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::body::decode_content;
use crate::timing::TimingEvents;

/// The five lifecycle event kinds a subscriber can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "request-initiated")]
    RequestInitiated,
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "abort")]
    Abort,
    #[serde(rename = "tlsClientError")]
    TlsClientError,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::RequestInitiated,
        EventKind::Request,
        EventKind::Response,
        EventKind::Abort,
        EventKind::TlsClientError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RequestInitiated => "request-initiated",
            EventKind::Request => "request",
            EventKind::Response => "response",
            EventKind::Abort => "abort",
            EventKind::TlsClientError => "tlsClientError",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event delivered to subscribers.
///
/// `RequestInitiated` carries the record before its body is buffered (the
/// `body` field is always absent there); `Request` carries the fully
/// buffered record; `Response` and `Abort` are mutually exclusive terminal
/// events sharing the request's `id`; `TlsClientError` never correlates to
/// a request at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ProxyEvent {
    #[serde(rename = "request-initiated")]
    RequestInitiated(RequestRecord),
    #[serde(rename = "request")]
    Request(RequestRecord),
    #[serde(rename = "response")]
    Response(ResponseRecord),
    #[serde(rename = "abort")]
    Abort(RequestRecord),
    #[serde(rename = "tlsClientError")]
    TlsClientError(TlsFailureRecord),
}

impl ProxyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::RequestInitiated(_) => EventKind::RequestInitiated,
            ProxyEvent::Request(_) => EventKind::Request,
            ProxyEvent::Response(_) => EventKind::Response,
            ProxyEvent::Abort(_) => EventKind::Abort,
            ProxyEvent::TlsClientError(_) => EventKind::TlsClientError,
        }
    }

    /// Correlation id, where the event has one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ProxyEvent::RequestInitiated(r) | ProxyEvent::Request(r) | ProxyEvent::Abort(r) => {
                Some(&r.id)
            }
            ProxyEvent::Response(r) => Some(&r.id),
            ProxyEvent::TlsClientError(_) => None,
        }
    }
}

/// One logical HTTP request as observed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Stable unique id shared by every event about this request.
    pub id: String,
    /// Id of the rule selected for this request; absent until matching
    /// resolves, and forever absent when no rule matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,
    pub protocol: String,
    pub http_version: String,
    pub method: String,
    /// The request target exactly as sent on the wire, never normalized.
    pub url: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Ordered header list, case as received.
    pub headers: Vec<(String, String)>,
    /// Present only once the full body has been buffered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    pub tags: Vec<String>,
    pub timing_events: TimingEvents,
}

impl RequestRecord {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Synthetic or relayed response, created only on successful handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    /// Equal to the originating request's id.
    pub id: String,
    pub status_code: u16,
    pub status_message: String,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    pub tags: Vec<String>,
    pub timing_events: TimingEvents,
}

impl ResponseRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A fully buffered message body.
///
/// `base64` always holds the bytes exactly as received. `text` is the
/// content-decoded UTF-8 view when one exists; a wrong or missing
/// content-encoding hint falls back to interpreting the raw bytes, never an
/// error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Body {
    pub base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Body {
    pub fn from_wire(raw: &[u8], content_encoding: Option<&str>) -> Self {
        let decoded = decode_content(raw, content_encoding);
        Body {
            base64: base64::engine::general_purpose::STANDARD.encode(raw),
            text: String::from_utf8(decoded.into_owned()).ok(),
        }
    }

    /// Raw bytes as received on the wire.
    pub fn raw(&self) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.base64)
            .unwrap_or_default()
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

/// Classified cause of a failed TLS handshake.
///
/// This is an open enumeration: client runtimes keep inventing new ways to
/// give up on a handshake, so anything not recognized is carried through as
/// `Unknown` with the transport detail rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    Reset,
    Closed,
    CertRejected,
    NoSharedCipher,
    HandshakeTimeout,
    Unknown(String),
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Reset => "reset",
            FailureCause::Closed => "closed",
            FailureCause::CertRejected => "cert-rejected",
            FailureCause::NoSharedCipher => "no-shared-cipher",
            FailureCause::HandshakeTimeout => "handshake-timeout",
            FailureCause::Unknown(_) => "unknown",
        }
    }
}

impl Serialize for FailureCause {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FailureCause {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "reset" => FailureCause::Reset,
            "closed" => FailureCause::Closed,
            "cert-rejected" => FailureCause::CertRejected,
            "no-shared-cipher" => FailureCause::NoSharedCipher,
            "handshake-timeout" => FailureCause::HandshakeTimeout,
            other => FailureCause::Unknown(other.to_string()),
        })
    }
}

/// A TLS negotiation failure on an inbound connection.
///
/// Created independently of any request record: the handshake failed before
/// an HTTP request was parsable, so there is no id to correlate with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsFailureRecord {
    pub failure_cause: FailureCause,
    /// SNI value offered by the client, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub remote_ip_address: String,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_names() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("nope"), None);
    }

    #[test]
    fn body_exposes_decoded_text() {
        let body = Body::from_wire(b"hello", None);
        assert_eq!(body.text(), Some("hello"));
        assert_eq!(body.raw(), b"hello");
    }

    #[test]
    fn failure_cause_serializes_as_classification_token() {
        let json = serde_json::to_string(&FailureCause::CertRejected).unwrap();
        assert_eq!(json, "\"cert-rejected\"");
        let json = serde_json::to_string(&FailureCause::Unknown("weird".into())).unwrap();
        assert_eq!(json, "\"unknown\"");
    }

    #[test]
    fn proxy_event_serializes_with_kind_tag() {
        let record = TlsFailureRecord {
            failure_cause: FailureCause::Reset,
            hostname: Some("localhost".into()),
            remote_ip_address: "127.0.0.1".into(),
            tags: vec![],
        };
        let value = serde_json::to_value(ProxyEvent::TlsClientError(record)).unwrap();
        assert_eq!(value["event"], "tlsClientError");
        assert_eq!(value["data"]["failureCause"], "reset");
        assert_eq!(value["data"]["hostname"], "localhost");
    }
}
