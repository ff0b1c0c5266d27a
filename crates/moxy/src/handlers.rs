//! Handler dispatch: executes the action of a matched rule.
//!
//! Five handler kinds exist: reply, callback, timeout, close-connection and
//! pass-through. The dispatcher produces either a synthetic response or a
//! deliberate connection close; every failure mode is an error the caller
//! folds into the abort path, never a leaked exception.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::HandlerError;
use crate::events::RequestRecord;

/// Shared upstream client for pass-through handling. Pooling is disabled to
/// avoid stale connections against short-lived test upstreams.
static UPSTREAM_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn upstream_client() -> &'static reqwest::Client {
    UPSTREAM_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(0)
            .build()
            .expect("failed to build upstream client")
    })
}

/// Headers that must not be relayed verbatim from an upstream response.
const HOP_BY_HOP: [&str; 4] = ["transfer-encoding", "connection", "keep-alive", "content-length"];

/// Wire-facing reply definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplySpec {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    /// UTF-8 body text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Base64-encoded binary body; takes precedence over `body`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
}

fn default_status() -> u16 {
    200
}

/// Wire-facing action definition. Callback handlers are in-process only
/// and deliberately have no wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ActionSpec {
    Reply(ReplySpec),
    Timeout,
    CloseConnection,
    PassThrough {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

/// A fully resolved synthetic response.
#[derive(Debug, Clone)]
pub struct ReplyAction {
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ReplyAction {
    pub fn with_status(status: u16) -> Self {
        ReplyAction {
            status,
            status_message: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl From<ReplySpec> for ReplyAction {
    fn from(spec: ReplySpec) -> Self {
        // Mirror of the base64 body handling used for binary responses: a
        // bad encoding falls back to the literal string.
        let body = match spec.body_base64 {
            Some(encoded) => match base64::engine::general_purpose::STANDARD.decode(&encoded) {
                Ok(decoded) => Bytes::from(decoded),
                Err(error) => {
                    warn!(%error, "invalid base64 reply body, using raw string");
                    Bytes::from(encoded)
                }
            },
            None => Bytes::from(spec.body.unwrap_or_default()),
        };
        ReplyAction {
            status: spec.status,
            status_message: spec.status_message,
            headers: spec.headers,
            body,
        }
    }
}

/// An asynchronously computed response. The future is dropped if the
/// request aborts while it is pending, so a late result can never produce
/// a response event.
#[async_trait]
pub trait ResponseCallback: Send + Sync {
    async fn respond(&self, request: &RequestRecord) -> anyhow::Result<ReplyAction>;
}

/// The action a matched rule performs.
#[derive(Clone)]
pub enum HandlerAction {
    Reply(ReplyAction),
    Callback(Arc<dyn ResponseCallback>),
    Timeout,
    CloseConnection,
    PassThrough { target: Option<String> },
}

impl HandlerAction {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerAction::Reply(_) => "reply",
            HandlerAction::Callback(_) => "callback",
            HandlerAction::Timeout => "timeout",
            HandlerAction::CloseConnection => "closeConnection",
            HandlerAction::PassThrough { .. } => "passThrough",
        }
    }
}

impl std::fmt::Debug for HandlerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

impl From<ActionSpec> for HandlerAction {
    fn from(spec: ActionSpec) -> Self {
        match spec {
            ActionSpec::Reply(reply) => HandlerAction::Reply(reply.into()),
            ActionSpec::Timeout => HandlerAction::Timeout,
            ActionSpec::CloseConnection => HandlerAction::CloseConnection,
            ActionSpec::PassThrough { target } => HandlerAction::PassThrough { target },
        }
    }
}

/// What a dispatched handler produced.
#[derive(Debug)]
pub enum HandlerOutcome {
    Response(ReplyAction),
    /// Terminate the connection without any HTTP response. From the
    /// notification system's perspective this is indistinguishable from a
    /// client-initiated abort.
    CloseConnection,
}

/// Execute a handler action against a completed request.
///
/// `hold_ceiling` bounds how long a `timeout` handler may hold the
/// connection open; `None` holds until the peer gives up.
pub async fn dispatch(
    action: HandlerAction,
    request: &RequestRecord,
    hold_ceiling: Option<Duration>,
) -> Result<HandlerOutcome, HandlerError> {
    match action {
        HandlerAction::Reply(reply) => Ok(HandlerOutcome::Response(reply)),
        HandlerAction::Callback(callback) => callback
            .respond(request)
            .await
            .map(HandlerOutcome::Response)
            .map_err(HandlerError::Callback),
        HandlerAction::Timeout => match hold_ceiling {
            Some(limit) => {
                debug!(request_id = %request.id, ?limit, "holding connection up to safety ceiling");
                tokio::time::sleep(limit).await;
                Ok(HandlerOutcome::CloseConnection)
            }
            None => {
                debug!(request_id = %request.id, "holding connection open indefinitely");
                futures::future::pending::<()>().await;
                Ok(HandlerOutcome::CloseConnection)
            }
        },
        HandlerAction::CloseConnection => Ok(HandlerOutcome::CloseConnection),
        HandlerAction::PassThrough { target } => pass_through(target, request).await,
    }
}

/// Forward the request to its upstream target and relay the response
/// verbatim (minus hop-by-hop headers). Upstream failures propagate as
/// this request's own error, never as a separate TLS failure record.
async fn pass_through(
    target: Option<String>,
    request: &RequestRecord,
) -> Result<HandlerOutcome, HandlerError> {
    let url = if request.url.starts_with("http://") || request.url.starts_with("https://") {
        request.url.clone()
    } else {
        let base = target.ok_or_else(|| HandlerError::MissingTarget(request.url.clone()))?;
        format!("{}{}", base.trim_end_matches('/'), request.url)
    };

    debug!(request_id = %request.id, %url, "forwarding request upstream");

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| HandlerError::Relay(anyhow::anyhow!("invalid method: {e}")))?;

    let mut upstream = upstream_client().request(method, &url);
    for (name, value) in &request.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        upstream = upstream.header(name, value);
    }
    if let Some(body) = &request.body {
        upstream = upstream.body(body.raw());
    }

    let response = upstream.send().await?;
    let status = response.status();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let body = response.bytes().await?;

    Ok(HandlerOutcome::Response(ReplyAction {
        status: status.as_u16(),
        status_message: status.canonical_reason().map(str::to_string),
        headers,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TimingEvents;

    fn request() -> RequestRecord {
        RequestRecord {
            id: "test".into(),
            matched_rule_id: None,
            protocol: "http".into(),
            http_version: "HTTP/1.1".into(),
            method: "GET".into(),
            url: "/".into(),
            path: "/".into(),
            hostname: None,
            headers: Vec::new(),
            body: None,
            tags: Vec::new(),
            timing_events: TimingEvents::default(),
        }
    }

    #[tokio::test]
    async fn reply_resolves_synchronously() {
        let action = HandlerAction::Reply(
            ReplyAction::with_status(201)
                .header("x-extra-header", "present")
                .body("created"),
        );
        match dispatch(action, &request(), None).await.unwrap() {
            HandlerOutcome::Response(reply) => {
                assert_eq!(reply.status, 201);
                assert_eq!(reply.header_value("X-Extra-Header"), Some("present"));
                assert_eq!(reply.body.as_ref(), b"created");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_connection_never_produces_a_response() {
        match dispatch(HandlerAction::CloseConnection, &request(), None)
            .await
            .unwrap()
        {
            HandlerOutcome::CloseConnection => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_honors_the_safety_ceiling() {
        let outcome = dispatch(
            HandlerAction::Timeout,
            &request(),
            Some(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, HandlerOutcome::CloseConnection));
    }

    #[tokio::test]
    async fn timeout_without_ceiling_never_resolves() {
        let req = request();
        let pending = dispatch(HandlerAction::Timeout, &req, None);
        let raced = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(raced.is_err());
    }

    #[tokio::test]
    async fn callback_errors_surface_as_handler_errors() {
        struct Failing;
        #[async_trait]
        impl ResponseCallback for Failing {
            async fn respond(&self, _request: &RequestRecord) -> anyhow::Result<ReplyAction> {
                anyhow::bail!("boom")
            }
        }

        let result = dispatch(HandlerAction::Callback(Arc::new(Failing)), &request(), None).await;
        assert!(matches!(result, Err(HandlerError::Callback(_))));
    }

    #[test]
    fn reply_spec_decodes_base64_bodies() {
        let spec = ReplySpec {
            status: 200,
            status_message: None,
            headers: Vec::new(),
            body: None,
            body_base64: Some(base64::engine::general_purpose::STANDARD.encode(b"\x00\x01")),
        };
        let reply = ReplyAction::from(spec);
        assert_eq!(reply.body.as_ref(), b"\x00\x01");
    }

    #[test]
    fn action_spec_wire_format_round_trips() {
        let json = r#"{"action":"reply","status":418,"body":"teapot"}"#;
        let spec: ActionSpec = serde_json::from_str(json).unwrap();
        let action = HandlerAction::from(spec);
        assert_eq!(action.kind(), "reply");

        let json = r#"{"action":"closeConnection"}"#;
        let spec: ActionSpec = serde_json::from_str(json).unwrap();
        assert!(matches!(spec, ActionSpec::CloseConnection));
    }
}
