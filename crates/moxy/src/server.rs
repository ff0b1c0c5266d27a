//! The proxy data plane: accept loop, per-request service and rule-driven
//! response synthesis.

use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Protocol, UnmatchedConfig};
use crate::error::SessionClosed;
use crate::events::RequestRecord;
use crate::handlers::{dispatch, HandlerOutcome, ReplyAction};
use crate::hub::NotificationHub;
use crate::lifecycle::RequestSession;
use crate::rules::{HeadMatch, MatchContext, RuleSet};
use crate::timing::TimingEvents;
use crate::tls::{load_server_config, TlsMonitor};

/// Everything the per-request service needs, shared across connections.
pub struct ProxyState {
    pub rules: Arc<RuleSet>,
    pub hub: Arc<NotificationHub>,
    pub unmatched: UnmatchedConfig,
    pub hold_ceiling: Option<Duration>,
}

impl ProxyState {
    pub fn new(rules: Arc<RuleSet>, hub: Arc<NotificationHub>, config: &Config) -> Self {
        ProxyState {
            rules,
            hub,
            unmatched: config.unmatched.clone(),
            hold_ceiling: config.timeout_hold_ceiling_secs.map(Duration::from_secs),
        }
    }
}

/// The mock/intercept server, bound to its listen socket.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    tls: Option<Arc<TlsMonitor>>,
}

impl ProxyServer {
    /// Bind the data-plane listener. For HTTPS listeners the TLS material
    /// is loaded here so a bad certificate path fails at startup.
    pub async fn bind(config: &Config, state: Arc<ProxyState>) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", config.listen.host, config.listen.port);
        let listener = TcpListener::bind(&addr).await?;

        let tls = match config.listen.protocol {
            Protocol::Http => None,
            Protocol::Https => {
                let tls_config = config
                    .listen
                    .tls
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("https listener requires tls configuration"))?;
                let server_config =
                    load_server_config(&tls_config.cert_path, &tls_config.key_path)?;
                Some(Arc::new(TlsMonitor::new(
                    server_config,
                    Arc::clone(&state.hub),
                )))
            }
        };

        info!(
            addr = %listener.local_addr()?,
            protocol = config.listen.protocol.as_str(),
            "proxy listening"
        );
        Ok(ProxyServer { listener, state, tls })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept loop. Each connection runs on its own task; a connection
    /// task ending mid-request drops the request's session, which is what
    /// surfaces client aborts.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            };
            let state = Arc::clone(&self.state);
            let tls = self.tls.clone();
            tokio::spawn(async move {
                match tls {
                    None => serve_plain(stream, remote, state).await,
                    Some(monitor) => serve_tls(stream, remote, state, monitor).await,
                }
            });
        }
    }
}

async fn serve_plain(stream: TcpStream, remote: SocketAddr, state: Arc<ProxyState>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handle(req, Arc::clone(&state), "http", None));
    if let Err(error) = http1::Builder::new().serve_connection(io, service).await {
        // Deliberate closes and client disconnects land here; neither is a
        // server fault.
        debug!(%remote, %error, "connection ended");
    }
}

async fn serve_tls(
    stream: TcpStream,
    remote: SocketAddr,
    state: Arc<ProxyState>,
    monitor: Arc<TlsMonitor>,
) {
    let Some((tls_stream, sni)) = monitor.accept(stream, remote).await else {
        return;
    };
    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| {
        handle(req, Arc::clone(&state), "https", sni.clone())
    });
    if let Err(error) = http1::Builder::new().serve_connection(io, service).await {
        debug!(%remote, %error, "connection ended");
    }
}

/// Drive one request through its whole lifecycle.
///
/// An `Err` return makes hyper tear the connection down without writing a
/// response, which is the close-connection semantics. If this future is
/// dropped instead (client went away), the session's drop emits the abort.
async fn handle(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    protocol: &'static str,
    sni: Option<String>,
) -> Result<Response<Full<bytes::Bytes>>, SessionClosed> {
    let record = record_from_head(&req, protocol, sni);
    let content_encoding = record.header("content-encoding").map(str::to_string);

    // Rules decidable from the head alone resolve before the body is
    // buffered, so the initiated event already names the matched rule.
    let (lease, deferred) = match state.rules.match_head(&match_context(&record)) {
        HeadMatch::Matched(lease) => (Some(lease), false),
        // Anything short of a head-time decision is retried once the body
        // is in: a body predicate may resolve now, and the rule set may
        // have changed while the body was in flight.
        HeadMatch::Undecided | HeadMatch::None => (None, true),
    };
    let session = RequestSession::begin(Arc::clone(&state.hub), record, lease);
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            session.abort(&format!("body read failed: {error}"));
            return Err(SessionClosed::Aborted);
        }
    };
    session.complete_body(&body, content_encoding.as_deref());

    if deferred {
        let full_record = session.record();
        if let Some(lease) = state.rules.match_full(&match_context(&full_record)) {
            session.attach_lease(lease);
        }
    }

    let request = session.record();
    let outcome = match session.action() {
        Some(action) => dispatch(action, &request, state.hold_ceiling).await,
        None => {
            debug!(request_id = %request.id, url = %request.url, "no rule matched");
            Ok(HandlerOutcome::Response(
                ReplyAction::with_status(state.unmatched.status)
                    .header("content-type", "text/plain")
                    .body(state.unmatched.body.clone()),
            ))
        }
    };

    match outcome {
        Ok(HandlerOutcome::Response(reply)) => {
            let Some(_) = session.respond(&reply) else {
                return Err(SessionClosed::Aborted);
            };
            Ok(build_response(&reply))
        }
        Ok(HandlerOutcome::CloseConnection) => {
            // Indistinguishable from a client abort to any observer.
            session.abort("connection closed by rule");
            Err(SessionClosed::ByRule)
        }
        Err(error) => {
            error!(request_id = %request.id, %error, "handler failed");
            session.abort(&format!("handler failed: {error}"));
            Err(SessionClosed::Aborted)
        }
    }
}

fn record_from_head(
    req: &Request<Incoming>,
    protocol: &'static str,
    sni: Option<String>,
) -> RequestRecord {
    let uri = req.uri();
    let hostname = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|host| host.split(':').next().unwrap_or(host).to_string())
        .or_else(|| uri.host().map(str::to_string))
        .or(sni);

    let headers = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    RequestRecord {
        id: format!("req-{}", uuid::Uuid::new_v4()),
        matched_rule_id: None,
        protocol: protocol.to_string(),
        method: req.method().to_string(),
        http_version: format!("{:?}", req.version()),
        url: raw_target(uri),
        path: uri.path().to_string(),
        hostname,
        headers,
        body: None,
        tags: Vec::new(),
        timing_events: TimingEvents::default(),
    }
}

/// The request target as the client sent it. Absolute-form targets stay
/// absolute with their path and query untouched. `http::Uri` surfaces a
/// path-less absolute-form target ("GET http://example.com HTTP/1.1") the
/// same as a bare "/", so that one shape is recorded without the slash.
fn raw_target(uri: &hyper::Uri) -> String {
    match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => {
            let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
            if target.is_empty() || target == "/" {
                format!("{scheme}://{authority}")
            } else {
                format!("{scheme}://{authority}{target}")
            }
        }
        _ => uri.to_string(),
    }
}

fn match_context(record: &RequestRecord) -> MatchContext<'_> {
    let query = match record.url.split_once('?') {
        Some((_, q)) => Some(q),
        None => None,
    };
    MatchContext {
        method: &record.method,
        url: &record.url,
        path: &record.path,
        query,
        hostname: record.hostname.as_deref(),
        headers: &record.headers,
        body_text: record.body.as_ref().and_then(|b| b.text()),
    }
}

fn build_response(reply: &ReplyAction) -> Response<Full<bytes::Bytes>> {
    let mut builder = Response::builder().status(reply.status);
    for (name, value) in &reply.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(reply.body.clone()))
        .unwrap_or_else(|error| {
            warn!(%error, "invalid synthetic response, replacing with 500");
            Response::builder()
                .status(500)
                .body(Full::new(bytes::Bytes::from_static(b"invalid rule response")))
                .expect("static fallback response")
        })
}
