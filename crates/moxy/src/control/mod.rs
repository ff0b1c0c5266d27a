//! Control-plane API: rule administration and remote event subscription.

mod handlers;
mod router;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::Config;
use crate::hub::NotificationHub;
use crate::rules::RuleSet;

pub use router::route_request;

/// Responses are boxed because the event stream endpoint is unbounded
/// while everything else is a buffered JSON body.
pub type ControlBody = BoxBody<Bytes, Infallible>;

/// Shared state behind every control-plane handler.
pub struct ControlState {
    pub rules: Arc<RuleSet>,
    pub hub: Arc<NotificationHub>,
}

/// Error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorDetail>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Create a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<ControlBody> {
    let json = serde_json::to_string_pretty(body).unwrap_or_else(|_| "{}".to_string());
    build_response_with_headers(status, [("Content-Type", "application/json")], json)
}

pub fn build_response_with_headers(
    status: StatusCode,
    headers: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    body: impl Into<Bytes>,
) -> Response<ControlBody> {
    let mut builder = Response::builder().status(status);
    for (key, value) in headers {
        builder = builder.header(key.as_ref(), value.as_ref());
    }
    builder
        .body(Full::new(body.into()).boxed())
        .unwrap_or_else(|_| {
            Response::new(Full::new(Bytes::from("Internal Server Error")).boxed())
        })
}

/// Create an error response
pub fn error_response(status: StatusCode, message: &str) -> Response<ControlBody> {
    let error = ErrorResponse {
        errors: vec![ErrorDetail {
            code: status.as_str().to_string(),
            message: message.to_string(),
        }],
    };
    json_response(status, &error)
}

pub fn not_found() -> Response<ControlBody> {
    error_response(StatusCode::NOT_FOUND, "no such resource")
}

/// Control-plane server.
pub struct ControlServer {
    listener: TcpListener,
    state: Arc<ControlState>,
}

impl ControlServer {
    pub async fn bind(config: &Config, state: Arc<ControlState>) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", config.control.host, config.control.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %listener.local_addr()?, "control API listening");
        Ok(ControlServer { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<(), anyhow::Error> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { route_request(req, state).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("control API connection error: {}", e);
                }
            });
        }
    }
}
