//! Control-plane request handlers.

/// System handlers: root, health, metrics.
pub mod system {
    use hyper::{Response, StatusCode};

    use crate::control::{build_response_with_headers, json_response, ControlBody};

    /// GET / - API description
    pub fn handle_root() -> Response<ControlBody> {
        let body = serde_json::json!({
            "_links": {
                "rules": {"href": "/rules"},
                "events": {"href": "/events/{kind}"},
                "health": {"href": "/health"},
                "metrics": {"href": "/metrics"}
            }
        });
        json_response(StatusCode::OK, &body)
    }

    /// GET /health - Health check
    pub fn handle_health() -> Response<ControlBody> {
        json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}))
    }

    /// GET /metrics - Prometheus metrics
    pub fn handle_metrics() -> Response<ControlBody> {
        build_response_with_headers(
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            crate::metrics::render(),
        )
    }
}

/// Rule administration handlers.
pub mod rules {
    use http_body_util::BodyExt;
    use hyper::body::Incoming;
    use hyper::{Request, Response, StatusCode};
    use std::sync::Arc;
    use tracing::info;

    use crate::control::{error_response, json_response, not_found, ControlBody, ControlState};
    use crate::rules::{Rule, RuleSpec};

    async fn read_json<T: serde::de::DeserializeOwned>(
        req: Request<Incoming>,
    ) -> Result<T, Response<ControlBody>> {
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("body read failed: {e}")))?
            .to_bytes();
        serde_json::from_slice(&body)
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")))
    }

    /// GET /rules - list all rules with their runtime state
    pub fn handle_list(state: Arc<ControlState>) -> Response<ControlBody> {
        json_response(
            StatusCode::OK,
            &serde_json::json!({"rules": state.rules.summaries()}),
        )
    }

    /// POST /rules - append one rule
    pub async fn handle_add(
        req: Request<Incoming>,
        state: Arc<ControlState>,
    ) -> Response<ControlBody> {
        let spec: RuleSpec = match read_json(req).await {
            Ok(spec) => spec,
            Err(response) => return response,
        };
        let rule = match Rule::compile(spec) {
            Ok(rule) => rule,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        info!(rule_id = %rule.id, action = rule.action.kind(), "rule registered");
        let entry = state.rules.append(rule);
        json_response(StatusCode::CREATED, &entry.summary())
    }

    /// PUT /rules - replace the whole ordered rule set
    pub async fn handle_replace_all(
        req: Request<Incoming>,
        state: Arc<ControlState>,
    ) -> Response<ControlBody> {
        let specs: Vec<RuleSpec> = match read_json(req).await {
            Ok(specs) => specs,
            Err(response) => return response,
        };
        let mut compiled = Vec::with_capacity(specs.len());
        for spec in specs {
            match Rule::compile(spec) {
                Ok(rule) => compiled.push(rule),
                Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        info!(count = compiled.len(), "rule set replaced");
        state.rules.replace_all(compiled);
        handle_list(state)
    }

    /// DELETE /rules - remove every rule and its recorded requests
    pub fn handle_delete_all(state: Arc<ControlState>) -> Response<ControlBody> {
        state.rules.reset();
        info!("rule set cleared");
        json_response(StatusCode::OK, &serde_json::json!({"rules": []}))
    }

    /// GET /rules/:id
    pub fn handle_get(id: &str, state: Arc<ControlState>) -> Response<ControlBody> {
        match state.rules.get(id) {
            Some(entry) => json_response(StatusCode::OK, &entry.summary()),
            None => not_found(),
        }
    }

    /// DELETE /rules/:id
    pub fn handle_delete(id: &str, state: Arc<ControlState>) -> Response<ControlBody> {
        if state.rules.remove(id) {
            info!(rule_id = %id, "rule removed");
            json_response(StatusCode::OK, &serde_json::json!({"removed": id}))
        } else {
            not_found()
        }
    }

    /// GET /rules/:id/requests - requests this rule has matched
    pub fn handle_requests(id: &str, state: Arc<ControlState>) -> Response<ControlBody> {
        match state.rules.get(id) {
            Some(entry) => json_response(
                StatusCode::OK,
                &serde_json::json!({"requests": entry.seen_requests()}),
            ),
            None => not_found(),
        }
    }
}

/// Remote event subscription over newline-delimited JSON.
pub mod events {
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use hyper::body::{Body, Frame};
    use hyper::{Response, StatusCode};
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::sync::mpsc;

    use crate::control::{error_response, ControlBody, ControlState};
    use crate::events::{EventKind, ProxyEvent};

    /// Bound on the per-subscriber delivery queue. A subscriber that falls
    /// further behind starts losing events rather than stalling the proxy.
    const STREAM_QUEUE_CAPACITY: usize = 256;

    /// GET /events/:kind - subscribe to a stream of lifecycle events.
    ///
    /// `:kind` is one event kind or `all`. The first line is a
    /// registration acknowledgement; each following line is one event.
    /// Registration is synchronous with this response, so an event
    /// published after the response headers were sent is already within
    /// the subscription.
    pub fn handle_stream(kind: &str, state: Arc<ControlState>) -> Response<ControlBody> {
        let kinds: Vec<EventKind> = if kind == "all" {
            EventKind::ALL.to_vec()
        } else {
            match EventKind::parse(kind) {
                Some(parsed) => vec![parsed],
                None => {
                    return error_response(
                        StatusCode::NOT_FOUND,
                        &format!("unknown event kind '{kind}'"),
                    )
                }
            }
        };

        let handle = format!("stream-{}", uuid::Uuid::new_v4());
        let rx = state
            .hub
            .subscribe_channel(&handle, &kinds, STREAM_QUEUE_CAPACITY);

        let ack = serde_json::json!({
            "subscribed": kinds.iter().map(EventKind::as_str).collect::<Vec<_>>(),
            "handle": handle,
        });
        let body = EventStreamBody {
            ack: Some(Bytes::from(format!("{ack}\n"))),
            rx,
        };

        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/x-ndjson")
            .header("Cache-Control", "no-cache")
            .body(body.boxed())
            .unwrap_or_else(|_| {
                Response::new(
                    http_body_util::Full::new(Bytes::from("Internal Server Error")).boxed(),
                )
            })
    }

    /// Streaming body that serializes each delivered event as one line.
    ///
    /// Dropping this body drops the channel receiver; the hub notices the
    /// closed channel on its next delivery and unregisters the subscriber.
    struct EventStreamBody {
        ack: Option<Bytes>,
        rx: mpsc::Receiver<ProxyEvent>,
    }

    impl Body for EventStreamBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            let this = self.get_mut();
            if let Some(ack) = this.ack.take() {
                return Poll::Ready(Some(Ok(Frame::data(ack))));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    let line =
                        serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                    Poll::Ready(Some(Ok(Frame::data(Bytes::from(format!("{line}\n"))))))
                }
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            }
        }
    }
}
