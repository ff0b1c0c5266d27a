//! Route dispatch for the control-plane API.

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use std::sync::Arc;
use tracing::debug;

use super::handlers::{events, rules, system};
use super::{not_found, ControlBody, ControlState};

/// Parsed route for rule-specific endpoints
enum RuleRoute {
    /// GET/DELETE /rules/:id
    Root,
    /// GET /rules/:id/requests
    Requests,
}

impl RuleRoute {
    fn parse(segments: &[&str]) -> Option<Self> {
        match segments {
            [] => Some(RuleRoute::Root),
            ["requests"] => Some(RuleRoute::Requests),
            _ => None,
        }
    }
}

/// Main request router
pub async fn route_request(
    req: Request<Incoming>,
    state: Arc<ControlState>,
) -> Result<Response<ControlBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("control API: {} {}", method, path);

    let response = route_by_path(&method, &path, req, state).await;
    Ok(response)
}

async fn route_by_path(
    method: &Method,
    path: &str,
    req: Request<Incoming>,
    state: Arc<ControlState>,
) -> Response<ControlBody> {
    match (method, path) {
        (&Method::GET, "/") => return system::handle_root(),
        (&Method::GET, "/health") => return system::handle_health(),
        (&Method::GET, "/metrics") => return system::handle_metrics(),
        _ => {}
    }

    if path == "/rules" {
        return match *method {
            Method::GET => rules::handle_list(state),
            Method::POST => rules::handle_add(req, state).await,
            Method::PUT => rules::handle_replace_all(req, state).await,
            Method::DELETE => rules::handle_delete_all(state),
            _ => not_found(),
        };
    }

    if let Some(rest) = path.strip_prefix("/rules/") {
        return route_rule(method, rest, state);
    }

    if let Some(kind) = path.strip_prefix("/events/") {
        return match *method {
            Method::GET => events::handle_stream(kind, state),
            _ => not_found(),
        };
    }

    not_found()
}

fn route_rule(method: &Method, path: &str, state: Arc<ControlState>) -> Response<ControlBody> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.is_empty() || segments[0].is_empty() {
        return not_found();
    }
    let id = segments[0];

    let route = match RuleRoute::parse(&segments[1..]) {
        Some(r) => r,
        None => return not_found(),
    };

    match (method, route) {
        (&Method::GET, RuleRoute::Root) => rules::handle_get(id, state),
        (&Method::DELETE, RuleRoute::Root) => rules::handle_delete(id, state),
        (&Method::GET, RuleRoute::Requests) => rules::handle_requests(id, state),
        _ => not_found(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_route_parse() {
        assert!(matches!(RuleRoute::parse(&[]), Some(RuleRoute::Root)));
        assert!(matches!(
            RuleRoute::parse(&["requests"]),
            Some(RuleRoute::Requests)
        ));
        assert!(RuleRoute::parse(&["unknown"]).is_none());
        assert!(RuleRoute::parse(&["requests", "extra"]).is_none());
    }
}
