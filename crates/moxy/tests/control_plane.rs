//! Control-plane API tests: rule administration and remote event
//! subscription against in-process servers.

use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use moxy::config::Config;
use moxy::control::{ControlServer, ControlState};
use moxy::hub::NotificationHub;
use moxy::rules::RuleSet;
use moxy::server::{ProxyServer, ProxyState};

const STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Both servers on ephemeral ports, sharing one rule set and hub.
async fn start_servers() -> (SocketAddr, SocketAddr) {
    let mut config = Config::default();
    config.listen.port = 0;
    config.control.port = 0;

    let rules = Arc::new(RuleSet::new());
    let hub = Arc::new(NotificationHub::new());

    let proxy_state = Arc::new(ProxyState::new(Arc::clone(&rules), Arc::clone(&hub), &config));
    let proxy = ProxyServer::bind(&config, proxy_state)
        .await
        .expect("failed to bind proxy");
    let proxy_addr = proxy.local_addr().expect("no proxy addr");
    tokio::spawn(proxy.run());

    let control_state = Arc::new(ControlState { rules, hub });
    let control = ControlServer::bind(&config, control_state)
        .await
        .expect("failed to bind control API");
    let control_addr = control.local_addr().expect("no control addr");
    tokio::spawn(control.run());

    (proxy_addr, control_addr)
}

/// Incremental NDJSON reader over a streaming response.
struct LineReader {
    response: reqwest::Response,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(response: reqwest::Response) -> Self {
        LineReader {
            response,
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> serde_json::Value {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return serde_json::from_slice(&line[..line.len() - 1])
                    .expect("stream line is valid JSON");
            }
            let chunk = tokio::time::timeout(STREAM_TIMEOUT, self.response.chunk())
                .await
                .expect("timed out waiting for stream data")
                .expect("stream failed")
                .expect("stream ended early");
            self.buf.extend_from_slice(&chunk);
        }
    }
}

#[tokio::test]
async fn register_rule_and_serve_it() {
    let (proxy_addr, control_addr) = start_servers().await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("http://{control_addr}/rules"))
        .json(&json!({
            "id": "greet",
            "predicates": [{"match": "path", "value": "/greet"}],
            "action": "reply",
            "status": 200,
            "body": "hi there"
        }))
        .send()
        .await
        .expect("rule registration failed");
    assert_eq!(created.status(), 201);

    let response = client
        .get(format!("http://{proxy_addr}/greet"))
        .send()
        .await
        .expect("proxy request failed");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hi there");

    let listing: serde_json::Value = client
        .get(format!("http://{control_addr}/rules"))
        .send()
        .await
        .expect("listing failed")
        .json()
        .await
        .expect("listing is JSON");
    assert_eq!(listing["rules"][0]["id"], "greet");
    assert_eq!(listing["rules"][0]["completed"], 1);

    let seen: serde_json::Value = client
        .get(format!("http://{control_addr}/rules/greet/requests"))
        .send()
        .await
        .expect("seen-requests failed")
        .json()
        .await
        .expect("seen-requests is JSON");
    assert_eq!(seen["requests"][0]["path"], "/greet");
    assert_eq!(seen["requests"][0]["matchedRuleId"], "greet");
}

#[tokio::test]
async fn event_stream_acknowledges_then_delivers() {
    let (proxy_addr, control_addr) = start_servers().await;
    let client = reqwest::Client::new();

    let stream = client
        .get(format!("http://{control_addr}/events/all"))
        .send()
        .await
        .expect("subscription failed");
    assert_eq!(stream.status(), 200);
    assert_eq!(
        stream.headers().get("content-type").unwrap(),
        "application/x-ndjson"
    );
    let mut lines = LineReader::new(stream);

    // First line acknowledges the registration; everything after it is
    // guaranteed to be covered by the subscription.
    let ack = lines.next_line().await;
    let subscribed: Vec<&str> = ack["subscribed"]
        .as_array()
        .expect("subscribed is an array")
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(subscribed.len(), 5);
    assert!(subscribed.contains(&"tlsClientError"));

    let response = client
        .get(format!("http://{proxy_addr}/unmatched"))
        .send()
        .await
        .expect("proxy request failed");
    assert_eq!(response.status(), 503);

    let initiated = lines.next_line().await;
    assert_eq!(initiated["event"], "request-initiated");
    let id = initiated["data"]["id"].as_str().unwrap().to_string();

    let request = lines.next_line().await;
    assert_eq!(request["event"], "request");
    assert_eq!(request["data"]["id"], id.as_str());

    let response_event = lines.next_line().await;
    assert_eq!(response_event["event"], "response");
    assert_eq!(response_event["data"]["id"], id.as_str());
    assert_eq!(response_event["data"]["statusCode"], 503);
}

#[tokio::test]
async fn event_stream_filters_by_kind() {
    let (proxy_addr, control_addr) = start_servers().await;
    let client = reqwest::Client::new();

    let stream = client
        .get(format!("http://{control_addr}/events/response"))
        .send()
        .await
        .expect("subscription failed");
    let mut lines = LineReader::new(stream);
    let ack = lines.next_line().await;
    assert_eq!(ack["subscribed"], json!(["response"]));

    client
        .get(format!("http://{proxy_addr}/whatever"))
        .send()
        .await
        .expect("proxy request failed");

    // Initiated and request events are filtered out upstream of the
    // queue, so the first delivered line is the response.
    let event = lines.next_line().await;
    assert_eq!(event["event"], "response");
}

#[tokio::test]
async fn unknown_event_kind_is_rejected() {
    let (_, control_addr) = start_servers().await;
    let response = reqwest::Client::new()
        .get(format!("http://{control_addr}/events/nonsense"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn invalid_regex_rule_is_rejected() {
    let (_, control_addr) = start_servers().await;
    let response = reqwest::Client::new()
        .post(format!("http://{control_addr}/rules"))
        .json(&json!({
            "predicates": [{"match": "pathRegex", "pattern": "(unclosed"}],
            "action": "reply",
            "status": 200
        }))
        .send()
        .await
        .expect("request failed");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn replace_and_delete_rules() {
    let (proxy_addr, control_addr) = start_servers().await;
    let client = reqwest::Client::new();

    let replaced = client
        .put(format!("http://{control_addr}/rules"))
        .json(&json!([
            {
                "id": "a",
                "predicates": [{"match": "path", "value": "/a"}],
                "action": "reply",
                "status": 200,
                "body": "a"
            },
            {
                "id": "b",
                "predicates": [{"match": "path", "value": "/b"}],
                "action": "reply",
                "status": 200,
                "body": "b"
            }
        ]))
        .send()
        .await
        .expect("replace failed");
    assert_eq!(replaced.status(), 200);

    let response = client
        .get(format!("http://{proxy_addr}/b"))
        .send()
        .await
        .expect("proxy request failed");
    assert_eq!(response.text().await.unwrap(), "b");

    let deleted = client
        .delete(format!("http://{control_addr}/rules/b"))
        .send()
        .await
        .expect("delete failed");
    assert_eq!(deleted.status(), 200);

    let after = client
        .get(format!("http://{proxy_addr}/b"))
        .send()
        .await
        .expect("proxy request failed");
    assert_eq!(after.status(), 503);

    assert_eq!(
        client
            .delete(format!("http://{control_addr}/rules/b"))
            .send()
            .await
            .expect("second delete failed")
            .status(),
        404
    );
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let (proxy_addr, control_addr) = start_servers().await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("http://{control_addr}/health"))
        .send()
        .await
        .expect("health failed")
        .json()
        .await
        .expect("health is JSON");
    assert_eq!(health["status"], "ok");

    // Generate a little traffic so counters exist.
    client
        .get(format!("http://{proxy_addr}/x"))
        .send()
        .await
        .expect("proxy request failed");

    let metrics = client
        .get(format!("http://{control_addr}/metrics"))
        .send()
        .await
        .expect("metrics failed")
        .text()
        .await
        .expect("metrics body");
    assert!(metrics.contains("moxy_requests_total"));
}
