mod harness;

use http::StatusCode;

use harness::{dead_port, http_get, GatewayHandle, HttpBackend};

fn gateway_with(route_rule: &str, backend: &str) -> String {
    format!(
        r#"
kind: Gateway
metadata:
  name: edge
spec:
  listeners:
    - name: http
      address: 127.0.0.1
      port: 0
      protocol: HTTP
---
kind: HTTPRoute
metadata:
  name: app
spec:
  parentRefs:
    - name: edge
  rules:
    - backendRefs:
        - name: app
{route_rule}
---
kind: Backend
metadata:
  name: app
spec:
{backend}
"#
    )
}

const RETRY_ONCE_ON_5XX: &str = r#"      retry:
        numRetries: 1
        retryOn: ["5xx"]
        backoffBaseInterval: 0.01"#;

#[tokio::test]
async fn retry_moves_to_the_next_target() {
    let failing = HttpBackend::spawn("failing").await.unwrap();
    failing.set_status(503);
    let healthy = HttpBackend::spawn("healthy").await.unwrap();

    let backend = format!(
        "  targets:\n    - address: 127.0.0.1\n      port: {}\n    - address: 127.0.0.1\n      port: {}\n",
        failing.addr.port(),
        healthy.addr.port()
    );
    let gateway = GatewayHandle::start(&gateway_with(RETRY_ONCE_ON_5XX, &backend)).await;
    let addr = gateway.addr("http").await;

    for _ in 0..6 {
        let reply = http_get(addr, "app.test", "/").await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, "healthy");
    }
    assert!(failing.request_count() >= 1, "round robin never tried the failing target");
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let failing = HttpBackend::spawn("failing").await.unwrap();
    failing.set_status(502);

    let rule = r#"      retry:
        numRetries: 2
        retryOn: ["502"]
        backoffBaseInterval: 0.01"#;
    let backend = format!(
        "  targets:\n    - address: 127.0.0.1\n      port: {}\n",
        failing.addr.port()
    );
    let gateway = GatewayHandle::start(&gateway_with(rule, &backend)).await;
    let addr = gateway.addr("http").await;

    let reply = http_get(addr, "app.test", "/").await.unwrap();
    // the last upstream response is passed through
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.body, "failing");
    assert_eq!(failing.request_count(), 3);
}

#[tokio::test]
async fn status_outside_retry_on_is_not_retried() {
    let failing = HttpBackend::spawn("failing").await.unwrap();
    failing.set_status(500);

    let rule = r#"      retry:
        numRetries: 3
        retryOn: ["503"]
        backoffBaseInterval: 0.01"#;
    let backend = format!(
        "  targets:\n    - address: 127.0.0.1\n      port: {}\n",
        failing.addr.port()
    );
    let gateway = GatewayHandle::start(&gateway_with(rule, &backend)).await;
    let addr = gateway.addr("http").await;

    let reply = http_get(addr, "app.test", "/").await.unwrap();
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(failing.request_count(), 1);
}

#[tokio::test]
async fn weight_zero_target_takes_over_when_primary_fails() {
    let standby = HttpBackend::spawn("standby").await.unwrap();
    let port = dead_port().await;

    let backend = format!(
        "  targets:\n    - address: 127.0.0.1\n      port: {}\n      weight: 1\n    - address: 127.0.0.1\n      port: {}\n      weight: 0\n",
        port,
        standby.addr.port()
    );
    let gateway = GatewayHandle::start(&gateway_with("", &backend)).await;
    let addr = gateway.addr("http").await;

    for _ in 0..3 {
        let reply = http_get(addr, "app.test", "/").await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, "standby");
    }
}

#[tokio::test]
async fn retry_policy_attaches_to_backend() {
    let failing = HttpBackend::spawn("failing").await.unwrap();
    failing.set_status(503);
    let healthy = HttpBackend::spawn("healthy").await.unwrap();

    let backend = format!(
        r#"  targets:
    - address: 127.0.0.1
      port: {}
    - address: 127.0.0.1
      port: {}
---
kind: RetryPolicy
metadata:
  name: app-retry
spec:
  targetRefs:
    - name: app
  retry:
    numRetries: 1
    retryOn: ["5xx"]
    backoffBaseInterval: 0.01"#,
        failing.addr.port(),
        healthy.addr.port()
    );
    let gateway = GatewayHandle::start(&gateway_with("", &backend)).await;
    let addr = gateway.addr("http").await;

    for _ in 0..4 {
        let reply = http_get(addr, "app.test", "/").await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
    }
}
