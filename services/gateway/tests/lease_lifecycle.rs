//! Leases taken on the HTTP path are released on every outcome: upstream
//! errors, retries, failover, rule timeouts and clients that leave mid-body.

mod harness;

use std::net::SocketAddr;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use harness::{dead_port, http_get, wait_for, GatewayHandle, HttpBackend, StreamingBackend};

const BACKENDS: [&str; 5] = ["dead", "retry", "failover", "slow", "stream"];

#[derive(Debug, Clone, Copy)]
enum Scenario {
    /// Only target refuses connections: 502.
    ConnectError,
    /// First target answers 503, the retry reaches the healthy one.
    Retry,
    /// Primary target is down, the weight 0 standby answers.
    Failover,
    /// Upstream never sends a head within the rule timeout: 504.
    Timeout,
    /// Client reads the head and a few body bytes, then hangs up.
    Abandon,
}

const SCENARIOS: [Scenario; 5] = [
    Scenario::ConnectError,
    Scenario::Retry,
    Scenario::Failover,
    Scenario::Timeout,
    Scenario::Abandon,
];

fn resources(dead: u16, failing: u16, healthy: u16, slow: u16, stream: u16) -> String {
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
    - matches:
        - path: {{ type: PathPrefix, value: /dead }}
      backendRefs:
        - name: dead
    - matches:
        - path: {{ type: PathPrefix, value: /retry }}
      backendRefs:
        - name: retry
      retry:
        numRetries: 1
        retryOn: ["5xx"]
        backoffBaseInterval: 0.01
    - matches:
        - path: {{ type: PathPrefix, value: /failover }}
      backendRefs:
        - name: failover
    - matches:
        - path: {{ type: PathPrefix, value: /slow }}
      backendRefs:
        - name: slow
      timeouts:
        request: 0.2
    - matches:
        - path: {{ type: PathPrefix, value: /stream }}
      backendRefs:
        - name: stream
---
kind: Backend
metadata:
  name: dead
spec:
  targets:
    - address: 127.0.0.1
      port: {dead}
---
kind: Backend
metadata:
  name: retry
spec:
  targets:
    - address: 127.0.0.1
      port: {failing}
    - address: 127.0.0.1
      port: {healthy}
---
kind: Backend
metadata:
  name: failover
spec:
  targets:
    - address: 127.0.0.1
      port: {dead}
      weight: 1
    - address: 127.0.0.1
      port: {healthy}
      weight: 0
---
kind: Backend
metadata:
  name: slow
spec:
  targets:
    - address: 127.0.0.1
      port: {slow}
---
kind: Backend
metadata:
  name: stream
spec:
  targets:
    - address: 127.0.0.1
      port: {stream}
"#
    )
}

/// Outstanding leases and active gauges across both tiers of a backend.
fn outstanding(gateway: &GatewayHandle, name: &str) -> (usize, usize) {
    let backend = gateway
        .runtime
        .registry()
        .get(name)
        .unwrap_or_else(|| panic!("Expected backend {}", name));
    let mut leases = backend.balancer().active_leases();
    let mut targets = backend.balancer().targets();
    if let Some(failover) = backend.failover() {
        leases += failover.active_leases();
        targets.extend(failover.targets());
    }
    let active = targets.iter().map(|t| t.active()).sum();
    (leases, active)
}

fn settled(gateway: &GatewayHandle) -> bool {
    BACKENDS
        .iter()
        .all(|name| outstanding(gateway, name) == (0, 0))
}

/// Read the response head and some body, then drop the connection.
async fn abandon_stream(addr: SocketAddr) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /stream HTTP/1.1\r\nhost: app.test\r\n\r\n")
        .await
        .unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while received.len() < 2048 {
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }
    assert!(received.starts_with(b"HTTP/1.1 200"));
}

/// Drive one scenario. `strict` pins the retry outcome, which concurrent
/// clients sharing the round robin cannot guarantee.
async fn run(addr: SocketAddr, scenario: Scenario, strict: bool) {
    let (path, allowed): (&str, &[StatusCode]) = match scenario {
        Scenario::ConnectError => ("/dead", &[StatusCode::BAD_GATEWAY]),
        Scenario::Retry if strict => ("/retry", &[StatusCode::OK]),
        Scenario::Retry => ("/retry", &[StatusCode::OK, StatusCode::SERVICE_UNAVAILABLE]),
        Scenario::Failover => ("/failover", &[StatusCode::OK]),
        Scenario::Timeout => ("/slow", &[StatusCode::GATEWAY_TIMEOUT]),
        Scenario::Abandon => return abandon_stream(addr).await,
    };
    let reply = http_get(addr, "app.test", path).await.unwrap();
    assert!(
        allowed.contains(&reply.status),
        "{:?} got {} from {}",
        scenario,
        reply.status,
        path
    );
}

#[tokio::test]
async fn leases_are_released_on_every_outcome() {
    let failing = HttpBackend::spawn("failing").await.unwrap();
    failing.set_status(503);
    let healthy = HttpBackend::spawn("healthy").await.unwrap();
    let slow = StreamingBackend::spawn(Duration::from_secs(2)).await.unwrap();
    let stream = StreamingBackend::spawn(Duration::ZERO).await.unwrap();
    let dead = dead_port().await;

    let yaml = resources(
        dead,
        failing.addr.port(),
        healthy.addr.port(),
        slow.addr.port(),
        stream.addr.port(),
    );
    let gateway = GatewayHandle::start(&yaml).await;
    let addr = gateway.addr("http").await;

    // every scenario alone
    for scenario in SCENARIOS {
        run(addr, scenario, true).await;
        assert!(
            wait_for(Duration::from_secs(2), || settled(&gateway)).await,
            "leases outstanding after {:?}: {:?}",
            scenario,
            BACKENDS.map(|name| outstanding(&gateway, name))
        );
    }

    // interleaved, in a scrambled order
    let mut clients = Vec::new();
    for i in 0..25 {
        let scenario = SCENARIOS[(i * 7 + i / 5) % SCENARIOS.len()];
        clients.push(tokio::spawn(run(addr, scenario, false)));
    }
    for client in clients {
        client.await.unwrap();
    }
    assert!(
        wait_for(Duration::from_secs(3), || settled(&gateway)).await,
        "leases outstanding: {:?}",
        BACKENDS.map(|name| outstanding(&gateway, name))
    );
    assert!(stream.connections.load(std::sync::atomic::Ordering::Relaxed) >= 6);
}

#[tokio::test]
async fn streaming_body_holds_its_lease() {
    let stream = StreamingBackend::spawn(Duration::ZERO).await.unwrap();
    let dead = dead_port().await;
    let yaml = resources(dead, dead, dead, dead, stream.addr.port());
    let gateway = GatewayHandle::start(&yaml).await;
    let addr = gateway.addr("http").await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /stream HTTP/1.1\r\nhost: app.test\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(n > 0);

    // the body is still streaming, so the target stays leased
    assert_eq!(outstanding(&gateway, "stream"), (1, 1));

    drop(client);
    assert!(
        wait_for(Duration::from_secs(2), || outstanding(&gateway, "stream") == (0, 0)).await,
        "lease kept after the client left: {:?}",
        outstanding(&gateway, "stream")
    );
}
