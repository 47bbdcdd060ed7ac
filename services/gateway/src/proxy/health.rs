//! Active and passive health checking.
//!
//! Each backend with a health check policy gets one probe task. The task owns
//! every [`HealthCheckState`] for the backend's targets and is the only writer
//! of the targets' health flags; the request path only reads the flag.
//!
//! Passive signals from real traffic reach the task over a bounded channel.
//! Reporting never blocks: when the channel is full the signal is dropped.
//!
//! State machine per target:
//!
//! ```text
//! Healthy --(consecutive fails >= maxFails)--> Unhealthy
//! Unhealthy --(probe success | failTimeout elapsed, passive only)--> Healthy
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use http::{HeaderMap, HeaderName, Request, StatusCode};
use http_body_util::{BodyExt, Empty, Limited};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use edgeway_resources::{HealthCheckPolicySpec, HealthMatchSpec};

use super::backend::TargetState;
use crate::error::BuildError;

/// Probe task tick.
pub const PROBE_TICK: Duration = Duration::from_secs(1);

/// Connect timeout for TCP probes.
const TCP_PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a TCP probe waits for data after connecting. Silence is healthy.
const TCP_PROBE_READ_WINDOW: Duration = Duration::from_millis(100);

/// Upper bound for a whole HTTP probe.
const MAX_HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest probe response body that is inspected.
const MAX_PROBE_BODY_BYTES: usize = 64 * 1024;

const PASSIVE_CHANNEL_CAPACITY: usize = 4096;

// =============================================================================
// Stream outcomes
// =============================================================================

/// How an upstream stream or connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Closed normally.
    Completed,
    ReadTimeout,
    IdleTimeout,
    WriteTimeout,
    ConnectionRefused,
    ConnectTimeout,
    /// Reset, TLS failure or any other transport error.
    Error,
}

impl StreamEnd {
    /// Whether the outcome counts as a success for passive checks.
    ///
    /// Read, idle and write timeouts happen on established connections that
    /// simply went quiet, so they count as healthy.
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            StreamEnd::Completed
                | StreamEnd::ReadTimeout
                | StreamEnd::IdleTimeout
                | StreamEnd::WriteTimeout
        )
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// One response match rule; every configured field must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthMatch {
    status_codes: Vec<u16>,
    body: Option<String>,
    headers: Vec<(HeaderName, String)>,
}

impl HealthMatch {
    fn from_spec(spec: &HealthMatchSpec) -> Result<Self, BuildError> {
        let headers = spec
            .headers
            .iter()
            .map(|(name, value)| {
                HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                    .map(|name| (name, value.clone()))
                    .map_err(|_| BuildError::InvalidHeader(name.clone()))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            status_codes: spec.status_codes.clone(),
            body: spec.body.clone(),
            headers,
        })
    }

    fn status_ok() -> Self {
        Self {
            status_codes: vec![200],
            body: None,
            headers: Vec::new(),
        }
    }
}

/// Why an HTTP probe response was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    BadStatusCode,
    BadBody,
    BadHeader,
    /// A match entry with no conditions never passes.
    BadMatches,
}

/// Evaluate a probe response against every match entry.
pub fn evaluate_probe(
    matches: &[HealthMatch],
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ProbeFailure> {
    for rule in matches {
        if rule.status_codes.is_empty() && rule.body.is_none() && rule.headers.is_empty() {
            return Err(ProbeFailure::BadMatches);
        }
        if !rule.status_codes.is_empty() && !rule.status_codes.contains(&status.as_u16()) {
            return Err(ProbeFailure::BadStatusCode);
        }
        if let Some(needle) = &rule.body {
            if !String::from_utf8_lossy(body).contains(needle.as_str()) {
                return Err(ProbeFailure::BadBody);
            }
        }
        for (name, expected) in &rule.headers {
            let actual = headers.get(name).and_then(|v| v.to_str().ok());
            if actual != Some(expected.as_str()) {
                return Err(ProbeFailure::BadHeader);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// Connect and wait briefly; refused or reset is a failure.
    Tcp,
    /// `GET path` evaluated against match rules.
    Http {
        path: String,
        matches: Vec<HealthMatch>,
    },
}

/// Compiled health check policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Active probe interval; `None` means passive only.
    pub interval: Option<Duration>,
    pub max_fails: u32,
    /// Passive-only recovery delay.
    pub fail_timeout: Option<Duration>,
    pub probe: ProbeKind,
    /// Ports the policy applies to; empty means every target.
    pub ports: Vec<u16>,
}

impl HealthConfig {
    /// Compile a policy. Returns `None` when the policy cannot change health:
    /// `maxFails` is zero, or neither an interval nor a fail timeout is set.
    pub fn from_spec(spec: &HealthCheckPolicySpec) -> Result<Option<Self>, BuildError> {
        let check = &spec.health_check;
        let interval = check.interval.filter(|s| *s > 0).map(Duration::from_secs);
        let fail_timeout = check.fail_timeout.filter(|s| *s > 0).map(Duration::from_secs);
        if check.max_fails == 0 || (interval.is_none() && fail_timeout.is_none()) {
            return Ok(None);
        }

        let probe = match &check.path {
            Some(path) => {
                let mut matches = check
                    .matches
                    .iter()
                    .map(HealthMatch::from_spec)
                    .collect::<Result<Vec<_>, _>>()?;
                if matches.is_empty() {
                    matches.push(HealthMatch::status_ok());
                }
                ProbeKind::Http {
                    path: path.clone(),
                    matches,
                }
            }
            None => ProbeKind::Tcp,
        };

        Ok(Some(Self {
            interval,
            max_fails: check.max_fails,
            fail_timeout,
            probe,
            ports: spec.ports.clone(),
        }))
    }

    fn covers(&self, target: &TargetState) -> bool {
        self.ports.is_empty() || self.ports.contains(&target.port())
    }
}

// =============================================================================
// State machine
// =============================================================================

/// Health bookkeeping for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckState {
    pub consecutive_fails: u32,
    pub last_check: Option<Instant>,
    pub last_fail: Option<Instant>,
    pub healthy: bool,
}

impl HealthCheckState {
    pub fn new(healthy: bool) -> Self {
        Self {
            consecutive_fails: 0,
            last_check: None,
            last_fail: None,
            healthy,
        }
    }

    /// State for a target handed over from a previous checker. An unhealthy
    /// target counts as failed at `now` so `fail_timeout` can still restore it.
    pub fn resume(healthy: bool, now: Instant) -> Self {
        let mut state = Self::new(healthy);
        if !healthy {
            state.last_fail = Some(now);
        }
        state
    }

    /// Record a success. Returns the new health on a transition.
    pub fn record_success(&mut self, now: Instant) -> Option<bool> {
        self.consecutive_fails = 0;
        self.last_check = Some(now);
        if self.healthy {
            return None;
        }
        self.healthy = true;
        Some(true)
    }

    /// Record a failure. Returns the new health on a transition.
    pub fn record_failure(&mut self, now: Instant, max_fails: u32) -> Option<bool> {
        self.consecutive_fails = self.consecutive_fails.saturating_add(1);
        self.last_check = Some(now);
        self.last_fail = Some(now);
        if !self.healthy || self.consecutive_fails < max_fails {
            return None;
        }
        self.healthy = false;
        Some(false)
    }

    /// Restore an unhealthy target once `fail_timeout` has passed since the
    /// last failure. Returns the new health on a transition.
    pub fn expire(&mut self, now: Instant, fail_timeout: Duration) -> Option<bool> {
        if self.healthy {
            return None;
        }
        let last_fail = self.last_fail?;
        if now.duration_since(last_fail) < fail_timeout {
            return None;
        }
        self.healthy = true;
        self.consecutive_fails = 0;
        Some(true)
    }
}

// =============================================================================
// Probe task
// =============================================================================

#[derive(Debug)]
struct PassiveSignal {
    target: String,
    ok: bool,
}

/// Cheap handle for reporting traffic outcomes to a backend's probe task.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    tx: mpsc::Sender<PassiveSignal>,
}

impl HealthReporter {
    pub fn report(&self, target: &str, end: StreamEnd) {
        let signal = PassiveSignal {
            target: target.to_string(),
            ok: end.is_ok(),
        };
        if self.tx.try_send(signal).is_err() {
            debug!(target = %target, "Passive health signal dropped");
        }
    }
}

/// Running health checker for one backend. Dropping it stops the probe task.
#[derive(Debug)]
pub struct HealthChecker {
    reporter: HealthReporter,
    task: JoinHandle<()>,
}

impl HealthChecker {
    /// Start the probe task for `targets`.
    ///
    /// Initial state mirrors each target's current flag so a rebuild keeps
    /// health across policy changes.
    pub fn spawn(backend: String, config: HealthConfig, targets: Vec<Arc<TargetState>>) -> Self {
        let (tx, rx) = mpsc::channel(PASSIVE_CHANNEL_CAPACITY);
        let targets: Vec<_> = targets.into_iter().filter(|t| config.covers(t)).collect();
        let now = Instant::now();
        let states = targets
            .iter()
            .map(|t| (t.key().to_string(), HealthCheckState::resume(t.is_healthy(), now)))
            .collect();

        info!(
            backend = %backend,
            target_count = targets.len(),
            interval_secs = config.interval.map(|d| d.as_secs()),
            max_fails = config.max_fails,
            "Health checker started"
        );

        let probe_loop = ProbeLoop {
            backend,
            config,
            targets,
            states,
            last_probe: None,
        };
        let task = tokio::spawn(probe_loop.run(rx));

        Self {
            reporter: HealthReporter { tx },
            task,
        }
    }

    pub fn reporter(&self) -> HealthReporter {
        self.reporter.clone()
    }

    /// Stop probing now, even while other holders keep this checker alive.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct ProbeLoop {
    backend: String,
    config: HealthConfig,
    targets: Vec<Arc<TargetState>>,
    states: HashMap<String, HealthCheckState>,
    last_probe: Option<Instant>,
}

impl ProbeLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<PassiveSignal>) {
        let mut ticker = tokio::time::interval(PROBE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // scheduled instant, not the wake-up time
                at = ticker.tick() => self.tick(at).await,
                signal = rx.recv() => match signal {
                    Some(signal) => self.record(&signal.target, signal.ok, Instant::now()),
                    None => break,
                },
            }
        }
    }

    async fn tick(&mut self, now: Instant) {
        match self.config.interval {
            Some(interval) => {
                if self.last_probe.is_some_and(|last| now.duration_since(last) < interval) {
                    return;
                }
                self.last_probe = Some(now);
                self.probe_all(interval).await;
            }
            None => {
                let Some(fail_timeout) = self.config.fail_timeout else {
                    return;
                };
                for target in &self.targets {
                    let Some(state) = self.states.get_mut(target.key()) else {
                        continue;
                    };
                    if state.expire(now, fail_timeout) == Some(true) {
                        target.set_healthy(true);
                        info!(
                            backend = %self.backend,
                            target = %target.key(),
                            "Target restored after fail timeout"
                        );
                    }
                }
            }
        }
    }

    async fn probe_all(&mut self, interval: Duration) {
        let probe = &self.config.probe;
        let results = join_all(self.targets.iter().map(|target| async move {
            let ok = match probe {
                ProbeKind::Tcp => probe_tcp(target).await,
                ProbeKind::Http { path, matches } => {
                    let limit = interval.min(MAX_HTTP_PROBE_TIMEOUT);
                    match probe_http(target, path, matches, limit).await {
                        Ok(()) => true,
                        Err(reason) => {
                            debug!(target = %target.key(), reason = %reason, "HTTP probe failed");
                            false
                        }
                    }
                }
            };
            (target.key().to_string(), ok)
        }))
        .await;

        let now = Instant::now();
        for (key, ok) in results {
            self.record(&key, ok, now);
        }
    }

    fn record(&mut self, key: &str, ok: bool, now: Instant) {
        let Some(state) = self.states.get_mut(key) else {
            return;
        };
        let transition = if ok {
            state.record_success(now)
        } else {
            state.record_failure(now, self.config.max_fails)
        };
        let Some(healthy) = transition else {
            return;
        };

        if let Some(target) = self.targets.iter().find(|t| t.key() == key) {
            target.set_healthy(healthy);
        }
        if healthy {
            info!(backend = %self.backend, target = %key, "Target healthy");
        } else {
            warn!(
                backend = %self.backend,
                target = %key,
                consecutive_fails = state.consecutive_fails,
                "Target unhealthy"
            );
        }
    }
}

/// Connect, then wait briefly for data. Silence and EOF are healthy.
async fn probe_tcp(target: &TargetState) -> bool {
    let connect = TcpStream::connect((target.address(), target.port()));
    let mut stream = match timeout(TCP_PROBE_CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => return false,
    };

    let mut buf = [0u8; 64];
    match timeout(TCP_PROBE_READ_WINDOW, stream.read(&mut buf)).await {
        Ok(Ok(_)) | Err(_) => true,
        Ok(Err(_)) => false,
    }
}

/// Issue `GET path` over a fresh HTTP/1 connection and evaluate the response.
async fn probe_http(
    target: &TargetState,
    path: &str,
    matches: &[HealthMatch],
    limit: Duration,
) -> Result<(), String> {
    let exchange = async {
        let stream = TcpStream::connect((target.address(), target.port()))
            .await
            .map_err(|e| format!("connect: {e}"))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| format!("handshake: {e}"))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = Request::get(path)
            .header(http::header::HOST, target.key())
            .body(Empty::<Bytes>::new())
            .map_err(|e| format!("request: {e}"))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| format!("send: {e}"))?;

        let (parts, body) = response.into_parts();
        let body = Limited::new(body, MAX_PROBE_BODY_BYTES)
            .collect()
            .await
            .map_err(|e| format!("body: {e}"))?
            .to_bytes();

        evaluate_probe(matches, parts.status, &parts.headers, &body)
            .map_err(|failure| format!("{failure:?}"))
    };

    timeout(limit, exchange)
        .await
        .map_err(|_| "timeout".to_string())?
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeway_resources::HealthCheckSpec;
    use http::HeaderValue;
    use tokio::net::TcpListener;

    fn policy(interval: Option<u64>, fail_timeout: Option<u64>, max_fails: u32) -> HealthCheckPolicySpec {
        HealthCheckPolicySpec {
            target_refs: vec![],
            ports: vec![],
            health_check: HealthCheckSpec {
                interval,
                max_fails,
                fail_timeout,
                path: None,
                matches: vec![],
            },
        }
    }

    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_stream_end_polarity() {
        assert!(StreamEnd::Completed.is_ok());
        assert!(StreamEnd::ReadTimeout.is_ok());
        assert!(StreamEnd::IdleTimeout.is_ok());
        assert!(StreamEnd::WriteTimeout.is_ok());
        assert!(!StreamEnd::ConnectionRefused.is_ok());
        assert!(!StreamEnd::ConnectTimeout.is_ok());
        assert!(!StreamEnd::Error.is_ok());
    }

    #[test]
    fn test_state_machine_transitions() {
        let start = Instant::now();
        let mut state = HealthCheckState::new(true);

        assert_eq!(state.record_failure(start, 3), None);
        assert_eq!(state.record_failure(start, 3), None);
        // a success in between resets the streak
        assert_eq!(state.record_success(start), None);
        assert_eq!(state.record_failure(start, 3), None);
        assert_eq!(state.record_failure(start, 3), None);
        assert_eq!(state.record_failure(start, 3), Some(false));
        assert!(!state.healthy);

        // further failures do not re-transition
        assert_eq!(state.record_failure(start, 3), None);
        assert_eq!(state.record_success(start), Some(true));
    }

    #[test]
    fn test_expire_after_fail_timeout() {
        let start = Instant::now();
        let mut state = HealthCheckState::new(true);
        state.record_failure(start, 1);

        let timeout = Duration::from_secs(10);
        assert_eq!(state.expire(start + Duration::from_secs(9), timeout), None);
        assert_eq!(state.expire(start + Duration::from_secs(10), timeout), Some(true));
        assert!(state.healthy);
        assert_eq!(state.consecutive_fails, 0);
    }

    #[test]
    fn test_resumed_unhealthy_target_still_expires() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);

        let mut state = HealthCheckState::resume(false, start);
        assert_eq!(state.expire(start + Duration::from_secs(9), timeout), None);
        assert_eq!(state.expire(start + Duration::from_secs(10), timeout), Some(true));

        let healthy = HealthCheckState::resume(true, start);
        assert_eq!(healthy, HealthCheckState::new(true));
    }

    #[test]
    fn test_config_disabled_without_interval_or_timeout() {
        assert!(HealthConfig::from_spec(&policy(None, None, 3)).unwrap().is_none());
        assert!(HealthConfig::from_spec(&policy(Some(5), None, 0)).unwrap().is_none());

        let config = HealthConfig::from_spec(&policy(Some(5), None, 3)).unwrap().unwrap();
        assert_eq!(config.probe, ProbeKind::Tcp);

        let mut http = policy(Some(5), None, 3);
        http.health_check.path = Some("/healthz".to_string());
        let config = HealthConfig::from_spec(&http).unwrap().unwrap();
        match config.probe {
            ProbeKind::Http { path, matches } => {
                assert_eq!(path, "/healthz");
                assert_eq!(matches, vec![HealthMatch::status_ok()]);
            }
            other => panic!("Expected Http probe, got {:?}", other),
        }
    }

    #[test]
    fn test_evaluate_probe_rules() {
        let matches = vec![HealthMatch {
            status_codes: vec![200, 204],
            body: Some("ok".to_string()),
            headers: vec![(HeaderName::from_static("x-ready"), "yes".to_string())],
        }];
        let mut headers = HeaderMap::new();
        headers.insert("x-ready", HeaderValue::from_static("yes"));

        assert_eq!(evaluate_probe(&matches, StatusCode::OK, &headers, b"all ok"), Ok(()));
        assert_eq!(
            evaluate_probe(&matches, StatusCode::SERVICE_UNAVAILABLE, &headers, b"ok"),
            Err(ProbeFailure::BadStatusCode)
        );
        assert_eq!(
            evaluate_probe(&matches, StatusCode::OK, &headers, b"down"),
            Err(ProbeFailure::BadBody)
        );
        assert_eq!(
            evaluate_probe(&matches, StatusCode::OK, &HeaderMap::new(), b"ok"),
            Err(ProbeFailure::BadHeader)
        );

        let empty = vec![HealthMatch {
            status_codes: vec![],
            body: None,
            headers: vec![],
        }];
        assert_eq!(
            evaluate_probe(&empty, StatusCode::OK, &headers, b""),
            Err(ProbeFailure::BadMatches)
        );
    }

    #[tokio::test]
    async fn test_passive_signals_mark_unhealthy_and_timeouts_are_benign() {
        let target = Arc::new(TargetState::new("127.0.0.1", 9, None));
        let config = HealthConfig::from_spec(&policy(None, Some(60), 2)).unwrap().unwrap();
        let checker = HealthChecker::spawn("api".to_string(), config, vec![Arc::clone(&target)]);
        let reporter = checker.reporter();

        reporter.report(target.key(), StreamEnd::ConnectionRefused);
        reporter.report(target.key(), StreamEnd::ReadTimeout);
        reporter.report(target.key(), StreamEnd::IdleTimeout);
        reporter.report(target.key(), StreamEnd::ConnectionRefused);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // timeouts reset the streak
        assert!(target.is_healthy());

        reporter.report(target.key(), StreamEnd::ConnectionRefused);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!target.is_healthy());
    }

    #[tokio::test]
    async fn test_passive_only_recovers_after_fail_timeout() {
        let target = Arc::new(TargetState::new("127.0.0.1", 9, None));
        let config = HealthConfig::from_spec(&policy(None, Some(1), 1)).unwrap().unwrap();
        let checker = HealthChecker::spawn("api".to_string(), config, vec![Arc::clone(&target)]);

        checker.reporter().report(target.key(), StreamEnd::Error);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!target.is_healthy());

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert!(target.is_healthy());
    }

    #[tokio::test]
    async fn test_active_tcp_probe_tracks_listener() {
        let port = dead_port().await;
        let target = Arc::new(TargetState::new("127.0.0.1", port, None));
        let config = HealthConfig::from_spec(&policy(Some(1), None, 1)).unwrap().unwrap();
        let _checker = HealthChecker::spawn("api".to_string(), config, vec![Arc::clone(&target)]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!target.is_healthy());

        let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(target.is_healthy());
    }

    #[tokio::test]
    async fn test_active_check_keeps_interval() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                drop(stream);
            }
        });

        let target = Arc::new(TargetState::new("127.0.0.1", port, None));
        let config = HealthConfig::from_spec(&policy(Some(1), None, 1)).unwrap().unwrap();
        let _checker = HealthChecker::spawn("api".to_string(), config, vec![target]);

        // probes at 0s, 1s and 2s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_ports_filter_leaves_other_targets_alone() {
        let covered = Arc::new(TargetState::new("127.0.0.1", 9, None));
        let ignored = Arc::new(TargetState::new("127.0.0.1", 10, None));
        let mut spec = policy(None, Some(60), 1);
        spec.ports = vec![9];
        let config = HealthConfig::from_spec(&spec).unwrap().unwrap();
        let checker = HealthChecker::spawn(
            "api".to_string(),
            config,
            vec![Arc::clone(&covered), Arc::clone(&ignored)],
        );

        checker.reporter().report(covered.key(), StreamEnd::ConnectionRefused);
        checker.reporter().report(ignored.key(), StreamEnd::ConnectionRefused);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!covered.is_healthy());
        assert!(ignored.is_healthy());
    }
}
