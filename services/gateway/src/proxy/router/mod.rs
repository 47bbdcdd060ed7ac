//! Request and connection routing.
//!
//! Per listener, routes are compiled into immutable matchers:
//!
//! - [`HttpMatcher`] for HTTP and HTTPS listeners (HTTPRoute and GRPCRoute)
//! - [`SniMatcher`] for TLS listeners (TLSRoute)
//! - a single [`L4Rule`] for TCP and UDP listeners
//!
//! Hosts resolve exact name first, then the longest wildcard suffix, then the
//! any-host entry. An exact host hit never falls back to wildcards, even when
//! none of its rules match.

mod rules;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, Request};
use tracing::warn;

use edgeway_resources::{
    BackendRef, FilterSpec, GrpcRouteSpec, HttpRouteSpec, L4RouteSpec, ListenerProtocol,
    Object, Resource, RetrySpec, RouteTimeouts, SessionPersistenceSpec,
};

use super::filters::FilterChain;
use super::retry::RetryPolicy;
use super::selector::BackendSelector;
use super::session::SessionPersistence;
use crate::error::BuildError;

pub use rules::{GrpcPredicate, HttpPredicate, PathMatcher, Priority, ValueMatcher};

// =============================================================================
// Hosts
// =============================================================================

/// Lowercase, drop any `:port`, drop a trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Host lookup: exact, then longest suffix, then any-host.
#[derive(Debug)]
pub struct HostTable<T> {
    exact: HashMap<String, T>,
    /// `*.a.com` stored as `.a.com`; `*` as the empty suffix, which sorts last.
    suffixes: Vec<(String, T)>,
}

impl<T> HostTable<T> {
    /// Build from `(hostname pattern, value)` pairs; patterns are unique.
    pub fn from_patterns(patterns: impl IntoIterator<Item = (String, T)>) -> Self {
        let mut exact = HashMap::new();
        let mut suffixes = Vec::new();
        for (pattern, value) in patterns {
            match pattern.strip_prefix('*') {
                Some(suffix) => suffixes.push((suffix.to_string(), value)),
                None => {
                    exact.insert(pattern, value);
                }
            }
        }
        suffixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { exact, suffixes }
    }

    /// Resolve a request host. Requests without a host only reach the
    /// any-host entry.
    pub fn resolve(&self, host: Option<&str>) -> Option<&T> {
        let Some(host) = host else {
            return self
                .suffixes
                .iter()
                .find(|(suffix, _)| suffix.is_empty())
                .map(|(_, value)| value);
        };
        let host = normalize_host(host);
        if let Some(value) = self.exact.get(&host) {
            return Some(value);
        }
        self.suffixes
            .iter()
            .find(|(suffix, _)| host.ends_with(suffix.as_str()))
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffixes.is_empty()
    }
}

/// Route hostnames as table patterns; no hostnames means any host.
fn host_patterns(hostnames: &[String]) -> Vec<String> {
    if hostnames.is_empty() {
        return vec!["*".to_string()];
    }
    hostnames
        .iter()
        .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
        .collect()
}

// =============================================================================
// Requests
// =============================================================================

/// The parts of a request head that routing looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub host: Option<&'a str>,
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

impl<'a> RequestHead<'a> {
    /// Host comes from the `Host` header, else the URI authority (HTTP/2).
    pub fn from_request<B>(request: &'a Request<B>) -> Self {
        let host = request
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| request.uri().authority().map(|a| a.as_str()));
        Self {
            host,
            method: request.method(),
            path: request.uri().path(),
            query: request.uri().query(),
            headers: request.headers(),
        }
    }

    /// First value of a query parameter, compared raw (not percent-decoded).
    pub fn query_param(&self, name: &str) -> Option<&'a str> {
        self.query?
            .split('&')
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn is_grpc(&self) -> bool {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/grpc"))
    }
}

// =============================================================================
// Rules
// =============================================================================

/// A compiled HTTP or gRPC route rule.
#[derive(Debug)]
pub struct RouteRule {
    route: String,
    index: usize,
    pub selector: BackendSelector,
    pub filters: FilterChain,
    /// `min(request, backendRequest)`.
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl RouteRule {
    fn build(
        route: &str,
        index: usize,
        backend_refs: &[BackendRef],
        filters: &[FilterSpec],
        timeouts: Option<&RouteTimeouts>,
        retry: Option<&RetrySpec>,
        session: Option<&SessionPersistenceSpec>,
    ) -> Result<Self, BuildError> {
        let session = session.map(SessionPersistence::from_spec).transpose()?;
        Ok(Self {
            route: route.to_string(),
            index,
            selector: BackendSelector::new(backend_refs, session),
            filters: FilterChain::build(filters)?,
            timeout: timeouts.and_then(rule_timeout),
            retry: retry.map(RetryPolicy::from_spec).transpose()?,
        })
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

fn rule_timeout(timeouts: &RouteTimeouts) -> Option<Duration> {
    [timeouts.request, timeouts.backend_request]
        .into_iter()
        .flatten()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .min_by(|a, b| a.total_cmp(b))
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// A configuration problem in one rule. The rule is left out; the rest of
/// the route still serves.
#[derive(Debug)]
pub struct RuleError {
    pub route: String,
    pub index: usize,
    pub error: BuildError,
}

#[derive(Debug, Clone)]
struct Entry<P> {
    predicate: P,
    rule: Arc<RouteRule>,
}

/// Rules reachable under one host pattern, sorted by priority.
#[derive(Debug, Default)]
struct RuleSet {
    http: Vec<Entry<HttpPredicate>>,
    /// Exact path to indexes into `http`; exact entries always sort first.
    exact: HashMap<String, Vec<usize>>,
    first_non_exact: usize,
    grpc: Vec<Entry<GrpcPredicate>>,
}

impl RuleSet {
    fn finish(mut self) -> Self {
        // stable: ties keep declaration order
        self.http
            .sort_by(|a, b| b.predicate.priority().cmp(&a.predicate.priority()));
        self.grpc
            .sort_by(|a, b| b.predicate.priority().cmp(&a.predicate.priority()));

        self.first_non_exact = self
            .http
            .iter()
            .position(|e| e.predicate.exact_path().is_none())
            .unwrap_or(self.http.len());
        for (i, entry) in self.http[..self.first_non_exact].iter().enumerate() {
            if let Some(path) = entry.predicate.exact_path() {
                self.exact.entry(path.to_string()).or_default().push(i);
            }
        }
        self
    }

    fn find_http(&self, head: &RequestHead<'_>) -> Option<&Arc<RouteRule>> {
        let indexed = self
            .exact
            .get(head.path)
            .into_iter()
            .flatten()
            .map(|&i| &self.http[i]);
        indexed
            .chain(&self.http[self.first_non_exact..])
            .find(|entry| entry.predicate.matches(head))
            .map(|entry| &entry.rule)
    }

    fn find_grpc(&self, head: &RequestHead<'_>) -> Option<&Arc<RouteRule>> {
        self.grpc
            .iter()
            .find(|entry| entry.predicate.matches(head))
            .map(|entry| &entry.rule)
    }
}

// =============================================================================
// HTTP matcher
// =============================================================================

/// Compiled HTTPRoute and GRPCRoute rules of one listener.
#[derive(Debug)]
pub struct HttpMatcher {
    hosts: HostTable<RuleSet>,
}

impl Default for HttpMatcher {
    fn default() -> Self {
        Self {
            hosts: HostTable::from_patterns(std::iter::empty()),
        }
    }
}

impl HttpMatcher {
    /// Compile routes. Non-HTTP resources are ignored. Rules that fail to
    /// compile are skipped and reported.
    pub fn build(routes: &[Arc<Resource>]) -> (Self, Vec<RuleError>) {
        let mut sets: HashMap<String, RuleSet> = HashMap::new();
        let mut errors = Vec::new();

        for resource in routes {
            match resource.as_ref() {
                Resource::HttpRoute(route) => {
                    let entries = compile_http_route(route, &mut errors);
                    for pattern in host_patterns(&route.spec.hostnames) {
                        sets.entry(pattern)
                            .or_default()
                            .http
                            .extend(entries.iter().cloned());
                    }
                }
                Resource::GrpcRoute(route) => {
                    let entries = compile_grpc_route(route, &mut errors);
                    for pattern in host_patterns(&route.spec.hostnames) {
                        sets.entry(pattern)
                            .or_default()
                            .grpc
                            .extend(entries.iter().cloned());
                    }
                }
                _ => {}
            }
        }

        let hosts = HostTable::from_patterns(sets.into_iter().map(|(k, v)| (k, v.finish())));
        (Self { hosts }, errors)
    }

    /// Find the rule for a request. gRPC requests try GRPCRoutes first and
    /// then HTTPRoutes of the same host.
    pub fn find(&self, head: &RequestHead<'_>) -> Option<&Arc<RouteRule>> {
        let set = self.hosts.resolve(head.host)?;
        if head.is_grpc() {
            if let Some(rule) = set.find_grpc(head) {
                return Some(rule);
            }
        }
        set.find_http(head)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

fn compile_http_route(
    route: &Object<HttpRouteSpec>,
    errors: &mut Vec<RuleError>,
) -> Vec<Entry<HttpPredicate>> {
    let mut entries = Vec::new();
    for (index, spec) in route.spec.rules.iter().enumerate() {
        let compiled = RouteRule::build(
            route.name(),
            index,
            &spec.backend_refs,
            &spec.filters,
            spec.timeouts.as_ref(),
            spec.retry.as_ref(),
            spec.session_persistence.as_ref(),
        )
        .and_then(|rule| {
            let predicates = if spec.matches.is_empty() {
                vec![HttpPredicate::catch_all()]
            } else {
                spec.matches
                    .iter()
                    .map(HttpPredicate::compile)
                    .collect::<Result<_, _>>()?
            };
            Ok((Arc::new(rule), predicates))
        });

        match compiled {
            Ok((rule, predicates)) => entries.extend(predicates.into_iter().map(|predicate| Entry {
                predicate,
                rule: Arc::clone(&rule),
            })),
            Err(error) => errors.push(RuleError {
                route: route.name().to_string(),
                index,
                error,
            }),
        }
    }
    entries
}

fn compile_grpc_route(
    route: &Object<GrpcRouteSpec>,
    errors: &mut Vec<RuleError>,
) -> Vec<Entry<GrpcPredicate>> {
    let mut entries = Vec::new();
    for (index, spec) in route.spec.rules.iter().enumerate() {
        let compiled = RouteRule::build(
            route.name(),
            index,
            &spec.backend_refs,
            &spec.filters,
            spec.timeouts.as_ref(),
            spec.retry.as_ref(),
            spec.session_persistence.as_ref(),
        )
        .and_then(|rule| {
            let predicates = if spec.matches.is_empty() {
                vec![GrpcPredicate::catch_all()]
            } else {
                spec.matches
                    .iter()
                    .map(GrpcPredicate::compile)
                    .collect::<Result<_, _>>()?
            };
            Ok((Arc::new(rule), predicates))
        });

        match compiled {
            Ok((rule, predicates)) => entries.extend(predicates.into_iter().map(|predicate| Entry {
                predicate,
                rule: Arc::clone(&rule),
            })),
            Err(error) => errors.push(RuleError {
                route: route.name().to_string(),
                index,
                error,
            }),
        }
    }
    entries
}

// =============================================================================
// L4
// =============================================================================

/// Backend choice for a TCP, UDP or TLS route.
#[derive(Debug)]
pub struct L4Rule {
    route: String,
    pub selector: BackendSelector,
}

impl L4Rule {
    /// Routes are connection-level: the first rule's backendRefs are used.
    pub fn from_route(route: &Object<L4RouteSpec>) -> Self {
        let refs = route
            .spec
            .rules
            .first()
            .map(|rule| rule.backend_refs.as_slice())
            .unwrap_or_default();
        Self {
            route: route.name().to_string(),
            selector: BackendSelector::new(refs, None),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }
}

/// TLSRoute lookup by SNI.
#[derive(Debug)]
pub struct SniMatcher {
    hosts: HostTable<Arc<L4Rule>>,
}

impl SniMatcher {
    /// First route wins when several claim the same hostname.
    pub fn build(routes: &[Arc<Resource>]) -> Self {
        let mut patterns: Vec<(String, Arc<L4Rule>)> = Vec::new();
        for resource in routes {
            let Resource::TlsRoute(route) = resource.as_ref() else {
                continue;
            };
            let rule = Arc::new(L4Rule::from_route(route));
            for pattern in host_patterns(&route.spec.hostnames) {
                if patterns.iter().any(|(p, _)| *p == pattern) {
                    warn!(route = %route.name(), hostname = %pattern, "Duplicate TLS hostname ignored");
                    continue;
                }
                patterns.push((pattern, Arc::clone(&rule)));
            }
        }
        Self {
            hosts: HostTable::from_patterns(patterns),
        }
    }

    pub fn find(&self, sni: Option<&str>) -> Option<&Arc<L4Rule>> {
        self.hosts.resolve(sni)
    }
}

/// First TCP or UDP route attached to a listener.
pub fn stream_rule(routes: &[Arc<Resource>]) -> Option<Arc<L4Rule>> {
    routes.iter().find_map(|resource| match resource.as_ref() {
        Resource::TcpRoute(route) | Resource::UdpRoute(route) => {
            Some(Arc::new(L4Rule::from_route(route)))
        }
        _ => None,
    })
}

// =============================================================================
// Per-listener table
// =============================================================================

/// Compiled routes of one listener, swapped as a whole on reload.
#[derive(Debug)]
pub enum RouteTable {
    Http(HttpMatcher),
    Sni(SniMatcher),
    Stream(Option<Arc<L4Rule>>),
}

impl RouteTable {
    /// Compile the routes attached to a listener speaking `protocol`.
    ///
    /// Routes of a kind the protocol does not serve are ignored.
    pub fn build(protocol: ListenerProtocol, routes: &[Arc<Resource>]) -> (Self, Vec<RuleError>) {
        match protocol {
            ListenerProtocol::Http | ListenerProtocol::Https => {
                let (matcher, errors) = HttpMatcher::build(routes);
                (Self::Http(matcher), errors)
            }
            ListenerProtocol::Tls => (Self::Sni(SniMatcher::build(routes)), Vec::new()),
            ListenerProtocol::Tcp | ListenerProtocol::Udp => {
                (Self::Stream(stream_rule(routes)), Vec::new())
            }
        }
    }

    pub fn empty(protocol: ListenerProtocol) -> Self {
        Self::build(protocol, &[]).0
    }
}
