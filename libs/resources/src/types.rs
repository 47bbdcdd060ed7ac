//! Resource type definitions.
//!
//! Resources follow the Gateway API shape: every object carries a `kind`,
//! `metadata.name` and a kind-specific `spec`. Field names are camelCase on
//! the wire.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Envelope
// =============================================================================

/// Kind discriminator for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Gateway,
    #[serde(rename = "HTTPRoute")]
    HttpRoute,
    #[serde(rename = "GRPCRoute")]
    GrpcRoute,
    #[serde(rename = "TCPRoute")]
    TcpRoute,
    #[serde(rename = "TLSRoute")]
    TlsRoute,
    #[serde(rename = "UDPRoute")]
    UdpRoute,
    Backend,
    HealthCheckPolicy,
    RetryPolicy,
    #[serde(rename = "BackendLBPolicy")]
    BackendLbPolicy,
    #[serde(rename = "BackendTLSPolicy")]
    BackendTlsPolicy,
}

impl ResourceKind {
    /// All kinds, in store iteration order.
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::Gateway,
        ResourceKind::HttpRoute,
        ResourceKind::GrpcRoute,
        ResourceKind::TcpRoute,
        ResourceKind::TlsRoute,
        ResourceKind::UdpRoute,
        ResourceKind::Backend,
        ResourceKind::HealthCheckPolicy,
        ResourceKind::RetryPolicy,
        ResourceKind::BackendLbPolicy,
        ResourceKind::BackendTlsPolicy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Gateway => "Gateway",
            ResourceKind::HttpRoute => "HTTPRoute",
            ResourceKind::GrpcRoute => "GRPCRoute",
            ResourceKind::TcpRoute => "TCPRoute",
            ResourceKind::TlsRoute => "TLSRoute",
            ResourceKind::UdpRoute => "UDPRoute",
            ResourceKind::Backend => "Backend",
            ResourceKind::HealthCheckPolicy => "HealthCheckPolicy",
            ResourceKind::RetryPolicy => "RetryPolicy",
            ResourceKind::BackendLbPolicy => "BackendLBPolicy",
            ResourceKind::BackendTlsPolicy => "BackendTLSPolicy",
        }
    }

    /// Returns true for route kinds.
    pub fn is_route(&self) -> bool {
        matches!(
            self,
            ResourceKind::HttpRoute
                | ResourceKind::GrpcRoute
                | ResourceKind::TcpRoute
                | ResourceKind::TlsRoute
                | ResourceKind::UdpRoute
        )
    }

    /// Returns true for policy kinds that attach to a Backend.
    pub fn is_backend_policy(&self) -> bool {
        matches!(
            self,
            ResourceKind::HealthCheckPolicy
                | ResourceKind::RetryPolicy
                | ResourceKind::BackendLbPolicy
                | ResourceKind::BackendTlsPolicy
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Metadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }
}

/// A named object wrapping a kind-specific spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object<S> {
    pub metadata: Metadata,
    pub spec: S,
}

impl<S> Object<S> {
    pub fn new(name: impl Into<String>, spec: S) -> Self {
        Self {
            metadata: Metadata::named(name),
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// A declarative resource.
///
/// Resources are immutable once published to the store; updates replace them
/// wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Resource {
    Gateway(Object<GatewaySpec>),
    #[serde(rename = "HTTPRoute")]
    HttpRoute(Object<HttpRouteSpec>),
    #[serde(rename = "GRPCRoute")]
    GrpcRoute(Object<GrpcRouteSpec>),
    #[serde(rename = "TCPRoute")]
    TcpRoute(Object<L4RouteSpec>),
    #[serde(rename = "TLSRoute")]
    TlsRoute(Object<L4RouteSpec>),
    #[serde(rename = "UDPRoute")]
    UdpRoute(Object<L4RouteSpec>),
    Backend(Object<BackendSpec>),
    HealthCheckPolicy(Object<HealthCheckPolicySpec>),
    RetryPolicy(Object<RetryPolicySpec>),
    #[serde(rename = "BackendLBPolicy")]
    BackendLbPolicy(Object<BackendLbPolicySpec>),
    #[serde(rename = "BackendTLSPolicy")]
    BackendTlsPolicy(Object<BackendTlsPolicySpec>),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Gateway(_) => ResourceKind::Gateway,
            Resource::HttpRoute(_) => ResourceKind::HttpRoute,
            Resource::GrpcRoute(_) => ResourceKind::GrpcRoute,
            Resource::TcpRoute(_) => ResourceKind::TcpRoute,
            Resource::TlsRoute(_) => ResourceKind::TlsRoute,
            Resource::UdpRoute(_) => ResourceKind::UdpRoute,
            Resource::Backend(_) => ResourceKind::Backend,
            Resource::HealthCheckPolicy(_) => ResourceKind::HealthCheckPolicy,
            Resource::RetryPolicy(_) => ResourceKind::RetryPolicy,
            Resource::BackendLbPolicy(_) => ResourceKind::BackendLbPolicy,
            Resource::BackendTlsPolicy(_) => ResourceKind::BackendTlsPolicy,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Resource::Gateway(o) => &o.metadata,
            Resource::HttpRoute(o) => &o.metadata,
            Resource::GrpcRoute(o) => &o.metadata,
            Resource::TcpRoute(o) | Resource::TlsRoute(o) | Resource::UdpRoute(o) => &o.metadata,
            Resource::Backend(o) => &o.metadata,
            Resource::HealthCheckPolicy(o) => &o.metadata,
            Resource::RetryPolicy(o) => &o.metadata,
            Resource::BackendLbPolicy(o) => &o.metadata,
            Resource::BackendTlsPolicy(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Parent gateway references of a route resource (empty for other kinds).
    pub fn parent_refs(&self) -> &[ParentRef] {
        match self {
            Resource::HttpRoute(o) => &o.spec.parent_refs,
            Resource::GrpcRoute(o) => &o.spec.parent_refs,
            Resource::TcpRoute(o) | Resource::TlsRoute(o) | Resource::UdpRoute(o) => {
                &o.spec.parent_refs
            }
            _ => &[],
        }
    }

    /// Policy attachment targets (empty for non-policy kinds).
    pub fn target_refs(&self) -> &[TargetRef] {
        match self {
            Resource::HealthCheckPolicy(o) => &o.spec.target_refs,
            Resource::RetryPolicy(o) => &o.spec.target_refs,
            Resource::BackendLbPolicy(o) => &o.spec.target_refs,
            Resource::BackendTlsPolicy(o) => &o.spec.target_refs,
            _ => &[],
        }
    }

    /// Backend names referenced by a route's rules.
    pub fn backend_names(&self) -> Vec<&str> {
        let refs: Vec<&BackendRef> = match self {
            Resource::HttpRoute(o) => o.spec.rules.iter().flat_map(|r| &r.backend_refs).collect(),
            Resource::GrpcRoute(o) => o.spec.rules.iter().flat_map(|r| &r.backend_refs).collect(),
            Resource::TcpRoute(o) | Resource::TlsRoute(o) | Resource::UdpRoute(o) => {
                o.spec.rules.iter().flat_map(|r| &r.backend_refs).collect()
            }
            _ => Vec::new(),
        };
        refs.into_iter().map(|r| r.name.as_str()).collect()
    }
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,
}

/// L7 protocol served on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenerProtocol {
    Http,
    Https,
    Tls,
    Tcp,
    Udp,
}

impl ListenerProtocol {
    /// Returns true if the listener binds a UDP socket.
    pub fn is_udp(&self) -> bool {
        matches!(self, ListenerProtocol::Udp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub name: String,
    /// Bind address; defaults to all interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub port: u16,
    pub protocol: ListenerProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ListenerTls>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsMode {
    #[default]
    Terminate,
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTls {
    #[serde(default)]
    pub mode: TlsMode,
    #[serde(default)]
    pub certificates: Vec<CertificateRef>,
}

/// PEM certificate chain and private key on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRef {
    pub cert_path: String,
    pub key_path: String,
}

// =============================================================================
// Routes
// =============================================================================

/// Reference from a route to the gateway (and optionally listener) it binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Weighted reference from a rule to a Backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRef {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    #[serde(default)]
    pub parent_refs: Vec<ParentRef>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<HttpRouteRule>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteRule {
    #[serde(default)]
    pub matches: Vec<HttpRouteMatch>,
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<RouteTimeouts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_persistence: Option<SessionPersistenceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Vec<ValueMatch>,
    #[serde(default)]
    pub query_params: Vec<ValueMatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PathMatchType {
    #[default]
    Exact,
    PathPrefix,
    RegularExpression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMatch {
    #[serde(default, rename = "type")]
    pub match_type: PathMatchType,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValueMatchType {
    #[default]
    Exact,
    RegularExpression,
}

/// Header or query parameter match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMatch {
    #[serde(default, rename = "type")]
    pub match_type: ValueMatchType,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcRouteSpec {
    #[serde(default)]
    pub parent_refs: Vec<ParentRef>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<GrpcRouteRule>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcRouteRule {
    #[serde(default)]
    pub matches: Vec<GrpcRouteMatch>,
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<RouteTimeouts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_persistence: Option<SessionPersistenceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcRouteMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<GrpcMethodMatch>,
    #[serde(default)]
    pub headers: Vec<ValueMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcMethodMatch {
    #[serde(default, rename = "type")]
    pub match_type: ValueMatchType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// TCP, TLS and UDP routes share one shape; only TLS routes use hostnames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L4RouteSpec {
    #[serde(default)]
    pub parent_refs: Vec<ParentRef>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<L4RouteRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L4RouteRule {
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
}

/// Request timeouts in seconds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_request: Option<f64>,
}

/// Gateway API style filter: a `type` discriminator plus the matching config block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(rename = "type")]
    pub filter_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_header_modifier: Option<HeaderModifierSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_header_modifier: Option<HeaderModifierSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_rate_limit: Option<LocalRateLimitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<AccessControlSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderModifierSpec {
    #[serde(default)]
    pub set: Vec<HeaderValueSpec>,
    #[serde(default)]
    pub add: Vec<HeaderValueSpec>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderValueSpec {
    pub name: String,
    pub value: String,
}

/// Token bucket shared by every request matching the rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRateLimitSpec {
    /// Requests replenished per interval.
    pub requests: u32,
    /// Replenish interval in seconds.
    #[serde(default = "default_rate_limit_interval")]
    pub interval: u64,
    /// Bucket size; defaults to `requests`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status_code: Option<u16>,
}

fn default_rate_limit_interval() -> u64 {
    1
}

/// Client address allow/deny lists in CIDR or plain IP form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlSpec {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status_code: Option<u16>,
}

// =============================================================================
// Retry and session persistence
// =============================================================================

/// A status code or a status class such as `"5xx"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusCodeSpec {
    Code(u16),
    Pattern(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    #[serde(default)]
    pub num_retries: u32,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<StatusCodeSpec>,
    /// Base backoff interval in seconds.
    #[serde(default = "default_backoff_base_interval")]
    pub backoff_base_interval: f64,
}

fn default_retry_on() -> Vec<StatusCodeSpec> {
    vec![StatusCodeSpec::Pattern("5xx".to_string())]
}

fn default_backoff_base_interval() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionPersistenceType {
    #[default]
    Cookie,
    Header,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPersistenceSpec {
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default, rename = "type")]
    pub persistence_type: SessionPersistenceType,
    /// Cookie lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_timeout: Option<u64>,
}

fn default_session_name() -> String {
    "edgeway-session".to_string()
}

// =============================================================================
// Backends
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

/// Application protocol hint for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppProtocol {
    Http,
    H2,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<AppProtocol>,
}

// =============================================================================
// Policies
// =============================================================================

/// Reference from a policy to the resource it attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    #[serde(default = "default_target_kind")]
    pub kind: ResourceKind,
    pub name: String,
}

fn default_target_kind() -> ResourceKind {
    ResourceKind::Backend
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckPolicySpec {
    #[serde(default)]
    pub target_refs: Vec<TargetRef>,
    /// Restrict probing to targets on these ports; empty means all targets.
    #[serde(default)]
    pub ports: Vec<u16>,
    pub health_check: HealthCheckSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Active probe interval in seconds; absent means passive only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    /// Seconds after which a passively failed target is optimistically restored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_timeout: Option<u64>,
    /// HTTP probe path; absent means TCP connect probes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub matches: Vec<HealthMatchSpec>,
}

fn default_max_fails() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMatchSpec {
    #[serde(default)]
    pub status_codes: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicySpec {
    #[serde(default)]
    pub target_refs: Vec<TargetRef>,
    pub retry: RetrySpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LbAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    ConsistentHashing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendLbPolicySpec {
    #[serde(default)]
    pub target_refs: Vec<TargetRef>,
    #[serde(default)]
    pub algorithm: LbAlgorithm,
    /// Request header used as the consistent-hashing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_persistence: Option<SessionPersistenceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendTlsPolicySpec {
    #[serde(default)]
    pub target_refs: Vec<TargetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<TlsValidationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<CertificateRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsValidationSpec {
    /// PEM bundle of trusted CAs; absent means the bundled web PKI roots are not used
    /// and the handshake will fail unless a CA is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,
    /// SNI and verification name override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_tag_roundtrip() {
        let json = serde_json::json!({
            "kind": "HTTPRoute",
            "metadata": { "name": "web" },
            "spec": {
                "parentRefs": [{ "name": "edge" }],
                "hostnames": ["*.example.com"],
                "rules": [{
                    "matches": [{ "path": { "type": "PathPrefix", "value": "/v1" } }],
                    "backendRefs": [{ "name": "api", "weight": 3 }]
                }]
            }
        });

        let resource: Resource = serde_json::from_value(json).unwrap();
        assert_eq!(resource.kind(), ResourceKind::HttpRoute);
        assert_eq!(resource.name(), "web");
        assert_eq!(resource.backend_names(), vec!["api"]);
        assert_eq!(resource.parent_refs()[0].name, "edge");
    }

    #[test]
    fn test_defaults_applied() {
        let json = serde_json::json!({
            "kind": "Backend",
            "metadata": { "name": "api" },
            "spec": { "targets": [{ "address": "10.0.0.1", "port": 8080 }] }
        });
        let Resource::Backend(backend) = serde_json::from_value(json).unwrap() else {
            panic!("expected backend");
        };
        assert_eq!(backend.spec.targets[0].weight, 1);

        let retry: RetrySpec = serde_json::from_value(serde_json::json!({ "numRetries": 2 })).unwrap();
        assert_eq!(retry.retry_on, vec![StatusCodeSpec::Pattern("5xx".to_string())]);
        assert_eq!(retry.backoff_base_interval, 1.0);
    }

    #[test]
    fn test_policy_target_refs_default_to_backend() {
        let json = serde_json::json!({
            "kind": "RetryPolicy",
            "metadata": { "name": "r" },
            "spec": {
                "targetRefs": [{ "name": "api" }],
                "retry": { "numRetries": 1, "retryOn": [503, "4xx"] }
            }
        });
        let resource: Resource = serde_json::from_value(json).unwrap();
        assert_eq!(resource.target_refs()[0].kind, ResourceKind::Backend);
        assert!(resource.kind().is_backend_policy());
    }
}
