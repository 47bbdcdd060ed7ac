//! Per-rule filter chain.
//!
//! Filters run in declaration order. The request stage may reject a request
//! with a status code before any backend is contacted; the response stage
//! only rewrites headers.

use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use ipnet::IpNet;

use edgeway_resources::{AccessControlSpec, FilterSpec, HeaderModifierSpec, LocalRateLimitSpec};

use crate::error::BuildError;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Outcome of the request stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Continue,
    Reject(StatusCode),
}

/// Header edits applied as set, then add, then remove.
#[derive(Debug, Clone, Default)]
pub struct HeaderModifier {
    set: Vec<(HeaderName, HeaderValue)>,
    add: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

fn header_name(name: &str) -> Result<HeaderName, BuildError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| BuildError::InvalidHeader(name.to_string()))
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), BuildError> {
    let value =
        HeaderValue::from_str(value).map_err(|_| BuildError::InvalidHeader(name.to_string()))?;
    Ok((header_name(name)?, value))
}

impl HeaderModifier {
    pub fn from_spec(spec: &HeaderModifierSpec) -> Result<Self, BuildError> {
        Ok(Self {
            set: spec
                .set
                .iter()
                .map(|h| header_pair(&h.name, &h.value))
                .collect::<Result<_, _>>()?,
            add: spec
                .add
                .iter()
                .map(|h| header_pair(&h.name, &h.value))
                .collect::<Result<_, _>>()?,
            remove: spec
                .remove
                .iter()
                .map(|name| header_name(name))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
        for name in &self.remove {
            headers.remove(name);
        }
    }
}

/// Client address allow/deny lists. Deny wins; an empty allow list allows all.
#[derive(Debug, Clone)]
pub struct AccessControl {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
    status: StatusCode,
}

fn parse_net(entry: &str) -> Result<IpNet, BuildError> {
    entry
        .parse::<IpNet>()
        .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| BuildError::InvalidFilter {
            filter_type: "AccessControl".to_string(),
            reason: format!("invalid address or CIDR {entry:?}"),
        })
}

impl AccessControl {
    pub fn from_spec(spec: &AccessControlSpec) -> Result<Self, BuildError> {
        Ok(Self {
            allow: spec.allow.iter().map(|e| parse_net(e)).collect::<Result<_, _>>()?,
            deny: spec.deny.iter().map(|e| parse_net(e)).collect::<Result<_, _>>()?,
            status: status_or(spec.response_status_code, StatusCode::FORBIDDEN, "AccessControl")?,
        })
    }

    pub fn permits(&self, peer: IpAddr) -> bool {
        let peer = peer.to_canonical();
        if self.deny.iter().any(|net| net.contains(&peer)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|net| net.contains(&peer))
    }
}

/// Token bucket shared by all requests of one rule.
pub struct LocalRateLimit {
    limiter: DirectLimiter,
    status: StatusCode,
}

impl LocalRateLimit {
    pub fn from_spec(spec: &LocalRateLimitSpec) -> Result<Self, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidFilter {
            filter_type: "LocalRateLimit".to_string(),
            reason: reason.to_string(),
        };
        let requests =
            NonZeroU32::new(spec.requests).ok_or_else(|| invalid("requests must be positive"))?;
        if spec.interval == 0 {
            return Err(invalid("interval must be positive"));
        }
        let burst = match spec.burst {
            Some(burst) => NonZeroU32::new(burst).ok_or_else(|| invalid("burst must be positive"))?,
            None => requests,
        };

        let period = Duration::from_secs(spec.interval) / requests.get();
        let quota = Quota::with_period(period)
            .ok_or_else(|| invalid("replenish period rounds to zero"))?
            .allow_burst(burst);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            status: status_or(
                spec.response_status_code,
                StatusCode::TOO_MANY_REQUESTS,
                "LocalRateLimit",
            )?,
        })
    }

    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl fmt::Debug for LocalRateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRateLimit")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

fn status_or(code: Option<u16>, default: StatusCode, filter: &str) -> Result<StatusCode, BuildError> {
    match code {
        None => Ok(default),
        Some(code) => StatusCode::from_u16(code).map_err(|_| BuildError::InvalidFilter {
            filter_type: filter.to_string(),
            reason: format!("invalid responseStatusCode {code}"),
        }),
    }
}

#[derive(Debug)]
enum Filter {
    RequestHeaders(HeaderModifier),
    ResponseHeaders(HeaderModifier),
    RateLimit(LocalRateLimit),
    Access(AccessControl),
}

impl Filter {
    fn build(spec: &FilterSpec) -> Result<Self, BuildError> {
        let missing = || BuildError::InvalidFilter {
            filter_type: spec.filter_type.clone(),
            reason: "missing config block".to_string(),
        };
        match spec.filter_type.as_str() {
            "RequestHeaderModifier" => spec
                .request_header_modifier
                .as_ref()
                .ok_or_else(missing)
                .and_then(HeaderModifier::from_spec)
                .map(Filter::RequestHeaders),
            "ResponseHeaderModifier" => spec
                .response_header_modifier
                .as_ref()
                .ok_or_else(missing)
                .and_then(HeaderModifier::from_spec)
                .map(Filter::ResponseHeaders),
            "LocalRateLimit" => spec
                .local_rate_limit
                .as_ref()
                .ok_or_else(missing)
                .and_then(LocalRateLimit::from_spec)
                .map(Filter::RateLimit),
            "AccessControl" => spec
                .access_control
                .as_ref()
                .ok_or_else(missing)
                .and_then(AccessControl::from_spec)
                .map(Filter::Access),
            other => Err(BuildError::UnknownFilter(other.to_string())),
        }
    }
}

/// Ordered filters of one route rule.
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn build(specs: &[FilterSpec]) -> Result<Self, BuildError> {
        let filters = specs.iter().map(Filter::build).collect::<Result<_, _>>()?;
        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the request stage. Stops at the first rejection.
    pub fn on_request(&self, peer: IpAddr, headers: &mut HeaderMap) -> FilterVerdict {
        for filter in &self.filters {
            match filter {
                Filter::RequestHeaders(modifier) => modifier.apply(headers),
                Filter::Access(acl) if !acl.permits(peer) => {
                    return FilterVerdict::Reject(acl.status)
                }
                Filter::RateLimit(limit) if !limit.try_acquire() => {
                    return FilterVerdict::Reject(limit.status)
                }
                Filter::Access(_) | Filter::RateLimit(_) | Filter::ResponseHeaders(_) => {}
            }
        }
        FilterVerdict::Continue
    }

    pub fn on_response(&self, headers: &mut HeaderMap) {
        for filter in &self.filters {
            if let Filter::ResponseHeaders(modifier) = filter {
                modifier.apply(headers);
            }
        }
    }
}
