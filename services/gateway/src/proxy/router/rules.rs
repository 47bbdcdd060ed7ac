//! Compiled match predicates.
//!
//! Match kinds are resolved into enums once at build time; evaluation never
//! re-parses resource strings.

use http::{HeaderName, Method};
use regex::Regex;

use edgeway_resources::{
    GrpcMethodMatch, GrpcRouteMatch, HttpRouteMatch, PathMatch, PathMatchType, ValueMatch,
    ValueMatchType,
};

use super::RequestHead;
use crate::error::BuildError;

/// Reflection service paths that every exact gRPC method match admits.
const GRPC_REFLECTION_PATHS: [&str; 2] = [
    "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo",
    "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo",
];

fn compile_regex(pattern: &str) -> Result<Regex, BuildError> {
    Regex::new(pattern).map_err(|source| BuildError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}

// =============================================================================
// Path
// =============================================================================

#[derive(Debug, Clone)]
pub enum PathMatcher {
    Any,
    Exact(String),
    /// Segment-aware prefix; `base` never ends in `/` unless it is `/`.
    Prefix { base: String },
    /// Unanchored search.
    Regex(Regex),
}

impl PathMatcher {
    pub fn compile(spec: Option<&PathMatch>) -> Result<Self, BuildError> {
        let Some(spec) = spec else {
            return Ok(PathMatcher::Any);
        };
        Ok(match spec.match_type {
            PathMatchType::Exact => PathMatcher::Exact(spec.value.clone()),
            PathMatchType::PathPrefix => {
                let trimmed = spec.value.strip_suffix('/').unwrap_or(&spec.value);
                let base = if trimmed.is_empty() { "/" } else { trimmed };
                PathMatcher::Prefix {
                    base: base.to_string(),
                }
            }
            PathMatchType::RegularExpression => PathMatcher::Regex(compile_regex(&spec.value)?),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Any => true,
            PathMatcher::Exact(value) => path == value,
            PathMatcher::Prefix { base } if base == "/" => true,
            PathMatcher::Prefix { base } => path
                .strip_prefix(base.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
            PathMatcher::Regex(re) => re.is_match(path),
        }
    }

    /// `(kind rank, length)`: Exact 3, PathPrefix 2, Regex 1, none 0.
    fn rank(&self) -> (u8, usize) {
        match self {
            PathMatcher::Exact(value) => (3, value.len()),
            PathMatcher::Prefix { base } => (2, base.len()),
            PathMatcher::Regex(re) => (1, re.as_str().len()),
            PathMatcher::Any => (0, 0),
        }
    }
}

// =============================================================================
// Headers and query parameters
// =============================================================================

#[derive(Debug, Clone)]
pub enum ValueMatcher {
    Exact(String),
    Regex(Regex),
}

impl ValueMatcher {
    fn compile(match_type: ValueMatchType, value: &str) -> Result<Self, BuildError> {
        Ok(match match_type {
            ValueMatchType::Exact => ValueMatcher::Exact(value.to_string()),
            ValueMatchType::RegularExpression => ValueMatcher::Regex(compile_regex(value)?),
        })
    }

    /// A missing value never matches, whatever the pattern.
    pub fn matches(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            ValueMatcher::Exact(expected) => value == expected,
            ValueMatcher::Regex(re) => re.is_match(value),
        }
    }
}

fn compile_headers(specs: &[ValueMatch]) -> Result<Vec<(HeaderName, ValueMatcher)>, BuildError> {
    specs
        .iter()
        .map(|spec| {
            let name = HeaderName::from_bytes(spec.name.to_ascii_lowercase().as_bytes())
                .map_err(|_| BuildError::InvalidHeader(spec.name.clone()))?;
            Ok((name, ValueMatcher::compile(spec.match_type, &spec.value)?))
        })
        .collect()
}

fn headers_match(matchers: &[(HeaderName, ValueMatcher)], head: &RequestHead<'_>) -> bool {
    matchers.iter().all(|(name, matcher)| {
        matcher.matches(head.headers.get(name).and_then(|v| v.to_str().ok()))
    })
}

// =============================================================================
// HTTP
// =============================================================================

/// Sort key; larger sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority {
    path_kind: u8,
    path_len: usize,
    has_method: bool,
    headers: usize,
    query_params: usize,
}

#[derive(Debug, Clone)]
pub struct HttpPredicate {
    method: Option<Method>,
    path: PathMatcher,
    headers: Vec<(HeaderName, ValueMatcher)>,
    query_params: Vec<(String, ValueMatcher)>,
}

impl HttpPredicate {
    /// Predicate of a rule declared without matches.
    pub fn catch_all() -> Self {
        Self {
            method: None,
            path: PathMatcher::Any,
            headers: Vec::new(),
            query_params: Vec::new(),
        }
    }

    pub fn compile(spec: &HttpRouteMatch) -> Result<Self, BuildError> {
        let method = spec
            .method
            .as_deref()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| BuildError::InvalidMethod(m.to_string()))
            })
            .transpose()?;
        let query_params = spec
            .query_params
            .iter()
            .map(|q| Ok((q.name.clone(), ValueMatcher::compile(q.match_type, &q.value)?)))
            .collect::<Result<_, BuildError>>()?;

        Ok(Self {
            method,
            path: PathMatcher::compile(spec.path.as_ref())?,
            headers: compile_headers(&spec.headers)?,
            query_params,
        })
    }

    pub fn priority(&self) -> Priority {
        let (path_kind, path_len) = self.path.rank();
        Priority {
            path_kind,
            path_len,
            has_method: self.method.is_some(),
            headers: self.headers.len(),
            query_params: self.query_params.len(),
        }
    }

    /// Path of an exact match, used by the lookup index.
    pub fn exact_path(&self) -> Option<&str> {
        match &self.path {
            PathMatcher::Exact(path) => Some(path),
            _ => None,
        }
    }

    pub fn matches(&self, head: &RequestHead<'_>) -> bool {
        if self.method.as_ref().is_some_and(|m| m != head.method) {
            return false;
        }
        if !self.path.matches(head.path) {
            return false;
        }
        if !headers_match(&self.headers, head) {
            return false;
        }
        self.query_params
            .iter()
            .all(|(name, matcher)| matcher.matches(head.query_param(name)))
    }
}

// =============================================================================
// gRPC
// =============================================================================

#[derive(Debug, Clone)]
enum MethodMatcher {
    Any,
    Exact {
        service: Option<String>,
        method: Option<String>,
    },
    Regex {
        service: Option<Regex>,
        method: Option<Regex>,
    },
}

impl MethodMatcher {
    fn compile(spec: Option<&GrpcMethodMatch>) -> Result<Self, BuildError> {
        let Some(spec) = spec else {
            return Ok(MethodMatcher::Any);
        };
        Ok(match spec.match_type {
            ValueMatchType::Exact => MethodMatcher::Exact {
                service: spec.service.clone(),
                method: spec.method.clone(),
            },
            ValueMatchType::RegularExpression => MethodMatcher::Regex {
                service: spec.service.as_deref().map(compile_regex).transpose()?,
                method: spec.method.as_deref().map(compile_regex).transpose()?,
            },
        })
    }

    fn matches(&self, path: &str) -> bool {
        if matches!(self, MethodMatcher::Any) {
            return true;
        }
        let Some((service, method)) = split_grpc_path(path) else {
            return false;
        };
        match self {
            MethodMatcher::Any => true,
            MethodMatcher::Exact {
                service: want_service,
                method: want_method,
            } => {
                GRPC_REFLECTION_PATHS.contains(&path)
                    || (want_service.as_deref().is_none_or(|s| s == service)
                        && want_method.as_deref().is_none_or(|m| m == method))
            }
            MethodMatcher::Regex {
                service: re_service,
                method: re_method,
            } => {
                re_service.as_ref().is_none_or(|re| re.is_match(service))
                    && re_method.as_ref().is_none_or(|re| re.is_match(method))
            }
        }
    }
}

/// `/package.Service/Method` into its two non-empty parts.
fn split_grpc_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.strip_prefix('/')?.split('/');
    let service = parts.next().filter(|s| !s.is_empty())?;
    let method = parts.next().filter(|m| !m.is_empty())?;
    Some((service, method))
}

#[derive(Debug, Clone)]
pub struct GrpcPredicate {
    method: MethodMatcher,
    headers: Vec<(HeaderName, ValueMatcher)>,
}

impl GrpcPredicate {
    pub fn catch_all() -> Self {
        Self {
            method: MethodMatcher::Any,
            headers: Vec::new(),
        }
    }

    pub fn compile(spec: &GrpcRouteMatch) -> Result<Self, BuildError> {
        Ok(Self {
            method: MethodMatcher::compile(spec.method.as_ref())?,
            headers: compile_headers(&spec.headers)?,
        })
    }

    /// Method matches outrank header-only matches; then more headers win.
    pub fn priority(&self) -> (bool, usize) {
        (!matches!(self.method, MethodMatcher::Any), self.headers.len())
    }

    pub fn matches(&self, head: &RequestHead<'_>) -> bool {
        self.method.matches(head.path) && headers_match(&self.headers, head)
    }
}
