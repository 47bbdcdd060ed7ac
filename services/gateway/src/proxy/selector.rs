//! Rule-level backend choice.
//!
//! A route rule splits traffic across its `backendRefs` by weight. With
//! session persistence configured, a request carrying a valid token for one
//! of the rule's backends keeps going to that backend.

use http::HeaderMap;

use edgeway_resources::BackendRef;

use super::backend::SmoothWeighted;
use super::session::{session_token, SessionPersistence};

#[derive(Debug)]
struct WeightedRef {
    name: String,
    weight: u32,
    token: String,
}

/// Backend picked for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendChoice<'a> {
    pub backend: &'a str,
    token: &'a str,
    /// The request already carried this backend's token.
    pub restored: bool,
}

#[derive(Debug)]
pub struct BackendSelector {
    refs: Vec<WeightedRef>,
    weights: Vec<u32>,
    rr: SmoothWeighted,
    session: Option<SessionPersistence>,
}

impl BackendSelector {
    pub fn new(refs: &[BackendRef], session: Option<SessionPersistence>) -> Self {
        let refs: Vec<_> = refs
            .iter()
            .map(|r| WeightedRef {
                name: r.name.clone(),
                weight: r.weight,
                token: session_token(&r.name),
            })
            .collect();
        let weights = refs.iter().map(|r| r.weight).collect();
        Self {
            rr: SmoothWeighted::new(refs.len()),
            refs,
            weights,
            session,
        }
    }

    /// Backend names in declaration order.
    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.refs.iter().map(|r| r.name.as_str())
    }

    /// Pick a backend. `None` when the rule has no backend with weight.
    pub fn select(&self, headers: &HeaderMap) -> Option<BackendChoice<'_>> {
        if let Some(token) = self.session.as_ref().and_then(|s| s.restore(headers)) {
            if let Some(r) = self.refs.iter().find(|r| r.token == token && r.weight > 0) {
                return Some(BackendChoice {
                    backend: &r.name,
                    token: &r.token,
                    restored: true,
                });
            }
        }

        let index = self.rr.pick(&self.weights, |_| true)?;
        let r = &self.refs[index];
        Some(BackendChoice {
            backend: &r.name,
            token: &r.token,
            restored: false,
        })
    }

    /// Persist a fresh choice on the response.
    pub fn preserve(&self, choice: &BackendChoice<'_>, headers: &mut HeaderMap) {
        if choice.restored {
            return;
        }
        if let Some(session) = &self.session {
            session.preserve(headers, choice.token);
        }
    }
}
