//! Gateway data plane.
//!
//! ## Architecture
//!
//! ```text
//! Listener -> RouteTable -> BackendSelector -> BackendRuntime -> LoadBalancer -> target
//!                 |                                  |
//!          HTTP / SNI / stream            HealthChecker, RetryExecutor
//! ```
//!
//! Listeners own their route tables behind an `ArcSwap`; backends live in the
//! shared [`BackendRegistry`]. Both are replaced, never mutated, on reload.

pub mod backend;
pub mod filters;
pub mod forward;
pub mod health;
pub mod http;
pub mod listener;
pub mod registry;
pub mod retry;
pub mod router;
pub mod selector;
pub mod session;
pub mod sni;
pub mod stream;
pub mod tls;
pub mod udp;

use std::sync::Arc;
use std::time::Duration;

pub use backend::{LoadBalancer, Selection, TargetState};
pub use forward::{ForwardStats, Forwarder};
pub use health::{HealthChecker, StreamEnd};
pub use listener::{ListenerHandle, ListenerKey, ListenerStats, Transport};
pub use registry::{BackendRegistry, BackendRuntime};
pub use retry::{RetryExecutor, RetryPolicy};
pub use router::RouteTable;
pub use selector::BackendSelector;
pub use sni::SniInspector;

use crate::observe::GatewayObserver;

/// Limits applied to every listener.
#[derive(Debug, Clone)]
pub struct ProxyLimits {
    /// Concurrent connections per TCP listener.
    pub max_connections: usize,
    /// Largest request body buffered so a request can be replayed.
    pub max_replay_body_bytes: usize,
    pub udp_idle_timeout: Duration,
    /// Idle timeout for TCP and TLS streams; `None` waits forever.
    pub stream_idle_timeout: Option<Duration>,
    pub sni: SniInspector,
}

impl Default for ProxyLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_replay_body_bytes: 1024 * 1024,
            udp_idle_timeout: Duration::from_secs(60),
            stream_idle_timeout: None,
            sni: SniInspector::default(),
        }
    }
}

/// Shared state every listener hands to its connections.
pub struct ProxyContext {
    pub registry: Arc<BackendRegistry>,
    pub forwarder: Arc<Forwarder>,
    pub observer: Arc<dyn GatewayObserver>,
    pub limits: ProxyLimits,
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("registry", &self.registry)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
