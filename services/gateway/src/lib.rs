//! # edgeway-gateway
//!
//! Edge gateway data plane. Listeners, routes and backends are derived from
//! an [`edgeway_resources::ResourceStore`] and rebuilt as it changes.
//!
//! - [`proxy`]: matching, balancing, health, retries and forwarding
//! - [`runtime`]: listener provisioning and change handling
//! - [`observe`]: request and connection hooks
//! - [`reload`]: resource file polling for the binary

pub mod config;
pub mod error;
pub mod observe;
pub mod proxy;
pub mod reload;
pub mod runtime;

pub use error::BuildError;
pub use observe::{GatewayObserver, NoopObserver, TracingObserver};
pub use runtime::{GatewayRuntime, ListenerError, ListenerId, RuntimeOptions};
