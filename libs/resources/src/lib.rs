//! # edgeway-resources
//!
//! Declarative gateway resources and the store that publishes them.
//!
//! ## Model
//!
//! Every resource is a `kind` + `metadata.name` + kind-specific `spec`:
//! - `Gateway` declares listeners
//! - `HTTPRoute`, `GRPCRoute`, `TCPRoute`, `TLSRoute`, `UDPRoute` bind rules to a gateway
//! - `Backend` declares upstream targets
//! - `HealthCheckPolicy`, `RetryPolicy`, `BackendLBPolicy`, `BackendTLSPolicy` attach to backends
//!
//! ## Store
//!
//! [`ResourceStore`] holds an immutable [`Snapshot`] behind an `ArcSwap`.
//! Writers build a new snapshot and publish it with one pointer swap, then
//! fan out [`ResourceChange`] events to subscribers. Readers never block.

mod error;
mod loader;
mod store;
mod types;

pub use error::ResourceError;
pub use loader::{load_file, parse_resources};
pub use store::{ResourceChange, ResourceStore, Snapshot};
pub use types::*;
