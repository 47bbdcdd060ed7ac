//! Target state and load balancing.
//!
//! A [`LoadBalancer`] picks one target of a backend per allocation and hands
//! out a [`Selection`] lease for it. The lease keeps the target's concurrency
//! counter raised until it is freed or dropped, so least-connections and
//! lease accounting stay exact on every exit path.
//!
//! Target sets are swapped in place with `ArcSwap`. Leases hold their own
//! `Arc<TargetState>` and are unaffected by a swap.

mod algorithms;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use edgeway_resources::{AppProtocol, LbAlgorithm, TargetSpec};
use tracing::debug;

use super::session::session_token;
use algorithms::{least_connections, HashRing};

pub use algorithms::hash64;
pub(crate) use algorithms::SmoothWeighted;

/// Live state of one upstream endpoint.
pub struct TargetState {
    key: String,
    address: String,
    port: u16,
    protocol: Option<AppProtocol>,
    /// Opaque value written into session cookies for this target.
    token: String,
    healthy: AtomicBool,
    active: AtomicUsize,
}

impl TargetState {
    pub fn new(address: impl Into<String>, port: u16, protocol: Option<AppProtocol>) -> Self {
        let address = address.into();
        let key = target_key(&address, port);
        Self {
            token: session_token(&key),
            key,
            address,
            port,
            protocol,
            healthy: AtomicBool::new(true),
            active: AtomicUsize::new(0),
        }
    }

    pub fn from_spec(spec: &TargetSpec) -> Self {
        Self::new(spec.address.clone(), spec.port, spec.protocol)
    }

    /// `address:port`, bracketing IPv6 literals.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Option<AppProtocol> {
        self.protocol
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set the health flag, returning the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    /// Number of outstanding leases on this target.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetState")
            .field("key", &self.key)
            .field("healthy", &self.is_healthy())
            .field("active", &self.active())
            .finish()
    }
}

/// Format a target key, bracketing IPv6 literals.
pub fn target_key(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// A target and its weight within one balancer.
#[derive(Debug, Clone)]
pub struct Member {
    pub state: Arc<TargetState>,
    pub weight: u32,
}

impl Member {
    pub fn new(state: Arc<TargetState>, weight: u32) -> Self {
        Self { state, weight }
    }
}

/// Whether a balancer serves normal traffic or only break-glass failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerRole {
    /// Weight-0 members are excluded unless every member is weight 0.
    Primary,
    /// Every member is eligible; weight 0 counts as 1.
    Failover,
}

/// Per-allocation inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocateHint<'a> {
    /// Session token of a previously chosen target.
    pub sticky: Option<&'a str>,
    /// Key for consistent hashing.
    pub hash: Option<u64>,
}

/// A leased target. Dropping the lease frees it.
pub struct Selection {
    target: Arc<TargetState>,
    leases: Arc<AtomicUsize>,
    released: bool,
}

impl Selection {
    fn lease(target: Arc<TargetState>, leases: Arc<AtomicUsize>) -> Self {
        target.active.fetch_add(1, Ordering::AcqRel);
        leases.fetch_add(1, Ordering::AcqRel);
        Self {
            target,
            leases,
            released: false,
        }
    }

    pub fn target(&self) -> &Arc<TargetState> {
        &self.target
    }

    /// Release the lease. Calling this more than once has no further effect.
    pub fn free(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.target.active.fetch_sub(1, Ordering::AcqRel);
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("target", &self.target.key)
            .field("released", &self.released)
            .finish()
    }
}

/// Immutable member set plus the algorithm state built for it.
struct TargetSet {
    members: Vec<Arc<TargetState>>,
    weights: Vec<u32>,
    rr: SmoothWeighted,
    ring: Option<HashRing>,
}

impl TargetSet {
    fn build(algorithm: LbAlgorithm, role: BalancerRole, members: Vec<Member>) -> Self {
        let all_zero = members.iter().all(|m| m.weight == 0);
        let (members, weights): (Vec<_>, Vec<_>) = members
            .into_iter()
            .filter_map(|m| {
                let weight = match role {
                    BalancerRole::Failover => m.weight.max(1),
                    BalancerRole::Primary if all_zero => 1,
                    BalancerRole::Primary => m.weight,
                };
                (weight > 0).then_some((m.state, weight))
            })
            .unzip();

        let ring = (algorithm == LbAlgorithm::ConsistentHashing).then(|| {
            HashRing::new(
                members
                    .iter()
                    .zip(&weights)
                    .map(|(m, w)| (m.key(), *w)),
            )
        });

        Self {
            rr: SmoothWeighted::new(members.len()),
            members,
            weights,
            ring,
        }
    }
}

/// Weighted target selection for one backend.
pub struct LoadBalancer {
    name: String,
    algorithm: LbAlgorithm,
    role: BalancerRole,
    set: ArcSwap<TargetSet>,
    leases: Arc<AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(
        name: impl Into<String>,
        algorithm: LbAlgorithm,
        role: BalancerRole,
        members: Vec<Member>,
    ) -> Self {
        Self {
            name: name.into(),
            algorithm,
            role,
            set: ArcSwap::from_pointee(TargetSet::build(algorithm, role, members)),
            leases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> LbAlgorithm {
        self.algorithm
    }

    pub fn role(&self) -> BalancerRole {
        self.role
    }

    /// Replace the target set. Outstanding leases stay valid and are still
    /// counted by [`active_leases`](Self::active_leases).
    pub fn update_targets(&self, members: Vec<Member>) {
        let set = TargetSet::build(self.algorithm, self.role, members);
        debug!(
            balancer = %self.name,
            target_count = set.members.len(),
            "Balancer targets updated"
        );
        self.set.store(Arc::new(set));
    }

    /// Select a target and lease it.
    ///
    /// A sticky hint naming a present, healthy target wins outright. Otherwise
    /// the algorithm runs over the members passing `is_healthy`. Returns `None`
    /// when no member is eligible.
    pub fn allocate(
        &self,
        hint: &AllocateHint<'_>,
        is_healthy: impl Fn(&TargetState) -> bool,
    ) -> Option<Selection> {
        let set = self.set.load();

        if let Some(token) = hint.sticky {
            if let Some(member) = set
                .members
                .iter()
                .find(|m| m.token() == token && is_healthy(m))
            {
                return Some(Selection::lease(Arc::clone(member), Arc::clone(&self.leases)));
            }
        }

        let eligible = |i: usize| is_healthy(&set.members[i]);
        let index = match (self.algorithm, &set.ring, hint.hash) {
            (LbAlgorithm::ConsistentHashing, Some(ring), Some(hash)) => ring.pick(hash, eligible),
            (LbAlgorithm::LeastConnections, _, _) => {
                least_connections(&set.weights, |i| set.members[i].active(), eligible)
            }
            _ => set.rr.pick(&set.weights, eligible),
        }?;

        Some(Selection::lease(
            Arc::clone(&set.members[index]),
            Arc::clone(&self.leases),
        ))
    }

    /// Release a lease. Equivalent to dropping it.
    pub fn free(&self, mut selection: Selection) {
        selection.free();
    }

    /// Leases handed out by this balancer and not yet freed.
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Members eligible for selection, in declaration order.
    pub fn targets(&self) -> Vec<Arc<TargetState>> {
        self.set.load().members.clone()
    }

    pub fn len(&self) -> usize {
        self.set.load().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("role", &self.role)
            .field("targets", &self.len())
            .finish()
    }
}
