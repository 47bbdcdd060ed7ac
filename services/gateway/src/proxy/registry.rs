//! Backend registry.
//!
//! Every `Backend` resource is compiled into a [`BackendRuntime`]: primary and
//! failover balancers, the health checker, and the retry, session and TLS
//! policies attached to it. The registry map is swapped as a whole; a request
//! that already holds an `Arc<BackendRuntime>` keeps using it.
//!
//! Rebuilding a backend reuses the `TargetState` of every target whose
//! address, port and protocol did not change, so health flags and
//! concurrency counters survive policy edits.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::{HeaderMap, HeaderName};
use tracing::{debug, info, warn};

use edgeway_resources::{BackendSpec, LbAlgorithm, Object, Resource, ResourceKind, Snapshot};

use super::backend::{
    hash64, AllocateHint, BalancerRole, LoadBalancer, Member, Selection, TargetState,
};
use super::forward::Forwarder;
use super::health::{HealthChecker, HealthConfig, HealthReporter, StreamEnd};
use super::retry::{RetryPolicy, Tier};
use super::session::SessionPersistence;
use super::tls::UpstreamTls;
use crate::error::BuildError;

/// Compiled runtime state of one backend.
#[derive(Debug)]
pub struct BackendRuntime {
    name: String,
    generation: u64,
    balancer: Arc<LoadBalancer>,
    failover: Option<LoadBalancer>,
    health: Option<HealthChecker>,
    reporter: Option<HealthReporter>,
    retry: Option<RetryPolicy>,
    session: Option<SessionPersistence>,
    hash_key: Option<HeaderName>,
    tls: Option<UpstreamTls>,
    targets: HashMap<String, Arc<TargetState>>,
}

impl BackendRuntime {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bumped on every rebuild; pooled upstream connections are keyed by it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn failover(&self) -> Option<&LoadBalancer> {
        self.failover.as_ref()
    }

    pub fn has_failover(&self) -> bool {
        self.failover.as_ref().is_some_and(|lb| !lb.is_empty())
    }

    /// Retry policy attached through a RetryPolicy resource.
    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn session(&self) -> Option<&SessionPersistence> {
        self.session.as_ref()
    }

    pub fn tls(&self) -> Option<&UpstreamTls> {
        self.tls.as_ref()
    }

    pub fn target(&self, key: &str) -> Option<&Arc<TargetState>> {
        self.targets.get(key)
    }

    /// Lease a healthy target from the balancer of `tier`.
    pub fn allocate(&self, tier: Tier, hint: &AllocateHint<'_>) -> Option<Selection> {
        let balancer = match tier {
            Tier::Primary => self.balancer.as_ref(),
            Tier::Failover => self.failover.as_ref()?,
        };
        balancer.allocate(hint, TargetState::is_healthy)
    }

    /// Hash input for consistent hashing: the configured header, else the
    /// client address.
    pub fn request_hash(&self, headers: &HeaderMap, peer: IpAddr) -> Option<u64> {
        if self.balancer.algorithm() != LbAlgorithm::ConsistentHashing {
            return None;
        }
        let keyed = self
            .hash_key
            .as_ref()
            .and_then(|name| headers.get(name))
            .map(|value| hash64(value.as_bytes()));
        Some(keyed.unwrap_or_else(|| hash64(peer.to_string().as_bytes())))
    }

    /// Report how a stream to `target` ended. A no-op without health checks.
    pub fn report(&self, target: &str, end: StreamEnd) {
        if let Some(reporter) = &self.reporter {
            reporter.report(target, end);
        }
    }

    fn stop(&self) {
        if let Some(health) = &self.health {
            health.stop();
        }
    }
}

/// The policy of `kind` attached to a backend; the first by name wins.
fn policy(snapshot: &Snapshot, kind: ResourceKind, backend: &str) -> Option<Arc<Resource>> {
    let mut policies = snapshot.policies_for(kind, ResourceKind::Backend, backend);
    if policies.len() > 1 {
        warn!(
            backend = %backend,
            kind = kind.as_str(),
            count = policies.len(),
            "Several policies target one backend; using the first"
        );
    }
    (!policies.is_empty()).then(|| policies.swap_remove(0))
}

// =============================================================================
// Registry
// =============================================================================

/// Backends by name, swapped atomically.
pub struct BackendRegistry {
    backends: ArcSwap<HashMap<String, Arc<BackendRuntime>>>,
    generation: AtomicU64,
    forwarder: Arc<Forwarder>,
}

impl BackendRegistry {
    pub fn new(forwarder: Arc<Forwarder>) -> Self {
        Self {
            backends: ArcSwap::from_pointee(HashMap::new()),
            generation: AtomicU64::new(0),
            forwarder,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendRuntime>> {
        self.backends.load().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.backends.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build or rebuild backends from `snapshot`.
    ///
    /// With `dirty` set, only the named backends and backends not yet known
    /// are rebuilt. Backends missing from the snapshot are kept until
    /// [`prune`](Self::prune) so routes published before the swap still
    /// resolve. Returns the backends that failed to build; those are left out.
    pub fn rebuild(
        &self,
        snapshot: &Snapshot,
        dirty: Option<&HashSet<String>>,
    ) -> Vec<(String, BuildError)> {
        let current = self.backends.load_full();
        let mut next = (*current).clone();
        let mut errors = Vec::new();

        for resource in snapshot.list(ResourceKind::Backend) {
            let Resource::Backend(backend) = resource.as_ref() else {
                continue;
            };
            let name = backend.name();
            let previous = current.get(name);
            let wanted = previous.is_none() || dirty.is_none_or(|d| d.contains(name));
            if !wanted {
                continue;
            }

            match self.build(snapshot, backend, previous.map(Arc::as_ref)) {
                Ok(runtime) => {
                    info!(
                        backend = %name,
                        generation = runtime.generation,
                        targets = runtime.targets.len(),
                        health_checked = runtime.health.is_some(),
                        "Backend built"
                    );
                    next.insert(name.to_string(), Arc::new(runtime));
                }
                Err(error) => {
                    warn!(backend = %name, error = %error, "Backend build failed");
                    next.remove(name);
                    errors.push((name.to_string(), error));
                }
            }
            if let Some(previous) = previous {
                previous.stop();
                self.forwarder.evict_backend(name);
            }
        }

        self.backends.store(Arc::new(next));
        errors
    }

    /// Drop backends that are no longer in `snapshot`.
    pub fn prune(&self, snapshot: &Snapshot) {
        let current = self.backends.load_full();
        let removed: Vec<_> = current
            .keys()
            .filter(|name| snapshot.get(ResourceKind::Backend, name).is_none())
            .cloned()
            .collect();
        if removed.is_empty() {
            return;
        }

        let mut next = (*current).clone();
        for name in &removed {
            if let Some(runtime) = next.remove(name) {
                runtime.stop();
            }
            self.forwarder.evict_backend(name);
            debug!(backend = %name, "Backend removed");
        }
        self.backends.store(Arc::new(next));
    }

    fn build(
        &self,
        snapshot: &Snapshot,
        backend: &Object<BackendSpec>,
        previous: Option<&BackendRuntime>,
    ) -> Result<BackendRuntime, BuildError> {
        let name = backend.name();

        let mut lb_algorithm = LbAlgorithm::default();
        let mut session = None;
        let mut hash_key = None;
        if let Some(policy) = policy(snapshot, ResourceKind::BackendLbPolicy, name) {
            if let Resource::BackendLbPolicy(lb) = policy.as_ref() {
                lb_algorithm = lb.spec.algorithm;
                session = lb
                    .spec
                    .session_persistence
                    .as_ref()
                    .map(SessionPersistence::from_spec)
                    .transpose()?;
                hash_key = lb
                    .spec
                    .hash_key
                    .as_deref()
                    .map(|key| {
                        HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes())
                            .map_err(|_| BuildError::InvalidHeader(key.to_string()))
                    })
                    .transpose()?;
            }
        }

        let retry = match policy(snapshot, ResourceKind::RetryPolicy, name).as_deref() {
            Some(Resource::RetryPolicy(p)) => Some(RetryPolicy::from_spec(&p.spec.retry)?),
            _ => None,
        };

        let tls = match policy(snapshot, ResourceKind::BackendTlsPolicy, name).as_deref() {
            Some(Resource::BackendTlsPolicy(p)) => Some(UpstreamTls::from_policy(&p.spec)?),
            _ => None,
        };

        let health_config = match policy(snapshot, ResourceKind::HealthCheckPolicy, name).as_deref()
        {
            Some(Resource::HealthCheckPolicy(p)) => HealthConfig::from_spec(&p.spec)?,
            _ => None,
        };

        // Reuse live target state where the target is unchanged.
        let mut targets: HashMap<String, Arc<TargetState>> = HashMap::new();
        let mut members = Vec::with_capacity(backend.spec.targets.len());
        for spec in &backend.spec.targets {
            let fresh = TargetState::from_spec(spec);
            let state = previous
                .and_then(|p| p.targets.get(fresh.key()))
                .filter(|t| t.protocol() == fresh.protocol())
                .cloned()
                .unwrap_or_else(|| Arc::new(fresh));
            if targets.contains_key(state.key()) {
                warn!(backend = %name, target = %state.key(), "Duplicate target ignored");
                continue;
            }
            targets.insert(state.key().to_string(), Arc::clone(&state));
            members.push(Member::new(state, spec.weight));
        }

        // Targets that lost health checking start healthy again.
        if health_config.is_none() {
            for state in targets.values() {
                state.set_healthy(true);
            }
        }

        let failover_members: Vec<_> = members.iter().filter(|m| m.weight == 0).cloned().collect();
        let failover = (!failover_members.is_empty()
            && failover_members.len() < members.len())
        .then(|| LoadBalancer::new(name, lb_algorithm, BalancerRole::Failover, failover_members));

        let balancer = match previous {
            Some(p) if p.balancer.algorithm() == lb_algorithm => {
                p.balancer.update_targets(members);
                Arc::clone(&p.balancer)
            }
            _ => Arc::new(LoadBalancer::new(
                name,
                lb_algorithm,
                BalancerRole::Primary,
                members,
            )),
        };

        let health = health_config.map(|config| {
            let mut covered: Vec<_> = targets.values().cloned().collect();
            covered.sort_by(|a, b| a.key().cmp(b.key()));
            HealthChecker::spawn(name.to_string(), config, covered)
        });
        let reporter = health.as_ref().map(HealthChecker::reporter);

        Ok(BackendRuntime {
            name: name.to_string(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            balancer,
            failover,
            health,
            reporter,
            retry,
            session,
            hash_key,
            tls,
            targets,
        })
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeway_resources::{
        BackendLbPolicySpec, HealthCheckPolicySpec, HealthCheckSpec, ResourceStore, RetryPolicySpec, RetrySpec, StatusCodeSpec, TargetRef, TargetSpec,
    };
    use std::time::Duration;

    fn target(address: &str, port: u16, weight: u32) -> TargetSpec {
        TargetSpec {
            address: address.to_string(),
            port,
            weight,
            protocol: None,
        }
    }

    fn backend(name: &str, targets: Vec<TargetSpec>) -> Resource {
        Resource::Backend(Object::new(name, BackendSpec { targets }))
    }

    fn target_ref(name: &str) -> Vec<TargetRef> {
        vec![TargetRef {
            kind: ResourceKind::Backend,
            name: name.to_string(),
        }]
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new(Arc::new(Forwarder::new(Duration::from_secs(1))))
    }

    #[tokio::test]
    async fn test_build_attaches_policies() {
        let store = ResourceStore::with_resources(vec![
            backend("api", vec![target("10.0.0.1", 80, 1), target("10.0.0.2", 80, 0)]),
            Resource::RetryPolicy(Object::new(
                "api-retry",
                RetryPolicySpec {
                    target_refs: target_ref("api"),
                    retry: RetrySpec {
                        num_retries: 2,
                        retry_on: vec![StatusCodeSpec::Pattern("5xx".to_string())],
                        backoff_base_interval: 0.01,
                    },
                },
            )),
            Resource::BackendLbPolicy(Object::new(
                "api-lb",
                BackendLbPolicySpec {
                    target_refs: target_ref("api"),
                    algorithm: LbAlgorithm::ConsistentHashing,
                    hash_key: Some("X-User".to_string()),
                    session_persistence: None,
                },
            )),
        ])
        .unwrap();

        let registry = registry();
        assert!(registry.rebuild(&store.snapshot(), None).is_empty());

        let api = registry.get("api").unwrap();
        assert_eq!(api.retry().unwrap().num_retries(), 2);
        assert_eq!(api.balancer().algorithm(), LbAlgorithm::ConsistentHashing);
        assert_eq!(api.balancer().len(), 1);
        assert!(api.has_failover());

        let mut headers = HeaderMap::new();
        headers.insert("x-user", "alice".parse().unwrap());
        let peer: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(api.request_hash(&headers, peer), Some(hash64(b"alice")));
        assert_eq!(
            api.request_hash(&HeaderMap::new(), peer),
            Some(hash64(b"192.0.2.1"))
        );
    }

    #[tokio::test]
    async fn test_failover_only_with_mixed_weights() {
        let store = ResourceStore::with_resources(vec![
            backend("zero", vec![target("10.0.0.1", 80, 0), target("10.0.0.2", 80, 0)]),
            backend("plain", vec![target("10.0.0.3", 80, 2)]),
        ])
        .unwrap();
        let registry = registry();
        registry.rebuild(&store.snapshot(), None);

        // all-zero backends serve every target from the primary balancer
        let zero = registry.get("zero").unwrap();
        assert!(!zero.has_failover());
        assert_eq!(zero.balancer().len(), 2);
        assert!(!registry.get("plain").unwrap().has_failover());
    }

    #[tokio::test]
    async fn test_rebuild_keeps_target_state() {
        let store = ResourceStore::with_resources(vec![backend(
            "api",
            vec![target("10.0.0.1", 80, 1), target("10.0.0.2", 80, 1)],
        )])
        .unwrap();
        let registry = registry();
        registry.rebuild(&store.snapshot(), None);

        let before = registry.get("api").unwrap();
        let lease = before
            .allocate(Tier::Primary, &AllocateHint::default())
            .unwrap();
        let leased_key = lease.target().key().to_string();

        store
            .apply(Resource::HealthCheckPolicy(Object::new(
                "api-health",
                HealthCheckPolicySpec {
                    target_refs: target_ref("api"),
                    ports: vec![],
                    health_check: HealthCheckSpec {
                        interval: None,
                        max_fails: 1,
                        fail_timeout: Some(30),
                        path: None,
                        matches: vec![],
                    },
                },
            )))
            .unwrap();
        let dirty = HashSet::from(["api".to_string()]);
        registry.rebuild(&store.snapshot(), Some(&dirty));

        let after = registry.get("api").unwrap();
        assert!(after.generation() > before.generation());
        let carried = after.target(&leased_key).unwrap();
        assert!(Arc::ptr_eq(carried, lease.target()));
        assert_eq!(carried.active(), 1);
        assert_eq!(after.balancer().active_leases(), 1);

        drop(lease);
        assert_eq!(carried.active(), 0);
        assert_eq!(after.balancer().active_leases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_target_recovers_after_rebuild() {
        let passive = Resource::HealthCheckPolicy(Object::new(
            "api-health",
            HealthCheckPolicySpec {
                target_refs: target_ref("api"),
                ports: vec![],
                health_check: HealthCheckSpec {
                    interval: None,
                    max_fails: 1,
                    fail_timeout: Some(1),
                    path: None,
                    matches: vec![],
                },
            },
        ));
        let store = ResourceStore::with_resources(vec![
            backend("api", vec![target("10.0.0.1", 80, 1), target("10.0.0.2", 80, 1)]),
            passive,
        ])
        .unwrap();
        let registry = registry();
        registry.rebuild(&store.snapshot(), None);

        registry
            .get("api")
            .unwrap()
            .report("10.0.0.1:80", StreamEnd::ConnectionRefused);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = Arc::clone(registry.get("api").unwrap().target("10.0.0.1:80").unwrap());
        assert!(!state.is_healthy());

        // an unrelated weight change rebuilds the backend and its checker
        store
            .apply(backend("api", vec![target("10.0.0.1", 80, 2), target("10.0.0.2", 80, 1)]))
            .unwrap();
        let dirty = HashSet::from(["api".to_string()]);
        assert!(registry.rebuild(&store.snapshot(), Some(&dirty)).is_empty());

        let rebuilt = registry.get("api").unwrap();
        assert!(Arc::ptr_eq(rebuilt.target("10.0.0.1:80").unwrap(), &state));
        assert!(!state.is_healthy());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(state.is_healthy());
    }

    #[tokio::test]
    async fn test_clean_backends_are_not_rebuilt() {
        let store = ResourceStore::with_resources(vec![
            backend("a", vec![target("10.0.0.1", 80, 1)]),
            backend("b", vec![target("10.0.0.2", 80, 1)]),
        ])
        .unwrap();
        let registry = registry();
        registry.rebuild(&store.snapshot(), None);
        let a = registry.get("a").unwrap();
        let b = registry.get("b").unwrap();

        let dirty = HashSet::from(["b".to_string()]);
        registry.rebuild(&store.snapshot(), Some(&dirty));

        assert!(Arc::ptr_eq(&a, &registry.get("a").unwrap()));
        assert!(!Arc::ptr_eq(&b, &registry.get("b").unwrap()));
    }

    #[tokio::test]
    async fn test_prune_and_failed_build() {
        let store = ResourceStore::with_resources(vec![
            backend("keep", vec![target("10.0.0.1", 80, 1)]),
            backend("gone", vec![target("10.0.0.2", 80, 1)]),
        ])
        .unwrap();
        let registry = registry();
        registry.rebuild(&store.snapshot(), None);

        store.delete(ResourceKind::Backend, "gone");
        store
            .apply(Resource::BackendTlsPolicy(Object::new(
                "keep-tls",
                edgeway_resources::BackendTlsPolicySpec {
                    target_refs: target_ref("keep"),
                    validation: None,
                    client_certificate: None,
                },
            )))
            .unwrap();

        let snapshot = store.snapshot();
        let errors = registry.rebuild(&snapshot, None);
        // removed backends survive until pruned
        assert!(registry.get("gone").is_some());
        registry.prune(&snapshot);
        assert!(registry.get("gone").is_none());

        assert_eq!(errors.len(), 1);
        match &errors[0] {
            (name, BuildError::Tls(_)) => assert_eq!(name, "keep"),
            other => panic!("Expected Tls error, got {:?}", other),
        }
        assert!(registry.get("keep").is_none());
    }
}
