//! Gateway runtime: turns the resource store into bound listeners and live
//! backends, and keeps both current as resources change.
//!
//! ## Reload
//!
//! Store changes are collected for a debounce window, classified into dirty
//! gateways and dirty backends, then applied in order:
//!
//! 1. rebuild dirty backends (old ones stay resolvable)
//! 2. swap route tables, rebind listeners whose spec changed
//! 3. prune backends that left the snapshot
//!
//! A route published in step 2 therefore never names a backend that is not
//! in the registry yet, and a removed backend disappears only after no new
//! route table points at it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use edgeway_resources::{
    GatewaySpec, ListenerProtocol, ListenerSpec, Resource, ResourceChange, ResourceKind,
    ResourceStore, Snapshot,
};

use crate::error::BuildError;
use crate::observe::{GatewayObserver, TracingObserver};
use crate::proxy::listener::{ListenerHandle, ListenerKey};
use crate::proxy::{BackendRegistry, Forwarder, ProxyContext, ProxyLimits, RouteTable};

/// Default window over which store changes are batched.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub debounce: Duration,
    pub connect_timeout: Duration,
    pub limits: ProxyLimits,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            limits: ProxyLimits::default(),
        }
    }
}

/// A listener is named by its gateway and its own name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId {
    pub gateway: String,
    pub listener: String,
}

impl ListenerId {
    pub fn new(gateway: impl Into<String>, listener: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            listener: listener.into(),
        }
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.gateway, self.listener)
    }
}

/// A listener that could not be provisioned.
#[derive(Debug)]
pub struct ListenerError {
    pub id: ListenerId,
    pub error: BuildError,
}

// =============================================================================
// Dirty tracking
// =============================================================================

/// What a batch of changes invalidated.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dirty {
    pub gateways: HashSet<String>,
    pub backends: HashSet<String>,
    /// Events were lost; everything is rebuilt.
    pub full: bool,
}

impl Dirty {
    pub fn all() -> Self {
        Self {
            full: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.gateways.is_empty() && self.backends.is_empty()
    }

    /// Record one change. Both the old and the new version are considered
    /// so that detaching a route or policy dirties what it used to touch.
    pub fn add(&mut self, change: &ResourceChange) {
        let versions = change.old.iter().chain(change.new.iter());
        match change.kind {
            ResourceKind::Gateway => {
                self.gateways.insert(change.name.clone());
            }
            ResourceKind::Backend => {
                self.backends.insert(change.name.clone());
            }
            kind if kind.is_route() => {
                for resource in versions {
                    for parent in resource.parent_refs() {
                        self.gateways.insert(parent.name.clone());
                    }
                }
            }
            kind if kind.is_backend_policy() => {
                for resource in versions {
                    for target in resource.target_refs() {
                        if target.kind == ResourceKind::Backend {
                            self.backends.insert(target.name.clone());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn covers_gateway(&self, gateway: &str) -> bool {
        self.full || self.gateways.contains(gateway)
    }
}

// =============================================================================
// Attachment
// =============================================================================

/// Route kinds a listener protocol serves.
fn route_kinds(protocol: ListenerProtocol) -> &'static [ResourceKind] {
    match protocol {
        ListenerProtocol::Http | ListenerProtocol::Https => {
            &[ResourceKind::HttpRoute, ResourceKind::GrpcRoute]
        }
        ListenerProtocol::Tls => &[ResourceKind::TlsRoute],
        ListenerProtocol::Tcp => &[ResourceKind::TcpRoute],
        ListenerProtocol::Udp => &[ResourceKind::UdpRoute],
    }
}

/// Routes attached to `listener` of `gateway`, in snapshot order.
///
/// A parentRef attaches when it names the gateway and, if set, its
/// sectionName and port match the listener.
pub fn attached_routes(
    snapshot: &Snapshot,
    gateway: &str,
    listener: &ListenerSpec,
) -> Vec<Arc<Resource>> {
    route_kinds(listener.protocol)
        .iter()
        .flat_map(|kind| snapshot.list(*kind))
        .filter(|route| {
            route.parent_refs().iter().any(|parent| {
                parent.name == gateway
                    && parent
                        .section_name
                        .as_deref()
                        .is_none_or(|section| section == listener.name)
                    && parent.port.is_none_or(|port| port == listener.port)
            })
        })
        .collect()
}

/// Compile the route table for one listener, logging skipped rules.
fn build_table(snapshot: &Snapshot, id: &ListenerId, spec: &ListenerSpec) -> RouteTable {
    let routes = attached_routes(snapshot, &id.gateway, spec);
    let (table, errors) = RouteTable::build(spec.protocol, &routes);
    for e in errors {
        warn!(
            listener = %id,
            route = %e.route,
            rule = e.index,
            error = %e.error,
            "Route rule skipped"
        );
    }
    table
}

/// Desired listeners of the gateways in scope, in gateway then declaration
/// order.
fn desired_listeners(snapshot: &Snapshot, dirty: &Dirty) -> Vec<(ListenerId, ListenerSpec)> {
    let mut desired = Vec::new();
    for resource in snapshot.list(ResourceKind::Gateway) {
        let Resource::Gateway(gateway) = resource.as_ref() else {
            continue;
        };
        if !dirty.covers_gateway(gateway.name()) {
            continue;
        }
        let GatewaySpec { listeners } = &gateway.spec;
        for spec in listeners {
            desired.push((ListenerId::new(gateway.name(), &spec.name), spec.clone()));
        }
    }
    desired
}

// =============================================================================
// Runtime
// =============================================================================

/// Owns every listener and backend derived from a [`ResourceStore`].
pub struct GatewayRuntime {
    store: Arc<ResourceStore>,
    ctx: Arc<ProxyContext>,
    listeners: Mutex<BTreeMap<ListenerId, ListenerHandle>>,
    debounce: Duration,
    watcher: StdMutex<Option<JoinHandle<()>>>,
}

impl GatewayRuntime {
    /// Provision everything in the store and start following its changes.
    ///
    /// Listener failures are logged and returned; the runtime starts with
    /// whatever could be bound.
    pub async fn start(
        store: Arc<ResourceStore>,
        options: RuntimeOptions,
        observer: Arc<dyn GatewayObserver>,
    ) -> (Arc<Self>, Vec<ListenerError>) {
        let forwarder = Arc::new(Forwarder::new(options.connect_timeout));
        let ctx = Arc::new(ProxyContext {
            registry: Arc::new(BackendRegistry::new(Arc::clone(&forwarder))),
            forwarder,
            observer,
            limits: options.limits,
        });

        // Subscribe before reading the snapshot so nothing published in
        // between is missed.
        let changes = store.subscribe();
        let runtime = Arc::new(Self {
            store,
            ctx,
            listeners: Mutex::new(BTreeMap::new()),
            debounce: options.debounce,
            watcher: StdMutex::new(None),
        });

        let errors = runtime.reconcile(&Dirty::all()).await;
        info!(
            listeners = runtime.listeners.lock().await.len(),
            backends = runtime.ctx.registry.len(),
            failed_listeners = errors.len(),
            "Gateway runtime started"
        );

        let watcher = tokio::spawn(
            watch(Arc::downgrade(&runtime), changes, runtime.debounce)
                .instrument(tracing::info_span!("resource_watch")),
        );
        *runtime
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher);

        (runtime, errors)
    }

    /// [`start`](Self::start) with the tracing observer.
    pub async fn start_default(
        store: Arc<ResourceStore>,
        options: RuntimeOptions,
    ) -> (Arc<Self>, Vec<ListenerError>) {
        Self::start(store, options, Arc::new(TracingObserver)).await
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.ctx.registry
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Bound address of a listener, if it is running.
    pub async fn local_addr(&self, gateway: &str, listener: &str) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .await
            .get(&ListenerId::new(gateway, listener))
            .map(ListenerHandle::local_addr)
    }

    /// Running listeners, sorted.
    pub async fn listener_ids(&self) -> Vec<ListenerId> {
        self.listeners.lock().await.keys().cloned().collect()
    }

    /// Apply everything `dirty` names against the current snapshot.
    ///
    /// Normally driven by the change watcher; callable directly to force a
    /// resync.
    pub async fn reconcile(&self, dirty: &Dirty) -> Vec<ListenerError> {
        let mut listeners = self.listeners.lock().await;
        let snapshot = self.store.snapshot();
        debug!(version = snapshot.version(), dirty = ?dirty, "Reconciling");

        let backend_scope = (!dirty.full).then_some(&dirty.backends);
        for (backend, error) in self.ctx.registry.rebuild(&snapshot, backend_scope) {
            error!(backend = %backend, error = %error, "Backend unavailable");
        }

        let errors = self.sync_listeners(&mut listeners, &snapshot, dirty).await;

        self.ctx.registry.prune(&snapshot);
        errors
    }

    async fn sync_listeners(
        &self,
        listeners: &mut BTreeMap<ListenerId, ListenerHandle>,
        snapshot: &Snapshot,
        dirty: &Dirty,
    ) -> Vec<ListenerError> {
        let desired = desired_listeners(snapshot, dirty);
        let wanted: HashSet<&ListenerId> = desired.iter().map(|(id, _)| id).collect();
        let mut errors = Vec::new();

        // Listeners of in-scope gateways that are no longer declared.
        let stale: Vec<ListenerId> = listeners
            .keys()
            .filter(|id| dirty.covers_gateway(&id.gateway) && !wanted.contains(id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(handle) = listeners.remove(&id) {
                handle.shutdown().await;
                info!(listener = %id, "Listener removed");
            }
        }

        for (id, spec) in desired {
            let table = build_table(snapshot, &id, &spec);

            if let Some(handle) = listeners.get(&id) {
                if handle.spec() == &spec {
                    handle.swap_routes(table);
                    debug!(listener = %id, "Routes swapped");
                    continue;
                }
            }
            // Spec changed: release the old socket before binding the new one.
            if let Some(handle) = listeners.remove(&id) {
                handle.shutdown().await;
            }

            // Port 0 binds an ephemeral port and never collides.
            let key = ListenerKey::for_spec(&spec);
            let owner = (key.port != 0)
                .then(|| listeners.iter().find(|(_, h)| *h.key() == key))
                .flatten();
            if let Some((owner, _)) = owner {
                let error = BuildError::Listener {
                    listener: id.to_string(),
                    reason: format!("{} already used by {}", key, owner),
                };
                warn!(listener = %id, error = %error, "Listener conflict");
                errors.push(ListenerError { id, error });
                continue;
            }

            match ListenerHandle::bind(&spec, table, Arc::clone(&self.ctx)).await {
                Ok(handle) => {
                    listeners.insert(id, handle);
                }
                Err(error) => {
                    error!(listener = %id, error = %error, "Listener not provisioned");
                    errors.push(ListenerError { id, error });
                }
            }
        }
        errors
    }

    /// Stop watching the store, close every listener and stop health checks.
    pub async fn shutdown(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        let mut listeners = self.listeners.lock().await;
        for (_, handle) in std::mem::take(&mut *listeners) {
            handle.shutdown().await;
        }
        self.ctx.registry.prune(&Snapshot::default());
        info!("Gateway runtime stopped");
    }
}

impl Drop for GatewayRuntime {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

impl fmt::Debug for GatewayRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRuntime")
            .field("debounce", &self.debounce)
            .field("registry", &self.ctx.registry)
            .finish_non_exhaustive()
    }
}

/// Change loop. Exits when the store or the runtime goes away.
async fn watch(
    runtime: Weak<GatewayRuntime>,
    mut changes: broadcast::Receiver<ResourceChange>,
    debounce: Duration,
) {
    loop {
        let mut dirty = Dirty::default();
        let mut closed = false;

        match changes.recv().await {
            Ok(change) => dirty.add(&change),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Resource changes lagged; resyncing everything");
                dirty.full = true;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }

        let deadline = tokio::time::Instant::now() + debounce;
        loop {
            match tokio::time::timeout_at(deadline, changes.recv()).await {
                Err(_) => break,
                Ok(Ok(change)) => dirty.add(&change),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "Resource changes lagged; resyncing everything");
                    dirty.full = true;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    closed = true;
                    break;
                }
            }
        }

        let Some(runtime) = runtime.upgrade() else {
            return;
        };
        if !dirty.is_empty() {
            let errors = runtime.reconcile(&dirty).await;
            info!(
                gateways = dirty.gateways.len(),
                backends = dirty.backends.len(),
                full = dirty.full,
                failed_listeners = errors.len(),
                "Resource changes applied"
            );
        }
        if closed {
            return;
        }
    }
}
