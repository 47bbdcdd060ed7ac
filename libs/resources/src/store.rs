//! Copy-on-write resource store.
//!
//! The store keeps the full resource set as an immutable [`Snapshot`].
//! Every write builds a new snapshot, publishes it with a single `ArcSwap`
//! store and only then emits change events, so a subscriber that reacts to
//! an event always observes a snapshot that already contains it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::ResourceError;
use crate::types::{Resource, ResourceKind};

/// Capacity of the change broadcast channel. Slow subscribers that fall
/// further behind than this observe `RecvError::Lagged` and must resync.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// A single resource addition, update or removal.
#[derive(Debug, Clone)]
pub struct ResourceChange {
    pub kind: ResourceKind,
    pub name: String,
    /// The resource after the change; `None` for removals.
    pub new: Option<Arc<Resource>>,
    /// The resource before the change; `None` for additions.
    pub old: Option<Arc<Resource>>,
}

impl ResourceChange {
    pub fn is_removal(&self) -> bool {
        self.new.is_none()
    }
}

/// Immutable view of every published resource.
#[derive(Debug, Default)]
pub struct Snapshot {
    version: u64,
    by_kind: BTreeMap<ResourceKind, BTreeMap<String, Arc<Resource>>>,
}

impl Snapshot {
    fn from_resources(version: u64, resources: Vec<Resource>) -> Result<Self, ResourceError> {
        let mut by_kind: BTreeMap<ResourceKind, BTreeMap<String, Arc<Resource>>> = BTreeMap::new();

        for resource in resources {
            let kind = resource.kind();
            let name = resource.name().to_string();
            if name.is_empty() {
                return Err(ResourceError::EmptyName(kind));
            }

            let by_name = by_kind.entry(kind).or_default();
            if by_name.contains_key(&name) {
                return Err(ResourceError::Duplicate { kind, name });
            }
            by_name.insert(name, Arc::new(resource));
        }

        Ok(Self { version, by_kind })
    }

    /// Monotonic version, bumped on every published change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All resources of a kind, ordered by name.
    pub fn list(&self, kind: ResourceKind) -> Vec<Arc<Resource>> {
        self.by_kind
            .get(&kind)
            .map(|by_name| by_name.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<Arc<Resource>> {
        self.by_kind.get(&kind)?.get(name).cloned()
    }

    /// Policies of `kind` whose target refs name the given resource.
    pub fn policies_for(
        &self,
        kind: ResourceKind,
        target_kind: ResourceKind,
        target_name: &str,
    ) -> Vec<Arc<Resource>> {
        self.by_kind
            .get(&kind)
            .map(|by_name| {
                by_name
                    .values()
                    .filter(|policy| {
                        policy
                            .target_refs()
                            .iter()
                            .any(|r| r.kind == target_kind && r.name == target_name)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_kind.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute the changes that turn `self` into `next`.
    fn diff(&self, next: &Snapshot) -> Vec<ResourceChange> {
        let mut changes = Vec::new();

        for kind in ResourceKind::ALL {
            let empty = BTreeMap::new();
            let before = self.by_kind.get(&kind).unwrap_or(&empty);
            let after = next.by_kind.get(&kind).unwrap_or(&empty);

            for (name, new) in after {
                match before.get(name) {
                    Some(old) if old == new => {}
                    old => changes.push(ResourceChange {
                        kind,
                        name: name.clone(),
                        new: Some(Arc::clone(new)),
                        old: old.cloned(),
                    }),
                }
            }

            for (name, old) in before {
                if !after.contains_key(name) {
                    changes.push(ResourceChange {
                        kind,
                        name: name.clone(),
                        new: None,
                        old: Some(Arc::clone(old)),
                    });
                }
            }
        }

        changes
    }

    fn with_upsert(&self, resource: Resource) -> Self {
        let mut by_kind = self.by_kind.clone();
        by_kind
            .entry(resource.kind())
            .or_default()
            .insert(resource.name().to_string(), Arc::new(resource));
        Self {
            version: self.version + 1,
            by_kind,
        }
    }

    fn without(&self, kind: ResourceKind, name: &str) -> Self {
        let mut by_kind = self.by_kind.clone();
        if let Some(by_name) = by_kind.get_mut(&kind) {
            by_name.remove(name);
            if by_name.is_empty() {
                by_kind.remove(&kind);
            }
        }
        Self {
            version: self.version + 1,
            by_kind,
        }
    }
}

/// Resource store with lock-free reads and change subscriptions.
#[derive(Debug)]
pub struct ResourceStore {
    snapshot: ArcSwap<Snapshot>,
    changes: broadcast::Sender<ResourceChange>,
    /// Serializes writers so diffs are computed against the published snapshot.
    write_lock: Mutex<()>,
}

impl ResourceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            changes,
            write_lock: Mutex::new(()),
        }
    }

    /// Create a store pre-populated with resources. No events are emitted.
    pub fn with_resources(resources: Vec<Resource>) -> Result<Self, ResourceError> {
        let store = Self::new();
        store
            .snapshot
            .store(Arc::new(Snapshot::from_resources(1, resources)?));
        Ok(store)
    }

    /// Current snapshot. Holding it pins that version for the caller.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn list(&self, kind: ResourceKind) -> Vec<Arc<Resource>> {
        self.snapshot.load().list(kind)
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<Arc<Resource>> {
        self.snapshot.load().get(kind, name)
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version()
    }

    /// Subscribe to changes published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceChange> {
        self.changes.subscribe()
    }

    /// Replace the whole resource set atomically.
    ///
    /// Returns the number of change events emitted. Identical resources are
    /// not reported; an unchanged set publishes nothing.
    pub fn replace_all(&self, resources: Vec<Resource>) -> Result<usize, ResourceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot.load_full();
        let next = Snapshot::from_resources(current.version + 1, resources)?;
        let changes = current.diff(&next);
        if changes.is_empty() {
            debug!(version = current.version, "Resource set unchanged");
            return Ok(0);
        }

        let version = next.version;
        let count = next.len();
        self.snapshot.store(Arc::new(next));
        info!(
            version = version,
            resource_count = count,
            change_count = changes.len(),
            "Resource snapshot replaced"
        );

        Ok(self.publish(changes))
    }

    /// Add or replace a single resource.
    pub fn apply(&self, resource: Resource) -> Result<(), ResourceError> {
        if resource.name().is_empty() {
            return Err(ResourceError::EmptyName(resource.kind()));
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot.load_full();
        let kind = resource.kind();
        let name = resource.name().to_string();
        let old = current.get(kind, &name);
        if old.as_deref() == Some(&resource) {
            return Ok(());
        }

        let next = Arc::new(current.with_upsert(resource));
        let new = next.get(kind, &name);
        self.snapshot.store(next);
        debug!(kind = %kind, name = %name, "Resource applied");

        self.publish(vec![ResourceChange {
            kind,
            name,
            new,
            old,
        }]);
        Ok(())
    }

    /// Remove a resource. Returns false if it did not exist.
    pub fn delete(&self, kind: ResourceKind, name: &str) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.snapshot.load_full();
        let Some(old) = current.get(kind, name) else {
            return false;
        };

        self.snapshot.store(Arc::new(current.without(kind, name)));
        debug!(kind = %kind, name = %name, "Resource deleted");

        self.publish(vec![ResourceChange {
            kind,
            name: name.to_string(),
            new: None,
            old: Some(old),
        }]);
        true
    }

    fn publish(&self, changes: Vec<ResourceChange>) -> usize {
        let count = changes.len();
        for change in changes {
            // No subscribers is not an error.
            let _ = self.changes.send(change);
        }
        count
    }
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}
