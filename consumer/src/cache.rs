//! In-memory UID resolution caches maintained by the resource syncer and
//! read by the ingest hot path.

use data_types::{DeploymentId, NamespaceId, NodeId, PodId, PvcId, ResolveKind, ResourceId};
use hashbrown::HashMap;
use parking_lot::RwLock;

/// The syncer's UID → internal id caches.
///
/// One reader/writer lock covers all five maps: sync handlers take the write
/// lock after a successful catalog upsert (so readers only ever observe ids
/// backed by a durable row), ingest takes the read lock for [`resolve`].
///
/// The `replicasets` map is the only state with no catalog counterpart: it
/// carries the transient ReplicaSet → owning-Deployment indirection used to
/// link pods to deployments.
///
/// [`resolve`]: ResolverCache::resolve
#[derive(Debug, Default)]
pub struct ResolverCache {
    state: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    pods: HashMap<String, PodId>,
    pvcs: HashMap<String, PvcId>,
    namespaces: HashMap<String, NamespaceId>,
    nodes: HashMap<String, NodeId>,
    replicasets: HashMap<String, DeploymentId>,
}

impl ResolverCache {
    /// Initialise an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a collector-reported UID to its internal id.
    ///
    /// Returns `None` when the object has not been observed yet; the caller
    /// records the sample unresolved rather than waiting.
    pub fn resolve(&self, uid: &str, kind: ResolveKind) -> Option<ResourceId> {
        let state = self.state.read();
        match kind {
            ResolveKind::Pod => state.pods.get(uid).copied().map(Into::into),
            ResolveKind::Pvc => state.pvcs.get(uid).copied().map(Into::into),
        }
    }

    pub(crate) fn namespace(&self, name: &str) -> Option<NamespaceId> {
        self.state.read().namespaces.get(name).copied()
    }

    pub(crate) fn node(&self, name: &str) -> Option<NodeId> {
        self.state.read().nodes.get(name).copied()
    }

    pub(crate) fn replicaset_owner(&self, uid: &str) -> Option<DeploymentId> {
        self.state.read().replicasets.get(uid).copied()
    }

    pub(crate) fn record_pod(&self, uid: String, id: PodId) {
        self.state.write().pods.insert(uid, id);
    }

    pub(crate) fn record_pvc(&self, uid: String, id: PvcId) {
        self.state.write().pvcs.insert(uid, id);
    }

    pub(crate) fn record_namespace(&self, name: String, id: NamespaceId) {
        self.state.write().namespaces.insert(name, id);
    }

    pub(crate) fn record_node(&self, name: String, id: NodeId) {
        self.state.write().nodes.insert(name, id);
    }

    pub(crate) fn record_replicaset(&self, uid: String, id: DeploymentId) {
        self.state.write().replicasets.insert(uid, id);
    }
}
