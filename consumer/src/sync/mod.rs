//! Mirrors orchestrator object state into the identity catalog and the
//! resolver caches.
//!
//! Adds and updates dispatch to the same upsert path; deletions are
//! intentionally ignored (stale identity rows are tolerated). Every cache
//! write happens after the corresponding catalog upsert succeeded, so the
//! ingest path never resolves to an id without a durable row behind it.

mod watch;
pub(crate) use watch::watch_all;

use std::sync::Arc;

use async_trait::async_trait;
use data_types::{DaemonSetId, DeploymentId, EntityKind, NamespaceId, NodeId, StatefulSetId};
use identity_catalog::{IdentityCatalog, STUB_UID_PREFIX};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use observability_deps::tracing::{debug, error, warn};

use crate::cache::ResolverCache;

/// Applies one decoded watch event.
///
/// The watch plumbing is generic over the object kind; this trait is the
/// seam that routes each kind to its upsert procedure.
#[async_trait]
pub(crate) trait ApplyEvent<K>: Send + Sync {
    async fn apply_event(&self, obj: K);
}

/// The stateful half of the watch pipeline.
///
/// Event application never fails outward: transient catalog errors are
/// logged and the event is skipped, leaving the caches untouched; the next
/// watch event or resync retries naturally.
#[derive(Debug)]
pub struct ResourceSyncer {
    catalog: Arc<IdentityCatalog>,
    cache: Arc<ResolverCache>,
}

impl ResourceSyncer {
    /// Initialise a syncer writing through to `catalog` and `cache`.
    pub fn new(catalog: Arc<IdentityCatalog>, cache: Arc<ResolverCache>) -> Self {
        Self { catalog, cache }
    }

    /// Upsert a Node and bind its name in the node cache.
    pub async fn apply_node(&self, node: Node) {
        let Some(uid) = node.metadata.uid else { return };
        let Some(name) = node.metadata.name else { return };

        match self.catalog.upsert_node(&uid, &name).await {
            Ok(id) => self.cache.record_node(name, id),
            Err(error) => error!(%error, node = %name, "node upsert failed"),
        }
    }

    /// Upsert a Deployment under its namespace.
    pub async fn apply_deployment(&self, deployment: Deployment) {
        let Some(uid) = deployment.metadata.uid else { return };
        let Some(name) = deployment.metadata.name else { return };
        let Some(namespace) = deployment.metadata.namespace else { return };
        let Some(namespace_id) = self.get_or_create_namespace(&namespace).await else {
            return;
        };

        if let Err(error) = self.catalog.upsert_deployment(&uid, &name, namespace_id).await {
            error!(%error, deployment = %name, "deployment upsert failed");
        }
    }

    /// Upsert a StatefulSet under its namespace.
    pub async fn apply_statefulset(&self, statefulset: StatefulSet) {
        let Some(uid) = statefulset.metadata.uid else { return };
        let Some(name) = statefulset.metadata.name else { return };
        let Some(namespace) = statefulset.metadata.namespace else { return };
        let Some(namespace_id) = self.get_or_create_namespace(&namespace).await else {
            return;
        };

        if let Err(error) = self
            .catalog
            .upsert_statefulset(&uid, &name, namespace_id)
            .await
        {
            error!(%error, statefulset = %name, "statefulset upsert failed");
        }
    }

    /// Upsert a DaemonSet under its namespace.
    pub async fn apply_daemonset(&self, daemonset: DaemonSet) {
        let Some(uid) = daemonset.metadata.uid else { return };
        let Some(name) = daemonset.metadata.name else { return };
        let Some(namespace) = daemonset.metadata.namespace else { return };
        let Some(namespace_id) = self.get_or_create_namespace(&namespace).await else {
            return;
        };

        if let Err(error) = self.catalog.upsert_daemonset(&uid, &name, namespace_id).await {
            error!(%error, daemonset = %name, "daemonset upsert failed");
        }
    }

    /// Record the ReplicaSet → owning-Deployment indirection.
    ///
    /// ReplicaSets are never persisted; they only matter as the hop between
    /// a pod's owner reference and the deployment id. A ReplicaSet whose
    /// Deployment has not been observed yet is skipped and retried on its
    /// next event.
    pub async fn apply_replicaset(&self, replicaset: ReplicaSet) {
        let Some(uid) = replicaset.metadata.uid else { return };
        let owners = replicaset.metadata.owner_references.unwrap_or_default();
        let Some(owner) = owners.iter().find(|o| o.kind == "Deployment") else {
            return;
        };

        if let Some(id) = self.lookup(EntityKind::Deployment, &owner.uid).await {
            self.cache.record_replicaset(uid, DeploymentId::new(id));
        }
    }

    /// Upsert a Pod, resolving namespace, node and controller links first.
    ///
    /// Unscheduled pods are skipped; the orchestrator re-emits the pod once
    /// it lands on a node. An unseen node name gets a stub row so the pod is
    /// never written with a dangling node reference.
    pub async fn apply_pod(&self, pod: Pod) {
        let Some(uid) = pod.metadata.uid else { return };
        let Some(name) = pod.metadata.name else { return };
        let Some(namespace) = pod.metadata.namespace else { return };
        let Some(namespace_id) = self.get_or_create_namespace(&namespace).await else {
            warn!(pod = %name, namespace = %namespace, "skipping pod with unresolved namespace");
            return;
        };

        let node_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.node_name.clone())
            .unwrap_or_default();
        if node_name.is_empty() {
            debug!(pod = %name, "skipping unscheduled pod");
            return;
        }
        let Some(node_id) = self.node_id(&node_name).await else {
            warn!(pod = %name, node = %node_name, "skipping pod with unresolved node");
            return;
        };

        let owners = pod.metadata.owner_references.unwrap_or_default();
        let (deployment_id, statefulset_id, daemonset_id) = self.controller_links(&owners).await;

        match self
            .catalog
            .upsert_pod(
                &uid,
                &name,
                namespace_id,
                node_id,
                deployment_id,
                statefulset_id,
                daemonset_id,
            )
            .await
        {
            Ok(id) => self.cache.record_pod(uid, id),
            Err(error) => error!(%error, pod = %name, "pod upsert failed"),
        }
    }

    /// Upsert a PersistentVolumeClaim and bind its uid in the PVC cache.
    pub async fn apply_pvc(&self, pvc: PersistentVolumeClaim) {
        let Some(uid) = pvc.metadata.uid else { return };
        let Some(name) = pvc.metadata.name else { return };
        let Some(namespace) = pvc.metadata.namespace else { return };
        let Some(namespace_id) = self.get_or_create_namespace(&namespace).await else {
            return;
        };

        match self.catalog.upsert_pvc(&uid, &name, namespace_id).await {
            Ok(id) => self.cache.record_pvc(uid, id),
            Err(error) => error!(%error, pvc = %name, "pvc upsert failed"),
        }
    }

    async fn get_or_create_namespace(&self, name: &str) -> Option<NamespaceId> {
        if let Some(id) = self.cache.namespace(name) {
            return Some(id);
        }
        match self.catalog.upsert_namespace(name).await {
            Ok(id) => {
                self.cache.record_namespace(name.to_owned(), id);
                Some(id)
            }
            Err(error) => {
                error!(%error, namespace = name, "namespace upsert failed");
                None
            }
        }
    }

    /// The node id for `node_name`, creating a stub row when the Node event
    /// has not arrived yet.
    ///
    /// The stub's synthesized uid keeps the `uid` unique constraint happy;
    /// the real Node event later reconciles onto the same row by name.
    async fn node_id(&self, node_name: &str) -> Option<NodeId> {
        if let Some(id) = self.cache.node(node_name) {
            return Some(id);
        }
        let stub_uid = format!("{STUB_UID_PREFIX}{node_name}");
        match self.catalog.upsert_node(&stub_uid, node_name).await {
            Ok(id) => {
                self.cache.record_node(node_name.to_owned(), id);
                Some(id)
            }
            Err(error) => {
                error!(%error, node = node_name, "stub node upsert failed");
                None
            }
        }
    }

    /// Resolve a pod's owner reference to at most one controller link.
    ///
    /// StatefulSet and DaemonSet owners are looked up in the catalog;
    /// ReplicaSet owners go through the in-memory indirection. A ReplicaSet
    /// that is not cached yet leaves the deployment link empty until the
    /// pod's next event.
    async fn controller_links(
        &self,
        owners: &[OwnerReference],
    ) -> (
        Option<DeploymentId>,
        Option<StatefulSetId>,
        Option<DaemonSetId>,
    ) {
        let mut deployment = None;
        let mut statefulset = None;
        let mut daemonset = None;

        for owner in owners {
            match owner.kind.as_str() {
                "ReplicaSet" => deployment = self.cache.replicaset_owner(&owner.uid),
                "StatefulSet" => {
                    statefulset = self
                        .lookup(EntityKind::StatefulSet, &owner.uid)
                        .await
                        .map(StatefulSetId::new)
                }
                "DaemonSet" => {
                    daemonset = self
                        .lookup(EntityKind::DaemonSet, &owner.uid)
                        .await
                        .map(DaemonSetId::new)
                }
                _ => {}
            }
        }

        (deployment, statefulset, daemonset)
    }

    async fn lookup(&self, kind: EntityKind, uid: &str) -> Option<i64> {
        match self.catalog.resource_id(kind, uid).await {
            Ok(id) => id,
            Err(error) => {
                error!(%error, kind = %kind, uid, "owner lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl ApplyEvent<Node> for ResourceSyncer {
    async fn apply_event(&self, obj: Node) {
        self.apply_node(obj).await
    }
}

#[async_trait]
impl ApplyEvent<Deployment> for ResourceSyncer {
    async fn apply_event(&self, obj: Deployment) {
        self.apply_deployment(obj).await
    }
}

#[async_trait]
impl ApplyEvent<StatefulSet> for ResourceSyncer {
    async fn apply_event(&self, obj: StatefulSet) {
        self.apply_statefulset(obj).await
    }
}

#[async_trait]
impl ApplyEvent<DaemonSet> for ResourceSyncer {
    async fn apply_event(&self, obj: DaemonSet) {
        self.apply_daemonset(obj).await
    }
}

#[async_trait]
impl ApplyEvent<ReplicaSet> for ResourceSyncer {
    async fn apply_event(&self, obj: ReplicaSet) {
        self.apply_replicaset(obj).await
    }
}

#[async_trait]
impl ApplyEvent<Pod> for ResourceSyncer {
    async fn apply_event(&self, obj: Pod) {
        self.apply_pod(obj).await
    }
}

#[async_trait]
impl ApplyEvent<PersistentVolumeClaim> for ResourceSyncer {
    async fn apply_event(&self, obj: PersistentVolumeClaim) {
        self.apply_pvc(obj).await
    }
}

#[cfg(test)]
mod tests {
    use data_types::ResolveKind;
    use identity_catalog::PodFilter;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    async fn syncer() -> (ResourceSyncer, Arc<IdentityCatalog>, Arc<ResolverCache>) {
        let catalog = Arc::new(IdentityCatalog::open_in_memory().await.unwrap());
        let cache = Arc::new(ResolverCache::new());
        (
            ResourceSyncer::new(Arc::clone(&catalog), Arc::clone(&cache)),
            catalog,
            cache,
        )
    }

    fn pod(uid: &str, name: &str, namespace: &str, node_name: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.into()),
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node_name.map(Into::into),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn owner(kind: &str, name: &str, uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".into(),
            kind: kind.into(),
            name: name.into(),
            uid: uid.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unscheduled_pod_is_skipped_until_scheduled() {
        let (syncer, catalog, cache) = syncer().await;

        syncer.apply_pod(pod("p-1", "web-xyz", "ns-a", None)).await;
        assert!(catalog
            .list_pods(&PodFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(cache.resolve("p-1", ResolveKind::Pod), None);

        // The re-emitted event after scheduling creates the row.
        syncer
            .apply_pod(pod("p-1", "web-xyz", "ns-a", Some("host-1")))
            .await;
        let pods = catalog.list_pods(&PodFilter::default()).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert!(cache.resolve("p-1", ResolveKind::Pod).is_some());
    }

    #[tokio::test]
    async fn pod_before_node_gets_a_stub_that_reconciles() {
        let (syncer, catalog, cache) = syncer().await;

        syncer
            .apply_pod(pod("p-1", "web-xyz", "ns-a", Some("host-1")))
            .await;

        let nodes = catalog.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].uid, "stub-host-1");
        let stub_id = cache.node("host-1").unwrap();

        // The real Node event lands on the same row and the cache binding
        // stays put.
        syncer
            .apply_node(Node {
                metadata: ObjectMeta {
                    uid: Some("n-1".into()),
                    name: Some("host-1".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;

        let nodes = catalog.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].uid, "n-1");
        assert_eq!(cache.node("host-1").unwrap(), stub_id);
    }

    #[tokio::test]
    async fn replicaset_hop_links_pod_to_deployment() {
        let (syncer, catalog, _cache) = syncer().await;

        syncer
            .apply_deployment(Deployment {
                metadata: ObjectMeta {
                    uid: Some("d-1".into()),
                    name: Some("web".into()),
                    namespace: Some("ns-a".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;
        syncer
            .apply_replicaset(ReplicaSet {
                metadata: ObjectMeta {
                    uid: Some("rs-1".into()),
                    name: Some("web-5f6d".into()),
                    namespace: Some("ns-a".into()),
                    owner_references: Some(vec![owner("Deployment", "web", "d-1")]),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;

        let mut scheduled = pod("p-1", "web-xyz", "ns-a", Some("host-1"));
        scheduled.metadata.owner_references = Some(vec![owner("ReplicaSet", "web-5f6d", "rs-1")]);
        syncer.apply_pod(scheduled).await;

        let pods = catalog.list_pods(&PodFilter::default()).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].deployment.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn uncached_replicaset_leaves_deployment_link_empty() {
        let (syncer, catalog, _cache) = syncer().await;

        // The ReplicaSet event has not been observed; the pod is written
        // without the link and picks it up on its next event.
        let mut scheduled = pod("p-1", "web-xyz", "ns-a", Some("host-1"));
        scheduled.metadata.owner_references = Some(vec![owner("ReplicaSet", "web-5f6d", "rs-1")]);
        syncer.apply_pod(scheduled).await;

        let pods = catalog.list_pods(&PodFilter::default()).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].deployment, None);
    }

    #[tokio::test]
    async fn pvc_event_binds_uid_cache() {
        let (syncer, catalog, cache) = syncer().await;

        syncer
            .apply_pvc(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    uid: Some("11111111-2222-3333-4444-555555555555".into()),
                    name: Some("data-0".into()),
                    namespace: Some("ns-a".into()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;

        let rows = catalog.list_pvcs(None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            cache
                .resolve("11111111-2222-3333-4444-555555555555", ResolveKind::Pvc)
                .map(|id| id.get()),
            Some(rows[0].id)
        );
    }
}
