//! Read-only dashboard endpoints.
//!
//! List endpoints are plain identity-catalog reads. The live view joins the
//! catalog against a defensive copy of the live window, returning only pods
//! with a sufficiently recent sample.

use std::time::Duration;

use chrono::Utc;
use data_types::Sample;
use hashbrown::{HashMap, HashSet};
use hyper::{Body, Response, StatusCode};
use identity_catalog::{PodFilter, PodRow, PvcLiveRow};
use observability_deps::tracing::error;
use serde::Serialize;

use super::{empty_response, int_param, json_response, HttpDelegate};

/// How recent a pod's newest sample must be for the pod to appear in the
/// live view.
const LIVE_WINDOW: Duration = Duration::from_secs(5);

/// All per-pod container samples aggregate under this synthetic id; the
/// sample record does not carry container identity.
const DEFAULT_CONTAINER: &str = "default";

#[derive(Debug, Serialize)]
struct LiveView {
    timestamp: i64,
    pods: Vec<LivePod>,
}

#[derive(Debug, Serialize)]
struct LivePod {
    id: i64,
    name: String,
    uid: String,
    namespace: String,
    node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployment: Option<String>,
    containers: Vec<ContainerUsage>,
    pvcs: Vec<PvcUsage>,
}

#[derive(Debug, Serialize)]
struct ContainerUsage {
    id: &'static str,
    cpu_ms: f64,
    mem_mb: f64,
    mem_limit_mb: f64,
}

#[derive(Debug, Serialize)]
struct PvcUsage {
    id: i64,
    name: String,
    total_mb: f64,
    used_mb: f64,
    free_mb: f64,
}

impl HttpDelegate {
    /// `GET /api/v1/nodes`
    pub(super) async fn handle_nodes(&self) -> Response<Body> {
        match self.catalog.list_nodes().await {
            Ok(rows) => json_response(&rows),
            Err(error) => {
                error!(%error, "node listing failed");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// `GET /api/v1/namespaces`
    pub(super) async fn handle_namespaces(&self) -> Response<Body> {
        match self.catalog.list_namespaces().await {
            Ok(rows) => json_response(&rows),
            Err(error) => {
                error!(%error, "namespace listing failed");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// `GET /api/v1/deployments?namespace=`
    pub(super) async fn handle_deployments(&self, query: Option<&str>) -> Response<Body> {
        match self
            .catalog
            .list_deployments(int_param(query, "namespace"))
            .await
        {
            Ok(rows) => json_response(&rows),
            Err(error) => {
                error!(%error, "deployment listing failed");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// `GET /api/v1/pods?deployment=&namespace=&node=`
    pub(super) async fn handle_pods(&self, query: Option<&str>) -> Response<Body> {
        let filter = PodFilter {
            deployment: int_param(query, "deployment"),
            namespace: int_param(query, "namespace"),
            node: int_param(query, "node"),
            ..Default::default()
        };
        match self.catalog.list_pods(&filter).await {
            Ok(rows) => json_response(&rows),
            Err(error) => {
                error!(%error, "pod listing failed");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// `GET /api/v1/pvcs?namespace=`
    pub(super) async fn handle_pvcs(&self, query: Option<&str>) -> Response<Body> {
        match self.catalog.list_pvcs(int_param(query, "namespace")).await {
            Ok(rows) => json_response(&rows),
            Err(error) => {
                error!(%error, "pvc listing failed");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// `GET /api/v1/metrics/live?deployment=&node=&pod=`
    ///
    /// The window copy taken up front is the single source for both the
    /// freshness filter and the aggregation, so a flush racing this request
    /// cannot split a pod's samples across the two.
    pub(super) async fn handle_live(&self, query: Option<&str>) -> Response<Body> {
        let now = Utc::now().timestamp();
        let cutoff = now - LIVE_WINDOW.as_secs() as i64;
        let window = self.ring.read_all();

        let mut live_ids: Vec<i64> = window
            .iter()
            .filter(|s| s.time >= cutoff && !s.resource_id.is_unresolved())
            .map(|s| s.resource_id.get())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        live_ids.sort_unstable();

        if live_ids.is_empty() {
            return json_response(&LiveView {
                timestamp: now,
                pods: vec![],
            });
        }

        let filter = PodFilter {
            deployment: int_param(query, "deployment"),
            node: int_param(query, "node"),
            pod: int_param(query, "pod"),
            ids: Some(live_ids.clone()),
            ..Default::default()
        };
        let pods = match self.catalog.list_pods(&filter).await {
            Ok(pods) => pods,
            Err(error) => {
                error!(%error, "live pod lookup failed");
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        let pvcs = match self.catalog.live_pvcs(&live_ids).await {
            Ok(pvcs) => pvcs,
            Err(error) => {
                error!(%error, "live pvc lookup failed");
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let latest = latest_values(&window, cutoff);
        let pods = pods
            .into_iter()
            .map(|pod| assemble_pod(pod, &pvcs, &latest))
            .collect();

        json_response(&LiveView {
            timestamp: now,
            pods,
        })
    }
}

/// The most recent value per (resource, metric) within the freshness window.
fn latest_values<'a>(window: &'a [Sample], cutoff: i64) -> HashMap<(i64, &'a str), (i64, f64)> {
    let mut latest: HashMap<(i64, &str), (i64, f64)> = HashMap::new();
    for sample in window.iter().filter(|s| s.time >= cutoff) {
        let entry = latest
            .entry((sample.resource_id.get(), sample.metric_type.as_str()))
            .or_insert((sample.time, sample.value));
        if sample.time >= entry.0 {
            *entry = (sample.time, sample.value);
        }
    }
    latest
}

fn assemble_pod(
    pod: PodRow,
    pvcs: &[PvcLiveRow],
    latest: &HashMap<(i64, &str), (i64, f64)>,
) -> LivePod {
    let value = |id: i64, key: &str| latest.get(&(id, key)).map(|(_, v)| *v).unwrap_or_default();

    // The model has no pod → claim edge; claims are grouped under the pods
    // of their namespace.
    let pvcs = pvcs
        .iter()
        .filter(|claim| claim.namespace_id == pod.namespace_id)
        .map(|claim| PvcUsage {
            id: claim.id,
            name: claim.name.clone(),
            total_mb: value(claim.id, "total_mb"),
            used_mb: value(claim.id, "used_mb"),
            free_mb: value(claim.id, "free_mb"),
        })
        .collect();

    LivePod {
        containers: vec![ContainerUsage {
            id: DEFAULT_CONTAINER,
            cpu_ms: value(pod.id, "cpu_ms"),
            mem_mb: value(pod.id, "mem_mb"),
            mem_limit_mb: value(pod.id, "mem_limit_mb"),
        }],
        pvcs,
        id: pod.id,
        name: pod.name,
        uid: pod.uid,
        namespace: pod.namespace,
        node: pod.node,
        deployment: pod.deployment,
    }
}
