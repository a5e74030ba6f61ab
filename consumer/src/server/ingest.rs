//! Ingestion of collector metric batches.
//!
//! The handler resolves each raw metric to an internal id through the
//! resolver cache and appends it to the live window; it never blocks on
//! either store. A batch is acknowledged once enqueued, not once persisted.

use data_types::{ResolveKind, ResourceId, Sample};
use hyper::{Body, Request, Response, StatusCode};
use observability_deps::tracing::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::{empty_response, HttpDelegate};

/// Metric keys marking a volume reading as claim usage.
const PVC_METRIC_KEYS: [&str; 4] = ["pvc_usage", "total_mb", "used_mb", "free_mb"];

/// The orchestrator's canonical volume name for a claim, capturing the claim
/// UID.
static PVC_VOLUME: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^pvc-([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})$")
        .expect("invalid pvc volume regex")
});

/// The pod segment of a cgroup slice path. The systemd driver flattens the
/// pod UID's hyphens to underscores; the capture undoes that.
static POD_SLICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"pod([0-9a-fA-F_]+)(?:\.slice)?").expect("invalid pod slice regex"));

/// One collector push: everything a node scraped in one cycle.
#[derive(Debug, Deserialize)]
pub(super) struct MetricBatch {
    pub(super) node: String,
    pub(super) metrics: Vec<RawMetric>,
}

/// A single untyped reading as emitted by the node collector.
#[derive(Debug, Deserialize)]
pub(super) struct RawMetric {
    /// Collector-side metric class; not consulted for identity resolution.
    #[serde(rename = "type", default)]
    #[allow(dead_code)]
    pub(super) class: Option<String>,
    #[serde(default)]
    pub(super) pod_id: Option<String>,
    #[serde(default)]
    pub(super) pod_uid: Option<String>,
    #[serde(default)]
    pub(super) volume: Option<String>,
    /// Per-container id; not carried into the recorded sample.
    #[serde(default)]
    #[allow(dead_code)]
    pub(super) container_id: Option<String>,
    pub(super) key: String,
    pub(super) value: f64,
    /// Epoch seconds at scrape time.
    pub(super) ts: i64,
}

/// Work out which identity a raw metric belongs to.
///
/// Claim-usage readings name the claim through the `pvc-<uuid>` volume name;
/// any other volume (config map, secret, scratch disk) falls back to the
/// owning pod. Container readings are identified by their cgroup slice, or
/// by an explicit pod UID when the collector already resolved one. `None`
/// means the metric carries no usable identity and is recorded unresolved.
pub(super) fn classify(metric: &RawMetric) -> Option<(ResolveKind, String)> {
    let volume = metric.volume.as_deref().unwrap_or_default();
    if !volume.is_empty() && PVC_METRIC_KEYS.contains(&metric.key.as_str()) {
        if let Some(captures) = PVC_VOLUME.captures(volume) {
            return Some((ResolveKind::Pvc, captures[1].to_owned()));
        }
        return pod_uid_fallback(metric);
    }

    if let Some(pod_id) = metric.pod_id.as_deref() {
        if let Some(captures) = POD_SLICE.captures(pod_id) {
            return Some((ResolveKind::Pod, captures[1].replace('_', "-")));
        }
    }
    pod_uid_fallback(metric)
}

fn pod_uid_fallback(metric: &RawMetric) -> Option<(ResolveKind, String)> {
    match metric.pod_uid.as_deref() {
        Some(uid) if !uid.is_empty() => Some((ResolveKind::Pod, uid.to_owned())),
        _ => None,
    }
}

impl HttpDelegate {
    /// `POST /api/v1/ingest`: enqueue a collector batch into the live
    /// window.
    pub(super) async fn handle_ingest(&self, req: Request<Body>) -> Response<Body> {
        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(_) => return empty_response(StatusCode::BAD_REQUEST),
        };
        let batch: MetricBatch = match serde_json::from_slice(&body) {
            Ok(batch) => batch,
            Err(_) => return empty_response(StatusCode::BAD_REQUEST),
        };

        for metric in &batch.metrics {
            // A UID that is not cached yet is accepted anyway and recorded
            // against the sentinel id; the owner may simply not have been
            // watched yet.
            let resource_id = classify(metric)
                .and_then(|(kind, uid)| self.cache.resolve(&uid, kind))
                .unwrap_or(ResourceId::UNRESOLVED);
            self.ring.add(Sample::raw(
                metric.ts,
                resource_id,
                metric.key.clone(),
                metric.value,
            ));
        }
        debug!(node = %batch.node, metrics = batch.metrics.len(), "batch enqueued");

        empty_response(StatusCode::ACCEPTED)
    }
}
