//! End-to-end scenarios: watch events applied through the syncer, collector
//! batches pushed through the HTTP delegate, live views read back out. No
//! cluster required; objects are built by hand.

use std::sync::Arc;

use chrono::Utc;
use consumer::{HttpDelegate, ResolverCache, ResourceSyncer};
use data_types::ResolveKind;
use hyper::{Body, Method, Request, StatusCode};
use identity_catalog::IdentityCatalog;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use ring_window::RingWindow;
use sample_store::SampleStore;
use serde_json::{json, Value};

const POD_UID: &str = "4f2b3a19-1111-4c4c-aa22-0f11e2d33c44";
const PVC_UID: &str = "11111111-2222-3333-4444-555555555555";

struct Fixture {
    cache: Arc<ResolverCache>,
    ring: Arc<RingWindow>,
    syncer: ResourceSyncer,
    http: HttpDelegate,
}

async fn fixture_with_capacity(capacity: usize) -> Fixture {
    let catalog = Arc::new(IdentityCatalog::open_in_memory().await.unwrap());
    let cache = Arc::new(ResolverCache::new());
    let ring = Arc::new(RingWindow::new(capacity));
    let syncer = ResourceSyncer::new(Arc::clone(&catalog), Arc::clone(&cache));
    let http = HttpDelegate::new(Arc::clone(&cache), Arc::clone(&ring), catalog);
    Fixture {
        cache,
        ring,
        syncer,
        http,
    }
}

async fn fixture() -> Fixture {
    fixture_with_capacity(ring_window::DEFAULT_CAPACITY).await
}

fn node(uid: &str, name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            uid: Some(uid.into()),
            name: Some(name.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn deployment(uid: &str, name: &str, namespace: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            uid: Some(uid.into()),
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn replicaset(uid: &str, name: &str, namespace: &str, deployment_uid: &str) -> ReplicaSet {
    ReplicaSet {
        metadata: ObjectMeta {
            uid: Some(uid.into()),
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                name: "web".into(),
                uid: deployment_uid.into(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pod(uid: &str, name: &str, namespace: &str, node_name: &str, owner: Option<OwnerReference>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            uid: Some(uid.into()),
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pvc(uid: &str, name: &str, namespace: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            uid: Some(uid.into()),
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Sync the S1 topology: namespace, node, deployment, replicaset, pod.
async fn sync_web_pod(fixture: &Fixture) {
    fixture.syncer.apply_node(node("n-1", "host-1")).await;
    fixture
        .syncer
        .apply_deployment(deployment("d-1", "web", "ns-a"))
        .await;
    fixture
        .syncer
        .apply_replicaset(replicaset("rs-1", "web-5f6d", "ns-a", "d-1"))
        .await;
    fixture
        .syncer
        .apply_pod(pod(
            POD_UID,
            "web-xyz",
            "ns-a",
            "host-1",
            Some(OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: "web-5f6d".into(),
                uid: "rs-1".into(),
                ..Default::default()
            }),
        ))
        .await;
}

fn pod_slice(uid: &str) -> String {
    format!("kubepods-burstable-pod{}.slice", uid.replace('-', "_"))
}

async fn post_ingest(http: &HttpDelegate, body: Value) -> StatusCode {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/ingest")
        .body(Body::from(body.to_string()))
        .expect("failed to construct HTTP request");
    http.route(req).await.status()
}

async fn get_json(http: &HttpDelegate, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("failed to construct HTTP request");
    let resp = http.route(req).await;
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn first_contact_pod_shows_up_in_lists_and_live_view() {
    let fixture = fixture().await;
    sync_web_pod(&fixture).await;

    let ts = Utc::now().timestamp();
    let status = post_ingest(
        &fixture.http,
        json!({
            "node": "host-1",
            "metrics": [
                {"type": "container", "pod_id": pod_slice(POD_UID), "key": "cpu_ms", "value": 123.0, "ts": ts},
                {"type": "container", "pod_id": pod_slice(POD_UID), "key": "mem_mb", "value": 64.0, "ts": ts},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, pods) = get_json(&fixture.http, "/api/v1/pods").await;
    assert_eq!(status, StatusCode::OK);
    let pods = pods.as_array().unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0]["name"], "web-xyz");
    assert_eq!(pods[0]["deployment"], "web");
    assert_eq!(pods[0]["namespace"], "ns-a");
    assert_eq!(pods[0]["node"], "host-1");

    let (status, live) = get_json(&fixture.http, "/api/v1/metrics/live").await;
    assert_eq!(status, StatusCode::OK);
    let live_pods = live["pods"].as_array().unwrap();
    assert_eq!(live_pods.len(), 1);
    assert_eq!(live_pods[0]["uid"], POD_UID);
    let containers = live_pods[0]["containers"].as_array().unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0]["id"], "default");
    assert_eq!(containers[0]["cpu_ms"], 123.0);
    assert_eq!(containers[0]["mem_mb"], 64.0);

    // The live filters intersect with the fresh set.
    let deployment_id = {
        let (_, deployments) = get_json(&fixture.http, "/api/v1/deployments").await;
        deployments.as_array().unwrap()[0]["id"].as_i64().unwrap()
    };
    let (_, live) = get_json(
        &fixture.http,
        &format!("/api/v1/metrics/live?deployment={deployment_id}"),
    )
    .await;
    assert_eq!(live["pods"].as_array().unwrap().len(), 1);
    let (_, live) = get_json(
        &fixture.http,
        &format!("/api/v1/metrics/live?deployment={}", deployment_id + 1),
    )
    .await;
    assert_eq!(live["pods"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn out_of_order_ingest_is_accepted_but_unresolved() {
    let fixture = fixture().await;

    // The metric arrives before any Pod event referencing its UID.
    let ts = Utc::now().timestamp();
    let status = post_ingest(
        &fixture.http,
        json!({
            "node": "host-1",
            "metrics": [
                {"type": "container", "pod_id": pod_slice(POD_UID), "key": "cpu_ms", "value": 5.0, "ts": ts},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let window = fixture.ring.read_all();
    assert_eq!(window.len(), 1);
    assert!(window[0].resource_id.is_unresolved());

    // Unresolved samples never make it into the live view.
    let (_, live) = get_json(&fixture.http, "/api/v1/metrics/live").await;
    assert_eq!(live["pods"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn pvc_metric_resolves_to_claim_id_and_nests_in_live_view() {
    let fixture = fixture().await;
    sync_web_pod(&fixture).await;
    fixture.syncer.apply_pvc(pvc(PVC_UID, "data-0", "ns-a")).await;

    let claim_id = fixture
        .cache
        .resolve(PVC_UID, ResolveKind::Pvc)
        .expect("claim should be cached after sync");

    let ts = Utc::now().timestamp();
    let status = post_ingest(
        &fixture.http,
        json!({
            "node": "host-1",
            "metrics": [
                {"type": "volume", "volume": format!("pvc-{PVC_UID}"), "key": "used_mb", "value": 42.0, "ts": ts},
                {"type": "container", "pod_id": pod_slice(POD_UID), "key": "cpu_ms", "value": 1.0, "ts": ts},
            ],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let window = fixture.ring.read_all();
    assert_eq!(window[0].resource_id, claim_id);
    assert_eq!(window[0].metric_type, "used_mb");

    // The claim's aggregate rides along with pods of its namespace.
    let (_, live) = get_json(&fixture.http, "/api/v1/metrics/live").await;
    let live_pods = live["pods"].as_array().unwrap();
    assert_eq!(live_pods.len(), 1);
    let pvcs = live_pods[0]["pvcs"].as_array().unwrap();
    assert_eq!(pvcs.len(), 1);
    assert_eq!(pvcs[0]["name"], "data-0");
    assert_eq!(pvcs[0]["used_mb"], 42.0);
}

#[tokio::test]
async fn stale_samples_do_not_appear_live() {
    let fixture = fixture().await;
    sync_web_pod(&fixture).await;

    // Older than the 5 s freshness horizon.
    let ts = Utc::now().timestamp() - 30;
    post_ingest(
        &fixture.http,
        json!({
            "node": "host-1",
            "metrics": [
                {"type": "container", "pod_id": pod_slice(POD_UID), "key": "cpu_ms", "value": 9.0, "ts": ts},
            ],
        }),
    )
    .await;

    let (_, live) = get_json(&fixture.http, "/api/v1/metrics/live").await;
    assert_eq!(live["pods"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn overflowing_batch_is_truncated_to_window_capacity() {
    let fixture = fixture_with_capacity(4).await;

    let metrics: Vec<Value> = (0..6)
        .map(|i| json!({"type": "container", "pod_uid": POD_UID, "key": "cpu_ms", "value": i as f64, "ts": 1000 + i}))
        .collect();
    let status = post_ingest(
        &fixture.http,
        json!({"node": "host-1", "metrics": metrics}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let window = fixture.ring.read_all();
    assert_eq!(window.len(), 4);
    assert_eq!(
        window.iter().map(|s| s.time).collect::<Vec<_>>(),
        vec![1000, 1001, 1002, 1003],
        "overflow drops the newest samples"
    );
    assert_eq!(fixture.ring.dropped(), 2);
}

#[tokio::test]
async fn flush_moves_the_window_into_the_sample_store() {
    let fixture = fixture().await;
    sync_web_pod(&fixture).await;
    let store = SampleStore::open_in_memory().await.unwrap();

    let ts = Utc::now().timestamp();
    post_ingest(
        &fixture.http,
        json!({
            "node": "host-1",
            "metrics": [
                {"type": "container", "pod_id": pod_slice(POD_UID), "key": "cpu_ms", "value": 123.0, "ts": ts},
            ],
        }),
    )
    .await;

    let pod_id = fixture
        .cache
        .resolve(POD_UID, ResolveKind::Pod)
        .expect("pod should be cached after sync");

    let flushed = fixture.ring.flush();
    store.batch_insert(&flushed).await.unwrap();

    assert!(fixture.ring.read_all().is_empty());
    let persisted = store.samples_for_resource(pod_id.get()).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].metric_type, "cpu_ms");
    assert_eq!(persisted[0].value, 123.0);
    assert_eq!(persisted[0].time, ts);
}

#[tokio::test]
async fn list_endpoints_serve_identity() {
    let fixture = fixture().await;
    sync_web_pod(&fixture).await;
    fixture.syncer.apply_pvc(pvc(PVC_UID, "data-0", "ns-a")).await;

    let (status, nodes) = get_json(&fixture.http, "/api/v1/nodes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(nodes.as_array().unwrap().len(), 1);
    assert_eq!(nodes[0]["name"], "host-1");
    assert_eq!(nodes[0]["uid"], "n-1");

    let (_, namespaces) = get_json(&fixture.http, "/api/v1/namespaces").await;
    assert_eq!(namespaces.as_array().unwrap().len(), 1);
    assert_eq!(namespaces[0]["name"], "ns-a");

    let namespace_id = namespaces[0]["id"].as_i64().unwrap();
    let (_, deployments) = get_json(
        &fixture.http,
        &format!("/api/v1/deployments?namespace={namespace_id}"),
    )
    .await;
    assert_eq!(deployments.as_array().unwrap().len(), 1);
    assert_eq!(deployments[0]["name"], "web");
    assert_eq!(deployments[0]["namespace"], "ns-a");

    let (_, pvcs) = get_json(
        &fixture.http,
        &format!("/api/v1/pvcs?namespace={namespace_id}"),
    )
    .await;
    assert_eq!(pvcs.as_array().unwrap().len(), 1);
    assert_eq!(pvcs[0]["name"], "data-0");

    // Malformed filter values are treated as absent.
    let (status, pods) = get_json(&fixture.http, "/api/v1/pods?node=abc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pods.as_array().unwrap().len(), 1);

    // Filters that match nothing return empty lists.
    let (_, pods) = get_json(&fixture.http, "/api/v1/pods?node=999").await;
    assert_eq!(pods.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn protocol_violations_get_4xx() {
    let fixture = fixture().await;

    let req = Request::builder()
        .method(Method::GET)
        .uri("/api/v1/ingest")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        fixture.http.route(req).await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/pods")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        fixture.http.route(req).await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/ingest")
        .body(Body::from("{not json"))
        .unwrap();
    assert_eq!(fixture.http.route(req).await.status(), StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .method(Method::GET)
        .uri("/api/v1/nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(fixture.http.route(req).await.status(), StatusCode::NOT_FOUND);

    let req = Request::builder()
        .method(Method::GET)
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let resp = fixture.http.route(req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    assert_eq!(&body[..], b"OK");
}
