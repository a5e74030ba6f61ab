//! The consumer's HTTP surface: the collector-facing ingest endpoint and the
//! dashboard-facing query API.

mod ingest;
mod query;

use std::sync::Arc;

use hyper::{header, Body, Method, Request, Response, StatusCode};
use identity_catalog::IdentityCatalog;
use observability_deps::tracing::error;
use ring_window::RingWindow;
use serde::Serialize;

use crate::cache::ResolverCache;

/// Routes every request the consumer serves.
///
/// The ingest path touches only the live window and the resolver cache; the
/// query paths additionally read the identity catalog. Neither ever writes
/// the sample store.
#[derive(Debug)]
pub struct HttpDelegate {
    cache: Arc<ResolverCache>,
    ring: Arc<RingWindow>,
    catalog: Arc<IdentityCatalog>,
}

impl HttpDelegate {
    /// Initialise a delegate over the shared consumer state.
    pub fn new(
        cache: Arc<ResolverCache>,
        ring: Arc<RingWindow>,
        catalog: Arc<IdentityCatalog>,
    ) -> Self {
        Self {
            cache,
            ring,
            catalog,
        }
    }

    /// Dispatch `req` to its handler.
    pub async fn route(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().to_owned();
        let query = req.uri().query().map(ToOwned::to_owned);

        match (req.method().clone(), path.as_str()) {
            (Method::POST, "/api/v1/ingest") => self.handle_ingest(req).await,
            (Method::GET, "/api/v1/nodes") => self.handle_nodes().await,
            (Method::GET, "/api/v1/namespaces") => self.handle_namespaces().await,
            (Method::GET, "/api/v1/deployments") => {
                self.handle_deployments(query.as_deref()).await
            }
            (Method::GET, "/api/v1/pods") => self.handle_pods(query.as_deref()).await,
            (Method::GET, "/api/v1/pvcs") => self.handle_pvcs(query.as_deref()).await,
            (Method::GET, "/api/v1/metrics/live") => self.handle_live(query.as_deref()).await,
            (Method::GET, "/health") => text_response("OK"),
            (
                _,
                "/api/v1/ingest"
                | "/api/v1/nodes"
                | "/api/v1/namespaces"
                | "/api/v1/deployments"
                | "/api/v1/pods"
                | "/api/v1/pvcs"
                | "/api/v1/metrics/live"
                | "/health",
            ) => empty_response(StatusCode::METHOD_NOT_ALLOWED),
            _ => empty_response(StatusCode::NOT_FOUND),
        }
    }
}

fn json_response<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("failed to construct response"),
        Err(error) => {
            error!(%error, "response serialization failed");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn empty_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("failed to construct response")
}

fn text_response(body: &'static str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(body))
        .expect("failed to construct response")
}

/// Extract an integer query parameter; malformed values are treated as
/// absent.
fn int_param(query: Option<&str>, name: &str) -> Option<i64> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| value.parse().ok())
}
