//! Consumer initialisation.
//!
//! This module defines the public wiring boundary of the consumer crate: the
//! caller supplies the opened stores, a Kubernetes client and a shutdown
//! token, and receives a guard holding the running background tasks plus the
//! HTTP delegate to bind.

use std::sync::Arc;
use std::time::Duration;

use identity_catalog::IdentityCatalog;
use kube::Client;
use ring_window::RingWindow;
use sample_store::SampleStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::ResolverCache;
use crate::flush::periodic_flush;
use crate::server::HttpDelegate;
use crate::sync::{watch_all, ResourceSyncer};

/// A RAII guard over the consumer's background tasks.
///
/// Dropping the guard aborts any task that has not yet observed shutdown;
/// [`join`](Self::join) instead waits for them, which lets the flush worker
/// drain the live window one final time.
#[must_use = "consumer stops when guard is dropped"]
#[derive(Debug)]
pub struct ConsumerGuard {
    http: Arc<HttpDelegate>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerGuard {
    /// Obtain a handle to the HTTP delegate serving ingest and queries.
    pub fn http(&self) -> Arc<HttpDelegate> {
        Arc::clone(&self.http)
    }

    /// Wait for all background tasks to observe shutdown and finish.
    pub async fn join(mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Start a consumer: one watch task per mirrored object kind plus the flush
/// worker, all observing `shutdown`.
///
/// Must be called from within a tokio runtime. The returned guard's
/// [`HttpDelegate`] is ready immediately; identity fills in as the watches
/// deliver their initial lists.
pub fn new(
    catalog: Arc<IdentityCatalog>,
    samples: Arc<SampleStore>,
    ring: Arc<RingWindow>,
    client: Client,
    flush_interval: Duration,
    resync_interval: Duration,
    shutdown: CancellationToken,
) -> ConsumerGuard {
    let cache = Arc::new(ResolverCache::new());
    let syncer = Arc::new(ResourceSyncer::new(
        Arc::clone(&catalog),
        Arc::clone(&cache),
    ));

    let mut tasks = watch_all(client, syncer, resync_interval, shutdown.clone());
    tasks.push(tokio::spawn(periodic_flush(
        Arc::clone(&ring),
        samples,
        flush_interval,
        shutdown,
    )));

    let http = Arc::new(HttpDelegate::new(cache, ring, catalog));

    ConsumerGuard { http, tasks }
}
