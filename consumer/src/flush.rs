//! The timer-driven drain of the live window into the sample store.

use std::sync::Arc;
use std::time::Duration;

use observability_deps::tracing::{debug, error};
use ring_window::RingWindow;
use sample_store::SampleStore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Drain `ring` into `store` every `period` until `shutdown` fires, then
/// drain once more best-effort.
///
/// A failed batch is logged and discarded; the samples are monitoring data
/// and the next window supersedes them.
pub(crate) async fn periodic_flush(
    ring: Arc<RingWindow>,
    store: Arc<SampleStore>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The interval's first tick completes immediately; consume it so the
    // first real flush happens one full period in.
    ticks.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                flush_once(&ring, &store).await;
                debug!("flush worker stopped");
                return;
            }
            _ = ticks.tick() => flush_once(&ring, &store).await,
        }
    }
}

async fn flush_once(ring: &RingWindow, store: &SampleStore) {
    let samples = ring.flush();
    if samples.is_empty() {
        return;
    }
    match store.batch_insert(&samples).await {
        Ok(rows) => debug!(rows, dropped_total = ring.dropped(), "flushed live window"),
        Err(error) => {
            error!(%error, discarded = samples.len(), "sample batch insert failed");
        }
    }
}
