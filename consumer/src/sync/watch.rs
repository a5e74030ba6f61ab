//! Watch-stream plumbing: one task per object kind, each feeding decoded
//! events into the [`ResourceSyncer`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use kube::api::ListParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use observability_deps::tracing::{debug, warn};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{ApplyEvent, ResourceSyncer};

/// Start one watch task per mirrored object kind.
///
/// The returned handles run until `shutdown` is cancelled.
pub(crate) fn watch_all(
    client: Client,
    syncer: Arc<ResourceSyncer>,
    resync: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_watch::<Pod>(&client, &syncer, resync, &shutdown),
        spawn_watch::<PersistentVolumeClaim>(&client, &syncer, resync, &shutdown),
        spawn_watch::<Node>(&client, &syncer, resync, &shutdown),
        spawn_watch::<Deployment>(&client, &syncer, resync, &shutdown),
        spawn_watch::<StatefulSet>(&client, &syncer, resync, &shutdown),
        spawn_watch::<DaemonSet>(&client, &syncer, resync, &shutdown),
        spawn_watch::<ReplicaSet>(&client, &syncer, resync, &shutdown),
    ]
}

fn spawn_watch<K>(
    client: &Client,
    syncer: &Arc<ResourceSyncer>,
    resync: Duration,
    shutdown: &CancellationToken,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
    ResourceSyncer: ApplyEvent<K>,
{
    let api = Api::<K>::all(client.clone());
    tokio::spawn(watch_kind(api, Arc::clone(syncer), resync, shutdown.clone()))
}

/// Consume one kind's watch stream until shutdown.
///
/// The watcher's initial list stands in for the first resync; afterwards a
/// periodic full re-list re-dispatches every object through the same upsert
/// path, bounding drift from missed events.
async fn watch_kind<K>(
    api: Api<K>,
    syncer: Arc<ResourceSyncer>,
    resync: Duration,
    shutdown: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
    ResourceSyncer: ApplyEvent<K>,
{
    let kind = K::kind(&K::DynamicType::default()).into_owned();

    let events = watcher(api.clone(), watcher::Config::default())
        .default_backoff()
        .applied_objects();
    futures::pin_mut!(events);

    let mut resync_ticks = interval_at(Instant::now() + resync, resync);
    resync_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(kind = %kind, "watch stopped");
                return;
            }
            event = events.next() => match event {
                Some(Ok(obj)) => syncer.apply_event(obj).await,
                Some(Err(error)) => warn!(%error, kind = %kind, "watch stream error"),
                None => {
                    warn!(kind = %kind, "watch stream ended");
                    return;
                }
            },
            _ = resync_ticks.tick() => match api.list(&ListParams::default()).await {
                Ok(list) => {
                    debug!(kind = %kind, objects = list.items.len(), "resync re-list");
                    for obj in list.items {
                        syncer.apply_event(obj).await;
                    }
                }
                Err(error) => warn!(%error, kind = %kind, "resync list failed"),
            },
        }
    }
}
