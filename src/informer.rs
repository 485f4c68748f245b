//! Per-kind metadata informer
//!
//! Each managed kind gets one informer: a metadata-only watch over all
//! namespaces, filtered to objects carrying the TTL label, reflected into
//! a shared cache. Watch events push work keys into the kind's queue; a
//! resync ticker re-enqueues every cached key so a missed event is repaired
//! within one resync interval.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::PartialObjectMeta;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{metadata_watcher, watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discovery::ResourceKind;
use crate::queue::WorkQueue;
use crate::{Error, DEFAULT_CACHE_SYNC_TIMEOUT};

/// Cached metadata entry for one watched object
pub type CachedObject = PartialObjectMeta<DynamicObject>;

/// A running metadata informer for one kind.
///
/// Owns the watch task and the cache it fills. Dropping the informer does
/// not stop the task; call [`Informer::stop`].
pub struct Informer {
    store: Store<CachedObject>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Informer {
    /// Start the informer and wait for its cache to complete the initial
    /// sync.
    ///
    /// Watch events and resync ticks enqueue object keys into `queue`. The
    /// call fails if the cache does not sync before the timeout or before
    /// `cancel` fires; no task is left behind in that case.
    pub async fn start(
        client: Client,
        kind: &ResourceKind,
        queue: Arc<WorkQueue>,
        ttl_label: &str,
        resync: Duration,
        cancel: CancellationToken,
    ) -> crate::Result<Informer> {
        let api_resource = kind.api_resource();
        let api: Api<DynamicObject> = Api::all_with(client, &api_resource);
        let config = watcher::Config::default().labels(ttl_label);

        let writer = Writer::new(api_resource);
        let store = writer.as_reader();
        let events = metadata_watcher(api, config).default_backoff();
        let task = tokio::spawn(pump(
            reflector::reflector(writer, events),
            kind.clone(),
            store.clone(),
            queue,
            resync,
            cancel.clone(),
        ));

        let synced = tokio::select! {
            synced = tokio::time::timeout(DEFAULT_CACHE_SYNC_TIMEOUT, store.wait_until_ready()) => {
                matches!(synced, Ok(Ok(())))
            }
            _ = cancel.cancelled() => false,
        };
        if !synced {
            cancel.cancel();
            let _ = task.await;
            return Err(Error::cache_sync(kind));
        }

        Ok(Informer {
            store,
            cancel,
            task,
        })
    }

    /// The synced cache backing this informer
    pub fn store(&self) -> Store<CachedObject> {
        self.store.clone()
    }

    /// Cancel the watch task and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Drive the watch stream until cancelled, translating events and resync
/// ticks into queue entries
async fn pump(
    events: impl futures::Stream<Item = Result<watcher::Event<CachedObject>, watcher::Error>>,
    kind: ResourceKind,
    store: Store<CachedObject>,
    queue: Arc<WorkQueue>,
    resync: Duration,
    cancel: CancellationToken,
) {
    tokio::pin!(events);
    let mut resync_ticks =
        tokio::time::interval_at(tokio::time::Instant::now() + resync, resync);
    resync_ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(resource = %kind, "informer stopping");
                return;
            }
            _ = resync_ticks.tick() => {
                let cached = store.state();
                debug!(resource = %kind, objects = cached.len(), "resync, re-enqueueing cached keys");
                for object in cached {
                    if let Some(key) = object_key(&object.metadata) {
                        queue.add(&key);
                    }
                }
            }
            event = events.next() => match event {
                Some(Ok(event)) => handle_event(event, &queue),
                Some(Err(err)) => {
                    // The watcher restarts itself with backoff; the error is
                    // informational here.
                    warn!(resource = %kind, error = %err, "watch interrupted");
                }
                None => {
                    warn!(resource = %kind, "watch stream ended");
                    return;
                }
            }
        }
    }
}

/// Enqueue the key of any event that names an object. Adds, updates, and
/// deletes all enqueue: reconcile re-reads the cache, so a stale event at
/// worst causes one redundant no-op pass.
fn handle_event(event: watcher::Event<CachedObject>, queue: &WorkQueue) {
    match event {
        watcher::Event::Apply(object)
        | watcher::Event::InitApply(object)
        | watcher::Event::Delete(object) => {
            if let Some(key) = object_key(&object.metadata) {
                queue.add(&key);
            }
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

/// Work key for an object: `namespace/name`, or `name` when cluster-scoped
/// (pure function)
pub(crate) fn object_key(meta: &ObjectMeta) -> Option<String> {
    let name = meta.name.as_deref()?;
    Some(match meta.namespace.as_deref() {
        Some(namespace) => format!("{namespace}/{name}"),
        None => name.to_string(),
    })
}
