//! Per-kind TTL enforcement
//!
//! One controller runs per managed kind. Its workers drain the kind's work
//! queue; each key is reconciled against the informer cache: objects whose
//! TTL has elapsed are deleted, objects whose TTL lies in the future are
//! re-queued for exactly the remaining time, and everything else is left
//! alone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, DynamicObject};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::discovery::ResourceKind;
use crate::informer::CachedObject;
use crate::queue::WorkQueue;
use crate::ttl::{self, TtlParseError};
use crate::Error;

/// Deletes a single object of one kind.
///
/// The seam between reconciliation logic and the API server, mockable in
/// tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceDeleter: Send + Sync {
    /// Delete the named object. An object that is already gone is success.
    async fn delete(&self, namespace: Option<String>, name: String) -> crate::Result<()>;
}

/// Deleter backed by a dynamic API client bound to one kind
pub struct ApiDeleter {
    client: Client,
    kind: ResourceKind,
}

impl ApiDeleter {
    /// Create a deleter for one kind
    pub fn new(client: Client, kind: ResourceKind) -> Self {
        Self { client, kind }
    }
}

#[async_trait]
impl ResourceDeleter for ApiDeleter {
    async fn delete(&self, namespace: Option<String>, name: String) -> crate::Result<()> {
        let api_resource = self.kind.api_resource();
        let api: Api<DynamicObject> = match namespace.as_deref() {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &api_resource),
            None => Api::all_with(self.client.clone(), &api_resource),
        };
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Deleted out from under us; the goal state holds.
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// What reconciliation should do with one object
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Not TTL-managed
    NoTtl,
    /// TTL label present but unparseable; quarantined until the label changes
    Malformed(TtlParseError),
    /// Deadline reached
    Expired,
    /// Deadline in the future by this much
    ExpiresIn(std::time::Duration),
}

/// Judge one object's metadata against the clock (pure function)
fn evaluate(meta: &ObjectMeta, ttl_label: &str, now: DateTime<Utc>) -> Disposition {
    let Some(value) = meta.labels.as_ref().and_then(|labels| labels.get(ttl_label)) else {
        return Disposition::NoTtl;
    };
    let created = meta
        .creation_timestamp
        .as_ref()
        .map(|time| time.0)
        .unwrap_or(DateTime::UNIX_EPOCH);
    match ttl::deadline(value, created) {
        Err(err) => Disposition::Malformed(err),
        Ok(deadline) if now >= deadline => Disposition::Expired,
        Ok(deadline) => {
            Disposition::ExpiresIn((deadline - now).to_std().unwrap_or_default())
        }
    }
}

/// Split a work key into namespace and name (pure function)
fn split_key(key: &str) -> crate::Result<(Option<&str>, &str)> {
    match key.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((Some(namespace), name))
        }
        None if !key.is_empty() => Ok((None, key)),
        _ => Err(Error::MalformedKey(key.to_string())),
    }
}

/// Shared state of one kind's reconcile workers
struct Reconciler {
    kind: ResourceKind,
    store: Store<CachedObject>,
    queue: Arc<WorkQueue>,
    deleter: Box<dyn ResourceDeleter>,
    ttl_label: String,
}

impl Reconciler {
    /// Bring one key to its goal state.
    ///
    /// Success means the key needs no retry; expiry in the future counts as
    /// success because the delayed requeue carries the follow-up. Errors
    /// are transient unless [`Error::is_permanent`] says otherwise.
    async fn reconcile(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = split_key(key)?;

        let mut object_ref: ObjectRef<CachedObject> =
            ObjectRef::new_with(name, self.kind.api_resource());
        if let Some(namespace) = namespace {
            object_ref = object_ref.within(namespace);
        }
        let Some(object) = self.store.get(&object_ref) else {
            // Deleted upstream; nothing left to do.
            return Ok(());
        };

        match evaluate(&object.metadata, &self.ttl_label, Utc::now()) {
            Disposition::NoTtl => Ok(()),
            Disposition::Malformed(err) => {
                warn!(resource = %self.kind, key, error = %err, "ignoring object with unparseable ttl label");
                Ok(())
            }
            Disposition::Expired => {
                self.deleter
                    .delete(namespace.map(str::to_string), name.to_string())
                    .await?;
                info!(resource = %self.kind, key, "deleted expired object");
                Ok(())
            }
            Disposition::ExpiresIn(remaining) => {
                debug!(resource = %self.kind, key, ?remaining, "ttl not yet expired, requeueing");
                self.queue.add_after(key, remaining);
                Ok(())
            }
        }
    }
}

/// Worker loop: drain the queue until shutdown, consuming reconcile errors
async fn worker(reconciler: Arc<Reconciler>) {
    let queue = &reconciler.queue;
    while let Some(key) = queue.next().await {
        match reconciler.reconcile(&key).await {
            Ok(()) => {
                queue.forget(&key);
                queue.done(&key);
            }
            Err(err) if err.is_permanent() => {
                warn!(resource = %reconciler.kind, key, error = %err, "dropping unreconcilable key");
                queue.forget(&key);
                queue.done(&key);
            }
            Err(err) => {
                warn!(resource = %reconciler.kind, key, error = %err, "reconcile failed, requeueing with backoff");
                queue.add_rate_limited(&key);
                queue.done(&key);
            }
        }
    }
}

/// Reconcile workers for one kind
pub struct KindController {
    queue: Arc<WorkQueue>,
    workers: JoinSet<()>,
}

impl KindController {
    /// Spawn `workers` reconcile workers over a synced cache.
    ///
    /// The informer cache behind `store` must have completed its initial
    /// sync; the manager guarantees this before calling.
    pub fn start(
        kind: ResourceKind,
        store: Store<CachedObject>,
        queue: Arc<WorkQueue>,
        deleter: Box<dyn ResourceDeleter>,
        ttl_label: String,
        workers: usize,
    ) -> Self {
        let reconciler = Arc::new(Reconciler {
            kind,
            store,
            queue: queue.clone(),
            deleter,
            ttl_label,
        });
        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            tasks.spawn(worker(reconciler.clone()));
        }
        Self {
            queue,
            workers: tasks,
        }
    }

    /// Shut the queue down and wait for every worker to exit
    pub async fn stop(mut self) {
        self.queue.shut_down();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "worker task failed during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::PartialObjectMetaExt;
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::TTL_LABEL;

    fn configmaps() -> ResourceKind {
        ResourceKind {
            group: String::new(),
            version: "v1".into(),
            resource: "configmaps".into(),
            kind: "ConfigMap".into(),
            namespaced: true,
        }
    }

    fn meta(name: &str, ttl: Option<&str>, created: DateTime<Utc>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: ttl.map(|value| {
                BTreeMap::from([(TTL_LABEL.to_string(), value.to_string())])
            }),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        }
    }

    /// A reconciler over a hand-filled cache and a mock deleter
    fn reconciler(objects: Vec<ObjectMeta>, deleter: MockResourceDeleter) -> Arc<Reconciler> {
        let kind = configmaps();
        let mut writer: Writer<CachedObject> = Writer::new(kind.api_resource());
        for meta in objects {
            let object = meta.into_response_partial::<DynamicObject>();
            writer.apply_watcher_event(&watcher::Event::Apply(object));
        }
        Arc::new(Reconciler {
            kind,
            store: writer.as_reader(),
            queue: Arc::new(WorkQueue::new()),
            deleter: Box::new(deleter),
            ttl_label: TTL_LABEL.to_string(),
        })
    }

    fn long_ago() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
    }

    // =========================================================================
    // evaluate
    // =========================================================================

    #[test]
    fn unlabeled_objects_are_not_managed() {
        let now = Utc::now();
        assert_eq!(
            evaluate(&meta("cm", None, long_ago()), TTL_LABEL, now),
            Disposition::NoTtl
        );
    }

    #[test]
    fn other_labels_do_not_count() {
        let now = Utc::now();
        let mut object = meta("cm", None, long_ago());
        object.labels = Some(BTreeMap::from([("ttl".to_string(), "5m".to_string())]));
        assert_eq!(evaluate(&object, TTL_LABEL, now), Disposition::NoTtl);
    }

    #[test]
    fn elapsed_duration_expires() {
        let now = long_ago() + chrono::Duration::minutes(10);
        assert_eq!(
            evaluate(&meta("cm", Some("5m"), long_ago()), TTL_LABEL, now),
            Disposition::Expired
        );
    }

    #[test]
    fn deadline_equal_to_now_expires() {
        let now = long_ago() + chrono::Duration::minutes(5);
        assert_eq!(
            evaluate(&meta("cm", Some("5m"), long_ago()), TTL_LABEL, now),
            Disposition::Expired
        );
    }

    #[test]
    fn zero_duration_expires_immediately() {
        assert_eq!(
            evaluate(&meta("cm", Some("0s"), long_ago()), TTL_LABEL, long_ago()),
            Disposition::Expired
        );
    }

    #[test]
    fn pending_duration_reports_the_remaining_time() {
        let now = long_ago() + chrono::Duration::minutes(2);
        assert_eq!(
            evaluate(&meta("cm", Some("5m"), long_ago()), TTL_LABEL, now),
            Disposition::ExpiresIn(Duration::from_secs(180))
        );
    }

    #[test]
    fn past_instant_expires() {
        assert_eq!(
            evaluate(
                &meta("cm", Some("2000-01-01T000000Z"), long_ago()),
                TTL_LABEL,
                Utc::now()
            ),
            Disposition::Expired
        );
    }

    #[test]
    fn unparseable_value_is_malformed() {
        assert_eq!(
            evaluate(&meta("cm", Some("banana"), long_ago()), TTL_LABEL, Utc::now()),
            Disposition::Malformed(TtlParseError::Unrecognized)
        );
    }

    // =========================================================================
    // split_key
    // =========================================================================

    #[test]
    fn keys_split_into_namespace_and_name() {
        assert_eq!(split_key("default/cache").unwrap(), (Some("default"), "cache"));
        assert_eq!(split_key("node-1").unwrap(), (None, "node-1"));
    }

    #[test]
    fn degenerate_keys_are_malformed() {
        for key in ["", "/", "default/", "/cache", "a/b/c"] {
            assert!(
                matches!(split_key(key), Err(Error::MalformedKey(_))),
                "key {key:?} should be malformed"
            );
        }
    }

    // =========================================================================
    // reconcile
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn expired_objects_are_deleted() {
        let mut deleter = MockResourceDeleter::new();
        deleter
            .expect_delete()
            .withf(|namespace, name| {
                namespace.as_deref() == Some("default") && name.as_str() == "cache"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let reconciler = reconciler(vec![meta("cache", Some("5m"), long_ago())], deleter);
        reconciler.reconcile("default/cache").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unlabeled_objects_are_never_deleted() {
        let deleter = MockResourceDeleter::new();
        let reconciler = reconciler(vec![meta("cache", None, long_ago())], deleter);
        reconciler.reconcile("default/cache").await.unwrap();
        assert!(reconciler.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_ttl_is_dropped_without_requeue() {
        let deleter = MockResourceDeleter::new();
        let reconciler = reconciler(vec![meta("cache", Some("banana"), long_ago())], deleter);
        reconciler.reconcile("default/cache").await.unwrap();
        assert!(reconciler.queue.is_empty());
        assert!(
            timeout(Duration::from_millis(1), reconciler.queue.next())
                .await
                .is_err(),
            "a malformed ttl must not be requeued"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_objects_are_success() {
        let deleter = MockResourceDeleter::new();
        let reconciler = reconciler(vec![], deleter);
        reconciler.reconcile("default/ghost").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_ttl_requeues_for_the_remaining_time() {
        let deleter = MockResourceDeleter::new();
        let reconciler = reconciler(
            vec![meta("cache", Some("1h"), Utc::now())],
            deleter,
        );
        reconciler.reconcile("default/cache").await.unwrap();

        // Not deliverable now...
        assert!(timeout(Duration::from_millis(1), reconciler.queue.next())
            .await
            .is_err());
        // ...but delivered once the remaining TTL has passed (paused time
        // auto-advances to the queue's deadline).
        let key = reconciler.queue.next().await;
        assert_eq!(key.as_deref(), Some("default/cache"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_keys_fail_permanently() {
        let deleter = MockResourceDeleter::new();
        let reconciler = reconciler(vec![], deleter);
        let err = reconciler.reconcile("a/b/c").await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_failures_propagate_as_transient() {
        let mut deleter = MockResourceDeleter::new();
        deleter
            .expect_delete()
            .times(1)
            .returning(|_, _| Err(Error::discovery("api server unavailable")));

        let reconciler = reconciler(vec![meta("cache", Some("5m"), long_ago())], deleter);
        let err = reconciler.reconcile("default/cache").await.unwrap_err();
        assert!(!err.is_permanent());
    }

    // =========================================================================
    // worker lifecycle
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn workers_drain_keys_and_release_in_flight_accounting() {
        let mut deleter = MockResourceDeleter::new();
        deleter.expect_delete().returning(|_, _| Ok(()));

        let kind = configmaps();
        let mut writer: Writer<CachedObject> = Writer::new(kind.api_resource());
        writer.apply_watcher_event(&watcher::Event::Apply(
            meta("cache", Some("5m"), long_ago()).into_response_partial::<DynamicObject>(),
        ));

        let queue = Arc::new(WorkQueue::new());
        queue.add("default/cache");
        let controller = KindController::start(
            kind,
            writer.as_reader(),
            queue.clone(),
            Box::new(deleter),
            TTL_LABEL.to_string(),
            crate::DEFAULT_WORKERS,
        );

        // Let the workers pick the key up and finish it.
        while !queue.is_empty() || queue.in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        controller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_terminates_idle_workers() {
        let deleter = MockResourceDeleter::new();
        let kind = configmaps();
        let writer: Writer<CachedObject> = Writer::new(kind.api_resource());
        let queue = Arc::new(WorkQueue::new());
        let controller = KindController::start(
            kind,
            writer.as_reader(),
            queue,
            Box::new(deleter),
            TTL_LABEL.to_string(),
            crate::DEFAULT_WORKERS,
        );
        // Workers are blocked on an empty queue; stop must still return.
        controller.stop().await;
    }
}
