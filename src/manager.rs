//! Dynamic controller manager
//!
//! The manager is itself a control loop whose targets are control loops:
//! every minute it computes the set of kinds it should be running (the
//! discovered kinds the identity may manage) and converges the set it is
//! running onto that, starting controllers for new kinds and stopping
//! controllers for kinds that vanished or lost permissions. Kinds present
//! in both sets are left untouched, so steady state causes no churn.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AccessChecker;
use crate::controller::{ApiDeleter, KindController};
use crate::discovery::{self, ResourceKind};
use crate::informer::Informer;
use crate::queue::WorkQueue;
use crate::{
    DEFAULT_RECONCILE_INTERVAL, DEFAULT_RESYNC_INTERVAL, DEFAULT_WORKERS, TTL_LABEL,
};

/// Tunables for a [`Manager`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Label marking objects as TTL-managed
    pub ttl_label: String,
    /// Time between desired-vs-observed reconciliation passes
    pub reconcile_interval: Duration,
    /// Time between full re-enqueues of each kind's cache
    pub resync_interval: Duration,
    /// Reconcile workers per kind
    pub workers: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            ttl_label: TTL_LABEL.to_string(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// The informer-plus-controller pair backing one managed kind
struct RunningKind {
    informer: Informer,
    controller: KindController,
}

/// Owns and converges the set of per-kind controllers
pub struct Manager {
    client: Client,
    checker: AccessChecker,
    options: ManagerOptions,
    /// Live controllers, keyed by kind. Mutated only from the manager's
    /// own reconcile pass - single writer, by construction.
    controllers: HashMap<ResourceKind, RunningKind>,
}

impl Manager {
    /// Create a manager with canonical defaults
    pub fn new(client: Client) -> Self {
        Self::with_options(client, ManagerOptions::default())
    }

    /// Create a manager with explicit options
    pub fn with_options(client: Client, options: ManagerOptions) -> Self {
        Self {
            checker: AccessChecker::new(client.clone()),
            client,
            options,
            controllers: HashMap::new(),
        }
    }

    /// Run reconcile passes until `cancel` fires, then stop every
    /// controller and return once all their tasks have exited.
    pub async fn run(mut self, cancel: CancellationToken) -> crate::Result<()> {
        info!(
            ttl_label = %self.options.ttl_label,
            interval = ?self.options.reconcile_interval,
            "ttl manager started"
        );
        loop {
            if let Err(err) = self.reconcile(&cancel).await {
                // A failed pass leaves running controllers untouched; the
                // next tick retries.
                warn!(error = %err, "manager reconcile pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.reconcile_interval) => {}
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// One desired-vs-observed pass
    async fn reconcile(&mut self, cancel: &CancellationToken) -> crate::Result<()> {
        debug!("starting manager reconcile pass");
        let mut desired = HashSet::new();
        for kind in discovery::discover(&self.client).await? {
            if self.checker.may_manage(&kind).await {
                desired.insert(kind);
            }
        }
        let observed: HashSet<ResourceKind> = self.controllers.keys().cloned().collect();
        let (to_start, to_stop) = set_difference(&desired, &observed);
        debug!(
            desired = desired.len(),
            observed = observed.len(),
            starting = to_start.len(),
            stopping = to_stop.len(),
            "manager reconcile pass computed"
        );

        for kind in to_stop {
            self.stop(&kind).await;
        }
        for kind in to_start {
            if let Err(err) = self.start(kind.clone(), cancel).await {
                warn!(resource = %kind, error = %err, "failed to start controller, will retry next pass");
            }
        }
        Ok(())
    }

    /// Start the informer-plus-controller pair for a kind.
    ///
    /// Waits for the informer cache to sync before any worker starts; on
    /// sync failure nothing is recorded and the kind is retried on a later
    /// pass.
    async fn start(&mut self, kind: ResourceKind, cancel: &CancellationToken) -> crate::Result<()> {
        info!(resource = %kind, "starting controller");
        let queue = Arc::new(WorkQueue::new());
        let informer = Informer::start(
            self.client.clone(),
            &kind,
            queue.clone(),
            &self.options.ttl_label,
            self.options.resync_interval,
            cancel.child_token(),
        )
        .await?;
        let deleter = Box::new(ApiDeleter::new(self.client.clone(), kind.clone()));
        let controller = KindController::start(
            kind.clone(),
            informer.store(),
            queue,
            deleter,
            self.options.ttl_label.clone(),
            self.options.workers,
        );
        self.controllers.insert(
            kind,
            RunningKind {
                informer,
                controller,
            },
        );
        Ok(())
    }

    /// Stop a kind's informer and workers, waiting for both to exit.
    ///
    /// Idempotent: a kind that is not running is ignored. The map entry is
    /// dropped before anything is cancelled, so no task ever observes a
    /// half-stopped entry.
    async fn stop(&mut self, kind: &ResourceKind) {
        let Some(running) = self.controllers.remove(kind) else {
            return;
        };
        info!(resource = %kind, "stopping controller");
        running.informer.stop().await;
        running.controller.stop().await;
        info!(resource = %kind, "controller stopped");
    }

    /// Stop everything; returns only when every informer and worker has
    /// terminated
    async fn shutdown(&mut self) {
        let kinds: Vec<ResourceKind> = self.controllers.keys().cloned().collect();
        for kind in kinds {
            self.stop(&kind).await;
        }
        info!("ttl manager stopped");
    }
}

/// Kinds to start (desired but not observed) and stop (observed but no
/// longer desired), in that order (pure function)
fn set_difference(
    desired: &HashSet<ResourceKind>,
    observed: &HashSet<ResourceKind>,
) -> (Vec<ResourceKind>, Vec<ResourceKind>) {
    let to_start = desired.difference(observed).cloned().collect();
    let to_stop = observed.difference(desired).cloned().collect();
    (to_start, to_stop)
}
