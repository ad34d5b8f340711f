//! Controller runner: one coalescing queue, N workers, watch-driven
//! enqueueing with periodic resync, and bounded-drain shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use virtrigaud_api::meta::Resource;

use crate::cluster::{Api, WatchEvent};
use crate::errors::ReconcileError;

use super::queue::WorkQueue;

/// Bounded wait for workers to finish their in-flight reconciles.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Namespace/name pair identifying a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (namespace, name) = key.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Next step after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Re-run after the given delay even without a watch event.
    RequeueAfter(Duration),
    /// Nothing pending; the next watch event re-triggers.
    AwaitChange,
}

impl Action {
    pub fn requeue_after(delay: Duration) -> Self {
        Action::RequeueAfter(delay)
    }

    pub fn await_change() -> Self {
        Action::AwaitChange
    }
}

/// A per-kind state machine driving observed state toward spec.
///
/// Contract: idempotent over the (spec, observed) pair, makes forward
/// progress or explicitly requeues, never blocks indefinitely, and records
/// `observedGeneration` only after a successful full sync.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Object: Resource;

    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &ResourceKey) -> Result<Action, ReconcileError>;
}

/// Runs one reconciler against one resource kind.
pub struct Controller<R: Resource> {
    api: Api<R>,
    workers: usize,
    resync: Option<Duration>,
}

impl<R: Resource> Controller<R> {
    pub fn new(api: Api<R>, workers: usize) -> Self {
        Self {
            api,
            workers: workers.max(1),
            resync: None,
        }
    }

    /// Periodically enqueue every object, independent of watch events.
    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync = Some(period);
        self
    }

    /// Run until the shutdown signal flips, then drain with a bounded wait.
    pub async fn run<K>(self, reconciler: Arc<K>, mut shutdown: watch::Receiver<bool>)
    where
        K: Reconciler<Object = R>,
    {
        let name = reconciler.name();
        let queue = WorkQueue::new();

        // Subscribe before seeding so nothing slips between the initial
        // list and the first watch delivery.
        let watch_rx = self.api.watch();
        for obj in self.api.list(None).await {
            queue.add(&obj.meta().key());
        }

        info!(controller = name, workers = self.workers, "Controller starting");

        let pump = spawn_watch_pump(name, self.api.clone(), watch_rx, queue.clone());
        let resync = self.resync.map(|period| {
            spawn_resync(name, self.api.clone(), queue.clone(), period)
        });

        let workers: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|worker| {
                let queue = queue.clone();
                let reconciler = reconciler.clone();
                let span = tracing::info_span!("worker", controller = name, worker);
                tokio::spawn(
                    async move { run_worker(reconciler, queue).await }.instrument(span),
                )
            })
            .collect();

        // Block until shutdown is requested (or the sender goes away).
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!(controller = name, "Controller shutting down");
        queue.shut_down();
        pump.abort();
        if let Some(handle) = resync {
            handle.abort();
        }

        let drain = futures::future::join_all(workers);
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(controller = name, "Workers did not drain within the grace period");
        }
    }
}

fn spawn_watch_pump<R: Resource>(
    name: &'static str,
    api: Api<R>,
    mut rx: broadcast::Receiver<WatchEvent<R>>,
    queue: WorkQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let key = event.object().meta().key();
                    queue.add(&key);
                    if let WatchEvent::Deleted(_) = event {
                        debug!(controller = name, key = %key, "Deletion observed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Missed events: fall back to a full re-list.
                    warn!(controller = name, missed, "Watch lagged, re-listing");
                    for obj in api.list(None).await {
                        queue.add(&obj.meta().key());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_resync<R: Resource>(
    name: &'static str,
    api: Api<R>,
    queue: WorkQueue,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it, the seed list covered it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let objects = api.list(None).await;
            debug!(controller = name, count = objects.len(), "Resync enqueue");
            for obj in objects {
                queue.add(&obj.meta().key());
            }
        }
    })
}

async fn run_worker<K: Reconciler>(reconciler: Arc<K>, queue: WorkQueue) {
    while let Some(key) = queue.get().await {
        let Some(parsed) = ResourceKey::parse(&key) else {
            warn!(key = %key, "Dropping malformed key");
            queue.done(&key);
            continue;
        };

        match reconciler.reconcile(&parsed).await {
            Ok(Action::AwaitChange) => {
                queue.forget(&key);
            }
            Ok(Action::RequeueAfter(delay)) => {
                queue.forget(&key);
                queue.add_after(&key, delay);
            }
            Err(e) if e.is_conflict() => {
                // Lost an optimistic-concurrency race; re-run from fresh
                // state without counting it as a failure.
                debug!(key = %key, "Write conflict, requeueing");
                queue.add(&key);
            }
            Err(e) if e.is_terminal() => {
                // Surfaced on the resource already; a spec change re-triggers.
                warn!(key = %key, error = %e, "Terminal reconcile error");
                queue.forget(&key);
            }
            Err(e) => {
                warn!(key = %key, retries = queue.retries(&key), error = %e, "Reconcile failed, backing off");
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use virtrigaud_api::meta::{ObjectMeta, ObjectRef};
    use virtrigaud_api::VirtualMachine;

    use crate::cluster::Cluster;

    struct CountingReconciler {
        count: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        type Object = VirtualMachine;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reconcile(&self, _key: &ResourceKey) -> Result<Action, ReconcileError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(Action::await_change())
        }
    }

    fn vm(name: &str) -> VirtualMachine {
        VirtualMachine {
            meta: ObjectMeta::new("default", name),
            spec: virtrigaud_api::VirtualMachineSpec {
                provider_ref: ObjectRef::new("prov"),
                class_ref: ObjectRef::new("small"),
                image_ref: Some(ObjectRef::new("img")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_controller_reconciles_watch_events_and_drains() {
        let cluster = Cluster::new();
        let api = cluster.api::<VirtualMachine>();
        let reconciler = Arc::new(CountingReconciler {
            count: AtomicUsize::new(0),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Controller::new(api.clone(), 2);
        let handle = tokio::spawn(controller.run(reconciler.clone(), shutdown_rx));

        // Created after startup: delivered via watch.
        api.create(vm("web-1")).await.unwrap();
        api.create(vm("web-2")).await.unwrap();

        // Give the workers a moment to drain the queue.
        for _ in 0..50 {
            if reconciler.count.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(reconciler.count.load(Ordering::SeqCst) >= 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("controller must stop after shutdown")
            .unwrap();
    }

    #[test]
    fn test_resource_key_parse() {
        let key = ResourceKey::parse("default/web-1").unwrap();
        assert_eq!(key.namespace, "default");
        assert_eq!(key.name, "web-1");
        assert_eq!(key.to_string(), "default/web-1");

        assert!(ResourceKey::parse("no-slash").is_none());
        assert!(ResourceKey::parse("/name").is_none());
    }
}
