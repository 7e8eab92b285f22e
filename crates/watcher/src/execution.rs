use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::join_all;
use futures::FutureExt;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::{Event, Pod as KubePod};
use tracing::{debug, info};

use vigil_core::schema::RESOURCE_ID_LABEL;
use vigil_core::{CauseToken, ExecutionStateOptions, Latch, WatchError, WatcherConfig};
use vigil_kubehub::{ListOptions, Listener, ResourceWatcher, WatchedKind};
use vigil_state::ExecutionState;
use vigil_store::{List, Update, UpdateRx, Value};

use crate::reconcile::{Reconciler, Stores};
use crate::ExecutionClients;

/// Handle to one execution's reconciliation. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionWatcher {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) committed: ArcSwap<ExecutionState>,
    pub(crate) commits: Update,
    pub(crate) initial_commit: Latch<()>,
    pub(crate) finished: Latch<()>,
    pub(crate) token: CauseToken,
    pub(crate) job: ResourceWatcher<KubeJob>,
    pub(crate) pod: ResourceWatcher<KubePod>,
    pub(crate) job_events: ResourceWatcher<Event>,
    pub(crate) pod_events: ResourceWatcher<Event>,
    /// Set once the pod name is known; starts the pod events watcher.
    pub(crate) pod_selector: Latch<ListOptions>,
}

fn into_value<K: Send + Sync + 'static>(store: &Arc<Value<K>>) -> Listener<K> {
    let store = Arc::clone(store);
    Arc::new(move |obj: K| store.put(obj))
}

fn into_list(store: &Arc<List<Event>>) -> Listener<Event> {
    let store = Arc::clone(store);
    Arc::new(move |ev: Event| {
        store.put(ev);
    })
}

impl ExecutionWatcher {
    /// Start watching the execution identified by `options.resource_id`.
    pub fn start(
        parent: &CauseToken,
        clients: ExecutionClients,
        options: ExecutionStateOptions,
        config: WatcherConfig,
    ) -> Self {
        let token = parent.child();
        let id = options.resource_id.clone();

        let update = Arc::new(Update::new());
        let stores = Stores {
            job: Arc::new(Value::new(update.clone())),
            pod: Arc::new(Value::new(update.clone())),
            job_events: Arc::new(List::new(update.clone(), Event::delivery_key)),
            pod_events: Arc::new(List::new(update.clone(), Event::delivery_key)),
        };
        // subscribed before any watcher can deliver
        let update_rx = update.subscribe();

        let pod_selector = Latch::new();
        let job = ResourceWatcher::spawn(
            &token,
            clients.jobs,
            ListOptions::fields(format!("metadata.name={id}")),
            into_value(&stores.job),
            config,
        );
        let job_events = ResourceWatcher::spawn(
            &token,
            clients.events.clone(),
            ListOptions::fields(format!("involvedObject.name={id},involvedObject.kind=Job")),
            into_list(&stores.job_events),
            config,
        );
        let pod = ResourceWatcher::spawn(
            &token,
            clients.pods,
            ListOptions::labels(format!("{RESOURCE_ID_LABEL}={id}")),
            into_value(&stores.pod),
            config,
        );
        let pod_events =
            ResourceWatcher::deferred(&token, clients.events, pod_selector.handle(), into_list(&stores.pod_events), config);

        let initial = ExecutionState::with_options(options);
        let shared = Arc::new(Shared {
            committed: ArcSwap::from_pointee(initial.clone()),
            commits: Update::new(),
            initial_commit: Latch::new(),
            finished: Latch::new(),
            token,
            job,
            pod,
            job_events,
            pod_events,
            pod_selector,
        });

        info!(resource_id = %id, "execution watcher started");
        spawn_relay(Arc::clone(&shared), update);
        let reconciler = Reconciler::new(Arc::clone(&shared), stores, initial, update_rx, config);
        tokio::spawn(reconciler.run());

        Self { shared }
    }

    /// Last committed snapshot.
    pub fn state(&self) -> Arc<ExecutionState> {
        self.shared.committed.load_full()
    }

    /// Resolves after the first commit, or once the watcher shut down without one.
    pub fn started(&self) -> impl Future<Output = ()> + Send + 'static {
        let commit = self.shared.initial_commit.handle();
        let done = self.shared.token.done();
        async move {
            tokio::select! {
                _ = commit.wait() => {}
                _ = done => {}
            }
        }
    }

    /// Commit notifications from now on; `next()` turns `false` once the loop stopped.
    pub fn updated(&self) -> UpdateRx {
        self.shared.commits.subscribe()
    }

    /// Resolves on the next commit, or with `false` when none will come.
    pub fn next(&self) -> impl Future<Output = bool> + Send + 'static {
        let mut rx = self.updated();
        async move { rx.next().await }
    }

    /// Re-read the pod to make sure nothing was missed.
    pub async fn refresh_pod(&self) -> Result<usize, WatchError> {
        self.shared.pod.update().await
    }

    pub async fn refresh_job(&self) -> Result<usize, WatchError> {
        self.shared.job.update().await
    }

    pub fn job_err(&self) -> Option<WatchError> {
        self.shared.job.err()
    }

    pub fn pod_err(&self) -> Option<WatchError> {
        self.shared.pod.err()
    }

    pub fn job_events_err(&self) -> Option<WatchError> {
        self.shared.job_events.err()
    }

    pub fn pod_events_err(&self) -> Option<WatchError> {
        self.shared.pod_events.err()
    }

    /// Why the watcher stopped: `Done` after completion, `None` while running.
    pub fn err(&self) -> Option<WatchError> {
        self.shared.token.cause()
    }

    /// Resolves once the reconciliation loop has stopped.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let finished = self.shared.finished.handle();
        async move {
            finished.wait().await;
        }
    }

    pub fn cancel(&self) {
        self.shared.token.cancel(WatchError::Cancelled);
    }
}

/// Wakes the loop whenever a watcher ends and closes the update stream once
/// every watcher that can still deliver has ended.
fn spawn_relay(shared: Arc<Shared>, update: Arc<Update>) {
    tokio::spawn(async move {
        let ends = [
            (KubeJob::KIND, shared.job.done().boxed()),
            (KubePod::KIND, shared.pod.done().boxed()),
            ("job events", shared.job_events.done().boxed()),
        ]
        .map(|(watcher, done)| {
            let update = Arc::clone(&update);
            async move {
                done.await;
                debug!(watcher, "resource watcher ended");
                update.emit();
            }
        });
        join_all(ends).await;
        // a pod events watcher that never got its selector has nothing to deliver
        if shared.pod_selector.is_set() {
            shared.pod_events.done().await;
            debug!(watcher = "pod events", "resource watcher ended");
        }
        update.close();
    });
}
