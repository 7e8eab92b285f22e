//! The reconciliation loop: drain the stores into an uncommitted state, wait
//! briefly for corroborating data when the state is missing something it
//! needs, escalate to an active refresh at most once, then commit.

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::{Event, Pod as KubePod};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vigil_core::{WatchError, WatcherConfig};
use vigil_kubehub::ListOptions;
use vigil_state::{ExecutionState, Job, Pod};
use vigil_store::{List, UpdateRx, Value};

use crate::execution::Shared;

pub(crate) struct Stores {
    pub(crate) job: Arc<Value<KubeJob>>,
    pub(crate) pod: Arc<Value<KubePod>>,
    pub(crate) job_events: Arc<List<Event>>,
    pub(crate) pod_events: Arc<List<Event>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Gaps {
    job: bool,
    pod: bool,
}

impl Gaps {
    fn of(state: &ExecutionState) -> Self {
        Self { job: state.job_critically_missing(), pod: state.pod_critically_missing() }
    }

    fn any(self) -> bool {
        self.job || self.pod
    }
}

pub(crate) struct Reconciler {
    shared: Arc<Shared>,
    stores: Stores,
    state: ExecutionState,
    config: WatcherConfig,
    updates: UpdateRx,
    job_rx: watch::Receiver<u64>,
    pod_rx: watch::Receiver<u64>,
}

impl Reconciler {
    pub(crate) fn new(
        shared: Arc<Shared>,
        stores: Stores,
        state: ExecutionState,
        updates: UpdateRx,
        config: WatcherConfig,
    ) -> Self {
        let job_rx = stores.job.subscribe();
        let pod_rx = stores.pod.subscribe();
        Self { shared, stores, state, config, updates, job_rx, pod_rx }
    }

    pub(crate) async fn run(mut self) {
        let cause = match self.reconcile().await {
            Ok(()) => WatchError::Done,
            Err(e) => e,
        };
        let id = self.state.resource_id();
        if cause.is_done() {
            info!(resource_id = %id, "execution watcher finished");
        } else {
            info!(resource_id = %id, cause = %cause, "execution watcher stopped");
        }
        self.shared.token.cancel(cause);
        self.shared.commits.close();
        self.shared.finished.set(());
    }

    fn stop_error(&self) -> WatchError {
        self.shared.token.cause().unwrap_or(WatchError::Cancelled)
    }

    async fn reconcile(&mut self) -> Result<(), WatchError> {
        let base = futures::future::join3(
            self.shared.job.started(),
            self.shared.job_events.started(),
            self.shared.pod.started(),
        );
        tokio::select! {
            _ = base => {}
            _ = self.shared.token.cancelled() => return Err(self.stop_error()),
        }
        self.abort_if_fatal()?;
        self.pass().await;

        if self.shared.pod_selector.is_set() {
            tokio::select! {
                _ = self.shared.pod_events.started() => {}
                _ = self.shared.token.cancelled() => return Err(self.stop_error()),
            }
            self.pass().await;
        }
        self.abort_if_fatal()?;
        self.commit();
        if self.state.completed() {
            return Ok(());
        }

        loop {
            let more = tokio::select! {
                more = self.updates.next() => Some(more),
                _ = self.shared.token.cancelled() => None,
            };
            match more {
                None => return Err(self.stop_error()),
                Some(false) => break,
                Some(true) => {}
            }
            self.pass().await;
            self.commit();
            if self.state.completed() {
                return Ok(());
            }
        }

        debug!("all resource watchers ended; final pass");
        self.pass().await;
        self.commit();
        Ok(())
    }

    /// Before anything was published, an ambiguous job or pod leaves nothing trustworthy to commit.
    fn abort_if_fatal(&self) -> Result<(), WatchError> {
        for err in [self.shared.job.err(), self.shared.pod.err()].into_iter().flatten() {
            if err.is_fatal() {
                warn!(error = %err, "aborting execution watcher");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Debounce, then fold everything the stores collected into the uncommitted state.
    async fn read_latest(&mut self) {
        tokio::time::sleep(self.config.buffering).await;
        let _ = self.job_rx.borrow_and_update();
        let _ = self.pod_rx.borrow_and_update();

        if let Some(job) = self.stores.job.drain() {
            self.state.set_job(Job::from(job));
        }
        if let Some(pod) = self.stores.pod.drain() {
            self.state.set_pod(Pod::from(pod));
        }
        let job_events = self.stores.job_events.drain();
        if !job_events.is_empty() {
            self.state.add_job_events(job_events.into_iter().map(Arc::new));
        }
        let pod_events = self.stores.pod_events.drain();
        if !pod_events.is_empty() {
            self.state.add_pod_events(pod_events.into_iter().map(Arc::new));
        }

        self.initialize_pod_events();
    }

    fn initialize_pod_events(&self) {
        if self.shared.pod_selector.is_set() {
            return;
        }
        let name = self.state.pod_name();
        if name.is_empty() {
            return;
        }
        let opts = ListOptions::fields(format!("involvedObject.name={name},involvedObject.kind=Pod"));
        if self.shared.pod_selector.set(opts) {
            debug!(pod = name, "pod events watcher initialized");
        }
    }

    async fn pass(&mut self) {
        let begin = Instant::now();
        self.read_latest().await;

        let gaps = Gaps::of(&self.state);
        if gaps.any() {
            debug!(job = gaps.job, pod = gaps.pod, "critical data missing; waiting");
            self.wait_gracefully(gaps).await;
            self.forced_pass().await;
        }

        histogram!("reconcile_pass_ms", begin.elapsed().as_secs_f64() * 1000.0);
    }

    /// Wait for each implicated store to change, sharing one grace period.
    async fn wait_gracefully(&mut self, gaps: Gaps) {
        let timer = tokio::time::sleep(self.config.grace);
        tokio::pin!(timer);
        let mut expired = false;

        if gaps.job {
            tokio::select! {
                _ = self.job_rx.changed() => {}
                _ = &mut timer => expired = true,
                _ = self.shared.token.cancelled() => return,
            }
        }
        // new pod data already arrived: nothing to wait for
        if gaps.pod && !expired && !self.pod_rx.has_changed().unwrap_or(true) {
            tokio::select! {
                _ = self.pod_rx.changed() => {}
                _ = &mut timer => {}
                _ = self.shared.token.cancelled() => {}
            }
        }
    }

    /// Actively re-read the watchers still implicated after the grace period.
    async fn forced_pass(&mut self) {
        counter!("execution_escalations_total", 1u64);
        self.read_latest().await;
        let gaps = Gaps::of(&self.state);
        if !gaps.any() {
            return;
        }

        debug!(job = gaps.job, pod = gaps.pod, "critical data still missing; refreshing");
        let shared = &self.shared;
        let job = async {
            if gaps.job {
                if let Err(e) = shared.job.update().await {
                    debug!(error = %e, "job refresh failed");
                }
            }
        };
        let pod = async {
            if gaps.pod {
                if let Err(e) = shared.pod.update().await {
                    debug!(error = %e, "pod refresh failed");
                }
            }
        };
        tokio::join!(job, pod);
        self.read_latest().await;
    }

    fn commit(&mut self) {
        self.state.settle_completion();
        self.shared.committed.store(Arc::new(self.state.clone()));
        self.shared.initial_commit.set(());
        self.shared.commits.emit();
        counter!("execution_commits_total", 1u64);

        if self.state.completed() {
            info!(
                resource_id = %self.state.resource_id(),
                completed_at = ?self.state.completion_timestamp(),
                error = %self.state.execution_error(),
                "execution completed"
            );
        } else {
            debug!(
                job = self.state.job_exists(),
                pod = self.state.pod_exists(),
                total_events = self.stores.job_events.total() + self.stores.pod_events.total(),
                "state committed"
            );
        }
    }
}
