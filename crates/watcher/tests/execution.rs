#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod};
use serde_json::{json, Value};
use vigil_core::{CauseToken, ExecutionStateOptions, WatchError, WatcherConfig};
use vigil_kubehub::testing::ScriptedClient;
use vigil_kubehub::{ClientError, ListOptions, ResourceClient, ResourceList, WatchStream};
use vigil_watcher::{ExecutionClients, ExecutionWatcher};

fn cfg() -> WatcherConfig {
    WatcherConfig { buffering: Duration::from_millis(1), grace: Duration::from_millis(50), ..WatcherConfig::default() }
}

fn opts(id: &str) -> ExecutionStateOptions {
    ExecutionStateOptions { resource_id: id.into(), ..Default::default() }
}

fn job(name: &str, status: Value) -> Job {
    serde_json::from_value(json!({
        "metadata": {"name": name, "uid": format!("uid-{name}"), "namespace": "tests", "creationTimestamp": "2024-01-01T00:00:00Z"},
        "status": status
    }))
    .unwrap()
}

fn pod(name: &str, id: &str, status: Value) -> Pod {
    serde_json::from_value(json!({
        "metadata": {"name": name, "uid": format!("uid-{name}"), "namespace": "tests", "labels": {"vigil.dev/resource-id": id}},
        "status": status
    }))
    .unwrap()
}

fn event(name: &str, kind: &str, involved: &str, reason: &str, message: &str, at: &str) -> Event {
    serde_json::from_value(json!({
        "metadata": {"name": name, "uid": format!("uid-{name}"), "namespace": "tests"},
        "involvedObject": {"name": involved, "kind": kind},
        "reason": reason,
        "message": message,
        "firstTimestamp": at,
        "lastTimestamp": at
    }))
    .unwrap()
}

struct Cluster {
    jobs: Arc<ScriptedClient<Job>>,
    pods: Arc<ScriptedClient<Pod>>,
    events: Arc<ScriptedClient<Event>>,
}

impl Cluster {
    fn new() -> Self {
        Self { jobs: Arc::new(ScriptedClient::new()), pods: Arc::new(ScriptedClient::new()), events: Arc::new(ScriptedClient::new()) }
    }

    fn clients(&self) -> ExecutionClients {
        ExecutionClients { jobs: self.jobs.clone(), pods: self.pods.clone(), events: self.events.clone() }
    }
}

async fn within<F: std::future::Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut).await.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_job_without_pod_commits_running_state() {
    let cluster = Cluster::new();
    cluster.jobs.apply(job("exec-1", json!({"active": 1})));
    let root = CauseToken::new();
    let w = ExecutionWatcher::start(&root, cluster.clients(), opts("exec-1"), cfg());

    within("first commit", w.started()).await;
    let s = w.state();
    assert!(s.job_exists());
    assert!(!s.pod_exists());
    assert!(!s.completed());
    assert_eq!(s.execution_error(), "");
    assert_eq!(s.namespace(), "tests");
    assert_eq!(w.err(), None);
    root.cancel(WatchError::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eviction_reported_after_grace_without_live_pod() {
    let cluster = Cluster::new();
    cluster.jobs.apply(job("exec-1", json!({"active": 1})));
    cluster.events.apply(event("e1", "Job", "exec-1", "SuccessfulCreate", "Created pod: exec-1-abcde", "2024-01-01T00:00:01Z"));
    cluster.events.apply(event("e2", "Pod", "exec-1-abcde", "Evicted", "node pressure", "2024-01-01T00:00:05Z"));
    let root = CauseToken::new();
    let w = ExecutionWatcher::start(&root, cluster.clients(), opts("exec-1"), cfg());

    within("loop end", w.done()).await;
    let s = w.state();
    assert!(!s.pod_exists());
    assert_eq!(s.pod_name(), "exec-1-abcde");
    assert_eq!(s.pod_execution_error(), "Evicted: node pressure");
    assert_eq!(s.execution_error(), "Evicted: node pressure");
    assert!(s.completed());
    assert_eq!(w.err(), Some(WatchError::Done));
    // the pod gap escalated to an active re-read
    assert!(cluster.pods.list_calls() >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_job_without_pod_commits_after_escalation() {
    let cluster = Cluster::new();
    cluster.jobs.apply(job("exec-1", json!({"succeeded": 1, "completionTime": "2024-01-01T00:01:00Z"})));
    let root = CauseToken::new();
    let w = ExecutionWatcher::start(&root, cluster.clients(), opts("exec-1"), cfg());

    within("loop end", w.done()).await;
    let s = w.state();
    assert!(s.completed());
    assert_eq!(s.completion_timestamp().map(|t| t.timestamp()), Some(1704067260));
    assert_eq!(s.execution_error(), "");
    assert!(cluster.pods.list_calls() >= 2);
}

/// Lists two jobs for any selector.
struct TwoJobs;

#[async_trait::async_trait]
impl ResourceClient<Job> for TwoJobs {
    async fn list(&self, _opts: &ListOptions) -> Result<ResourceList<Job>, ClientError> {
        let items = vec![job("exec-1", json!({"active": 1})), job("exec-1-copy", json!({"active": 1}))];
        Ok(ResourceList { resource_version: Some("3".into()), items })
    }

    async fn watch(&self, _opts: &ListOptions) -> Result<WatchStream<Job>, ClientError> {
        Ok(stream::pending().boxed())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ambiguous_job_never_commits() {
    let cluster = Cluster::new();
    let clients = ExecutionClients { jobs: Arc::new(TwoJobs), ..cluster.clients() };
    let root = CauseToken::new();
    let w = ExecutionWatcher::start(&root, clients, opts("exec-1"), cfg());

    within("started via shutdown", w.started()).await;
    within("loop end", w.done()).await;
    let s = w.state();
    assert!(!s.job_exists());
    assert!(!s.completed());
    assert_eq!(s.resource_id(), "exec-1");
    assert!(matches!(w.err(), Some(WatchError::Ambiguous { kind: "job", .. })));
    assert!(w.job_err().is_some_and(|e| e.is_fatal()));
    assert!(!w.next().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commits_follow_the_pod_until_completion() {
    let cluster = Cluster::new();
    cluster.jobs.apply(job("exec-1", json!({"active": 1})));
    let root = CauseToken::new();
    let w = ExecutionWatcher::start(&root, cluster.clients(), opts("exec-1"), cfg());
    within("first commit", w.started()).await;
    assert!(!w.state().pod_exists());

    let mut updates = w.updated();
    cluster.pods.apply(pod("exec-1-abcde", "exec-1", json!({"phase": "Running", "startTime": "2024-01-01T00:00:02Z"})));
    while !w.state().pod_exists() {
        assert!(within("pod commit", updates.next()).await);
    }
    assert_eq!(w.state().pod_start_timestamp().map(|t| t.timestamp()), Some(1704067202));
    assert!(!w.state().completed());

    cluster.pods.apply(pod(
        "exec-1-abcde",
        "exec-1",
        json!({"phase": "Succeeded", "conditions": [
            {"type": "Ready", "status": "False", "lastTransitionTime": "2024-01-01T00:00:30Z"}
        ]}),
    ));
    within("loop end", w.done()).await;
    let s = w.state();
    assert!(s.completed());
    assert_eq!(s.completion_timestamp().map(|t| t.timestamp()), Some(1704067230));
    assert_eq!(w.err(), Some(WatchError::Done));
    assert!(w.pod_err().is_some_and(|e| e.is_done()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parent_cancellation_stops_everything() {
    let cluster = Cluster::new();
    cluster.jobs.apply(job("exec-1", json!({"active": 1})));
    let root = CauseToken::new();
    let w = ExecutionWatcher::start(&root, cluster.clients(), opts("exec-1"), cfg());
    within("first commit", w.started()).await;

    root.cancel(WatchError::Transport("shutting down".into()));
    within("loop end", w.done()).await;
    assert_eq!(w.err(), Some(WatchError::Transport("shutting down".into())));
    assert!(w.job_err().is_some());
    // never initialized, the pod events watcher ends through its parent
    assert!(w.pod_events_err().is_some());
    assert!(w.refresh_job().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_does_not_redeliver_seen_objects() {
    let cluster = Cluster::new();
    cluster.jobs.apply(job("exec-1", json!({"active": 1})));
    let root = CauseToken::new();
    let w = ExecutionWatcher::start(&root, cluster.clients(), opts("exec-1"), cfg());
    within("first commit", w.started()).await;

    let mut updates = w.updated();
    cluster.pods.apply(pod("exec-1-abcde", "exec-1", json!({"phase": "Pending"})));
    while !w.state().pod_exists() {
        assert!(within("pod commit", updates.next()).await);
    }
    assert_eq!(within("pod refresh", w.refresh_pod()).await, Ok(0));
    assert_eq!(within("job refresh", w.refresh_job()).await, Ok(0));
    assert!(cluster.pods.list_calls() >= 2);

    w.cancel();
    within("loop end", w.done()).await;
    assert_eq!(w.err(), Some(WatchError::Cancelled));
}
