#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::{Event, Pod as KubePod};
use serde_json::{json, Value};
use vigil_core::{DataError, ExecutionStateOptions, Signature};
use vigil_state::{ExecutionState, Job, Pod};

fn job(v: Value) -> Job {
    Job::from(serde_json::from_value::<KubeJob>(v).unwrap())
}

fn pod(v: Value) -> Pod {
    Pod::from(serde_json::from_value::<KubePod>(v).unwrap())
}

fn ev(name: &str, involved: &str, reason: &str, message: &str, at: &str) -> Arc<Event> {
    Arc::new(
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": "tests"},
            "involvedObject": {"name": involved},
            "reason": reason,
            "message": message,
            "firstTimestamp": at,
            "lastTimestamp": at
        }))
        .unwrap(),
    )
}

fn secs(t: Option<chrono::DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp())
}

fn opts(id: &str) -> ExecutionStateOptions {
    ExecutionStateOptions { resource_id: id.into(), ..Default::default() }
}

#[test]
fn job_without_pod_or_events_is_running() {
    let mut s = ExecutionState::with_options(opts("exec-1"));
    s.set_job(job(json!({"metadata": {"name": "exec-1", "creationTimestamp": "2024-01-01T00:00:00Z"}, "status": {"active": 1}})));
    assert!(s.job_exists());
    assert!(!s.pod_exists());
    assert!(!s.completed());
    assert_eq!(s.execution_error(), "");
    assert_eq!(secs(s.estimated_job_creation_timestamp()), Some(1704067200));
    assert!(!s.pod_created());
}

#[test]
fn eviction_without_live_pod_is_the_pod_error() {
    let mut s = ExecutionState::with_options(opts("exec-1"));
    s.add_pod_events([ev("e", "exec-1-abcde", "Evicted", "node pressure", "2024-01-01T00:00:05Z")]);
    assert_eq!(s.pod_execution_error(), "Evicted: node pressure");
    assert_eq!(s.execution_error(), "Evicted: node pressure");
    assert!(s.pod_critically_missing());
    assert!(s.job_critically_missing());
    assert_eq!(secs(s.completion_timestamp()), Some(1704067205));
}

#[test]
fn completed_job_without_pod_completes_on_job_time() {
    let mut s = ExecutionState::with_options(opts("exec-1"));
    s.set_job(job(json!({"metadata": {"name": "exec-1"}, "status": {"succeeded": 1, "completionTime": "2024-01-01T00:01:00Z"}})));
    assert!(s.pod_critically_missing());
    assert!(!s.job_critically_missing());
    assert!(s.completed());
    assert_eq!(secs(s.completion_timestamp()), Some(1704067260));
}

#[test]
fn job_completion_is_raised_to_last_pod_event() {
    let mut s = ExecutionState::default();
    s.set_job(job(json!({"metadata": {"name": "exec-1"}, "status": {"completionTime": "2024-01-01T00:01:00Z"}})));
    s.add_pod_events([ev("e", "exec-1-abcde", "Killing", "", "2024-01-01T00:01:07Z")]);
    assert_eq!(secs(s.completion_timestamp()), Some(1704067267));
}

#[test]
fn error_precedence() {
    // backoff limit alone turns into a generic fatal error
    let mut s = ExecutionState::default();
    s.add_job_events([ev("j", "exec-1", "BackoffLimitExceeded", "Job has reached the specified backoff limit", "2024-01-01T00:00:09Z")]);
    assert_eq!(s.job_execution_error(), "BackoffLimitExceeded: Job has reached the specified backoff limit");
    assert_eq!(s.execution_error(), "Fatal Error");

    // generic container error defers to a specific job error
    let failed = pod(json!({
        "metadata": {"name": "exec-1-abcde"},
        "status": {"phase": "Failed", "containerStatuses": [{
            "name": "1", "ready": false, "restartCount": 0, "image": "i", "imageID": "",
            "state": {"terminated": {"exitCode": 1, "reason": "Error"}}
        }]}
    }));
    let mut s = ExecutionState::default();
    s.set_pod(failed.clone());
    assert_eq!(s.pod_execution_error(), "Fatal Error");
    assert_eq!(s.execution_error(), "Fatal Error");
    s.set_job(job(json!({
        "metadata": {"name": "exec-1"},
        "spec": {"activeDeadlineSeconds": 10, "template": {}},
        "status": {"conditions": [{"type": "Failed", "status": "True", "reason": "DeadlineExceeded"}]}
    })));
    assert_eq!(s.execution_error(), "Job timed out after 10 seconds");

    // a specific pod error wins
    let mut s = ExecutionState::default();
    s.set_pod(pod(json!({"metadata": {"name": "p"}, "status": {"phase": "Failed", "conditions": [
        {"type": "DisruptionTarget", "status": "True", "reason": "TerminationByKubelet"}
    ]}})));
    s.add_job_events([ev("j", "exec-1", "DeadlineExceeded", "", "2024-01-01T00:00:09Z")]);
    assert_eq!(s.execution_error(), "TerminationByKubelet");
}

#[test]
fn identity_falls_back_to_pod_name() {
    let mut s = ExecutionState::default();
    s.add_job_events([ev("j", "exec-1", "SuccessfulCreate", "Created pod: root-child-abcde", "2024-01-01T00:00:01Z")]);
    assert_eq!(s.pod_name(), "root-child-abcde");
    assert_eq!(s.resource_id(), "root-child");
    assert_eq!(s.root_resource_id(), "root");
    assert_eq!(s.namespace(), "tests");
    assert_eq!(secs(s.pod_creation_timestamp()), Some(1704067201));
    assert!(s.pod_created());

    let s = ExecutionState::with_options(ExecutionStateOptions {
        resource_id: "a".into(),
        root_resource_id: "r".into(),
        namespace: "ns".into(),
        ..Default::default()
    });
    assert_eq!((s.resource_id().as_str(), s.root_resource_id().as_str(), s.namespace()), ("a", "r", "ns"));
}

#[test]
fn finished_container_counts_as_started() {
    let mut s = ExecutionState::default();
    s.set_pod(pod(json!({
        "metadata": {"name": "p"},
        "status": {"phase": "Running", "containerStatuses": [{
            "name": "1", "ready": false, "restartCount": 0, "image": "i", "imageID": "",
            "state": {"terminated": {"exitCode": 0, "reason": "Completed", "startedAt": "2024-01-01T00:00:02Z"}}
        }]}
    })));
    assert!(s.container_finished("1"));
    assert!(s.container_started("1"));
    assert!(!s.container_failed("1"));
    assert_eq!(secs(s.container_start_timestamp("1")), Some(1704067202));
    assert!(!s.container_started("2"));
}

#[test]
fn settled_completion_never_regresses() {
    let mut s = ExecutionState::default();
    s.set_job(job(json!({"metadata": {"name": "exec-1"}, "status": {"completionTime": "2024-01-01T00:01:00Z"}})));
    s.settle_completion();
    // an earlier pod-side finish must not move the answer backwards
    s.set_pod(pod(json!({
        "metadata": {"name": "p"},
        "status": {"phase": "Succeeded", "conditions": [{"type": "Ready", "status": "False", "lastTransitionTime": "2024-01-01T00:00:50Z"}]}
    })));
    assert_eq!(secs(s.completion_timestamp()), Some(1704067260));
}

#[test]
fn annotations_fall_back_to_options() {
    let sig = vec![Signature { reference: "r1".into(), ..Default::default() }];
    let scheduled = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let s = ExecutionState::with_options(ExecutionStateOptions {
        signature: Some(sig.clone()),
        scheduled_at: Some(scheduled),
        ..Default::default()
    });
    assert_eq!(s.signature(), Ok(sig));
    assert_eq!(s.action_groups(), Err(DataError::MissingData));
    assert_eq!(s.internal_config().map(|_| ()), Err(DataError::MissingData));
    assert_eq!(s.scheduled_at(), Some(scheduled));
    assert_eq!(s.estimated_job_creation_timestamp(), Some(scheduled));

    // a live job owns the answer even when its annotation is garbage
    let mut s = s;
    s.set_job(job(json!({"metadata": {"name": "j", "annotations": {"vigil.dev/signature": "{"}}})));
    assert!(s.signature().unwrap_err().is_missing_data());
}

#[test]
fn estimated_pod_start_uses_container_events() {
    let mut s = ExecutionState::default();
    let mut pulled = (*ev("c", "exec-1-abcde", "Pulling", "", "2024-01-01T00:00:04Z")).clone();
    pulled.involved_object.field_path = Some("spec.initContainers{init}".into());
    s.add_pod_events([Arc::new(pulled)]);
    assert_eq!(s.pod_start_timestamp(), None);
    assert_eq!(secs(s.estimated_pod_start_timestamp()), Some(1704067204));
    assert!(s.pod_started());
}
