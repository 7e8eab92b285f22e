//! Per-kind capabilities of the generic resource watcher, plus the timestamp
//! and termination predicates over raw Job/Pod/Event objects.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStatus, Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, Time};
use kube::Resource;
use serde::de::DeserializeOwned;

pub type Timestamp = DateTime<Utc>;

/// What the resource watcher needs to know about a kind.
pub trait WatchedKind: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static {
    const KIND: &'static str;
    /// At most one object may match the selector.
    const UNIQUE: bool;

    /// Observing this state ends the watch cycle.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Most recent timestamp the object carries.
    fn last_timestamp(&self) -> Option<Timestamp>;

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    /// Identity of one delivered revision of the object.
    fn delivery_key(&self) -> String {
        let meta = self.meta();
        let id = meta.uid.as_deref().or(meta.name.as_deref()).unwrap_or_default();
        format!("{}@{}", id, meta.resource_version.as_deref().unwrap_or_default())
    }

    /// Fill in the deletion timestamp for a delete notification lacking one.
    fn synthesize_deletion(&mut self, now: Timestamp) {
        if self.meta().deletion_timestamp.is_some() {
            return;
        }
        let ts = self.last_timestamp().unwrap_or(now);
        self.meta_mut().deletion_timestamp = Some(Time(ts));
    }
}

impl WatchedKind for Job {
    const KIND: &'static str = "job";
    const UNIQUE: bool = true;

    fn is_terminal(&self) -> bool {
        is_job_finished(self)
    }

    fn last_timestamp(&self) -> Option<Timestamp> {
        Some(job_last_timestamp(self))
    }
}

impl WatchedKind for Pod {
    const KIND: &'static str = "pod";
    const UNIQUE: bool = true;

    fn is_terminal(&self) -> bool {
        is_pod_finished(self)
    }

    fn last_timestamp(&self) -> Option<Timestamp> {
        Some(pod_last_timestamp(self))
    }
}

impl WatchedKind for Event {
    const KIND: &'static str = "event";
    const UNIQUE: bool = false;

    fn last_timestamp(&self) -> Option<Timestamp> {
        event_timestamp(self)
    }
}

pub fn ts(t: &Option<Time>) -> Option<Timestamp> {
    t.as_ref().map(|t| t.0)
}

fn latest(acc: &mut Option<Timestamp>, candidate: Option<Timestamp>) {
    if let Some(c) = candidate {
        if acc.map_or(true, |a| c > a) {
            *acc = Some(c);
        }
    }
}

fn managed_fields_latest(acc: &mut Option<Timestamp>, fields: &Option<Vec<ManagedFieldsEntry>>) {
    for f in fields.iter().flatten() {
        latest(acc, ts(&f.time));
    }
}

fn condition_true(status: &str) -> bool {
    status == "True"
}

pub fn is_job_finished(job: &Job) -> bool {
    if job.metadata.deletion_timestamp.is_some() {
        return true;
    }
    let Some(status) = job.status.as_ref() else { return false };
    if status.completion_time.is_some() {
        return true;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && condition_true(&c.status))
}

/// Completion time, else the transition time of a terminal condition, else the deletion time.
pub fn job_completion_timestamp(job: &Job) -> Option<Timestamp> {
    let status = job.status.as_ref();
    if let Some(t) = status.and_then(|s| ts(&s.completion_time)) {
        return Some(t);
    }
    let from_conditions = status.and_then(|s| {
        s.conditions.iter().flatten().find_map(|c| {
            let terminal = (c.type_ == "Complete" || c.type_ == "Failed") && condition_true(&c.status);
            if terminal { ts(&c.last_transition_time) } else { None }
        })
    });
    from_conditions.or_else(|| ts(&job.metadata.deletion_timestamp))
}

pub fn job_last_timestamp(job: &Job) -> Timestamp {
    if let Some(t) = ts(&job.metadata.deletion_timestamp) {
        return t;
    }
    let mut acc = ts(&job.metadata.creation_timestamp);
    if let Some(status) = job.status.as_ref() {
        latest(&mut acc, ts(&status.completion_time));
        for c in status.conditions.iter().flatten() {
            latest(&mut acc, ts(&c.last_probe_time));
            latest(&mut acc, ts(&c.last_transition_time));
        }
    }
    managed_fields_latest(&mut acc, &job.metadata.managed_fields);
    acc.unwrap_or_else(Utc::now)
}

fn terminated_abnormally(status: &ContainerStatus, check_exit_code: bool) -> bool {
    let Some(t) = status.state.as_ref().and_then(|s| s.terminated.as_ref()) else { return false };
    let reason = t.reason.as_deref().unwrap_or_default();
    (reason != "Completed" && !reason.is_empty()) || (check_exit_code && t.exit_code != 0)
}

pub fn init_container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    pod.status.as_ref().and_then(|s| s.init_container_statuses.as_ref()).into_iter().flatten()
}

pub fn app_container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()).into_iter().flatten()
}

pub fn container_status<'a>(pod: &'a Pod, name: &str) -> Option<&'a ContainerStatus> {
    init_container_statuses(pod).chain(app_container_statuses(pod)).find(|s| s.name == name)
}

pub fn is_pod_finished(pod: &Pod) -> bool {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or_default();
    if phase == "Succeeded" || phase == "Failed" {
        return true;
    }
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    if phase == "Unknown" {
        let disrupted = status.into_iter().flat_map(|s| s.conditions.iter().flatten()).any(|c| {
            (c.type_ == "DisruptionTarget" && condition_true(&c.status)) || c.reason.as_deref() == Some("PodCompleted")
        });
        if disrupted {
            return true;
        }
    }
    init_container_statuses(pod).any(|s| terminated_abnormally(s, true))
        || app_container_statuses(pod).any(|s| terminated_abnormally(s, false))
}

pub fn pod_last_timestamp(pod: &Pod) -> Timestamp {
    if let Some(t) = ts(&pod.metadata.deletion_timestamp) {
        return t;
    }
    let mut acc = ts(&pod.metadata.creation_timestamp);
    if let Some(status) = pod.status.as_ref() {
        latest(&mut acc, ts(&status.start_time));
        for c in status.conditions.iter().flatten() {
            latest(&mut acc, ts(&c.last_probe_time));
            latest(&mut acc, ts(&c.last_transition_time));
        }
    }
    for s in init_container_statuses(pod).chain(app_container_statuses(pod)) {
        latest(&mut acc, s.state.as_ref().and_then(|st| st.terminated.as_ref()).and_then(|t| ts(&t.finished_at)));
        latest(&mut acc, s.last_state.as_ref().and_then(|st| st.terminated.as_ref()).and_then(|t| ts(&t.finished_at)));
    }
    managed_fields_latest(&mut acc, &pod.metadata.managed_fields);
    acc.unwrap_or_else(Utc::now)
}

/// Latest condition transition; falls back to deletion, then to the last known timestamp.
pub fn pod_completion_timestamp(pod: &Pod) -> Timestamp {
    let mut acc = None;
    for c in pod.status.as_ref().into_iter().flat_map(|s| s.conditions.iter().flatten()) {
        latest(&mut acc, ts(&c.last_transition_time));
    }
    acc.or_else(|| ts(&pod.metadata.deletion_timestamp)).unwrap_or_else(|| pod_last_timestamp(pod))
}

/// Latest of the creation, first-seen and last-seen timestamps.
pub fn event_timestamp(event: &Event) -> Option<Timestamp> {
    let mut acc = ts(&event.metadata.creation_timestamp);
    latest(&mut acc, ts(&event.first_timestamp));
    latest(&mut acc, ts(&event.last_timestamp));
    acc
}

/// When the event was first observed.
pub fn first_event_timestamp(event: &Event) -> Option<Timestamp> {
    ts(&event.first_timestamp).or_else(|| ts(&event.metadata.creation_timestamp)).or_else(|| ts(&event.last_timestamp))
}

/// All candidate timestamps of an event, for min/max scans.
pub fn event_timestamps(event: &Event) -> impl Iterator<Item = Timestamp> {
    [ts(&event.metadata.creation_timestamp), ts(&event.first_timestamp), ts(&event.last_timestamp)].into_iter().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(v: serde_json::Value) -> Job {
        serde_json::from_value(v).expect("job")
    }

    fn pod(v: serde_json::Value) -> Pod {
        serde_json::from_value(v).expect("pod")
    }

    #[test]
    fn job_finished_by_condition_only_when_true() {
        let pending = job(json!({
            "metadata": {"name": "j"},
            "status": {"conditions": [{"type": "Complete", "status": "False"}]}
        }));
        assert!(!is_job_finished(&pending));
        let done = job(json!({
            "metadata": {"name": "j"},
            "status": {"conditions": [{"type": "Failed", "status": "True", "lastTransitionTime": "2024-01-01T00:00:05Z"}]}
        }));
        assert!(is_job_finished(&done));
        assert_eq!(job_completion_timestamp(&done).map(|t| t.timestamp()), Some(1704067205));
    }

    #[test]
    fn pod_finished_on_failed_init_container() {
        let p = pod(json!({
            "metadata": {"name": "p"},
            "status": {
                "phase": "Pending",
                "initContainerStatuses": [{
                    "name": "init", "ready": false, "restartCount": 0, "image": "i", "imageID": "",
                    "state": {"terminated": {"exitCode": 1, "reason": "Completed"}}
                }]
            }
        }));
        assert!(is_pod_finished(&p));
    }

    #[test]
    fn pod_running_is_not_finished() {
        let p = pod(json!({"metadata": {"name": "p"}, "status": {"phase": "Running"}}));
        assert!(!is_pod_finished(&p));
    }

    #[test]
    fn deletion_is_synthesized_from_last_timestamp() {
        let mut j = job(json!({
            "metadata": {"name": "j", "creationTimestamp": "2024-01-01T00:00:00Z"},
            "status": {"completionTime": "2024-01-01T00:01:00Z"}
        }));
        let now = Utc::now();
        j.synthesize_deletion(now);
        let del = j.metadata.deletion_timestamp.as_ref().map(|t| t.0).expect("deletion");
        assert_eq!(del.timestamp(), 1704067260);
        assert!(del <= now);
    }

    #[test]
    fn event_timestamp_takes_latest_field() {
        let e: Event = serde_json::from_value(json!({
            "metadata": {"name": "e", "creationTimestamp": "2024-01-01T00:00:10Z"},
            "involvedObject": {},
            "firstTimestamp": "2024-01-01T00:00:05Z",
            "lastTimestamp": "2024-01-01T00:00:20Z"
        }))
        .expect("event");
        assert_eq!(event_timestamp(&e).map(|t| t.timestamp()), Some(1704067220));
        assert_eq!(first_event_timestamp(&e).map(|t| t.timestamp()), Some(1704067205));
        assert_eq!(event_timestamps(&e).count(), 3);
    }
}
