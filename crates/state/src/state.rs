//! The reconciled execution state: best available answer per query given
//! whatever subset of live objects, event facts and static hints exists.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Event;
use vigil_core::{ActionGroups, DataError, ExecutionStateOptions, InternalConfig, Signature};
use vigil_kubehub::Timestamp;

use crate::events::{ExecutionEvents, JobEvents, PodEvents};
use crate::job::Job;
use crate::pod::{Pod, FATAL_ERROR, GENERIC_ERROR};

const BACKOFF_LIMIT_EXCEEDED: &str = "BackoffLimitExceeded";

#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    job: Option<Job>,
    pod: Option<Pod>,
    job_events: JobEvents,
    pod_events: PodEvents,
    options: Arc<ExecutionStateOptions>,
    /// Completion already published; later answers never go below it.
    completion_floor: Option<Timestamp>,
}

fn reason_message(reason: &str, message: &str) -> String {
    if message.is_empty() { reason.to_string() } else { format!("{reason}: {message}") }
}

fn earliest(candidates: impl IntoIterator<Item = Option<Timestamp>>) -> Option<Timestamp> {
    candidates.into_iter().flatten().min()
}

impl ExecutionState {
    pub fn new(
        job: Option<Job>,
        pod: Option<Pod>,
        job_events: JobEvents,
        pod_events: PodEvents,
        options: ExecutionStateOptions,
    ) -> Self {
        Self { job, pod, job_events, pod_events, options: Arc::new(options), completion_floor: None }
    }

    pub fn with_options(options: ExecutionStateOptions) -> Self {
        Self::new(None, None, JobEvents::default(), PodEvents::default(), options)
    }

    pub fn set_job(&mut self, job: Job) {
        self.job = Some(job);
    }

    pub fn set_pod(&mut self, pod: Pod) {
        self.pod = Some(pod);
    }

    pub fn add_job_events(&mut self, events: impl IntoIterator<Item = Arc<Event>>) {
        self.job_events.extend(events);
    }

    pub fn add_pod_events(&mut self, events: impl IntoIterator<Item = Arc<Event>>) {
        self.pod_events.extend(events);
    }

    /// Record the current completion so later states cannot report an earlier or missing one.
    pub fn settle_completion(&mut self) {
        self.completion_floor = self.completion_timestamp();
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn pod(&self) -> Option<&Pod> {
        self.pod.as_ref()
    }

    pub fn job_events(&self) -> &JobEvents {
        &self.job_events
    }

    pub fn pod_events(&self) -> &PodEvents {
        &self.pod_events
    }

    pub fn events(&self) -> ExecutionEvents<'_> {
        ExecutionEvents { job: &self.job_events, pod: &self.pod_events }
    }

    pub fn options(&self) -> &ExecutionStateOptions {
        &self.options
    }

    pub fn job_exists(&self) -> bool {
        self.job.is_some()
    }

    pub fn pod_exists(&self) -> bool {
        self.pod.is_some()
    }

    pub fn namespace(&self) -> &str {
        let candidates = [
            self.options.namespace.as_str(),
            self.job.as_ref().map(Job::namespace).unwrap_or_default(),
            self.pod.as_ref().map(Pod::namespace).unwrap_or_default(),
            self.job_events.namespace(),
            self.pod_events.namespace(),
        ];
        candidates.into_iter().find(|ns| !ns.is_empty()).unwrap_or_default()
    }

    pub fn resource_id(&self) -> String {
        let known = [
            self.options.resource_id.as_str(),
            self.job.as_ref().map(Job::resource_id).unwrap_or_default(),
            self.pod.as_ref().map(Pod::resource_id).unwrap_or_default(),
        ];
        if let Some(id) = known.into_iter().find(|id| !id.is_empty()) {
            return id.to_string();
        }
        // pods are named `<resource-id>-<suffix>`
        let pod = self.pod_name();
        pod.rsplit_once('-').map(|(id, _)| id.to_string()).unwrap_or_default()
    }

    pub fn root_resource_id(&self) -> String {
        let known = [
            self.options.root_resource_id.as_str(),
            self.job.as_ref().map(Job::root_resource_id).unwrap_or_default(),
            self.pod.as_ref().map(Pod::root_resource_id).unwrap_or_default(),
        ];
        if let Some(id) = known.into_iter().find(|id| !id.is_empty()) {
            return id.to_string();
        }
        let pod = self.pod_name();
        pod.split_once('-').map(|(id, _)| id.to_string()).unwrap_or_default()
    }

    pub fn pod_name(&self) -> &str {
        if let Some(pod) = self.pod.as_ref() {
            return pod.name();
        }
        [self.pod_events.name(), self.job_events.pod_name()].into_iter().find(|n| !n.is_empty()).unwrap_or_default()
    }

    pub fn pod_node_name(&self) -> &str {
        let live = self.pod.as_ref().map(Pod::node_name).unwrap_or_default();
        if live.is_empty() { self.pod_events.node_name() } else { live }
    }

    pub fn pod_ip(&self) -> &str {
        self.pod.as_ref().map(Pod::ip).unwrap_or_default()
    }

    pub fn containers_ready(&self) -> bool {
        self.pod.as_ref().is_some_and(Pod::containers_ready)
    }

    pub fn pod_deletion_timestamp(&self) -> Option<Timestamp> {
        self.pod.as_ref().and_then(Pod::deletion_timestamp).or_else(|| self.job_events.pod_deletion_timestamp())
    }

    fn raw_completion_timestamp(&self) -> Option<Timestamp> {
        if let Some(t) = self.pod.as_ref().and_then(Pod::finish_timestamp) {
            return Some(t);
        }
        if let Some(t) = self.pod_deletion_timestamp() {
            return Some(t);
        }
        if let Some(t) = self.job.as_ref().and_then(Job::finish_timestamp) {
            // the job's own record may lag behind what the pod events saw
            return Some(self.pod_events.last_timestamp().map_or(t, |last| t.max(last)));
        }
        self.pod_events.finish_timestamp().or_else(|| self.job_events.finish_timestamp())
    }

    pub fn completion_timestamp(&self) -> Option<Timestamp> {
        match (self.raw_completion_timestamp(), self.completion_floor) {
            (Some(t), Some(floor)) => Some(t.max(floor)),
            (t, floor) => t.or(floor),
        }
    }

    pub fn completed(&self) -> bool {
        self.completion_timestamp().is_some()
    }

    pub fn container_start_timestamp(&self, name: &str) -> Option<Timestamp> {
        self.pod
            .as_ref()
            .and_then(|p| p.container_start_timestamp(name))
            .or_else(|| self.pod_events.container(name).start_timestamp())
    }

    /// A finished container always counts as started.
    pub fn container_started(&self, name: &str) -> bool {
        self.pod.as_ref().is_some_and(|p| p.container_started(name) || p.container_finished(name))
            || self.pod_events.container(name).started()
    }

    pub fn container_finished(&self, name: &str) -> bool {
        self.pod.as_ref().is_some_and(|p| p.container_finished(name))
    }

    pub fn container_failed(&self, name: &str) -> bool {
        self.pod.as_ref().is_some_and(|p| p.container_failed(name))
    }

    pub fn signature(&self) -> Result<Vec<Signature>, DataError> {
        if let Some(job) = self.job.as_ref() {
            return job.signature();
        }
        if let Some(pod) = self.pod.as_ref() {
            return pod.signature();
        }
        self.options.signature.clone().ok_or(DataError::MissingData)
    }

    pub fn action_groups(&self) -> Result<ActionGroups, DataError> {
        if let Some(job) = self.job.as_ref() {
            return job.action_groups();
        }
        if let Some(pod) = self.pod.as_ref() {
            return pod.action_groups();
        }
        self.options.action_groups.clone().ok_or(DataError::MissingData)
    }

    pub fn internal_config(&self) -> Result<InternalConfig, DataError> {
        if let Some(job) = self.job.as_ref() {
            return job.internal_config();
        }
        if let Some(pod) = self.pod.as_ref() {
            return pod.internal_config();
        }
        Err(DataError::MissingData)
    }

    pub fn scheduled_at(&self) -> Option<Timestamp> {
        self.job
            .as_ref()
            .and_then(|j| j.scheduled_at().ok())
            .or_else(|| self.pod.as_ref().and_then(|p| p.scheduled_at().ok()))
            .or(self.options.scheduled_at)
    }

    pub fn job_execution_error(&self) -> String {
        if let Some(err) = self.job.as_ref().map(Job::execution_error).filter(|e| !e.is_empty()) {
            return err;
        }
        if self.job_events.error() {
            return reason_message(self.job_events.error_reason(), self.job_events.error_message());
        }
        String::new()
    }

    pub fn pod_execution_error(&self) -> String {
        let err = self.pod.as_ref().map(Pod::execution_error).unwrap_or_default();
        if (err.is_empty() || err == GENERIC_ERROR) && self.pod_events.error() {
            return reason_message(self.pod_events.error_reason(), self.pod_events.error_message());
        }
        if err == GENERIC_ERROR {
            return FATAL_ERROR.to_string();
        }
        err
    }

    /// Single human-readable error; empty while nothing failed.
    pub fn execution_error(&self) -> String {
        let pod_err = self.pod_execution_error();
        let job_err = self.job_execution_error();
        let job_backoff = job_err.starts_with(BACKOFF_LIMIT_EXCEEDED);
        if pod_err.is_empty() && job_backoff {
            return FATAL_ERROR.to_string();
        }
        if pod_err.is_empty() || (pod_err == FATAL_ERROR && !job_err.is_empty() && !job_backoff) {
            return job_err;
        }
        pod_err
    }

    pub fn job_creation_timestamp(&self) -> Option<Timestamp> {
        self.job.as_ref().and_then(Job::creation_timestamp)
    }

    pub fn estimated_job_creation_timestamp(&self) -> Option<Timestamp> {
        if let Some(t) = self.job_creation_timestamp() {
            return Some(t);
        }
        self.scheduled_at().or_else(|| {
            earliest([self.events().first_timestamp(), self.estimated_pod_creation_timestamp()])
        })
    }

    pub fn pod_creation_timestamp(&self) -> Option<Timestamp> {
        match self.pod.as_ref() {
            Some(pod) => pod.creation_timestamp(),
            None => self.job_events.pod_creation_timestamp(),
        }
    }

    pub fn estimated_pod_creation_timestamp(&self) -> Option<Timestamp> {
        self.pod_creation_timestamp().or_else(|| self.pod_events.first_timestamp())
    }

    pub fn pod_start_timestamp(&self) -> Option<Timestamp> {
        self.pod.as_ref().and_then(Pod::start_timestamp).or_else(|| self.pod_events.start_timestamp())
    }

    pub fn estimated_pod_start_timestamp(&self) -> Option<Timestamp> {
        self.pod_start_timestamp().or_else(|| self.pod_events.first_container_timestamp())
    }

    pub fn pod_created(&self) -> bool {
        self.estimated_pod_creation_timestamp().is_some()
    }

    pub fn pod_started(&self) -> bool {
        self.estimated_pod_start_timestamp().is_some()
    }

    fn pod_finished(&self) -> bool {
        self.pod.as_ref().is_some_and(Pod::finished)
    }

    /// Pod data must be corroborated before the state can be trusted: the pod
    /// events or the job report an outcome that no terminal pod confirms yet.
    pub fn pod_critically_missing(&self) -> bool {
        if self.pod_finished() {
            return false;
        }
        let job_succeeded =
            self.job.as_ref().is_some_and(|j| j.finished() && j.execution_error().is_empty()) || self.job_events.success();
        self.pod_events.error() || job_succeeded
    }

    /// Pod events report a failure that no terminal job confirms yet.
    pub fn job_critically_missing(&self) -> bool {
        self.pod_events.error() && !self.job.as_ref().is_some_and(Job::finished)
    }
}
