//! Read-only view over a live Pod object.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, ContainerStatus, Pod as KubePod};
use vigil_core::schema::{
    self, ActionGroups, InternalConfig, Signature, INTERNAL_ANNOTATION, RESOURCE_ID_LABEL, ROOT_RESOURCE_ID_LABEL,
    SCHEDULED_AT_ANNOTATION, SIGNATURE_ANNOTATION, SPEC_ANNOTATION,
};
use vigil_core::DataError;
use vigil_kubehub::kinds::{app_container_statuses, container_status, init_container_statuses, is_pod_finished, pod_completion_timestamp, ts};
use vigil_kubehub::Timestamp;

/// Generic container failure reason, upgraded to [`FATAL_ERROR`] when nothing better is known.
pub const GENERIC_ERROR: &str = "Error";
pub const FATAL_ERROR: &str = "Fatal Error";

/// First workflow container; its start stands in for the pod start.
const FIRST_STEP_CONTAINER: &str = "1";

#[derive(Debug, Clone)]
pub struct Pod {
    inner: Arc<KubePod>,
}

impl From<KubePod> for Pod {
    fn from(pod: KubePod) -> Self {
        Self { inner: Arc::new(pod) }
    }
}

impl From<Arc<KubePod>> for Pod {
    fn from(inner: Arc<KubePod>) -> Self {
        Self { inner }
    }
}

fn terminated_with_failure(status: &ContainerStatus) -> Option<&str> {
    let t = status.state.as_ref()?.terminated.as_ref()?;
    t.reason.as_deref().filter(|r| !r.is_empty() && *r != "Completed")
}

fn status_start(status: &ContainerStatus) -> Option<Timestamp> {
    let state = status.state.as_ref()?;
    if let Some(running) = state.running.as_ref() {
        return ts(&running.started_at);
    }
    state.terminated.as_ref().and_then(|t| ts(&t.started_at))
}

impl Pod {
    pub fn original(&self) -> &KubePod {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.inner.metadata.namespace.as_deref().unwrap_or_default()
    }

    fn label(&self, key: &str) -> &str {
        self.inner.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str).unwrap_or_default()
    }

    pub fn resource_id(&self) -> &str {
        self.label(RESOURCE_ID_LABEL)
    }

    pub fn root_resource_id(&self) -> &str {
        self.label(ROOT_RESOURCE_ID_LABEL)
    }

    pub fn node_name(&self) -> &str {
        let scheduled = self.inner.spec.as_ref().and_then(|s| s.node_name.as_deref()).filter(|n| !n.is_empty());
        let nominated = || self.inner.status.as_ref().and_then(|s| s.nominated_node_name.as_deref());
        scheduled.or_else(nominated).unwrap_or_default()
    }

    pub fn ip(&self) -> &str {
        self.inner.status.as_ref().and_then(|s| s.pod_ip.as_deref()).unwrap_or_default()
    }

    pub fn creation_timestamp(&self) -> Option<Timestamp> {
        ts(&self.inner.metadata.creation_timestamp)
    }

    pub fn deletion_timestamp(&self) -> Option<Timestamp> {
        ts(&self.inner.metadata.deletion_timestamp)
    }

    pub fn start_timestamp(&self) -> Option<Timestamp> {
        self.inner
            .status
            .as_ref()
            .and_then(|s| ts(&s.start_time))
            .or_else(|| self.status(FIRST_STEP_CONTAINER).and_then(status_start))
    }

    pub fn finished(&self) -> bool {
        is_pod_finished(&self.inner)
    }

    pub fn finish_timestamp(&self) -> Option<Timestamp> {
        self.finished().then(|| pod_completion_timestamp(&self.inner))
    }

    fn status(&self, name: &str) -> Option<&ContainerStatus> {
        container_status(&self.inner, name)
    }

    pub fn container_started(&self, name: &str) -> bool {
        let Some(s) = self.status(name) else { return false };
        s.started == Some(true) || s.ready || s.state.as_ref().is_some_and(|st| st.running.is_some())
    }

    pub fn container_finished(&self, name: &str) -> bool {
        self.status(name).and_then(|s| s.state.as_ref()).is_some_and(|st| st.terminated.is_some())
    }

    pub fn container_failed(&self, name: &str) -> bool {
        self.status(name).and_then(terminated_with_failure).is_some()
    }

    pub fn container_start_timestamp(&self, name: &str) -> Option<Timestamp> {
        self.status(name).and_then(status_start)
    }

    pub fn container_finish_timestamp(&self, name: &str) -> Option<Timestamp> {
        let state = self.status(name)?.state.as_ref()?;
        state.terminated.as_ref().and_then(|t| ts(&t.finished_at))
    }

    fn spec_containers(&self, init: bool) -> impl Iterator<Item = &Container> {
        let spec = self.inner.spec.as_ref();
        let list = if init { spec.and_then(|s| s.init_containers.as_deref()) } else { spec.map(|s| s.containers.as_slice()) };
        list.into_iter().flatten()
    }

    /// The active init container, and every app container, with a readiness probe must be ready.
    pub fn containers_ready(&self) -> bool {
        for c in self.spec_containers(true).filter(|c| c.readiness_probe.is_some()) {
            let Some(status) = self.status(&c.name) else { return false };
            let active = status.state.as_ref().is_some_and(|st| st.running.is_some() || st.waiting.is_some());
            if active {
                return status.ready;
            }
        }
        self.spec_containers(false)
            .filter(|c| c.readiness_probe.is_some())
            .all(|c| self.status(&c.name).is_some_and(|s| s.ready))
    }

    /// Failure reason of any init container, or of a numbered workflow container.
    pub fn container_error(&self) -> String {
        let init = init_container_statuses(&self.inner).find_map(terminated_with_failure);
        let step = || {
            app_container_statuses(&self.inner)
                .filter(|s| s.name.parse::<i64>().is_ok())
                .find_map(terminated_with_failure)
        };
        init.or_else(step).unwrap_or_default().to_string()
    }

    /// Pod-level failure: timeout, disruption, else the container error.
    pub fn execution_error(&self) -> String {
        let err = self.pod_error();
        if err.is_empty() || err == GENERIC_ERROR {
            return self.container_error();
        }
        err
    }

    fn pod_error(&self) -> String {
        let status = self.inner.status.as_ref();
        let deadline = self.inner.spec.as_ref().and_then(|s| s.active_deadline_seconds);
        if let (Some(secs), Some("DeadlineExceeded")) = (deadline, status.and_then(|s| s.reason.as_deref())) {
            return format!("Pod timed out after {secs} seconds");
        }
        let disruption = status
            .into_iter()
            .flat_map(|s| s.conditions.iter().flatten())
            .find(|c| c.type_ == "DisruptionTarget" && c.status == "True");
        match disruption {
            Some(c) => {
                let reason = c.reason.as_deref().unwrap_or_default();
                match c.message.as_deref().filter(|m| !m.is_empty()) {
                    Some(message) => format!("{reason}: {message}"),
                    None => reason.to_string(),
                }
            }
            None => String::new(),
        }
    }

    pub fn signature(&self) -> Result<Vec<Signature>, DataError> {
        schema::decode_json(self.inner.metadata.annotations.as_ref(), SIGNATURE_ANNOTATION)
    }

    pub fn action_groups(&self) -> Result<ActionGroups, DataError> {
        schema::decode_json(self.inner.metadata.annotations.as_ref(), SPEC_ANNOTATION)
    }

    pub fn internal_config(&self) -> Result<InternalConfig, DataError> {
        schema::decode_json(self.inner.metadata.annotations.as_ref(), INTERNAL_ANNOTATION)
    }

    pub fn scheduled_at(&self) -> Result<Timestamp, DataError> {
        schema::decode_timestamp(self.inner.metadata.annotations.as_ref(), SCHEDULED_AT_ANNOTATION)
    }
}
