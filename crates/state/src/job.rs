//! Read-only view over a live Job object.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job as KubeJob;
use vigil_core::schema::{
    self, ActionGroups, InternalConfig, Signature, INTERNAL_ANNOTATION, RESOURCE_ID_LABEL, ROOT_RESOURCE_ID_LABEL,
    SCHEDULED_AT_ANNOTATION, SIGNATURE_ANNOTATION, SPEC_ANNOTATION, TERMINATION_CODE_ANNOTATION,
    TERMINATION_REASON_ANNOTATION,
};
use vigil_core::DataError;
use vigil_kubehub::kinds::{is_job_finished, job_completion_timestamp, ts};
use vigil_kubehub::Timestamp;

pub const ABORTED_MESSAGE: &str = "Job has been aborted";
pub const ABORTED_CODE: &str = "aborted";

#[derive(Debug, Clone)]
pub struct Job {
    inner: Arc<KubeJob>,
}

impl From<KubeJob> for Job {
    fn from(job: KubeJob) -> Self {
        Self { inner: Arc::new(job) }
    }
}

impl From<Arc<KubeJob>> for Job {
    fn from(inner: Arc<KubeJob>) -> Self {
        Self { inner }
    }
}

impl Job {
    pub fn original(&self) -> &KubeJob {
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

    pub fn creation_timestamp(&self) -> Option<Timestamp> {
        ts(&self.inner.metadata.creation_timestamp)
    }

    pub fn deletion_timestamp(&self) -> Option<Timestamp> {
        ts(&self.inner.metadata.deletion_timestamp)
    }

    pub fn finished(&self) -> bool {
        is_job_finished(&self.inner)
    }

    pub fn finish_timestamp(&self) -> Option<Timestamp> {
        if !self.finished() {
            return None;
        }
        job_completion_timestamp(&self.inner)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.inner.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Timeout, else the recorded termination reason, else abort on deletion.
    pub fn execution_error(&self) -> String {
        let deadline = self.inner.spec.as_ref().and_then(|s| s.active_deadline_seconds);
        if let (Some(secs), Some(status)) = (deadline, self.inner.status.as_ref()) {
            let timed_out = status.conditions.iter().flatten().any(|c| {
                c.type_ == "Failed" && c.status == "True" && c.reason.as_deref() == Some("DeadlineExceeded")
            });
            if timed_out {
                return format!("Job timed out after {secs} seconds");
            }
        }
        if let Some(reason) = self.annotation(TERMINATION_REASON_ANNOTATION) {
            return reason.to_string();
        }
        if self.inner.metadata.deletion_timestamp.is_some() {
            return ABORTED_MESSAGE.to_string();
        }
        String::new()
    }

    /// Status code recorded by whoever terminated the job; `aborted` when unknown.
    pub fn termination_code(&self) -> &str {
        self.annotation(TERMINATION_CODE_ANNOTATION).unwrap_or(ABORTED_CODE)
    }

    /// Own annotations when they carry `key`, else the pod template's.
    fn annotations_with(&self, key: &str) -> Option<&BTreeMap<String, String>> {
        let own = self.inner.metadata.annotations.as_ref();
        if own.is_some_and(|a| a.contains_key(key)) {
            return own;
        }
        self.inner.spec.as_ref().and_then(|s| s.template.metadata.as_ref()).and_then(|m| m.annotations.as_ref())
    }

    pub fn signature(&self) -> Result<Vec<Signature>, DataError> {
        schema::decode_json(self.annotations_with(SIGNATURE_ANNOTATION), SIGNATURE_ANNOTATION)
    }

    pub fn action_groups(&self) -> Result<ActionGroups, DataError> {
        schema::decode_json(self.annotations_with(SPEC_ANNOTATION), SPEC_ANNOTATION)
    }

    pub fn internal_config(&self) -> Result<InternalConfig, DataError> {
        schema::decode_json(self.annotations_with(INTERNAL_ANNOTATION), INTERNAL_ANNOTATION)
    }

    pub fn scheduled_at(&self) -> Result<Timestamp, DataError> {
        schema::decode_timestamp(self.annotations_with(SCHEDULED_AT_ANNOTATION), SCHEDULED_AT_ANNOTATION)
    }
}
