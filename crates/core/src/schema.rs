//! Label/annotation schema stamped on execution resources, and the decoded
//! shapes of the JSON annotations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DataError;

pub const RESOURCE_ID_LABEL: &str = "vigil.dev/resource-id";
pub const ROOT_RESOURCE_ID_LABEL: &str = "vigil.dev/root-resource-id";

pub const SIGNATURE_ANNOTATION: &str = "vigil.dev/signature";
pub const SPEC_ANNOTATION: &str = "vigil.dev/spec";
pub const INTERNAL_ANNOTATION: &str = "vigil.dev/internal";
pub const SCHEDULED_AT_ANNOTATION: &str = "vigil.dev/scheduled-at";
pub const TERMINATION_REASON_ANNOTATION: &str = "vigil.dev/termination-reason";
pub const TERMINATION_CODE_ANNOTATION: &str = "vigil.dev/termination-code";

/// Execution signature: the tree of steps the workflow compiler produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Signature {
    #[serde(rename = "ref")]
    pub reference: String,
    pub name: String,
    pub category: String,
    pub optional: bool,
    pub negative: bool,
    pub children: Vec<Signature>,
}

/// Container action groups; actions are opaque to the reconciliation engine.
pub type ActionGroups = Vec<Vec<serde_json::Value>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InternalConfig {
    pub execution: ExecutionConfig,
    pub workflow: WorkflowConfig,
    pub resource: ResourceConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub number: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub debug: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceConfig {
    pub id: String,
    pub root_id: String,
    pub fs_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub namespace: String,
}

/// Static hints known before any live resource exists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionStateOptions {
    pub resource_id: String,
    pub root_resource_id: String,
    pub namespace: String,
    pub signature: Option<Vec<Signature>>,
    pub action_groups: Option<ActionGroups>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Decode a JSON annotation; absence and garbage both surface as missing data.
pub fn decode_json<T: serde::de::DeserializeOwned>(
    annotations: Option<&BTreeMap<String, String>>,
    key: &'static str,
) -> Result<T, DataError> {
    let raw = annotations.and_then(|a| a.get(key)).filter(|v| !v.is_empty()).ok_or(DataError::MissingData)?;
    serde_json::from_str(raw).map_err(|e| DataError::undecodable(key, e))
}

pub fn decode_timestamp(
    annotations: Option<&BTreeMap<String, String>>,
    key: &'static str,
) -> Result<DateTime<Utc>, DataError> {
    let raw = annotations.and_then(|a| a.get(key)).filter(|v| !v.is_empty()).ok_or(DataError::MissingData)?;
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).map_err(|e| DataError::undecodable(key, e))
}
