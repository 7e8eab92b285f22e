//! Event Facts: typed facts recovered from human-readable, reason-coded
//! cluster events.
//!
//! Classification works on reason strings and message tails, so every query
//! tolerates unknown reasons and returns an empty value instead of failing.
//! Duplicate events never change a fact: all queries are min/max/any scans.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Event;
use once_cell::sync::Lazy;
use regex::Regex;
use vigil_kubehub::kinds::{event_timestamp, event_timestamps, first_event_timestamp};
use vigil_kubehub::Timestamp;

static CONTAINER_FIELD_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^spec\.(?:initContainers|containers)\{([^}]+)\}").expect("valid container field path pattern"));

const JOB_SUCCESS_REASONS: &[&str] = &["Completed"];
const JOB_ERROR_REASONS: &[&str] = &["BackoffLimitExceeded", "DeadlineExceeded"];
const POD_ERROR_REASONS: &[&str] = &["Evicted", "ExceededGracePeriod"];

fn reason(event: &Event) -> &str {
    event.reason.as_deref().unwrap_or_default()
}

fn message(event: &Event) -> &str {
    event.message.as_deref().unwrap_or_default()
}

/// Token after the last space: `Created pod: exec-1-abcde` gives `exec-1-abcde`.
fn message_tail(event: &Event) -> &str {
    let msg = message(event);
    msg.rsplit_once(' ').map_or(msg, |(_, tail)| tail)
}

fn event_namespace(event: &Event) -> &str {
    event
        .metadata
        .namespace
        .as_deref()
        .or(event.involved_object.namespace.as_deref())
        .unwrap_or_default()
}

/// Container named by the event's involved field path, if any.
pub fn event_container_name(event: &Event) -> Option<&str> {
    let path = event.involved_object.field_path.as_deref()?;
    CONTAINER_FIELD_PATH.captures(path).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Shared scans over an unordered event collection.
#[derive(Debug, Clone, Default)]
struct Events(Vec<Arc<Event>>);

impl Events {
    fn iter(&self) -> impl Iterator<Item = &Event> {
        self.0.iter().map(Arc::as_ref)
    }

    /// Earliest event with one of `reasons`; ties keep the first received.
    fn earliest(&self, reasons: &[&str]) -> Option<&Event> {
        self.iter()
            .filter(|e| reasons.contains(&reason(e)))
            .min_by_key(|e| first_event_timestamp(e))
    }

    fn any(&self, reasons: &[&str]) -> bool {
        self.iter().any(|e| reasons.contains(&reason(e)))
    }

    fn first_timestamp(&self) -> Option<Timestamp> {
        self.iter().flat_map(event_timestamps).min()
    }

    fn last_timestamp(&self) -> Option<Timestamp> {
        self.iter().flat_map(event_timestamps).max()
    }

    fn namespace(&self) -> &str {
        self.iter().map(event_namespace).find(|ns| !ns.is_empty()).unwrap_or_default()
    }
}

macro_rules! event_collection {
    ($name:ident) => {
        impl $name {
            pub fn new(events: impl IntoIterator<Item = Arc<Event>>) -> Self {
                Self(Events(events.into_iter().collect()))
            }

            pub fn extend(&mut self, events: impl IntoIterator<Item = Arc<Event>>) {
                self.0 .0.extend(events);
            }

            pub fn original(&self) -> &[Arc<Event>] {
                &self.0 .0
            }

            pub fn len(&self) -> usize {
                self.0 .0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0 .0.is_empty()
            }

            pub fn first_timestamp(&self) -> Option<Timestamp> {
                self.0.first_timestamp()
            }

            pub fn last_timestamp(&self) -> Option<Timestamp> {
                self.0.last_timestamp()
            }

            pub fn namespace(&self) -> &str {
                self.0.namespace()
            }
        }
    };
}

/// Facts about the job, from events involving the job.
#[derive(Debug, Clone, Default)]
pub struct JobEvents(Events);

event_collection!(JobEvents);

impl JobEvents {
    pub fn success(&self) -> bool {
        self.0.any(JOB_SUCCESS_REASONS)
    }

    pub fn error(&self) -> bool {
        self.0.any(JOB_ERROR_REASONS)
    }

    pub fn finished(&self) -> bool {
        self.success() || self.error()
    }

    fn error_event(&self) -> Option<&Event> {
        self.0.earliest(JOB_ERROR_REASONS)
    }

    pub fn error_reason(&self) -> &str {
        self.error_event().map(reason).unwrap_or_default()
    }

    pub fn error_message(&self) -> &str {
        self.error_event().map(message).unwrap_or_default()
    }

    pub fn finish_timestamp(&self) -> Option<Timestamp> {
        let finishing: Vec<&str> = JOB_SUCCESS_REASONS.iter().chain(JOB_ERROR_REASONS).copied().collect();
        self.0.earliest(&finishing).and_then(event_timestamp)
    }

    /// Pod name from the controller's create (else delete) event.
    pub fn pod_name(&self) -> &str {
        self.0
            .earliest(&["SuccessfulCreate"])
            .or_else(|| self.0.earliest(&["SuccessfulDelete"]))
            .map(message_tail)
            .unwrap_or_default()
    }

    pub fn pod_creation_timestamp(&self) -> Option<Timestamp> {
        self.0.earliest(&["SuccessfulCreate"]).and_then(first_event_timestamp)
    }

    pub fn pod_deletion_timestamp(&self) -> Option<Timestamp> {
        self.0.earliest(&["SuccessfulDelete"]).and_then(first_event_timestamp)
    }
}

/// Facts about the pod, from events involving the pod.
#[derive(Debug, Clone, Default)]
pub struct PodEvents(Events);

event_collection!(PodEvents);

impl PodEvents {
    pub fn name(&self) -> &str {
        self.0
            .iter()
            .filter_map(|e| e.involved_object.name.as_deref())
            .find(|n| !n.is_empty())
            .unwrap_or_default()
    }

    fn scheduled(&self) -> Option<&Event> {
        self.0.earliest(&["Scheduled"])
    }

    pub fn start_timestamp(&self) -> Option<Timestamp> {
        self.scheduled().and_then(first_event_timestamp)
    }

    /// `Successfully assigned ns/pod to node-1` gives `node-1`.
    pub fn node_name(&self) -> &str {
        self.scheduled().map(message_tail).unwrap_or_default()
    }

    pub fn error(&self) -> bool {
        self.0.any(POD_ERROR_REASONS)
    }

    fn error_event(&self) -> Option<&Event> {
        self.0.earliest(POD_ERROR_REASONS)
    }

    pub fn error_reason(&self) -> &str {
        self.error_event().map(reason).unwrap_or_default()
    }

    pub fn error_message(&self) -> &str {
        self.error_event().map(message).unwrap_or_default()
    }

    pub fn finish_timestamp(&self) -> Option<Timestamp> {
        self.error_event().and_then(event_timestamp)
    }

    pub fn container<'a>(&'a self, name: &'a str) -> ContainerEvents<'a> {
        ContainerEvents { events: &self.0, name }
    }

    /// First observation of any container-scoped event.
    pub fn first_container_timestamp(&self) -> Option<Timestamp> {
        self.0.iter().filter(|e| event_container_name(e).is_some()).filter_map(first_event_timestamp).min()
    }
}

/// Pod events scoped to one container through the involved field path.
pub struct ContainerEvents<'a> {
    events: &'a Events,
    name: &'a str,
}

impl ContainerEvents<'_> {
    pub fn original(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|e| event_container_name(e) == Some(self.name))
    }

    fn started_event(&self) -> Option<&Event> {
        self.original().filter(|e| reason(e) == "Started").min_by_key(|e| first_event_timestamp(e))
    }

    pub fn started(&self) -> bool {
        self.started_event().is_some()
    }

    pub fn start_timestamp(&self) -> Option<Timestamp> {
        self.started_event().and_then(first_event_timestamp)
    }
}

/// Joined job and pod event facts; pod signals take precedence.
pub struct ExecutionEvents<'a> {
    pub job: &'a JobEvents,
    pub pod: &'a PodEvents,
}

impl ExecutionEvents<'_> {
    pub fn error(&self) -> bool {
        self.pod.error() || self.job.error()
    }

    pub fn error_reason(&self) -> &str {
        if self.pod.error() { self.pod.error_reason() } else { self.job.error_reason() }
    }

    pub fn error_message(&self) -> &str {
        if self.pod.error() { self.pod.error_message() } else { self.job.error_message() }
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        [self.job.first_timestamp(), self.pod.first_timestamp()].into_iter().flatten().min()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        [self.job.last_timestamp(), self.pod.last_timestamp()].into_iter().flatten().max()
    }
}
