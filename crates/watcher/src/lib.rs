//! Vigil watcher: the execution watcher orchestrating four resource watchers
//! (job, pod, job events, pod events) and reconciling their stores into
//! committed [`ExecutionState`] snapshots.

#![forbid(unsafe_code)]

mod execution;
mod reconcile;

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::{Event, Pod as KubePod};
use vigil_kubehub::{KubeClient, ResourceClient};

pub use execution::ExecutionWatcher;
pub use vigil_state::ExecutionState;
pub use vigil_store::UpdateRx;

/// Read-only cluster clients for the three kinds an execution spans.
#[derive(Clone)]
pub struct ExecutionClients {
    pub jobs: Arc<dyn ResourceClient<KubeJob>>,
    pub pods: Arc<dyn ResourceClient<KubePod>>,
    pub events: Arc<dyn ResourceClient<Event>>,
}

impl ExecutionClients {
    pub fn kube(client: kube::Client, namespace: &str) -> Self {
        Self {
            jobs: Arc::new(KubeClient::<KubeJob>::namespaced(client.clone(), namespace)),
            pods: Arc::new(KubeClient::<KubePod>::namespaced(client.clone(), namespace)),
            events: Arc::new(KubeClient::<Event>::namespaced(client, namespace)),
        }
    }
}
