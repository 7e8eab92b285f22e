//! Vigil kubehub: the read-only cluster client contract, per-kind watch
//! capabilities, and the generic list-then-watch resource watcher.

#![forbid(unsafe_code)]

pub mod client;
pub mod kinds;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod watcher;

pub use client::{ClientError, KubeClient, ListOptions, ResourceClient, ResourceList, WatchItem, WatchStream};
pub use kinds::{Timestamp, WatchedKind};
pub use watcher::{Listener, ResourceWatcher};

pub use k8s_openapi::api::batch::v1::Job;
pub use k8s_openapi::api::core::v1::{Event, Pod};
