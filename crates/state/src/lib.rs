//! Vigil state: live-object views, Event Facts and the reconciled
//! `ExecutionState` built from whatever subset of them is available.

#![forbid(unsafe_code)]

pub mod events;
pub mod job;
pub mod pod;
pub mod state;

pub use events::{ContainerEvents, ExecutionEvents, JobEvents, PodEvents};
pub use job::Job;
pub use pod::Pod;
pub use state::ExecutionState;
