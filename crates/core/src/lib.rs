//! Vigil core types: one-shot latches, cause-carrying cancellation, the error
//! taxonomy shared by watchers and state, runtime configuration and the
//! label/annotation schema stamped on execution resources.

#![forbid(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod error;
pub mod latch;
pub mod schema;

pub use cancel::CauseToken;
pub use config::{BackoffConfig, WatcherConfig};
pub use error::{DataError, WatchError};
pub use latch::{Latch, LatchHandle};
pub use schema::{ActionGroups, ExecutionStateOptions, InternalConfig, Signature};

pub mod prelude {
    pub use super::{
        ActionGroups, CauseToken, DataError, ExecutionStateOptions, InternalConfig, Latch, LatchHandle,
        Signature, WatchError, WatcherConfig,
    };
}
