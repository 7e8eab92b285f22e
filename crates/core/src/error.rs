//! Error taxonomy shared by the watchers and the execution state.

use thiserror::Error;

/// Why a resource watcher (or the whole execution watcher) stopped.
///
/// `Done` is the clean terminal sentinel, not a failure. Callers checking for
/// real errors filter it out with [`WatchError::is_done`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("resource is done")]
    Done,
    #[error("found more than one {kind} for selected criteria: {names}")]
    Ambiguous { kind: &'static str, names: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("too many consecutive watch failures ({failures}): {last}")]
    TooManyFailures { failures: u32, last: String },
    #[error("context cancelled")]
    Cancelled,
}

impl WatchError {
    pub fn is_done(&self) -> bool {
        matches!(self, WatchError::Done)
    }

    /// Configuration errors: retrying the same selector can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WatchError::Ambiguous { .. })
    }
}

/// Failure to produce data derived from resource annotations or static hints.
///
/// Both variants mean "not available yet"; callers retry on a later state
/// instead of treating them as execution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("missing data to fulfill request")]
    MissingData,
    #[error("missing data to fulfill request: {annotation}: {reason}")]
    Undecodable { annotation: &'static str, reason: String },
}

impl DataError {
    pub fn undecodable(annotation: &'static str, err: impl std::fmt::Display) -> Self {
        DataError::Undecodable { annotation, reason: err.to_string() }
    }

    pub fn is_missing_data(&self) -> bool {
        matches!(self, DataError::MissingData | DataError::Undecodable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguity_message_lists_names() {
        let e = WatchError::Ambiguous { kind: "job", names: "a, b".into() };
        assert_eq!(e.to_string(), "found more than one job for selected criteria: a, b");
        assert!(e.is_fatal());
        assert!(!e.is_done());
    }

    #[test]
    fn done_is_not_fatal() {
        assert!(WatchError::Done.is_done());
        assert!(!WatchError::Done.is_fatal());
        assert_eq!(WatchError::Done.to_string(), "resource is done");
    }

    #[test]
    fn undecodable_counts_as_missing_data() {
        let e = DataError::undecodable("signature", "expected value at line 1");
        assert!(e.is_missing_data());
        assert!(e.to_string().starts_with("missing data to fulfill request"));
    }
}
