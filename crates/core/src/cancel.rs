//! Cancellation token carrying the reason it was cancelled.
//!
//! Distinguishes "cancelled because the resource is done" from "cancelled
//! because something failed" at every consumer, including descendants that
//! were cancelled through their parent.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::WatchError;

#[derive(Debug, Clone)]
pub struct CauseToken {
    token: CancellationToken,
    /// Own slot first, then the ancestors' slots, nearest first.
    causes: Vec<Arc<OnceLock<WatchError>>>,
}

impl Default for CauseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CauseToken {
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), causes: vec![Arc::new(OnceLock::new())] }
    }

    /// Derive a token that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        let mut causes = Vec::with_capacity(self.causes.len() + 1);
        causes.push(Arc::new(OnceLock::new()));
        causes.extend(self.causes.iter().cloned());
        Self { token: self.token.child_token(), causes }
    }

    /// Cancel with `cause`. Only the first cause is kept; cancelling an
    /// already cancelled token is a no-op.
    pub fn cancel(&self, cause: WatchError) {
        if self.token.is_cancelled() {
            return;
        }
        if let Some(own) = self.causes.first() {
            let _ = own.set(cause);
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `None` while running; otherwise the own cause, the nearest ancestor's
    /// cause, or `Cancelled` when nobody recorded one.
    pub fn cause(&self) -> Option<WatchError> {
        if !self.token.is_cancelled() {
            return None;
        }
        let recorded = self.causes.iter().find_map(|slot| slot.get().cloned());
        Some(recorded.unwrap_or(WatchError::Cancelled))
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Owned future resolving on cancellation, for handing to other tasks.
    pub fn done(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.token.clone();
        async move { token.cancelled().await }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_token_has_no_cause() {
        let t = CauseToken::new();
        assert!(!t.is_cancelled());
        assert_eq!(t.cause(), None);
    }

    #[test]
    fn first_cause_wins() {
        let t = CauseToken::new();
        t.cancel(WatchError::Done);
        t.cancel(WatchError::Transport("boom".into()));
        assert_eq!(t.cause(), Some(WatchError::Done));
    }

    #[test]
    fn child_inherits_parent_cause() {
        let parent = CauseToken::new();
        let child = parent.child();
        parent.cancel(WatchError::Transport("conn reset".into()));
        assert!(child.is_cancelled());
        assert_eq!(child.cause(), Some(WatchError::Transport("conn reset".into())));
    }

    #[test]
    fn child_cause_does_not_leak_upwards() {
        let parent = CauseToken::new();
        let child = parent.child();
        child.cancel(WatchError::Done);
        assert!(!parent.is_cancelled());
        assert_eq!(child.cause(), Some(WatchError::Done));
    }

    #[test]
    fn plain_cancellation_reports_cancelled() {
        let parent = CauseToken::new();
        let grandchild = parent.child().child();
        parent.token.cancel();
        assert_eq!(grandchild.cause(), Some(WatchError::Cancelled));
    }

    #[tokio::test]
    async fn done_future_resolves() {
        let t = CauseToken::new();
        let fut = t.done();
        t.cancel(WatchError::Done);
        tokio::time::timeout(std::time::Duration::from_secs(1), fut).await.expect("not cancelled");
    }
}
