//! Cancellation context
//!
//! Every blocking operation of the proxy takes a [`Context`]: a cancellation
//! token plus an optional deadline. Children inherit both, so cancelling the
//! owner of a proxy cascades through every session and upstream call it made.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{ProxyError, Result};

/// Cancellation token with an optional deadline
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context that is never cancelled unless [`Context::cancel`] is called
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a context that is cancelled together with `self`
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child context whose deadline is at most `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) if parent < deadline => parent,
                _ => deadline,
            }),
        }
    }

    /// Cancel this context and all of its children
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Deadline of this context, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context was cancelled or its deadline has passed
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolve once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Reason reported when the context ends an operation
    fn reason(&self) -> String {
        if self.token.is_cancelled() {
            "context cancelled".to_string()
        } else {
            "deadline exceeded".to_string()
        }
    }

    /// Run `fut` bound to this context
    ///
    /// Returns [`ProxyError::Cancelled`] if the context ends first; `fut` is
    /// dropped in that case.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_done() {
            return Err(ProxyError::Cancelled(self.reason()));
        }

        tokio::select! {
            biased;
            _ = self.done() => Err(ProxyError::Cancelled(self.reason())),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_cascades_to_children() {
        let parent = Context::background();
        let child = parent.child();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        assert!(!grandchild.is_done());
        parent.cancel();
        assert!(child.is_done());
        assert!(grandchild.is_done());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_running() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test]
    async fn test_deadline_aborts_future() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result {
            Err(ProxyError::Cancelled(reason)) => assert_eq!(reason, "deadline exceeded"),
            other => panic!("Expected cancellation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_child_deadline_never_exceeds_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_run_completes_before_cancel() {
        let ctx = Context::background();
        let value = ctx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
