//! Hierarchical cancellation carrying a cause.
//!
//! A [`CancelToken`] is the signal a stream uses to learn that it must stop.
//! Tokens form a tree: cancelling a token cancels every token derived from it
//! with [`CancelToken::child`], but never its parent. Every cancellation
//! carries a cause, an [`Error`] which streams report as their terminal error.

use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pin_project::pin_project;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::Error;

/// A cancellation signal with a cause.
///
/// Cloning a token yields another handle to the same signal.
///
/// # Examples
///
/// ```
/// use futures_conduit::{CancelToken, Error};
///
/// let parent = CancelToken::new();
/// let child = parent.child();
///
/// parent.cancel_with_cause(Error::msg("shutting down"));
/// assert!(child.is_cancelled());
/// assert_eq!(child.cause(), parent.cause());
/// ```
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    cause: Mutex<Option<Error>>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// Create a new root token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cause: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Create a token which is cancelled whenever `self` is.
    ///
    /// Cancelling the child leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: Mutex::new(None),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Create a child token which cancels itself with
    /// [`Error::DeadlineExceeded`] once `timeout` has elapsed.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    tracing::debug!(?timeout, "deadline exceeded");
                    timer.cancel_with_cause(Error::DeadlineExceeded);
                }
            }
        });
        child
    }

    /// Cancel the token with [`Error::Cancelled`] as the cause.
    pub fn cancel(&self) {
        self.cancel_with_cause(Error::Cancelled);
    }

    /// Cancel the token with the given cause.
    ///
    /// Only the first cancellation sets the cause; later calls, including
    /// calls made after an ancestor was cancelled, are no-ops.
    pub fn cancel_with_cause(&self, cause: Error) {
        {
            let mut slot = self.inner.lock_cause();
            if slot.is_none() && !self.inner.token.is_cancelled() {
                *slot = Some(cause);
            }
        }
        self.inner.token.cancel();
    }

    /// Returns `true` once the token, or any of its ancestors, was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The cause of the cancellation, or `None` while the token is live.
    ///
    /// A token cancelled through an ancestor reports the ancestor's cause.
    /// Once observed, the cause never changes.
    pub fn cause(&self) -> Option<Error> {
        if !self.is_cancelled() {
            return None;
        }
        let mut slot = self.inner.lock_cause();
        if slot.is_none() {
            let inherited = match &self.inner.parent {
                Some(parent) => parent.cause(),
                None => None,
            };
            *slot = Some(inherited.unwrap_or(Error::Cancelled));
        }
        slot.clone()
    }

    /// Wait until the token is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            inner: self.inner.token.clone().cancelled_owned(),
        }
    }

    /// The cause, falling back to [`Error::Cancelled`] for a live token.
    pub(crate) fn reason(&self) -> Error {
        self.cause().unwrap_or(Error::Cancelled)
    }
}

impl Inner {
    fn lock_cause(&self) -> MutexGuard<'_, Option<Error>> {
        self.cause.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}

/// Future returned by [`CancelToken::cancelled`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project]
pub struct Cancelled {
    #[pin]
    inner: WaitForCancellationFutureOwned,
}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelled").finish()
    }
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}
