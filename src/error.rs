//! The error type shared by streams, combinators and collaborators.

use std::any::Any;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::sync::Arc;

/// Errors surfaced by a [`Stream`][crate::stream::Stream] and the helpers built
/// around it.
///
/// `Error` is cheap to clone so that any number of observers can read the same
/// terminal error. Equality compares variants, and compares wrapped errors by
/// identity: two `Error::Other` values are equal only when they came from the
/// same original error.
///
/// # Examples
///
/// ```
/// use futures_conduit::Error;
///
/// let err = Error::msg("disk on fire");
/// assert_eq!(err, err.clone());
/// assert_ne!(err, Error::msg("disk on fire"));
/// assert_eq!(Error::Cancelled, Error::Cancelled);
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The stream was closed by its owner.
    ///
    /// This is what [`Emitter::emit`][crate::stream::Emitter::emit] returns
    /// after `close`. It never becomes a terminal error: a closed stream
    /// terminates cleanly.
    #[error("stream closed")]
    Closed,

    /// The governing token was cancelled without a more specific cause.
    #[error("operation cancelled")]
    Cancelled,

    /// A deadline attached to the governing token expired.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The producer task panicked.
    #[error("producer panicked: {0}")]
    Panicked(Cow<'static, str>),

    /// A circuit breaker short-circuited the call.
    #[error("service is unreachable")]
    Unreachable,

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Any other error, usually returned by producer code.
    #[error(transparent)]
    Other(Arc<dyn StdError + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an arbitrary error.
    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Arc::new(err))
    }

    /// Create an error from a message.
    pub fn msg(msg: impl Into<String>) -> Self {
        let err: Box<dyn StdError + Send + Sync + 'static> = msg.into().into();
        Self::Other(Arc::from(err))
    }

    /// Returns `true` if this error is a cancellation cause rather than a
    /// failure of the work itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Cancelled | Self::DeadlineExceeded
        )
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = match payload.downcast::<&'static str>() {
            Ok(msg) => Cow::Borrowed(*msg),
            Err(payload) => match payload.downcast::<String>() {
                Ok(msg) => Cow::Owned(*msg),
                Err(_) => Cow::Borrowed("Box<dyn Any>"),
            },
        };
        Self::Panicked(msg)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Closed, Self::Closed)
            | (Self::Cancelled, Self::Cancelled)
            | (Self::DeadlineExceeded, Self::DeadlineExceeded)
            | (Self::Unreachable, Self::Unreachable) => true,
            (Self::Panicked(a), Self::Panicked(b)) => a == b,
            (Self::InvalidConfig(a), Self::InvalidConfig(b)) => a == b,
            (Self::Other(a), Self::Other(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Error {}
