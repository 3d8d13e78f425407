//! Retry a fallible operation.
//!
//! # Examples
//!
//! ```
//! use futures_conduit::retry::Retry;
//! use futures_conduit::Error;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut calls = 0;
//! let res = Retry::new()
//!     .with_delay(Duration::from_millis(1))
//!     .run(|| {
//!         calls += 1;
//!         let attempt = calls;
//!         async move {
//!             if attempt == 3 {
//!                 Ok(attempt)
//!             } else {
//!                 Err(Error::msg("flaky"))
//!             }
//!         }
//!     })
//!     .await;
//! assert_eq!(res, Ok(3));
//! # }
//! ```

use core::fmt;
use core::future::Future;
use std::time::Duration;

use crate::Error;

/// The number of retries used by [`Retry::new`].
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The delay before the first retry used by [`Retry::new`].
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

type Backoff = Box<dyn Fn(Duration) -> Duration + Send + Sync>;
type FailCallback = Box<dyn Fn(u32, &Error) + Send + Sync>;

/// A retry policy.
///
/// An operation is attempted once, then retried up to `max_retries` more
/// times. Between attempts the policy sleeps; the pause starts at `delay` and
/// is passed through `backoff` after every retry.
pub struct Retry {
    max_retries: u32,
    delay: Duration,
    backoff: Backoff,
    on_fail: FailCallback,
}

impl Retry {
    /// Create a policy with [`DEFAULT_MAX_RETRIES`], [`DEFAULT_DELAY`] and a
    /// constant delay.
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_DELAY,
            backoff: Box::new(|delay| delay),
            on_fail: Box::new(|_, _| {}),
        }
    }

    /// Set how often a failed operation is retried.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the pause before the first retry.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Derive each pause from the previous one.
    pub fn with_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(Duration) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Box::new(backoff);
        self
    }

    /// Call `on_fail` with the 1-based attempt number after every failure.
    pub fn with_fail_callback<F>(mut self, on_fail: F) -> Self
    where
        F: Fn(u32, &Error) + Send + Sync + 'static,
    {
        self.on_fail = Box::new(on_fail);
        self
    }

    /// Call `op` until it succeeds or the retries are used up.
    ///
    /// Returns the first success, or the error of the last attempt.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut delay = self.delay;
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            (self.on_fail)(attempt, &err);
            if attempt > self.max_retries {
                tracing::warn!(attempt, error = %err, "giving up");
                return Err(err);
            }
            tracing::trace!(attempt, ?delay, error = %err, "retrying");
            tokio::time::sleep(delay).await;
            delay = (self.backoff)(delay);
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("max_retries", &self.max_retries)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}
