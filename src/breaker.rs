//! A circuit breaker.
//!
//! A [`Breaker`] wraps a request handler and counts its consecutive failures.
//! Once the count exceeds a threshold the circuit opens: calls fail right away
//! with an "unreachable" error until a break delay has passed since the last
//! real attempt. The next call after that goes through to the handler again,
//! and a success closes the circuit.
//!
//! # Examples
//!
//! ```
//! use futures_conduit::breaker::{Breaker, BreakerOptions};
//! use futures_conduit::Error;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let options = BreakerOptions::new().with_failure_threshold(1);
//! let breaker = Breaker::with_options(
//!     |_: ()| async { Err::<(), _>(Error::msg("offline")) },
//!     options,
//! );
//!
//! assert!(breaker.call(()).await.is_err());
//! assert!(breaker.call(()).await.is_err());
//! assert_eq!(breaker.call(()).await, Err(Error::Unreachable));
//! # }
//! ```

use core::fmt;
use core::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_lite::future::Boxed;
use futures_lite::FutureExt as _;
use tokio::time::Instant;

use crate::Error;

/// Details passed to the break callback when a call is short-circuited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trip {
    /// Consecutive failures beyond the threshold.
    pub failures: u32,
    /// When the handler was last called.
    pub last_attempt: Instant,
    /// When the handler will be called again.
    pub retry_at: Instant,
}

type OnBreak = Arc<dyn Fn(&Trip) + Send + Sync>;

/// Settings for a [`Breaker`].
#[derive(Clone)]
pub struct BreakerOptions {
    failure_threshold: u32,
    unreachable: Error,
    break_delay: Duration,
    on_break: OnBreak,
}

impl BreakerOptions {
    /// Default settings: a threshold of 10 failures, a 2 second break and
    /// [`Error::Unreachable`] for short-circuited calls.
    pub fn new() -> Self {
        Self {
            failure_threshold: 10,
            unreachable: Error::Unreachable,
            break_delay: Duration::from_secs(2),
            on_break: Arc::new(|_| {}),
        }
    }

    /// The number of consecutive failures tolerated before the circuit opens.
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    /// The error returned while the circuit is open.
    pub fn with_unreachable(mut self, unreachable: Error) -> Self {
        self.unreachable = unreachable;
        self
    }

    /// How long the circuit stays open after the last attempt.
    pub fn with_break_delay(mut self, break_delay: Duration) -> Self {
        self.break_delay = break_delay;
        self
    }

    /// Called every time a call is short-circuited.
    pub fn with_on_break<F>(mut self, on_break: F) -> Self
    where
        F: Fn(&Trip) + Send + Sync + 'static,
    {
        self.on_break = Arc::new(on_break);
        self
    }
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BreakerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerOptions")
            .field("failure_threshold", &self.failure_threshold)
            .field("unreachable", &self.unreachable)
            .field("break_delay", &self.break_delay)
            .finish_non_exhaustive()
    }
}

type Handle<Req, Resp> = dyn Fn(Req) -> Boxed<Result<Resp, Error>> + Send + Sync;

/// A request handler guarded by a circuit breaker.
pub struct Breaker<Req, Resp> {
    handle: Box<Handle<Req, Resp>>,
    options: BreakerOptions,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    failures: u32,
    last_attempt: Instant,
}

impl<Req, Resp> Breaker<Req, Resp> {
    /// Guard `handle` with the default [`BreakerOptions`].
    pub fn new<H, Fut>(handle: H) -> Self
    where
        H: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
    {
        Self::with_options(handle, BreakerOptions::new())
    }

    /// Guard `handle` with custom options.
    pub fn with_options<H, Fut>(handle: H, options: BreakerOptions) -> Self
    where
        H: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
    {
        Self {
            handle: Box::new(move |req| handle(req).boxed()),
            options,
            state: Mutex::new(State {
                failures: 0,
                last_attempt: Instant::now(),
            }),
        }
    }

    /// Call the handler, unless the circuit is open.
    pub async fn call(&self, req: Req) -> Result<Resp, Error> {
        if let Some(trip) = self.tripped() {
            tracing::warn!(
                failures = trip.failures,
                retry_in = ?trip.retry_at.saturating_duration_since(Instant::now()),
                "circuit open, short-circuiting call"
            );
            (self.options.on_break)(&trip);
            return Err(self.options.unreachable.clone());
        }

        let res = (self.handle)(req).await;

        let mut state = self.lock_state();
        state.last_attempt = Instant::now();
        match res {
            Ok(_) => state.failures = 0,
            Err(_) => state.failures = state.failures.saturating_add(1),
        }
        res
    }

    /// The number of consecutive failed calls.
    pub fn failures(&self) -> u32 {
        self.lock_state().failures
    }

    fn tripped(&self) -> Option<Trip> {
        let state = self.lock_state();
        let failures = state.failures.saturating_sub(self.options.failure_threshold);
        if failures == 0 {
            return None;
        }
        let retry_at = state.last_attempt + self.options.break_delay;
        if Instant::now() > retry_at {
            return None;
        }
        Some(Trip {
            failures,
            last_attempt: state.last_attempt,
            retry_at,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<Req, Resp> fmt::Debug for Breaker<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breaker")
            .field("options", &self.options)
            .field("state", &*self.lock_state())
            .finish_non_exhaustive()
    }
}
