//! Cancellation-safe producer streams for async Rust.
//!
//! A [`Stream`] runs a producer as its own task and hands the values it emits
//! to a consumer. Streams can be closed any number of times from anywhere,
//! report exactly one terminal error, and never deliver a value after they were
//! observed to be closed. Two combinators build new streams out of existing
//! ones:
//!
//! - [`Stream::buffer`]: Groups consecutive items into fixed-size batches.
//! - [`Joiner`]: Merges several streams, failing fast on the first error.
//!
//! # Examples
//!
//! Merge two producers, batch their output, and stop everything when one
//! fails:
//!
//! ```rust
//! use futures_conduit::prelude::*;
//! use futures_conduit::{Error, Stream};
//! use futures_lite::StreamExt;
//! use std::num::NonZeroUsize;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let numbers = Stream::new(|_, out| async move {
//!     let mut n = 0;
//!     loop {
//!         out.emit(n).await?;
//!         n += 1;
//!     }
//! });
//! let broken: Stream<u64> = Stream::new(|_, _| async { Err(Error::msg("offline")) });
//!
//! let batches = [numbers, broken]
//!     .join()
//!     .stream()
//!     .buffer(NonZeroUsize::new(8).unwrap());
//!
//! let mut data = batches.data();
//! while let Some(batch) = data.next().await {
//!     assert!(batch.len() <= 8);
//! }
//! assert_eq!(batches.err().await.unwrap_err().to_string(), "offline");
//! # }
//! ```
//!
//! # Runtime
//!
//! Producers run on [Tokio](https://tokio.rs): creating a stream outside of a
//! Tokio runtime panics.
//!
//! # Collaborators
//!
//! Behind default-enabled features the crate also ships the helpers batch
//! pipelines usually need around their streams:
//!
//! - [`batch`]: Chunked index ranges and a concurrent batch runner.
//! - [`retry`]: Retry a fallible operation with backoff.
//! - [`breaker`]: A circuit breaker for flaky services.

#![deny(missing_debug_implementations, nonstandard_style)]
#![warn(missing_docs, unreachable_pub)]

mod cancel;
mod error;
mod utils;

/// The futures conduit prelude.
pub mod prelude {
    pub use super::stream::Join as _;
}

pub mod stream;

#[cfg(feature = "batch")]
pub mod batch;
#[cfg(feature = "breaker")]
pub mod breaker;
#[cfg(feature = "retry")]
pub mod retry;

pub use cancel::{CancelToken, Cancelled};
pub use error::Error;
pub use stream::{Data, Emitter, Joiner, Stream};
