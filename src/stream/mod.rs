//! Cancellation-aware producer streams.
//!
//! A [`Stream`] runs a producer function as its own task and hands the values
//! it emits to a consumer, one at a time. Unlike a bare channel a stream
//! remembers *why* it ended: [`Stream::err`] reports whether the producer
//! finished cleanly, failed, or was cancelled.
//!
//! # Examples
//!
//! ```
//! use futures_conduit::Stream;
//! use futures_lite::StreamExt;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let stream = Stream::new(|_token, out| async move {
//!     for n in 1..=3 {
//!         out.emit(n).await?;
//!     }
//!     Ok(())
//! });
//!
//! let items: Vec<_> = stream.data().collect().await;
//! assert_eq!(items, [1, 2, 3]);
//! assert!(stream.err().await.is_ok());
//! # }
//! ```
//!
//! # Combinators
//!
//! Streams compose: [`Stream::buffer`] groups items into fixed-size batches,
//! and [`Joiner`] merges several streams into one. Both return a new
//! `Stream` which owns, and closes, the streams it was built from.
//!
//! | Name        | Output          | When does it fail? |
//! | ---         | ---             | ---                |
//! | `buffer`    | `Vec<T>`        | When the source fails. The partial group is dropped.
//! | `Joiner`    | `T`             | On the first source that fails. The other sources are closed.
//!
//! # Cancellation
//!
//! Every stream owns a [`CancelToken`] derived from the token it was created
//! with. The stream starts cancelling when [`Stream::close`] is called, when
//! the parent token fires, or when the producer returns. Once cancelling,
//! [`Emitter::emit`] fails and the producer is expected to return. This is
//! cooperative: a producer which neither emits nor watches its token keeps
//! `close` waiting.

use core::fmt;
use core::future::Future;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_core::stream::FusedStream;
use futures_lite::{FutureExt as _, StreamExt as _};
use tokio_util::sync::CancellationToken;

use crate::utils::Channel;
use crate::{CancelToken, Error};

pub use join::{Join, Joiner};

mod buffer;
mod join;

/// A sequence of values produced by a concurrently running task.
///
/// Created with [`Stream::new`] or one of the combinators. The producer starts
/// running right away; the values are read through [`Stream::data`].
///
/// Dropping a `Stream` requests close without waiting for the producer to
/// exit. Call [`Stream::close`] or [`Stream::err`] to wait for it.
#[must_use = "a `Stream` should be drained, closed, or checked with `err`"]
pub struct Stream<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    channel: Channel<T>,
    token: CancelToken,
    terminal: OnceLock<Result<(), Error>>,
    exited: CancellationToken,
}

impl<T> Stream<T>
where
    T: Send + 'static,
{
    /// Start `producer` on a new task and return the stream of values it
    /// emits.
    ///
    /// The producer receives the stream's own [`CancelToken`] and an
    /// [`Emitter`]. Its return value becomes the stream's terminal error
    /// unless the stream was cancelled first.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(CancelToken, Emitter<T>) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        Self::with_token(&CancelToken::new(), producer)
    }

    /// Like [`Stream::new`], but the stream is also cancelled when `parent`
    /// is. The parent's cause becomes the stream's terminal error.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn with_token<F, Fut>(parent: &CancelToken, producer: F) -> Self
    where
        F: FnOnce(CancelToken, Emitter<T>) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            channel: Channel::new(),
            token: parent.child(),
            terminal: OnceLock::new(),
            exited: CancellationToken::new(),
        });
        let work = producer(
            shared.token.clone(),
            Emitter {
                shared: shared.clone(),
            },
        );
        tracing::trace!("spawning stream producer");
        tokio::spawn(supervise(shared.clone(), work));
        Self { shared }
    }

    /// Create a stream which emits every item of `items`, then ends cleanly.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let items = items.into_iter();
        Self::new(move |_, out| async move {
            for item in items {
                out.emit(item).await?;
            }
            Ok(())
        })
    }

    /// Drain the stream and return every item, or the terminal error.
    pub async fn collect(self) -> Result<Vec<T>, Error> {
        let items = self.data().collect().await;
        self.err().await?;
        Ok(items)
    }
}

impl<T> Stream<T> {
    /// The values emitted by the producer.
    ///
    /// Every call returns a handle to the same underlying channel: items are
    /// handed out once, to whichever handle polls first. The sequence ends
    /// once the stream starts cancelling.
    pub fn data(&self) -> Data<T> {
        Data {
            shared: self.shared.clone(),
            key: None,
        }
    }

    /// Request cancellation and wait until the producer has exited.
    ///
    /// Safe to call any number of times, from any number of tasks. A stream
    /// closed this way terminates cleanly: [`Stream::err`] returns `Ok(())`
    /// unless the stream had already failed or been cancelled.
    ///
    /// Waits for as long as the producer takes to notice; see the
    /// [module-level documentation](self#cancellation).
    pub async fn close(&self) {
        self.shared.close();
        self.shared.exited.cancelled().await;
    }

    /// Like [`Stream::close`], but gives up waiting after `timeout`.
    ///
    /// Returns [`Error::DeadlineExceeded`] if the producer did not exit in
    /// time. Cancellation is requested either way.
    pub async fn close_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.shared.close();
        tokio::time::timeout(timeout, self.shared.exited.cancelled())
            .await
            .map_err(|_| Error::DeadlineExceeded)
    }

    /// Wait until the stream has terminated and return its terminal error.
    pub async fn err(&self) -> Result<(), Error> {
        self.shared.exited.cancelled().await;
        match self.shared.terminal.get() {
            Some(terminal) => terminal.clone(),
            None => Ok(()),
        }
    }

    /// Returns `true` once the producer has exited.
    pub fn is_terminated(&self) -> bool {
        self.shared.exited.is_cancelled()
    }

    /// The stream's own cancellation token.
    ///
    /// Useful as the parent of streams which should not outlive this one.
    pub fn token(&self) -> &CancelToken {
        &self.shared.token
    }

    /// Request cancellation without waiting.
    pub(crate) fn request_close(&self) {
        self.shared.close();
    }
}

impl<T> Drop for Stream<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("is_cancelled", &self.shared.token.is_cancelled())
            .field("is_terminated", &self.is_terminated())
            .finish()
    }
}

impl<T> Shared<T> {
    fn close(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("closing stream");
        }
        self.token.cancel_with_cause(Error::Closed);
        self.channel.close();
    }

    /// Pick the terminal error once the producer has returned.
    ///
    /// A cancellation which started before the producer returned wins over
    /// whatever the producer returned. An owner close is a clean exit.
    fn resolve(&self, outcome: Result<(), Error>) -> Result<(), Error> {
        if self.token.is_cancelled() {
            return match self.token.cause() {
                Some(Error::Closed) | None => Ok(()),
                Some(cause) => Err(cause),
            };
        }
        self.token.cancel_with_cause(Error::Closed);
        outcome
    }
}

async fn supervise<T, Fut>(shared: Arc<Shared<T>>, work: Fut)
where
    Fut: Future<Output = Result<(), Error>>,
{
    let work = AssertUnwindSafe(work).catch_unwind();
    futures_lite::pin!(work);

    let outcome = tokio::select! {
        outcome = &mut work => outcome,
        _ = shared.token.cancelled() => {
            tracing::debug!(cause = ?shared.token.cause(), "stream cancelling");
            shared.channel.close();
            (&mut work).await
        }
    };
    let outcome = outcome.unwrap_or_else(|payload| {
        let err = Error::from_panic(payload);
        tracing::warn!(error = %err, "stream producer panicked");
        Err(err)
    });

    let terminal = shared.resolve(outcome);
    shared.channel.close();
    tracing::trace!(?terminal, "stream terminated");
    let _ = shared.terminal.set(terminal);
    shared.exited.cancel();
}

/// The values of a [`Stream`].
///
/// This `struct` is created by the [`data`] method on [`Stream`]. See its
/// documentation for more.
///
/// [`data`]: Stream::data
#[must_use = "streams do nothing unless polled"]
pub struct Data<T> {
    shared: Arc<Shared<T>>,
    key: Option<usize>,
}

impl<T> futures_core::Stream for Data<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        // Nothing is handed out once cancellation has started, even if the
        // channel has not been closed yet.
        if this.shared.token.is_cancelled() {
            this.shared.channel.release_receiver(&mut this.key);
            return Poll::Ready(None);
        }
        this.shared.channel.poll_recv(&mut this.key, cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.shared.token.is_cancelled() {
            (0, Some(0))
        } else {
            (0, None)
        }
    }
}

impl<T> FusedStream for Data<T> {
    fn is_terminated(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

impl<T> Drop for Data<T> {
    fn drop(&mut self) {
        self.shared.channel.release_receiver(&mut self.key);
    }
}

impl<T> fmt::Debug for Data<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("is_closed", &self.shared.channel.is_closed())
            .finish()
    }
}

/// The producer's end of a [`Stream`].
///
/// Handed to the producer function by [`Stream::new`]. Clones emit into the
/// same stream.
pub struct Emitter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Emitter<T> {
    /// Hand `item` to the consumer.
    ///
    /// Waits until a consumer took the item. Once the stream is cancelling
    /// the item is dropped and the cancellation cause is returned instead:
    /// [`Error::Closed`] if the owner closed the stream, the parent's cause
    /// otherwise. Producers should return that error, typically with `?`.
    pub async fn emit(&self, item: T) -> Result<(), Error> {
        let token = &self.shared.token;
        if token.is_cancelled() {
            return Err(token.reason());
        }
        tokio::select! {
            biased;
            sent = self.shared.channel.send(item) => sent.map_err(|_| token.reason()),
            _ = token.cancelled() => Err(token.reason()),
        }
    }

    /// Returns `true` once the stream started cancelling.
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// The stream's cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.shared.token
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}
