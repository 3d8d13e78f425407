//! Split index ranges into chunks and run requests over them.
//!
//! [`Batch`] hands out consecutive chunks of a half-open range from any number
//! of threads. [`Handler`] pulls requests from such a source and runs them
//! either one after another or on several concurrent workers.
//!
//! # Examples
//!
//! ```
//! use futures_conduit::batch::{Batch, Handler};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let data: Arc<Vec<u32>> = Arc::new((1..=10).collect());
//! let batch = Batch::new(0, data.len(), 3);
//!
//! let handler = Handler::new(
//!     |chunk: Vec<u32>| async move { Ok(chunk.iter().sum::<u32>()) },
//!     move || {
//!         let chunk = batch.advance()?;
//!         Some((data[chunk.range].to_vec(), chunk.is_last))
//!     },
//! );
//!
//! let sums = handler.run(1).await.unwrap();
//! assert_eq!(sums, [6, 15, 24, 10]);
//! # }
//! ```

use core::fmt;
use core::future::Future;
use core::ops::Range;
use std::borrow::Cow;
use std::sync::{Arc, Mutex, PoisonError};

use futures_lite::future::Boxed;
use futures_lite::FutureExt as _;

use crate::stream::Joiner;
use crate::{CancelToken, Error, Stream};

/// A thread-safe cursor over the chunks of a half-open range.
///
/// Every chunk is `size` long except the last one, which is clipped to the end
/// of the range.
pub struct Batch {
    cursor: Mutex<Cursor>,
}

#[derive(Debug)]
struct Cursor {
    next: usize,
    end: usize,
    size: usize,
}

/// One chunk handed out by [`Batch::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The indices covered by this chunk.
    pub range: Range<usize>,
    /// `true` for the final chunk of the range.
    pub is_last: bool,
}

impl Batch {
    /// Chunk `[from, to)` into pieces of `size`.
    ///
    /// A `size` of zero, or an empty range, yields no chunks at all.
    pub fn new(from: usize, to: usize, size: usize) -> Self {
        Self {
            cursor: Mutex::new(Cursor {
                next: from,
                end: to,
                size,
            }),
        }
    }

    /// Take the next chunk, or `None` once the range is exhausted.
    pub fn advance(&self) -> Option<Chunk> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if cursor.size == 0 || cursor.next >= cursor.end {
            return None;
        }
        let start = cursor.next;
        let stop = start.saturating_add(cursor.size);
        cursor.next = stop;
        Some(Chunk {
            range: start..stop.min(cursor.end),
            is_last: stop >= cursor.end,
        })
    }
}

impl Iterator for &Batch {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        self.advance()
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Batch")
            .field("next", &cursor.next)
            .field("end", &cursor.end)
            .field("size", &cursor.size)
            .finish()
    }
}

/// Validated settings for a batched run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    batch_size: usize,
    workers: usize,
}

impl Config {
    /// Create a config, rejecting a zero batch size or worker count.
    pub fn new(batch_size: usize, workers: usize) -> Result<Self, Error> {
        if workers == 0 {
            return Err(invalid("worker count must be greater than 0"));
        }
        if batch_size == 0 {
            return Err(invalid("batch size must be greater than 0"));
        }
        Ok(Self {
            batch_size,
            workers,
        })
    }

    /// The number of indices per request.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The number of concurrent workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Chunk `range` by this config's batch size.
    pub fn batch(&self, range: Range<usize>) -> Batch {
        Batch::new(range.start, range.end, self.batch_size)
    }
}

fn invalid(msg: &'static str) -> Error {
    Error::InvalidConfig(Cow::Borrowed(msg))
}

type Handle<Req, Resp> = dyn Fn(Req) -> Boxed<Result<Resp, Error>> + Send + Sync;
type Next<Req> = dyn Fn() -> Option<(Req, bool)> + Send + Sync;

/// Runs a request handler over every request of a source.
///
/// The source returns the next request together with a flag marking the last
/// one, or `None` once it is exhausted. It is shared between workers and must
/// be safe to call concurrently; a [`Batch`] is.
pub struct Handler<Req, Resp> {
    handle: Arc<Handle<Req, Resp>>,
    next: Arc<Next<Req>>,
    token: CancelToken,
}

impl<Req, Resp> Handler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Create a handler calling `handle` for every request `next` yields.
    pub fn new<H, Fut, N>(handle: H, next: N) -> Self
    where
        H: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Error>> + Send + 'static,
        N: Fn() -> Option<(Req, bool)> + Send + Sync + 'static,
    {
        Self {
            handle: Arc::new(move |req| handle(req).boxed()),
            next: Arc::new(next),
            token: CancelToken::new(),
        }
    }

    /// Stop running requests once `parent` is cancelled.
    pub fn with_token(mut self, parent: &CancelToken) -> Self {
        self.token = parent.clone();
        self
    }

    /// Run every request, concurrently when `workers` is greater than one.
    pub async fn run(&self, workers: usize) -> Result<Vec<Resp>, Error> {
        if workers > 1 {
            self.run_concurrent(workers).await
        } else {
            self.run_serial().await
        }
    }

    /// Run the requests one after another.
    ///
    /// Responses are returned in request order. The first failure stops the
    /// run.
    pub async fn run_serial(&self) -> Result<Vec<Resp>, Error> {
        let mut responses = Vec::new();
        while let Some((req, is_last)) = (self.next)() {
            let resp = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(self.token.reason()),
                resp = (self.handle)(req) => resp?,
            };
            responses.push(resp);
            if is_last {
                break;
            }
        }
        Ok(responses)
    }

    /// Run the requests on `workers` concurrent workers.
    ///
    /// Responses come back in no particular order. The first failing request
    /// fails the whole run and stops the other workers.
    pub async fn run_concurrent(&self, workers: usize) -> Result<Vec<Resp>, Error> {
        if workers == 0 {
            return Err(invalid("worker count must be greater than 0"));
        }
        tracing::debug!(workers, "running batch concurrently");
        let joiner: Joiner<Resp> = (0..workers).map(|_| self.worker()).collect();
        joiner.stream_with_token(&self.token).collect().await
    }

    fn worker(&self) -> Stream<Resp> {
        let handle = self.handle.clone();
        let next = self.next.clone();
        Stream::new(move |token, out| async move {
            while let Some((req, is_last)) = next() {
                let resp = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(token.reason()),
                    resp = handle(req) => resp?,
                };
                out.emit(resp).await?;
                if is_last {
                    break;
                }
            }
            Ok(())
        })
    }
}

impl<Req, Resp> fmt::Debug for Handler<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunks(from: usize, to: usize, size: usize) -> Vec<Range<usize>> {
        Batch::new(from, to, size).map(|chunk| chunk.range).collect()
    }

    fn summing(data: Vec<i32>, size: usize) -> Handler<Vec<i32>, i32> {
        let batch = Batch::new(0, data.len(), size);
        Handler::new(
            |req: Vec<i32>| async move { Ok(req.iter().sum()) },
            move || {
                let chunk = batch.advance()?;
                Some((data[chunk.range].to_vec(), chunk.is_last))
            },
        )
    }

    #[test]
    fn chunking() {
        let none: Vec<Range<usize>> = vec![];
        assert_eq!(chunks(0, 0, 2), none);
        assert_eq!(chunks(0, 10, 0), none);
        assert_eq!(chunks(4, 3, 1), none);
        assert_eq!(chunks(0, 10, 2), vec![0..2, 2..4, 4..6, 6..8, 8..10]);
        assert_eq!(chunks(0, 10, 3), vec![0..3, 3..6, 6..9, 9..10]);
        assert_eq!(chunks(0, 10, 30), vec![0..10]);
        assert_eq!(chunks(53, 73, 17), vec![53..70, 70..73]);
    }

    #[test]
    fn only_the_final_chunk_is_last() {
        let batch = Batch::new(0, 5, 2);
        let flags: Vec<_> = (&batch).map(|chunk| chunk.is_last).collect();
        assert_eq!(flags, [false, false, true]);
        assert_eq!(batch.advance(), None);
    }

    #[test]
    fn huge_size_does_not_overflow() {
        let batch = Batch::new(usize::MAX - 1, usize::MAX, usize::MAX);
        assert_eq!(
            batch.advance(),
            Some(Chunk {
                range: usize::MAX - 1..usize::MAX,
                is_last: true,
            })
        );
        assert_eq!(batch.advance(), None);
    }

    #[test]
    fn config_validation() {
        assert!(Config::new(10, 7).is_ok());
        assert!(Config::new(10, 1).is_ok());
        assert!(matches!(Config::new(10, 0), Err(Error::InvalidConfig(_))));
        assert!(matches!(Config::new(0, 3), Err(Error::InvalidConfig(_))));

        let config = Config::new(4, 2).unwrap();
        assert_eq!(config.batch(0..10).count(), 3);
    }

    #[tokio::test]
    async fn serial_keeps_request_order() {
        let cases: [(Vec<i32>, usize, Vec<i32>); 5] = [
            (vec![], 3, vec![]),
            (vec![1, 2, 3, 4, 5], 0, vec![]),
            ((1..=10).collect(), 1, (1..=10).collect()),
            ((1..=10).collect(), 2, vec![3, 7, 11, 15, 19]),
            ((1..=10).collect(), 3, vec![6, 15, 24, 10]),
        ];
        for (data, size, expected) in cases {
            assert_eq!(summing(data, size).run_serial().await, Ok(expected));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn concurrent_covers_every_request() {
        let cases: [(Vec<i32>, usize, Vec<i32>); 5] = [
            (vec![], 3, vec![]),
            (vec![1, 2, 3, 4, 5], 0, vec![]),
            ((1..=10).collect(), 1, (1..=10).collect()),
            ((1..=10).collect(), 2, vec![3, 7, 11, 15, 19]),
            ((1..=10).collect(), 3, vec![6, 10, 15, 24]),
        ];
        for (data, size, expected) in cases {
            let mut sums = summing(data, size).run(3).await.unwrap();
            sums.sort_unstable();
            assert_eq!(sums, expected);
        }
    }

    #[tokio::test]
    async fn failure_stops_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let batch = Batch::new(0, 100, 1);
        let err = Error::msg("bad request");
        let failure = err.clone();
        let handler = Handler::new(
            move |n: usize| {
                counter.fetch_add(1, Ordering::SeqCst);
                let failure = failure.clone();
                async move {
                    if n == 3 {
                        return Err(failure);
                    }
                    Ok(n)
                }
            },
            move || batch.advance().map(|chunk| (chunk.range.start, chunk.is_last)),
        );
        assert_eq!(handler.run(4).await, Err(err));
        assert!(calls.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let handler = summing(vec![1, 2, 3], 1);
        assert!(matches!(
            handler.run_concurrent(0).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_parent_stops_the_run() {
        let parent = CancelToken::new();
        parent.cancel();
        let handler = summing((1..=10).collect(), 1).with_token(&parent);
        assert_eq!(handler.run_serial().await, Err(Error::Cancelled));
        assert_eq!(handler.run(2).await, Err(Error::Cancelled));
    }
}
