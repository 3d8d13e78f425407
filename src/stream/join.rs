use core::fmt;

use futures_buffered::FuturesUnordered;
use futures_lite::StreamExt as _;

use super::{Emitter, Stream};
use crate::{CancelToken, Error};

/// Merges several streams into a single stream of all their items.
///
/// Items are relayed as soon as any source produces them. Items of one source
/// keep their order; the interleaving between sources is unspecified. The
/// first source to fail becomes the joined stream's terminal error, and every
/// other source is closed right away.
///
/// Sources can only be added before the joined stream is created:
/// [`Joiner::stream`] consumes the builder.
///
/// # Examples
///
/// ```
/// use futures_conduit::prelude::*;
/// use futures_conduit::Stream;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let evens = Stream::iter([2, 4, 6]);
/// let odds = Stream::iter([1, 3, 5]);
///
/// let mut items = vec![evens, odds].join().stream().collect().await.unwrap();
/// items.sort_unstable();
/// assert_eq!(items, [1, 2, 3, 4, 5, 6]);
/// # }
/// ```
#[must_use = "`Joiner` does nothing until `stream` is called"]
pub struct Joiner<T> {
    sources: Vec<Stream<T>>,
}

impl<T> Joiner<T> {
    /// Create a joiner over `sources`.
    pub fn new(sources: impl IntoIterator<Item = Stream<T>>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
        }
    }

    /// Add another source.
    pub fn with(mut self, source: Stream<T>) -> Self {
        self.sources.push(source);
        self
    }

    /// The number of sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if no sources were added.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl<T> Joiner<T>
where
    T: Send + 'static,
{
    /// Start relaying and return the joined stream.
    ///
    /// The joined stream owns the sources: closing it closes every source and
    /// waits until all of them have exited.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn stream(self) -> Stream<T> {
        self.stream_with_token(&CancelToken::new())
    }

    /// Like [`Joiner::stream`], but the joined stream is also cancelled when
    /// `parent` is.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn stream_with_token(self, parent: &CancelToken) -> Stream<T> {
        let sources = self.sources;
        Stream::with_token(parent, move |token, out| async move {
            let outcome = fan_in(&sources, &token, &out).await;
            close_all(&sources).await;
            outcome
        })
    }
}

impl<T> Default for Joiner<T> {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
        }
    }
}

impl<T> FromIterator<Stream<T>> for Joiner<T> {
    fn from_iter<I: IntoIterator<Item = Stream<T>>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl<T> Extend<Stream<T>> for Joiner<T> {
    fn extend<I: IntoIterator<Item = Stream<T>>>(&mut self, iter: I) {
        self.sources.extend(iter);
    }
}

impl<T> fmt::Debug for Joiner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.sources.iter()).finish()
    }
}

/// Wait for all streams in a container and merge their items.
pub trait Join {
    /// The resulting output type.
    type Item;

    /// Collect the streams into a [`Joiner`].
    fn join(self) -> Joiner<Self::Item>;
}

impl<T> Join for Vec<Stream<T>> {
    type Item = T;

    fn join(self) -> Joiner<T> {
        Joiner { sources: self }
    }
}

impl<T, const N: usize> Join for [Stream<T>; N] {
    type Item = T;

    fn join(self) -> Joiner<T> {
        Joiner::new(self)
    }
}

async fn fan_in<T>(
    sources: &[Stream<T>],
    token: &CancelToken,
    out: &Emitter<T>,
) -> Result<(), Error> {
    let mut relays = FuturesUnordered::new();
    for (index, source) in sources.iter().enumerate() {
        relays.push(relay(index, source, out));
    }
    futures_lite::pin!(relays);

    let mut first_err = None;
    // Set once the sources have been told to close.
    let mut closing = false;
    loop {
        tokio::select! {
            relayed = relays.next() => match relayed {
                None => break,
                Some(Ok(())) => {}
                Some(Err((index, err))) => {
                    if !closing {
                        closing = true;
                        tracing::debug!(
                            source = index,
                            error = %err,
                            "joined source failed, closing the rest"
                        );
                        request_close_all(sources);
                    }
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            },
            _ = token.cancelled(), if !closing => {
                closing = true;
                request_close_all(sources);
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn relay<T>(
    index: usize,
    source: &Stream<T>,
    out: &Emitter<T>,
) -> Result<(), (usize, Error)> {
    let mut data = source.data();
    while let Some(item) = data.next().await {
        if out.emit(item).await.is_err() {
            // The joined stream is cancelling; its own cause decides the outcome.
            return Ok(());
        }
    }
    source.err().await.map_err(|err| (index, err))
}

fn request_close_all<T>(sources: &[Stream<T>]) {
    for source in sources {
        source.request_close();
    }
}

async fn close_all<T>(sources: &[Stream<T>]) {
    request_close_all(sources);
    for source in sources {
        source.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::StreamExt;
    use itertools::Itertools;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct ExitGuard(Arc<AtomicUsize>);

    impl Drop for ExitGuard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn from_filter(pred: fn(i32) -> bool) -> Stream<i32> {
        Stream::new(move |_, out| async move {
            for n in (1..=10).filter(|n| pred(*n)) {
                out.emit(n).await?;
            }
            Ok(())
        })
    }

    fn endless(step: i32, start: i32) -> Stream<i32> {
        Stream::new(move |_, out| async move {
            let mut n = start;
            loop {
                out.emit(n).await?;
                n += step;
            }
        })
    }

    fn failing(err: Error) -> Stream<i32> {
        Stream::new(move |_, _| async move { Err(err) })
    }

    #[tokio::test]
    async fn empty_joiner() {
        let joined = Joiner::<i32>::default().stream();
        assert_eq!(joined.collect().await, Ok(vec![]));
    }

    #[tokio::test]
    async fn empty_sources() {
        let joined = vec![from_filter(|_| false), from_filter(|_| false)]
            .join()
            .stream();
        assert_eq!(joined.collect().await, Ok(vec![]));
    }

    #[tokio::test]
    async fn single_items() {
        let joined = [Stream::iter([1]), Stream::iter([1])].join().stream();
        assert_eq!(joined.collect().await, Ok(vec![1, 1]));
    }

    #[tokio::test]
    async fn evens_and_odds() {
        let joined = Joiner::new([from_filter(|n| n % 2 == 0)])
            .with(from_filter(|n| n % 2 != 0))
            .stream();
        let items = joined.collect().await.unwrap();
        assert_eq!(
            items.into_iter().sorted().collect::<Vec<_>>(),
            (1..=10).collect::<Vec<_>>()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn keeps_per_source_order() {
        let joiner: Joiner<(usize, i32)> = (0..4)
            .map(|source| Stream::iter((0..100).map(move |n| (source, n))))
            .collect();
        let items = joiner.stream().collect().await.unwrap();
        assert_eq!(items.len(), 400);
        for source in 0..4 {
            let seen: Vec<_> = items
                .iter()
                .filter(|(s, _)| *s == source)
                .map(|(_, n)| *n)
                .collect();
            assert_eq!(seen, (0..100).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn both_fail() {
        let err = Error::msg("some error");
        let joined = [failing(err.clone()), failing(err.clone())].join().stream();
        assert_eq!(joined.data().count().await, 0);
        assert_eq!(joined.err().await, Err(err));
    }

    #[tokio::test]
    async fn first_error_wins() {
        let a = Error::msg("a");
        let b = Error::msg("b");
        let joined = [failing(a.clone()), failing(b.clone())].join().stream();
        let err = joined.err().await.unwrap_err();
        assert!(err == a || err == b);
    }

    #[tokio::test]
    async fn failure_closes_endless_source() {
        let err = Error::msg("some error");
        let exits = Arc::new(AtomicUsize::new(0));
        let guard = ExitGuard(exits.clone());
        let endless = Stream::new(move |_, out| async move {
            let _guard = guard;
            let mut n = 1;
            loop {
                out.emit(n).await?;
                n += 1;
            }
        });
        let joined = [failing(err.clone()), endless].join().stream();

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            joined.data().count().await;
            joined.err().await
        })
        .await;
        assert_eq!(drained.expect("joined stream never ended"), Err(err));
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relay_ends_cleanly_when_joined_stream_closes() {
        let relayed = Arc::new(Mutex::new(None));
        let slot = relayed.clone();
        let outer: Stream<i32> = Stream::new(move |token, out| async move {
            token.cancelled().await;
            let source = Stream::iter([1, 2, 3]);
            let res = relay(0, &source, &out).await;
            *slot.lock().unwrap() = Some(res);
            Ok(())
        });
        outer.close().await;
        assert_eq!(*relayed.lock().unwrap(), Some(Ok(())));
    }

    #[tokio::test]
    async fn close_is_not_a_source_failure() {
        let sources: Vec<_> = (0..4).map(|n| endless(1, n)).collect();
        let joined = sources.join().stream();
        assert!(joined.data().next().await.is_some());
        joined.close().await;
        assert_eq!(joined.err().await, Ok(()));
    }

    #[tokio::test]
    async fn deferred_failure_closes_endless_source() {
        let err = Error::msg("some error");
        let end = err.clone();
        let finite = Stream::new(move |_, out| async move {
            for n in 1..=10 {
                out.emit(n).await?;
            }
            Err(end)
        });
        let joined = [finite, endless(0, 1)].join().stream();
        let drained = tokio::time::timeout(Duration::from_secs(5), joined.data().count()).await;
        assert!(drained.is_ok(), "joined stream never ended");
        assert_eq!(joined.err().await, Err(err));
    }

    #[tokio::test]
    async fn close_closes_sources() {
        let evens = endless(2, 2);
        let odds = endless(2, 1);
        let tokens = [evens.token().clone(), odds.token().clone()];
        let joined = [evens, odds].join().stream();

        let mut data = joined.data();
        let mut count = 0;
        while data.next().await.is_some() {
            count += 1;
            if count == 10 {
                joined.close().await;
            }
        }
        assert_eq!(count, 10);
        assert_eq!(joined.err().await, Ok(()));
        assert!(tokens.iter().all(CancelToken::is_cancelled));
    }

    #[tokio::test]
    async fn parent_cancel() {
        let parent = CancelToken::new();
        let joined = [Stream::iter(Vec::<i32>::new()), endless(0, 1)]
            .join()
            .stream_with_token(&parent);
        let mut data = joined.data();
        while let Some(n) = data.next().await {
            if n >= 1 {
                parent.cancel();
            }
        }
        assert_eq!(joined.err().await, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn composes_with_buffer() {
        let size = std::num::NonZeroUsize::new(5).unwrap();
        let low = Stream::iter(1..=10).buffer(size);
        let high = Stream::iter(11..=20).buffer(size);
        let groups = [low, high].join().stream().collect().await.unwrap();
        assert_eq!(groups.len(), 4);
        assert_eq!(
            groups.into_iter().flatten().sorted().collect::<Vec<_>>(),
            (1..=20).collect::<Vec<_>>()
        );
    }
}
