use core::mem;
use core::num::NonZeroUsize;

use futures_lite::StreamExt as _;

use super::{Emitter, Stream};
use crate::{CancelToken, Error};

/// Upper bound on the slots reserved for a group before items arrive.
const MAX_RESERVE: usize = 1024;

impl<T> Stream<T>
where
    T: Send + 'static,
{
    /// Group consecutive items into batches of `size`.
    ///
    /// Groups keep the order of the source. When the source ends cleanly a
    /// trailing, shorter group is emitted if any items are left over. When the
    /// source fails its error becomes the buffer's terminal error and the
    /// leftover items are dropped.
    ///
    /// The returned stream owns `self`: closing it closes the source and waits
    /// for it.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures_conduit::Stream;
    /// use std::num::NonZeroUsize;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let size = NonZeroUsize::new(3).unwrap();
    /// let groups = Stream::iter(1..=7).buffer(size).collect().await;
    /// assert_eq!(groups, Ok(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]));
    /// # }
    /// ```
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn buffer(self, size: NonZeroUsize) -> Stream<Vec<T>> {
        self.buffer_with_token(&CancelToken::new(), size)
    }

    /// Like [`Stream::buffer`], but the buffered stream is also cancelled when
    /// `parent` is.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn buffer_with_token(self, parent: &CancelToken, size: NonZeroUsize) -> Stream<Vec<T>> {
        let source = self;
        Stream::with_token(parent, move |token, out| async move {
            let outcome = fill(&source, &token, &out, size.get()).await;
            source.close().await;
            outcome
        })
    }
}

async fn fill<T>(
    source: &Stream<T>,
    token: &CancelToken,
    out: &Emitter<Vec<T>>,
    size: usize,
) -> Result<(), Error> {
    let mut data = source.data();
    let reserve = size.min(MAX_RESERVE);
    let mut group = Vec::with_capacity(reserve);
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(token.reason()),
            item = data.next() => item,
        };
        match item {
            Some(item) => {
                group.push(item);
                if group.len() == size {
                    let full = mem::replace(&mut group, Vec::with_capacity(reserve));
                    out.emit(full).await?;
                }
            }
            None => {
                // A failed source takes its partial group down with it.
                source.err().await?;
                if !group.is_empty() {
                    out.emit(group).await?;
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::StreamExt;
    use std::time::Duration;

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn counting(to: i32, end: Result<(), Error>) -> Stream<i32> {
        Stream::new(move |_, out| async move {
            for n in 1..=to {
                out.emit(n).await?;
            }
            end
        })
    }

    fn endless(parent: &CancelToken) -> Stream<i32> {
        Stream::with_token(parent, |_, out| async move {
            let mut n = 1;
            loop {
                out.emit(n).await?;
                n += 1;
            }
        })
    }

    #[tokio::test]
    async fn empty_source() {
        let groups = counting(0, Ok(())).buffer(size(2)).collect().await;
        assert_eq!(groups, Ok(vec![]));
    }

    #[tokio::test]
    async fn exact_groups() {
        let groups = counting(10, Ok(())).buffer(size(2)).collect().await;
        assert_eq!(
            groups,
            Ok(vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 8], vec![9, 10]])
        );
    }

    #[tokio::test]
    async fn trailing_partial_group() {
        let groups = counting(10, Ok(())).buffer(size(3)).collect().await;
        assert_eq!(
            groups,
            Ok(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9], vec![10]])
        );
    }

    #[tokio::test]
    async fn size_one() {
        let groups = counting(3, Ok(())).buffer(size(1)).collect().await;
        assert_eq!(groups, Ok(vec![vec![1], vec![2], vec![3]]));
    }

    #[tokio::test]
    async fn huge_size_keeps_trailing_group() {
        let groups = counting(3, Ok(())).buffer(size(usize::MAX)).collect().await;
        assert_eq!(groups, Ok(vec![vec![1, 2, 3]]));

        let groups = counting(3, Ok(())).buffer(size(usize::MAX >> 4)).collect().await;
        assert_eq!(groups, Ok(vec![vec![1, 2, 3]]));
    }

    #[tokio::test]
    async fn immediate_source_failure() {
        let err = Error::msg("some err");
        let buffered = counting(0, Err(err.clone())).buffer(size(2));
        assert_eq!(buffered.data().count().await, 0);
        assert_eq!(buffered.err().await, Err(err));
    }

    #[tokio::test]
    async fn deferred_source_failure() {
        let err = Error::msg("some err");
        let buffered = counting(10, Err(err.clone())).buffer(size(2));
        let groups: Vec<_> = buffered.data().collect().await;
        assert_eq!(
            groups,
            vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 8], vec![9, 10]]
        );
        assert_eq!(buffered.err().await, Err(err));
    }

    #[tokio::test]
    async fn failure_discards_partial_group() {
        let err = Error::msg("some err");
        let buffered = counting(11, Err(err.clone())).buffer(size(2));
        let groups: Vec<_> = buffered.data().collect().await;
        assert_eq!(groups.len(), 5);
        assert_eq!(groups.last(), Some(&vec![9, 10]));
        assert_eq!(buffered.err().await, Err(err));
    }

    #[tokio::test]
    async fn close_closes_source() {
        let source = endless(&CancelToken::new());
        let source_token = source.token().clone();
        let buffered = source.buffer(size(2));

        let mut data = buffered.data();
        let mut groups = vec![];
        while let Some(group) = data.next().await {
            let last = group == [9, 10];
            groups.push(group);
            if last {
                buffered.close().await;
            }
        }
        assert_eq!(
            groups,
            vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 8], vec![9, 10]]
        );
        assert_eq!(buffered.err().await, Ok(()));
        assert!(source_token.is_cancelled());
    }

    #[tokio::test]
    async fn close_after_first_group() {
        let source = Stream::new(|_, out| async move {
            out.emit(1).await?;
            out.emit(1).await
        });
        let buffered = source.buffer(size(1));
        let mut data = buffered.data();
        let mut groups = vec![];
        while let Some(group) = data.next().await {
            groups.push(group);
            buffered.close().await;
        }
        assert_eq!(groups, vec![vec![1]]);
        assert_eq!(buffered.err().await, Ok(()));
    }

    #[tokio::test]
    async fn parent_cancel() {
        let parent = CancelToken::new();
        let buffered = endless(&parent).buffer_with_token(&parent, size(2));
        let mut data = buffered.data();
        while let Some(group) = data.next().await {
            if group == [9, 10] {
                parent.cancel();
            }
        }
        assert_eq!(buffered.err().await, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn source_terminates_after_close() {
        let source = endless(&CancelToken::new());
        let source_token = source.token().clone();
        let buffered = source.buffer(size(4));
        assert_eq!(buffered.data().next().await, Some(vec![1, 2, 3, 4]));

        tokio::time::timeout(Duration::from_secs(5), buffered.close())
            .await
            .expect("buffer close timed out");
        assert!(source_token.is_cancelled());
        assert!(buffered.is_terminated());
    }
}
