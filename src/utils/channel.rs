use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::{Mutex, MutexGuard, PoisonError};

use slab::Slab;

/// A rendezvous channel: a send only completes once a receiver took the value.
///
/// At most one value is on offer at a time. Closing the channel hands an
/// offered-but-untaken value back to its sender, so nothing is received after
/// the channel was observed to be closed.
pub(crate) struct Channel<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    slot: Option<Offer<T>>,
    next_ticket: u64,
    closed: bool,
    senders: Slab<Waker>,
    receivers: Slab<Waker>,
}

struct Offer<T> {
    ticket: u64,
    item: T,
}

impl<T> Channel<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slot: None,
                next_ticket: 0,
                closed: false,
                senders: Slab::new(),
                receivers: Slab::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer `item` to a receiver. Resolves to `Err(item)` if the channel
    /// closes before the item was taken.
    pub(crate) fn send(&self, item: T) -> Send<'_, T> {
        Send {
            channel: self,
            state: SendState::Idle(item),
            key: None,
        }
    }

    /// Take the value on offer. `key` identifies the receiver's waker slot and
    /// must be released with [`Channel::release_receiver`].
    pub(crate) fn poll_recv(
        &self,
        key: &mut Option<usize>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<T>> {
        let mut state = self.lock();
        if state.closed {
            release(&mut state.receivers, key);
            return Poll::Ready(None);
        }
        match state.slot.take() {
            Some(offer) => {
                wake_all(&state.senders);
                Poll::Ready(Some(offer.item))
            }
            None => {
                register(&mut state.receivers, key, cx.waker());
                Poll::Pending
            }
        }
    }

    pub(crate) fn release_receiver(&self, key: &mut Option<usize>) {
        release(&mut self.lock().receivers, key);
    }

    /// Close the channel and wake everyone. Idempotent.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        wake_all(&state.senders);
        wake_all(&state.receivers);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn register(wakers: &mut Slab<Waker>, key: &mut Option<usize>, waker: &Waker) {
    match key.and_then(|k| wakers.get_mut(k)) {
        Some(registered) => {
            if !registered.will_wake(waker) {
                *registered = waker.clone();
            }
        }
        None => *key = Some(wakers.insert(waker.clone())),
    }
}

fn release(wakers: &mut Slab<Waker>, key: &mut Option<usize>) {
    if let Some(k) = key.take() {
        wakers.try_remove(k);
    }
}

fn wake_all(wakers: &Slab<Waker>) {
    for (_, waker) in wakers.iter() {
        waker.wake_by_ref();
    }
}

enum SendState<T> {
    Idle(T),
    Offered(u64),
    Done,
}

/// Future returned by [`Channel::send`].
pub(crate) struct Send<'a, T> {
    channel: &'a Channel<T>,
    state: SendState<T>,
    key: Option<usize>,
}

// The item is moved around by value and never pinned.
impl<T> Unpin for Send<'_, T> {}

impl<T> Future for Send<'_, T> {
    type Output = Result<(), T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let channel = this.channel;
        let mut state = channel.lock();

        match core::mem::replace(&mut this.state, SendState::Done) {
            SendState::Idle(item) => {
                if state.closed {
                    release(&mut state.senders, &mut this.key);
                    return Poll::Ready(Err(item));
                }
                if state.slot.is_some() {
                    // Somebody else's value is on offer, wait our turn.
                    this.state = SendState::Idle(item);
                } else {
                    let ticket = state.next_ticket;
                    state.next_ticket += 1;
                    state.slot = Some(Offer { ticket, item });
                    wake_all(&state.receivers);
                    this.state = SendState::Offered(ticket);
                }
                register(&mut state.senders, &mut this.key, cx.waker());
                Poll::Pending
            }
            SendState::Offered(ticket) => {
                let ours = matches!(&state.slot, Some(offer) if offer.ticket == ticket);
                if !ours {
                    release(&mut state.senders, &mut this.key);
                    return Poll::Ready(Ok(()));
                }
                if state.closed {
                    release(&mut state.senders, &mut this.key);
                    return match state.slot.take() {
                        Some(offer) => Poll::Ready(Err(offer.item)),
                        None => Poll::Ready(Ok(())),
                    };
                }
                this.state = SendState::Offered(ticket);
                register(&mut state.senders, &mut this.key, cx.waker());
                Poll::Pending
            }
            SendState::Done => panic!("`Send` polled after completion"),
        }
    }
}

impl<T> Drop for Send<'_, T> {
    fn drop(&mut self) {
        let channel = self.channel;
        let mut state = channel.lock();
        if let SendState::Offered(ticket) = self.state {
            if matches!(&state.slot, Some(offer) if offer.ticket == ticket) {
                // Withdraw the offer so it can't be received after we gave up.
                state.slot = None;
                wake_all(&state.senders);
            }
        }
        release(&mut state.senders, &mut self.key);
    }
}
