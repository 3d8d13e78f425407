//! Utilities to implement the streams of this crate.

mod channel;

pub(crate) use channel::Channel;
