use std::sync::Arc;

use crate::destination::queue::LocalQueue;
use crate::message::Message;
use crate::store::Handle;

/// A provisional reservation created the instant a put or redelivery
/// claims a slot. Destroyed when unlocked (message becomes visible) or
/// removed (put rolled back).
pub(crate) struct MessageLock {
    pub(crate) handle: Handle,
    /// Which of the destination's stores holds the slot. Overflowed
    /// non-persistent messages live in the durable store too.
    pub(crate) in_durable: bool,
    pub(crate) queue: Arc<LocalQueue>,
    pub(crate) message: Arc<Message>,
}

/// Ordered, append-only collection of locks accumulated during one
/// commit or rollback pass, released together at the very end — after
/// durability is confirmed.
#[derive(Default)]
pub(crate) struct MessageLockSet {
    locks: Vec<MessageLock>,
}

impl MessageLockSet {
    pub(crate) fn push(&mut self, lock: MessageLock) {
        self.locks.push(lock);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &MessageLock> {
        self.locks.iter()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = MessageLock> + '_ {
        self.locks.drain(..)
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
