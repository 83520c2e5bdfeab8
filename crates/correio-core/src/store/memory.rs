use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::message::{DeliveryMode, Message};
use crate::store::{Handle, MessageStore, StoreOutcome, StoreUsage};

struct Slot {
    message: Message,
    locked: bool,
}

/// Volatile message store: insertion-ordered slots in a BTreeMap keyed
/// by an ever-increasing sequence number. Contents are lost on drop.
pub struct MemoryStore {
    capacity: Option<usize>,
    inner: Mutex<Slots>,
}

struct Slots {
    map: BTreeMap<i64, Slot>,
    next_seq: i64,
}

impl MemoryStore {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Slots {
                map: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }
}

impl MessageStore for MemoryStore {
    fn store(&self, message: &Message) -> StorageResult<StoreOutcome> {
        let mut inner = self.inner.lock();
        if let Some(cap) = self.capacity {
            if inner.map.len() >= cap {
                return Ok(StoreOutcome::Full);
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.map.insert(
            seq,
            Slot {
                message: message.clone(),
                locked: false,
            },
        );
        Ok(StoreOutcome::Stored(Handle(seq)))
    }

    fn retrieve(&self, handle: Handle) -> StorageResult<Message> {
        let inner = self.inner.lock();
        inner
            .map
            .get(&handle.0)
            .map(|slot| slot.message.clone())
            .ok_or(StorageError::HandleNotFound(handle.0))
    }

    fn replace(&self, handle: Handle, message: &Message) -> StorageResult<Handle> {
        let mut inner = self.inner.lock();
        let slot = inner
            .map
            .get_mut(&handle.0)
            .ok_or(StorageError::HandleNotFound(handle.0))?;
        slot.message = message.clone();
        Ok(handle)
    }

    fn delete(&self, handle: Handle) -> StorageResult<()> {
        self.inner
            .lock()
            .map
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(StorageError::HandleNotFound(handle.0))
    }

    fn lock(&self, handle: Handle) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .map
            .get_mut(&handle.0)
            .ok_or(StorageError::HandleNotFound(handle.0))?;
        slot.locked = true;
        Ok(())
    }

    fn unlock(&self, handle: Handle) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .map
            .get_mut(&handle.0)
            .ok_or(StorageError::HandleNotFound(handle.0))?;
        slot.locked = false;
        Ok(())
    }

    fn is_locked(&self, handle: Handle) -> bool {
        self.inner
            .lock()
            .map
            .get(&handle.0)
            .is_some_and(|slot| slot.locked)
    }

    fn first(&self) -> Option<Handle> {
        self.inner.lock().map.keys().next().copied().map(Handle)
    }

    fn next(&self, handle: Handle) -> Option<Handle> {
        self.inner
            .lock()
            .map
            .range((Bound::Excluded(handle.0), Bound::Unbounded))
            .next()
            .map(|(seq, _)| Handle(*seq))
    }

    fn size(&self) -> usize {
        self.inner.lock().map.len()
    }

    fn usage(&self) -> StoreUsage {
        StoreUsage {
            size: self.size(),
            capacity: self.capacity,
        }
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::NonPersistent
    }

    fn is_fail_safe(&self) -> bool {
        false
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}
