use std::fmt;

use crate::error::StorageResult;
use crate::message::{DeliveryMode, Message};

pub(crate) mod keys;
mod durable;
mod memory;

pub use durable::{DurableStorage, DurableStore};
pub use memory::MemoryStore;

/// Opaque identifier of a stored message's slot, local to one store.
/// Handles never cross store boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub(crate) i64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a store attempt. Capacity exhaustion is a sentinel rather
/// than an error so callers can apply overflow policy without
/// control-flow cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored(Handle),
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub size: usize,
    pub capacity: Option<usize>,
}

/// Handle-indexed container for serialized messages.
///
/// Implemented by the volatile [`MemoryStore`] and the durable
/// [`DurableStore`]; both expose insertion-ordered traversal and O(1)
/// lock flags. Compound operations (scan-then-lock, lock-then-delete)
/// are serialized by the owning destination's monitor, not here.
pub trait MessageStore: Send + Sync {
    /// Allocate a slot. Returns [`StoreOutcome::Full`] when capacity is
    /// exhausted — never an error.
    fn store(&self, message: &Message) -> StorageResult<StoreOutcome>;

    fn retrieve(&self, handle: Handle) -> StorageResult<Message>;

    /// Overwrite a slot; may relocate the message, returning the
    /// possibly-new handle. The lock flag carries over.
    fn replace(&self, handle: Handle, message: &Message) -> StorageResult<Handle>;

    /// Permanently free the slot.
    fn delete(&self, handle: Handle) -> StorageResult<()>;

    /// Reserve the slot: invisible to other consumers, not removed.
    fn lock(&self, handle: Handle) -> StorageResult<()>;

    fn unlock(&self, handle: Handle) -> StorageResult<()>;

    fn is_locked(&self, handle: Handle) -> bool;

    /// Stable insertion-order traversal.
    fn first(&self) -> Option<Handle>;

    fn next(&self, handle: Handle) -> Option<Handle>;

    fn size(&self) -> usize;

    fn usage(&self) -> StoreUsage;

    fn delivery_mode(&self) -> DeliveryMode;

    /// Whether committed writes survive a crash once flushed.
    fn is_fail_safe(&self) -> bool;

    /// Make pending writes physically safe. No-op for volatile stores;
    /// destinations run this through the executor and signal the commit
    /// barrier on completion.
    fn flush(&self) -> StorageResult<()>;

    /// Free every slot. Called when the owning destination is deleted;
    /// volatile stores drop their contents with the destination anyway.
    fn destroy(&self) -> StorageResult<()> {
        Ok(())
    }
}
