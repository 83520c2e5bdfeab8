use std::sync::Arc;

use uuid::Uuid;

use crate::destination::queue::LocalQueue;
use crate::destination::DestinationId;
use crate::error::StorageResult;
use crate::store::Handle;
use crate::sync::CommitBarrier;

/// Implemented by destinations: open/close the per-destination update
/// lock and commit pending changes through a shared barrier.
pub trait Committable: Send + Sync {
    fn open_transaction(&self);

    fn close_transaction(&self);

    /// Schedule the durable flush; the barrier is signalled once the
    /// changes are physically safe.
    fn commit_changes(&self, barrier: &Arc<CommitBarrier>) -> StorageResult<()>;
}

/// One uncommitted get: the claimed handle stays locked in its queue
/// until the session commits (delete) or rolls back (redeliver).
pub(crate) struct TransactionItem {
    pub(crate) handle: Handle,
    pub(crate) message_id: Uuid,
    /// Which store the slot lives in (durable or volatile).
    pub(crate) in_durable: bool,
    /// Delivery mode of the message itself. Only persistent messages
    /// force a durable commit; an overflowed non-persistent message is
    /// in the durable store yet never pays for a flush.
    pub(crate) persistent: bool,
    pub(crate) queue: Arc<LocalQueue>,
}

/// Per-session ledger of gets not yet finalized.
#[derive(Default)]
pub(crate) struct TransactionSet {
    items: Vec<TransactionItem>,
}

impl TransactionSet {
    pub(crate) fn add(&mut self, item: TransactionItem) {
        self.items.push(item);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    fn selected(item: &TransactionItem, ids: Option<&[Uuid]>) -> bool {
        ids.is_none_or(|ids| ids.contains(&item.message_id))
    }

    /// Distinct owning queues of the selected items, for destination-set
    /// computation before the commit pass sorts and locks them.
    pub(crate) fn queues(&self, ids: Option<&[Uuid]>) -> Vec<Arc<LocalQueue>> {
        let mut seen: Vec<Arc<LocalQueue>> = Vec::new();
        for item in self.items.iter().filter(|i| Self::selected(i, ids)) {
            if !seen.iter().any(|q| q.id() == item.queue.id()) {
                seen.push(Arc::clone(&item.queue));
            }
        }
        seen
    }

    /// Remove and return the selected items belonging to one destination.
    pub(crate) fn take(
        &mut self,
        destination: &DestinationId,
        ids: Option<&[Uuid]>,
    ) -> Vec<TransactionItem> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if item.queue.id() == destination && Self::selected(&item, ids) {
                taken.push(item);
            } else {
                kept.push(item);
            }
        }
        self.items = kept;
        taken
    }
}
