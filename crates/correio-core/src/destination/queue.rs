use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::destination::{DestinationDefinition, DestinationId};
use crate::error::{DestinationError, DestinationResult, StorageResult};
use crate::executor::{Task, TaskExecutor, Timer};
use crate::lock::{MessageLock, MessageLockSet};
use crate::message::{now_millis, Message};
use crate::notify::{ConsumerEntry, Notifier, NotifyTarget};
use crate::selector::Selector;
use crate::stats::Stats;
use crate::store::{Handle, MessageStore, MemoryStore, StoreOutcome};
use crate::sync::{CommitBarrier, TxLock};
use crate::transaction::{Committable, TransactionItem, TransactionSet};

#[derive(Default)]
struct QueueState {
    closed: bool,
}

/// Position of an in-progress non-destructive browse: store index plus
/// the last handle visited in it.
#[derive(Default)]
pub struct BrowseCursor {
    stage: usize,
    pos: Option<Handle>,
}

/// A point-to-point destination: up to two stores (volatile and
/// durable), a monitor serializing compound store operations, the
/// commit-window lock, and the consumer list with its notification
/// plumbing. Topics reuse it as the per-subscription backlog.
pub struct LocalQueue {
    id: DestinationId,
    definition: DestinationDefinition,
    volatile: Option<MemoryStore>,
    durable: Option<Arc<dyn MessageStore>>,
    /// Guards every compound store operation (scan-then-lock and the
    /// like). Never held while calling out to consumers.
    monitor: Mutex<QueueState>,
    tx_lock: TxLock,
    /// Copy-on-write so the notifier iterates without blocking
    /// registration.
    consumers: RwLock<Arc<Vec<Arc<ConsumerEntry>>>>,
    rr_offset: AtomicUsize,
    notifier: Notifier,
    stats: Stats,
    executor: Arc<TaskExecutor>,
    timer: Arc<Timer>,
}

impl LocalQueue {
    pub(crate) fn new(
        id: DestinationId,
        definition: DestinationDefinition,
        volatile: Option<MemoryStore>,
        durable: Option<Arc<dyn MessageStore>>,
        executor: Arc<TaskExecutor>,
        timer: Arc<Timer>,
        delivery: &DeliveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            definition,
            volatile,
            durable,
            monitor: Mutex::new(QueueState::default()),
            tx_lock: TxLock::default(),
            consumers: RwLock::new(Arc::new(Vec::new())),
            rr_offset: AtomicUsize::new(0),
            notifier: Notifier::new(
                delivery.notify_queue_capacity,
                Duration::from_millis(delivery.notify_enqueue_timeout_ms),
            ),
            stats: Stats::default(),
            executor,
            timer,
        })
    }

    pub fn id(&self) -> &DestinationId {
        &self.id
    }

    pub fn definition(&self) -> &DestinationDefinition {
        &self.definition
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn size(&self) -> usize {
        self.stores().iter().map(|(s, _)| s.size()).sum()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    /// Persistent messages here must ride a durable commit.
    pub(crate) fn requires_transactional_update(&self) -> bool {
        self.durable.as_ref().is_some_and(|d| d.is_fail_safe())
    }

    fn stores(&self) -> Vec<(&dyn MessageStore, bool)> {
        let mut stores: Vec<(&dyn MessageStore, bool)> = Vec::with_capacity(2);
        if let Some(v) = &self.volatile {
            stores.push((v, false));
        }
        if let Some(d) = &self.durable {
            stores.push((&**d, true));
        }
        stores
    }

    fn store_ref(&self, in_durable: bool) -> DestinationResult<&dyn MessageStore> {
        let store: Option<&dyn MessageStore> = if in_durable {
            self.durable.as_deref()
        } else {
            self.volatile.as_ref().map(|v| v as &dyn MessageStore)
        };
        store.ok_or_else(|| {
            DestinationError::Consistency(format!("{} has no such store", self.id))
        })
    }

    fn ensure_open(&self, state: &QueueState) -> DestinationResult<()> {
        if state.closed {
            Err(DestinationError::Closed(self.id.to_string()))
        } else {
            Ok(())
        }
    }

    fn assert_in_transaction(&self, op: &str) -> DestinationResult<()> {
        if self.tx_lock.is_held_by_current_thread() {
            Ok(())
        } else {
            Err(DestinationError::Consistency(format!(
                "{op} on {} outside its commit window",
                self.id
            )))
        }
    }

    /// Store the message and leave it locked, invisible until
    /// [`unlock_and_deliver`](Self::unlock_and_deliver) runs after the
    /// commit barrier clears. Returns whether this put needs a durable
    /// commit. Caller must hold the commit window.
    pub(crate) fn put_locked(
        self: &Arc<Self>,
        message: Arc<Message>,
        locks: &mut MessageLockSet,
    ) -> DestinationResult<bool> {
        self.assert_in_transaction("put")?;
        if !message.is_read_only() {
            return Err(DestinationError::Consistency(
                "put of a message that is not an internal copy".into(),
            ));
        }
        let persistent = message.delivery_mode().is_persistent();

        let state = self.monitor.lock();
        self.ensure_open(&state)?;

        // Store preference: persistent traffic goes durable, the rest
        // volatile with an optional spill into the durable store.
        let candidates: Vec<(&dyn MessageStore, bool)> = if persistent {
            match &self.durable {
                Some(d) => vec![(&**d, true)],
                None => {
                    return Err(DestinationError::UnsupportedDeliveryMode(
                        self.id.to_string(),
                    ))
                }
            }
        } else {
            match (&self.volatile, &self.durable) {
                (Some(v), Some(d)) if self.definition.overflow_to_durable => {
                    vec![(v as &dyn MessageStore, false), (&**d, true)]
                }
                (Some(v), _) => vec![(v as &dyn MessageStore, false)],
                (None, Some(d)) => vec![(&**d, true)],
                (None, None) => {
                    return Err(DestinationError::Consistency(format!(
                        "{} has no store",
                        self.id
                    )))
                }
            }
        };

        let mut placed = None;
        for (store, in_durable) in candidates {
            match store.store(&message)? {
                StoreOutcome::Stored(handle) => {
                    store.lock(handle)?;
                    placed = Some((handle, in_durable));
                    break;
                }
                StoreOutcome::Full => continue,
            }
        }
        drop(state);

        let (handle, in_durable) =
            placed.ok_or_else(|| DestinationError::Full(self.id.to_string()))?;
        locks.push(MessageLock {
            handle,
            in_durable,
            queue: Arc::clone(self),
            message,
        });
        self.stats.record_put();
        Ok(persistent && self.requires_transactional_update())
    }

    /// Final step of a successful commit: the slot becomes visible and
    /// one eligible consumer is woken.
    pub(crate) fn unlock_and_deliver(self: &Arc<Self>, lock: &MessageLock) {
        {
            let _state = self.monitor.lock();
            let unlocked = self
                .store_ref(lock.in_durable)
                .and_then(|s| s.unlock(lock.handle).map_err(DestinationError::from));
            if let Err(e) = unlocked {
                warn!(destination = %self.id, handle = %lock.handle, error = %e, "unlock failed");
                return;
            }
        }
        self.message_available(&lock.message);
    }

    /// Undo a provisional put whose transaction failed.
    pub(crate) fn discard_locked(&self, lock: &MessageLock) {
        let _state = self.monitor.lock();
        let deleted = self
            .store_ref(lock.in_durable)
            .and_then(|s| s.delete(lock.handle).map_err(DestinationError::from));
        if let Err(e) = deleted {
            warn!(destination = %self.id, handle = %lock.handle, error = %e, "discard failed");
        }
    }

    /// Claim the first visible message matching the selector: lock it,
    /// record it in the transaction set, and return a copy. Expired
    /// messages found along the way are locked and cleaned up on the
    /// side so no consumer ever sees them.
    pub(crate) fn get(
        self: &Arc<Self>,
        tx_set: &mut TransactionSet,
        selector: Option<&dyn Selector>,
    ) -> DestinationResult<Option<Message>> {
        let mut expired: Vec<(Handle, bool)> = Vec::new();
        let found = {
            let state = self.monitor.lock();
            self.ensure_open(&state)?;
            self.claim(selector, &mut expired, tx_set)?
        };
        if !expired.is_empty() {
            self.schedule_expiry(expired);
        }
        if found.is_some() {
            self.stats.record_get();
        }
        Ok(found)
    }

    fn claim(
        self: &Arc<Self>,
        selector: Option<&dyn Selector>,
        expired: &mut Vec<(Handle, bool)>,
        tx_set: &mut TransactionSet,
    ) -> DestinationResult<Option<Message>> {
        let now = now_millis();
        for (store, in_durable) in self.stores() {
            let mut cursor = store.first();
            while let Some(handle) = cursor {
                cursor = store.next(handle);
                if store.is_locked(handle) {
                    continue;
                }
                let message = store.retrieve(handle)?;
                if message.is_expired(now) {
                    store.lock(handle)?;
                    expired.push((handle, in_durable));
                    continue;
                }
                if let Some(sel) = selector {
                    if !sel.matches(&message)? {
                        continue;
                    }
                }
                store.lock(handle)?;
                tx_set.add(TransactionItem {
                    handle,
                    message_id: message.id,
                    in_durable,
                    persistent: message.delivery_mode().is_persistent(),
                    queue: Arc::clone(self),
                });
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Commit half of a consume: the claimed slots are freed for good.
    /// Returns whether any removal needs a durable commit. Caller must
    /// hold the commit window.
    pub(crate) fn remove(&self, items: &[TransactionItem]) -> DestinationResult<bool> {
        self.assert_in_transaction("remove")?;
        let state = self.monitor.lock();
        self.ensure_open(&state)?;
        let mut requires_commit = false;
        for item in items {
            self.store_ref(item.in_durable)?.delete(item.handle)?;
            requires_commit |= item.persistent && self.requires_transactional_update();
        }
        Ok(requires_commit)
    }

    /// Rollback half of a consume: stamp the redelivered flag and either
    /// hand the lock back to the caller (released after the barrier) or,
    /// with a redelivery delay, keep the slot locked until a timer fires.
    /// Returns whether any update needs a durable commit.
    pub(crate) fn redeliver_locked(
        self: &Arc<Self>,
        items: Vec<TransactionItem>,
        locks: &mut MessageLockSet,
    ) -> DestinationResult<bool> {
        self.assert_in_transaction("redeliver")?;
        let delay = Duration::from_millis(self.definition.redelivery_delay_ms);
        let state = self.monitor.lock();
        self.ensure_open(&state)?;

        let mut requires_commit = false;
        for item in items {
            let store = self.store_ref(item.in_durable)?;
            let mut message = store.retrieve(item.handle)?;
            message.force_redelivered();
            let handle = store.replace(item.handle, &message)?;
            requires_commit |= item.persistent && self.requires_transactional_update();

            if delay.is_zero() {
                locks.push(MessageLock {
                    handle,
                    in_durable: item.in_durable,
                    queue: Arc::clone(self),
                    message: Arc::new(message),
                });
            } else {
                debug!(destination = %self.id, handle = %handle, ?delay, "redelivery deferred");
                let queue = Arc::downgrade(self);
                let in_durable = item.in_durable;
                let message = Arc::new(message);
                self.timer.schedule(
                    delay,
                    Task::new(move || {
                        if let Some(q) = queue.upgrade() {
                            q.deferred_unlock(handle, in_durable, &message);
                        }
                    }),
                );
            }
        }
        Ok(requires_commit)
    }

    fn deferred_unlock(self: &Arc<Self>, handle: Handle, in_durable: bool, message: &Arc<Message>) {
        {
            let state = self.monitor.lock();
            if state.closed {
                return;
            }
            let unlocked = self
                .store_ref(in_durable)
                .and_then(|s| s.unlock(handle).map_err(DestinationError::from));
            if let Err(e) = unlocked {
                warn!(destination = %self.id, handle = %handle, error = %e, "deferred unlock failed");
                return;
            }
        }
        self.message_available(message);
    }

    /// Non-destructive peek walking both stores in insertion order.
    /// Locked and expired slots are skipped, never touched.
    pub fn browse(
        &self,
        cursor: &mut BrowseCursor,
        selector: Option<&dyn Selector>,
    ) -> DestinationResult<Option<Message>> {
        let state = self.monitor.lock();
        self.ensure_open(&state)?;
        let now = now_millis();
        let stores = self.stores();
        while cursor.stage < stores.len() {
            let (store, _) = stores[cursor.stage];
            let mut next = match cursor.pos {
                None => store.first(),
                Some(h) => store.next(h),
            };
            while let Some(handle) = next {
                cursor.pos = Some(handle);
                next = store.next(handle);
                if store.is_locked(handle) {
                    continue;
                }
                let message = store.retrieve(handle)?;
                if message.is_expired(now) {
                    continue;
                }
                if let Some(sel) = selector {
                    if !sel.matches(&message)? {
                        continue;
                    }
                }
                return Ok(Some(message));
            }
            cursor.stage += 1;
            cursor.pos = None;
        }
        Ok(None)
    }

    /// Administrative drop of every visible matching message. Runs as
    /// its own mini-transaction with a synchronous durable flush.
    pub fn purge(&self, selector: Option<&dyn Selector>) -> DestinationResult<usize> {
        self.tx_lock.acquire();
        let result = self.purge_inner(selector);
        self.tx_lock.release();
        result
    }

    fn purge_inner(&self, selector: Option<&dyn Selector>) -> DestinationResult<usize> {
        let state = self.monitor.lock();
        self.ensure_open(&state)?;
        let mut purged = 0;
        let mut durable_touched = false;
        for (store, in_durable) in self.stores() {
            let mut cursor = store.first();
            while let Some(handle) = cursor {
                cursor = store.next(handle);
                if store.is_locked(handle) {
                    continue;
                }
                if let Some(sel) = selector {
                    let message = store.retrieve(handle)?;
                    if !sel.matches(&message)? {
                        continue;
                    }
                }
                store.delete(handle)?;
                purged += 1;
                durable_touched |= in_durable;
            }
        }
        drop(state);
        if durable_touched && self.requires_transactional_update() {
            if let Some(d) = &self.durable {
                d.flush()?;
            }
        }
        Ok(purged)
    }

    /// Delete expired slots claimed during a scan. Runs on a worker
    /// thread as its own mini-transaction.
    fn expire_locked(&self, expired: &[(Handle, bool)]) {
        self.tx_lock.acquire();
        let mut durable_touched = false;
        {
            let state = self.monitor.lock();
            if !state.closed {
                for (handle, in_durable) in expired {
                    let deleted = self
                        .store_ref(*in_durable)
                        .and_then(|s| s.delete(*handle).map_err(DestinationError::from));
                    match deleted {
                        Ok(()) => durable_touched |= *in_durable,
                        Err(e) => {
                            warn!(destination = %self.id, handle = %handle, error = %e, "expiry delete failed");
                        }
                    }
                }
            }
        }
        if durable_touched && self.requires_transactional_update() {
            if let Some(d) = &self.durable {
                if let Err(e) = d.flush() {
                    warn!(destination = %self.id, error = %e, "expiry flush failed");
                }
            }
        }
        self.tx_lock.release();
        debug!(destination = %self.id, count = expired.len(), "expired messages removed");
    }

    fn schedule_expiry(self: &Arc<Self>, expired: Vec<(Handle, bool)>) {
        let queue = Arc::downgrade(self);
        self.executor.execute(Task::new(move || {
            if let Some(q) = queue.upgrade() {
                q.expire_locked(&expired);
            }
        }));
    }

    // Consumer registration and notification.

    pub(crate) fn register_consumer(&self, entry: Arc<ConsumerEntry>) {
        let mut guard = self.consumers.write();
        let mut list = (**guard).clone();
        list.push(entry);
        *guard = Arc::new(list);
    }

    pub(crate) fn deregister_consumer(&self, id: Uuid) -> usize {
        let mut guard = self.consumers.write();
        let mut list = (**guard).clone();
        list.retain(|c| c.id != id);
        let remaining = list.len();
        *guard = Arc::new(list);
        remaining
    }

    fn consumer_snapshot(&self) -> Arc<Vec<Arc<ConsumerEntry>>> {
        Arc::clone(&self.consumers.read())
    }

    /// A message just became visible: queue the event and make sure a
    /// drain pass is pending. Repeated calls collapse into one pass.
    pub(crate) fn message_available(self: &Arc<Self>, message: &Arc<Message>) {
        if self.consumer_snapshot().is_empty() {
            return;
        }
        if !self.notifier.offer(Arc::clone(message)) {
            warn!(destination = %self.id, "notification queue full, wake-up dropped");
        }
        let queue = Arc::downgrade(self);
        self.executor.execute(Task::mergeable(self.notifier.task_id, move || {
            if let Some(q) = queue.upgrade() {
                q.drain_notifications();
            }
        }));
    }

    fn drain_notifications(self: &Arc<Self>) {
        while let Some(message) = self.notifier.poll() {
            self.notify_for(&message);
        }
    }

    /// Wake exactly one eligible consumer, rotating the starting point so
    /// load spreads round-robin.
    fn notify_for(self: &Arc<Self>, message: &Message) {
        let snapshot = self.consumer_snapshot();
        if snapshot.is_empty() {
            return;
        }
        let start = self.rr_offset.fetch_add(1, Ordering::Relaxed);
        for i in 0..snapshot.len() {
            let entry = &snapshot[(start + i) % snapshot.len()];
            if !entry.started.load(Ordering::Acquire) {
                continue;
            }
            if let Some(sel) = &entry.selector {
                match sel.matches(message) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(destination = %self.id, consumer = %entry.id, error = %e, "selector failed during notify");
                        continue;
                    }
                }
            }
            match &entry.target {
                NotifyTarget::Waiter(signal) => signal.notify_all(),
                NotifyTarget::Proxy(proxy) => proxy.notify(self),
            }
            return;
        }
    }

    /// Periodic self-heal: if a visible message is sitting in a queue
    /// with live consumers (a wake-up was dropped or raced a consumer
    /// registration), re-notify. Re-arms itself until the queue closes.
    pub(crate) fn start_watchdog(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        arm_watchdog(Arc::downgrade(self), interval);
    }

    fn first_visible(&self) -> Option<Arc<Message>> {
        let state = self.monitor.lock();
        if state.closed {
            return None;
        }
        let now = now_millis();
        for (store, _) in self.stores() {
            let mut cursor = store.first();
            while let Some(handle) = cursor {
                cursor = store.next(handle);
                if store.is_locked(handle) {
                    continue;
                }
                if let Ok(message) = store.retrieve(handle) {
                    if !message.is_expired(now) {
                        return Some(Arc::new(message));
                    }
                }
            }
        }
        None
    }

    /// Re-announce the oldest visible message, if any. Used when a
    /// consumer attaches or its session starts with a backlog waiting.
    pub(crate) fn nudge(self: &Arc<Self>) {
        if let Some(message) = self.first_visible() {
            self.message_available(&message);
        }
    }

    pub(crate) fn close(&self) {
        {
            let mut state = self.monitor.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        // Blocked receivers must wake and observe the closed flag.
        for entry in self.consumer_snapshot().iter() {
            if let NotifyTarget::Waiter(signal) = &entry.target {
                signal.notify_all();
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.monitor.lock().closed
    }

    pub(crate) fn destroy(&self) -> StorageResult<()> {
        self.close();
        for (store, _) in self.stores() {
            store.destroy()?;
        }
        Ok(())
    }
}

fn arm_watchdog(queue: Weak<LocalQueue>, interval: Duration) {
    let Some(q) = queue.upgrade() else {
        return;
    };
    let timer = Arc::clone(&q.timer);
    timer.schedule(
        interval,
        Task::new(move || {
            let Some(q) = queue.upgrade() else {
                return;
            };
            if q.is_closed() {
                return;
            }
            if let Some(message) = q.first_visible() {
                debug!(destination = %q.id, "watchdog re-notifying stuck message");
                q.notify_for(&message);
            }
            arm_watchdog(Arc::downgrade(&q), interval);
        }),
    );
}

impl Committable for LocalQueue {
    fn open_transaction(&self) {
        self.tx_lock.acquire();
    }

    fn close_transaction(&self) {
        self.tx_lock.release();
    }

    fn commit_changes(&self, barrier: &Arc<CommitBarrier>) -> StorageResult<()> {
        let Some(durable) = &self.durable else {
            return Ok(());
        };
        barrier.register();
        let store = Arc::clone(durable);
        let barrier = Arc::clone(barrier);
        let id = self.id.clone();
        self.executor.execute(Task::new(move || match store.flush() {
            Ok(()) => barrier.arrive(),
            Err(e) => {
                warn!(destination = %id, error = %e, "durable flush failed");
                barrier.arrive_with_error(e.to_string());
            }
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::error::StorageResult;
    use crate::message::DeliveryMode;
    use crate::store::StoreUsage;
    use std::thread;
    use std::time::Instant;

    /// Fail-safe store whose flush takes a while, to observe the gap
    /// between a commit being scheduled and the data being safe.
    struct SlowFlush {
        inner: MemoryStore,
        delay: Duration,
    }

    impl MessageStore for SlowFlush {
        fn store(&self, m: &Message) -> StorageResult<StoreOutcome> {
            self.inner.store(m)
        }
        fn retrieve(&self, h: Handle) -> StorageResult<Message> {
            self.inner.retrieve(h)
        }
        fn replace(&self, h: Handle, m: &Message) -> StorageResult<Handle> {
            self.inner.replace(h, m)
        }
        fn delete(&self, h: Handle) -> StorageResult<()> {
            self.inner.delete(h)
        }
        fn lock(&self, h: Handle) -> StorageResult<()> {
            self.inner.lock(h)
        }
        fn unlock(&self, h: Handle) -> StorageResult<()> {
            self.inner.unlock(h)
        }
        fn is_locked(&self, h: Handle) -> bool {
            self.inner.is_locked(h)
        }
        fn first(&self) -> Option<Handle> {
            self.inner.first()
        }
        fn next(&self, h: Handle) -> Option<Handle> {
            self.inner.next(h)
        }
        fn size(&self) -> usize {
            self.inner.size()
        }
        fn usage(&self) -> StoreUsage {
            self.inner.usage()
        }
        fn delivery_mode(&self) -> DeliveryMode {
            DeliveryMode::Persistent
        }
        fn is_fail_safe(&self) -> bool {
            true
        }
        fn flush(&self) -> StorageResult<()> {
            thread::sleep(self.delay);
            Ok(())
        }
    }

    struct Rig {
        executor: Arc<TaskExecutor>,
        timer: Arc<Timer>,
    }

    impl Rig {
        fn new() -> Self {
            let executor = TaskExecutor::start(&ExecutorConfig {
                workers: 2,
                task_queue_capacity: 64,
            })
            .unwrap();
            let timer = Timer::start(Arc::clone(&executor)).unwrap();
            Self { executor, timer }
        }

        fn queue(
            &self,
            volatile: Option<MemoryStore>,
            durable: Option<Arc<dyn MessageStore>>,
            definition: DestinationDefinition,
        ) -> Arc<LocalQueue> {
            LocalQueue::new(
                DestinationId::queue("under-test"),
                definition,
                volatile,
                durable,
                Arc::clone(&self.executor),
                Arc::clone(&self.timer),
                &DeliveryConfig::default(),
            )
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.timer.shutdown();
            self.executor.shutdown();
        }
    }

    fn copy_of(message: &Message, queue: &LocalQueue) -> Arc<Message> {
        Arc::new(message.internal_copy(Uuid::now_v7(), queue.id().clone()))
    }

    fn put_one(queue: &Arc<LocalQueue>, message: &Message) {
        queue.open_transaction();
        let mut locks = MessageLockSet::default();
        queue
            .put_locked(copy_of(message, queue), &mut locks)
            .unwrap();
        queue.close_transaction();
        for lock in locks.iter() {
            lock.queue.unlock_and_deliver(lock);
        }
    }

    #[test]
    fn put_outside_commit_window_is_rejected() {
        let rig = Rig::new();
        let queue = rig.queue(Some(MemoryStore::new(None)), None, DestinationDefinition::default());
        let mut locks = MessageLockSet::default();
        let err = queue
            .put_locked(copy_of(&Message::text("x"), &queue), &mut locks)
            .unwrap_err();
        assert!(matches!(err, DestinationError::Consistency(_)));
    }

    #[test]
    fn put_is_invisible_until_unlocked() {
        let rig = Rig::new();
        let queue = rig.queue(Some(MemoryStore::new(None)), None, DestinationDefinition::default());

        queue.open_transaction();
        let mut locks = MessageLockSet::default();
        queue
            .put_locked(copy_of(&Message::text("hidden"), &queue), &mut locks)
            .unwrap();
        queue.close_transaction();

        let mut tx = TransactionSet::default();
        assert!(queue.get(&mut tx, None).unwrap().is_none(), "still locked");
        assert_eq!(queue.size(), 1, "but the slot is allocated");

        for lock in locks.iter() {
            lock.queue.unlock_and_deliver(lock);
        }
        assert!(queue.get(&mut tx, None).unwrap().is_some());
    }

    #[test]
    fn non_persistent_put_spills_to_durable_store_when_allowed() {
        let rig = Rig::new();
        let definition = DestinationDefinition {
            capacity: Some(1),
            overflow_to_durable: true,
            ..DestinationDefinition::default()
        };
        let queue = rig.queue(
            Some(MemoryStore::new(Some(1))),
            Some(Arc::new(MemoryStore::new(None))),
            definition,
        );

        queue.open_transaction();
        let mut locks = MessageLockSet::default();
        queue
            .put_locked(copy_of(&Message::text("first"), &queue), &mut locks)
            .unwrap();
        queue
            .put_locked(copy_of(&Message::text("spilled"), &queue), &mut locks)
            .unwrap();
        queue.close_transaction();

        let placements: Vec<bool> = locks.iter().map(|l| l.in_durable).collect();
        assert_eq!(placements, vec![false, true]);
    }

    #[test]
    fn full_on_every_store_is_a_sentinel_error() {
        let rig = Rig::new();
        let definition = DestinationDefinition {
            capacity: Some(1),
            durable: false,
            ..DestinationDefinition::default()
        };
        let queue = rig.queue(Some(MemoryStore::new(Some(1))), None, definition);

        queue.open_transaction();
        let mut locks = MessageLockSet::default();
        queue
            .put_locked(copy_of(&Message::text("fits"), &queue), &mut locks)
            .unwrap();
        let err = queue
            .put_locked(copy_of(&Message::text("overflows"), &queue), &mut locks)
            .unwrap_err();
        queue.close_transaction();
        assert!(matches!(err, DestinationError::Full(_)));
        assert_eq!(locks.len(), 1, "the failed put left no lock behind");
    }

    #[test]
    fn persistent_put_stays_invisible_until_flush_completes() {
        let rig = Rig::new();
        let definition = DestinationDefinition {
            volatile: false,
            ..DestinationDefinition::default()
        };
        let queue = rig.queue(
            None,
            Some(Arc::new(SlowFlush {
                inner: MemoryStore::new(None),
                delay: Duration::from_millis(150),
            })),
            definition,
        );

        let mut message = Message::text("durable");
        message.set_delivery_mode(DeliveryMode::Persistent).unwrap();

        queue.open_transaction();
        let mut locks = MessageLockSet::default();
        let requires_commit = queue
            .put_locked(copy_of(&message, &queue), &mut locks)
            .unwrap();
        assert!(requires_commit);

        let barrier = Arc::new(CommitBarrier::new());
        queue.commit_changes(&barrier).unwrap();
        queue.close_transaction();

        // Flush is in flight: nothing may be visible yet.
        let mut tx = TransactionSet::default();
        let begun = Instant::now();
        assert!(queue.get(&mut tx, None).unwrap().is_none());

        barrier.wait(Duration::from_secs(2)).unwrap();
        assert!(
            begun.elapsed() >= Duration::from_millis(100),
            "barrier must have waited on the slow flush"
        );

        for lock in locks.iter() {
            lock.queue.unlock_and_deliver(lock);
        }
        assert!(queue.get(&mut tx, None).unwrap().is_some());
    }

    #[test]
    fn expired_messages_are_never_delivered_and_get_cleaned_up() {
        let rig = Rig::new();
        let queue = rig.queue(Some(MemoryStore::new(None)), None, DestinationDefinition::default());

        let mut stale = Message::text("stale");
        stale.set_expiration(Some(1)).unwrap();
        put_one(&queue, &stale);
        put_one(&queue, &Message::text("fresh"));

        let mut tx = TransactionSet::default();
        let got = queue.get(&mut tx, None).unwrap().unwrap();
        assert_eq!(got.body(), Message::text("fresh").body());

        // The side task deletes the expired slot.
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.size() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(queue.size(), 1, "only the claimed fresh slot remains");
    }

    #[test]
    fn browse_walks_without_claiming() {
        let rig = Rig::new();
        let queue = rig.queue(Some(MemoryStore::new(None)), None, DestinationDefinition::default());
        put_one(&queue, &Message::text("a"));
        put_one(&queue, &Message::text("b"));

        let mut cursor = BrowseCursor::default();
        let mut seen = Vec::new();
        while let Some(m) = queue.browse(&mut cursor, None).unwrap() {
            seen.push(m);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(queue.size(), 2, "browse must not consume");

        // A claimed message disappears from subsequent browses.
        let mut tx = TransactionSet::default();
        queue.get(&mut tx, None).unwrap().unwrap();
        let mut cursor = BrowseCursor::default();
        assert!(queue.browse(&mut cursor, None).unwrap().is_some());
        assert!(queue.browse(&mut cursor, None).unwrap().is_none());
    }

    #[test]
    fn purge_removes_visible_leaves_claimed() {
        let rig = Rig::new();
        let queue = rig.queue(Some(MemoryStore::new(None)), None, DestinationDefinition::default());
        put_one(&queue, &Message::text("claimed"));
        put_one(&queue, &Message::text("doomed"));

        let mut tx = TransactionSet::default();
        queue.get(&mut tx, None).unwrap().unwrap();

        assert_eq!(queue.purge(None).unwrap(), 1);
        assert_eq!(queue.size(), 1, "the claimed slot survives the purge");
    }

    #[test]
    fn closed_queue_rejects_operations() {
        let rig = Rig::new();
        let queue = rig.queue(Some(MemoryStore::new(None)), None, DestinationDefinition::default());
        queue.close();

        let mut tx = TransactionSet::default();
        assert!(matches!(
            queue.get(&mut tx, None),
            Err(DestinationError::Closed(_))
        ));
        queue.open_transaction();
        let mut locks = MessageLockSet::default();
        assert!(matches!(
            queue.put_locked(copy_of(&Message::text("x"), &queue), &mut locks),
            Err(DestinationError::Closed(_))
        ));
        queue.close_transaction();
    }
}
