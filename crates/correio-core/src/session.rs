use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::destination::queue::LocalQueue;
use crate::destination::topic::{LocalTopic, Subscription};
use crate::destination::{Broker, Destination, DestinationId};
use crate::error::{
    BrokerResult, CommitError, CommitResult, DestinationError, DestinationResult, ReceiveError,
};
use crate::lock::MessageLockSet;
use crate::message::Message;
use crate::notify::{ConsumerEntry, NotifyTarget, RemoteProxy, Signal};
use crate::selector::Selector;
use crate::sync::CommitBarrier;
use crate::transaction::{Committable, TransactionSet};

const FALLBACK_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// A message produced but not yet committed. The store write is
/// deferred to the commit pass so a rolled-back transacted send costs
/// nothing.
struct PendingPut {
    destination: Destination,
    message: Arc<Message>,
}

/// Session-side record of an attached consumer.
struct ConsumerRecord {
    id: Uuid,
    queue: Arc<LocalQueue>,
    /// Registry identity to reap if temporary: the queue itself, or the
    /// topic a subscription queue hangs off.
    origin: DestinationId,
    selector: Option<Arc<dyn Selector>>,
}

#[derive(Default)]
struct SessionInner {
    pending_puts: Vec<PendingPut>,
    tx_set: TransactionSet,
    consumers: Vec<ConsumerRecord>,
}

/// Which uncommitted gets a finalize pass settles.
enum GetScope<'a> {
    /// Leave gets alone (auto-commit of a single send).
    Untouched,
    All,
    Selected(&'a [Uuid]),
}

impl GetScope<'_> {
    fn ids(&self) -> Option<&[Uuid]> {
        match self {
            GetScope::Untouched | GetScope::All => None,
            GetScope::Selected(ids) => Some(ids),
        }
    }

    fn touches_gets(&self) -> bool {
        !matches!(self, GetScope::Untouched)
    }
}

/// The unit of transactional work. A transacted session batches puts
/// and gets until commit or rollback; a non-transacted one auto-commits
/// each send and settles gets through acknowledge/recover.
///
/// Commit runs a two-phase pass over every involved destination:
/// update locks are taken in the global destination order, changes are
/// applied under provisional message locks, durable flushes are awaited
/// on a shared barrier, and only then do the locks drop — a message is
/// never visible before it is safe.
pub struct Session {
    id: Uuid,
    broker: Weak<Broker>,
    transacted: bool,
    /// Delivery gate shared with every consumer entry this session
    /// registers; toggled by start/stop.
    started: Arc<AtomicBool>,
    /// One wake-up channel for all of this session's blocked receives.
    signal: Arc<Signal>,
    closed: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(broker: Weak<Broker>, transacted: bool) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::now_v7(),
            broker,
            transacted,
            started: Arc::new(AtomicBool::new(false)),
            signal: Arc::new(Signal::new()),
            closed: AtomicBool::new(false),
            inner: Mutex::new(SessionInner::default()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    fn commit_timeout(&self) -> Duration {
        self.broker
            .upgrade()
            .map(|b| b.commit_timeout())
            .unwrap_or(FALLBACK_COMMIT_TIMEOUT)
    }

    fn check_open(&self) -> CommitResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(DestinationError::Closed(format!("session {}", self.id)).into())
        } else {
            Ok(())
        }
    }

    /// Begin delivery. Consumers attached while stopped see their
    /// backlog now.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        self.signal.notify_all();
        let queues: Vec<Arc<LocalQueue>> = self
            .inner
            .lock()
            .consumers
            .iter()
            .map(|c| Arc::clone(&c.queue))
            .collect();
        for queue in queues {
            queue.nudge();
        }
    }

    /// Pause delivery. In-flight receives return empty; nothing is lost.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    // Producing.

    /// Send a message. Transacted sessions park it until commit;
    /// otherwise the put commits on the spot (gets stay untouched).
    pub fn send(&self, destination: &Destination, message: &Message) -> CommitResult<()> {
        self.check_open()?;
        let copy = Arc::new(message.internal_copy(self.id, destination.id().clone()));
        let put = PendingPut {
            destination: destination.clone(),
            message: copy,
        };
        if self.transacted {
            self.inner.lock().pending_puts.push(put);
            Ok(())
        } else {
            self.finalize(vec![put], GetScope::Untouched)
        }
    }

    // Consuming.

    /// Attach a receiving consumer to a queue.
    pub fn create_consumer(
        self: &Arc<Self>,
        queue: &Arc<LocalQueue>,
        selector: Option<Arc<dyn Selector>>,
    ) -> Uuid {
        self.attach(
            Arc::clone(queue),
            queue.id().clone(),
            selector,
            |session, _| NotifyTarget::Waiter(Arc::clone(&session.signal)),
        )
        .0
    }

    /// Attach to a topic through a subscription; consuming drains the
    /// subscription's private backlog. With `no_local`, this session's
    /// own publishes are filtered out of the fan-out. Returns the
    /// consumer id and the subscription it feeds from.
    pub fn create_subscriber(
        self: &Arc<Self>,
        topic: &Arc<LocalTopic>,
        name: Option<&str>,
        selector: Option<Arc<dyn Selector>>,
        durable: bool,
        no_local: bool,
    ) -> BrokerResult<(Uuid, Arc<Subscription>)> {
        let subscription =
            topic.subscribe(name, selector.clone(), durable, no_local.then_some(self.id))?;
        let (id, _) = self.attach(
            Arc::clone(subscription.queue()),
            topic.id().clone(),
            selector,
            |session, _| NotifyTarget::Waiter(Arc::clone(&session.signal)),
        );
        Ok((id, subscription))
    }

    /// Attach a push consumer feeding a remote peer: messages are pulled
    /// as prefetch credits allow and handed out through the returned
    /// channel. [`RemoteProxy::confirm`] restores credits.
    pub fn create_remote_consumer(
        self: &Arc<Self>,
        queue: &Arc<LocalQueue>,
        selector: Option<Arc<dyn Selector>>,
        prefetch: usize,
    ) -> (Uuid, Arc<RemoteProxy>, Receiver<Message>) {
        let (proxy, rx) = RemoteProxy::new(Arc::downgrade(self), selector.clone(), prefetch.max(1));
        let handle = Arc::clone(&proxy);
        let (id, _) = self.attach(Arc::clone(queue), queue.id().clone(), selector, move |_, _| {
            NotifyTarget::Proxy(Arc::clone(&handle))
        });
        (id, proxy, rx)
    }

    fn attach(
        self: &Arc<Self>,
        queue: Arc<LocalQueue>,
        origin: DestinationId,
        selector: Option<Arc<dyn Selector>>,
        target: impl FnOnce(&Arc<Self>, Uuid) -> NotifyTarget,
    ) -> (Uuid, Arc<ConsumerEntry>) {
        let id = Uuid::now_v7();
        let entry = Arc::new(ConsumerEntry {
            id,
            selector: selector.clone(),
            started: Arc::clone(&self.started),
            target: target(self, id),
        });
        queue.register_consumer(Arc::clone(&entry));
        self.inner.lock().consumers.push(ConsumerRecord {
            id,
            queue: Arc::clone(&queue),
            origin,
            selector,
        });
        // A backlog may already be waiting.
        queue.nudge();
        (id, entry)
    }

    /// Detach a consumer. Its unacknowledged messages stay with the
    /// session until acknowledge, recover or close.
    pub fn close_consumer(&self, consumer: Uuid) {
        let record = {
            let mut inner = self.inner.lock();
            let pos = inner.consumers.iter().position(|c| c.id == consumer);
            pos.map(|p| inner.consumers.remove(p))
        };
        if let Some(record) = record {
            record.queue.deregister_consumer(consumer);
            if let Some(broker) = self.broker.upgrade() {
                broker.reap_temporary(&record.origin);
            }
        }
    }

    /// Blocking receive: claim the next visible matching message, or
    /// wait for one up to `timeout`. A zero timeout is receive-no-wait.
    pub fn receive(
        &self,
        consumer: Uuid,
        timeout: Duration,
    ) -> Result<Option<Message>, ReceiveError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReceiveError::Closed);
            }
            // Epoch read precedes the scan: a notification landing
            // between scan and sleep moves the epoch and the wait
            // returns immediately.
            let seen = self.signal.epoch();

            let (queue, selector) = {
                let inner = self.inner.lock();
                match inner.consumers.iter().find(|c| c.id == consumer) {
                    Some(r) => (Arc::clone(&r.queue), r.selector.clone()),
                    None => return Err(ReceiveError::Closed),
                }
            };

            if self.started.load(Ordering::Acquire) {
                match self.pull(&queue, selector.as_deref()) {
                    Ok(Some(message)) => return Ok(Some(message)),
                    Ok(None) => {}
                    Err(DestinationError::Closed(_)) => return Err(ReceiveError::Closed),
                    Err(e) => return Err(e.into()),
                }
            }

            if !self.signal.wait_changed(seen, deadline) {
                return Ok(None);
            }
        }
    }

    /// Claim one visible message into this session's transaction set.
    pub(crate) fn pull(
        &self,
        queue: &Arc<LocalQueue>,
        selector: Option<&dyn Selector>,
    ) -> DestinationResult<Option<Message>> {
        let mut inner = self.inner.lock();
        Ok(queue.get(&mut inner.tx_set, selector)?.map(|mut message| {
            // Restamp the delivered copy with the consuming session so a
            // message-level acknowledge resolves back here, not to the
            // producer. The stored copy keeps the producer stamp.
            message.session_id = Some(self.id);
            message
        }))
    }

    /// Number of claimed-but-unsettled messages.
    pub fn unsettled(&self) -> usize {
        self.inner.lock().tx_set.len()
    }

    // Settling.

    /// Commit the transaction: every parked put becomes visible and
    /// every claimed get is removed, atomically across destinations.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn commit(&self) -> CommitResult<()> {
        self.check_open()?;
        if !self.transacted {
            return Err(DestinationError::Consistency(
                "commit on a non-transacted session".into(),
            )
            .into());
        }
        let puts = std::mem::take(&mut self.inner.lock().pending_puts);
        self.finalize(puts, GetScope::All)
    }

    /// Roll the transaction back: parked puts are dropped, claimed gets
    /// go back to their queues flagged redelivered.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn rollback(&self) -> CommitResult<()> {
        self.check_open()?;
        if !self.transacted {
            return Err(DestinationError::Consistency(
                "rollback on a non-transacted session".into(),
            )
            .into());
        }
        self.inner.lock().pending_puts.clear();
        self.redeliver(None)
    }

    /// Non-transacted settle: finalize claimed gets. `None` settles all
    /// of them, otherwise only the named messages.
    pub fn acknowledge(&self, ids: Option<&[Uuid]>) -> CommitResult<()> {
        self.check_open()?;
        let scope = match ids {
            Some(ids) => GetScope::Selected(ids),
            None => GetScope::All,
        };
        self.finalize(Vec::new(), scope)
    }

    /// Non-transacted undo: unacknowledged messages return to their
    /// queues flagged redelivered. `None` recovers all of them,
    /// otherwise only the named messages.
    pub fn recover(&self, ids: Option<&[Uuid]>) -> CommitResult<()> {
        self.check_open()?;
        self.redeliver(ids)
    }

    /// The commit pass. Order is load-bearing:
    /// destinations are locked in the global order, all store changes
    /// happen inside the window under provisional locks, the window
    /// closes, durability is awaited, and only then does anything become
    /// visible.
    fn finalize(&self, puts: Vec<PendingPut>, scope: GetScope<'_>) -> CommitResult<()> {
        let begun = Instant::now();
        let mut inner = self.inner.lock();

        let mut participants: BTreeMap<DestinationId, Destination> = BTreeMap::new();
        for put in &puts {
            participants.insert(put.destination.id().clone(), put.destination.clone());
        }
        if scope.touches_gets() {
            for queue in inner.tx_set.queues(scope.ids()) {
                participants.insert(queue.id().clone(), Destination::Queue(queue));
            }
        }
        if participants.is_empty() {
            return Ok(());
        }

        for destination in participants.values() {
            destination.open_transaction();
        }

        let mut locks = MessageLockSet::default();
        let barrier = Arc::new(CommitBarrier::new());

        let worked = (|| -> CommitResult<()> {
            let mut committables: BTreeSet<DestinationId> = BTreeSet::new();
            for put in &puts {
                match put.destination.put_locked(Arc::clone(&put.message), &mut locks) {
                    Ok(true) => {
                        committables.insert(put.destination.id().clone());
                    }
                    Ok(false) => {}
                    Err(source) => {
                        return Err(CommitError::Put {
                            destination: put.destination.id().to_string(),
                            source,
                        })
                    }
                }
            }
            if scope.touches_gets() {
                for (id, destination) in &participants {
                    if let Destination::Queue(queue) = destination {
                        let items = inner.tx_set.take(id, scope.ids());
                        if !items.is_empty() && queue.remove(&items)? {
                            committables.insert(id.clone());
                        }
                    }
                }
            }
            // Only the destinations that reported a pending durable
            // change flush; their writes land concurrently behind the
            // shared barrier.
            for id in &committables {
                if let Some(destination) = participants.get(id) {
                    destination
                        .commit_changes(&barrier)
                        .map_err(|e| CommitError::Flush(e.to_string()))?;
                }
            }
            Ok(())
        })();

        let worked = match worked {
            Ok(()) => Ok(()),
            Err(e) => {
                // Roll back the provisional puts while still inside the
                // window; claimed gets stay claimed.
                for lock in locks.drain() {
                    lock.queue.discard_locked(&lock);
                }
                Err(e)
            }
        };

        for destination in participants.values().rev() {
            destination.close_transaction();
        }
        drop(inner);
        worked?;

        // Visibility strictly after durability. On timeout or flush
        // failure the locks are abandoned still held: the messages stay
        // invisible rather than risk delivering an unsafe write.
        if let Err(e) = barrier.wait(self.commit_timeout()) {
            warn!(session = %self.id, error = %e, "commit wait failed, provisional messages stay locked");
            return Err(e);
        }

        for lock in locks.iter() {
            lock.queue.unlock_and_deliver(lock);
        }

        let elapsed = begun.elapsed();
        for destination in participants.values() {
            if let Destination::Queue(queue) = destination {
                queue.stats().record_commit(elapsed);
            }
        }
        debug!(session = %self.id, destinations = participants.len(), ?elapsed, "commit finished");
        Ok(())
    }

    /// The rollback pass: mirror of [`finalize`](Self::finalize) that
    /// replaces claimed gets instead of removing them.
    fn redeliver(&self, ids: Option<&[Uuid]>) -> CommitResult<()> {
        let mut inner = self.inner.lock();
        let queues = inner.tx_set.queues(ids);
        if queues.is_empty() {
            return Ok(());
        }
        let mut participants: BTreeMap<DestinationId, Arc<LocalQueue>> = BTreeMap::new();
        for queue in queues {
            participants.insert(queue.id().clone(), queue);
        }

        for queue in participants.values() {
            queue.open_transaction();
        }

        let mut locks = MessageLockSet::default();
        let barrier = Arc::new(CommitBarrier::new());

        let worked = (|| -> CommitResult<()> {
            let mut committables: BTreeSet<DestinationId> = BTreeSet::new();
            for (id, queue) in &participants {
                let items = inner.tx_set.take(id, ids);
                if !items.is_empty() && queue.redeliver_locked(items, &mut locks)? {
                    committables.insert(id.clone());
                }
            }
            for id in &committables {
                if let Some(queue) = participants.get(id) {
                    queue
                        .commit_changes(&barrier)
                        .map_err(|e| CommitError::Flush(e.to_string()))?;
                }
            }
            Ok(())
        })();

        for queue in participants.values().rev() {
            queue.close_transaction();
        }
        drop(inner);
        worked?;

        if let Err(e) = barrier.wait(self.commit_timeout()) {
            warn!(session = %self.id, error = %e, "rollback wait failed, redelivered messages stay locked");
            return Err(e);
        }

        for lock in locks.iter() {
            lock.queue.unlock_and_deliver(lock);
        }
        Ok(())
    }

    /// Close the session: implicit rollback of anything unsettled,
    /// consumers detached, blocked receives woken. Idempotent.
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.lock().pending_puts.clear();
        if let Err(e) = self.redeliver(None) {
            warn!(session = %self.id, error = %e, "rollback on close failed");
        }
        let consumers = std::mem::take(&mut self.inner.lock().consumers);
        for record in &consumers {
            record.queue.deregister_consumer(record.id);
        }
        if let Some(broker) = self.broker.upgrade() {
            for record in &consumers {
                broker.reap_temporary(&record.origin);
            }
            broker.sessions.remove(self.id);
        }
        self.signal.notify_all();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Weak map of live sessions, keyed by id. Lets a consumer acknowledge
/// through the session a message originated from.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Weak<Session>>>,
}

impl SessionRegistry {
    pub(crate) fn register(&self, session: &Arc<Session>) {
        self.sessions
            .lock()
            .insert(session.id, Arc::downgrade(session));
    }

    pub(crate) fn remove(&self, id: Uuid) {
        self.sessions.lock().remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for session in sessions {
            session.close();
        }
    }
}
