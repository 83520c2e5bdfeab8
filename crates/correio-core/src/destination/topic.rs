use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::destination::queue::LocalQueue;
use crate::destination::{Broker, DestinationDefinition, DestinationId};
use crate::error::{BrokerError, BrokerResult, DestinationError, DestinationResult, StorageResult};
use crate::lock::MessageLockSet;
use crate::message::Message;
use crate::selector::Selector;
use crate::sync::{CommitBarrier, TxLock};
use crate::transaction::Committable;

/// One subscriber's private backlog on a topic. Durable subscriptions
/// carry a name and a durable-store-backed queue; anonymous ones are
/// volatile and die with their consumer.
pub struct Subscription {
    id: Uuid,
    name: Option<String>,
    durable: bool,
    selector: Option<Arc<dyn Selector>>,
    /// No-local filter: publishes stamped with this session id are not
    /// fanned into this subscription.
    no_local: Option<Uuid>,
    queue: Arc<LocalQueue>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn queue(&self) -> &Arc<LocalQueue> {
        &self.queue
    }

    pub fn backlog(&self) -> usize {
        self.queue.size()
    }
}

type SubscriptionList = Arc<Vec<Arc<Subscription>>>;

/// A publish/subscribe destination. A put fans out into every
/// subscription's queue; each subscriber consumes its own copy at its
/// own pace. The topic itself stores nothing.
pub struct LocalTopic {
    id: DestinationId,
    definition: DestinationDefinition,
    broker: Weak<Broker>,
    closed: AtomicBool,
    /// Copy-on-write: fan-out iterates a snapshot without blocking
    /// subscribe/unsubscribe.
    subscriptions: RwLock<SubscriptionList>,
    tx_lock: TxLock,
    /// Subscription sets captured at `open_transaction`, one per nesting
    /// level, so `close_transaction` releases exactly what it opened
    /// even if the live list changed mid-transaction. Only the thread
    /// owning `tx_lock` touches this.
    tx_snapshots: Mutex<Vec<SubscriptionList>>,
}

impl LocalTopic {
    pub(crate) fn new(
        id: DestinationId,
        definition: DestinationDefinition,
        broker: Weak<Broker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            definition,
            broker,
            closed: AtomicBool::new(false),
            subscriptions: RwLock::new(Arc::new(Vec::new())),
            tx_lock: TxLock::default(),
            tx_snapshots: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &DestinationId {
        &self.id
    }

    pub fn definition(&self) -> &DestinationDefinition {
        &self.definition
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    fn snapshot(&self) -> SubscriptionList {
        Arc::clone(&self.subscriptions.read())
    }

    /// Attach a subscription. A durable subscription reattaches by name:
    /// asking for an existing name returns the existing backlog. Passing
    /// a session id as `no_local` hides that session's own publishes
    /// from this subscription.
    pub fn subscribe(
        &self,
        name: Option<&str>,
        selector: Option<Arc<dyn Selector>>,
        durable: bool,
        no_local: Option<Uuid>,
    ) -> BrokerResult<Arc<Subscription>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::NotFound(self.id.to_string()));
        }
        if durable && name.is_none() {
            return Err(BrokerError::InvalidConfig(
                "durable subscription needs a name".into(),
            ));
        }
        let broker = self
            .broker
            .upgrade()
            .ok_or(BrokerError::Stopped)?;

        let mut guard = self.subscriptions.write();
        if let Some(name) = name {
            if let Some(existing) = guard.iter().find(|s| s.name.as_deref() == Some(name)) {
                return Ok(Arc::clone(existing));
            }
        }

        let id = Uuid::now_v7();
        let label = name.map(str::to_owned).unwrap_or_else(|| id.to_string());
        let backed = durable && self.definition.durable;
        let sub_definition = DestinationDefinition {
            durable: backed,
            volatile: true,
            overflow_to_durable: backed && self.definition.overflow_to_durable,
            temporary: false,
            ..self.definition.clone()
        };
        let store_name = format!("{}~{label}", self.id);
        let queue = broker.build_queue(
            DestinationId::queue(format!("{}~{label}", self.id.name)),
            sub_definition,
            &store_name,
        )?;

        let subscription = Arc::new(Subscription {
            id,
            name: name.map(str::to_owned),
            durable,
            selector,
            no_local,
            queue,
        });
        let mut list = (**guard).clone();
        list.push(Arc::clone(&subscription));
        *guard = Arc::new(list);
        info!(destination = %self.id, subscription = %label, durable, "subscription attached");
        Ok(subscription)
    }

    /// Detach a subscription and drop its backlog.
    pub fn unsubscribe(&self, id: Uuid) -> BrokerResult<()> {
        let removed = {
            let mut guard = self.subscriptions.write();
            let mut list = (**guard).clone();
            let before = list.len();
            let removed = list.iter().find(|s| s.id == id).cloned();
            list.retain(|s| s.id != id);
            if list.len() == before {
                return Err(BrokerError::NotFound(format!(
                    "subscription {id} on {}",
                    self.id
                )));
            }
            *guard = Arc::new(list);
            removed
        };
        if let Some(sub) = removed {
            sub.queue.destroy()?;
        }
        if let Some(broker) = self.broker.upgrade() {
            broker.reap_temporary(&self.id);
        }
        Ok(())
    }

    /// Fan the message out into every matching subscription's queue,
    /// accumulating one provisional lock per copy. A failing subscriber
    /// is handled per the destination's policy: logged and skipped, or
    /// propagated so the session rolls the whole put back.
    pub(crate) fn put_locked(
        &self,
        message: Arc<Message>,
        locks: &mut MessageLockSet,
    ) -> DestinationResult<bool> {
        if !self.tx_lock.is_held_by_current_thread() {
            return Err(DestinationError::Consistency(format!(
                "put on {} outside its commit window",
                self.id
            )));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(DestinationError::Closed(self.id.to_string()));
        }
        if message.delivery_mode().is_persistent() && !self.definition.durable {
            return Err(DestinationError::UnsupportedDeliveryMode(
                self.id.to_string(),
            ));
        }
        let snapshot = self
            .tx_snapshots
            .lock()
            .last()
            .cloned()
            .ok_or_else(|| {
                DestinationError::Consistency(format!("{} has no open transaction", self.id))
            })?;

        let policy = self.definition.subscriber_policy;
        let mut requires_commit = false;
        for sub in snapshot.iter() {
            if sub.no_local.is_some() && sub.no_local == message.session_id {
                continue;
            }
            if let Some(sel) = &sub.selector {
                match sel.matches(&message) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        if policy.on_failure.logs() {
                            warn!(destination = %self.id, subscription = %sub.id, error = %e, "subscription selector failed");
                        }
                        if policy.on_failure.propagates() {
                            return Err(e.into());
                        }
                        continue;
                    }
                }
            }
            match sub.queue.put_locked(Arc::clone(&message), locks) {
                Ok(rc) => requires_commit |= rc,
                Err(e @ DestinationError::Full(_)) => {
                    if policy.on_full.logs() {
                        warn!(destination = %self.id, subscription = %sub.id, "subscription backlog full");
                    }
                    if policy.on_full.propagates() {
                        return Err(e);
                    }
                }
                Err(e) => {
                    if policy.on_failure.logs() {
                        warn!(destination = %self.id, subscription = %sub.id, error = %e, "subscription put failed");
                    }
                    if policy.on_failure.propagates() {
                        return Err(e);
                    }
                }
            }
        }
        Ok(requires_commit)
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for sub in self.snapshot().iter() {
            sub.queue.close();
        }
    }

    pub(crate) fn destroy(&self) -> StorageResult<()> {
        self.close();
        for sub in self.snapshot().iter() {
            sub.queue.destroy()?;
        }
        *self.subscriptions.write() = Arc::new(Vec::new());
        Ok(())
    }
}

impl Committable for LocalTopic {
    /// Locks the topic, then each subscription queue of a snapshot taken
    /// under that lock. Because subscription queues are only ever locked
    /// through their topic, the inner order cannot deadlock.
    fn open_transaction(&self) {
        self.tx_lock.acquire();
        let snapshot = self.snapshot();
        for sub in snapshot.iter() {
            sub.queue.open_transaction();
        }
        self.tx_snapshots.lock().push(snapshot);
    }

    fn close_transaction(&self) {
        let snapshot = self.tx_snapshots.lock().pop();
        if let Some(snapshot) = snapshot {
            for sub in snapshot.iter().rev() {
                sub.queue.close_transaction();
            }
        }
        self.tx_lock.release();
    }

    fn commit_changes(&self, barrier: &Arc<CommitBarrier>) -> StorageResult<()> {
        let snapshot = self
            .tx_snapshots
            .lock()
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()));
        for sub in snapshot.iter() {
            sub.queue.commit_changes(barrier)?;
        }
        Ok(())
    }
}
