use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::BrokerConfig;
use crate::error::{
    BrokerError, BrokerResult, CommitResult, DestinationError, DestinationResult, StorageResult,
};
use crate::executor::{TaskExecutor, Timer};
use crate::lock::MessageLockSet;
use crate::message::Message;
use crate::session::{Session, SessionRegistry};
use crate::store::{DurableStorage, MemoryStore, MessageStore};
use crate::sync::CommitBarrier;
use crate::transaction::Committable;

pub mod queue;
pub mod topic;

pub use queue::{BrowseCursor, LocalQueue};
pub use topic::{LocalTopic, Subscription};

/// Destination kind. Part of the identity: a queue and a topic may
/// share a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// Destination identity. The derived ordering (name, then kind) is the
/// single global order every multi-destination operation acquires
/// update locks in, which rules out lock-order deadlocks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DestinationId {
    pub name: String,
    pub kind: DestinationKind,
}

impl DestinationId {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue:{}", self.name),
            DestinationKind::Topic => write!(f, "topic:{}", self.name),
        }
    }
}

/// What a topic does with a subscriber that cannot take a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyAction {
    /// Record the incident and keep going.
    #[default]
    Log,
    /// Fail the publisher's put.
    Propagate,
    /// Both.
    LogAndPropagate,
}

impl PolicyAction {
    pub(crate) fn logs(self) -> bool {
        matches!(self, PolicyAction::Log | PolicyAction::LogAndPropagate)
    }

    pub(crate) fn propagates(self) -> bool {
        matches!(self, PolicyAction::Propagate | PolicyAction::LogAndPropagate)
    }
}

/// Per-destination subscriber failure policy, split by cause.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct SubscriberPolicy {
    /// A subscription's store is full.
    pub on_full: PolicyAction,
    /// Any other store failure.
    pub on_failure: PolicyAction,
}

/// Static shape of a destination, fixed at creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DestinationDefinition {
    /// Per-store slot budget. `None` is unbounded.
    pub capacity: Option<usize>,
    /// Keep a volatile store for non-persistent traffic.
    pub volatile: bool,
    /// Keep a durable store (requires the broker to have one).
    pub durable: bool,
    /// When the volatile store is full, spill non-persistent messages
    /// into the durable store instead of failing the put.
    pub overflow_to_durable: bool,
    /// Grace period before a rolled-back message becomes visible again.
    pub redelivery_delay_ms: u64,
    /// Deleted automatically when its last consumer detaches.
    pub temporary: bool,
    pub subscriber_policy: SubscriberPolicy,
}

impl Default for DestinationDefinition {
    fn default() -> Self {
        Self {
            capacity: None,
            volatile: true,
            durable: true,
            overflow_to_durable: false,
            redelivery_delay_ms: 0,
            temporary: false,
            subscriber_policy: SubscriberPolicy::default(),
        }
    }
}

impl DestinationDefinition {
    /// Volatile-only, auto-deleted. Used for reply destinations.
    pub fn temporary() -> Self {
        Self {
            volatile: true,
            durable: false,
            temporary: true,
            ..Self::default()
        }
    }
}

/// A live destination held by the broker registry.
#[derive(Clone)]
pub enum Destination {
    Queue(Arc<LocalQueue>),
    Topic(Arc<LocalTopic>),
}

impl Destination {
    pub fn id(&self) -> &DestinationId {
        match self {
            Destination::Queue(q) => q.id(),
            Destination::Topic(t) => t.id(),
        }
    }

    pub fn as_queue(&self) -> Option<&Arc<LocalQueue>> {
        match self {
            Destination::Queue(q) => Some(q),
            Destination::Topic(_) => None,
        }
    }

    pub fn as_topic(&self) -> Option<&Arc<LocalTopic>> {
        match self {
            Destination::Topic(t) => Some(t),
            Destination::Queue(_) => None,
        }
    }

    pub(crate) fn put_locked(
        &self,
        message: Arc<Message>,
        locks: &mut MessageLockSet,
    ) -> DestinationResult<bool> {
        match self {
            Destination::Queue(q) => q.put_locked(message, locks),
            Destination::Topic(t) => t.put_locked(message, locks),
        }
    }

    pub(crate) fn close(&self) {
        match self {
            Destination::Queue(q) => q.close(),
            Destination::Topic(t) => t.close(),
        }
    }

    pub(crate) fn destroy(&self) -> StorageResult<()> {
        match self {
            Destination::Queue(q) => q.destroy(),
            Destination::Topic(t) => t.destroy(),
        }
    }
}

impl Committable for Destination {
    fn open_transaction(&self) {
        match self {
            Destination::Queue(q) => q.open_transaction(),
            Destination::Topic(t) => t.open_transaction(),
        }
    }

    fn close_transaction(&self) {
        match self {
            Destination::Queue(q) => q.close_transaction(),
            Destination::Topic(t) => t.close_transaction(),
        }
    }

    fn commit_changes(&self, barrier: &Arc<CommitBarrier>) -> StorageResult<()> {
        match self {
            Destination::Queue(q) => q.commit_changes(barrier),
            Destination::Topic(t) => t.commit_changes(barrier),
        }
    }
}

/// The local delivery engine: destination registry, session factory and
/// the shared background machinery (worker pool, timer, durable store).
pub struct Broker {
    config: BrokerConfig,
    executor: Arc<TaskExecutor>,
    timer: Arc<Timer>,
    durable: Option<Arc<DurableStorage>>,
    destinations: Mutex<HashMap<DestinationId, Destination>>,
    pub(crate) sessions: SessionRegistry,
    shutdown: AtomicBool,
}

impl Broker {
    /// Boot the engine. Pass a database path to enable durable stores;
    /// without one, destinations asking for durability are rejected.
    #[instrument(skip_all)]
    pub fn start(
        config: BrokerConfig,
        durable_path: Option<&Path>,
    ) -> BrokerResult<Arc<Self>> {
        let executor = TaskExecutor::start(&config.executor)?;
        let timer = Timer::start(Arc::clone(&executor))?;
        let durable = match durable_path {
            Some(path) => Some(DurableStorage::open(path)?),
            None => None,
        };

        info!(
            workers = config.executor.workers,
            durable = durable.is_some(),
            "broker started"
        );

        Ok(Arc::new(Self {
            config,
            executor,
            timer,
            durable,
            destinations: Mutex::new(HashMap::new()),
            sessions: SessionRegistry::default(),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.config.delivery.commit_wait_timeout_ms)
    }

    fn build_stores(
        &self,
        definition: &DestinationDefinition,
        store_name: &str,
    ) -> BrokerResult<(Option<MemoryStore>, Option<Arc<dyn MessageStore>>)> {
        if !definition.volatile && !definition.durable {
            return Err(BrokerError::InvalidConfig(
                "destination needs at least one store".into(),
            ));
        }
        let volatile = definition.volatile.then(|| MemoryStore::new(definition.capacity));
        let durable: Option<Arc<dyn MessageStore>> = if definition.durable {
            let storage = self.durable.as_ref().ok_or_else(|| {
                BrokerError::InvalidConfig("durable destination on a broker without storage".into())
            })?;
            Some(Arc::new(storage.store_for(store_name, definition.capacity)?))
        } else {
            if definition.overflow_to_durable {
                return Err(BrokerError::InvalidConfig(
                    "overflow requires a durable store".into(),
                ));
            }
            None
        };
        Ok((volatile, durable))
    }

    pub(crate) fn build_queue(
        &self,
        id: DestinationId,
        definition: DestinationDefinition,
        store_name: &str,
    ) -> BrokerResult<Arc<LocalQueue>> {
        let (volatile, durable) = self.build_stores(&definition, store_name)?;
        let queue = LocalQueue::new(
            id,
            definition,
            volatile,
            durable,
            Arc::clone(&self.executor),
            Arc::clone(&self.timer),
            &self.config.delivery,
        );
        let interval = Duration::from_millis(self.config.delivery.watchdog_interval_ms);
        queue.start_watchdog(interval);
        Ok(queue)
    }

    #[instrument(skip(self, definition))]
    pub fn create_queue(
        &self,
        name: &str,
        definition: DestinationDefinition,
    ) -> BrokerResult<Arc<LocalQueue>> {
        let id = DestinationId::queue(name);
        {
            let registry = self.destinations.lock();
            if registry.contains_key(&id) {
                return Err(BrokerError::AlreadyExists(id.to_string()));
            }
        }
        let queue = self.build_queue(id.clone(), definition, &id.to_string())?;
        let mut registry = self.destinations.lock();
        if registry.contains_key(&id) {
            return Err(BrokerError::AlreadyExists(id.to_string()));
        }
        registry.insert(id.clone(), Destination::Queue(Arc::clone(&queue)));
        info!(destination = %id, "destination created");
        Ok(queue)
    }

    #[instrument(skip(self, definition))]
    pub fn create_topic(
        self: &Arc<Self>,
        name: &str,
        definition: DestinationDefinition,
    ) -> BrokerResult<Arc<LocalTopic>> {
        let id = DestinationId::topic(name);
        {
            let registry = self.destinations.lock();
            if registry.contains_key(&id) {
                return Err(BrokerError::AlreadyExists(id.to_string()));
            }
        }
        let topic = LocalTopic::new(id.clone(), definition, Arc::downgrade(self));
        let mut registry = self.destinations.lock();
        if registry.contains_key(&id) {
            return Err(BrokerError::AlreadyExists(id.to_string()));
        }
        registry.insert(id.clone(), Destination::Topic(Arc::clone(&topic)));
        info!(destination = %id, "destination created");
        Ok(topic)
    }

    pub fn lookup(&self, id: &DestinationId) -> Option<Destination> {
        self.destinations.lock().get(id).cloned()
    }

    /// Remove a destination; its stores are emptied and every pending
    /// consumer wakes up to a closed error.
    #[instrument(skip(self))]
    pub fn delete_destination(&self, id: &DestinationId) -> BrokerResult<()> {
        let removed = self
            .destinations
            .lock()
            .remove(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;
        removed.destroy()?;
        info!(destination = %id, "destination deleted");
        Ok(())
    }

    /// Temporary destinations die with their last consumer.
    pub(crate) fn reap_temporary(&self, id: &DestinationId) {
        let should_reap = {
            let registry = self.destinations.lock();
            match registry.get(id) {
                Some(Destination::Queue(q)) => {
                    q.definition().temporary && q.consumer_count() == 0
                }
                Some(Destination::Topic(t)) => {
                    t.definition().temporary && t.subscription_count() == 0
                }
                None => false,
            }
        };
        if should_reap {
            if let Err(e) = self.delete_destination(id) {
                warn!(destination = %id, error = %e, "temporary destination cleanup failed");
            }
        }
    }

    /// Open a session. Transacted sessions batch puts and gets until an
    /// explicit commit or rollback; non-transacted ones auto-commit each
    /// dispatch and finalize gets through acknowledge.
    pub fn session(self: &Arc<Self>, transacted: bool) -> Arc<Session> {
        let session = Session::new(Arc::downgrade(self), transacted);
        self.sessions.register(&session);
        session
    }

    /// Settle a delivered message through the session that delivered it,
    /// found via the stamp put on the copy at delivery time.
    pub fn acknowledge(&self, message: &Message) -> CommitResult<()> {
        let session_id = message.session_id.ok_or_else(|| {
            DestinationError::Consistency("message carries no session stamp".into())
        })?;
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| DestinationError::Closed(format!("session {session_id}")))?;
        session.acknowledge(Some(&[message.id]))
    }

    /// Orderly stop: sessions roll back, destinations close, background
    /// machinery drains. Idempotent.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sessions.close_all();
        for destination in self.destinations.lock().values() {
            destination.close();
        }
        self.timer.shutdown();
        self.executor.shutdown();
        info!("broker stopped");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
