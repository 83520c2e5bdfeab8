//! Local destination transaction and delivery engine.
//!
//! Queues and topics backed by pluggable message stores, with
//! cross-destination atomic commit: a session's puts and gets settle
//! together, durable writes are awaited on a shared barrier, and no
//! message is visible to a consumer before it is physically safe.

pub mod config;
pub mod destination;
pub mod error;
pub mod executor;
pub mod message;
pub mod selector;
pub mod session;
pub mod stats;
pub mod store;
pub mod sync;
pub mod telemetry;

mod lock;
mod notify;
mod transaction;

pub use config::{BrokerConfig, DeliveryConfig, ExecutorConfig};
pub use destination::{
    Broker, BrowseCursor, Destination, DestinationDefinition, DestinationId, DestinationKind,
    LocalQueue, LocalTopic, PolicyAction, SubscriberPolicy, Subscription,
};
pub use error::{
    BrokerError, BrokerResult, CommitError, CommitResult, DestinationError, DestinationResult,
    MessageError, ReceiveError, SelectorError, StorageError, StorageResult,
};
pub use message::{Body, DeliveryMode, Extras, Message, PropertyValue};
pub use notify::RemoteProxy;
pub use selector::{PropertyIs, Selector};
pub use session::{Session, SessionRegistry};
pub use stats::{Stats, StatsSnapshot};
pub use store::{DurableStorage, DurableStore, Handle, MemoryStore, MessageStore, StoreOutcome, StoreUsage};
pub use transaction::Committable;
