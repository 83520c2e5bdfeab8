/// Infrastructure errors raised by message stores (RocksDB, serialization,
/// slot bookkeeping). Store operations can only fail with these — domain
/// conditions such as capacity exhaustion are sentinels, not errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("no message at handle {0}")]
    HandleNotFound(i64),

    #[error("corrupt data: {0}")]
    CorruptData(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised by operations against a single destination.
#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    /// Every store the put was allowed to try reported a full sentinel.
    /// Recoverable: the session rolls back this put's locks and continues.
    #[error("destination full: {0}")]
    Full(String),

    #[error("destination closed: {0}")]
    Closed(String),

    /// Programming-error class: a caller broke an engine invariant
    /// (missing transaction lock, non-internal message copy, a
    /// non-fail-safe subscription demanding a durable commit).
    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("delivery mode not supported by {0}")]
    UnsupportedDeliveryMode(String),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors surfaced by the session commit/rollback protocol.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// A put failed mid-commit. Locks were already rolled back and
    /// destination update locks released before this was raised.
    #[error("put to {destination} failed: {source}")]
    Put {
        destination: String,
        source: DestinationError,
    },

    /// The barrier wait was interrupted or timed out. Destination update
    /// locks are released; put locks stay held so visibility never
    /// precedes durability.
    #[error("commit wait interrupted: {0}")]
    Interrupted(String),

    #[error("durable flush failed: {0}")]
    Flush(String),

    #[error(transparent)]
    Destination(#[from] DestinationError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("session or consumer closed")]
    Closed,

    #[error(transparent)]
    Destination(#[from] DestinationError),
}

/// Raised by message mutators after `mark_read_only`.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message is read-only")]
    ReadOnly,
}

/// Evaluation failure inside a caller-supplied selector predicate.
#[derive(Debug, thiserror::Error)]
#[error("selector error: {0}")]
pub struct SelectorError(pub String);

/// Broker-level administrative errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("destination already exists: {0}")]
    AlreadyExists(String),

    #[error("destination not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker spawn failed: {0}")]
    Spawn(String),

    #[error("broker stopped")]
    Stopped,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type DestinationResult<T> = std::result::Result<T, DestinationError>;
pub type CommitResult<T> = std::result::Result<T, CommitError>;
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
