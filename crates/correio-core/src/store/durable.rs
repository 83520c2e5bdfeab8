use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded, Options};
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::message::{DeliveryMode, Message};
use crate::store::keys;
use crate::store::{Handle, MessageStore, StoreOutcome, StoreUsage};

const CF_MESSAGES: &str = "messages";

type Db = DBWithThreadMode<MultiThreaded>;

/// Shared RocksDB database backing every durable store of one broker.
/// Each destination gets a [`DurableStore`] view keyed by its own
/// prefix.
pub struct DurableStorage {
    db: Db,
}

impl DurableStorage {
    /// Open or create the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Arc<Self>> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let descriptors = vec![ColumnFamilyDescriptor::new(CF_MESSAGES, Options::default())];
        let db = Db::open_cf_descriptors(&db_opts, path, descriptors)?;
        Ok(Arc::new(Self { db }))
    }

    /// Build a per-destination store view, rebuilding its handle index
    /// from disk. Lock flags are memory-only: in-flight locks dissolve
    /// on restart and the messages re-enter the visible pool.
    pub fn store_for(
        self: &Arc<Self>,
        destination: &str,
        capacity: Option<usize>,
    ) -> StorageResult<DurableStore> {
        let prefix = keys::destination_prefix(destination);
        let mut slots = BTreeMap::new();
        let mut next_seq = 0i64;

        let cf = self.cf()?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(StorageError::from)?;
            if !key.starts_with(&prefix) {
                break;
            }
            let seq = keys::parse_seq(&key, &prefix).ok_or_else(|| {
                StorageError::CorruptData(format!("bad slot key for destination {destination}"))
            })?;
            slots.insert(seq, false);
            next_seq = next_seq.max(seq + 1);
        }

        if !slots.is_empty() {
            info!(destination, recovered = slots.len(), "recovered durable messages");
        }

        Ok(DurableStore {
            storage: Arc::clone(self),
            name: destination.to_owned(),
            capacity,
            inner: Mutex::new(DurableIndex { slots, next_seq }),
        })
    }

    fn cf(&self) -> StorageResult<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_MESSAGES)
            .ok_or_else(|| StorageError::RocksDb(format!("column family not found: {CF_MESSAGES}")))
    }
}

struct DurableIndex {
    /// seq -> locked flag. Presence means the slot is allocated.
    slots: BTreeMap<i64, bool>,
    next_seq: i64,
}

/// Durable, fail-safe message store: one destination's slice of the
/// shared RocksDB database. Writes land in the WAL immediately;
/// [`MessageStore::flush`] makes them physically safe.
pub struct DurableStore {
    storage: Arc<DurableStorage>,
    name: String,
    capacity: Option<usize>,
    inner: Mutex<DurableIndex>,
}

impl DurableStore {
    fn key(&self, seq: i64) -> Vec<u8> {
        keys::slot_key(&self.name, seq)
    }
}

impl MessageStore for DurableStore {
    fn store(&self, message: &Message) -> StorageResult<StoreOutcome> {
        let mut inner = self.inner.lock();
        if let Some(cap) = self.capacity {
            if inner.slots.len() >= cap {
                return Ok(StoreOutcome::Full);
            }
        }
        let seq = inner.next_seq;
        let cf = self.storage.cf()?;
        self.storage
            .db
            .put_cf(&cf, self.key(seq), message.to_record()?)?;
        inner.next_seq += 1;
        inner.slots.insert(seq, false);
        Ok(StoreOutcome::Stored(Handle(seq)))
    }

    fn retrieve(&self, handle: Handle) -> StorageResult<Message> {
        let inner = self.inner.lock();
        if !inner.slots.contains_key(&handle.0) {
            return Err(StorageError::HandleNotFound(handle.0));
        }
        let cf = self.storage.cf()?;
        let bytes = self
            .storage
            .db
            .get_cf(&cf, self.key(handle.0))?
            .ok_or(StorageError::HandleNotFound(handle.0))?;
        Message::from_record(&bytes)
    }

    fn replace(&self, handle: Handle, message: &Message) -> StorageResult<Handle> {
        let inner = self.inner.lock();
        if !inner.slots.contains_key(&handle.0) {
            return Err(StorageError::HandleNotFound(handle.0));
        }
        let cf = self.storage.cf()?;
        self.storage
            .db
            .put_cf(&cf, self.key(handle.0), message.to_record()?)?;
        Ok(handle)
    }

    fn delete(&self, handle: Handle) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.slots.remove(&handle.0).is_none() {
            return Err(StorageError::HandleNotFound(handle.0));
        }
        let cf = self.storage.cf()?;
        self.storage.db.delete_cf(&cf, self.key(handle.0))?;
        Ok(())
    }

    fn lock(&self, handle: Handle) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(&handle.0) {
            Some(locked) => {
                *locked = true;
                Ok(())
            }
            None => Err(StorageError::HandleNotFound(handle.0)),
        }
    }

    fn unlock(&self, handle: Handle) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(&handle.0) {
            Some(locked) => {
                *locked = false;
                Ok(())
            }
            None => Err(StorageError::HandleNotFound(handle.0)),
        }
    }

    fn is_locked(&self, handle: Handle) -> bool {
        self.inner
            .lock()
            .slots
            .get(&handle.0)
            .copied()
            .unwrap_or(false)
    }

    fn first(&self) -> Option<Handle> {
        self.inner.lock().slots.keys().next().copied().map(Handle)
    }

    fn next(&self, handle: Handle) -> Option<Handle> {
        self.inner
            .lock()
            .slots
            .range((Bound::Excluded(handle.0), Bound::Unbounded))
            .next()
            .map(|(seq, _)| Handle(*seq))
    }

    fn size(&self) -> usize {
        self.inner.lock().slots.len()
    }

    fn usage(&self) -> StoreUsage {
        StoreUsage {
            size: self.size(),
            capacity: self.capacity,
        }
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Persistent
    }

    fn is_fail_safe(&self) -> bool {
        true
    }

    fn flush(&self) -> StorageResult<()> {
        self.storage.db.flush_wal(true)?;
        Ok(())
    }

    fn destroy(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let cf = self.storage.cf()?;
        for seq in inner.slots.keys().copied().collect::<Vec<_>>() {
            self.storage.db.delete_cf(&cf, self.key(seq))?;
        }
        inner.slots.clear();
        Ok(())
    }
}
