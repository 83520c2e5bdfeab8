use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::destination::DestinationId;
use crate::error::{MessageError, StorageError, StorageResult};

pub const MAX_PRIORITY: u8 = 9;
pub const DEFAULT_PRIORITY: u8 = 4;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Durable-store-backed; survives a broker restart once committed.
    Persistent,
    /// Volatile-store-backed; may overflow to the durable store if the
    /// destination allows it, but never forces a store commit.
    NonPersistent,
}

impl DeliveryMode {
    pub fn is_persistent(self) -> bool {
        matches!(self, DeliveryMode::Persistent)
    }
}

/// Typed property value for the second header tier and map/stream bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Message payload. One data type with a variant tag per body shape,
/// rather than a subclass per type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Map(HashMap<String, PropertyValue>),
    Stream(Vec<PropertyValue>),
    /// Opaque application-serialized object.
    Object(Vec<u8>),
}

/// Second header tier: reply-to, correlation, type, and user properties.
/// Materialized lazily when the message was rehydrated from a store, so
/// selector-free delivery never pays the parse cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extras {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub properties: HashMap<String, PropertyValue>,
}

#[derive(Debug)]
enum ExtrasState {
    /// Built in-process; always parsed.
    Parsed(Extras),
    /// Rehydrated from a store; JSON kept raw until first access.
    Raw(Vec<u8>, OnceLock<Extras>),
}

impl Clone for ExtrasState {
    fn clone(&self) -> Self {
        match self {
            ExtrasState::Parsed(e) => ExtrasState::Parsed(e.clone()),
            ExtrasState::Raw(raw, cell) => match cell.get() {
                Some(e) => ExtrasState::Parsed(e.clone()),
                None => ExtrasState::Raw(raw.clone(), OnceLock::new()),
            },
        }
    }
}

/// Serialized shape of a message. The second tier travels as a nested
/// JSON string so rehydration can defer parsing it.
#[derive(Serialize, Deserialize)]
struct MessageRecord {
    id: Uuid,
    destination: Option<DestinationId>,
    priority: u8,
    delivery_mode: DeliveryMode,
    expires_at: Option<u64>,
    redelivered: bool,
    session_id: Option<Uuid>,
    extras: String,
    body: Body,
}

/// Core message type: opaque payload plus a two-tier header set.
/// Mutable only until first transmission (`mark_read_only`), and always
/// copied before entering internal processing — a stored message never
/// aliases a caller-supplied object.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub destination: Option<DestinationId>,
    priority: u8,
    delivery_mode: DeliveryMode,
    expires_at: Option<u64>,
    redelivered: bool,
    /// Non-owning back-reference to the controlling session, resolved
    /// through the session registry at acknowledge time. Stamped with
    /// the producer at send and restamped with the consumer on delivery.
    pub session_id: Option<Uuid>,
    read_only: bool,
    extras: ExtrasState,
    body: Body,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            id: Uuid::now_v7(),
            destination: None,
            priority: DEFAULT_PRIORITY,
            delivery_mode: DeliveryMode::NonPersistent,
            expires_at: None,
            redelivered: false,
            session_id: None,
            read_only: false,
            extras: ExtrasState::Parsed(Extras::default()),
            body,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Body::Text(text.into()))
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    fn check_mutable(&self) -> Result<(), MessageError> {
        if self.read_only {
            Err(MessageError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn set_priority(&mut self, priority: u8) -> Result<(), MessageError> {
        self.check_mutable()?;
        self.priority = priority.min(MAX_PRIORITY);
        Ok(())
    }

    pub fn set_delivery_mode(&mut self, mode: DeliveryMode) -> Result<(), MessageError> {
        self.check_mutable()?;
        self.delivery_mode = mode;
        Ok(())
    }

    /// Absolute expiration in milliseconds since the epoch; `None` never expires.
    pub fn set_expiration(&mut self, expires_at: Option<u64>) -> Result<(), MessageError> {
        self.check_mutable()?;
        self.expires_at = expires_at;
        Ok(())
    }

    pub fn set_reply_to(&mut self, reply_to: impl Into<String>) -> Result<(), MessageError> {
        self.extras_mut()?.reply_to = Some(reply_to.into());
        Ok(())
    }

    pub fn set_correlation_id(&mut self, id: impl Into<String>) -> Result<(), MessageError> {
        self.extras_mut()?.correlation_id = Some(id.into());
        Ok(())
    }

    pub fn set_message_type(&mut self, ty: impl Into<String>) -> Result<(), MessageError> {
        self.extras_mut()?.message_type = Some(ty.into());
        Ok(())
    }

    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> Result<(), MessageError> {
        self.extras_mut()?.properties.insert(key.into(), value);
        Ok(())
    }

    /// Freeze the message. Header and body can no longer be mutated.
    pub fn mark_read_only(&mut self) {
        self.read_only = true;
    }

    /// Access the second header tier, parsing it on first use if the
    /// message came out of a store.
    pub fn extras(&self) -> StorageResult<&Extras> {
        match &self.extras {
            ExtrasState::Parsed(e) => Ok(e),
            ExtrasState::Raw(raw, cell) => {
                if let Some(e) = cell.get() {
                    return Ok(e);
                }
                let parsed: Extras = serde_json::from_slice(raw)
                    .map_err(|e| StorageError::CorruptData(format!("message extras: {e}")))?;
                Ok(cell.get_or_init(|| parsed))
            }
        }
    }

    /// Whether the second tier has been materialized yet.
    pub fn extras_parsed(&self) -> bool {
        match &self.extras {
            ExtrasState::Parsed(_) => true,
            ExtrasState::Raw(_, cell) => cell.get().is_some(),
        }
    }

    fn extras_mut(&mut self) -> Result<&mut Extras, MessageError> {
        self.check_mutable()?;
        if let ExtrasState::Raw(raw, cell) = &self.extras {
            let parsed = cell
                .get()
                .cloned()
                .or_else(|| serde_json::from_slice(raw).ok())
                .unwrap_or_default();
            self.extras = ExtrasState::Parsed(parsed);
        }
        match &mut self.extras {
            ExtrasState::Parsed(e) => Ok(e),
            ExtrasState::Raw(..) => unreachable!("extras materialized above"),
        }
    }

    /// Copy taken at the session boundary: stamps the originating session,
    /// resolves the destination, and freezes the result.
    pub(crate) fn internal_copy(&self, session_id: Uuid, destination: DestinationId) -> Message {
        let mut copy = self.clone();
        copy.session_id = Some(session_id);
        copy.destination = Some(destination);
        copy.read_only = true;
        copy
    }

    /// Redelivery bypasses the read-only fence: the flag is engine state,
    /// not caller-visible mutation.
    pub(crate) fn force_redelivered(&mut self) {
        self.redelivered = true;
    }

    pub(crate) fn to_record(&self) -> StorageResult<Vec<u8>> {
        let extras = match &self.extras {
            ExtrasState::Parsed(e) => serde_json::to_string(e)?,
            ExtrasState::Raw(raw, _) => String::from_utf8(raw.clone())
                .map_err(|e| StorageError::CorruptData(format!("message extras: {e}")))?,
        };
        let record = MessageRecord {
            id: self.id,
            destination: self.destination.clone(),
            priority: self.priority,
            delivery_mode: self.delivery_mode,
            expires_at: self.expires_at,
            redelivered: self.redelivered,
            session_id: self.session_id,
            extras,
            body: self.body.clone(),
        };
        Ok(serde_json::to_vec(&record)?)
    }

    pub(crate) fn from_record(bytes: &[u8]) -> StorageResult<Message> {
        let record: MessageRecord = serde_json::from_slice(bytes)?;
        Ok(Message {
            id: record.id,
            destination: record.destination,
            priority: record.priority,
            delivery_mode: record.delivery_mode,
            expires_at: record.expires_at,
            redelivered: record.redelivered,
            session_id: record.session_id,
            read_only: true,
            extras: ExtrasState::Raw(record.extras.into_bytes(), OnceLock::new()),
            body: record.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_rejects_mutation() {
        let mut msg = Message::text("hello");
        msg.set_priority(7).unwrap();
        msg.mark_read_only();

        assert!(matches!(msg.set_priority(2), Err(MessageError::ReadOnly)));
        assert!(matches!(
            msg.set_delivery_mode(DeliveryMode::Persistent),
            Err(MessageError::ReadOnly)
        ));
        assert!(matches!(
            msg.set_property("k", PropertyValue::Int(1)),
            Err(MessageError::ReadOnly)
        ));
        assert_eq!(msg.priority(), 7);
    }

    #[test]
    fn rehydrated_extras_parse_lazily() {
        let mut msg = Message::text("payload");
        msg.set_property("tenant", PropertyValue::Text("a".into()))
            .unwrap();
        msg.set_correlation_id("corr-1").unwrap();

        let bytes = msg.to_record().unwrap();
        let restored = Message::from_record(&bytes).unwrap();

        assert!(!restored.extras_parsed(), "tier 2 must stay raw until accessed");
        let extras = restored.extras().unwrap();
        assert_eq!(extras.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(
            extras.properties.get("tenant"),
            Some(&PropertyValue::Text("a".into()))
        );
        assert!(restored.extras_parsed());
    }

    #[test]
    fn round_trip_preserves_first_tier() {
        let mut msg = Message::new(Body::Bytes(vec![1, 2, 3]));
        msg.set_delivery_mode(DeliveryMode::Persistent).unwrap();
        msg.set_expiration(Some(42_000)).unwrap();

        let restored = Message::from_record(&msg.to_record().unwrap()).unwrap();
        assert_eq!(restored.id, msg.id);
        assert_eq!(restored.delivery_mode(), DeliveryMode::Persistent);
        assert_eq!(restored.expires_at(), Some(42_000));
        assert!(restored.is_read_only());
        assert_eq!(restored.body(), &Body::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn expiry_check() {
        let mut msg = Message::text("x");
        assert!(!msg.is_expired(u64::MAX));
        msg.set_expiration(Some(1_000)).unwrap();
        assert!(msg.is_expired(1_000));
        assert!(!msg.is_expired(999));
    }

    #[test]
    fn priority_clamped_to_max() {
        let mut msg = Message::text("x");
        msg.set_priority(200).unwrap();
        assert_eq!(msg.priority(), MAX_PRIORITY);
    }
}
