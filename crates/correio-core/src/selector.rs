use crate::error::SelectorError;
use crate::message::{Message, PropertyValue};

/// Compiled boolean predicate over a message's second-tier headers.
///
/// The engine only evaluates selectors — grammar and compilation belong to
/// the caller. Implementations should reach tier-2 data through
/// [`Message::extras`], which materializes it on first access.
pub trait Selector: Send + Sync {
    fn matches(&self, message: &Message) -> Result<bool, SelectorError>;
}

/// Matches messages whose named property equals the given value.
/// Covers administrative purges and tests; richer grammars plug in the
/// same trait.
pub struct PropertyIs {
    pub key: String,
    pub value: PropertyValue,
}

impl PropertyIs {
    pub fn new(key: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

impl Selector for PropertyIs {
    fn matches(&self, message: &Message) -> Result<bool, SelectorError> {
        let extras = message
            .extras()
            .map_err(|e| SelectorError(e.to_string()))?;
        Ok(extras.properties.get(&self.key) == Some(&self.value))
    }
}
