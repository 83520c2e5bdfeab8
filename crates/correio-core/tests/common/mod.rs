#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use correio_core::{Broker, BrokerConfig, DeliveryMode, DestinationDefinition, Message};

/// Broker backed by a throwaway RocksDB directory.
pub fn durable_broker() -> (Arc<Broker>, TempDir) {
    correio_core::telemetry::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::start(BrokerConfig::default(), Some(dir.path())).unwrap();
    (broker, dir)
}

/// Broker with no durable storage at all.
pub fn volatile_broker() -> Arc<Broker> {
    correio_core::telemetry::init_tracing();
    Broker::start(BrokerConfig::default(), None).unwrap()
}

pub fn volatile_queue(capacity: Option<usize>) -> DestinationDefinition {
    DestinationDefinition {
        capacity,
        durable: false,
        ..DestinationDefinition::default()
    }
}

pub fn persistent_text(text: &str) -> Message {
    let mut message = Message::text(text);
    message.set_delivery_mode(DeliveryMode::Persistent).unwrap();
    message
}
