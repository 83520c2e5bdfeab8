//! Durability across a broker restart.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::persistent_text;
use correio_core::{Broker, BrokerConfig, Destination, DestinationDefinition, Message};

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn committed_persistent_messages_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let broker = Broker::start(BrokerConfig::default(), Some(dir.path())).unwrap();
        let queue = broker
            .create_queue("orders", DestinationDefinition::default())
            .unwrap();
        let session = broker.session(false);
        let dest = Destination::Queue(Arc::clone(&queue));
        session.send(&dest, &persistent_text("invoice")).unwrap();
        session.send(&dest, &Message::text("ephemeral")).unwrap();
        assert_eq!(queue.size(), 2);
        broker.shutdown();
    }

    let broker = Broker::start(BrokerConfig::default(), Some(dir.path())).unwrap();
    let queue = broker
        .create_queue("orders", DestinationDefinition::default())
        .unwrap();
    assert_eq!(queue.size(), 1, "only the persistent message survives");

    let session = broker.session(false);
    session.start();
    let consumer = session.create_consumer(&queue, None);
    let got = session.receive(consumer, WAIT).unwrap().unwrap();
    assert_eq!(got.body(), Message::text("invoice").body());
    assert!(
        !got.redelivered(),
        "it was never claimed, so the restart is not a redelivery"
    );
    session.acknowledge(None).unwrap();
    broker.shutdown();
}

#[test]
fn claimed_but_unsettled_messages_reappear_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id;

    {
        let broker = Broker::start(BrokerConfig::default(), Some(dir.path())).unwrap();
        let queue = broker
            .create_queue("jobs", DestinationDefinition::default())
            .unwrap();
        let session = broker.session(false);
        session
            .send(
                &Destination::Queue(Arc::clone(&queue)),
                &persistent_text("task"),
            )
            .unwrap();

        session.start();
        let consumer = session.create_consumer(&queue, None);
        let claimed = session.receive(consumer, WAIT).unwrap().unwrap();
        id = claimed.id;
        // Shut down without settling: closing the session rolls the
        // claim back before the store goes away.
        broker.shutdown();
    }

    let broker = Broker::start(BrokerConfig::default(), Some(dir.path())).unwrap();
    let queue = broker
        .create_queue("jobs", DestinationDefinition::default())
        .unwrap();
    assert_eq!(queue.size(), 1);

    let session = broker.session(false);
    session.start();
    let consumer = session.create_consumer(&queue, None);
    let got = session.receive(consumer, WAIT).unwrap().unwrap();
    assert_eq!(got.id, id);
    assert!(got.redelivered(), "the rolled-back claim comes back flagged");
    broker.shutdown();
}
