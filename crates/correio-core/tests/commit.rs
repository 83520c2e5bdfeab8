//! Cross-destination commit and rollback behavior.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{durable_broker, persistent_text, volatile_broker, volatile_queue};
use correio_core::{CommitError, Destination, DestinationError, Message};

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn transacted_puts_invisible_until_commit() {
    let broker = volatile_broker();
    let orders = broker.create_queue("orders", volatile_queue(None)).unwrap();
    let audit = broker.create_queue("audit", volatile_queue(None)).unwrap();

    let session = broker.session(true);
    session
        .send(&Destination::Queue(Arc::clone(&orders)), &Message::text("o1"))
        .unwrap();
    session
        .send(&Destination::Queue(Arc::clone(&audit)), &Message::text("a1"))
        .unwrap();

    assert_eq!(orders.size(), 0, "nothing stored before commit");
    assert_eq!(audit.size(), 0);

    session.commit().unwrap();
    assert_eq!(orders.size(), 1);
    assert_eq!(audit.size(), 1);
    broker.shutdown();
}

#[test]
fn failed_put_rolls_back_every_sibling_destination() {
    let broker = volatile_broker();
    let wide = broker.create_queue("wide", volatile_queue(None)).unwrap();
    let narrow = broker
        .create_queue("narrow", volatile_queue(Some(1)))
        .unwrap();

    // Occupy the narrow queue's only slot.
    let filler = broker.session(false);
    filler
        .send(
            &Destination::Queue(Arc::clone(&narrow)),
            &Message::text("occupier"),
        )
        .unwrap();

    let session = broker.session(true);
    session
        .send(&Destination::Queue(Arc::clone(&wide)), &Message::text("a"))
        .unwrap();
    session
        .send(&Destination::Queue(Arc::clone(&narrow)), &Message::text("b"))
        .unwrap();

    let err = session.commit().unwrap_err();
    assert!(
        matches!(
            &err,
            CommitError::Put {
                source: DestinationError::Full(_),
                ..
            }
        ),
        "unexpected error: {err}"
    );

    assert_eq!(wide.size(), 0, "the sibling put must be rolled back");
    assert_eq!(narrow.size(), 1);

    // The session stays usable after a failed commit.
    session
        .send(&Destination::Queue(Arc::clone(&wide)), &Message::text("c"))
        .unwrap();
    session.commit().unwrap();
    assert_eq!(wide.size(), 1);
    broker.shutdown();
}

#[test]
fn opposed_cross_destination_commits_do_not_deadlock() {
    let broker = volatile_broker();
    let a = broker.create_queue("a", volatile_queue(None)).unwrap();
    let b = broker.create_queue("b", volatile_queue(None)).unwrap();

    let seeder = broker.session(false);
    seeder
        .send(&Destination::Queue(Arc::clone(&a)), &Message::text("seed-a"))
        .unwrap();
    seeder
        .send(&Destination::Queue(Arc::clone(&b)), &Message::text("seed-b"))
        .unwrap();

    let gate = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for (from, to) in [(Arc::clone(&a), Arc::clone(&b)), (Arc::clone(&b), Arc::clone(&a))] {
        let broker = Arc::clone(&broker);
        let gate = Arc::clone(&gate);
        handles.push(thread::spawn(move || {
            let session = broker.session(true);
            session.start();
            let consumer = session.create_consumer(&from, None);
            let message = session.receive(consumer, WAIT).unwrap().unwrap();
            session
                .send(&Destination::Queue(to), &Message::text("forwarded"))
                .unwrap();
            // Line both commits up against each other.
            gate.wait();
            session.commit().unwrap();
            message.id
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(a.size(), 1, "lost one, gained one");
    assert_eq!(b.size(), 1);
    broker.shutdown();
}

#[test]
fn capacity_two_fill_fail_drain_refill() {
    let broker = volatile_broker();
    let queue = broker.create_queue("tiny", volatile_queue(Some(2))).unwrap();
    let dest = Destination::Queue(Arc::clone(&queue));

    let session = broker.session(true);
    session.start();
    let consumer = session.create_consumer(&queue, None);

    session.send(&dest, &Message::text("m1")).unwrap();
    session.send(&dest, &Message::text("m2")).unwrap();
    session.commit().unwrap();
    assert_eq!(queue.size(), 2);

    session.send(&dest, &Message::text("m3")).unwrap();
    let err = session.commit().unwrap_err();
    assert!(matches!(
        err,
        CommitError::Put {
            source: DestinationError::Full(_),
            ..
        }
    ));
    assert_eq!(queue.size(), 2);

    // Drain one slot, then the put fits.
    let first = session.receive(consumer, WAIT).unwrap().unwrap();
    assert_eq!(first.body(), Message::text("m1").body());
    session.commit().unwrap();
    assert_eq!(queue.size(), 1);

    session.send(&dest, &Message::text("m3")).unwrap();
    session.commit().unwrap();
    assert_eq!(queue.size(), 2);
    broker.shutdown();
}

#[test]
fn commit_spans_durable_and_volatile_destinations() {
    // One participant needs a durable flush, the other none at all; the
    // commit must apply both sides atomically regardless.
    let (broker, _dir) = durable_broker();
    let ledger = broker
        .create_queue("ledger", correio_core::DestinationDefinition::default())
        .unwrap();
    let scratch = broker.create_queue("scratch", volatile_queue(None)).unwrap();

    let seeder = broker.session(false);
    seeder
        .send(
            &Destination::Queue(Arc::clone(&ledger)),
            &persistent_text("entry"),
        )
        .unwrap();

    let session = broker.session(true);
    session.start();
    let consumer = session.create_consumer(&ledger, None);
    session.receive(consumer, WAIT).unwrap().unwrap();
    session
        .send(
            &Destination::Queue(Arc::clone(&scratch)),
            &Message::text("note"),
        )
        .unwrap();

    session.commit().unwrap();
    assert_eq!(ledger.size(), 0, "the persistent get is removed");
    assert_eq!(scratch.size(), 1, "the volatile put is visible");
    broker.shutdown();
}

#[test]
fn commit_and_rollback_need_a_transacted_session() {
    let broker = volatile_broker();
    let session = broker.session(false);
    assert!(matches!(
        session.commit(),
        Err(CommitError::Destination(DestinationError::Consistency(_)))
    ));
    assert!(matches!(
        session.rollback(),
        Err(CommitError::Destination(DestinationError::Consistency(_)))
    ));
    broker.shutdown();
}

#[test]
fn commit_settles_gets_and_puts_together() {
    let broker = volatile_broker();
    let inbox = broker.create_queue("inbox", volatile_queue(None)).unwrap();
    let outbox = broker.create_queue("outbox", volatile_queue(None)).unwrap();

    let seeder = broker.session(false);
    seeder
        .send(&Destination::Queue(Arc::clone(&inbox)), &Message::text("job"))
        .unwrap();

    let session = broker.session(true);
    session.start();
    let consumer = session.create_consumer(&inbox, None);
    let job = session.receive(consumer, WAIT).unwrap().unwrap();
    session
        .send(
            &Destination::Queue(Arc::clone(&outbox)),
            &Message::text("result"),
        )
        .unwrap();

    // Mid-transaction: the job is claimed, the result invisible.
    assert_eq!(inbox.size(), 1);
    assert_eq!(outbox.size(), 0);

    session.commit().unwrap();
    assert_eq!(inbox.size(), 0);
    assert_eq!(outbox.size(), 1);
    assert!(!job.redelivered());
    broker.shutdown();
}
