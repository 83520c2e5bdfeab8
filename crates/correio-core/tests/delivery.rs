//! Consumer delivery: claiming, redelivery, acknowledge, wake-ups and
//! prefetch flow control.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{volatile_broker, volatile_queue};
use correio_core::{Destination, DestinationDefinition, Message};

const WAIT: Duration = Duration::from_secs(2);
const SHORT: Duration = Duration::from_millis(150);

#[test]
fn one_message_has_exactly_one_winner() {
    let broker = volatile_broker();
    let queue = broker.create_queue("prize", volatile_queue(None)).unwrap();

    let seeder = broker.session(false);
    seeder
        .send(&Destination::Queue(Arc::clone(&queue)), &Message::text("prize"))
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let broker = Arc::clone(&broker);
        let queue = Arc::clone(&queue);
        handles.push(thread::spawn(move || {
            let session = broker.session(false);
            session.start();
            let consumer = session.create_consumer(&queue, None);
            let won = session.receive(consumer, SHORT).unwrap().is_some();
            if won {
                session.acknowledge(None).unwrap();
            }
            won
        }));
    }

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1, "exactly one racing consumer may claim it");
    assert_eq!(queue.size(), 0, "the winner's acknowledge removed it");
    broker.shutdown();
}

#[test]
fn rollback_redelivers_with_flag_exactly_once() {
    let broker = volatile_broker();
    let queue = broker.create_queue("work", volatile_queue(None)).unwrap();

    let seeder = broker.session(false);
    seeder
        .send(&Destination::Queue(Arc::clone(&queue)), &Message::text("job"))
        .unwrap();

    let session = broker.session(true);
    session.start();
    let consumer = session.create_consumer(&queue, None);

    let first = session.receive(consumer, WAIT).unwrap().unwrap();
    assert!(!first.redelivered(), "first delivery is not a redelivery");
    session.rollback().unwrap();

    let second = session.receive(consumer, WAIT).unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert!(second.redelivered());
    session.commit().unwrap();

    assert!(session.receive(consumer, SHORT).unwrap().is_none());
    assert_eq!(queue.size(), 0);
    broker.shutdown();
}

#[test]
fn acknowledge_settles_and_recover_redelivers() {
    let broker = volatile_broker();
    let queue = broker.create_queue("inbox", volatile_queue(None)).unwrap();
    let dest = Destination::Queue(Arc::clone(&queue));

    let session = broker.session(false);
    session.start();
    let consumer = session.create_consumer(&queue, None);

    session.send(&dest, &Message::text("one")).unwrap();
    session.send(&dest, &Message::text("two")).unwrap();

    let one = session.receive(consumer, WAIT).unwrap().unwrap();
    let two = session.receive(consumer, WAIT).unwrap().unwrap();
    assert_eq!(session.unsettled(), 2);

    session.recover(None).unwrap();
    assert_eq!(session.unsettled(), 0);

    let one_again = session.receive(consumer, WAIT).unwrap().unwrap();
    let two_again = session.receive(consumer, WAIT).unwrap().unwrap();
    assert!(one_again.redelivered());
    assert!(two_again.redelivered());
    assert_eq!(
        [one.id, two.id],
        [one_again.id, two_again.id],
        "same messages, same order"
    );

    session.acknowledge(None).unwrap();
    assert!(session.receive(consumer, SHORT).unwrap().is_none());
    assert_eq!(queue.size(), 0);
    broker.shutdown();
}

#[test]
fn broker_acknowledge_settles_through_the_consuming_session() {
    let broker = volatile_broker();
    let queue = broker.create_queue("routed", volatile_queue(None)).unwrap();

    let producer = broker.session(false);
    producer
        .send(&Destination::Queue(Arc::clone(&queue)), &Message::text("m"))
        .unwrap();

    let receiver = broker.session(false);
    receiver.start();
    let consumer = receiver.create_consumer(&queue, None);
    let got = receiver.receive(consumer, WAIT).unwrap().unwrap();
    assert_eq!(
        got.session_id,
        Some(receiver.id()),
        "the delivered copy carries the consuming session, not the producer"
    );

    broker.acknowledge(&got).unwrap();
    assert_eq!(receiver.unsettled(), 0, "the claim is settled");
    assert_eq!(queue.size(), 0, "the message is gone from the store");
    broker.shutdown();
}

#[test]
fn redelivery_delay_defers_visibility() {
    let broker = volatile_broker();
    let definition = DestinationDefinition {
        redelivery_delay_ms: 400,
        ..volatile_queue(None)
    };
    let queue = broker.create_queue("delayed", definition).unwrap();

    let producer = broker.session(false);
    producer
        .send(&Destination::Queue(Arc::clone(&queue)), &Message::text("slow"))
        .unwrap();

    let session = broker.session(true);
    session.start();
    let consumer = session.create_consumer(&queue, None);
    session.receive(consumer, WAIT).unwrap().unwrap();
    session.rollback().unwrap();

    assert!(
        session.receive(consumer, SHORT).unwrap().is_none(),
        "the rolled-back message stays locked for the delay"
    );

    let again = session.receive(consumer, WAIT).unwrap().unwrap();
    assert!(again.redelivered());
    assert_eq!(queue.size(), 1, "the slot is claimed again, not lost");
    session.commit().unwrap();
    assert_eq!(queue.size(), 0);
    broker.shutdown();
}

#[test]
fn selective_acknowledge_leaves_the_rest_claimed() {
    let broker = volatile_broker();
    let queue = broker.create_queue("inbox", volatile_queue(None)).unwrap();
    let dest = Destination::Queue(Arc::clone(&queue));

    let session = broker.session(false);
    session.start();
    let consumer = session.create_consumer(&queue, None);

    session.send(&dest, &Message::text("keep")).unwrap();
    session.send(&dest, &Message::text("settle")).unwrap();

    let keep = session.receive(consumer, WAIT).unwrap().unwrap();
    let settle = session.receive(consumer, WAIT).unwrap().unwrap();

    session.acknowledge(Some(&[settle.id])).unwrap();
    assert_eq!(session.unsettled(), 1);
    assert_eq!(queue.size(), 1, "the unsettled claim still occupies its slot");

    session.recover(None).unwrap();
    let back = session.receive(consumer, WAIT).unwrap().unwrap();
    assert_eq!(back.id, keep.id);
    broker.shutdown();
}

#[test]
fn blocked_receive_wakes_on_send() {
    let broker = volatile_broker();
    let queue = broker.create_queue("late", volatile_queue(None)).unwrap();

    let session = broker.session(false);
    session.start();
    let consumer = session.create_consumer(&queue, None);

    let waiter = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.receive(consumer, WAIT).unwrap())
    };

    thread::sleep(Duration::from_millis(100));
    let producer = broker.session(false);
    producer
        .send(&Destination::Queue(Arc::clone(&queue)), &Message::text("hi"))
        .unwrap();

    let got = waiter.join().unwrap();
    assert!(got.is_some(), "the sleeping receiver must be woken");
    broker.shutdown();
}

#[test]
fn stopped_session_withholds_delivery_until_start() {
    let broker = volatile_broker();
    let queue = broker.create_queue("gated", volatile_queue(None)).unwrap();

    let producer = broker.session(false);
    producer
        .send(&Destination::Queue(Arc::clone(&queue)), &Message::text("early"))
        .unwrap();

    let session = broker.session(false);
    let consumer = session.create_consumer(&queue, None);
    assert!(
        session.receive(consumer, SHORT).unwrap().is_none(),
        "nothing is delivered before start"
    );

    session.start();
    assert!(session.receive(consumer, WAIT).unwrap().is_some());
    broker.shutdown();
}

#[test]
fn remote_proxy_respects_prefetch_credits() {
    let broker = volatile_broker();
    let queue = broker.create_queue("push", volatile_queue(None)).unwrap();
    let dest = Destination::Queue(Arc::clone(&queue));

    let producer = broker.session(false);
    for text in ["p1", "p2", "p3"] {
        producer.send(&dest, &Message::text(text)).unwrap();
    }

    let session = broker.session(false);
    let (_, proxy, rx) = session.create_remote_consumer(&queue, None, 2);
    session.start();

    let first = rx.recv_timeout(WAIT).unwrap();
    let second = rx.recv_timeout(WAIT).unwrap();
    assert!(
        rx.recv_timeout(SHORT).is_err(),
        "third message must wait for credits"
    );
    assert_eq!(proxy.credits(), 0);

    session
        .acknowledge(Some(&[first.id, second.id]))
        .unwrap();
    proxy.confirm(2, &queue);

    let third = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(third.body(), Message::text("p3").body());
    broker.shutdown();
}

#[test]
fn closing_the_session_rolls_back_claims() {
    let broker = volatile_broker();
    let queue = broker.create_queue("abandoned", volatile_queue(None)).unwrap();

    let producer = broker.session(false);
    producer
        .send(&Destination::Queue(Arc::clone(&queue)), &Message::text("m"))
        .unwrap();

    {
        let session = broker.session(false);
        session.start();
        let consumer = session.create_consumer(&queue, None);
        session.receive(consumer, WAIT).unwrap().unwrap();
        session.close();
    }

    // The claim is released and flagged redelivered for the next taker.
    let session = broker.session(false);
    session.start();
    let consumer = session.create_consumer(&queue, None);
    let again = session.receive(consumer, WAIT).unwrap().unwrap();
    assert!(again.redelivered());
    broker.shutdown();
}
