use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::destination::queue::LocalQueue;
use crate::executor::Task;
use crate::message::Message;
use crate::selector::Selector;
use crate::session::Session;

/// Epoch-counting wake-up channel shared by all consumers of a session.
/// Receivers read the epoch before scanning, then sleep only if it has
/// not moved — a notification between scan and sleep is never lost.
pub(crate) struct Signal {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        *self.epoch.lock()
    }

    /// Broadcast: every waiter re-checks its condition.
    pub(crate) fn notify_all(&self) {
        *self.epoch.lock() += 1;
        self.cond.notify_all();
    }

    /// Sleep until the epoch moves past `seen` or the deadline passes.
    /// Returns whether the epoch changed. Spurious wake-ups re-loop.
    pub(crate) fn wait_changed(&self, seen: u64, deadline: Instant) -> bool {
        let mut epoch = self.epoch.lock();
        while *epoch == seen {
            if self.cond.wait_until(&mut epoch, deadline).timed_out() {
                return *epoch != seen;
            }
        }
        true
    }
}

/// How a woken consumer is driven.
pub(crate) enum NotifyTarget {
    /// Wake a blocked `receive` on the owning session.
    Waiter(Arc<Signal>),
    /// Credit-gated synchronous pull on behalf of a remote peer.
    Proxy(Arc<RemoteProxy>),
}

/// One registered consumer as seen by its destination.
pub(crate) struct ConsumerEntry {
    pub(crate) id: Uuid,
    pub(crate) selector: Option<Arc<dyn Selector>>,
    /// Connection-start toggle: unstarted consumers are skipped.
    pub(crate) started: Arc<AtomicBool>,
    pub(crate) target: NotifyTarget,
}

/// Prefetch flow control for a consumer serving a remote peer: each
/// pulled message spends one credit; credits come back only when the
/// remote side confirms progress, bounding un-acknowledged buildup.
pub struct RemoteProxy {
    session: Weak<Session>,
    selector: Option<Arc<dyn Selector>>,
    capacity: usize,
    credits: Mutex<usize>,
    out: Sender<Message>,
}

impl RemoteProxy {
    pub(crate) fn new(
        session: Weak<Session>,
        selector: Option<Arc<dyn Selector>>,
        capacity: usize,
    ) -> (Arc<Self>, Receiver<Message>) {
        let (out, rx) = crossbeam_channel::unbounded();
        (
            Arc::new(Self {
                session,
                selector,
                capacity,
                credits: Mutex::new(capacity),
                out,
            }),
            rx,
        )
    }

    pub fn credits(&self) -> usize {
        *self.credits.lock()
    }

    /// Pull as many visible messages as remaining credits allow. Pulled
    /// messages are locked in the owning session's transaction set until
    /// the peer acknowledges them.
    pub(crate) fn notify(&self, queue: &Arc<LocalQueue>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        loop {
            {
                let credits = self.credits.lock();
                if *credits == 0 {
                    debug!(destination = %queue.id(), "prefetch exhausted, waiting for peer progress");
                    return;
                }
            }
            match session.pull(queue, self.selector.as_deref()) {
                Ok(Some(message)) => {
                    *self.credits.lock() -= 1;
                    if self.out.send(message).is_err() {
                        warn!(destination = %queue.id(), "remote proxy receiver dropped");
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(destination = %queue.id(), error = %e, "proxy pull failed");
                    return;
                }
            }
        }
    }

    /// Remote side confirmed progress on `n` messages: restore credits
    /// and resume pulling if the queue has more to give.
    pub fn confirm(&self, n: usize, queue: &Arc<LocalQueue>) {
        {
            let mut credits = self.credits.lock();
            *credits = (*credits + n).min(self.capacity);
        }
        self.notify(queue);
    }
}

/// Small bounded FIFO of visibility events for one destination, drained
/// by a single mergeable executor task so producer threads never pay
/// consumer wake-up cost.
pub(crate) struct Notifier {
    tx: Sender<Arc<Message>>,
    rx: Receiver<Arc<Message>>,
    enqueue_timeout: Duration,
    pub(crate) task_id: u64,
}

impl Notifier {
    pub(crate) fn new(capacity: usize, enqueue_timeout: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            enqueue_timeout,
            task_id: Task::next_id(),
        }
    }

    /// Blocking-with-timeout enqueue. Returns false if the FIFO stayed
    /// full for the whole timeout; the watchdog recovers the lost wake-up.
    pub(crate) fn offer(&self, message: Arc<Message>) -> bool {
        self.tx.send_timeout(message, self.enqueue_timeout).is_ok()
    }

    pub(crate) fn poll(&self) -> Option<Arc<Message>> {
        self.rx.try_recv().ok()
    }
}
