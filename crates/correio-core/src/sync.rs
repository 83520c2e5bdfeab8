use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::CommitError;

#[derive(Default)]
struct TxLockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Reentrant exclusive lock guarding a destination's commit window.
///
/// Separate from — and coarser than — the destination monitor: it is held
/// for the whole commit/rollback pass, always acquired in the global
/// destination order, and commit-time store mutations assert it is held.
#[derive(Default)]
pub struct TxLock {
    state: Mutex<TxLockState>,
    cond: Condvar,
}

impl TxLock {
    /// Block until this thread owns the lock. Reentrant.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.cond.wait(&mut state),
            }
        }
    }

    /// Release one level of ownership. Releasing a lock this thread does
    /// not hold is a programming error.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(
            state.owner,
            Some(me),
            "transaction lock released by non-owning thread"
        );
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.cond.notify_one();
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }
}

#[derive(Default)]
struct BarrierState {
    pending: usize,
    failure: Option<String>,
}

/// Count-up latch spanning one commit pass: every destination flush
/// registers before the caller releases its locks, then arrives once
/// physically safe (or failed). The committer waits for all arrivals,
/// so flushes across destinations proceed concurrently.
#[derive(Default)]
pub struct CommitBarrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl CommitBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) {
        self.state.lock().pending += 1;
    }

    pub fn arrive(&self) {
        let mut state = self.state.lock();
        state.pending -= 1;
        if state.pending == 0 {
            drop(state);
            self.cond.notify_all();
        }
    }

    pub fn arrive_with_error(&self, error: String) {
        let mut state = self.state.lock();
        state.pending -= 1;
        if state.failure.is_none() {
            state.failure = Some(error);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Wait until every registered party has arrived. A timeout maps to
    /// an interrupted commit; a recorded failure maps to a flush error.
    pub fn wait(&self, timeout: Duration) -> Result<(), CommitError> {
        let mut state = self.state.lock();
        while state.pending > 0 && state.failure.is_none() {
            if self.cond.wait_for(&mut state, timeout).timed_out() {
                return Err(CommitError::Interrupted(format!(
                    "barrier wait exceeded {timeout:?} with {} flush(es) outstanding",
                    state.pending
                )));
            }
        }
        match state.failure.take() {
            Some(err) => Err(CommitError::Flush(err)),
            None => Ok(()),
        }
    }
}
