use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{BrokerError, BrokerResult};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of background work. Mergeable tasks carry a stable id: while
/// one instance with that id is queued, further submissions collapse
/// into it and are dropped.
pub struct Task {
    id: u64,
    mergeable: bool,
    run: Box<dyn Fn() + Send + Sync>,
}

impl Task {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            id: Self::next_id(),
            mergeable: false,
            run: Box::new(f),
        }
    }

    pub fn mergeable(id: u64, f: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            id,
            mergeable: true,
            run: Box::new(f),
        }
    }

    /// Allocate a stable id for a family of mergeable tasks.
    pub fn next_id() -> u64 {
        NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
    }
}

enum Job {
    Run(Task),
    Stop,
}

/// Fixed pool of background worker threads fed through a bounded
/// crossbeam channel. Used for notification draining and deferred
/// durable-store flushes.
pub struct TaskExecutor {
    tx: Sender<Job>,
    /// Ids of mergeable tasks currently sitting in the queue.
    queued: Mutex<HashSet<u64>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn start(config: &ExecutorConfig) -> BrokerResult<Arc<Self>> {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(config.task_queue_capacity);
        let executor = Arc::new(Self {
            tx,
            queued: Mutex::new(HashSet::new()),
            workers: Mutex::new(Vec::with_capacity(config.workers)),
        });

        let mut workers = executor.workers.lock();
        for i in 0..config.workers.max(1) {
            let rx = rx.clone();
            let exec = Arc::clone(&executor);
            let handle = thread::Builder::new()
                .name(format!("correio-worker-{i}"))
                .spawn(move || exec.worker_loop(&rx))
                .map_err(|e| BrokerError::Spawn(e.to_string()))?;
            workers.push(handle);
        }
        drop(workers);

        info!(workers = config.workers.max(1), "task executor started");
        Ok(executor)
    }

    fn worker_loop(&self, rx: &Receiver<Job>) {
        while let Ok(job) = rx.recv() {
            match job {
                Job::Run(task) => {
                    if task.mergeable {
                        // Drop the marker before running so a submission
                        // arriving mid-run schedules a fresh pass.
                        self.queued.lock().remove(&task.id);
                    }
                    (task.run)();
                }
                Job::Stop => break,
            }
        }
    }

    /// Submit a task. Mergeable submissions whose id is already queued
    /// coalesce into the pending instance.
    pub fn execute(&self, task: Task) {
        if task.mergeable && !self.queued.lock().insert(task.id) {
            debug!(task_id = task.id, "merged into queued task");
            return;
        }
        let mergeable_id = task.mergeable.then_some(task.id);
        if self.tx.send(Job::Run(task)).is_err() {
            if let Some(id) = mergeable_id {
                self.queued.lock().remove(&id);
            }
            warn!("task dropped: executor stopped");
        }
    }

    /// Stop all workers after the queue drains.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in &workers {
            let _ = self.tx.send(Job::Stop);
        }
        for handle in workers {
            let _ = handle.join();
        }
        info!("task executor stopped");
    }
}

struct Deferred {
    at: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Deferred {}
impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Deferred {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first.
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Deferred>,
    next_seq: u64,
    shutdown: bool,
}

/// One-shot delayed task scheduler: a min-heap drained by a dedicated
/// thread that hands due tasks to the executor. Used for redelivery
/// delays and the stuck-queue watchdog.
pub struct Timer {
    state: Mutex<TimerState>,
    cond: Condvar,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Timer {
    pub fn start(executor: Arc<TaskExecutor>) -> BrokerResult<Arc<Self>> {
        let timer = Arc::new(Self {
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
            thread: Mutex::new(None),
        });

        let worker = Arc::clone(&timer);
        let handle = thread::Builder::new()
            .name("correio-timer".to_string())
            .spawn(move || worker.timer_loop(&executor))
            .map_err(|e| BrokerError::Spawn(e.to_string()))?;
        *timer.thread.lock() = Some(handle);
        Ok(timer)
    }

    fn timer_loop(&self, executor: &TaskExecutor) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                break;
            }
            let now = Instant::now();
            match state.heap.peek().map(|d| d.at) {
                Some(at) if at <= now => {
                    let Some(due) = state.heap.pop() else {
                        continue;
                    };
                    // Run outside the lock via the worker pool.
                    drop(state);
                    executor.execute(due.task);
                    state = self.state.lock();
                }
                Some(at) => {
                    self.cond.wait_until(&mut state, at);
                }
                None => {
                    self.cond.wait(&mut state);
                }
            }
        }
    }

    /// Schedule a one-shot task after `delay`.
    pub fn schedule(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Deferred {
            at: Instant::now() + delay,
            seq,
            task,
        });
        drop(state);
        self.cond.notify_one();
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}
