//! The task pool: a fixed set of worker threads fed by a pool-wide shared
//! queue plus one targeted private queue per worker, all guarded by a single
//! monitor, with a counter-based event for worker wakeup.

use crate::fiber::{self, TaskHandle};
use crate::sync::Event;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use tracing::warn;

mod builder;
pub use builder::Builder;

mod capsule;
pub use capsule::{SpawnHints, TaskSettings};
use capsule::TaskCapsule;

mod queue;
use queue::TaskQueue;

mod reply;
use reply::HandleReply;

pub(crate) mod worker;
use worker::Worker;


/// Placement of a newly ready fiber in its worker's ready queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AddMode {
    Fifo,
    Lifo,
}

/// A pool of worker threads, each running a cooperative fiber scheduler.
///
/// Work submitted through [`TaskPool::run`] lands on the shared queue and is
/// executed by whichever worker gets to it first; the fan-out variants place
/// one copy on every worker's private queue. Submission is allowed from any
/// thread, including from tasks already running on the pool.
///
/// Every closure submitted to the pool must be safe to transfer across
/// threads; a capture that is not rejects the submission at compile time:
///
/// ```compile_fail
/// use std::rc::Rc;
///
/// let pool = strand::TaskPool::new(1).unwrap();
/// let local = Rc::new(5);
/// // `Rc` is not `Send`, so this closure cannot cross into a worker.
/// pool.run(move || {
///     drop(local);
/// });
/// ```
///
/// Closures are stored inline in a fixed-size capsule; captures too large
/// for it are likewise rejected at compile time:
///
/// ```compile_fail
/// let pool = strand::TaskPool::new(1).unwrap();
/// let big = [0u8; 4096];
/// pool.run(move || {
///     let _big = big;
/// });
/// ```
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) thread_count: usize,
    pub(crate) signal: Arc<Event>,
    pub(crate) state: Mutex<State>,

    /// Fibers consumed from the queues but not yet finished. Incremented
    /// under the pool monitor at consume time; see `Worker::intake`.
    pub(crate) live_fibers: AtomicUsize,

    /// Set by `join`: refuse new submissions and have workers signal every
    /// fiber completion so the drain observer can make progress.
    pub(crate) draining: AtomicBool,
}

/// Monitor-protected pool state. The one lock around this struct guards the
/// worker slots (and with them every private queue), the shared queue and
/// the termination flag; nothing else synchronizes the submission path.
pub(crate) struct State {
    pub(crate) workers: Vec<WorkerSlot>,
    pub(crate) handles: Vec<thread::JoinHandle<()>>,
    pub(crate) shared_queue: TaskQueue,
    pub(crate) terminating: bool,
}

pub(crate) struct WorkerSlot {
    pub(crate) index: usize,
    pub(crate) queue: TaskQueue,
}

impl State {
    fn new() -> Self {
        Self {
            workers: Vec::new(),
            handles: Vec::new(),
            shared_queue: TaskQueue::new(),
            terminating: false,
        }
    }

    /// One capsule for worker `index`, private queue preferred so targeted
    /// work runs on its intended worker even under shared-queue pressure.
    pub(crate) fn consume_for(&mut self, index: usize) -> Option<TaskCapsule> {
        if let Some(slot) = self.workers.iter_mut().find(|slot| slot.index == index)
            && let Some(capsule) = slot.queue.consume()
        {
            return Some(capsule);
        }

        self.shared_queue.consume()
    }
}

impl TaskPool {
    /// Create a pool with `thread_count` workers.
    ///
    /// `thread_count == 0` is permitted and yields an inert pool that
    /// accepts submissions but never runs them.
    pub fn new(thread_count: usize) -> anyhow::Result<TaskPool> {
        Builder::new().thread_count(thread_count).build()
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    /// The number of workers this pool was created with.
    pub fn thread_count(&self) -> usize {
        self.inner.thread_count
    }

    /// Enqueue `f` onto the shared queue and wake one worker.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_with(TaskSettings::default(), f);
    }

    pub fn run_with<F>(&self, settings: TaskSettings, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.inner.submit_shared(TaskCapsule::new(settings, f)) {
            warn!("task submitted to a terminated pool; dropping it");
        }
    }

    /// Enqueue `f` and return the handle of the task once it has started on
    /// a worker.
    ///
    /// The handle is produced inside the task itself, so by the time this
    /// returns the task has been registered with its worker's fiber
    /// scheduler and begun executing.
    ///
    /// # Panics
    ///
    /// Panics if the pool is terminating: the start handshake can no longer
    /// be completed.
    pub fn run_h<F>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_h_with(TaskSettings::default(), f)
    }

    pub fn run_h_with<F>(&self, settings: TaskSettings, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let reply = HandleReply::new(Arc::clone(&self.inner.signal));
        let sender = reply.sender();

        let accepted = self.inner.submit_shared(TaskCapsule::new(settings, move || {
            sender.send(fiber::current_task().expect("task wrapper polled outside a fiber"));
            f();
        }));
        assert!(
            accepted,
            "cannot submit a handle-returning task to a terminated pool"
        );

        reply.recv()
    }

    /// Enqueue one copy of `f` on every worker's private queue and wake all
    /// workers. Each worker receives a fresh clone of the closure.
    pub fn run_dist<F>(&self, f: F)
    where
        F: FnOnce() + Send + Clone + 'static,
    {
        self.run_dist_with(TaskSettings::default(), f);
    }

    pub fn run_dist_with<F>(&self, settings: TaskSettings, f: F)
    where
        F: FnOnce() + Send + Clone + 'static,
    {
        if self.inner.submit_dist(settings, || f.clone()).is_none() {
            warn!("fan-out task submitted to a terminated pool; dropping it");
        }
    }

    /// Fan-out variant of [`TaskPool::run_h`]: invokes `on_handle` exactly
    /// once per worker with the handle of that worker's task.
    ///
    /// # Panics
    ///
    /// Panics if the pool is terminating.
    pub fn run_dist_h<F, H>(&self, on_handle: H, f: F)
    where
        F: FnOnce() + Send + Clone + 'static,
        H: FnMut(TaskHandle),
    {
        self.run_dist_h_with(TaskSettings::default(), on_handle, f);
    }

    pub fn run_dist_h_with<F, H>(&self, settings: TaskSettings, mut on_handle: H, f: F)
    where
        F: FnOnce() + Send + Clone + 'static,
        H: FnMut(TaskHandle),
    {
        let reply = HandleReply::new(Arc::clone(&self.inner.signal));

        let submitted = self.inner.submit_dist(settings, || {
            let sender = reply.sender();
            let payload = f.clone();
            move || {
                sender.send(fiber::current_task().expect("task wrapper polled outside a fiber"));
                payload();
            }
        });

        let Some(count) = submitted else {
            panic!("cannot submit a handle-returning fan-out to a terminated pool");
        };

        for _ in 0..count {
            on_handle(reply.recv());
        }
    }

    /// Stop the pool: set the termination flag, wake every worker and join
    /// them. In-flight tasks finish; queued tasks that no worker picks up
    /// are dropped with a warning.
    pub fn terminate(&self) {
        self.inner.terminate();
    }

    /// Drain-then-terminate: refuse new submissions, wait until the shared
    /// queue, every private queue and all running fibers are finished, then
    /// [`TaskPool::terminate`].
    ///
    /// # Panics
    ///
    /// Panics when called from a pool task: the calling fiber could never
    /// drain.
    pub fn join(&self) {
        assert!(
            Worker::current().is_none(),
            "TaskPool::join must not be called from a pool task"
        );

        self.inner.draining.store(true, Ordering::SeqCst);

        // An inert pool has nobody to drain the queues.
        if self.inner.thread_count > 0 {
            let mut last = self.inner.signal.emit_count();
            loop {
                let (terminating, queues_empty) = {
                    let state = self.inner.state.lock();
                    (
                        state.terminating,
                        state.shared_queue.is_empty()
                            && state.workers.iter().all(|slot| slot.queue.is_empty()),
                    )
                };

                if terminating {
                    break;
                }
                if queues_empty && self.inner.live_fibers.load(Ordering::SeqCst) == 0 {
                    break;
                }

                last = self.inner.signal.wait(last);
            }
        }

        self.inner.terminate();
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        let terminated = self.inner.state.lock().terminating;
        if !terminated {
            self.inner.terminate();
        }
    }
}

impl PoolInner {
    fn refuses_submissions(&self, state: &State) -> bool {
        state.terminating || self.draining.load(Ordering::SeqCst)
    }

    /// Append a capsule to the shared queue and wake at most one worker.
    /// Returns false (dropping the capsule) if the pool no longer accepts
    /// work.
    pub(crate) fn submit_shared(&self, capsule: TaskCapsule) -> bool {
        let rejected = {
            let mut state = self.state.lock();
            if self.refuses_submissions(&state) {
                Some(capsule)
            } else {
                state.shared_queue.put(capsule);
                None
            }
        };

        match rejected {
            // The capsule destructor may run arbitrary capture destructors,
            // so it executes outside the monitor.
            Some(capsule) => {
                drop(capsule);
                false
            }
            None => {
                // One capsule, one worker: waking everybody here would just
                // stampede the monitor.
                self.signal.emit_single();
                true
            }
        }
    }

    /// Append one freshly built capsule per live worker, all under a single
    /// monitor acquisition so the fan-out is atomically visible, then wake
    /// every worker. Returns the number of capsules placed.
    pub(crate) fn submit_dist<F, M>(&self, settings: TaskSettings, mut make: M) -> Option<usize>
    where
        F: FnOnce() + Send + 'static,
        M: FnMut() -> F,
    {
        let count = {
            let mut state = self.state.lock();
            if self.refuses_submissions(&state) {
                return None;
            }

            // A fresh capsule per worker: per-instance capture state such as
            // reference counts is established once per copy.
            for slot in state.workers.iter_mut() {
                slot.queue.put(TaskCapsule::new(settings, make()));
            }
            state.workers.len()
        };

        self.signal.emit();
        Some(count)
    }

    pub(crate) fn terminate(&self) {
        self.state.lock().terminating = true;
        self.signal.emit();

        loop {
            let handle = {
                let mut state = self.state.lock();
                if state.handles.is_empty() {
                    None
                } else {
                    Some(state.handles.remove(0))
                }
            };
            let Some(handle) = handle else { break };

            // Joining ourselves would deadlock; detach instead.
            if handle.thread().id() == thread::current().id() {
                continue;
            }

            if handle.join().is_err() {
                warn!("worker thread panicked before it could be joined");
            }
        }

        let pending = self.state.lock().shared_queue.len();
        if pending > 0 {
            warn!(
                pending,
                "pool terminated with tasks left in the shared queue"
            );
        }
    }
}

// Test-only introspection.
#[cfg(test)]
impl TaskPool {
    pub(crate) fn shared_queue_len(&self) -> usize {
        self.inner.state.lock().shared_queue.len()
    }

    pub(crate) fn private_queue_total(&self) -> usize {
        let state = self.inner.state.lock();
        state.workers.iter().map(|slot| slot.queue.len()).sum()
    }

    pub(crate) fn live_worker_count(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    pub(crate) fn joinable_worker_count(&self) -> usize {
        self.inner.state.lock().handles.len()
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.inner.state.lock().terminating
    }
}
