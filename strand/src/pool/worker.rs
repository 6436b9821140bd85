use crate::fiber::Fiber;
use crate::pool::capsule::TaskCapsule;
use crate::pool::{AddMode, PoolInner};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

/// One OS thread bound to the pool, hosting a cooperative fiber scheduler.
///
/// The worker's drain loop interleaves two duties per iteration: take at most
/// one capsule from the queues (private queue first) and poll at most one
/// ready fiber. Giving each side one slot per iteration keeps queue intake
/// and user fibers on equal terms, so a fiber that only re-yields cannot
/// starve the drain.
pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) pool: Arc<PoolInner>,

    /// Ready fibers, owned for polling by this worker only. Remote wakes
    /// push here from other threads, which is why this is not thread-local.
    ready: Mutex<VecDeque<Arc<Fiber>>>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
}

enum Intake {
    Got,
    Empty,
    Terminating,
}

impl Worker {
    pub(crate) fn new(index: usize, pool: Arc<PoolInner>) -> Self {
        Self {
            index,
            pool,
            ready: Mutex::new(VecDeque::new()),
        }
    }

    /// The worker registered on the current thread, if any.
    pub(crate) fn current() -> Option<Arc<Worker>> {
        CURRENT_WORKER.with(|worker| worker.borrow().clone())
    }

    pub(crate) fn run(self: &Arc<Self>) {
        let mut last = self.pool.signal.emit_count();

        loop {
            let got = match self.intake(true) {
                Intake::Terminating => break,
                Intake::Got => true,
                Intake::Empty => false,
            };

            let ran = self.poll_one();

            if !got && !ran {
                last = self.pool.signal.wait(last);
            }
        }

        self.exit();
    }

    /// Run the drain-loop body until `poll` yields a value.
    ///
    /// Used when a submitter on a pool thread has to wait for a task started
    /// elsewhere: the worker keeps consuming capsules and polling fibers, so
    /// even a single-worker pool executes its own wrapper task instead of
    /// deadlocking. Termination does not stop the nested drive; finishing the
    /// handshake is the only way to unwind back into the main loop.
    pub(crate) fn drive_until<T>(self: &Arc<Self>, mut poll: impl FnMut() -> Option<T>) -> T {
        let mut last = self.pool.signal.emit_count();

        loop {
            if let Some(value) = poll() {
                return value;
            }

            let got = matches!(self.intake(false), Intake::Got);
            let ran = self.poll_one();

            if !got && !ran {
                last = self.pool.signal.wait(last);
            }
        }
    }

    fn intake(self: &Arc<Self>, honor_terminating: bool) -> Intake {
        let capsule = {
            let mut state = self.pool.state.lock();

            if honor_terminating && state.terminating {
                return Intake::Terminating;
            }

            let capsule = state.consume_for(self.index);
            if capsule.is_some() {
                // Counted inside the monitor so a drain observer never sees a
                // capsule leave the queues without becoming a live fiber.
                self.pool.live_fibers.fetch_add(1, Ordering::SeqCst);
            }
            capsule
        };

        match capsule {
            Some(capsule) => {
                self.spawn_capsule(capsule);
                Intake::Got
            }
            None => Intake::Empty,
        }
    }

    fn spawn_capsule(self: &Arc<Self>, capsule: TaskCapsule) {
        let mode = capsule.settings.add_mode();
        Fiber::spawn(self, async move { capsule.invoke() }, mode);
    }

    fn poll_one(&self) -> bool {
        let fiber = self.ready.lock().pop_front();
        match fiber {
            Some(fiber) => {
                fiber.run();
                true
            }
            None => false,
        }
    }

    /// Called from `Fiber::spawn` and from re-queues on the home thread.
    pub(crate) fn push_ready_local(&self, fiber: Arc<Fiber>, mode: AddMode) {
        let mut ready = self.ready.lock();
        match mode {
            AddMode::Fifo => ready.push_back(fiber),
            AddMode::Lifo => ready.push_front(fiber),
        }
    }

    /// Called from wakers on arbitrary threads. The pool signal is broadcast
    /// because a single shared event cannot target one worker; every other
    /// worker re-checks its queues and goes back to waiting.
    pub(crate) fn push_ready_remote(&self, fiber: Arc<Fiber>) {
        self.ready.lock().push_back(fiber);
        self.pool.signal.emit();
    }

    #[cfg(test)]
    pub(crate) fn pop_ready_newest(&self) -> Option<Arc<Fiber>> {
        self.ready.lock().pop_back()
    }

    pub(crate) fn fiber_finished(&self) {
        self.pool.live_fibers.fetch_sub(1, Ordering::SeqCst);
        if self.pool.draining.load(Ordering::SeqCst) {
            self.pool.signal.emit();
        }
    }

    fn exit(&self) {
        // Fibers that never got a poll die here, on their home thread.
        let abandoned: Vec<_> = {
            let mut ready = self.ready.lock();
            ready.drain(..).collect()
        };
        if !abandoned.is_empty() {
            debug!(
                worker = self.index,
                count = abandoned.len(),
                "dropping unpolled fibers at exit"
            );
            for _ in &abandoned {
                self.fiber_finished();
            }
            drop(abandoned);
        }

        let slot = {
            let mut state = self.pool.state.lock();

            if !state.shared_queue.is_empty() {
                warn!(
                    worker = self.index,
                    pending = state.shared_queue.len(),
                    "worker exiting while the shared queue still holds tasks"
                );
            }

            state
                .workers
                .iter()
                .position(|slot| slot.index == self.index)
                .map(|pos| state.workers.remove(pos))
        };

        // Dropped outside the monitor: pending capsules may run arbitrary
        // destructors.
        if let Some(slot) = slot {
            if !slot.queue.is_empty() {
                warn!(
                    worker = self.index,
                    pending = slot.queue.len(),
                    "worker exiting with tasks left in its private queue"
                );
            }
        }
    }
}

/// Thread entry point for a pool worker.
pub(crate) fn worker_main(worker: Arc<Worker>, name: String) {
    if let Err(e) = crate::utils::thread::set_current_thread_name(&name) {
        warn!(worker = worker.index, error = %e, "failed to set worker thread name");
    }

    CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(Arc::clone(&worker)));
    debug!(worker = worker.index, name = %name, "worker thread started");

    let result = panic::catch_unwind(AssertUnwindSafe(|| worker.run()));

    CURRENT_WORKER.with(|current| *current.borrow_mut() = None);

    match result {
        Ok(()) => debug!(worker = worker.index, "worker thread exiting"),
        Err(_) => {
            // A panic that escaped the drain loop means the queue invariants
            // can no longer be trusted in this process.
            error!(worker = worker.index, "drain loop panicked; aborting process");
            std::process::abort();
        }
    }
}
