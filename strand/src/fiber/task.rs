use crate::fiber::id::{CurrentTaskGuard, TaskHandle};
use crate::pool::AddMode;
use crate::pool::worker::Worker;
use std::cell::UnsafeCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use tracing::error;

/// Sitting in its home worker's ready queue.
const SCHEDULED: u8 = 0;
/// Currently being polled by its home worker.
const RUNNING: u8 = 1;
/// Woken while `RUNNING`; re-queued as soon as the poll returns.
const NOTIFIED: u8 = 2;
/// Suspended, waiting for a wake.
const IDLE: u8 = 3;
/// Finished; the future slot is empty.
const COMPLETE: u8 = 4;

/// A cooperatively scheduled execution context bound to one worker.
///
/// The future is owned and polled exclusively by the home worker; wakers may
/// fire from any thread and only touch the atomic state and the home
/// worker's ready queue.
pub(crate) struct Fiber {
    handle: TaskHandle,
    state: AtomicU8,
    future: UnsafeCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    worker: Arc<Worker>,
}

// Safety: the future slot is only ever accessed (polled, replaced, dropped)
// on the home worker's thread. Cross-thread access is limited to `state` and
// to cloning/dropping the `Arc` around the fiber.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber for `future` and place it in `worker`'s ready queue.
    pub(crate) fn spawn<F>(worker: &Arc<Worker>, future: F, mode: AddMode) -> TaskHandle
    where
        F: Future<Output = ()> + 'static,
    {
        let fiber = Arc::new(Self {
            handle: TaskHandle::next(),
            state: AtomicU8::new(SCHEDULED),
            future: UnsafeCell::new(Some(Box::pin(future))),
            worker: Arc::clone(worker),
        });

        let handle = fiber.handle;
        worker.push_ready_local(fiber, mode);
        handle
    }

    /// Poll the fiber once on its home worker.
    ///
    /// A panic escaping the future is confined here: it completes the fiber
    /// and is reported, the worker's drain loop keeps running.
    pub(crate) fn run(self: Arc<Self>) {
        if self
            .state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        let _guard = CurrentTaskGuard::enter(self.handle);

        // Safety: we are on the home worker thread; nothing else touches the
        // future slot.
        let slot = unsafe { &mut *self.future.get() };
        let Some(future) = slot.as_mut() else {
            self.state.store(COMPLETE, Ordering::Release);
            return;
        };

        let poll = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        match poll {
            Ok(Poll::Pending) => {
                if self
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Notified during the poll: run again soon.
                    self.state.store(SCHEDULED, Ordering::Release);
                    self.worker
                        .push_ready_local(Arc::clone(&self), AddMode::Fifo);
                }
            }
            Ok(Poll::Ready(())) => self.complete(slot),
            Err(_) => {
                error!(task = %self.handle, "task panicked; fiber terminated");
                self.complete(slot);
            }
        }
    }

    fn complete(&self, slot: &mut Option<Pin<Box<dyn Future<Output = ()>>>>) {
        *slot = None;
        self.state.store(COMPLETE, Ordering::Release);
        self.worker.fiber_finished();
    }

    fn reschedule(self: &Arc<Self>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.worker.push_ready_remote(Arc::clone(self));
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                // Already queued or finished.
                SCHEDULED | NOTIFIED | COMPLETE => return,
                _ => unreachable!("invalid fiber state"),
            }
        }
    }
}

impl Wake for Fiber {
    fn wake(self: Arc<Self>) {
        self.reschedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.reschedule();
    }
}
