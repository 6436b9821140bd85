use crate::pool::queue::TaskQueue;
use crate::pool::worker::{Worker, worker_main};
use crate::pool::{PoolInner, State, TaskPool, WorkerSlot};
use crate::sync::Event;
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::thread;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|index| format!("pool-{index}")))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself is not printable.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and builds a [`TaskPool`].
#[derive(Debug)]
pub struct Builder {
    /// Defaults to one worker per logical CPU.
    thread_count: Option<usize>,

    /// Name fn for worker threads; defaults to `pool-{index}`.
    thread_name: ThreadNameFn,

    /// Stack size for worker threads; platform default when unset.
    thread_stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            thread_count: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
        }
    }

    /// Number of workers. Zero is allowed and produces an inert pool.
    pub fn thread_count(mut self, val: usize) -> Self {
        self.thread_count = Some(val);
        self
    }

    /// Worker threads are named `{prefix}-{index}`.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.thread_name = ThreadNameFn(Arc::new(move |index| format!("{prefix}-{index}")));
        self
    }

    /// Full control over worker thread names.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Stack size (in bytes) for worker threads. The platform may round it
    /// up to its minimum.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Create the configured pool; its workers are started before this
    /// returns.
    pub fn build(self) -> Result<TaskPool> {
        let thread_count = match self.thread_count {
            Some(count) => count,
            None => thread::available_parallelism()
                .context("failed to query logical CPU count")?
                .get(),
        };

        let inner = Arc::new(PoolInner {
            thread_count,
            signal: Arc::new(Event::new()),
            state: Mutex::new(State::new()),
            live_fibers: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        });

        self.spawn_workers(&inner);

        Ok(TaskPool::from_inner(inner))
    }

    fn spawn_workers(&self, inner: &Arc<PoolInner>) {
        // The monitor is held across all spawns: a worker that starts early
        // blocks on its first acquisition until every slot is registered.
        let mut state = inner.state.lock();

        for index in 0..inner.thread_count {
            let worker = Arc::new(Worker::new(index, Arc::clone(inner)));
            let name = (self.thread_name.0)(index);

            let mut thread_builder = thread::Builder::new().name(name.clone());
            if let Some(stack_size) = self.thread_stack_size {
                thread_builder = thread_builder.stack_size(stack_size);
            }

            let handle = thread_builder
                .spawn(move || worker_main(worker, name))
                .expect("failed to spawn worker thread");

            state.workers.push(WorkerSlot {
                index,
                queue: TaskQueue::new(),
            });
            state.handles.push(handle);
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
