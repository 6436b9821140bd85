use crate::pool::AddMode;
use bitflags::bitflags;
use std::mem::{self, MaybeUninit};

/// Inline storage for one erased `(callable, captures)` pair. Sized so that a
/// handle-return wrapper (reply sender plus a reasonably sized user closure)
/// still fits without touching the heap.
pub(crate) const CAPSULE_STORAGE_SIZE: usize = 192;
pub(crate) const CAPSULE_STORAGE_ALIGN: usize = 16;

bitflags! {
    /// Placement hints consumed by the per-worker fiber scheduler.
    ///
    /// These only affect where a freshly spawned fiber lands in its worker's
    /// ready queue; subsequent re-schedules use the scheduler's default order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct SpawnHints: u32 {
        /// Spawn at the back of the ready queue.
        const SPAWN_FIFO = 1;

        /// Spawn at the front of the ready queue.
        const SPAWN_LIFO = 1 << 1;
    }
}

/// Per-task settings, set by the producer before enqueue.
///
/// The default is all-zero. `stack_size_hint` is advisory: fibers in this
/// runtime grow on the heap, so the hint is carried for API compatibility
/// with stackful backends but does not change allocation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskSettings {
    pub stack_size_hint: usize,
    pub priority: i32,
    pub hints: SpawnHints,
}

impl TaskSettings {
    pub(crate) fn add_mode(&self) -> AddMode {
        if self.hints.contains(SpawnHints::SPAWN_LIFO) {
            AddMode::Lifo
        } else if self.hints.contains(SpawnHints::SPAWN_FIFO) {
            AddMode::Fifo
        } else if self.priority > 0 {
            AddMode::Lifo
        } else {
            AddMode::Fifo
        }
    }
}

#[repr(C, align(16))]
struct Storage([MaybeUninit<u8>; CAPSULE_STORAGE_SIZE]);

/// A type-erased record carrying one enqueued invocation.
///
/// The closure is written into the inline buffer at construction and read
/// back out exactly once by the monomorphized trampoline stored in
/// `invoke_fn`. Moving the capsule between queue slots is a plain byte move,
/// so the closure itself is moved exactly once in and once out regardless of
/// how often the queue regrows.
pub(crate) struct TaskCapsule {
    /// `Some` from construction until the capsule is invoked.
    invoke_fn: Option<unsafe fn(*mut u8)>,

    /// Releases a never-invoked closure when the capsule is dropped, e.g.
    /// when a queue is discarded during termination.
    drop_fn: unsafe fn(*mut u8),

    storage: Storage,

    pub(crate) settings: TaskSettings,
}

// Safety: the storage only ever holds a closure that was `Send` when it was
// written in `TaskCapsule::new`, and the trampolines reconstruct exactly that
// type.
unsafe impl Send for TaskCapsule {}

impl TaskCapsule {
    /// Erase `f` into an inline capsule.
    ///
    /// Closures whose size or alignment exceed the inline buffer are rejected
    /// at compile time, naming the offending monomorphization.
    pub(crate) fn new<F>(settings: TaskSettings, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        const {
            assert!(
                mem::size_of::<F>() <= CAPSULE_STORAGE_SIZE,
                "task closure and its captures exceed the inline capsule storage"
            );
            assert!(
                mem::align_of::<F>() <= CAPSULE_STORAGE_ALIGN,
                "task closure requires stricter alignment than the capsule storage provides"
            );
        }

        let mut capsule = Self {
            invoke_fn: Some(invoke_raw::<F>),
            drop_fn: drop_raw::<F>,
            storage: Storage([MaybeUninit::uninit(); CAPSULE_STORAGE_SIZE]),
            settings,
        };

        // Safety: the assertions above guarantee `F` fits the buffer and its
        // alignment requirement; the buffer is exclusively ours.
        unsafe {
            capsule.storage_ptr().cast::<F>().write(f);
        }

        capsule
    }

    /// Execute the stored invocation.
    ///
    /// Consuming `self` makes a second invocation unrepresentable; the
    /// storage is moved-from afterwards and the destructor will not touch it.
    pub(crate) fn invoke(mut self) {
        let invoke = self
            .invoke_fn
            .take()
            .expect("capsule invoker unset after construction");

        // Safety: the invoker was monomorphized for the exact closure type
        // written into the storage, and taking it above disarms the drop path.
        unsafe { invoke(self.storage_ptr()) }
    }

    fn storage_ptr(&mut self) -> *mut u8 {
        self.storage.0.as_mut_ptr().cast()
    }
}

impl Drop for TaskCapsule {
    fn drop(&mut self) {
        // Still armed: the closure was never moved out.
        if self.invoke_fn.is_some() {
            unsafe { (self.drop_fn)(self.storage_ptr()) }
        }
    }
}

unsafe fn invoke_raw<F: FnOnce()>(ptr: *mut u8) {
    let f = unsafe { ptr.cast::<F>().read() };
    f()
}

unsafe fn drop_raw<F>(ptr: *mut u8) {
    unsafe { ptr.cast::<F>().drop_in_place() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    assert_impl_all!(TaskCapsule: Send);
    assert_impl_all!(TaskSettings: Send, Sync, Copy);

    #[test]
    fn test_invoke_runs_closure_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&count);

        let capsule = TaskCapsule::new(TaskSettings::default(), move || {
            captured.fetch_add(1, Ordering::Relaxed);
        });

        capsule.invoke();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_without_invoke_releases_captures() {
        let payload = Arc::new(());
        let captured = Arc::clone(&payload);

        let capsule = TaskCapsule::new(TaskSettings::default(), move || {
            drop(captured);
        });

        assert_eq!(Arc::strong_count(&payload), 2);
        drop(capsule);
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_invoke_consumes_captures_exactly_once() {
        let payload = Arc::new(());
        let captured = Arc::clone(&payload);

        let capsule = TaskCapsule::new(TaskSettings::default(), move || {
            drop(captured);
        });

        capsule.invoke();
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_settings_map_to_add_mode() {
        assert_eq!(TaskSettings::default().add_mode(), AddMode::Fifo);

        let prioritized = TaskSettings {
            priority: 1,
            ..Default::default()
        };
        assert_eq!(prioritized.add_mode(), AddMode::Lifo);

        let pinned_back = TaskSettings {
            priority: 7,
            hints: SpawnHints::SPAWN_FIFO,
            ..Default::default()
        };
        assert_eq!(pinned_back.add_mode(), AddMode::Fifo);

        let pinned_front = TaskSettings {
            hints: SpawnHints::SPAWN_LIFO,
            ..Default::default()
        };
        assert_eq!(pinned_front.add_mode(), AddMode::Lifo);
    }
}
