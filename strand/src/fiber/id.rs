use std::cell::Cell;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque identity of a running task, produced when the task's fiber is
/// created on its worker.
///
/// Handles are unique for the lifetime of the process and are never the
/// all-zero value, so `Option<TaskHandle>` is pointer-width free.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskHandle(NonZeroU64);

impl TaskHandle {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety margin rather than safety: even at a billion tasks per
        // second the counter takes centuries to wrap.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task handle: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskHandle>> = const { Cell::new(None) };
}

/// Returns the handle of the task currently executing on this thread, or
/// `None` when called outside of a pool task.
pub fn current_task() -> Option<TaskHandle> {
    CURRENT_TASK.get()
}

/// Sets the current task handle for the duration of one fiber poll and
/// restores the previous value on drop, including on unwind.
pub(crate) struct CurrentTaskGuard {
    prev: Option<TaskHandle>,
}

impl CurrentTaskGuard {
    pub(crate) fn enter(handle: TaskHandle) -> Self {
        Self {
            prev: CURRENT_TASK.replace(Some(handle)),
        }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.set(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_handles_are_unique() {
        let n = 64;
        let mut seen = HashSet::with_capacity(n);

        for _ in 0..n {
            assert!(seen.insert(TaskHandle::next()));
        }
    }

    #[test]
    fn test_current_task_guard_nests_and_restores() {
        assert_eq!(current_task(), None);

        let outer = TaskHandle::next();
        let inner = TaskHandle::next();

        {
            let _outer_guard = CurrentTaskGuard::enter(outer);
            assert_eq!(current_task(), Some(outer));

            {
                let _inner_guard = CurrentTaskGuard::enter(inner);
                assert_eq!(current_task(), Some(inner));
            }

            assert_eq!(current_task(), Some(outer));
        }

        assert_eq!(current_task(), None);
    }
}
