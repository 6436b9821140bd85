use crate::pool::capsule::TaskCapsule;

const INITIAL_CAPACITY: usize = 16;

/// FIFO of task capsules over a growable ring buffer.
///
/// Not internally synchronized: every instance (the pool-wide shared queue
/// and each worker's private queue) is guarded by the pool monitor, so the
/// queue itself only has to be correct single-threaded.
pub(crate) struct TaskQueue {
    buf: Box<[Option<TaskCapsule>]>,
    head: usize,
    len: usize,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            buf: Self::alloc(INITIAL_CAPACITY),
            head: 0,
            len: 0,
        }
    }

    /// Append one capsule, growing the ring if it is full.
    pub(crate) fn put(&mut self, capsule: TaskCapsule) {
        if self.len == self.buf.len() {
            self.grow();
        }

        let idx = (self.head + self.len) % self.buf.len();
        self.buf[idx] = Some(capsule);
        self.len += 1;
    }

    /// Pop the front capsule, if any.
    pub(crate) fn consume(&mut self) -> Option<TaskCapsule> {
        if self.len == 0 {
            return None;
        }

        let capsule = self.buf[self.head].take();
        debug_assert!(capsule.is_some(), "occupied slot below queue length");

        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        capsule
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    // Sub-doubling growth keeps the worst-case overshoot bounded when bursts
    // are rare while still amortizing `put` to O(1).
    fn grow(&mut self) {
        let old_cap = self.buf.len();
        let new_cap = std::cmp::max(INITIAL_CAPACITY, old_cap * 3 / 2);

        let mut new_buf = Self::alloc(new_cap);
        for i in 0..self.len {
            new_buf[i] = self.buf[(self.head + i) % old_cap].take();
        }

        self.buf = new_buf;
        self.head = 0;
    }

    fn alloc(capacity: usize) -> Box<[Option<TaskCapsule>]> {
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        buf.into_boxed_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskSettings;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_capsule(counter: &Arc<AtomicUsize>, value: usize) -> TaskCapsule {
        let counter = Arc::clone(counter);
        TaskCapsule::new(TaskSettings::default(), move || {
            counter.store(value, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_consume_empty_returns_none() {
        let mut queue = TaskQueue::new();
        assert!(queue.is_empty());
        assert!(queue.consume().is_none());
    }

    #[test]
    fn test_fifo_order_preserved_across_growth() {
        let counter = Arc::new(AtomicUsize::new(usize::MAX));
        let mut queue = TaskQueue::new();

        // Interleave a consume so the ring wraps before it grows.
        queue.put(counting_capsule(&counter, 0));
        queue.consume().unwrap().invoke();
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        let n = 100;
        for i in 1..=n {
            queue.put(counting_capsule(&counter, i));
        }
        assert_eq!(queue.len(), n);
        assert!(queue.capacity() > INITIAL_CAPACITY);

        for i in 1..=n {
            queue.consume().unwrap().invoke();
            assert_eq!(counter.load(Ordering::Relaxed), i);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_growth_policy() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut queue = TaskQueue::new();
        assert_eq!(queue.capacity(), 16);

        for _ in 0..17 {
            queue.put(counting_capsule(&counter, 0));
        }
        assert_eq!(queue.capacity(), 24);

        for _ in 17..25 {
            queue.put(counting_capsule(&counter, 0));
        }
        assert_eq!(queue.capacity(), 36);
    }

    #[test]
    fn test_drop_releases_pending_capsules() {
        let payload = Arc::new(());
        let mut queue = TaskQueue::new();

        for _ in 0..5 {
            let captured = Arc::clone(&payload);
            queue.put(TaskCapsule::new(TaskSettings::default(), move || {
                drop(captured);
            }));
        }

        assert_eq!(Arc::strong_count(&payload), 6);
        drop(queue);
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}
