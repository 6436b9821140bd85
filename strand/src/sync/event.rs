use parking_lot::{Condvar, Mutex};

/// A counter-based cross-thread wake primitive.
///
/// Every emit bumps a 64-bit monotonic counter. Waiters pass in the last
/// count they observed and block until the counter moves past it, which makes
/// the wait level-triggered: an emit that lands between sampling the counter
/// and calling [`Event::wait`] is never lost.
#[derive(Debug, Default)]
pub struct Event {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the counter and wake every waiter.
    pub fn emit(&self) -> u64 {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_all();
        *count
    }

    /// Bump the counter and wake at most one waiter.
    pub fn emit_single(&self) -> u64 {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
        *count
    }

    /// Block until the counter exceeds `last_seen`, returning the new count.
    ///
    /// Returns immediately if the counter already moved past `last_seen`.
    pub fn wait(&self, last_seen: u64) -> u64 {
        let mut count = self.count.lock();
        while *count <= last_seen {
            self.cond.wait(&mut count);
        }
        *count
    }

    pub fn emit_count(&self) -> u64 {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    assert_impl_all!(Event: Send, Sync);

    #[test]
    fn test_emit_count_monotonic() {
        let event = Event::new();
        assert_eq!(event.emit_count(), 0);
        assert_eq!(event.emit(), 1);
        assert_eq!(event.emit_single(), 2);
        assert_eq!(event.emit_count(), 2);
    }

    #[test]
    fn test_wait_returns_immediately_on_stale_count() {
        let event = Event::new();
        event.emit();
        // The emit happened after `0` was observed, so the wait must not block.
        assert_eq!(event.wait(0), 1);
    }

    #[test]
    fn test_wait_blocks_until_emit() {
        let event = Arc::new(Event::new());
        let last = event.emit_count();

        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(last))
        };

        thread::sleep(Duration::from_millis(20));
        event.emit();

        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn test_emit_wakes_all_waiters() {
        let event = Arc::new(Event::new());
        let last = event.emit_count();

        let waiters = (0..4)
            .map(|_| {
                let event = Arc::clone(&event);
                thread::spawn(move || event.wait(last))
            })
            .collect::<Vec<_>>();

        thread::sleep(Duration::from_millis(20));
        event.emit();

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 1);
        }
    }
}
