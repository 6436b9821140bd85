use crate::fiber::TaskHandle;
use crate::pool::worker::Worker;
use crate::sync::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Reply channel carrying task handles from wrapper tasks back to the
/// submitter: one value for a plain handle-returning submission, one per
/// worker for a fan-out.
///
/// Signaling rides on the pool's shared event so that both blocked external
/// threads and pool workers driving their own loop observe a send.
pub(crate) struct HandleReply {
    handles: Mutex<VecDeque<TaskHandle>>,
    open_senders: AtomicUsize,
    signal: Arc<Event>,
}

impl HandleReply {
    pub(crate) fn new(signal: Arc<Event>) -> Arc<Self> {
        Arc::new(Self {
            handles: Mutex::new(VecDeque::new()),
            open_senders: AtomicUsize::new(0),
            signal,
        })
    }

    pub(crate) fn sender(self: &Arc<Self>) -> HandleSender {
        self.open_senders.fetch_add(1, Ordering::SeqCst);
        HandleSender {
            reply: Arc::clone(self),
        }
    }

    /// Receive one handle.
    ///
    /// On a pool thread this drives the local worker loop while waiting, so
    /// the wrapper task can be executed by the very worker that is blocked
    /// on it. On any other thread it blocks on the pool signal.
    pub(crate) fn recv(&self) -> TaskHandle {
        if let Some(worker) = Worker::current() {
            worker.drive_until(|| self.poll())
        } else {
            let mut last = self.signal.emit_count();
            loop {
                if let Some(handle) = self.poll() {
                    return handle;
                }
                last = self.signal.wait(last);
            }
        }
    }

    // The wrapper always sends before invoking the user payload, so running
    // out of senders with no pending handle means a wrapper was destroyed
    // unexecuted. The start handshake cannot be recovered from that.
    fn poll(&self) -> Option<TaskHandle> {
        if let Some(handle) = self.handles.lock().pop_front() {
            return Some(handle);
        }

        if self.open_senders.load(Ordering::SeqCst) == 0 {
            panic!("task start handshake aborted: reply channel closed before a handle was sent");
        }

        None
    }
}

/// Sending half held by one wrapper task. Dropping it unsent counts as
/// closing the channel.
pub(crate) struct HandleSender {
    reply: Arc<HandleReply>,
}

impl HandleSender {
    pub(crate) fn send(self, handle: TaskHandle) {
        self.reply.handles.lock().push_back(handle);
        // The Drop impl below decrements the sender count and signals.
    }
}

impl Drop for HandleSender {
    fn drop(&mut self) {
        self.reply.open_senders.fetch_sub(1, Ordering::SeqCst);
        self.reply.signal.emit();
    }
}
