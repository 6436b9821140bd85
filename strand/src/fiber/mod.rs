//! Cooperative fibers: one single-threaded scheduler per pool worker.
//!
//! A fiber is a boxed future owned by its home worker. Fibers never migrate
//! between workers; waking one from another thread re-queues it at home and
//! signals the pool event so the home worker leaves its idle wait.

mod id;
pub use id::{TaskHandle, current_task};

pub(crate) mod task;
pub(crate) use task::Fiber;
