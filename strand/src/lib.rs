//! # strand
//!
//! A fiber-based task pool: a fixed set of OS worker threads, each hosting a
//! cooperative fiber scheduler, fed through a pool-wide shared queue plus a
//! targeted private queue per worker.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let pool = strand::TaskPool::new(4).unwrap();
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..100 {
//!     let counter = Arc::clone(&counter);
//!     pool.run(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     });
//! }
//!
//! pool.join();
//! assert_eq!(counter.load(Ordering::Relaxed), 100);
//! ```

pub mod fiber;
pub use fiber::{TaskHandle, current_task};

pub mod pool;
pub use pool::{Builder, SpawnHints, TaskPool, TaskSettings};

pub mod stream;
pub use stream::{PIPE_ALL, PipeMode, pipe};

pub mod sync;
pub use sync::Event;

pub(crate) mod utils;
