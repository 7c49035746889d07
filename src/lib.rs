//! Concurrency utilities for queueing work and running it across a set of
//! threads.
//!
//! The building blocks are [`SwapQueue`], a blocking FIFO that keeps producer
//! and consumer contention on separate locks and hands whole batches from one
//! side to the other, and [`ThreadPool`], a fixed-size worker pool that uses
//! the queue both for dispatch and as its shutdown signal.
//!
//! ```
//! use taskbox::{Task, ThreadPool};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let pool = ThreadPool::new(2).unwrap();
//! let done = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..8 {
//!     let done = done.clone();
//!     pool.schedule(move || { done.fetch_add(1, Ordering::SeqCst); });
//! }
//!
//! // Tasks still queued at shutdown are handed back; run them in place.
//! pool.shutdown_with(|task| task.run());
//! assert_eq!(done.load(Ordering::SeqCst), 8);
//! ```

pub use crate::run::{Run, Task, TaskBox};
pub use crate::swap_queue::{Link, SwapQueue};
pub use crate::thread_pool::ThreadPool;

mod run;
mod swap_queue;
mod thread_pool;
