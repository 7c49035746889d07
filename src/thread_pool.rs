use std::cell::Cell;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::run::{Run, Task, TaskBox};
use crate::swap_queue::{Link, SwapQueue};

/// A fixed-size pool of worker threads fed by a [`SwapQueue`].
///
/// The queue doubles as the pool's wait primitive: idle workers block in
/// `get`, and shutdown is signaled by switching the queue into its
/// non-blocking drain mode. Shutdown may be requested from an outside thread
/// or from a task running inside the pool; both paths are free of deadlocks,
/// and the pool's memory outlives any worker still standing on it.
///
/// Handles are cheap to clone and share one pool. [`ThreadPool::shutdown`]
/// consumes a handle; dropping every handle without shutting down leaves the
/// workers blocked on the queue forever.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: SwapQueue<TaskEntry>,
    stack_size: usize,
    state: Mutex<PoolState>,
    term: Condvar,
}

struct PoolState {
    // Live worker count
    nthreads: usize,

    // The previously-exited worker, reaped by the next exiter (or by the
    // destroyer, for the final one)
    last_exit: Option<JoinHandle<()>>,

    // True only while shutdown is in progress; implies the queue is in
    // non-blocking mode
    terminating: bool,
}

// One queue traversal per entry: allocated at schedule, freed by the worker
// (or the shutdown drain) that takes it.
struct TaskEntry {
    link: *mut TaskEntry,
    task: Box<dyn TaskBox>,
}

unsafe impl Link for TaskEntry {
    fn link(ptr: *mut Self) -> *mut *mut Self {
        unsafe { ptr::addr_of_mut!((*ptr).link) }
    }
}

// The link slot is only touched by the queue while the entry is in flight
unsafe impl Send for TaskEntry {}

thread_local! {
    // Address of the pool this thread works for, 0 otherwise
    static CURRENT_POOL: Cell<usize> = Cell::new(0);
}

impl ThreadPool {
    /// Creates a pool of `nthreads` workers with the platform's default
    /// stack size.
    pub fn new(nthreads: usize) -> io::Result<ThreadPool> {
        ThreadPool::with_stack_size(nthreads, 0)
    }

    /// Creates a pool of `nthreads` workers, each with a stack of
    /// `stack_size` bytes. A stack size of 0 means the platform default.
    ///
    /// If any worker fails to spawn, the ones already running are torn down
    /// and joined before the error is returned.
    pub fn with_stack_size(nthreads: usize, stack_size: usize) -> io::Result<ThreadPool> {
        let pool = ThreadPool {
            inner: Arc::new(PoolInner {
                queue: SwapQueue::new(),
                stack_size,
                state: Mutex::new(PoolState {
                    nthreads: 0,
                    last_exit: None,
                    terminating: false,
                }),
                term: Condvar::new(),
            }),
        };

        {
            let mut state = pool.inner.state.lock().unwrap();

            for _ in 0..nthreads {
                if let Err(e) = spawn_worker(&pool.inner, &mut state) {
                    drop(state);
                    pool.terminate(false);
                    return Err(e);
                }
            }
        }

        debug!("created pool with {} workers", nthreads);
        Ok(pool)
    }

    /// Queues a task for execution on one of the workers.
    ///
    /// Never blocks; the pool's queue is unbounded. Tasks scheduled from a
    /// single thread run in FIFO order relative to each other.
    pub fn schedule<T: Task + Send + 'static>(&self, task: T) {
        let entry = Box::new(TaskEntry {
            link: ptr::null_mut(),
            task: Box::new(task),
        });

        self.inner.queue.put(entry);
    }

    /// Adds one worker to the pool.
    ///
    /// Must not be called concurrently with [`ThreadPool::shutdown`].
    pub fn increase(&self) -> io::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        spawn_worker(&self.inner, &mut state)?;
        debug!("pool grew to {} workers", state.nthreads);
        Ok(())
    }

    /// Returns true iff the calling thread is a worker of this pool.
    pub fn in_pool(&self) -> bool {
        CURRENT_POOL.with(|c| c.get()) == Arc::as_ptr(&self.inner) as usize
    }

    /// Shuts the pool down, dropping any tasks still queued.
    pub fn shutdown(self) {
        self.shutdown_with(drop);
    }

    /// Shuts the pool down, handing each task still queued to `pending`
    /// exactly once.
    ///
    /// Workers finish the task they are on, then exit; every queued task is
    /// either executed by a worker or passed to `pending`, never both. All
    /// workers are joined before this returns, except the calling one when
    /// shutdown is requested from inside a task: that worker is detached,
    /// keeps running the current task body after this returns, and releases
    /// the pool when it exits.
    pub fn shutdown_with<F: FnMut(Box<dyn TaskBox>)>(self, mut pending: F) {
        let in_pool = self.in_pool();

        debug!("shutting down pool (in_pool: {})", in_pool);
        self.terminate(in_pool);

        while let Some(entry) = self.inner.queue.get() {
            pending(entry.task);
        }
    }

    // Stops and reaps the workers. On return, every worker other than an
    // in-pool caller has exited and been joined.
    fn terminate(&self, in_pool: bool) {
        let mut state = self.inner.state.lock().unwrap();

        self.inner.queue.set_nonblock();
        state.terminating = true;

        if in_pool {
            // The calling worker cannot join itself; account for it here and
            // let it leave the loop detached.
            debug_assert!(state.nthreads > 0);
            state.nthreads -= 1;
        }

        while state.nthreads > 0 {
            state = self.inner.term.wait(state).unwrap();
        }

        let last = state.last_exit.take();
        drop(state);

        if let Some(last) = last {
            let _ = last.join();
        }
    }
}

impl Clone for ThreadPool {
    fn clone(&self) -> ThreadPool {
        ThreadPool { inner: self.inner.clone() }
    }
}

impl<T: Task + Send + 'static> Run<T> for ThreadPool {
    fn run(&self, task: T) {
        self.schedule(task);
    }
}

// Spawns one worker and bumps the live count. The caller holds the state
// lock, so the count is already up to date by the time the new worker gets
// past its first look at the pool state.
fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) -> io::Result<()> {
    let mut builder = thread::Builder::new();

    if inner.stack_size != 0 {
        builder = builder.stack_size(inner.stack_size);
    }

    let arc = inner.clone();
    let (handle_tx, handle_rx) = mpsc::channel();

    let handle = builder.spawn(move || worker(arc, handle_rx))?;

    // The worker reclaims its own handle at exit and leaves it in the
    // last-exit slot for the next exiter to join.
    let _ = handle_tx.send(handle);
    state.nthreads += 1;

    Ok(())
}

fn worker(inner: Arc<PoolInner>, handle_rx: Receiver<JoinHandle<()>>) {
    CURRENT_POOL.with(|c| c.set(Arc::as_ptr(&inner) as usize));
    trace!("worker started");

    loop {
        if inner.state.lock().unwrap().terminating {
            break;
        }

        let entry = match inner.queue.get() {
            Some(entry) => entry,
            None => break,
        };

        // Free the entry before running; the task may outlive any interest
        // in the queue, including by destroying the pool.
        let task = entry.task;

        if panic::catch_unwind(AssertUnwindSafe(|| task.run_box())).is_err() {
            warn!("task panicked; worker continues");
        }

        // A count of zero here means the task shut the pool down from inside
        // and this is the last worker: it was already detached and accounted
        // for, so it must leave without the exit protocol.
        if inner.state.lock().unwrap().nthreads == 0 {
            CURRENT_POOL.with(|c| c.set(0));
            trace!("worker exiting after in-pool shutdown");
            return;
        }
    }

    CURRENT_POOL.with(|c| c.set(0));
    exit(inner, handle_rx);
}

// Each exiting worker takes responsibility for joining the previous exiter,
// so every worker gets joined without the destroyer tracking their handles.
fn exit(inner: Arc<PoolInner>, handle_rx: Receiver<JoinHandle<()>>) {
    // Deposited by the spawner right after spawn returned
    let mine = handle_rx.recv().ok();

    let prev = {
        let mut state = inner.state.lock().unwrap();
        let prev = mem::replace(&mut state.last_exit, mine);

        state.nthreads -= 1;
        if state.nthreads == 0 {
            inner.term.notify_all();
        }

        prev
    };

    trace!("worker exiting");

    if let Some(prev) = prev {
        let _ = prev.join();
    }
}
