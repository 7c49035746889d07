use std::cell::UnsafeCell;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex};

/// A message that carries its own queue linkage.
///
/// The queue never allocates nodes of its own; it threads messages together
/// through a pointer-sized slot embedded in each message.
///
/// # Safety
///
/// `link` must return the address of a `*mut Self` slot owned by the message.
/// The slot must stay valid for the message's lifetime, and the implementor
/// must not read or write it while the message is enqueued.
pub unsafe trait Link {
    fn link(ptr: *mut Self) -> *mut *mut Self;
}

/// A FIFO queue in which messages are threaded through their own link slots.
///
/// The implementation keeps two singly-linked lists: producers append to one
/// under the producer lock while the consumer drains the other under the
/// consumer lock. When the consumer's list runs dry it adopts the producer's
/// list wholesale, so steady-state put and get never contend on the same
/// lock.
pub struct SwapQueue<T: Link> {
    inner: Arc<Inner<T>>,
}

impl<T: Link> SwapQueue<T> {
    /// Creates an unbounded queue.
    pub fn new() -> SwapQueue<T> {
        SwapQueue::with_capacity(0)
    }

    /// Creates a queue holding at most `capacity` pending messages.
    ///
    /// A capacity of 0 means no bound: `put` never waits for space.
    pub fn with_capacity(capacity: usize) -> SwapQueue<T> {
        let inner = Arc::new(Inner {
            capacity,
            head1: UnsafeCell::new(ptr::null_mut()),
            head2: UnsafeCell::new(ptr::null_mut()),
            prod: Mutex::new(Producer {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
                cnt: 0,
                nonblock: false,
            }),
            cons: Mutex::new(Consumer {
                head: ptr::null_mut(),
            }),
            data_avail: Condvar::new(),
            space_avail: Condvar::new(),
        });

        // The sentinel slots live inside the inner struct, so the list
        // pointers can only be filled in once it has its final heap address.
        {
            let mut prod = inner.prod.lock().unwrap();
            prod.head = inner.head2.get();
            prod.tail = inner.head2.get();
        }
        {
            let mut cons = inner.cons.lock().unwrap();
            cons.head = inner.head1.get();
        }

        SwapQueue { inner }
    }

    /// Appends a message, waiting for space if the queue is bounded, full,
    /// and in blocking mode.
    pub fn put(&self, msg: Box<T>) {
        self.inner.put(msg);
    }

    /// Takes the next message in FIFO order.
    ///
    /// Blocks while the queue is empty and in blocking mode. Returns `None`
    /// only once the queue is drained in non-blocking mode.
    pub fn get(&self) -> Option<Box<T>> {
        self.inner.get()
    }

    /// Switches to non-blocking mode, waking every blocked put and get.
    pub fn set_nonblock(&self) {
        self.inner.set_nonblock();
    }

    /// Switches back to blocking mode.
    pub fn set_block(&self) {
        self.inner.set_block();
    }
}

impl<T: Link> Clone for SwapQueue<T> {
    fn clone(&self) -> SwapQueue<T> {
        SwapQueue { inner: self.inner.clone() }
    }
}

//  Both lists are chains of link slots: each slot holds the next message,
//  whose embedded slot holds the one after it. `tail` is always the address
//  of the slot to overwrite on append, and the two sentinel slots `head1`
//  and `head2` give each list a terminating slot that lives in the queue
//  itself, so `tail` is never null even when a list is empty.
//
//  The consumer owns whichever slot `cons.head` points at and pops messages
//  out of it without touching the producer lock. Only when that slot is
//  empty does it take the producer lock, adopt the producer's entire list,
//  and hand its own drained slot back as the producer's new storage. The
//  condition variables both pair with the producer lock: producers wait for
//  space there, and the (single, serialized) swapping consumer waits for
//  data there.
struct Inner<T: Link> {
    // 0 means unbounded
    capacity: usize,

    // Sentinel link slots; initial storage for the two lists
    head1: UnsafeCell<*mut T>,
    head2: UnsafeCell<*mut T>,

    // Lock held by put
    prod: Mutex<Producer<T>>,

    // Lock held by get; serializes consumers
    cons: Mutex<Consumer<T>>,

    // Wait queue for a consumer swapping while empty
    data_avail: Condvar,

    // Wait queue for producers blocked at capacity
    space_avail: Condvar,
}

struct Producer<T> {
    head: *mut *mut T,
    tail: *mut *mut T,
    cnt: usize,
    nonblock: bool,
}

struct Consumer<T> {
    head: *mut *mut T,
}

impl<T: Link> Inner<T> {
    fn put(&self, msg: Box<T>) {
        let msg = Box::into_raw(msg);

        unsafe {
            *T::link(msg) = ptr::null_mut();
        }

        let mut prod = self.prod.lock().unwrap();

        if self.capacity != 0 {
            while prod.cnt >= self.capacity && !prod.nonblock {
                prod = self.space_avail.wait(prod).unwrap();
            }
        }

        unsafe {
            *prod.tail = msg;
            prod.tail = T::link(msg);
        }

        prod.cnt += 1;

        drop(prod);

        self.data_avail.notify_one();
    }

    fn get(&self) -> Option<Box<T>> {
        let mut cons = self.cons.lock().unwrap();

        unsafe {
            if !(*cons.head).is_null() || self.swap(&mut cons) > 0 {
                let msg = *cons.head;

                // Detach by copying the message's next-link into the slot
                *cons.head = *T::link(msg);

                drop(cons);

                Some(Box::from_raw(msg))
            } else {
                None
            }
        }
    }

    // Adopts the producer list as the new consumer list and resets the
    // producer list onto the consumer's drained slot. Returns the number of
    // messages adopted; 0 is only possible in non-blocking mode.
    //
    // Called with the consumer lock held; this is the one place both locks
    // are held at once, and always in consumer-then-producer order.
    fn swap(&self, cons: &mut Consumer<T>) -> usize {
        let free_head = cons.head;

        let mut prod = self.prod.lock().unwrap();

        // Producers only ever write through `tail`, so the head slot is
        // stable from here until the reset below.
        cons.head = prod.head;

        while prod.cnt == 0 && !prod.nonblock {
            prod = self.data_avail.wait(prod).unwrap();
        }

        let cnt = prod.cnt;

        if self.capacity != 0 && cnt >= self.capacity {
            self.space_avail.notify_all();
        }

        prod.head = free_head;
        prod.tail = free_head;
        prod.cnt = 0;

        cnt
    }

    fn set_nonblock(&self) {
        let mut prod = self.prod.lock().unwrap();
        prod.nonblock = true;
        drop(prod);

        self.data_avail.notify_all();
        self.space_avail.notify_all();
    }

    fn set_block(&self) {
        self.prod.lock().unwrap().nonblock = false;
    }
}

impl<T: Link> Drop for Inner<T> {
    fn drop(&mut self) {
        // Anything still queued is owned by the queue at this point
        self.set_nonblock();
        while let Some(msg) = self.get() {
            drop(msg);
        }
    }
}

unsafe impl<T: Link + Send> Send for Inner<T> {}
unsafe impl<T: Link + Send> Sync for Inner<T> {}
