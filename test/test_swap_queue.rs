use taskbox::{Link, SwapQueue};

use super::{sleep, spawn};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;

struct TestMsg {
    link: *mut TestMsg,
    tag: usize,
}

impl TestMsg {
    fn new(tag: usize) -> Box<TestMsg> {
        Box::new(TestMsg { link: ptr::null_mut(), tag })
    }
}

unsafe impl Link for TestMsg {
    fn link(ptr: *mut Self) -> *mut *mut Self {
        unsafe { ptr::addr_of_mut!((*ptr).link) }
    }
}

unsafe impl Send for TestMsg {}

#[test]
pub fn test_fifo_round_trip() {
    let q = SwapQueue::with_capacity(4);

    q.put(TestMsg::new(1));
    q.put(TestMsg::new(2));
    q.put(TestMsg::new(3));

    assert_eq!(q.get().unwrap().tag, 1);
    assert_eq!(q.get().unwrap().tag, 2);
    assert_eq!(q.get().unwrap().tag, 3);

    q.set_nonblock();
    assert!(q.get().is_none());
}

#[test]
pub fn test_concurrent_producer_preserves_order() {
    let q = SwapQueue::with_capacity(1024);
    let p = q.clone();

    let producer = spawn(move || {
        for i in 0..1000 {
            p.put(TestMsg::new(i));
        }
    });

    for i in 0..1000 {
        assert_eq!(q.get().unwrap().tag, i);
    }

    producer.join().unwrap();

    q.set_nonblock();
    assert!(q.get().is_none());
}

#[test]
pub fn test_put_blocks_at_capacity() {
    let q = SwapQueue::with_capacity(2);

    q.put(TestMsg::new(1));
    q.put(TestMsg::new(2));

    let p = q.clone();
    let through = Arc::new(AtomicBool::new(false));
    let observed = through.clone();

    let producer = spawn(move || {
        p.put(TestMsg::new(3));
        observed.store(true, Ordering::SeqCst);
    });

    sleep(100);
    assert!(!through.load(Ordering::SeqCst));

    // Freeing one slot lets the producer through
    assert_eq!(q.get().unwrap().tag, 1);
    producer.join().unwrap();
    assert!(through.load(Ordering::SeqCst));

    assert_eq!(q.get().unwrap().tag, 2);
    assert_eq!(q.get().unwrap().tag, 3);
}

#[test]
pub fn test_two_producers_conserve_messages() {
    let q = SwapQueue::with_capacity(2);

    let p1 = q.clone();
    let a = spawn(move || {
        for i in 0..100 {
            p1.put(TestMsg::new(i));
        }
    });

    let p2 = q.clone();
    let b = spawn(move || {
        for i in 1000..1100 {
            p2.put(TestMsg::new(i));
        }
    });

    let mut tags: Vec<usize> = (0..200).map(|_| q.get().unwrap().tag).collect();

    a.join().unwrap();
    b.join().unwrap();

    tags.sort();
    let expected: Vec<usize> = (0..100).chain(1000..1100).collect();
    assert_eq!(tags, expected);
}

#[test]
pub fn test_nonblock_wakes_blocked_consumer() {
    let q = SwapQueue::<TestMsg>::new();
    let c = q.clone();
    let (tx, rx) = channel();

    let consumer = spawn(move || {
        tx.send(c.get().is_none()).unwrap();
    });

    sleep(100);
    assert!(rx.try_recv().is_err());

    q.set_nonblock();
    assert!(super::recv_within(&rx, 1000));
    consumer.join().unwrap();
}

#[test]
pub fn test_nonblock_wakes_blocked_producer() {
    let q = SwapQueue::with_capacity(1);

    q.put(TestMsg::new(1));

    let p = q.clone();
    let producer = spawn(move || {
        // Blocked at capacity until the mode switch; still enqueues
        p.put(TestMsg::new(2));
    });

    sleep(100);
    q.set_nonblock();
    producer.join().unwrap();

    assert_eq!(q.get().unwrap().tag, 1);
    assert_eq!(q.get().unwrap().tag, 2);
    assert!(q.get().is_none());
}

#[test]
pub fn test_set_block_restores_waiting() {
    let q = SwapQueue::<TestMsg>::new();

    q.set_nonblock();
    assert!(q.get().is_none());

    q.set_block();

    let p = q.clone();
    let producer = spawn(move || {
        sleep(50);
        p.put(TestMsg::new(7));
    });

    assert_eq!(q.get().unwrap().tag, 7);
    producer.join().unwrap();
}

struct DropMsg {
    link: *mut DropMsg,
    drops: Arc<AtomicUsize>,
}

unsafe impl Link for DropMsg {
    fn link(ptr: *mut Self) -> *mut *mut Self {
        unsafe { std::ptr::addr_of_mut!((*ptr).link) }
    }
}

unsafe impl Send for DropMsg {}

impl Drop for DropMsg {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
pub fn test_drop_frees_queued_messages() {
    let drops = Arc::new(AtomicUsize::new(0));
    let q = SwapQueue::new();

    for _ in 0..3 {
        q.put(Box::new(DropMsg {
            link: ptr::null_mut(),
            drops: drops.clone(),
        }));
    }

    drop(q);
    assert_eq!(drops.load(Ordering::SeqCst), 3);
}
