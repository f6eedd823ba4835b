use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering::*};
use std::thread::sleep;
use std::time::Duration;

use hp_rs::*;
use stack::Stack;
use std::thread::scope;

#[test]
fn counter() {
    const THREADS: usize = 4;
    const ITER: usize = 1024 * 16;

    let count = AtomicPtr::new(Box::leak(Box::new(0usize)));
    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ITER {
                    let mut new = Box::new(0);
                    let mut hp = HazardPointer::default();
                    loop {
                        let cur_ptr = hp.protect(&count);
                        let value = unsafe { *cur_ptr };
                        *new = value + 1;
                        let new_ptr = Box::leak(new);
                        if count
                            .compare_exchange(cur_ptr, new_ptr, AcqRel, Acquire)
                            .is_ok()
                        {
                            unsafe { retire(cur_ptr) };
                            break;
                        } else {
                            new = unsafe { Box::from_raw(new_ptr) };
                        }
                    }
                }
            });
        }
    });
    let cur = count.load(Acquire);
    // exclusive access
    assert_eq!(unsafe { *cur }, THREADS * ITER);
    unsafe { retire(cur) };
}

// like `counter`, but trigger interesting interleaving using `sleep` and always call
// `do_reclamation`.
#[test]
fn counter_sleep() {
    const THREADS: usize = 4;
    const ITER: usize = 1024 * 4;

    let count = AtomicPtr::new(Box::leak(Box::new(0usize)));
    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ITER {
                    let mut new = Box::new(0);
                    let mut hp = HazardPointer::default();
                    loop {
                        let cur_ptr = {
                            let mut cur = count.load(Relaxed);
                            loop {
                                match hp.try_protect(cur, &count) {
                                    Ok(_) => break cur,
                                    Err(new) => {
                                        sleep(Duration::from_micros(1));
                                        cur = new;
                                    }
                                }
                            }
                        };
                        sleep(Duration::from_micros(1));
                        let value = unsafe { *cur_ptr };
                        *new = value + 1;
                        let new_ptr = Box::leak(new);
                        if count
                            .compare_exchange(cur_ptr, new_ptr, AcqRel, Acquire)
                            .is_ok()
                        {
                            unsafe { retire(cur_ptr) };
                            do_reclamation();
                            break;
                        } else {
                            new = unsafe { Box::from_raw(new_ptr) };
                        }
                    }
                }
            });
        }
    });
    let cur = count.load(Acquire);
    // exclusive access
    assert_eq!(unsafe { *cur }, THREADS * ITER);
    unsafe { retire(cur) };
}

#[test]
fn stack() {
    const THREADS: usize = 8;
    const ITER: usize = 1024 * 16;

    let stack = Stack::default();
    scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for i in 0..ITER {
                    stack.push(i);
                    assert!(stack.try_pop().is_some());
                    do_reclamation();
                }
            });
        }
    });
    assert!(stack.try_pop().is_none());
}

struct Link {
    next: AtomicPtr<Link>,
    value: usize,
}

fn link(value: usize, next: *mut Link) -> *mut Link {
    Box::into_raw(Box::new(Link {
        next: AtomicPtr::new(next),
        value,
    }))
}

#[test]
fn frontier_outlives_protected_victim() {
    let domain = Domain::new();
    let reader = Thread::new(&domain);
    let writer = Thread::new(&domain);

    // head -> a -> b
    let b = link(2, ptr::null_mut());
    let a = link(1, b);
    let head = AtomicPtr::new(a);

    let mut hp = HazardPointer::new(&reader);
    let a_ptr = hp.protect(&head);
    assert_eq!(a_ptr, a);

    // Unlink `a` keeping `b` as its frontier, then unlink and retire `b` as well.
    assert!(unsafe {
        writer.try_unlink(&[b], a, || {
            head.compare_exchange(a, b, AcqRel, Acquire).is_ok()
        })
    });
    assert!(unsafe {
        writer.try_unlink(&[], b, || {
            head.compare_exchange(b, ptr::null_mut(), AcqRel, Acquire)
                .is_ok()
        })
    });
    writer.do_reclamation();
    assert_eq!(domain.num_garbages(), 2);

    // The reader still holds `a` and may follow its link without validating it.
    let next = unsafe { (*a_ptr).next.load(Acquire) };
    assert_eq!(unsafe { (*next).value }, 2);

    hp.reset_protection();
    writer.do_reclamation();
    assert_eq!(domain.num_garbages(), 0);
}

#[test]
fn failed_unlink_releases_frontier() {
    let domain = Domain::new();
    let thread = Thread::new(&domain);
    let b = link(2, ptr::null_mut());
    let a = link(1, b);
    let head = AtomicPtr::new(b);

    assert!(!unsafe {
        thread.try_unlink(&[b], a, || {
            head.compare_exchange(a, b, AcqRel, Acquire).is_ok()
        })
    });
    assert_eq!(domain.num_garbages(), 0);

    unsafe {
        drop(Box::from_raw(a));
        drop(Box::from_raw(b));
    }
}

#[test]
fn exited_threads_hand_over_garbage() {
    let domain = Domain::new();
    let shared = AtomicPtr::new(Box::into_raw(Box::new(7usize)));

    let reader = Thread::new(&domain);
    let mut hp = HazardPointer::new(&reader);
    let protected = hp.protect(&shared);

    scope(|s| {
        s.spawn(|| {
            let writer = Thread::new(&domain);
            let old = shared.swap(ptr::null_mut(), AcqRel);
            unsafe { writer.retire(old) };
            writer.do_reclamation();
        });
    });
    // The writer exited while its garbage was still protected.
    assert_eq!(domain.num_garbages(), 1);
    assert_eq!(unsafe { *protected }, 7);

    hp.reset_protection();
    reader.do_reclamation();
    assert_eq!(domain.num_garbages(), 0);
}

#[test]
fn hazard_array_grows() {
    let domain = Domain::new();
    let thread = Thread::new(&domain);
    let values: Vec<_> = (0..200).map(|i| AtomicPtr::new(Box::into_raw(Box::new(i)))).collect();

    let mut hps: Vec<_> = values.iter().map(|_| HazardPointer::new(&thread)).collect();
    for (hp, value) in hps.iter_mut().zip(&values) {
        hp.protect(value);
    }
    for value in &values {
        unsafe { thread.retire(value.swap(ptr::null_mut(), AcqRel)) };
    }
    thread.do_reclamation();
    // Nothing but the replaced hazard arrays can go.
    assert!(domain.num_garbages() >= values.len());

    drop(hps);
    thread.do_reclamation();
    assert_eq!(domain.num_garbages(), 0);
}

mod stack {
    use core::mem::ManuallyDrop;
    use core::ptr;
    use core::sync::atomic::{AtomicPtr, Ordering::*};

    use hp_rs::*;

    /// Treiber's lock-free stack.
    #[derive(Debug)]
    pub struct Stack<T> {
        head: AtomicPtr<Node<T>>,
    }

    #[derive(Debug)]
    struct Node<T> {
        data: ManuallyDrop<T>,
        next: *mut Node<T>,
    }

    unsafe impl<T: Send> Send for Stack<T> {}
    unsafe impl<T: Send> Sync for Stack<T> {}

    impl<T> Default for Stack<T> {
        fn default() -> Self {
            Stack {
                head: AtomicPtr::new(ptr::null_mut()),
            }
        }
    }

    impl<T> Stack<T> {
        pub fn push(&self, t: T) {
            let new = Box::leak(Box::new(Node {
                data: ManuallyDrop::new(t),
                next: ptr::null_mut(),
            }));

            loop {
                let head = self.head.load(Relaxed);
                new.next = head;

                if self
                    .head
                    .compare_exchange(head, new, Release, Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }

        pub fn try_pop(&self) -> Option<T> {
            let mut hp = HazardPointer::default();
            loop {
                let head_ptr = hp.protect(&self.head);
                let head_ref = unsafe { head_ptr.as_ref() }?;

                if self
                    .head
                    .compare_exchange(head_ptr, head_ref.next, Acquire, Relaxed)
                    .is_ok()
                {
                    let data = unsafe { ManuallyDrop::take(&mut (*head_ptr).data) };
                    unsafe { retire(head_ptr) };
                    return Some(data);
                }
            }
        }
    }

    impl<T> Drop for Stack<T> {
        fn drop(&mut self) {
            let mut curr = *self.head.get_mut();
            while !curr.is_null() {
                let curr_ref = unsafe { Box::from_raw(curr) };
                drop(ManuallyDrop::into_inner(curr_ref.data));
                curr = curr_ref.next;
            }
        }
    }
}
