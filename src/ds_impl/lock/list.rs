use crate::ds_impl::concurrent_set::{ConcurrentSet, Key, NodeKey};

use core::cell::UnsafeCell;
use core::cmp::Ordering::{Equal, Less};
use core::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

struct Node {
    key: NodeKey,
    lock: RawMutex,
    /// Guarded by `lock`.
    next: UnsafeCell<*mut Node>,
}

impl Node {
    fn new(key: NodeKey, next: *mut Node) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            lock: RawMutex::INIT,
            next: UnsafeCell::new(next),
        }))
    }
}

/// Sorted list with one lock per node, traversed hand over hand.
pub struct LockList {
    head: *mut Node,
    /// Only updated under the locks of the window.
    size: AtomicUsize,
}

unsafe impl Send for LockList {}
unsafe impl Sync for LockList {}

/// Two consecutive nodes, both locked by the current thread.
struct Window {
    prev: *mut Node,
    curr: *mut Node,
}

impl Window {
    fn unlock(self) {
        unsafe {
            (*self.curr).lock.unlock();
            (*self.prev).lock.unlock();
        }
    }
}

impl LockList {
    pub fn new() -> Self {
        let tail = Node::new(NodeKey::PosInf, ptr::null_mut());
        let head = Node::new(NodeKey::NegInf, tail);
        Self {
            head,
            size: AtomicUsize::new(0),
        }
    }

    /// Locks and returns the window with `prev.key < key <= curr.key`.
    fn find(&self, key: Key) -> Window {
        unsafe {
            let mut prev = self.head;
            (*prev).lock.lock();
            let mut curr = *(*prev).next.get();
            (*curr).lock.lock();
            while (*curr).key.cmp_key(key) == Less {
                (*prev).lock.unlock();
                prev = curr;
                curr = *(*prev).next.get();
                (*curr).lock.lock();
            }
            Window { prev, curr }
        }
    }

    pub fn contains(&self, key: Key) -> bool {
        let window = self.find(key);
        let found = unsafe { (*window.curr).key.cmp_key(key) } == Equal;
        window.unlock();
        found
    }

    pub fn insert(&self, key: Key) -> bool {
        let window = self.find(key);
        let inserted = unsafe {
            if (*window.curr).key.cmp_key(key) == Equal {
                false
            } else {
                let new = Node::new(NodeKey::Fin(key), window.curr);
                *(*window.prev).next.get() = new;
                self.size.fetch_add(1, Ordering::Relaxed);
                true
            }
        };
        window.unlock();
        inserted
    }

    pub fn remove(&self, key: Key) -> bool {
        let Window { prev, curr } = self.find(key);
        unsafe {
            if (*curr).key.cmp_key(key) != Equal {
                Window { prev, curr }.unlock();
                return false;
            }
            // Nobody else can reach `curr`: getting to it requires the lock of `prev`.
            *(*prev).next.get() = *(*curr).next.get();
            self.size.fetch_sub(1, Ordering::Relaxed);
            (*curr).lock.unlock();
            drop(Box::from_raw(curr));
            (*prev).lock.unlock();
        }
        true
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

impl Default for LockList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockList {
    fn drop(&mut self) {
        let mut curr = self.head;
        while !curr.is_null() {
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next.into_inner();
        }
    }
}

impl ConcurrentSet for LockList {
    type Handle<'domain> = ();

    fn new() -> Self {
        LockList::new()
    }

    fn handle() -> Self::Handle<'static> {}

    #[inline(always)]
    fn contains(&self, _handle: &mut Self::Handle<'_>, key: Key) -> bool {
        self.contains(key)
    }

    #[inline(always)]
    fn insert(&self, _handle: &mut Self::Handle<'_>, key: Key) -> bool {
        self.insert(key)
    }

    #[inline(always)]
    fn remove(&self, _handle: &mut Self::Handle<'_>, key: Key) -> bool {
        self.remove(key)
    }

    #[inline(always)]
    fn size(&self) -> usize {
        self.size()
    }
}
