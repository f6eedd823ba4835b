use crate::ds_impl::concurrent_set::{ConcurrentSet, Key, NodeKey};

use super::pointers::{Atomic, Marks, Shared};
use core::cmp::Ordering::{Equal, Less};
use core::mem;
use std::sync::atomic::{AtomicIsize, Ordering};

use hp_rs::{Domain, HazardPointer, Thread, DEFAULT_DOMAIN};

pub struct Node {
    key: NodeKey,
    /// Flag: the successor is being removed. Mark: this node is logically deleted.
    next: Atomic<Node>,
    /// Predecessor at the time this node was flagged. Written once, before the mark.
    back_link: Atomic<Node>,
}

impl Node {
    fn new(key: NodeKey) -> Self {
        Self {
            key,
            next: Atomic::null(),
            back_link: Atomic::null(),
        }
    }
}

/// Where a search stops relative to the searched key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    /// `prev.key <= key < curr.key`: a node with `key`, if any, is `prev`.
    Landing,
    /// `prev.key < key <= curr.key`: a node with `key`, if any, is `curr`.
    Preceding,
}

impl Mode {
    /// Whether a search in this mode moves past a node with key `node_key`.
    #[inline]
    fn advances(self, node_key: NodeKey, key: Key) -> bool {
        match (self, node_key.cmp_key(key)) {
            (_, Less) => true,
            (Mode::Landing, Equal) => true,
            _ => false,
        }
    }
}

pub struct List {
    head: Shared<Node>,
    size: AtomicIsize,
}

unsafe impl Send for List {}
unsafe impl Sync for List {}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for List {
    fn drop(&mut self) {
        // Unlinked nodes belong to the retire bags. Everything else, including marked nodes that
        // nobody unlinked yet, is still reachable from the head.
        let mut curr = self.head;
        while !curr.is_null() {
            let next = unsafe { curr.deref() }.next.load(Ordering::Relaxed);
            unsafe { curr.drop_owned() };
            curr = next.unmarked();
        }
    }
}

pub struct Handle<'domain> {
    prev_h: HazardPointer<'domain>,
    curr_h: HazardPointer<'domain>,
    // protects the node a remove operation is deleting
    target_h: HazardPointer<'domain>,
    thread: Box<Thread<'domain>>,
}

impl Default for Handle<'static> {
    fn default() -> Self {
        Self::new(&DEFAULT_DOMAIN)
    }
}

impl<'domain> Handle<'domain> {
    pub fn new(domain: &'domain Domain) -> Self {
        let thread = Box::new(Thread::new(domain));
        Self {
            prev_h: HazardPointer::new(&thread),
            curr_h: HazardPointer::new(&thread),
            target_h: HazardPointer::new(&thread),
            thread,
        }
    }

    /// Frees every retired node that no thread protects anymore.
    pub fn do_reclamation(&self) {
        self.thread.do_reclamation();
    }
}

/// A (predecessor, successor) pair bracketing a key. Both are unmarked pointers, `prev` is
/// protected by `prev_h` and `curr` by `curr_h`.
struct Window {
    prev: Shared<Node>,
    curr: Shared<Node>,
}

/// Protects and returns the successor of `prev` with its marks stripped.
///
/// `prev` must be protected.
#[inline]
fn protect_next(prev: Shared<Node>, hp: &mut HazardPointer<'_>) -> Shared<Node> {
    let link = unsafe { prev.deref() }.next.as_atomic_ptr();
    let mut curr = Shared::from_raw(link.load(Ordering::Acquire)).unmarked();
    loop {
        // If `prev` is marked its `next` is frozen and the successor outlives it as part of its
        // frontier. Otherwise an unchanged link means the successor is still reachable.
        hp.protect_raw(curr.as_raw());
        let new = Shared::from_raw(link.load(Ordering::Acquire)).unmarked();
        if new == curr {
            return curr;
        }
        curr = new;
    }
}

/// Moves `prev` to its back-link target, as long as `prev` is marked. Returns the first unmarked
/// node found, protected by `prev_h`. `spare_h` ends up protecting nothing useful.
#[inline]
fn walk_back_links<'d>(
    mut prev: Shared<Node>,
    prev_h: &mut HazardPointer<'d>,
    spare_h: &mut HazardPointer<'d>,
) -> Shared<Node> {
    while unsafe { prev.deref() }.next.load(Ordering::Acquire).marks().mark() {
        // The back-link target outlives `prev`, which is still protected.
        let back = unsafe { prev.deref() }.back_link.load(Ordering::Acquire);
        spare_h.protect_raw(back.as_raw());
        HazardPointer::swap(prev_h, spare_h);
        prev = back;
    }
    prev
}

/// Finishes the removal of `del`, which is marked: swings the flagged link of `prev` past it.
///
/// Whoever swings the link retires `del`, keeping its successor and its back-link target
/// published until `del` is freed.
fn help_marked(prev: Shared<Node>, del: Shared<Node>, thread: &Thread<'_>) {
    let del_ref = unsafe { del.deref() };
    let succ = del_ref.next.load(Ordering::Acquire).unmarked();
    let back = del_ref.back_link.load(Ordering::Acquire);
    let frontier = [succ.as_raw(), back.as_raw()];
    let frontier = if back.is_null() {
        &frontier[..1]
    } else {
        &frontier[..]
    };

    let prev_ref = unsafe { prev.deref() };
    unsafe {
        thread.try_unlink(frontier, del.as_raw(), || {
            prev_ref
                .next
                .compare_exchange(
                    del.with_marks(Marks::FLAG),
                    succ,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    };
}

/// Helps the removal of `del` announced by the flag on `prev.next`: records the back-link, marks
/// `del` and unlinks it.
///
/// `prev` and `del` must be protected.
fn help_flag(prev: Shared<Node>, del: Shared<Node>, thread: &Thread<'_>) {
    let del_ref = unsafe { del.deref() };
    let _ = del_ref.back_link.compare_exchange(
        Shared::null(),
        prev,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    if !del_ref.next.load(Ordering::Acquire).marks().mark() {
        try_mark(del, thread);
    }
    help_marked(prev, del, thread);
}

/// Marks `del`, first helping the removal of its own successor if that one is flagged.
fn try_mark(del: Shared<Node>, thread: &Thread<'_>) {
    let del_ref = unsafe { del.deref() };
    let mut next_h = HazardPointer::new(thread);
    loop {
        let next = protect_next(del, &mut next_h);
        let _ = del_ref.next.compare_exchange(
            next,
            next.with_marks(Marks::MARK),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let current = del_ref.next.load(Ordering::Acquire);
        if current.marks().mark() {
            return;
        }
        if current == next.with_marks(Marks::FLAG) {
            help_flag(del, next, thread);
        }
    }
}

/// Helps the removal announced on `prev.next`, if there is one.
///
/// `prev` must be protected.
fn help_flagged_successor(prev: Shared<Node>, thread: &Thread<'_>) {
    let mut del_h = HazardPointer::new(thread);
    let del = protect_next(prev, &mut del_h);
    if unsafe { prev.deref() }.next.load(Ordering::Acquire) == del.with_marks(Marks::FLAG) {
        help_flag(prev, del, thread);
    }
}

impl List {
    /// Creates a new list.
    pub fn new() -> Self {
        let tail = Shared::from_owned(Node::new(NodeKey::PosInf));
        let head = Shared::from_owned(Node::new(NodeKey::NegInf));
        unsafe { head.deref() }.next.store(tail, Ordering::Relaxed);
        List {
            head,
            size: AtomicIsize::new(0),
        }
    }

    /// Searches from `start`, which is unmarked or protected by `prev_h`, helping every marked
    /// node it meets to get unlinked.
    fn search_from<'d>(
        &self,
        key: Key,
        start: Shared<Node>,
        mode: Mode,
        prev_h: &mut HazardPointer<'d>,
        curr_h: &mut HazardPointer<'d>,
        thread: &Thread<'_>,
    ) -> Window {
        let mut prev = start;
        let mut curr = protect_next(prev, curr_h);
        while mode.advances(unsafe { curr.deref() }.key, key) {
            loop {
                let curr_next = unsafe { curr.deref() }.next.load(Ordering::Acquire);
                if !curr_next.marks().mark() {
                    break;
                }
                let prev_next = unsafe { prev.deref() }.next.load(Ordering::Acquire);
                if prev_next.marks().mark() && prev_next.unmarked() == curr {
                    // `prev` is deleted too. Walk through, its own remover unlinks it.
                    break;
                }
                if prev_next == curr.with_marks(Marks::FLAG) {
                    help_marked(prev, curr, thread);
                }
                curr = protect_next(prev, curr_h);
            }
            if mode.advances(unsafe { curr.deref() }.key, key) {
                HazardPointer::swap(prev_h, curr_h);
                prev = curr;
                curr = protect_next(prev, curr_h);
            }
        }
        Window { prev, curr }
    }

    fn search(&self, key: Key, mode: Mode, handle: &mut Handle<'_>) -> Window {
        let Handle {
            prev_h,
            curr_h,
            thread,
            ..
        } = handle;
        self.search_from(key, self.head, mode, prev_h, curr_h, thread)
    }

    /// Flags `prev.next`, which pointed to `target`. Returns the predecessor of `target` if it is
    /// still flagged for `target`, and whether this call is the one that flagged it.
    ///
    /// `target` must be protected by a hazard pointer other than `prev_h` and `curr_h`.
    fn try_flag<'d>(
        &self,
        mut prev: Shared<Node>,
        target: Shared<Node>,
        prev_h: &mut HazardPointer<'d>,
        curr_h: &mut HazardPointer<'d>,
        thread: &Thread<'_>,
    ) -> (Option<Shared<Node>>, bool) {
        let flagged = target.with_marks(Marks::FLAG);
        let target_key = match unsafe { target.deref() }.key {
            NodeKey::Fin(k) => k,
            _ => unreachable!("sentinels are never removed"),
        };
        loop {
            let prev_ref = unsafe { prev.deref() };
            if prev_ref.next.load(Ordering::Acquire) == flagged {
                return (Some(prev), false);
            }
            match prev_ref
                .next
                .compare_exchange(target, flagged, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return (Some(prev), true),
                Err(current) if current == flagged => return (Some(prev), false),
                Err(_) => {}
            }

            prev = walk_back_links(prev, prev_h, curr_h);
            let window = self.search_from(target_key, prev, Mode::Preceding, prev_h, curr_h, thread);
            if window.curr != target {
                return (None, false);
            }
            prev = window.prev;
        }
    }

    /// Returns `true` if `key` is in the list.
    pub fn contains(&self, key: Key, handle: &mut Handle<'_>) -> bool {
        let Window { prev, .. } = self.search(key, Mode::Landing, handle);
        is_live_with_key(prev, key)
    }

    /// Inserts `key`. Returns `false` if it was already present.
    pub fn insert(&self, key: Key, handle: &mut Handle<'_>) -> bool {
        let Handle {
            prev_h,
            curr_h,
            thread,
            ..
        } = handle;
        let window = self.search_from(key, self.head, Mode::Landing, prev_h, curr_h, thread);
        self.insert_at(key, window, prev_h, curr_h, thread)
    }

    /// Links a node with `key` into `window`, a `Mode::Landing` window for `key` protected by
    /// `prev_h` and `curr_h`. A stale window is recovered through back-links and re-searches.
    fn insert_at<'d>(
        &self,
        key: Key,
        window: Window,
        prev_h: &mut HazardPointer<'d>,
        curr_h: &mut HazardPointer<'d>,
        thread: &Thread<'_>,
    ) -> bool {
        let Window { mut prev, mut curr } = window;
        if is_live_with_key(prev, key) {
            return false;
        }

        let new = Shared::from_owned(Node::new(NodeKey::Fin(key)));
        let new_ref = unsafe { new.deref() };
        loop {
            let prev_ref = unsafe { prev.deref() };
            let prev_next = prev_ref.next.load(Ordering::Acquire);
            if prev_next.marks().flag() {
                help_flagged_successor(prev, thread);
            } else {
                new_ref.next.store(curr, Ordering::Relaxed);
                match prev_ref
                    .next
                    .compare_exchange(curr, new, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        self.size.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                    Err(current) => {
                        if current.marks().flag() {
                            help_flagged_successor(prev, thread);
                        }
                        prev = walk_back_links(prev, prev_h, curr_h);
                    }
                }
            }

            let window = self.search_from(key, prev, Mode::Landing, prev_h, curr_h, thread);
            prev = window.prev;
            curr = window.curr;
            if is_live_with_key(prev, key) {
                unsafe { new.drop_owned() };
                return false;
            }
        }
    }

    /// Removes `key`. Returns `false` if it was absent or another remove of it won.
    pub fn remove(&self, key: Key, handle: &mut Handle<'_>) -> bool {
        let Handle {
            prev_h,
            curr_h,
            target_h,
            thread,
        } = handle;
        let Window { prev, curr: del } =
            self.search_from(key, self.head, Mode::Preceding, prev_h, curr_h, thread);
        if unsafe { del.deref() }.key != NodeKey::Fin(key) {
            return false;
        }

        HazardPointer::swap(curr_h, target_h);
        let (prev, flagged) = self.try_flag(prev, del, prev_h, curr_h, thread);
        if let Some(prev) = prev {
            help_flag(prev, del, thread);
        }
        if !flagged {
            return false;
        }
        self.size.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Number of keys, as counted by completed inserts and removes. Never negative.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed).max(0) as usize
    }

    /// Walks the list and checks its structure: keys strictly increase, no reachable node is
    /// marked or flagged, and the reachable keys match `size()`. Returns the keys.
    ///
    /// Only meaningful while no operation is in flight.
    pub fn check_invariants(&self) -> Vec<Key> {
        let mut keys = Vec::new();
        let mut last = NodeKey::NegInf;
        let mut curr = unsafe { self.head.deref() }.next.load(Ordering::Acquire);
        loop {
            assert!(curr.marks().is_empty(), "reachable link {:?} is tagged", curr);
            let node = unsafe { curr.deref() };
            assert!(last < node.key, "keys out of order: {:?} then {:?}", last, node.key);
            last = node.key;
            match node.key {
                NodeKey::Fin(k) => keys.push(k),
                NodeKey::PosInf => break,
                NodeKey::NegInf => unreachable!("head sentinel appears twice"),
            }
            curr = node.next.load(Ordering::Acquire);
        }
        assert!(node_is_tail(curr), "tail sentinel must end the list");
        assert_eq!(keys.len(), self.size());
        keys
    }
}

#[inline]
fn node_is_tail(node: Shared<Node>) -> bool {
    let node = unsafe { node.deref() };
    node.key == NodeKey::PosInf && node.next.load(Ordering::Relaxed).is_null()
}

/// Whether `prev` holds `key` and is not logically deleted.
#[inline]
fn is_live_with_key(prev: Shared<Node>, key: Key) -> bool {
    let prev_ref = unsafe { prev.deref() };
    prev_ref.key == NodeKey::Fin(key) && !prev_ref.next.load(Ordering::Acquire).marks().mark()
}

/// The lock-free list with back-links, flags and marks.
pub struct FRList {
    inner: List,
}

impl FRList {
    /// Removes the structure, freeing every node still in it.
    pub fn destroy(self) {
        mem::drop(self)
    }

    pub fn check_invariants(&self) -> Vec<Key> {
        self.inner.check_invariants()
    }
}

impl ConcurrentSet for FRList {
    type Handle<'domain> = Handle<'domain>;

    fn new() -> Self {
        FRList { inner: List::new() }
    }

    fn handle() -> Self::Handle<'static> {
        Handle::default()
    }

    #[inline(always)]
    fn contains(&self, handle: &mut Self::Handle<'_>, key: Key) -> bool {
        self.inner.contains(key, handle)
    }

    #[inline(always)]
    fn insert(&self, handle: &mut Self::Handle<'_>, key: Key) -> bool {
        self.inner.insert(key, handle)
    }

    #[inline(always)]
    fn remove(&self, handle: &mut Self::Handle<'_>, key: Key) -> bool {
        self.inner.remove(key, handle)
    }

    #[inline(always)]
    fn size(&self) -> usize {
        self.inner.size()
    }
}
